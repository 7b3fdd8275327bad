//! Transport layer for the schema broker.

pub mod http;

pub use http::{HttpTransport, router};

use crate::error::BrokerResult;
use std::future::Future;

/// A front end that serves requests until shutdown.
pub trait Transport: Send + Sync {
    /// Start the transport and block until it is shut down.
    fn run(&self) -> impl Future<Output = BrokerResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}
