//! Schema broker library.
//!
//! Stores connection credentials for downstream PostgreSQL databases and
//! serves their live schema over HTTP, reusing one bounded connection pool
//! per distinct target.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod secret;
pub mod service;
pub mod transport;

pub use config::Config;
pub use error::{BrokerError, BrokerResult};
pub use service::SchemaService;
