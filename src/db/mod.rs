//! Database layer.
//!
//! - Credential store over the primary metadata database
//! - Downstream pool construction and the keyed pool registry
//! - Catalog introspection of downstream PostgreSQL databases

pub mod connector;
pub mod registry;
pub mod schema;
pub mod store;

pub use connector::{PgConnector, PoolConnector, TargetPool};
pub use registry::{PoolEntry, PoolLease, PoolProvider, PoolRegistry, RegistryStats};
pub use schema::SchemaInspector;
pub use store::{CredentialStore, MetaPool};
