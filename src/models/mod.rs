//! Data models for the schema broker.
//!
//! This module re-exports all model types used throughout the application.

pub mod connection;
pub mod credential;
pub mod schema;

// Re-export commonly used types
pub use connection::{ConnectTarget, ConnectionSignature};
pub use credential::{CredentialRecord, CredentialsAdded, RegisterCredentials};
pub use schema::{
    ColumnEntry, ColumnRow, SchemaResult, SchemaTables, is_system_schema,
};
