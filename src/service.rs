//! Request orchestration.
//!
//! `database_id -> CredentialRecord -> ConnectTarget -> PoolLease -> SchemaResult`.
//! Each step fails with its own [`BrokerError`] kind; nothing here maps to
//! transport status codes.

use crate::db::{
    CredentialStore, PgConnector, PoolProvider, PoolRegistry, RegistryStats, SchemaInspector,
};
use crate::error::{BrokerError, BrokerResult};
use crate::models::{CredentialsAdded, RegisterCredentials, SchemaResult};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info};

/// Long-lived application context shared by all request handlers.
pub struct SchemaService<P = PoolRegistry<PgConnector>> {
    store: CredentialStore,
    pools: Arc<P>,
    inspector: SchemaInspector,
}

impl<P> Clone for SchemaService<P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            pools: Arc::clone(&self.pools),
            inspector: self.inspector.clone(),
        }
    }
}

impl<P: PoolProvider<Pool = PgPool>> SchemaService<P> {
    pub fn new(store: CredentialStore, pools: Arc<P>, inspector: SchemaInspector) -> Self {
        Self {
            store,
            pools,
            inspector,
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn pools(&self) -> &Arc<P> {
        &self.pools
    }

    pub async fn register(&self, payload: &RegisterCredentials) -> BrokerResult<CredentialsAdded> {
        let id = self.store.register(payload).await?;
        Ok(CredentialsAdded::new(id))
    }

    /// Full schema of the database behind `database_id`.
    pub async fn describe_database(&self, database_id: i64) -> BrokerResult<SchemaResult> {
        let record = self.store.lookup(database_id).await?;
        let target = self.store.connect_target(&record)?;
        let lease = self.pools.get_pool(&target).await?;

        debug!(credential_id = database_id, signature = %target.signature, "Describing schema");
        self.inspector.describe_schema(&lease).await
    }

    /// Schema restricted to tables named exactly `table_name`.
    pub async fn search_table(
        &self,
        database_id: i64,
        table_name: &str,
    ) -> BrokerResult<SchemaResult> {
        if table_name.trim().is_empty() {
            return Err(BrokerError::validation("table_name must not be empty"));
        }

        let record = self.store.lookup(database_id).await?;
        let target = self.store.connect_target(&record)?;
        let lease = self.pools.get_pool(&target).await?;

        debug!(
            credential_id = database_id,
            signature = %target.signature,
            table = %table_name,
            "Searching table"
        );
        self.inspector.describe_table(&lease, table_name).await
    }

    pub async fn stats(&self) -> RegistryStats {
        self.pools.stats().await
    }

    /// Close every downstream pool, then the metadata store.
    pub async fn shutdown(&self) {
        info!("Closing downstream pools");
        self.pools.close_all().await;
        self.store.close().await;
    }
}
