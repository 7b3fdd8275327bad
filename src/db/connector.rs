//! Building downstream connection pools.
//!
//! [`PoolConnector`] is the capability the registry uses to open one pool for
//! a [`ConnectTarget`]; [`TargetPool`] is the small surface the registry needs
//! from the pool it gets back.

use crate::config::PoolOptions;
use crate::error::{BrokerError, BrokerResult, connection_failure_suggestion};
use crate::models::{ConnectTarget, ConnectionSignature};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::sqlite::SqlitePool;
use sqlx::{Postgres, Sqlite};
use std::future::Future;
use tracing::{debug, info, warn};

const APPLICATION_NAME: &str = "schema-broker";

/// A pool the registry can hand out, borrow from and close.
pub trait TargetPool: Clone + Send + Sync + 'static {
    type Connection: Send;

    /// Borrow one connection, waiting up to the pool's acquire timeout.
    fn acquire(&self) -> impl Future<Output = Result<Self::Connection, sqlx::Error>> + Send;

    /// Close the pool, waiting for borrowed connections to return.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

macro_rules! impl_target_pool {
    ($pool:ty, $db:ty) => {
        impl TargetPool for $pool {
            type Connection = PoolConnection<$db>;

            fn acquire(
                &self,
            ) -> impl Future<Output = Result<Self::Connection, sqlx::Error>> + Send {
                sqlx::Pool::acquire(self)
            }

            fn close(&self) -> impl Future<Output = ()> + Send {
                sqlx::Pool::close(self)
            }
        }
    };
}

impl_target_pool!(PgPool, Postgres);
impl_target_pool!(SqlitePool, Sqlite);

/// Builds one pool for one downstream target.
pub trait PoolConnector: Send + Sync + 'static {
    type Pool: TargetPool;

    fn connect(
        &self,
        target: &ConnectTarget,
    ) -> impl Future<Output = BrokerResult<Self::Pool>> + Send;
}

/// PostgreSQL connector used for every registered credential.
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PoolOptions,
}

impl PgConnector {
    pub fn new(options: PoolOptions) -> Self {
        Self { options }
    }

    /// Connect options for a target. Endpoint and credentials come only from
    /// the target; no pgpass lookup.
    pub fn connect_options(&self, target: &ConnectTarget) -> PgConnectOptions {
        let sig = &target.signature;
        PgConnectOptions::new_without_pgpass()
            .host(&sig.host)
            .port(sig.port)
            .username(&sig.user)
            .password(target.password())
            .database(&sig.dbname)
            .application_name(APPLICATION_NAME)
            .options([(
                "statement_timeout",
                self.options.statement_timeout.as_millis().to_string(),
            )])
    }

    /// Pool settings shared by every downstream pool.
    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .min_connections(0)
            .max_connections(self.options.max_connections())
            .acquire_timeout(self.options.acquire_timeout)
            .idle_timeout(Some(self.options.idle_timeout))
            .max_lifetime(Some(self.options.recycle))
            .test_before_acquire(true)
    }
}

impl PoolConnector for PgConnector {
    type Pool = PgPool;

    async fn connect(&self, target: &ConnectTarget) -> BrokerResult<PgPool> {
        let sig = &target.signature;
        debug!(
            signature = %sig,
            max_connections = self.options.max_connections(),
            "Opening downstream pool"
        );

        let connect = self.pool_options().connect_with(self.connect_options(target));
        let pool = match tokio::time::timeout(self.options.connect_timeout, connect).await {
            Ok(Ok(pool)) => pool,
            Ok(Err(e)) => return Err(connect_error(sig, e)),
            Err(_) => {
                warn!(signature = %sig, "Timed out opening downstream pool");
                return Err(BrokerError::connection(
                    sig,
                    format!(
                        "timed out after {}s",
                        self.options.connect_timeout.as_secs()
                    ),
                    "Check that the database server is running and reachable",
                ));
            }
        };

        info!(signature = %sig, "Downstream pool ready");
        Ok(pool)
    }
}

/// Every failure while opening a pool is a connection failure, including
/// a pool timeout, which here means the first connection never came up.
fn connect_error(sig: &ConnectionSignature, err: sqlx::Error) -> BrokerError {
    let suggestion = connect_suggestion(&err);
    let message = match &err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!("{} (SQLSTATE: {})", db_err.message(), code),
            None => db_err.message().to_string(),
        },
        other => other.to_string(),
    };
    warn!(signature = %sig, error = %message, "Failed to open downstream pool");
    BrokerError::connection(sig, message, suggestion)
}

/// Generate a helpful suggestion for connection errors.
fn connect_suggestion(err: &sqlx::Error) -> &'static str {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(suggestion) = db_err.code().and_then(|c| connection_failure_suggestion(&c)) {
            return suggestion;
        }
    }

    let error_str = err.to_string().to_lowercase();
    if error_str.contains("connection refused") {
        return "Check that the PostgreSQL server is running and accessible";
    }
    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the username and password registered for this database";
    }
    if error_str.contains("does not exist") {
        return "Check that the database name exists on the server";
    }
    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration on the server";
    }
    "Verify host, port and credentials registered for this database"
}
