//! Schema introspection module.
//!
//! Reads `information_schema.columns` of a downstream PostgreSQL database and
//! folds the rows into a [`SchemaResult`].
//!
//! # Architecture
//!
//! SQL text lives in the `queries` submodule. The table name of a filtered
//! lookup is always a bound parameter. Every query runs on one connection
//! borrowed from the lease; the connection goes back to the pool when the
//! call returns, fails or is cancelled.

use crate::db::registry::PoolLease;
use crate::error::{BrokerError, BrokerResult};
use crate::models::{ColumnRow, ConnectionSignature, SchemaResult};
use sqlx::postgres::{PgArguments, PgPool, Postgres};
use sqlx::query::QueryAs;
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// SQL Query Templates
// =============================================================================
//
// Catalog columns are `sql_identifier` / `character_data` domains; they are
// cast to text so they decode as plain strings.

mod queries {
    pub const DESCRIBE_SCHEMA: &str = r#"
        SELECT
            table_schema::text AS table_schema,
            table_name::text AS table_name,
            column_name::text AS column_name,
            data_type::text AS data_type
        FROM information_schema.columns
        WHERE table_schema NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
            AND table_schema NOT LIKE 'pg\_temp\_%'
            AND table_schema NOT LIKE 'pg\_toast\_temp\_%'
        ORDER BY table_schema, table_name, ordinal_position
    "#;

    pub const DESCRIBE_TABLE: &str = r#"
        SELECT
            table_schema::text AS table_schema,
            table_name::text AS table_name,
            column_name::text AS column_name,
            data_type::text AS data_type
        FROM information_schema.columns
        WHERE table_name = $1
            AND table_schema NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
            AND table_schema NOT LIKE 'pg\_temp\_%'
            AND table_schema NOT LIKE 'pg\_toast\_temp\_%'
        ORDER BY table_schema, table_name, ordinal_position
    "#;
}

/// Runs catalog queries against leased downstream pools.
#[derive(Debug, Clone)]
pub struct SchemaInspector {
    query_timeout: Duration,
}

impl SchemaInspector {
    /// `query_timeout` bounds each catalog query on the client side, in
    /// addition to the server-side `statement_timeout` set at connect time.
    pub fn new(query_timeout: Duration) -> Self {
        Self { query_timeout }
    }

    /// Every column of every user table, grouped by schema and table.
    pub async fn describe_schema(&self, lease: &PoolLease<PgPool>) -> BrokerResult<SchemaResult> {
        let rows = self
            .fetch(lease, "describe_schema", sqlx::query_as(queries::DESCRIBE_SCHEMA))
            .await?;

        let result = SchemaResult::fold(&lease.signature().dbname, rows);
        debug!(
            signature = %lease.signature(),
            schemas = result.tables.len(),
            tables = result.table_count(),
            "Described schema"
        );
        Ok(result)
    }

    /// Columns of every user table named exactly `table_name`, across schemas.
    ///
    /// Fails with `NotFound` when no such table exists.
    pub async fn describe_table(
        &self,
        lease: &PoolLease<PgPool>,
        table_name: &str,
    ) -> BrokerResult<SchemaResult> {
        let query = sqlx::query_as(queries::DESCRIBE_TABLE).bind(table_name);
        let rows = self.fetch(lease, "describe_table", query).await?;

        let result = SchemaResult::fold(&lease.signature().dbname, rows);
        if result.is_empty() {
            debug!(signature = %lease.signature(), table = %table_name, "Table not found");
            return Err(BrokerError::table_not_found());
        }
        Ok(result)
    }

    async fn fetch<'q>(
        &self,
        lease: &PoolLease<PgPool>,
        operation: &str,
        query: QueryAs<'q, Postgres, ColumnRow, PgArguments>,
    ) -> BrokerResult<Vec<ColumnRow>> {
        let signature = lease.signature();
        let mut conn = lease.acquire().await?;

        match tokio::time::timeout(self.query_timeout, query.fetch_all(&mut *conn)).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) => Err(query_error(e, signature, operation)),
            Err(_) => {
                warn!(
                    signature = %signature,
                    operation,
                    timeout_secs = self.query_timeout.as_secs(),
                    "Catalog query timed out"
                );
                Err(BrokerError::introspection(
                    signature,
                    operation,
                    format!("query timed out after {}s", self.query_timeout.as_secs()),
                ))
            }
        }
    }
}

/// Every driver error raised by a catalog query is an introspection failure,
/// whatever its cause.
fn query_error(err: sqlx::Error, signature: &ConnectionSignature, operation: &str) -> BrokerError {
    let message = match &err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!("{} (SQLSTATE: {})", db_err.message(), code),
            None => db_err.message().to_string(),
        },
        other => other.to_string(),
    };
    warn!(signature = %signature, operation, error = %message, "Catalog query failed");
    BrokerError::introspection(signature, operation, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queries_exclude_system_schemas() {
        for sql in [queries::DESCRIBE_SCHEMA, queries::DESCRIBE_TABLE] {
            assert!(sql.contains("'pg_catalog'"));
            assert!(sql.contains("'information_schema'"));
            assert!(sql.contains("pg\\_temp\\_%"));
            assert!(sql.contains("ORDER BY table_schema, table_name, ordinal_position"));
        }
    }

    #[test]
    fn test_table_name_is_bound() {
        assert!(queries::DESCRIBE_TABLE.contains("table_name = $1"));
        assert!(!queries::DESCRIBE_SCHEMA.contains("$1"));
    }

    #[test]
    fn test_query_errors_are_always_introspection() {
        let sig = ConnectionSignature::new("app", "localhost", 5432, "sales");
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");

        for err in [
            sqlx::Error::PoolTimedOut,
            sqlx::Error::PoolClosed,
            sqlx::Error::Io(reset),
            sqlx::Error::Protocol("unexpected message".into()),
            sqlx::Error::RowNotFound,
        ] {
            match query_error(err, &sig, "describe_schema") {
                BrokerError::Introspection { operation, .. } => {
                    assert_eq!(operation, "describe_schema")
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }
}
