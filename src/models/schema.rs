//! Schema-related data models.
//!
//! Catalog rows come back flat; [`SchemaResult::fold`] nests them into
//! `schema -> table -> [column]`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schemas owned by the PostgreSQL engine itself.
const SYSTEM_SCHEMAS: &[&str] = &["pg_catalog", "information_schema", "pg_toast"];

/// True for engine-reserved schemas, including per-session temp schemas.
pub fn is_system_schema(name: &str) -> bool {
    SYSTEM_SCHEMAS.contains(&name)
        || name.starts_with("pg_temp_")
        || name.starts_with("pg_toast_temp_")
}

/// One row of the `information_schema.columns` query.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ColumnRow {
    pub table_schema: String,
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnEntry {
    pub column_name: String,
    pub data_type: String,
}

/// Tables of one schema, each with its columns in ordinal order.
pub type SchemaTables = BTreeMap<String, Vec<ColumnEntry>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaResult {
    pub database_name: String,
    pub tables: BTreeMap<String, SchemaTables>,
}

impl SchemaResult {
    /// Fold catalog rows into the nested result.
    ///
    /// Rows must arrive ordered by ordinal position within each table; column
    /// order is taken from arrival order. System schema rows are dropped.
    pub fn fold(database_name: impl Into<String>, rows: impl IntoIterator<Item = ColumnRow>) -> Self {
        let mut tables: BTreeMap<String, SchemaTables> = BTreeMap::new();
        for row in rows {
            if is_system_schema(&row.table_schema) {
                continue;
            }
            tables
                .entry(row.table_schema)
                .or_default()
                .entry(row.table_name)
                .or_default()
                .push(ColumnEntry {
                    column_name: row.column_name,
                    data_type: row.data_type,
                });
        }
        Self {
            database_name: database_name.into(),
            tables,
        }
    }

    /// Number of tables across all schemas.
    pub fn table_count(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(schema: &str, table: &str, column: &str, data_type: &str) -> ColumnRow {
        ColumnRow {
            table_schema: schema.to_string(),
            table_name: table.to_string(),
            column_name: column.to_string(),
            data_type: data_type.to_string(),
        }
    }

    #[test]
    fn test_fold_groups_by_schema_and_table() {
        let result = SchemaResult::fold(
            "shop",
            vec![
                row("public", "orders", "id", "integer"),
                row("public", "orders", "total", "numeric"),
                row("public", "users", "id", "integer"),
                row("audit", "events", "at", "timestamp with time zone"),
            ],
        );

        assert_eq!(result.database_name, "shop");
        assert_eq!(result.tables.len(), 2);
        assert_eq!(result.table_count(), 3);
        let orders = &result.tables["public"]["orders"];
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].column_name, "id");
        assert_eq!(orders[1].column_name, "total");
        assert_eq!(result.tables["audit"]["events"][0].data_type, "timestamp with time zone");
    }

    #[test]
    fn test_fold_keeps_arrival_order_of_columns() {
        let result = SchemaResult::fold(
            "db",
            vec![
                row("public", "t", "z_last_alpha", "text"),
                row("public", "t", "a_first_alpha", "text"),
            ],
        );
        let cols: Vec<_> = result.tables["public"]["t"]
            .iter()
            .map(|c| c.column_name.as_str())
            .collect();
        assert_eq!(cols, vec!["z_last_alpha", "a_first_alpha"]);
    }

    #[test]
    fn test_fold_drops_system_schemas() {
        let result = SchemaResult::fold(
            "db",
            vec![
                row("pg_catalog", "pg_class", "oid", "oid"),
                row("information_schema", "columns", "table_name", "name"),
                row("pg_toast", "pg_toast_1", "chunk_id", "oid"),
                row("pg_temp_3", "scratch", "x", "integer"),
                row("public", "users", "id", "integer"),
            ],
        );
        assert_eq!(result.tables.keys().collect::<Vec<_>>(), vec!["public"]);
    }

    #[test]
    fn test_fold_empty() {
        let result = SchemaResult::fold("db", Vec::new());
        assert!(result.is_empty());
        assert_eq!(result.table_count(), 0);
    }

    #[test]
    fn test_is_system_schema() {
        assert!(is_system_schema("pg_catalog"));
        assert!(is_system_schema("information_schema"));
        assert!(is_system_schema("pg_toast_temp_1"));
        assert!(!is_system_schema("public"));
        assert!(!is_system_schema("pg_custom"));
    }

    #[test]
    fn test_json_shape() {
        let result = SchemaResult::fold("db", vec![row("public", "users", "id", "integer")]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["database_name"], "db");
        assert_eq!(json["tables"]["public"]["users"][0]["column_name"], "id");
        assert_eq!(json["tables"]["public"]["users"][0]["data_type"], "integer");
    }
}
