//! Database dialect implementations.
//!
//! A dialect turns schema operations into SQL text and knows the
//! introspection queries the engine uses to check live schema state.

mod sqlite;

pub use sqlite::SqliteDialect;

use crate::operations::SchemaOperation;
use crate::schema::ColumnSchema;

/// Longest identifier the mirrored tables may use, in bytes.
///
/// BI tools reading the mirror assume the Postgres limit.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Trait for database-specific SQL generation.
pub trait MigrationDialect: Send + Sync {
    /// Returns the dialect name.
    fn name(&self) -> &'static str;

    /// Generates SQL for a schema operation.
    fn generate_sql(&self, operation: &SchemaOperation) -> Vec<String>;

    /// Query listing user tables; yields one `name` column.
    fn list_tables_sql(&self) -> &'static str;

    /// Query describing a table's columns; binds the table name and yields
    /// `name`, `type`, `notnull`.
    fn table_info_sql(&self) -> &'static str;

    /// Query reading one column as `row_id`, storage `kind`, the raw
    /// `value`, and its `text` rendering for non-numeric kinds.
    fn snapshot_sql(&self, table: &str, column: &str) -> String {
        format!(
            "SELECT {id} AS row_id, typeof({col}) AS kind, {col} AS value, \
             CAST({col} AS TEXT) AS text FROM {table} ORDER BY {id}",
            id = self.quote_identifier("id"),
            col = self.quote_identifier(column),
            table = self.quote_identifier(table),
        )
    }

    /// Statement writing one cell by row id; binds value then row id.
    fn update_cell_sql(&self, table: &str, column: &str) -> String {
        format!(
            "UPDATE {} SET {} = ? WHERE {} = ?",
            self.quote_identifier(table),
            self.quote_identifier(column),
            self.quote_identifier("id"),
        )
    }

    /// Query counting rows in a table.
    fn count_rows_sql(&self, table: &str) -> String {
        format!("SELECT COUNT(*) FROM {}", self.quote_identifier(table))
    }

    /// Generates column definition SQL.
    fn column_definition(&self, column: &ColumnSchema) -> String {
        let mut parts = vec![
            self.quote_identifier(&column.name),
            column.column_type.sql_name(),
        ];

        if column.primary_key {
            parts.push("PRIMARY KEY".to_string());
        }

        if !column.nullable {
            parts.push("NOT NULL".to_string());
        }

        if let Some(ref default) = column.default {
            parts.push(format!("DEFAULT {default}"));
        }

        if let Some(ref fk) = column.references {
            parts.push(format!(
                "REFERENCES {}({}) ON DELETE {}",
                self.quote_identifier(&fk.references_table),
                self.quote_identifier(&fk.references_column),
                fk.on_delete.to_sql()
            ));
        }

        parts.join(" ")
    }

    /// Quote an identifier (table name, column name, etc.).
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}
