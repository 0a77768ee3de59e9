//! SQLite dialect for dynamic tables.
//!
//! Requires SQLite 3.35+ for DROP COLUMN. SQLite has no ALTER COLUMN TYPE;
//! type changes are carried out by the field migration service as
//! add-temporary-column, copy converted values, drop, rename, all inside one
//! transaction.

use crate::operations::SchemaOperation;
use crate::schema::TableSchema;

use super::MigrationDialect;

/// SQLite migration dialect.
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Creates a new SQLite dialect.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Generates SQL for creating a table.
    fn create_table_sql(&self, table: &TableSchema) -> String {
        let mut sql = String::from("CREATE TABLE ");
        sql.push_str(&self.quote_identifier(&table.name));
        sql.push_str(" (\n");

        let col_defs: Vec<String> = table
            .columns
            .iter()
            .map(|c| self.column_definition(c))
            .collect();
        sql.push_str("  ");
        sql.push_str(&col_defs.join(",\n  "));

        sql.push_str("\n)");
        sql
    }

    /// Generates SQL for dropping a table.
    fn drop_table_sql(&self, name: &str, if_exists: bool) -> String {
        let mut sql = String::from("DROP TABLE ");
        if if_exists {
            sql.push_str("IF EXISTS ");
        }
        sql.push_str(&self.quote_identifier(name));
        sql
    }
}

impl MigrationDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn generate_sql(&self, operation: &SchemaOperation) -> Vec<String> {
        match operation {
            SchemaOperation::CreateTable { table } => vec![self.create_table_sql(table)],

            SchemaOperation::DropTable { name, if_exists } => {
                vec![self.drop_table_sql(name, *if_exists)]
            }

            SchemaOperation::AddColumn { table, column } => vec![format!(
                "ALTER TABLE {} ADD COLUMN {}",
                self.quote_identifier(table),
                self.column_definition(column)
            )],

            SchemaOperation::DropColumn { table, column_name } => vec![format!(
                "ALTER TABLE {} DROP COLUMN {}",
                self.quote_identifier(table),
                self.quote_identifier(column_name)
            )],

            SchemaOperation::RenameColumn {
                table,
                old_name,
                new_name,
            } => vec![format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                self.quote_identifier(table),
                self.quote_identifier(old_name),
                self.quote_identifier(new_name)
            )],
        }
    }

    fn list_tables_sql(&self) -> &'static str {
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'"
    }

    fn table_info_sql(&self) -> &'static str {
        "SELECT name, type, \"notnull\" FROM pragma_table_info(?) ORDER BY cid"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType, ForeignKeyAction};

    fn dialect() -> SqliteDialect {
        SqliteDialect::new()
    }

    #[test]
    fn test_create_table_with_cascading_key() {
        let table = TableSchema::new("contact_form")
            .column(
                ColumnSchema::new("id", ColumnType::Text)
                    .primary_key()
                    .references("submissions", "id", ForeignKeyAction::Cascade),
            )
            .column(ColumnSchema::new("full_name", ColumnType::Varchar(255)))
            .column(
                ColumnSchema::new("created_at", ColumnType::Timestamp)
                    .not_null()
                    .default_expr("CURRENT_TIMESTAMP"),
            );

        let sql = dialect().generate_sql(&SchemaOperation::create_table(table));
        assert_eq!(sql.len(), 1);
        assert!(sql[0].starts_with("CREATE TABLE \"contact_form\""));
        assert!(sql[0].contains(
            "\"id\" TEXT PRIMARY KEY NOT NULL REFERENCES \"submissions\"(\"id\") ON DELETE CASCADE"
        ));
        assert!(sql[0].contains("\"full_name\" VARCHAR(255)"));
        assert!(sql[0].contains("DEFAULT CURRENT_TIMESTAMP"));
    }

    #[test]
    fn test_drop_table() {
        let op = SchemaOperation::DropTable {
            name: "contact_form".to_string(),
            if_exists: true,
        };
        assert_eq!(
            dialect().generate_sql(&op)[0],
            "DROP TABLE IF EXISTS \"contact_form\""
        );
    }

    #[test]
    fn test_add_column() {
        let op = SchemaOperation::add_column(
            "contact_form",
            ColumnSchema::new("visit_date", ColumnType::Date),
        );
        assert_eq!(
            dialect().generate_sql(&op)[0],
            "ALTER TABLE \"contact_form\" ADD COLUMN \"visit_date\" DATE"
        );
    }

    #[test]
    fn test_drop_column() {
        let op = SchemaOperation::drop_column("contact_form", "email");
        assert_eq!(
            dialect().generate_sql(&op)[0],
            "ALTER TABLE \"contact_form\" DROP COLUMN \"email\""
        );
    }

    #[test]
    fn test_rename_column() {
        let op = SchemaOperation::rename_column("contact_form", "name", "full_name");
        assert_eq!(
            dialect().generate_sql(&op)[0],
            "ALTER TABLE \"contact_form\" RENAME COLUMN \"name\" TO \"full_name\""
        );
    }

    #[test]
    fn test_quote_identifier_escapes_quotes() {
        assert_eq!(dialect().quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_snapshot_sql() {
        let sql = dialect().snapshot_sql("contact_form", "email");
        assert_eq!(
            sql,
            "SELECT \"id\" AS row_id, typeof(\"email\") AS kind, \"email\" AS value, \
             CAST(\"email\" AS TEXT) AS text FROM \"contact_form\" ORDER BY \"id\""
        );
    }
}
