//! Dynamic table lifecycle and the entry point for schema changes.
//!
//! [`DynamicTableService`] creates and drops the mirrored tables of forms
//! and sub-forms. Column changes are never applied here: they are diffed
//! and handed to the [`MigrationQueue`], which serializes them per table.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::db::{decode_ts, encode_ts, SYSTEM_TABLES};
use crate::detector::{Change, ChangeDetector};
use crate::dialect::MigrationDialect;
use crate::error::{MigrateError, Result};
use crate::naming::{is_valid_identifier, IdentifierNamer, NameContext, RESERVED_COLUMNS};
use crate::operations::SchemaOperation;
use crate::queue::{self, MigrationQueue, NewJob};
use crate::schema::{
    ColumnInfo, ColumnSchema, ColumnType, FieldDefinition, FieldInput, FormSchema,
    ForeignKeyAction, SubFormSchema, TableSchema,
};

/// Which mirrored table a change targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableTarget {
    /// The form's own table.
    Form(String),
    /// A sub-form's table.
    SubForm {
        /// Parent form.
        form_id: String,
        /// Sub-form.
        sub_form_id: String,
    },
}

impl TableTarget {
    /// Returns the owning form.
    #[must_use]
    pub fn form_id(&self) -> &str {
        match self {
            Self::Form(form_id) | Self::SubForm { form_id, .. } => form_id,
        }
    }
}

/// A registered form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormRecord {
    pub id: String,
    pub title: String,
    pub table_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A registered sub-form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubFormRecord {
    pub id: String,
    pub form_id: String,
    pub title: String,
    pub table_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of materializing a form or sub-form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedTable {
    /// Owning form.
    pub form_id: String,
    /// Sub-form, for sub-form tables.
    pub sub_form_id: Option<String>,
    /// Table name.
    pub table_name: String,
    /// Fields with their resolved column names. Attachment fields are
    /// named but have no column.
    pub fields: Vec<FieldDefinition>,
    /// False when the table already existed.
    pub created: bool,
}

/// Creates and drops dynamic tables and enqueues their column changes.
#[derive(Clone)]
pub struct DynamicTableService {
    pool: SqlitePool,
    dialect: Arc<dyn MigrationDialect>,
    namer: Arc<IdentifierNamer>,
    queue: MigrationQueue,
    detector: ChangeDetector,
}

impl std::fmt::Debug for DynamicTableService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicTableService")
            .field("dialect", &self.dialect.name())
            .field("namer", &self.namer)
            .finish_non_exhaustive()
    }
}

impl DynamicTableService {
    pub(crate) fn new(
        pool: SqlitePool,
        dialect: Arc<dyn MigrationDialect>,
        namer: Arc<IdentifierNamer>,
        queue: MigrationQueue,
    ) -> Self {
        Self {
            pool,
            dialect,
            namer,
            queue,
            detector: ChangeDetector::new(),
        }
    }

    /// Registers `form` and creates its table: the submission id as primary
    /// key (cascading from `submissions`), one column per mirrored field,
    /// and audit timestamps.
    ///
    /// Calling this again for a materialized form creates nothing and
    /// returns `created: false`.
    pub async fn create_form_table(&self, form: &FormSchema) -> Result<MaterializedTable> {
        let existing = self.find_form(&form.id).await?;
        let live = self.live_tables().await?;

        if let Some(table) = existing.as_ref().and_then(|f| f.table_name.clone()) {
            if live.contains(&table) {
                return self
                    .already_materialized(&form.id, None, table, &form.fields)
                    .await;
            }
            warn!(form_id = %form.id, table = %table, "Recorded table is missing, re-creating");
        }

        let table = self
            .namer
            .resolve(&form.title, NameContext::Form, &taken_table_names(&live))
            .await;
        let fields = self.plan_fields(&form.id, None, &form.fields).await?;
        let schema = table_schema(&table, &fields, false);

        let mut tx = self.pool.begin().await?;
        ensure_table_absent(&mut tx, self.dialect.as_ref(), &table).await?;
        sqlx::query(
            "INSERT INTO forms (id, title, table_name, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, table_name = excluded.table_name",
        )
        .bind(&form.id)
        .bind(&form.title)
        .bind(&table)
        .bind(encode_ts(Utc::now()))
        .execute(&mut *tx)
        .await?;
        execute_operation(&mut tx, self.dialect.as_ref(), &SchemaOperation::create_table(schema))
            .await?;
        tx.commit().await?;

        info!(
            form_id = %form.id,
            table = %table,
            columns = fields.iter().filter(|f| f.field_type.is_mirrored()).count(),
            "Form table created"
        );
        Ok(MaterializedTable {
            form_id: form.id.clone(),
            sub_form_id: None,
            table_name: table,
            fields,
            created: true,
        })
    }

    /// Drops a form's table and clears its registration. Waiting jobs on
    /// the table are cancelled. Returns the number of rows the table held.
    pub async fn drop_form_table(&self, form_id: &str) -> Result<u64> {
        let form = self.form(form_id).await?;
        let table = form
            .table_name
            .ok_or_else(|| MigrateError::TableNotMaterialized(form_id.to_string()))?;

        let mut tx = self.pool.begin().await?;
        let rows = drop_dynamic_table(&mut tx, self.dialect.as_ref(), &table).await?;
        sqlx::query("UPDATE forms SET table_name = NULL WHERE id = ?")
            .bind(form_id)
            .execute(&mut *tx)
            .await?;
        let cancelled = queue::cancel_table(&mut tx, &table).await?;
        tx.commit().await?;

        info!(form_id, table = %table, rows, cancelled, "Form table dropped");
        Ok(rows)
    }

    /// Registers a sub-form of `form_id` and creates its table, which adds
    /// `parent_id` referencing the parent submission.
    ///
    /// The table is named after the parent form and sub-form titles.
    pub async fn create_sub_form_table(
        &self,
        form_id: &str,
        sub_form: &SubFormSchema,
    ) -> Result<MaterializedTable> {
        if sub_form.form_id != form_id {
            return Err(MigrateError::InvalidState(format!(
                "sub-form {} belongs to form {}, not {form_id}",
                sub_form.id, sub_form.form_id
            )));
        }
        let parent = self.form(form_id).await?;
        let existing = self.find_sub_form(&sub_form.id).await?;
        let live = self.live_tables().await?;

        if let Some(table) = existing.as_ref().and_then(|s| s.table_name.clone()) {
            if live.contains(&table) {
                return self
                    .already_materialized(form_id, Some(&sub_form.id), table, &sub_form.fields)
                    .await;
            }
            warn!(sub_form_id = %sub_form.id, table = %table, "Recorded table is missing, re-creating");
        }

        let title = format!("{} {}", parent.title, sub_form.title);
        let table = self
            .namer
            .resolve(&title, NameContext::Form, &taken_table_names(&live))
            .await;
        let fields = self
            .plan_fields(form_id, Some(&sub_form.id), &sub_form.fields)
            .await?;
        let schema = table_schema(&table, &fields, true);

        let mut tx = self.pool.begin().await?;
        ensure_table_absent(&mut tx, self.dialect.as_ref(), &table).await?;
        sqlx::query(
            "INSERT INTO sub_forms (id, form_id, title, table_name, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, table_name = excluded.table_name",
        )
        .bind(&sub_form.id)
        .bind(form_id)
        .bind(&sub_form.title)
        .bind(&table)
        .bind(encode_ts(Utc::now()))
        .execute(&mut *tx)
        .await?;
        execute_operation(&mut tx, self.dialect.as_ref(), &SchemaOperation::create_table(schema))
            .await?;
        tx.commit().await?;

        info!(form_id, sub_form_id = %sub_form.id, table = %table, "Sub-form table created");
        Ok(MaterializedTable {
            form_id: form_id.to_string(),
            sub_form_id: Some(sub_form.id.clone()),
            table_name: table,
            fields,
            created: true,
        })
    }

    /// Drops a sub-form's table. Returns the number of rows it held.
    pub async fn drop_sub_form_table(&self, sub_form_id: &str) -> Result<u64> {
        let sub_form = self.sub_form(sub_form_id).await?;
        let table = sub_form
            .table_name
            .ok_or_else(|| MigrateError::TableNotMaterialized(sub_form_id.to_string()))?;

        let mut tx = self.pool.begin().await?;
        let rows = drop_dynamic_table(&mut tx, self.dialect.as_ref(), &table).await?;
        sqlx::query("UPDATE sub_forms SET table_name = NULL WHERE id = ?")
            .bind(sub_form_id)
            .execute(&mut *tx)
            .await?;
        let cancelled = queue::cancel_table(&mut tx, &table).await?;
        tx.commit().await?;

        info!(sub_form_id, table = %table, rows, cancelled, "Sub-form table dropped");
        Ok(rows)
    }

    /// Enqueues `changes` against the target's table, in order, and returns
    /// the job ids. This is the only way column changes reach a table.
    pub async fn update_form_table_columns(
        &self,
        target: &TableTarget,
        changes: Vec<Change>,
    ) -> Result<Vec<i64>> {
        let table = self.target_table(target).await?;
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let jobs: Vec<NewJob> = changes
            .into_iter()
            .map(|change| NewJob::apply(target.form_id(), &table, change))
            .collect();
        let ids = self.queue.enqueue_batch(&jobs).await?;
        info!(form_id = target.form_id(), table = %table, jobs = ids.len(), "Column changes enqueued");
        Ok(ids)
    }

    /// Diffs a field list update and enqueues the resulting changes.
    ///
    /// Call after the form's own metadata has been committed.
    pub async fn sync_fields(
        &self,
        target: &TableTarget,
        old: &[FieldDefinition],
        new: &[FieldInput],
    ) -> Result<Vec<i64>> {
        let changes = self.detector.diff(old, new);
        debug!(form_id = target.form_id(), changes = changes.len(), "Field list diffed");
        self.update_form_table_columns(target, changes).await
    }

    /// Looks up a registered form.
    pub async fn form(&self, form_id: &str) -> Result<FormRecord> {
        self.find_form(form_id)
            .await?
            .ok_or_else(|| MigrateError::FormNotFound(form_id.to_string()))
    }

    /// Looks up a registered sub-form.
    pub async fn sub_form(&self, sub_form_id: &str) -> Result<SubFormRecord> {
        self.find_sub_form(sub_form_id)
            .await?
            .ok_or_else(|| MigrateError::SubFormNotFound(sub_form_id.to_string()))
    }

    /// Sub-forms of a form.
    pub async fn list_sub_forms(&self, form_id: &str) -> Result<Vec<SubFormRecord>> {
        let rows: Vec<(String, String, String, Option<String>, String)> = sqlx::query_as(
            "SELECT id, form_id, title, table_name, created_at FROM sub_forms \
             WHERE form_id = ? ORDER BY created_at, id",
        )
        .bind(form_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(sub_form_record).collect())
    }

    async fn target_table(&self, target: &TableTarget) -> Result<String> {
        match target {
            TableTarget::Form(form_id) => self
                .form(form_id)
                .await?
                .table_name
                .ok_or_else(|| MigrateError::TableNotMaterialized(form_id.clone())),
            TableTarget::SubForm {
                form_id,
                sub_form_id,
            } => {
                let sub_form = self.sub_form(sub_form_id).await?;
                if sub_form.form_id != *form_id {
                    return Err(MigrateError::SubFormNotFound(sub_form_id.clone()));
                }
                sub_form
                    .table_name
                    .ok_or_else(|| MigrateError::TableNotMaterialized(sub_form_id.clone()))
            }
        }
    }

    // Names every field; explicit names are validated, the rest resolved
    // from titles. Attachments are named so they stay unique if they later
    // become mirrored.
    async fn plan_fields(
        &self,
        form_id: &str,
        sub_form_id: Option<&str>,
        inputs: &[FieldInput],
    ) -> Result<Vec<FieldDefinition>> {
        let mut used: HashSet<String> = RESERVED_COLUMNS.iter().map(|c| (*c).to_string()).collect();
        for input in inputs {
            if let Some(column) = &input.column_name {
                if !is_valid_identifier(column) {
                    return Err(MigrateError::InvalidState(format!(
                        "'{column}' is not a valid column name"
                    )));
                }
                if !used.insert(column.clone()) {
                    return Err(MigrateError::DuplicateColumn {
                        table: form_id.to_string(),
                        column: column.clone(),
                    });
                }
            }
        }

        let mut fields = Vec::with_capacity(inputs.len());
        for input in inputs {
            let column = match &input.column_name {
                Some(column) => column.clone(),
                None => {
                    let name = self
                        .namer
                        .resolve(&input.title, NameContext::Field, &used)
                        .await;
                    used.insert(name.clone());
                    name
                }
            };
            let id = input.id.clone().unwrap_or_else(|| column.clone());
            let mut field = FieldDefinition::new(id, form_id, column, input.field_type, &input.title);
            if let Some(sub_form_id) = sub_form_id {
                field = field.in_sub_form(sub_form_id);
            }
            fields.push(field);
        }
        Ok(fields)
    }

    // Re-plans names for an existing table and keeps the fields whose
    // column is present.
    async fn already_materialized(
        &self,
        form_id: &str,
        sub_form_id: Option<&str>,
        table: String,
        inputs: &[FieldInput],
    ) -> Result<MaterializedTable> {
        let columns: HashSet<String> = {
            let mut conn = self.pool.acquire().await?;
            table_columns(&mut conn, self.dialect.as_ref(), &table)
                .await?
                .into_iter()
                .map(|c| c.name)
                .collect()
        };
        let fields = self
            .plan_fields(form_id, sub_form_id, inputs)
            .await?
            .into_iter()
            .filter(|f| !f.field_type.is_mirrored() || columns.contains(&f.column_name))
            .collect();
        info!(form_id, table = %table, "Table already materialized");
        Ok(MaterializedTable {
            form_id: form_id.to_string(),
            sub_form_id: sub_form_id.map(str::to_string),
            table_name: table,
            fields,
            created: false,
        })
    }

    async fn find_form(&self, form_id: &str) -> Result<Option<FormRecord>> {
        let row: Option<(String, String, Option<String>, String)> = sqlx::query_as(
            "SELECT id, title, table_name, created_at FROM forms WHERE id = ?",
        )
        .bind(form_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, title, table_name, created_at)| FormRecord {
            id,
            title,
            table_name,
            created_at: decode_ts(&created_at).unwrap_or_default(),
        }))
    }

    async fn find_sub_form(&self, sub_form_id: &str) -> Result<Option<SubFormRecord>> {
        let row: Option<(String, String, String, Option<String>, String)> = sqlx::query_as(
            "SELECT id, form_id, title, table_name, created_at FROM sub_forms WHERE id = ?",
        )
        .bind(sub_form_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(sub_form_record))
    }

    async fn live_tables(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        list_tables(&mut conn, self.dialect.as_ref()).await
    }
}

fn sub_form_record(
    (id, form_id, title, table_name, created_at): (String, String, String, Option<String>, String),
) -> SubFormRecord {
    SubFormRecord {
        id,
        form_id,
        title,
        table_name,
        created_at: decode_ts(&created_at).unwrap_or_default(),
    }
}

fn taken_table_names(live: &[String]) -> HashSet<String> {
    live.iter()
        .cloned()
        .chain(SYSTEM_TABLES.iter().map(|t| (*t).to_string()))
        .collect()
}

fn table_schema(name: &str, fields: &[FieldDefinition], with_parent: bool) -> TableSchema {
    let mut table = TableSchema::new(name).column(
        ColumnSchema::new("id", ColumnType::Text)
            .primary_key()
            .references("submissions", "id", ForeignKeyAction::Cascade),
    );
    if with_parent {
        table = table.column(
            ColumnSchema::new("parent_id", ColumnType::Text)
                .not_null()
                .references("submissions", "id", ForeignKeyAction::Cascade),
        );
    }
    for field in fields {
        if let Some(column_type) = field.field_type.column_type() {
            table = table.column(ColumnSchema::new(&field.column_name, column_type));
        }
    }
    for audit in ["created_at", "updated_at"] {
        table = table.column(
            ColumnSchema::new(audit, ColumnType::Timestamp)
                .not_null()
                .default_expr("CURRENT_TIMESTAMP"),
        );
    }
    table
}

async fn ensure_table_absent(
    conn: &mut SqliteConnection,
    dialect: &dyn MigrationDialect,
    table: &str,
) -> Result<()> {
    if table_columns(conn, dialect, table).await?.is_empty() {
        Ok(())
    } else {
        Err(MigrateError::InvalidState(format!(
            "table '{table}' was created concurrently"
        )))
    }
}

async fn drop_dynamic_table(
    conn: &mut SqliteConnection,
    dialect: &dyn MigrationDialect,
    table: &str,
) -> Result<u64> {
    if table_columns(conn, dialect, table).await?.is_empty() {
        warn!(table = %table, "Table already gone");
        return Ok(0);
    }
    let rows: i64 = sqlx::query_scalar(&dialect.count_rows_sql(table))
        .fetch_one(&mut *conn)
        .await?;
    execute_operation(conn, dialect, &SchemaOperation::drop_table(table)).await?;
    Ok(u64::try_from(rows).unwrap_or_default())
}

/// Names of all user tables.
pub(crate) async fn list_tables(
    conn: &mut SqliteConnection,
    dialect: &dyn MigrationDialect,
) -> Result<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar(dialect.list_tables_sql())
        .fetch_all(&mut *conn)
        .await?;
    Ok(names)
}

/// Live columns of `table`; empty when the table does not exist.
pub(crate) async fn table_columns(
    conn: &mut SqliteConnection,
    dialect: &dyn MigrationDialect,
    table: &str,
) -> Result<Vec<ColumnInfo>> {
    let rows: Vec<(String, String, i64)> = sqlx::query_as(dialect.table_info_sql())
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows
        .into_iter()
        .map(|(name, declared_type, notnull)| ColumnInfo {
            name,
            declared_type,
            nullable: notnull == 0,
        })
        .collect())
}

/// Runs the statements of one schema operation.
pub(crate) async fn execute_operation(
    conn: &mut SqliteConnection,
    dialect: &dyn MigrationDialect,
    operation: &SchemaOperation,
) -> Result<()> {
    for sql in dialect.generate_sql(operation) {
        debug!(sql = %sql, "Executing SQL");
        sqlx::query(&sql).execute(&mut *conn).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::db::testing;
    use crate::dialect::SqliteDialect;
    use crate::field_migration::FieldMigrationService;
    use crate::queue::JobStatus;
    use crate::schema::FieldType;

    async fn service() -> (SqlitePool, DynamicTableService, MigrationQueue) {
        let pool = testing::pool().await;
        let dialect: Arc<dyn MigrationDialect> = Arc::new(SqliteDialect::new());
        let namer = Arc::new(IdentifierNamer::default());
        let executor = FieldMigrationService::new(
            pool.clone(),
            Arc::clone(&dialect),
            Arc::clone(&namer),
            chrono::Duration::days(90),
        );
        let queue = MigrationQueue::new(pool.clone(), executor, QueueConfig::default());
        let tables = DynamicTableService::new(pool.clone(), dialect, namer, queue.clone());
        (pool, tables, queue)
    }

    async fn column_names(pool: &SqlitePool, table: &str) -> Vec<String> {
        let mut conn = pool.acquire().await.unwrap();
        table_columns(&mut conn, &SqliteDialect::new(), table)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect()
    }

    fn contact_form() -> FormSchema {
        FormSchema::new("form-1", "Contact")
            .field(FieldInput::new("ชื่อ", FieldType::ShortAnswer).with_id("f-name"))
            .field(FieldInput::new("Age", FieldType::Number).with_id("f-age"))
            .field(FieldInput::new("Photo", FieldType::ImageUpload).with_id("f-photo"))
    }

    #[tokio::test]
    async fn test_create_form_table() {
        let (pool, tables, _queue) = service().await;
        let created = tables.create_form_table(&contact_form()).await.unwrap();

        assert!(created.created);
        assert_eq!(created.table_name, "contact");
        assert_eq!(created.fields[0].column_name, "name");
        assert_eq!(created.fields[1].column_name, "age");
        assert_eq!(
            column_names(&pool, "contact").await,
            vec!["id", "name", "age", "created_at", "updated_at"]
        );

        let record = tables.form("form-1").await.unwrap();
        assert_eq!(record.table_name.as_deref(), Some("contact"));
    }

    #[tokio::test]
    async fn test_create_form_table_is_idempotent() {
        let (_pool, tables, _queue) = service().await;
        tables.create_form_table(&contact_form()).await.unwrap();
        let again = tables.create_form_table(&contact_form()).await.unwrap();
        assert!(!again.created);
        assert_eq!(again.table_name, "contact");
        assert_eq!(again.fields.len(), 3);
    }

    #[tokio::test]
    async fn test_table_names_avoid_existing_tables() {
        let (_pool, tables, _queue) = service().await;
        tables.create_form_table(&contact_form()).await.unwrap();
        let other = FormSchema::new("form-2", "Contact");
        let created = tables.create_form_table(&other).await.unwrap();
        assert_ne!(created.table_name, "contact");
        assert!(created.table_name.starts_with("contact_"));
    }

    #[tokio::test]
    async fn test_rows_cascade_from_submissions() {
        let (pool, tables, _queue) = service().await;
        tables.create_form_table(&contact_form()).await.unwrap();
        sqlx::query("INSERT INTO submissions (id, form_id) VALUES ('s1', 'form-1')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO contact (id, name) VALUES ('s1', 'Ann')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("DELETE FROM submissions WHERE id = 's1'")
            .execute(&pool)
            .await
            .unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM contact")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_sub_form_table_has_parent_key() {
        let (pool, tables, _queue) = service().await;
        tables.create_form_table(&contact_form()).await.unwrap();
        let sub_form = SubFormSchema {
            id: "sf-1".into(),
            form_id: "form-1".into(),
            title: "Address".into(),
            table_name: None,
            fields: vec![FieldInput::new("City", FieldType::ShortAnswer)],
        };
        let created = tables
            .create_sub_form_table("form-1", &sub_form)
            .await
            .unwrap();

        assert_eq!(created.table_name, "contact_address");
        assert_eq!(created.fields[0].sub_form_id.as_deref(), Some("sf-1"));
        assert_eq!(created.fields[0].id, "city");
        let columns = column_names(&pool, "contact_address").await;
        assert_eq!(columns[1], "parent_id");
        assert_eq!(tables.list_sub_forms("form-1").await.unwrap().len(), 1);

        let rows = tables.drop_sub_form_table("sf-1").await.unwrap();
        assert_eq!(rows, 0);
        assert!(column_names(&pool, "contact_address").await.is_empty());
        assert_eq!(tables.sub_form("sf-1").await.unwrap().table_name, None);
    }

    #[tokio::test]
    async fn test_duplicate_requested_columns_are_rejected() {
        let (_pool, tables, _queue) = service().await;
        let form = FormSchema::new("form-1", "Contact")
            .field(FieldInput::new("A", FieldType::ShortAnswer).with_column("dup"))
            .field(FieldInput::new("B", FieldType::ShortAnswer).with_column("dup"));
        assert!(matches!(
            tables.create_form_table(&form).await,
            Err(MigrateError::DuplicateColumn { .. })
        ));
    }

    #[tokio::test]
    async fn test_changes_for_unmaterialized_form_fail() {
        let (_pool, tables, _queue) = service().await;
        let target = TableTarget::Form("form-9".into());
        assert!(matches!(
            tables.update_form_table_columns(&target, Vec::new()).await,
            Err(MigrateError::FormNotFound(_))
        ));

        tables.create_form_table(&contact_form()).await.unwrap();
        tables.drop_form_table("form-1").await.unwrap();
        let target = TableTarget::Form("form-1".into());
        assert!(matches!(
            tables.update_form_table_columns(&target, Vec::new()).await,
            Err(MigrateError::TableNotMaterialized(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_fields_enqueues_in_detector_order() {
        let (pool, tables, queue) = service().await;
        let created = tables.create_form_table(&contact_form()).await.unwrap();
        let target = TableTarget::Form("form-1".into());

        let new = vec![
            FieldInput::new("Visit", FieldType::Date).with_column("visit"),
            FieldInput::from(&created.fields[0]).with_column("full_name"),
        ];
        let ids = tables
            .sync_fields(&target, &created.fields, &new)
            .await
            .unwrap();
        // Rename, delete age, add visit.
        assert_eq!(ids.len(), 3);
        assert_eq!(queue.status("form-1").await.unwrap().waiting, 3);

        queue.run_until_idle().await.unwrap();
        for id in ids {
            assert_eq!(queue.job(id).await.unwrap().status, JobStatus::Completed);
        }
        assert_eq!(
            column_names(&pool, "contact").await,
            vec!["id", "full_name", "created_at", "updated_at", "visit"]
        );
    }

    #[tokio::test]
    async fn test_drop_form_table_cancels_waiting_jobs() {
        let (_pool, tables, queue) = service().await;
        let created = tables.create_form_table(&contact_form()).await.unwrap();
        tables
            .sync_fields(&TableTarget::Form("form-1".into()), &created.fields, &[])
            .await
            .unwrap();

        tables.drop_form_table("form-1").await.unwrap();
        let counts = queue.status("form-1").await.unwrap();
        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.failed, 2);
    }
}
