//! Migration history.
//!
//! Every schema change executed against a dynamic table leaves one row in the
//! `migrations` table. Rows are created PENDING when a queue job is picked
//! up, moved to a terminal state by the field migration service, and never
//! deleted.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;

use crate::db::{decode_opt_ts, decode_ts, encode_ts};
use crate::error::{MigrateError, Result};
use crate::operations::{MigrationStatus, MigrationType};
use crate::schema::FieldType;

const SELECT_MIGRATION: &str = "SELECT id, job_id, form_id, migration_type, table_name, \
     column_name, old_column_name, old_data_type, new_data_type, field_id, status, error, \
     backup_id, rollback_backup_id, created_at, executed_at, rolled_back_at FROM migrations";

/// A recorded migration.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    /// Unique ID.
    pub id: i64,
    /// Queue job that created the record.
    pub job_id: Option<i64>,
    /// Owning form.
    pub form_id: String,
    /// Kind of change.
    pub migration_type: MigrationType,
    /// Target table.
    pub table_name: String,
    /// Column affected; for an add, known once the name is resolved.
    pub column_name: Option<String>,
    /// Previous column name (renames).
    pub old_column_name: Option<String>,
    /// Field type before the change.
    pub old_data_type: Option<FieldType>,
    /// Field type after the change.
    pub new_data_type: Option<FieldType>,
    /// Field identity.
    pub field_id: Option<String>,
    /// Lifecycle state.
    pub status: MigrationStatus,
    /// Failure detail.
    pub error: Option<String>,
    /// Backup taken before a destructive change.
    pub backup_id: Option<i64>,
    /// Backup taken when rolling back an add.
    pub rollback_backup_id: Option<i64>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the change reached a terminal state.
    pub executed_at: Option<DateTime<Utc>>,
    /// When the change was rolled back.
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl MigrationRecord {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let migration_type: String = row.try_get("migration_type")?;
        let status: String = row.try_get("status")?;
        let created_at: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            form_id: row.try_get("form_id")?,
            migration_type: migration_type.parse()?,
            table_name: row.try_get("table_name")?,
            column_name: row.try_get("column_name")?,
            old_column_name: row.try_get("old_column_name")?,
            old_data_type: parse_field_type(row.try_get("old_data_type")?)?,
            new_data_type: parse_field_type(row.try_get("new_data_type")?)?,
            field_id: row.try_get("field_id")?,
            status: status.parse()?,
            error: row.try_get("error")?,
            backup_id: row.try_get("backup_id")?,
            rollback_backup_id: row.try_get("rollback_backup_id")?,
            created_at: decode_ts(&created_at).unwrap_or_else(Utc::now),
            executed_at: decode_opt_ts(row.try_get("executed_at")?),
            rolled_back_at: decode_opt_ts(row.try_get("rolled_back_at")?),
        })
    }
}

fn parse_field_type(text: Option<String>) -> Result<Option<FieldType>> {
    text.map(|t| t.parse()).transpose()
}

/// A migration about to be recorded as PENDING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMigration {
    /// Queue job, if any.
    pub job_id: Option<i64>,
    /// Owning form.
    pub form_id: String,
    /// Kind of change.
    pub migration_type: MigrationType,
    /// Target table.
    pub table_name: String,
    /// Column, when already known.
    pub column_name: Option<String>,
    /// Previous column name (renames).
    pub old_column_name: Option<String>,
    /// Field type before the change.
    pub old_data_type: Option<FieldType>,
    /// Field type after the change.
    pub new_data_type: Option<FieldType>,
    /// Field identity.
    pub field_id: Option<String>,
}

/// Filter for paged history queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryFilter {
    /// Only this form.
    pub form_id: Option<String>,
    /// Only this status.
    pub status: Option<MigrationStatus>,
    /// 1-based page number.
    pub page: u32,
    /// Rows per page.
    pub per_page: u32,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            form_id: None,
            status: None,
            page: 1,
            per_page: 50,
        }
    }
}

impl HistoryFilter {
    /// Restricts to one form.
    #[must_use]
    pub fn form(mut self, form_id: impl Into<String>) -> Self {
        self.form_id = Some(form_id.into());
        self
    }

    /// Restricts to one status.
    #[must_use]
    pub fn status(mut self, status: MigrationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Selects a page.
    #[must_use]
    pub fn page(mut self, page: u32, per_page: u32) -> Self {
        self.page = page.max(1);
        self.per_page = per_page.max(1);
        self
    }
}

/// One page of history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    /// Records on this page, newest first.
    pub items: Vec<MigrationRecord>,
    /// Records matching the filter across all pages.
    pub total: i64,
    /// Page number.
    pub page: u32,
    /// Rows per page.
    pub per_page: u32,
}

/// Read access to the migration history.
#[derive(Debug, Clone)]
pub struct MigrationHistory {
    pool: SqlitePool,
}

impl MigrationHistory {
    /// Creates a history reader.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Gets a migration by id.
    pub async fn get(&self, id: i64) -> Result<MigrationRecord> {
        let mut conn = self.pool.acquire().await?;
        fetch(&mut conn, id).await
    }

    /// Lists migrations matching `filter`, newest first.
    pub async fn list(&self, filter: &HistoryFilter) -> Result<HistoryPage> {
        let status = filter.status.map(|s| s.as_str());
        let page = filter.page.max(1);
        let per_page = filter.per_page.max(1);

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM migrations \
             WHERE (?1 IS NULL OR form_id = ?1) AND (?2 IS NULL OR status = ?2)",
        )
        .bind(filter.form_id.as_deref())
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            "{SELECT_MIGRATION} WHERE (?1 IS NULL OR form_id = ?1) AND (?2 IS NULL OR status = ?2) \
             ORDER BY id DESC LIMIT ?3 OFFSET ?4"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.form_id.as_deref())
            .bind(status)
            .bind(i64::from(per_page))
            .bind(i64::from(page - 1) * i64::from(per_page))
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .iter()
            .map(MigrationRecord::from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(HistoryPage {
            items,
            total,
            page,
            per_page,
        })
    }

    /// Lists every migration of a form, oldest first.
    pub async fn for_form(&self, form_id: &str) -> Result<Vec<MigrationRecord>> {
        let sql = format!("{SELECT_MIGRATION} WHERE form_id = ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(form_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(MigrationRecord::from_row).collect()
    }
}

/// Inserts a PENDING migration and returns its id.
pub(crate) async fn insert_pending(
    conn: &mut SqliteConnection,
    migration: &NewMigration,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO migrations (job_id, form_id, migration_type, table_name, column_name, \
         old_column_name, old_data_type, new_data_type, field_id, status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(migration.job_id)
    .bind(&migration.form_id)
    .bind(migration.migration_type.as_str())
    .bind(&migration.table_name)
    .bind(migration.column_name.as_deref())
    .bind(migration.old_column_name.as_deref())
    .bind(migration.old_data_type.map(|t| t.as_str()))
    .bind(migration.new_data_type.map(|t| t.as_str()))
    .bind(migration.field_id.as_deref())
    .bind(MigrationStatus::Pending.as_str())
    .bind(encode_ts(Utc::now()))
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Fetches a migration by id.
pub(crate) async fn fetch(conn: &mut SqliteConnection, id: i64) -> Result<MigrationRecord> {
    let sql = format!("{SELECT_MIGRATION} WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(MigrateError::MigrationNotFound(id))?;
    MigrationRecord::from_row(&row)
}

/// Moves a PENDING migration to SUCCESS.
pub(crate) async fn mark_success(
    conn: &mut SqliteConnection,
    id: i64,
    column_name: &str,
    backup_id: Option<i64>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE migrations SET status = ?, column_name = ?, backup_id = ?, executed_at = ?, \
         error = NULL WHERE id = ? AND status = ?",
    )
    .bind(MigrationStatus::Success.as_str())
    .bind(column_name)
    .bind(backup_id)
    .bind(encode_ts(Utc::now()))
    .bind(id)
    .bind(MigrationStatus::Pending.as_str())
    .execute(&mut *conn)
    .await?;
    expect_transition(conn, id, result.rows_affected(), MigrationStatus::Success).await
}

/// Moves a PENDING migration to FAILED.
pub(crate) async fn mark_failed(conn: &mut SqliteConnection, id: i64, error: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE migrations SET status = ?, error = ?, executed_at = ? WHERE id = ? AND status = ?",
    )
    .bind(MigrationStatus::Failed.as_str())
    .bind(error)
    .bind(encode_ts(Utc::now()))
    .bind(id)
    .bind(MigrationStatus::Pending.as_str())
    .execute(&mut *conn)
    .await?;
    expect_transition(conn, id, result.rows_affected(), MigrationStatus::Failed).await
}

/// Moves a SUCCESS migration to ROLLED_BACK.
pub(crate) async fn mark_rolled_back(
    conn: &mut SqliteConnection,
    id: i64,
    rollback_backup_id: Option<i64>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE migrations SET status = ?, rollback_backup_id = ?, rolled_back_at = ? \
         WHERE id = ? AND status = ?",
    )
    .bind(MigrationStatus::RolledBack.as_str())
    .bind(rollback_backup_id)
    .bind(encode_ts(Utc::now()))
    .bind(id)
    .bind(MigrationStatus::Success.as_str())
    .execute(&mut *conn)
    .await?;
    expect_transition(conn, id, result.rows_affected(), MigrationStatus::RolledBack).await
}

async fn expect_transition(
    conn: &mut SqliteConnection,
    id: i64,
    rows_affected: u64,
    next: MigrationStatus,
) -> Result<()> {
    if rows_affected > 0 {
        return Ok(());
    }
    let current = fetch(conn, id).await?;
    Err(MigrateError::InvalidState(format!(
        "migration {id} cannot move from {} to {next}",
        current.status
    )))
}
