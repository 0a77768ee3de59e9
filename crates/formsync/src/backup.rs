//! Column backups.
//!
//! A backup captures every `(row id, value)` pair of one column immediately
//! before the column is dropped or converted. Backups are kept until their
//! retention date; the sweep never deletes one that is being restored or is
//! under legal hold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::db::{decode_opt_ts, decode_ts, encode_ts};
use crate::dialect::MigrationDialect;
use crate::error::{MigrateError, Result};
use crate::schema::{CellValue, ColumnType};

const SELECT_BACKUP: &str = "SELECT id, migration_id, field_id, form_id, table_name, column_name, \
     column_type, data_snapshot, row_count, created_at, retention_until, restored_at, restoring, \
     legal_hold FROM data_backups";

/// One captured cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    /// Row id in the dynamic table.
    pub row_id: String,
    /// Value at capture time.
    pub value: CellValue,
}

/// A stored column backup.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBackup {
    /// Unique ID.
    pub id: i64,
    /// Migration that took the backup.
    pub migration_id: Option<i64>,
    /// Field whose column was captured.
    pub field_id: Option<String>,
    /// Owning form.
    pub form_id: String,
    /// Table the column belonged to.
    pub table_name: String,
    /// Captured column.
    pub column_name: String,
    /// Column type at capture time.
    pub column_type: ColumnType,
    /// Captured cells, ordered by row id.
    pub snapshot: Vec<SnapshotRow>,
    /// Number of captured rows.
    pub row_count: i64,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Earliest time the sweep may delete the backup.
    pub retention_until: DateTime<Utc>,
    /// Last restore time.
    pub restored_at: Option<DateTime<Utc>>,
    /// A restore is in progress.
    pub restoring: bool,
    /// Exempt from the retention sweep.
    pub legal_hold: bool,
}

impl DataBackup {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let column_type: String = row.try_get("column_type")?;
        let snapshot: String = row.try_get("data_snapshot")?;
        let created_at: String = row.try_get("created_at")?;
        let retention_until: String = row.try_get("retention_until")?;
        Ok(Self {
            id: row.try_get("id")?,
            migration_id: row.try_get("migration_id")?,
            field_id: row.try_get("field_id")?,
            form_id: row.try_get("form_id")?,
            table_name: row.try_get("table_name")?,
            column_name: row.try_get("column_name")?,
            column_type: column_type.parse()?,
            snapshot: serde_json::from_str(&snapshot)?,
            row_count: row.try_get("row_count")?,
            created_at: decode_ts(&created_at).unwrap_or_else(Utc::now),
            retention_until: decode_ts(&retention_until).unwrap_or_else(Utc::now),
            restored_at: decode_opt_ts(row.try_get("restored_at")?),
            restoring: row.try_get("restoring")?,
            legal_hold: row.try_get("legal_hold")?,
        })
    }
}

/// A backup about to be written.
#[derive(Debug, Clone)]
pub(crate) struct NewBackup<'a> {
    pub migration_id: Option<i64>,
    pub field_id: Option<&'a str>,
    pub form_id: &'a str,
    pub table_name: &'a str,
    pub column_name: &'a str,
    pub column_type: ColumnType,
    pub rows: &'a [SnapshotRow],
    pub retention: chrono::Duration,
}

/// Outcome of writing captured values back into a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Rows that received their captured value.
    pub restored: u64,
    /// Captured rows no longer present in the table.
    pub missing: u64,
}

/// Operator access to backups.
#[derive(Debug, Clone)]
pub struct BackupStore {
    pool: SqlitePool,
}

impl BackupStore {
    /// Creates a backup store.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Gets a backup by id.
    pub async fn get(&self, id: i64) -> Result<DataBackup> {
        let mut conn = self.pool.acquire().await?;
        fetch(&mut conn, id).await
    }

    /// Lists a form's backups still within retention, newest first.
    pub async fn active_for_form(&self, form_id: &str, now: DateTime<Utc>) -> Result<Vec<DataBackup>> {
        let sql = format!(
            "{SELECT_BACKUP} WHERE form_id = ? AND (retention_until > ? OR legal_hold = 1) \
             ORDER BY id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(form_id)
            .bind(encode_ts(now))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(DataBackup::from_row).collect()
    }

    /// Deletes backups past retention that are neither held nor being
    /// restored. Returns the number deleted.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM data_backups \
             WHERE retention_until <= ? AND restoring = 0 AND legal_hold = 0",
        )
        .bind(encode_ts(now))
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, "Swept expired backups");
        } else {
            debug!("No expired backups");
        }
        Ok(deleted)
    }

    /// Places or lifts a legal hold.
    pub async fn set_legal_hold(&self, id: i64, hold: bool) -> Result<()> {
        let result = sqlx::query("UPDATE data_backups SET legal_hold = ? WHERE id = ?")
            .bind(hold)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MigrateError::BackupNotFound(id));
        }
        info!(backup_id = id, hold, "Legal hold updated");
        Ok(())
    }

    /// Flags a backup as being restored, so the sweep leaves it alone.
    ///
    /// Committed on its own before the restore transaction starts.
    pub(crate) async fn begin_restore(&self, id: i64) -> Result<()> {
        let result =
            sqlx::query("UPDATE data_backups SET restoring = 1 WHERE id = ? AND restoring = 0")
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }
        // Distinguish a missing backup from one already being restored.
        self.get(id).await?;
        Err(MigrateError::InvalidState(format!(
            "backup {id} is already being restored"
        )))
    }

    /// Clears the restoring flag after a failed restore.
    pub(crate) async fn abort_restore(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE data_backups SET restoring = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Inserts a backup and returns its id.
pub(crate) async fn insert(conn: &mut SqliteConnection, backup: &NewBackup<'_>) -> Result<i64> {
    let now = Utc::now();
    let snapshot = serde_json::to_string(backup.rows)?;
    let row_count = i64::try_from(backup.rows.len())
        .map_err(|_| MigrateError::InvalidState("snapshot too large".to_string()))?;

    let result = sqlx::query(
        "INSERT INTO data_backups (migration_id, field_id, form_id, table_name, column_name, \
         column_type, data_snapshot, row_count, created_at, retention_until) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(backup.migration_id)
    .bind(backup.field_id)
    .bind(backup.form_id)
    .bind(backup.table_name)
    .bind(backup.column_name)
    .bind(backup.column_type.sql_name())
    .bind(snapshot)
    .bind(row_count)
    .bind(encode_ts(now))
    .bind(encode_ts(now + backup.retention))
    .execute(&mut *conn)
    .await?;

    let id = result.last_insert_rowid();
    debug!(
        backup_id = id,
        table = %backup.table_name,
        column = %backup.column_name,
        row_count,
        "Backup written"
    );
    Ok(id)
}

/// Fetches a backup by id.
pub(crate) async fn fetch(conn: &mut SqliteConnection, id: i64) -> Result<DataBackup> {
    let sql = format!("{SELECT_BACKUP} WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(MigrateError::BackupNotFound(id))?;
    DataBackup::from_row(&row)
}

/// Records a completed restore and clears the restoring flag.
pub(crate) async fn mark_restored(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    sqlx::query("UPDATE data_backups SET restored_at = ?, restoring = 0 WHERE id = ?")
        .bind(encode_ts(Utc::now()))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Reads every `(row id, value)` pair of a column.
pub(crate) async fn snapshot_column(
    conn: &mut SqliteConnection,
    dialect: &dyn MigrationDialect,
    table: &str,
    column: &str,
) -> Result<Vec<SnapshotRow>> {
    let rows = sqlx::query(&dialect.snapshot_sql(table, column))
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(snapshot_row).collect()
}

/// Decodes one snapshot row by its storage kind, so REAL and INTEGER
/// values keep their exact binary form.
fn snapshot_row(row: &SqliteRow) -> Result<SnapshotRow> {
    let row_id: String = row.try_get("row_id")?;
    let kind: String = row.try_get("kind")?;
    let value = match kind.as_str() {
        "null" => CellValue::Null,
        "integer" => CellValue::Integer(row.try_get_unchecked::<i64, _>("value")?),
        "real" => CellValue::Real(row.try_get_unchecked::<f64, _>("value")?),
        _ => CellValue::Text(row.try_get_unchecked::<String, _>("text")?),
    };
    Ok(SnapshotRow { row_id, value })
}

/// Writes values into a column by row id.
pub(crate) async fn write_values(
    conn: &mut SqliteConnection,
    dialect: &dyn MigrationDialect,
    table: &str,
    column: &str,
    rows: &[SnapshotRow],
) -> Result<WriteOutcome> {
    let sql = dialect.update_cell_sql(table, column);
    let mut outcome = WriteOutcome::default();
    for row in rows {
        let result = bind_cell(sqlx::query(&sql), &row.value)
            .bind(&row.row_id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            outcome.missing += 1;
        } else {
            outcome.restored += 1;
        }
    }
    Ok(outcome)
}

fn bind_cell<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q CellValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        CellValue::Null => query.bind(Option::<String>::None),
        CellValue::Integer(i) => query.bind(*i),
        CellValue::Real(r) => query.bind(*r),
        CellValue::Text(text) => query.bind(text.as_str()),
    }
}
