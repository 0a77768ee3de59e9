//! Connection setup and system tables.
//!
//! System tables hold form registrations, the migration audit trail, column
//! backups, and the durable job queue. Timestamps are stored as RFC 3339
//! text with fixed microsecond precision so that they sort lexically.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::Result;

/// SQL creating every system table (SQLite).
pub const CREATE_SYSTEM_TABLES_SQL: [&str; 9] = [
    r"
CREATE TABLE IF NOT EXISTS forms (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    table_name TEXT UNIQUE,
    created_at TEXT NOT NULL
)
",
    r"
CREATE TABLE IF NOT EXISTS sub_forms (
    id TEXT PRIMARY KEY NOT NULL,
    form_id TEXT NOT NULL REFERENCES forms(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    table_name TEXT UNIQUE,
    created_at TEXT NOT NULL
)
",
    r"
CREATE TABLE IF NOT EXISTS submissions (
    id TEXT PRIMARY KEY NOT NULL,
    form_id TEXT NOT NULL,
    parent_id TEXT REFERENCES submissions(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
",
    r"
CREATE TABLE IF NOT EXISTS migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER,
    form_id TEXT NOT NULL,
    migration_type TEXT NOT NULL,
    table_name TEXT NOT NULL,
    column_name TEXT,
    old_column_name TEXT,
    old_data_type TEXT,
    new_data_type TEXT,
    field_id TEXT,
    status TEXT NOT NULL DEFAULT 'PENDING',
    error TEXT,
    backup_id INTEGER,
    rollback_backup_id INTEGER,
    created_at TEXT NOT NULL,
    executed_at TEXT,
    rolled_back_at TEXT
)
",
    r"
CREATE TABLE IF NOT EXISTS data_backups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    migration_id INTEGER,
    field_id TEXT,
    form_id TEXT NOT NULL,
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    column_type TEXT NOT NULL,
    data_snapshot TEXT NOT NULL,
    row_count INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    retention_until TEXT NOT NULL,
    restored_at TEXT,
    restoring INTEGER NOT NULL DEFAULT 0,
    legal_hold INTEGER NOT NULL DEFAULT 0
)
",
    r"
CREATE TABLE IF NOT EXISTS migration_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    form_id TEXT NOT NULL,
    table_name TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'waiting',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    available_at TEXT NOT NULL,
    last_error TEXT,
    migration_id INTEGER,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
)
",
    "CREATE INDEX IF NOT EXISTS idx_migration_jobs_claim ON migration_jobs (status, table_name, id)",
    "CREATE INDEX IF NOT EXISTS idx_migrations_form ON migrations (form_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_data_backups_form ON data_backups (form_id, retention_until)",
];

/// Names reserved for system tables; dynamic tables never take them.
pub const SYSTEM_TABLES: [&str; 6] = [
    "forms",
    "sub_forms",
    "submissions",
    "migrations",
    "data_backups",
    "migration_jobs",
];

/// Opens a pool for `url`, creating the database file if needed.
pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Ensures every system table exists. Idempotent.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    for sql in CREATE_SYSTEM_TABLES_SQL {
        sqlx::query(sql).execute(pool).await?;
    }
    Ok(())
}

/// Encodes a timestamp for storage.
#[must_use]
pub fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decodes a stored timestamp.
///
/// Falls back to SQLite's `datetime('now')` layout for rows written by SQL
/// defaults.
#[must_use]
pub fn decode_ts(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                .map(|dt| dt.and_utc())
                .ok()
        })
}

/// Decodes an optional stored timestamp.
#[must_use]
pub fn decode_opt_ts(text: Option<String>) -> Option<DateTime<Utc>> {
    text.as_deref().and_then(decode_ts)
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let pool = testing::pool().await;
        ensure_schema(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        for system in SYSTEM_TABLES {
            assert!(names.contains(&system), "missing {system}");
        }
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::milliseconds(1);
        assert!(encode_ts(a) < encode_ts(b));
        assert_eq!(decode_ts(&encode_ts(b)), Some(b));
    }

    #[test]
    fn test_decode_sqlite_default_layout() {
        let ts = decode_ts("2026-10-19 08:00:00").unwrap();
        assert_eq!(encode_ts(ts), "2026-10-19T08:00:00.000000Z");
    }
}
