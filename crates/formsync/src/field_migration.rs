//! Execution of single schema changes against dynamic tables.
//!
//! Each operation is one transaction: the DDL, the backup that precedes any
//! destructive step, and the migration bookkeeping commit together or not at
//! all. Operations check the migration row and the live schema first, so a
//! job delivered twice finishes as SUCCESS without repeating its DDL.
//!
//! Only the migration queue calls into this module.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::backup::{self, BackupStore, NewBackup, SnapshotRow};
use crate::detector::Change;
use crate::dialect::MigrationDialect;
use crate::error::{MigrateError, Result};
use crate::history::{self, MigrationRecord, NewMigration};
use crate::naming::{is_valid_identifier, IdentifierNamer, NameContext, RETYPE_COLUMN};
use crate::operations::{MigrationStatus, MigrationType, SchemaOperation};
use crate::queue;
use crate::schema::{Cast, CellValue, ColumnInfo, ColumnSchema, ColumnType, FieldType};
use crate::tables::{execute_operation, table_columns};

/// Outcome of restoring a backup into its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// Restored backup.
    pub backup_id: i64,
    /// Target table.
    pub table_name: String,
    /// Target column.
    pub column_name: String,
    /// Rows that received their captured value.
    pub restored: u64,
    /// Captured rows no longer present.
    pub missing: u64,
    /// The column had been dropped and was re-created.
    pub recreated_column: bool,
}

/// Applies and reverts schema changes on one table at a time.
pub(crate) struct FieldMigrationService {
    pool: SqlitePool,
    dialect: Arc<dyn MigrationDialect>,
    namer: Arc<IdentifierNamer>,
    backups: BackupStore,
    retention: chrono::Duration,
}

impl FieldMigrationService {
    pub(crate) fn new(
        pool: SqlitePool,
        dialect: Arc<dyn MigrationDialect>,
        namer: Arc<IdentifierNamer>,
        retention: chrono::Duration,
    ) -> Self {
        let backups = BackupStore::new(pool.clone());
        Self {
            pool,
            dialect,
            namer,
            backups,
            retention,
        }
    }

    /// Records a PENDING migration for a change about to run and links it to
    /// its job in the same transaction.
    pub(crate) async fn begin(
        &self,
        job_id: Option<i64>,
        form_id: &str,
        table: &str,
        change: &Change,
    ) -> Result<i64> {
        let migration = new_migration(job_id, form_id, table, change);
        let mut tx = self.pool.begin().await?;
        let id = history::insert_pending(&mut tx, &migration).await?;
        if let Some(job_id) = job_id {
            queue::link_migration(&mut tx, job_id, id).await?;
        }
        tx.commit().await?;
        debug!(
            migration_id = id,
            table = %table,
            change = %change.describe(),
            "Migration recorded"
        );
        Ok(id)
    }

    /// Runs the change recorded as `migration_id`.
    pub(crate) async fn apply(&self, migration_id: i64, change: &Change) -> Result<MigrationRecord> {
        let record = self.record(migration_id).await?;
        if record.status.is_terminal() {
            info!(
                migration_id,
                status = %record.status,
                "Migration already finished, skipping"
            );
            return Ok(record);
        }

        match change {
            Change::AddField {
                title,
                column_name,
                field_type,
                ..
            } => {
                self.add_column(&record, title, column_name.as_deref(), *field_type)
                    .await?;
            }
            Change::DeleteField { column_name, .. } => {
                self.drop_column(&record, column_name).await?;
            }
            Change::RenameField {
                old_column,
                new_column,
                ..
            } => {
                self.rename_column(&record, old_column, new_column).await?;
            }
            Change::ChangeType {
                column_name,
                old_type,
                new_type,
                ..
            } => {
                self.change_type(&record, column_name, *old_type, *new_type)
                    .await?;
            }
        }

        self.record(migration_id).await
    }

    /// Records a migration as FAILED.
    pub(crate) async fn mark_failed(&self, migration_id: i64, error: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        history::mark_failed(&mut conn, migration_id, error).await?;
        warn!(migration_id, error = %error, "Migration failed");
        Ok(())
    }

    /// Adds a nullable column. The name is resolved from `title` when none is
    /// requested.
    pub(crate) async fn add_column(
        &self,
        record: &MigrationRecord,
        title: &str,
        requested: Option<&str>,
        field_type: FieldType,
    ) -> Result<()> {
        let table = record.table_name.as_str();
        let column_type = mirrored_type(field_type)?;

        // Naming may wait on the translator; never inside a transaction.
        let column = match requested {
            Some(name) => {
                validate_column_name(name)?;
                name.to_string()
            }
            None => {
                let existing = self.live_columns(table).await?;
                let used: HashSet<String> = existing.into_iter().map(|c| c.name).collect();
                self.namer.resolve(title, NameContext::Field, &used).await
            }
        };

        let mut tx = self.pool.begin().await?;
        if !still_pending(&mut tx, record.id).await? {
            return Ok(());
        }
        let live = table_columns(&mut tx, self.dialect.as_ref(), table).await?;
        ensure_table(&live, table)?;

        if let Some(existing) = find_column(&live, &column) {
            // Re-delivery lands here with the same type; anything else is a
            // different column under the same name.
            if requested.is_none() || existing.column_type() != Some(column_type) {
                return Err(MigrateError::DuplicateColumn {
                    table: table.to_string(),
                    column,
                });
            }
            info!(table = %table, column = %column, "Column already present, nothing to add");
        } else {
            let op = SchemaOperation::add_column(table, ColumnSchema::new(&column, column_type));
            execute_operation(&mut tx, self.dialect.as_ref(), &op).await?;
        }

        history::mark_success(&mut tx, record.id, &column, None).await?;
        tx.commit().await?;

        info!(
            migration_id = record.id,
            table = %table,
            column = %column,
            column_type = %column_type,
            "Column added"
        );
        Ok(())
    }

    /// Backs up and drops a column.
    pub(crate) async fn drop_column(&self, record: &MigrationRecord, column: &str) -> Result<()> {
        let table = record.table_name.as_str();
        let mut tx = self.pool.begin().await?;
        if !still_pending(&mut tx, record.id).await? {
            return Ok(());
        }
        let live = table_columns(&mut tx, self.dialect.as_ref(), table).await?;
        ensure_table(&live, table)?;

        let Some(info) = find_column(&live, column) else {
            history::mark_success(&mut tx, record.id, column, None).await?;
            tx.commit().await?;
            info!(table = %table, column = %column, "Column already absent, nothing to drop");
            return Ok(());
        };
        let column_type = info.column_type().unwrap_or(ColumnType::Text);

        let rows = backup::snapshot_column(&mut tx, self.dialect.as_ref(), table, column).await?;
        let backup_id = backup::insert(
            &mut tx,
            &NewBackup {
                migration_id: Some(record.id),
                field_id: record.field_id.as_deref(),
                form_id: &record.form_id,
                table_name: table,
                column_name: column,
                column_type,
                rows: &rows,
                retention: self.retention,
            },
        )
        .await?;

        execute_operation(
            &mut tx,
            self.dialect.as_ref(),
            &SchemaOperation::drop_column(table, column),
        )
        .await?;
        history::mark_success(&mut tx, record.id, column, Some(backup_id)).await?;
        tx.commit().await?;

        info!(
            migration_id = record.id,
            table = %table,
            column = %column,
            backup_id,
            rows = rows.len(),
            "Column dropped"
        );
        Ok(())
    }

    /// Renames a column. No backup: a rename is its own inverse.
    pub(crate) async fn rename_column(
        &self,
        record: &MigrationRecord,
        old_name: &str,
        new_name: &str,
    ) -> Result<()> {
        validate_column_name(new_name)?;
        let table = record.table_name.as_str();
        let mut tx = self.pool.begin().await?;
        if !still_pending(&mut tx, record.id).await? {
            return Ok(());
        }
        let live = table_columns(&mut tx, self.dialect.as_ref(), table).await?;
        ensure_table(&live, table)?;

        let op = SchemaOperation::rename_column(table, old_name, new_name);
        apply_rename(&mut tx, self.dialect.as_ref(), &live, &op).await?;
        history::mark_success(&mut tx, record.id, new_name, None).await?;
        tx.commit().await?;

        info!(
            migration_id = record.id,
            table = %table,
            from = %old_name,
            to = %new_name,
            "Column renamed"
        );
        Ok(())
    }

    /// Converts a column to the type of `new_type`.
    ///
    /// Every value is converted before any DDL runs; a single value that
    /// does not convert fails the whole change and leaves the column as it
    /// was.
    pub(crate) async fn change_type(
        &self,
        record: &MigrationRecord,
        column: &str,
        old_type: FieldType,
        new_type: FieldType,
    ) -> Result<()> {
        let table = record.table_name.as_str();
        let target = mirrored_type(new_type)?;

        let mut tx = self.pool.begin().await?;
        if !still_pending(&mut tx, record.id).await? {
            return Ok(());
        }
        let live = table_columns(&mut tx, self.dialect.as_ref(), table).await?;
        ensure_table(&live, table)?;
        let info = find_column(&live, column).ok_or_else(|| MigrateError::ColumnNotFound {
            table: table.to_string(),
            column: column.to_string(),
        })?;
        let source = info
            .column_type()
            .or_else(|| old_type.column_type())
            .unwrap_or(ColumnType::Text);

        if source == target {
            history::mark_success(&mut tx, record.id, column, None).await?;
            tx.commit().await?;
            info!(table = %table, column = %column, "Column already has the target type");
            return Ok(());
        }

        let rows = backup::snapshot_column(&mut tx, self.dialect.as_ref(), table, column).await?;
        let converted = convert_rows(&rows, Cast::between(source, target))?;

        let backup_id = backup::insert(
            &mut tx,
            &NewBackup {
                migration_id: Some(record.id),
                field_id: record.field_id.as_deref(),
                form_id: &record.form_id,
                table_name: table,
                column_name: column,
                column_type: source,
                rows: &rows,
                retention: self.retention,
            },
        )
        .await?;

        self.retype(&mut tx, table, column, target, &converted)
            .await?;
        history::mark_success(&mut tx, record.id, column, Some(backup_id)).await?;
        tx.commit().await?;

        info!(
            migration_id = record.id,
            table = %table,
            column = %column,
            from = %source,
            to = %target,
            backup_id,
            "Column type changed"
        );
        Ok(())
    }

    /// Reverts a SUCCESS migration and marks it ROLLED_BACK.
    pub(crate) async fn rollback(&self, migration_id: i64) -> Result<MigrationRecord> {
        let mut tx = self.pool.begin().await?;
        let record = history::fetch(&mut tx, migration_id).await?;
        match record.status {
            MigrationStatus::RolledBack => {
                info!(migration_id, "Migration already rolled back, skipping");
                return Ok(record);
            }
            MigrationStatus::Success => {}
            other => {
                return Err(MigrateError::InvalidState(format!(
                    "migration {migration_id} is {other}; only SUCCESS migrations can be rolled back"
                )));
            }
        }

        info!(
            migration_id,
            migration_type = %record.migration_type,
            table = %record.table_name,
            "Rolling back migration"
        );

        let column = record
            .column_name
            .clone()
            .ok_or_else(|| MigrateError::NotReversible(migration_id))?;
        let live = table_columns(&mut tx, self.dialect.as_ref(), &record.table_name).await?;
        ensure_table(&live, &record.table_name)?;

        let rollback_backup_id = match record.migration_type {
            MigrationType::AddField => {
                Some(self.undo_add(&mut tx, &record, &column, &live).await?)
            }
            MigrationType::DeleteField => {
                self.undo_delete(&mut tx, &record, &column, &live).await?;
                None
            }
            MigrationType::RenameField => {
                self.undo_rename(&mut tx, &record, &column, &live).await?;
                None
            }
            MigrationType::ChangeType => {
                self.undo_change_type(&mut tx, &record, &column, &live)
                    .await?;
                None
            }
        };

        history::mark_rolled_back(&mut tx, migration_id, rollback_backup_id).await?;
        tx.commit().await?;

        info!(migration_id, "Migration rolled back successfully");
        self.record(migration_id).await
    }

    /// Writes a backup's values back into its table, re-creating the column
    /// if it no longer exists.
    pub(crate) async fn restore_backup(&self, backup_id: i64) -> Result<RestoreReport> {
        self.backups.begin_restore(backup_id).await?;
        match self.restore_flagged(backup_id).await {
            Ok(report) => Ok(report),
            Err(e) => {
                if let Err(clear) = self.backups.abort_restore(backup_id).await {
                    warn!(backup_id, error = %clear, "Failed to clear restoring flag");
                }
                Err(e)
            }
        }
    }

    async fn restore_flagged(&self, backup_id: i64) -> Result<RestoreReport> {
        let mut tx = self.pool.begin().await?;
        let saved = backup::fetch(&mut tx, backup_id).await?;
        let table = saved.table_name.as_str();
        let column = saved.column_name.as_str();

        let live = table_columns(&mut tx, self.dialect.as_ref(), table).await?;
        ensure_table(&live, table)?;

        let (rows, recreated_column) = match find_column(&live, column) {
            None => {
                let op =
                    SchemaOperation::add_column(table, ColumnSchema::new(column, saved.column_type));
                execute_operation(&mut tx, self.dialect.as_ref(), &op).await?;
                (saved.snapshot.clone(), true)
            }
            Some(info) => match info.column_type() {
                Some(current) if current != saved.column_type => (
                    convert_rows(&saved.snapshot, Cast::between(saved.column_type, current))?,
                    false,
                ),
                _ => (saved.snapshot.clone(), false),
            },
        };

        let outcome =
            backup::write_values(&mut tx, self.dialect.as_ref(), table, column, &rows).await?;
        backup::mark_restored(&mut tx, backup_id).await?;
        tx.commit().await?;

        info!(
            backup_id,
            table = %table,
            column = %column,
            restored = outcome.restored,
            missing = outcome.missing,
            recreated_column,
            "Backup restored"
        );
        Ok(RestoreReport {
            backup_id,
            table_name: saved.table_name.clone(),
            column_name: saved.column_name.clone(),
            restored: outcome.restored,
            missing: outcome.missing,
            recreated_column,
        })
    }

    // The inverse of an add is a drop, so it takes a backup like any drop.
    async fn undo_add(
        &self,
        conn: &mut SqliteConnection,
        record: &MigrationRecord,
        column: &str,
        live: &[ColumnInfo],
    ) -> Result<i64> {
        let table = record.table_name.as_str();
        let Some(info) = find_column(live, column) else {
            return Err(MigrateError::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            });
        };
        let column_type = info
            .column_type()
            .or_else(|| record.new_data_type.and_then(|t| t.column_type()))
            .unwrap_or(ColumnType::Text);

        let rows = backup::snapshot_column(conn, self.dialect.as_ref(), table, column).await?;
        let backup_id = backup::insert(
            conn,
            &NewBackup {
                migration_id: Some(record.id),
                field_id: record.field_id.as_deref(),
                form_id: &record.form_id,
                table_name: table,
                column_name: column,
                column_type,
                rows: &rows,
                retention: self.retention,
            },
        )
        .await?;
        let op = SchemaOperation::add_column(table, ColumnSchema::new(column, column_type));
        let inverse = op
            .reverse()
            .ok_or(MigrateError::NotReversible(record.id))?;
        execute_operation(conn, self.dialect.as_ref(), &inverse).await?;
        Ok(backup_id)
    }

    async fn undo_delete(
        &self,
        conn: &mut SqliteConnection,
        record: &MigrationRecord,
        column: &str,
        live: &[ColumnInfo],
    ) -> Result<()> {
        let table = record.table_name.as_str();
        let backup_id = record
            .backup_id
            .ok_or(MigrateError::NotReversible(record.id))?;
        let saved = backup::fetch(conn, backup_id).await?;

        if has_column(live, column) {
            return Err(MigrateError::DuplicateColumn {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
        let op = SchemaOperation::add_column(table, ColumnSchema::new(column, saved.column_type));
        execute_operation(conn, self.dialect.as_ref(), &op).await?;
        let outcome =
            backup::write_values(conn, self.dialect.as_ref(), table, column, &saved.snapshot)
                .await?;
        backup::mark_restored(conn, backup_id).await?;

        debug!(
            table = %table,
            column = %column,
            restored = outcome.restored,
            missing = outcome.missing,
            "Dropped column restored"
        );
        Ok(())
    }

    async fn undo_rename(
        &self,
        conn: &mut SqliteConnection,
        record: &MigrationRecord,
        column: &str,
        live: &[ColumnInfo],
    ) -> Result<()> {
        let old_name = record
            .old_column_name
            .as_deref()
            .ok_or(MigrateError::NotReversible(record.id))?;
        let forward = SchemaOperation::rename_column(&record.table_name, old_name, column);
        let inverse = forward
            .reverse()
            .ok_or(MigrateError::NotReversible(record.id))?;
        apply_rename(conn, self.dialect.as_ref(), live, &inverse).await
    }

    // Rows captured by the backup get their original value; rows written
    // since are converted back.
    async fn undo_change_type(
        &self,
        conn: &mut SqliteConnection,
        record: &MigrationRecord,
        column: &str,
        live: &[ColumnInfo],
    ) -> Result<()> {
        let table = record.table_name.as_str();
        let backup_id = record
            .backup_id
            .ok_or(MigrateError::NotReversible(record.id))?;
        let saved = backup::fetch(conn, backup_id).await?;
        let info = find_column(live, column).ok_or_else(|| MigrateError::ColumnNotFound {
            table: table.to_string(),
            column: column.to_string(),
        })?;
        let current_type = info.column_type().unwrap_or(ColumnType::Text);

        let originals: HashMap<&str, &CellValue> = saved
            .snapshot
            .iter()
            .map(|row| (row.row_id.as_str(), &row.value))
            .collect();
        let cast_back = Cast::between(current_type, saved.column_type);
        let current = backup::snapshot_column(conn, self.dialect.as_ref(), table, column).await?;

        let rows = current
            .iter()
            .map(|row| match originals.get(row.row_id.as_str()) {
                Some(value) => Ok(SnapshotRow {
                    row_id: row.row_id.clone(),
                    value: (*value).clone(),
                }),
                None => convert_row(row, cast_back),
            })
            .collect::<Result<Vec<_>>>()?;

        self.retype(conn, table, column, saved.column_type, &rows)
            .await?;
        backup::mark_restored(conn, backup_id).await?;
        Ok(())
    }

    // SQLite cannot alter a column's type in place: build a replacement
    // column, fill it, and swap it in under the old name.
    async fn retype(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        column: &str,
        column_type: ColumnType,
        rows: &[SnapshotRow],
    ) -> Result<()> {
        let dialect = self.dialect.as_ref();
        execute_operation(
            conn,
            dialect,
            &SchemaOperation::add_column(table, ColumnSchema::new(RETYPE_COLUMN, column_type)),
        )
        .await?;
        backup::write_values(conn, dialect, table, RETYPE_COLUMN, rows).await?;
        execute_operation(conn, dialect, &SchemaOperation::drop_column(table, column)).await?;
        execute_operation(
            conn,
            dialect,
            &SchemaOperation::rename_column(table, RETYPE_COLUMN, column),
        )
        .await
    }

    async fn record(&self, migration_id: i64) -> Result<MigrationRecord> {
        let mut conn = self.pool.acquire().await?;
        history::fetch(&mut conn, migration_id).await
    }

    async fn live_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut conn = self.pool.acquire().await?;
        let live = table_columns(&mut conn, self.dialect.as_ref(), table).await?;
        ensure_table(&live, table)?;
        Ok(live)
    }
}

fn new_migration(job_id: Option<i64>, form_id: &str, table: &str, change: &Change) -> NewMigration {
    let mut migration = NewMigration {
        job_id,
        form_id: form_id.to_string(),
        migration_type: change.migration_type(),
        table_name: table.to_string(),
        column_name: None,
        old_column_name: None,
        old_data_type: None,
        new_data_type: None,
        field_id: change.field_id().map(str::to_string),
    };
    match change {
        Change::AddField {
            column_name,
            field_type,
            ..
        } => {
            migration.column_name.clone_from(column_name);
            migration.new_data_type = Some(*field_type);
        }
        Change::DeleteField {
            column_name,
            field_type,
            ..
        } => {
            migration.column_name = Some(column_name.clone());
            migration.old_data_type = Some(*field_type);
        }
        Change::RenameField {
            old_column,
            new_column,
            ..
        } => {
            migration.column_name = Some(new_column.clone());
            migration.old_column_name = Some(old_column.clone());
        }
        Change::ChangeType {
            column_name,
            old_type,
            new_type,
            ..
        } => {
            migration.column_name = Some(column_name.clone());
            migration.old_data_type = Some(*old_type);
            migration.new_data_type = Some(*new_type);
        }
    }
    migration
}

async fn still_pending(conn: &mut SqliteConnection, migration_id: i64) -> Result<bool> {
    let current = history::fetch(conn, migration_id).await?;
    if current.status == MigrationStatus::Pending {
        return Ok(true);
    }
    debug!(migration_id, status = %current.status, "Migration finished elsewhere");
    Ok(false)
}

async fn apply_rename(
    conn: &mut SqliteConnection,
    dialect: &dyn MigrationDialect,
    live: &[ColumnInfo],
    op: &SchemaOperation,
) -> Result<()> {
    let SchemaOperation::RenameColumn {
        table,
        old_name,
        new_name,
    } = op
    else {
        return Err(MigrateError::InvalidState(format!(
            "expected a rename, got: {}",
            op.describe()
        )));
    };

    match (has_column(live, old_name), has_column(live, new_name)) {
        (true, false) => execute_operation(conn, dialect, op).await,
        (false, true) => {
            info!(table = %table, column = %new_name, "Column already renamed");
            Ok(())
        }
        (true, true) => Err(MigrateError::DuplicateColumn {
            table: table.clone(),
            column: new_name.clone(),
        }),
        (false, false) => Err(MigrateError::ColumnNotFound {
            table: table.clone(),
            column: old_name.clone(),
        }),
    }
}

fn convert_rows(rows: &[SnapshotRow], cast: Cast) -> Result<Vec<SnapshotRow>> {
    rows.iter().map(|row| convert_row(row, cast)).collect()
}

fn convert_row(row: &SnapshotRow, cast: Cast) -> Result<SnapshotRow> {
    let value = cast
        .apply(&row.value)
        .ok_or_else(|| MigrateError::InvalidCast {
            row_id: row.row_id.clone(),
            value: row.value.to_text(),
            target: cast.to.to_string(),
        })?;
    Ok(SnapshotRow {
        row_id: row.row_id.clone(),
        value,
    })
}

fn mirrored_type(field_type: FieldType) -> Result<ColumnType> {
    field_type.column_type().ok_or_else(|| {
        MigrateError::InvalidState(format!("{field_type} fields are not mirrored into tables"))
    })
}

fn validate_column_name(name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(MigrateError::InvalidState(format!(
            "'{name}' is not a valid column name"
        )))
    }
}

fn ensure_table(live: &[ColumnInfo], table: &str) -> Result<()> {
    if live.is_empty() {
        return Err(MigrateError::TableMissing(table.to_string()));
    }
    Ok(())
}

fn find_column<'a>(live: &'a [ColumnInfo], column: &str) -> Option<&'a ColumnInfo> {
    live.iter().find(|c| c.name == column)
}

fn has_column(live: &[ColumnInfo], column: &str) -> bool {
    find_column(live, column).is_some()
}
