//! Schema synchronization for per-form mirror tables.
//!
//! Form submissions are stored generically, and each form is also mirrored
//! into a flat table so reporting tools can query it directly. `formsync`
//! keeps those tables' schemas in step with the forms' evolving field lists:
//!
//! - **Naming** - turns (often Thai) titles into bounded, unique SQL
//!   identifiers, falling back to transliteration when the dictionary and
//!   translator have no answer
//! - **Detector** - diffs an old and a new field list into ordered changes
//! - **Field migrations** - applies one change per transaction, backing up
//!   column data before anything destructive, with rollback and restore
//! - **Queue** - a durable job queue that runs changes to one table strictly
//!   in order while different tables proceed in parallel
//! - **Tables** - creates and drops form and sub-form tables and is the
//!   only entry point for column changes
//!
//! # Example
//!
//! ```rust,ignore
//! use formsync::prelude::*;
//!
//! let engine = Engine::open(Config::default()).await?;
//! let form = FormSchema::new("form-1", "Contact")
//!     .field(FieldInput::new("ชื่อ", FieldType::ShortAnswer).with_id("f-name"));
//! let table = engine.tables().create_form_table(&form).await?;
//!
//! // After the form builder commits an edit:
//! let target = TableTarget::Form("form-1".into());
//! let new = vec![FieldInput::from(&table.fields[0]).with_column("full_name")];
//! engine.tables().sync_fields(&target, &table.fields, &new).await?;
//!
//! // Elsewhere, a worker process drains the queue.
//! engine.queue().run(shutdown).await?;
//! ```

pub mod backup;
pub mod config;
pub mod db;
pub mod detector;
pub mod dialect;
pub mod error;
mod field_migration;
pub mod history;
pub mod naming;
pub mod operations;
pub mod queue;
pub mod schema;
pub mod tables;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backup::BackupStore;
use crate::config::Config;
use crate::dialect::{MigrationDialect, SqliteDialect};
use crate::error::Result;
use crate::field_migration::FieldMigrationService;
use crate::history::MigrationHistory;
use crate::naming::IdentifierNamer;
use crate::queue::MigrationQueue;
use crate::tables::DynamicTableService;

pub use crate::field_migration::RestoreReport;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backup::{BackupStore, DataBackup, SnapshotRow};
    pub use crate::config::Config;
    pub use crate::detector::{Change, ChangeDetector};
    pub use crate::dialect::{MigrationDialect, SqliteDialect};
    pub use crate::error::{ErrorClass, MigrateError, Result};
    pub use crate::history::{HistoryFilter, HistoryPage, MigrationHistory, MigrationRecord};
    pub use crate::naming::{IdentifierNamer, NameContext, Translation, Translator};
    pub use crate::operations::{MigrationStatus, MigrationType};
    pub use crate::queue::{JobKind, JobStatus, MigrationJob, MigrationQueue, NewJob, QueueCounts};
    pub use crate::schema::{
        CellValue, ColumnType, FieldDefinition, FieldInput, FieldType, FormSchema, SubFormSchema,
    };
    pub use crate::tables::{DynamicTableService, MaterializedTable, TableTarget};
    pub use crate::Engine;
}

/// The wired-up engine. All services share one pool.
#[derive(Debug, Clone)]
pub struct Engine {
    pool: SqlitePool,
    config: Config,
    namer: Arc<IdentifierNamer>,
    tables: DynamicTableService,
    queue: MigrationQueue,
    history: MigrationHistory,
    backups: BackupStore,
}

impl Engine {
    /// Connects to the configured database and prepares the system tables.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config.database.url, config.database.max_connections).await?;
        Self::with_pool(pool, config).await
    }

    /// Builds an engine on an existing pool, naming with the configured
    /// dictionary and translator.
    pub async fn with_pool(pool: SqlitePool, config: Config) -> Result<Self> {
        let namer = IdentifierNamer::from_config(&config.naming)?;
        Self::with_namer(pool, config, namer).await
    }

    /// Builds an engine with a caller-supplied namer.
    pub async fn with_namer(pool: SqlitePool, config: Config, namer: IdentifierNamer) -> Result<Self> {
        db::ensure_schema(&pool).await?;

        let dialect: Arc<dyn MigrationDialect> = Arc::new(SqliteDialect::new());
        let namer = Arc::new(namer);
        let executor = FieldMigrationService::new(
            pool.clone(),
            Arc::clone(&dialect),
            Arc::clone(&namer),
            config.retention.period(),
        );
        let queue = MigrationQueue::new(pool.clone(), executor, config.queue.clone());
        let tables =
            DynamicTableService::new(pool.clone(), dialect, Arc::clone(&namer), queue.clone());

        Ok(Self {
            history: MigrationHistory::new(pool.clone()),
            backups: BackupStore::new(pool.clone()),
            pool,
            config,
            namer,
            tables,
            queue,
        })
    }

    /// The database pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Identifier naming.
    #[must_use]
    pub fn namer(&self) -> &IdentifierNamer {
        &self.namer
    }

    /// Table lifecycle and column change entry point.
    #[must_use]
    pub fn tables(&self) -> &DynamicTableService {
        &self.tables
    }

    /// The migration queue.
    #[must_use]
    pub fn queue(&self) -> &MigrationQueue {
        &self.queue
    }

    /// Migration history queries.
    #[must_use]
    pub fn history(&self) -> &MigrationHistory {
        &self.history
    }

    /// Backup queries and retention.
    #[must_use]
    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Deletes expired backups now.
    pub async fn sweep_backups(&self) -> Result<u64> {
        self.backups.sweep_expired(Utc::now()).await
    }

    /// Sweeps expired backups on the configured interval until `shutdown`
    /// is cancelled. Sweep failures are logged and retried next interval.
    pub async fn run_retention(&self, shutdown: CancellationToken) {
        let every = Duration::from_secs(self.config.retention.sweep_interval_secs.max(1));
        info!(interval_secs = every.as_secs(), "Backup retention sweep started");
        loop {
            if let Err(e) = self.sweep_backups().await {
                warn!(error = %e, "Backup sweep failed");
            }
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(every) => {}
            }
        }
    }

    /// Runs queue workers and the retention sweep until `shutdown` is
    /// cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let retention = {
            let engine = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { engine.run_retention(shutdown).await })
        };
        let outcome = self.queue.run(shutdown).await;
        if let Err(e) = retention.await {
            warn!(error = %e, "Retention task ended abnormally");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;
    use crate::prelude::*;

    #[tokio::test]
    async fn test_engine_wires_services() {
        let pool = testing::pool().await;
        let engine = Engine::with_namer(pool, Config::default(), IdentifierNamer::default())
            .await
            .unwrap();

        let form = FormSchema::new("form-1", "Contact")
            .field(FieldInput::new("Email", FieldType::Email).with_id("f-email"));
        let table = engine.tables().create_form_table(&form).await.unwrap();
        assert_eq!(table.fields[0].column_name, "email");

        let target = TableTarget::Form("form-1".into());
        engine
            .tables()
            .sync_fields(&target, &table.fields, &[])
            .await
            .unwrap();
        assert_eq!(engine.queue().run_until_idle().await.unwrap(), 1);

        let page = engine
            .history()
            .list(&HistoryFilter::default().form("form-1"))
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].migration_type, MigrationType::DeleteField);
        assert_eq!(
            engine
                .backups()
                .active_for_form("form-1", Utc::now())
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(engine.sweep_backups().await.unwrap(), 0);
    }
}
