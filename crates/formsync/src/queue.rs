//! Durable, per-table serialized migration queue.
//!
//! Jobs live in the `migration_jobs` table. A job is claimable once it is
//! due and no job on the same table is active or was enqueued before it and
//! is still waiting, so changes to one table run strictly in enqueue order
//! while different tables proceed in parallel.
//!
//! Only transient failures are retried. A job left `active` by a crash is
//! returned to `waiting` by [`MigrationQueue::recover`]; the idempotent
//! migration operations make the re-delivery safe.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backup;
use crate::config::QueueConfig;
use crate::db::{decode_opt_ts, decode_ts, encode_ts};
use crate::detector::Change;
use crate::error::{MigrateError, Result};
use crate::field_migration::FieldMigrationService;
use crate::history;

const SELECT_JOB: &str = "SELECT id, form_id, table_name, payload, status, attempts, \
     max_attempts, available_at, last_error, migration_id, created_at, started_at, finished_at \
     FROM migration_jobs";

// Claims the oldest due job whose table has no active job and no older
// waiting job, in one statement so two workers never claim the same row.
const CLAIM_SQL: &str = "UPDATE migration_jobs \
     SET status = 'active', attempts = attempts + 1, finished_at = NULL \
     WHERE id = ( \
         SELECT j.id FROM migration_jobs j \
         WHERE j.status = 'waiting' AND j.available_at <= ?1 \
           AND NOT EXISTS ( \
               SELECT 1 FROM migration_jobs o \
               WHERE o.table_name = j.table_name \
                 AND (o.status = 'active' OR (o.status = 'waiting' AND o.id < j.id)) \
           ) \
         ORDER BY j.id LIMIT 1 \
     ) \
     RETURNING id";

/// What a job does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Apply one detected change.
    Apply {
        /// The change.
        change: Change,
    },
    /// Revert a SUCCESS migration.
    Rollback {
        /// Migration to revert.
        migration_id: i64,
    },
    /// Write a backup back into its table.
    Restore {
        /// Backup to restore.
        backup_id: i64,
    },
}

impl JobKind {
    fn describe(&self) -> String {
        match self {
            Self::Apply { change } => change.describe(),
            Self::Rollback { migration_id } => format!("Rollback migration {migration_id}"),
            Self::Restore { backup_id } => format!("Restore backup {backup_id}"),
        }
    }
}

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Enqueued or scheduled for retry.
    Waiting,
    /// Claimed by a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished with a terminal error, or cancelled before it started.
    Failed,
}

impl JobStatus {
    /// Returns the stored status name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(MigrateError::InvalidState(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// A job to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    /// Owning form.
    pub form_id: String,
    /// Target table; jobs on one table never overlap.
    pub table_name: String,
    /// Work to do.
    pub kind: JobKind,
}

impl NewJob {
    /// A job applying `change` to `table_name`.
    pub fn apply(form_id: impl Into<String>, table_name: impl Into<String>, change: Change) -> Self {
        Self {
            form_id: form_id.into(),
            table_name: table_name.into(),
            kind: JobKind::Apply { change },
        }
    }
}

/// A queued job as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationJob {
    /// Job id; defines order within a table.
    pub id: i64,
    /// Owning form.
    pub form_id: String,
    /// Target table.
    pub table_name: String,
    /// Work to do.
    pub kind: JobKind,
    /// Current status.
    pub status: JobStatus,
    /// Attempts started so far.
    pub attempts: u32,
    /// Attempt limit for transient failures.
    pub max_attempts: u32,
    /// Earliest time the job may be claimed.
    pub available_at: DateTime<Utc>,
    /// Error of the latest failed attempt.
    pub last_error: Option<String>,
    /// Migration created for an apply job.
    pub migration_id: Option<i64>,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// Start of the latest attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// End of the latest attempt.
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationJob {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let payload: String = row.try_get("payload")?;
        let status: String = row.try_get("status")?;
        let available_at: String = row.try_get("available_at")?;
        let created_at: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            form_id: row.try_get("form_id")?,
            table_name: row.try_get("table_name")?,
            kind: serde_json::from_str(&payload)?,
            status: status.parse()?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            available_at: decode_ts(&available_at).unwrap_or_default(),
            last_error: row.try_get("last_error")?,
            migration_id: row.try_get("migration_id")?,
            created_at: decode_ts(&created_at).unwrap_or_default(),
            started_at: decode_opt_ts(row.try_get("started_at")?),
            finished_at: decode_opt_ts(row.try_get("finished_at")?),
        })
    }
}

/// Per-form job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Waiting, including scheduled retries.
    pub waiting: u64,
    /// Running now.
    pub active: u64,
    /// Terminally failed or cancelled.
    pub failed: u64,
    /// Finished successfully.
    pub completed: u64,
}

/// Durable migration queue and its worker pool.
///
/// Cloning is cheap; clones share the same queue.
#[derive(Clone)]
pub struct MigrationQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    pool: SqlitePool,
    service: FieldMigrationService,
    config: QueueConfig,
    wakeup: Notify,
}

impl fmt::Debug for MigrationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationQueue")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl MigrationQueue {
    pub(crate) fn new(pool: SqlitePool, service: FieldMigrationService, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pool,
                service,
                config,
                wakeup: Notify::new(),
            }),
        }
    }

    /// Queue settings.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Enqueues one job and returns its id.
    pub async fn enqueue(&self, job: &NewJob) -> Result<i64> {
        let mut conn = self.inner.pool.acquire().await?;
        let id = self.insert_job(&mut conn, job).await?;
        self.inner.wakeup.notify_waiters();
        Ok(id)
    }

    /// Enqueues jobs atomically, preserving their order.
    pub async fn enqueue_batch(&self, jobs: &[NewJob]) -> Result<Vec<i64>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.inner.pool.begin().await?;
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(self.insert_job(&mut tx, job).await?);
        }
        tx.commit().await?;
        self.inner.wakeup.notify_waiters();
        Ok(ids)
    }

    /// Enqueues a rollback of a SUCCESS migration on its table's partition.
    pub async fn rollback_job(&self, migration_id: i64) -> Result<i64> {
        let record = {
            let mut conn = self.inner.pool.acquire().await?;
            history::fetch(&mut conn, migration_id).await?
        };
        self.enqueue(&NewJob {
            form_id: record.form_id,
            table_name: record.table_name,
            kind: JobKind::Rollback { migration_id },
        })
        .await
    }

    /// Enqueues a restore of a backup on its table's partition.
    pub async fn restore_job(&self, backup_id: i64) -> Result<i64> {
        let saved = {
            let mut conn = self.inner.pool.acquire().await?;
            backup::fetch(&mut conn, backup_id).await?
        };
        self.enqueue(&NewJob {
            form_id: saved.form_id,
            table_name: saved.table_name,
            kind: JobKind::Restore { backup_id },
        })
        .await
    }

    /// Job counts for a form.
    pub async fn status(&self, form_id: &str) -> Result<QueueCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM migration_jobs WHERE form_id = ? GROUP BY status",
        )
        .bind(form_id)
        .fetch_all(&self.inner.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or_default();
            match status.parse::<JobStatus>()? {
                JobStatus::Waiting => counts.waiting = count,
                JobStatus::Active => counts.active = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    /// Drops a form's jobs that have not started yet, e.g. after its
    /// triggering update failed. Returns the number cancelled.
    pub async fn cancel_waiting(&self, form_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE migration_jobs SET status = 'failed', last_error = 'cancelled', \
             finished_at = ? WHERE form_id = ? AND status = 'waiting'",
        )
        .bind(encode_ts(Utc::now()))
        .bind(form_id)
        .execute(&self.inner.pool)
        .await?;
        if result.rows_affected() > 0 {
            info!(form_id, cancelled = result.rows_affected(), "Waiting jobs cancelled");
        }
        Ok(result.rows_affected())
    }

    /// Fetches a job.
    pub async fn job(&self, id: i64) -> Result<MigrationJob> {
        let sql = format!("{SELECT_JOB} WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.inner.pool)
            .await?
            .ok_or(MigrateError::JobNotFound(id))?;
        MigrationJob::from_row(&row)
    }

    /// All jobs of a form, oldest first.
    pub async fn jobs_for_form(&self, form_id: &str) -> Result<Vec<MigrationJob>> {
        let sql = format!("{SELECT_JOB} WHERE form_id = ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(form_id)
            .fetch_all(&self.inner.pool)
            .await?;
        rows.iter().map(MigrationJob::from_row).collect()
    }

    /// Returns jobs left active by a previous process to `waiting`.
    pub async fn recover(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE migration_jobs SET status = 'waiting', started_at = NULL \
             WHERE status = 'active'",
        )
        .execute(&self.inner.pool)
        .await?;
        if result.rows_affected() > 0 {
            warn!(recovered = result.rows_affected(), "Re-delivering interrupted jobs");
        }
        Ok(result.rows_affected())
    }

    /// Claims the next runnable job, if any.
    pub async fn claim(&self) -> Result<Option<MigrationJob>> {
        let claimed: Option<i64> = sqlx::query_scalar(CLAIM_SQL)
            .bind(encode_ts(Utc::now()))
            .fetch_optional(&self.inner.pool)
            .await?;
        match claimed {
            Some(id) => Ok(Some(self.job(id).await?)),
            None => Ok(None),
        }
    }

    /// Runs a claimed job and records its outcome. Returns the job's new
    /// status; `Waiting` means a retry was scheduled.
    ///
    /// The job's own failure is recorded on the job row. When recording an
    /// outcome fails, the job is handed back to the queue instead of being
    /// left active; an error means even that failed.
    pub async fn process(&self, job: MigrationJob) -> Result<JobStatus> {
        let span = info_span!(
            "migration_job",
            job_id = job.id,
            table = %job.table_name,
            attempt = job.attempts
        );
        let status = async {
            match self.process_inner(&job).await {
                Ok(status) => Ok(status),
                Err(e) => self.release(&job, e).await,
            }
        }
        .instrument(span)
        .await;
        self.inner.wakeup.notify_waiters();
        status
    }

    async fn process_inner(&self, job: &MigrationJob) -> Result<JobStatus> {
        info!(job = %job.kind.describe(), "Processing job");
        // Stamped after the claim committed, so never before the previous
        // job on the table finished.
        sqlx::query("UPDATE migration_jobs SET started_at = ? WHERE id = ?")
            .bind(encode_ts(Utc::now()))
            .bind(job.id)
            .execute(&self.inner.pool)
            .await?;
        let mut migration_id = job.migration_id;

        let outcome = self.execute(job, &mut migration_id).await;
        let now = Utc::now();
        match outcome {
            Ok(()) => {
                sqlx::query(
                    "UPDATE migration_jobs SET status = 'completed', finished_at = ?, \
                     last_error = NULL WHERE id = ?",
                )
                .bind(encode_ts(now))
                .bind(job.id)
                .execute(&self.inner.pool)
                .await?;
                info!("Job completed");
                Ok(JobStatus::Completed)
            }
            Err(e) if e.is_transient() && job.attempts < job.max_attempts => {
                let delay = self.inner.config.backoff(job.attempts);
                let retry_at = retry_at(now, delay);
                sqlx::query(
                    "UPDATE migration_jobs SET status = 'waiting', available_at = ?, \
                     finished_at = ?, last_error = ? WHERE id = ?",
                )
                .bind(encode_ts(retry_at))
                .bind(encode_ts(now))
                .bind(e.to_string())
                .bind(job.id)
                .execute(&self.inner.pool)
                .await?;
                warn!(
                    error = %e,
                    attempts = job.attempts,
                    retry_in_ms = delay.as_millis(),
                    "Transient failure, retrying"
                );
                Ok(JobStatus::Waiting)
            }
            Err(e) => {
                let message = e.to_string();
                if let Some(id) = migration_id {
                    if let Err(mark) = self.inner.service.mark_failed(id, &message).await {
                        warn!(migration_id = id, error = %mark, "Could not mark migration failed");
                    }
                }
                sqlx::query(
                    "UPDATE migration_jobs SET status = 'failed', finished_at = ?, \
                     last_error = ? WHERE id = ?",
                )
                .bind(encode_ts(now))
                .bind(&message)
                .bind(job.id)
                .execute(&self.inner.pool)
                .await?;
                error!(error = %e, class = ?e.class(), "Job failed");
                Ok(JobStatus::Failed)
            }
        }
    }

    // Returns an active job to `waiting`, or fails it once its attempts are
    // spent. Guarded on `active` so a concurrent recover is not overwritten.
    async fn release(&self, job: &MigrationJob, cause: MigrateError) -> Result<JobStatus> {
        let now = Utc::now();
        let (status, available_at) = if job.attempts < job.max_attempts {
            let delay = self.inner.config.backoff(job.attempts);
            (JobStatus::Waiting, retry_at(now, delay))
        } else {
            (JobStatus::Failed, now)
        };
        let finished_at = (status == JobStatus::Failed).then(|| encode_ts(now));
        let released = sqlx::query(
            "UPDATE migration_jobs SET status = ?, available_at = ?, finished_at = ?, \
             last_error = ? WHERE id = ? AND status = 'active'",
        )
        .bind(status.as_str())
        .bind(encode_ts(available_at))
        .bind(finished_at)
        .bind(cause.to_string())
        .bind(job.id)
        .execute(&self.inner.pool)
        .await;

        match released {
            Ok(result) if result.rows_affected() > 0 => {
                warn!(error = %cause, status = %status, "Could not record job outcome, job released");
                Ok(status)
            }
            Ok(_) => Err(cause),
            Err(e) => {
                error!(error = %e, cause = %cause, "Could not release job");
                Err(cause)
            }
        }
    }

    async fn execute(&self, job: &MigrationJob, migration_id: &mut Option<i64>) -> Result<()> {
        let service = &self.inner.service;
        match &job.kind {
            JobKind::Apply { change } => {
                let id = match *migration_id {
                    Some(id) => id,
                    None => {
                        let id = service
                            .begin(Some(job.id), &job.form_id, &job.table_name, change)
                            .await?;
                        *migration_id = Some(id);
                        id
                    }
                };
                service.apply(id, change).await?;
            }
            JobKind::Rollback { migration_id: target } => {
                service.rollback(*target).await?;
            }
            JobKind::Restore { backup_id } => {
                let report = service.restore_backup(*backup_id).await?;
                debug!(restored = report.restored, missing = report.missing, "Restore finished");
            }
        }
        Ok(())
    }

    /// Processes jobs one at a time until none is claimable. Retries
    /// scheduled in the future are left waiting. Returns the number of jobs
    /// processed.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(job) = self.claim().await? {
            self.process(job).await?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Runs the worker pool until `shutdown` is cancelled. In-flight jobs
    /// finish before their worker exits.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.recover().await?;
        let workers = self.inner.config.worker_concurrency.max(1);
        info!(workers, "Migration workers starting");

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let queue = self.clone();
            let shutdown = shutdown.clone();
            set.spawn(async move { queue.worker(worker, shutdown).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Migration worker panicked");
            }
        }

        info!("Migration workers stopped");
        Ok(())
    }

    async fn worker(&self, worker: usize, shutdown: CancellationToken) {
        let poll = self.inner.config.poll_interval();
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            // Created before claiming so an enqueue in between is not missed.
            let wakeup = self.inner.wakeup.notified();

            match self.claim().await {
                Ok(Some(job)) => {
                    if let Err(e) = self.process(job).await {
                        warn!(worker, error = %e, "Failed to record job outcome");
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(worker, error = %e, "Failed to claim job"),
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = wakeup => {}
                () = tokio::time::sleep(poll) => {}
            }
        }
        debug!(worker, "Worker exiting");
    }

    // Inserts one job row; `conn` may be a transaction.
    async fn insert_job(&self, conn: &mut SqliteConnection, job: &NewJob) -> Result<i64> {
        let now = encode_ts(Utc::now());
        let payload = serde_json::to_string(&job.kind)?;
        let result = sqlx::query(
            "INSERT INTO migration_jobs (form_id, table_name, payload, status, attempts, \
             max_attempts, available_at, created_at) VALUES (?, ?, ?, 'waiting', 0, ?, ?, ?)",
        )
        .bind(&job.form_id)
        .bind(&job.table_name)
        .bind(payload)
        .bind(self.inner.config.max_attempts)
        .bind(&now)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        let id = result.last_insert_rowid();
        debug!(
            job_id = id,
            form_id = %job.form_id,
            table = %job.table_name,
            job = %job.kind.describe(),
            "Job enqueued"
        );
        Ok(id)
    }
}

/// Points a job at the migration it recorded; `conn` may be a transaction.
pub(crate) async fn link_migration(
    conn: &mut SqliteConnection,
    job_id: i64,
    migration_id: i64,
) -> Result<()> {
    sqlx::query("UPDATE migration_jobs SET migration_id = ? WHERE id = ?")
        .bind(migration_id)
        .bind(job_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn retry_at(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Cancels the waiting jobs of one table; used when the table is dropped.
pub(crate) async fn cancel_table(conn: &mut SqliteConnection, table: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE migration_jobs SET status = 'failed', last_error = 'table dropped', \
         finished_at = ? WHERE table_name = ? AND status = 'waiting'",
    )
    .bind(encode_ts(Utc::now()))
    .bind(table)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}
