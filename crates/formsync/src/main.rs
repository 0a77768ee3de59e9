//! formsync CLI
//!
//! Runs migration workers and answers operator queries.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use formsync::prelude::*;

/// Keeps per-form mirror tables in sync with their forms.
#[derive(Parser)]
#[command(name = "formsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL; overrides the configuration file.
    #[arg(short, long, env = "DATABASE_URL")]
    database: Option<String>,

    /// Configuration file (TOML).
    #[arg(short, long, env = "FORMSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Translation service URL; overrides the configuration file.
    #[arg(long, env = "FORMSYNC_TRANSLATOR_URL")]
    translator_url: Option<String>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the system tables.
    Init,

    /// Run migration workers and the backup sweep until interrupted.
    Work {
        /// Worker count; overrides the configuration file.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Drain the queue once and exit.
        #[arg(long)]
        once: bool,
    },

    /// Show queue counts for a form.
    Status {
        /// Form id.
        form_id: String,

        /// Also list the form's jobs.
        #[arg(long)]
        jobs: bool,
    },

    /// Show migration history.
    History {
        /// Only this form.
        #[arg(short, long)]
        form: Option<String>,

        /// Only this status.
        #[arg(short, long, value_enum)]
        status: Option<StatusArg>,

        /// Page number, from 1.
        #[arg(long, default_value_t = 1)]
        page: u32,

        /// Page size.
        #[arg(long, default_value_t = 50)]
        per_page: u32,
    },

    /// List a form's backups that are still retained.
    Backups {
        /// Form id.
        form_id: String,
    },

    /// Enqueue a restore of a backup.
    Restore {
        /// Backup id.
        backup_id: i64,
    },

    /// Enqueue a rollback of a successful migration.
    Rollback {
        /// Migration id.
        migration_id: i64,
    },

    /// Delete expired backups.
    Sweep,

    /// Place or lift a legal hold on a backup.
    Hold {
        /// Backup id.
        backup_id: i64,

        /// Lift the hold instead of placing it.
        #[arg(long)]
        release: bool,
    },

    /// Preview the identifier a title resolves to.
    ResolveName {
        /// Title to resolve.
        title: String,

        /// Naming context.
        #[arg(long, value_enum, default_value_t = ContextArg::Field)]
        context: ContextArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Pending,
    Success,
    Failed,
    RolledBack,
}

impl From<StatusArg> for MigrationStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => Self::Pending,
            StatusArg::Success => Self::Success,
            StatusArg::Failed => Self::Failed,
            StatusArg::RolledBack => Self::RolledBack,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ContextArg {
    Form,
    Field,
    Action,
}

impl From<ContextArg> for NameContext {
    fn from(arg: ContextArg) -> Self {
        match arg {
            ContextArg::Form => Self::Form,
            ContextArg::Field => Self::Field,
            ContextArg::Action => Self::Action,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(url) = cli.database {
        config.database.url = url;
    }
    if let Some(url) = cli.translator_url {
        config.naming.translator_url = Some(url);
    }
    if let Commands::Work {
        workers: Some(workers),
        ..
    } = &cli.command
    {
        config.queue.worker_concurrency = *workers;
    }

    let engine = Engine::open(config).await?;

    match cli.command {
        Commands::Init => {
            info!(database = %engine.config().database.url, "System tables ready");
        }

        Commands::Work { once, .. } => {
            if once {
                engine.queue().recover().await?;
                let processed = engine.queue().run_until_idle().await?;
                info!(processed, "Queue drained");
            } else {
                let shutdown = CancellationToken::new();
                let signal = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Shutting down after in-flight jobs");
                        signal.cancel();
                    }
                });
                engine.run(shutdown).await?;
            }
        }

        Commands::Status { form_id, jobs } => {
            let counts = engine.queue().status(&form_id).await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            if jobs {
                for job in engine.queue().jobs_for_form(&form_id).await? {
                    println!(
                        "#{:<6} {:<10} {:<24} attempts={} {}",
                        job.id,
                        job.status.as_str(),
                        job.table_name,
                        job.attempts,
                        job.last_error.unwrap_or_default()
                    );
                }
            }
        }

        Commands::History {
            form,
            status,
            page,
            per_page,
        } => {
            let mut filter = HistoryFilter::default().page(page, per_page);
            if let Some(form) = form {
                filter = filter.form(form);
            }
            if let Some(status) = status {
                filter = filter.status(status.into());
            }
            let result = engine.history().list(&filter).await?;

            println!(
                "\nMigrations (page {} of {} total):",
                result.page, result.total
            );
            println!("{:-<72}", "");
            for m in &result.items {
                println!(
                    " #{:<6} {:<12} {:<13} {}.{} ({})",
                    m.id,
                    m.status.as_str(),
                    m.migration_type.as_str(),
                    m.table_name,
                    m.column_name.as_deref().unwrap_or("?"),
                    m.created_at.format("%Y-%m-%d %H:%M:%S")
                );
                if let Some(error) = &m.error {
                    println!("          error: {error}");
                }
            }
            println!();
        }

        Commands::Backups { form_id } => {
            let backups = engine.backups().active_for_form(&form_id, Utc::now()).await?;
            if backups.is_empty() {
                info!(form_id = %form_id, "No retained backups");
            }
            for b in &backups {
                println!(
                    " #{:<6} {}.{} rows={} until={}{}{}",
                    b.id,
                    b.table_name,
                    b.column_name,
                    b.row_count,
                    b.retention_until.format("%Y-%m-%d"),
                    if b.legal_hold { " [hold]" } else { "" },
                    if b.restored_at.is_some() { " [restored]" } else { "" }
                );
            }
        }

        Commands::Restore { backup_id } => {
            let job_id = engine.queue().restore_job(backup_id).await?;
            info!(backup_id, job_id, "Restore enqueued");
        }

        Commands::Rollback { migration_id } => {
            let job_id = engine.queue().rollback_job(migration_id).await?;
            info!(migration_id, job_id, "Rollback enqueued");
        }

        Commands::Sweep => {
            let deleted = engine.sweep_backups().await?;
            info!(deleted, "Sweep finished");
        }

        Commands::Hold { backup_id, release } => {
            engine.backups().set_legal_hold(backup_id, !release).await?;
            info!(backup_id, hold = !release, "Legal hold updated");
        }

        Commands::ResolveName { title, context } => {
            let resolved = engine
                .namer()
                .resolve_detailed(&title, context.into(), &HashSet::new())
                .await;
            println!("{} ({:?})", resolved.identifier, resolved.source);
        }
    }

    Ok(())
}
