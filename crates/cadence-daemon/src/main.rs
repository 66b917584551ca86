use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use cadence_core::CadenceConfig;
use cadence_scheduler::{JobRegistry, SchedulerEngine, SchedulerHandle, SqliteStore, SystemClock};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod declarations;
mod jobs;

#[derive(Parser)]
#[command(name = "cadence", version, about = "Persistent job scheduler")]
struct Cli {
    /// Config file (default: $CADENCE_CONFIG, then ~/.cadence/cadence.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted (default)
    Run,
    /// List jobs and their triggers
    Jobs,
    /// Show recent fires, newest first
    History {
        /// Only this job
        #[arg(long)]
        job: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Pause a trigger, or every trigger of a job with --job
    Pause {
        id: String,
        #[arg(long)]
        job: bool,
    },
    /// Resume a trigger, or every trigger of a job with --job
    Resume {
        id: String,
        #[arg(long)]
        job: bool,
    },
    /// Remove a job (and its triggers), or a single trigger with --trigger
    Remove {
        id: String,
        #[arg(long)]
        trigger: bool,
    },
    /// Fire a job on the next poll of a running scheduler
    TriggerNow { job_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info,cadence_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(
        SqliteStore::open(db_path).with_context(|| format!("cannot open store at {db_path}"))?,
    );

    let registry = Arc::new(JobRegistry::new());
    jobs::register_builtin(&registry);

    let engine = SchedulerEngine::new(
        config.scheduler.clone(),
        store,
        registry,
        Arc::new(SystemClock),
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config, engine).await,
        Commands::Jobs => list_jobs(&engine.handle()),
        Commands::History { job, limit } => history(&engine.handle(), job.as_deref(), limit),
        Commands::Pause { id, job } => {
            let handle = engine.handle();
            if job {
                let n = handle.pause_job(&id)?;
                println!("paused {n} trigger(s) of job {id}");
            } else {
                handle.pause_trigger(&id)?;
                println!("paused trigger {id}");
            }
            Ok(())
        }
        Commands::Resume { id, job } => {
            let handle = engine.handle();
            if job {
                let n = handle.resume_job(&id)?;
                println!("resumed {n} trigger(s) of job {id}");
            } else {
                handle.resume_trigger(&id)?;
                println!("resumed trigger {id}");
            }
            Ok(())
        }
        Commands::Remove { id, trigger } => {
            let handle = engine.handle();
            if trigger {
                handle.remove_trigger(&id)?;
                println!("removed trigger {id}");
            } else {
                handle.remove_job(&id)?;
                println!("removed job {id} and its triggers");
            }
            Ok(())
        }
        Commands::TriggerNow { job_id } => {
            let trigger_id = engine.handle().trigger_now(&job_id)?;
            println!("scheduled one-shot trigger {trigger_id}");
            Ok(())
        }
    }
}

async fn run(config: &CadenceConfig, engine: SchedulerEngine) -> anyhow::Result<()> {
    let stop = CancellationToken::new();

    let rescan = match declarations::DeclarationsLoader::new(&config.declarations, engine.handle()) {
        Some(mut loader) => {
            if let Some(report) = loader.load_initial()? {
                if !report.errors.is_empty() {
                    warn!(errors = report.errors.len(), "some declarations were skipped");
                }
            }
            loader.spawn_rescan(stop.clone())
        }
        None => None,
    };

    engine.start().await?;
    info!(instance = %engine.instance_id(), "cadence running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("interrupt received, shutting down");

    stop.cancel();
    if let Some(task) = rescan {
        if let Err(e) = task.await {
            error!(error = %e, "declarations rescan task failed");
        }
    }

    let report = engine.stop().await?;
    if !report.completed {
        warn!(abandoned = ?report.abandoned, "some jobs were still running at shutdown");
    }
    Ok(())
}

fn list_jobs(handle: &SchedulerHandle) -> anyhow::Result<()> {
    let jobs = handle.list_jobs()?;
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  type={}  concurrency={}{}",
            job.id,
            job.job_type,
            job.concurrency,
            job.description
                .as_deref()
                .map(|d| format!("  # {d}"))
                .unwrap_or_default()
        );
        for t in handle.list_triggers(Some(&job.id))? {
            let next = t
                .next_fire_at
                .map(|n| n.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    {}  state={}  next={}  fired={}  misfire={}",
                t.id(),
                t.state,
                next,
                t.fire_count,
                t.spec.misfire_policy
            );
        }
    }
    Ok(())
}

fn history(handle: &SchedulerHandle, job: Option<&str>, limit: usize) -> anyhow::Result<()> {
    for fire in handle.history(job, limit)? {
        println!(
            "{}  {}  job={}  trigger={}  instance={}  scheduled={}{}",
            fire.fired_at.to_rfc3339(),
            fire.outcome,
            fire.job_id,
            fire.trigger_id,
            fire.instance_id,
            fire.scheduled_at.to_rfc3339(),
            fire.error
                .as_deref()
                .map(|e| format!("  error: {e}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

/// Create the parent directory of a file path if it doesn't exist.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "cannot create database directory");
            }
        }
    }
}
