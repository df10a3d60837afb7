//! tw - command line front end for the tickwork scheduler.
//!
//! Usage:
//!   tw run <jobs-dir>       Run the scheduler with jobs from the specified directory
//!   tw validate <jobs-dir>  Validate job configurations without running
//!   tw list <jobs-dir>      List all jobs in the directory with their next run
//!   tw trigger <jobs-dir> <job-id>  Run one job now and wait for it
//!   tw history <job-id> --db <file>  Show recorded runs of a job

use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tickwork::{
    DispatchOutcome, Event, EventBus, EventHandler, GlobalConfig, InMemoryStorage, JobDefinition,
    MetricsCollector, RunId, RunOutcome, Scheduler, SkipReason, Storage, StorageConfig,
    YamlLoader, load_jobs_from_directory_with,
};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// How long `tw trigger` waits for the run to finish.
const TRIGGER_WAIT: Duration = Duration::from_secs(300);

/// tw - a lightweight job scheduler
#[derive(Parser)]
#[command(name = "tw")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler with jobs from a directory
    Run {
        /// Path to the directory containing job YAML files
        #[arg(value_name = "JOBS_DIR")]
        jobs_dir: PathBuf,

        /// Global configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Scheduler tick interval in seconds
        #[arg(long, value_name = "SECS")]
        tick_interval: Option<u64>,

        /// Deployment environment matched against job allow-lists
        #[arg(short, long, value_name = "NAME")]
        environment: Option<String>,

        /// SQLite database for run history (overrides the config file)
        #[arg(long, value_name = "FILE")]
        db: Option<PathBuf>,
    },

    /// Validate job configurations without running
    Validate {
        /// Path to the directory containing job YAML files
        #[arg(value_name = "JOBS_DIR")]
        jobs_dir: PathBuf,

        /// Global configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// List all jobs in the directory
    List {
        /// Path to the directory containing job YAML files
        #[arg(value_name = "JOBS_DIR")]
        jobs_dir: PathBuf,

        /// Global configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Trigger a job manually and wait for the run to finish
    Trigger {
        /// Path to the directory containing job YAML files
        #[arg(value_name = "JOBS_DIR")]
        jobs_dir: PathBuf,

        /// Job ID to trigger
        #[arg(value_name = "JOB_ID")]
        job_id: String,

        /// Global configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// SQLite database for run history (overrides the config file)
        #[arg(long, value_name = "FILE")]
        db: Option<PathBuf>,
    },

    /// Show recorded runs of a job
    History {
        /// Job ID to show
        #[arg(value_name = "JOB_ID")]
        job_id: String,

        /// SQLite database holding run history
        #[arg(long, value_name = "FILE")]
        db: PathBuf,

        /// Maximum number of runs to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Print runs as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Logs scheduler lifecycle events.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobStarted {
                job_id,
                run_id,
                attempt,
                ..
            } => {
                info!(job_id = %job_id, run_id = %run_id, attempt, "job started");
            }
            Event::JobCompleted { record, .. } => {
                let duration = record.duration().unwrap_or_default();
                match record.outcome {
                    RunOutcome::Success => {
                        info!(
                            job_id = %record.job_id,
                            run_id = %record.id,
                            ?duration,
                            "job completed successfully"
                        );
                        if let Some(output) = &record.output {
                            for line in output.lines() {
                                info!("    stdout: {}", line);
                            }
                        }
                    }
                    outcome => {
                        error!(
                            job_id = %record.job_id,
                            run_id = %record.id,
                            %outcome,
                            ?duration,
                            error = record.error.as_deref().unwrap_or(""),
                            "job did not succeed"
                        );
                    }
                }
            }
            Event::JobSkipped {
                job_id,
                scheduled_at,
                reason,
                ..
            } => {
                let reason = match reason {
                    SkipReason::Overlap => "previous run still in flight".to_string(),
                    SkipReason::DependencyNotMet { dependency } => {
                        format!("dependency '{}' has not succeeded", dependency)
                    }
                    SkipReason::Misfire => "missed by more than the misfire threshold".to_string(),
                };
                warn!(job_id = %job_id, %scheduled_at, "job skipped: {}", reason);
            }
            Event::RetryScheduled {
                job_id,
                attempt,
                due_at,
                ..
            } => {
                info!(job_id = %job_id, attempt, %due_at, "retry scheduled");
            }
            Event::SchedulerDraining { in_flight, .. } => {
                info!(in_flight, "draining in-flight runs");
            }
            Event::SchedulerStopped { abandoned, .. } => {
                if *abandoned > 0 {
                    warn!(abandoned, "scheduler stopped with abandoned runs");
                } else {
                    info!("scheduler stopped");
                }
            }
        }
    }
}

/// Event handler that signals when a specific run completes.
struct CompletionWatcher {
    run_id: tokio::sync::Mutex<Option<RunId>>,
    job_id: String,
    completed: Arc<Notify>,
}

#[async_trait::async_trait]
impl EventHandler for CompletionWatcher {
    async fn handle(&self, event: &Event) {
        if let Event::JobCompleted { record, .. } = event {
            let watched = self.run_id.lock().await;
            let matches = match watched.as_ref() {
                Some(run_id) => &record.id == run_id,
                None => record.job_id.as_str() == self.job_id,
            };
            if matches {
                self.completed.notify_one();
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            jobs_dir,
            config,
            tick_interval,
            environment,
            db,
        } => {
            let mut global = load_global_config(config.as_deref())?;
            if tick_interval.is_some() {
                global.tick_interval_secs = tick_interval;
            }
            if environment.is_some() {
                global.environment = environment;
            }
            let jobs = load_jobs(&jobs_dir, &global)?;
            if jobs.is_empty() {
                warn!("No job files found in {}", jobs_dir.display());
                return Ok(());
            }

            match storage_config(&global, db) {
                StorageConfig::Memory => {
                    run_scheduler(InMemoryStorage::new(), jobs, &global).await?;
                }
                StorageConfig::Sqlite { path } => {
                    run_scheduler(open_sqlite(&path).await?, jobs, &global).await?;
                }
            }
        }
        Commands::Validate { jobs_dir, config } => {
            validate_jobs(&jobs_dir, config.as_deref())?;
        }
        Commands::List { jobs_dir, config } => {
            let global = load_global_config(config.as_deref())?;
            list_jobs(&jobs_dir, &global)?;
        }
        Commands::Trigger {
            jobs_dir,
            job_id,
            config,
            db,
        } => {
            let global = load_global_config(config.as_deref())?;
            let jobs = load_jobs(&jobs_dir, &global)?;
            match storage_config(&global, db) {
                StorageConfig::Memory => {
                    trigger_job(InMemoryStorage::new(), jobs, &global, job_id).await?;
                }
                StorageConfig::Sqlite { path } => {
                    trigger_job(open_sqlite(&path).await?, jobs, &global, job_id).await?;
                }
            }
        }
        Commands::History {
            job_id,
            db,
            limit,
            json,
        } => {
            let storage = open_sqlite(&db.to_string_lossy()).await?;
            show_history(&storage, &job_id, limit, json).await?;
        }
    }

    Ok(())
}

fn load_global_config(path: Option<&Path>) -> Result<GlobalConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(YamlLoader::load_global_config(path)?)
        }
        None => Ok(GlobalConfig::default()),
    }
}

fn load_jobs(
    jobs_dir: &Path,
    global: &GlobalConfig,
) -> Result<Vec<JobDefinition>, Box<dyn std::error::Error>> {
    info!("Loading jobs from: {}", jobs_dir.display());
    Ok(load_jobs_from_directory_with(jobs_dir, global)?)
}

/// `--db` wins over the config file.
fn storage_config(global: &GlobalConfig, db: Option<PathBuf>) -> StorageConfig {
    match db {
        Some(path) => StorageConfig::Sqlite {
            path: path.to_string_lossy().into_owned(),
        },
        None => global.storage.clone().unwrap_or_default(),
    }
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(path: &str) -> Result<tickwork::SqliteStorage, Box<dyn std::error::Error>> {
    info!("Opening run history at: {}", path);
    Ok(tickwork::SqliteStorage::new(path).await?)
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(path: &str) -> Result<InMemoryStorage, Box<dyn std::error::Error>> {
    Err(format!("cannot open '{}': tw was built without the sqlite feature", path).into())
}

/// Build a scheduler from the global config and register jobs front to back.
async fn build_scheduler<S: Storage + 'static>(
    storage: S,
    jobs: Vec<JobDefinition>,
    global: &GlobalConfig,
) -> Result<Scheduler<S>, Box<dyn std::error::Error>> {
    let event_bus = EventBus::new();
    event_bus.register(Arc::new(LoggingHandler)).await;

    let scheduler = Scheduler::new(storage)
        .with_config(global.scheduler_config()?)
        .with_event_bus(event_bus);

    for job in jobs {
        scheduler.register(job)?;
    }
    Ok(scheduler)
}

/// Run the scheduler until Ctrl+C.
async fn run_scheduler<S: Storage + 'static>(
    storage: S,
    jobs: Vec<JobDefinition>,
    global: &GlobalConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Loaded {} job(s):", jobs.len());
    for job in &jobs {
        let enabled_info = if job.is_enabled() { "" } else { " (paused)" };
        info!("  - {} [{}]{}", job.id(), job.rule(), enabled_info);
    }

    let scheduler = build_scheduler(storage, jobs, global).await?;
    let metrics = Arc::new(MetricsCollector::new());
    scheduler.event_bus().register(metrics.clone()).await;

    let tick = scheduler.config().tick_interval;
    let (handle, scheduler_task) = scheduler.start().await?;

    info!("Scheduler started (tick interval: {:?})", tick);
    info!("Press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = scheduler_task => {
            info!("Scheduler stopped");
        }
    }

    for (job_id, m) in metrics.snapshot().jobs {
        info!(
            job_id = %job_id,
            attempts = m.attempts,
            successes = m.successes,
            failures = m.failures,
            timeouts = m.timeouts,
            skipped = m.skipped,
            "run summary"
        );
    }

    info!("Goodbye!");
    Ok(())
}

/// Validate job configurations without running.
fn validate_jobs(
    jobs_dir: &Path,
    config: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating jobs in: {}", jobs_dir.display());

    let global = load_global_config(config)?;
    if let Err(e) = global.scheduler_config() {
        error!("Validation failed: {}", e);
        return Err(e.into());
    }

    match load_jobs_from_directory_with(jobs_dir, &global) {
        Ok(jobs) => {
            info!("All {} job(s) are valid:", jobs.len());
            for job in &jobs {
                info!("  - {} ({}): OK", job.id(), job.name());
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// List all jobs in the directory.
fn list_jobs(jobs_dir: &Path, global: &GlobalConfig) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = load_jobs_from_directory_with(jobs_dir, global)?;

    if jobs.is_empty() {
        println!("No jobs found in {}", jobs_dir.display());
        return Ok(());
    }

    println!("Jobs in {}:", jobs_dir.display());
    println!();

    let now = Utc::now();
    for job in &jobs {
        println!("ID: {}", job.id());
        println!("  Name: {}", job.name());
        if let Some(description) = job.description() {
            println!("  Description: {}", description);
        }
        println!("  Enabled: {}", job.is_enabled());
        println!("  Schedule: {}", job.rule());
        match job.rule().next_run(now) {
            Some(next) => println!("  Next run: {}", next.to_rfc3339()),
            None => println!("  Next run: never"),
        }
        println!("  Overlap: {:?}", job.overlap());
        if job.retry().is_enabled() {
            println!("  Max attempts: {}", job.retry().max_attempts);
        }
        if let Some(max) = job.max_duration() {
            println!("  Timeout: {:?}", max);
        }
        if !job.dependencies().is_empty() {
            let deps: Vec<&str> = job.dependencies().iter().map(|d| d.as_str()).collect();
            println!("  Depends on: {}", deps.join(", "));
        }
        if !job.environments().is_empty() {
            println!("  Environments: {}", job.environments().join(", "));
        }
        println!();
    }

    Ok(())
}

/// Trigger a specific job and wait for its run to complete.
async fn trigger_job<S: Storage + 'static>(
    storage: S,
    jobs: Vec<JobDefinition>,
    global: &GlobalConfig,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    if !jobs.iter().any(|j| j.id().as_str() == job_id) {
        error!("Job '{}' not found", job_id);
        error!(
            "Available jobs: {}",
            jobs.iter()
                .map(|j| j.id().as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        return Err(format!("Job '{}' not found", job_id).into());
    }

    // All jobs are registered so dependencies resolve.
    let scheduler = build_scheduler(storage, jobs, global).await?;

    let completed = Arc::new(Notify::new());
    let watcher = Arc::new(CompletionWatcher {
        run_id: tokio::sync::Mutex::new(None),
        job_id: job_id.clone(),
        completed: completed.clone(),
    });
    scheduler.event_bus().register(watcher.clone()).await;

    let (handle, _scheduler_task) = scheduler.start().await?;
    // Hold scheduled occurrences; manual triggers still run.
    handle.pause().await?;

    info!("Triggering job '{}'...", job_id);
    let outcome = match handle.trigger(job_id.as_str()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Failed to trigger job: {}", e);
            handle.shutdown().await?;
            return Err(e.into());
        }
    };

    match outcome {
        DispatchOutcome::Skipped(run_id) => {
            warn!("Job '{}' is already running; run {} skipped", job_id, run_id);
        }
        outcome => {
            if let DispatchOutcome::Started(run_id) = &outcome {
                info!("Job triggered (run: {})", run_id);
                *watcher.run_id.lock().await = Some(run_id.clone());
            } else {
                info!("Job queued behind the running instance");
            }

            tokio::select! {
                _ = completed.notified() => {}
                _ = tokio::time::sleep(TRIGGER_WAIT) => {
                    warn!("Job did not finish within {:?}", TRIGGER_WAIT);
                }
            }
        }
    }

    handle.shutdown().await?;
    info!("Done!");
    Ok(())
}

/// Print recorded runs of a job, most recent first.
async fn show_history<S: Storage>(
    storage: &S,
    job_id: &str,
    limit: usize,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let runs = storage.list_runs(&job_id.into(), limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs recorded for '{}'", job_id);
        return Ok(());
    }

    println!(
        "{:<36}  {:>3}  {:<8}  {:<25}  {:<16}  {:>10}",
        "RUN", "TRY", "TRIGGER", "SCHEDULED", "OUTCOME", "DURATION"
    );
    for run in &runs {
        let duration = run
            .duration()
            .map(|d| format!("{:.1}s", d.as_secs_f64()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:>3}  {:<8}  {:<25}  {:<16}  {:>10}",
            run.id.to_string(),
            run.attempt,
            run.trigger.as_str(),
            run.scheduled_at.to_rfc3339(),
            run.outcome.to_string(),
            duration
        );
        if let Some(err) = &run.error {
            println!("    error: {}", err);
        }
    }

    Ok(())
}
