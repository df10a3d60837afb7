//! tickwork - a lightweight job scheduler core.
//!
//! Jobs pair a [`RecurrenceRule`] with an async [`JobHandler`]. The
//! [`Scheduler`] evaluates rules on every tick, dispatches due jobs subject
//! to their overlap policy and dependencies, retries failures with backoff,
//! and records every attempt through a [`Storage`] backend.
//!
//! ```no_run
//! use std::time::Duration;
//! use tickwork::{CommandHandler, InMemoryStorage, JobDefinition, RecurrenceRule, Scheduler};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), tickwork::SchedulerError> {
//! let scheduler = Scheduler::new(InMemoryStorage::new());
//! scheduler.register(JobDefinition::new(
//!     "heartbeat",
//!     RecurrenceRule::every(Duration::from_secs(60)),
//!     Arc::new(CommandHandler::shell("echo alive")),
//! ))?;
//!
//! let (handle, task) = scheduler.start().await?;
//! handle.shutdown().await?;
//! let _ = task.await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{
    ConfigError, GlobalConfig, JobConfig, JobConfigBuilder, StorageConfig, YamlLoader,
    load_jobs_from_directory, load_jobs_from_directory_with,
};
pub use core::clock::{Clock, ManualClock, SystemClock};
pub use core::cron::{CronError, CronExpr};
pub use core::frequency::Frequency;
pub use core::job::{
    HandlerError, JobContext, JobDefinition, JobError, JobHandler, OverlapPolicy, handler_fn,
};
pub use core::retry::{Backoff, RetryCondition, RetryError, RetryPolicy};
pub use core::schedule::{RecurrenceRule, ScheduleError};
pub use core::types::{JobId, RunId};
pub use events::{Event, EventBus, EventHandler, MetricsCollector, SkipReason};
pub use execution::{
    CommandHandler, DispatchOutcome, PendingRetry, RunningJob, UrlHandler, UrlHandlerBuilder,
};
pub use scheduler::{
    JobSummary, LoopState, MissedTickPolicy, Scheduler, SchedulerConfig, SchedulerError,
    SchedulerHandle, TickReport,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{
    InMemoryStorage, JobStatus, RunOutcome, RunRecord, RunTrigger, Storage, StorageError,
};
