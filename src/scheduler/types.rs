//! Scheduler type definitions.
//!
//! This module contains error types, state enums, configuration and command
//! types for the scheduler.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::job::JobError;
use crate::core::retry::RetryError;
use crate::core::schedule::ScheduleError;
use crate::core::types::JobId;
use crate::execution::DispatchOutcome;
use crate::storage::StorageError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid job definition or scheduler setting.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A job with this id is already registered.
    #[error("job already registered: {0}")]
    DuplicateId(JobId),

    /// Job not found.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Job dependency not satisfied.
    #[error("job dependency not satisfied: {0}")]
    DependencyNotSatisfied(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// The scheduler is draining and accepts no new runs.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl From<ScheduleError> for SchedulerError {
    fn from(e: ScheduleError) -> Self {
        SchedulerError::Configuration(e.to_string())
    }
}

impl From<RetryError> for SchedulerError {
    fn from(e: RetryError) -> Self {
        SchedulerError::Configuration(e.to_string())
    }
}

impl From<JobError> for SchedulerError {
    fn from(e: JobError) -> Self {
        SchedulerError::Configuration(e.to_string())
    }
}

/// State of the scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Waiting for the next tick.
    Idle,
    /// Evaluating due jobs.
    Ticking,
    /// Scheduled jobs and retries are held; manual triggers still run.
    Paused,
    /// Shutdown requested; waiting for in-flight runs.
    Draining,
    /// The loop has exited.
    Stopped,
}

/// What to do with occurrences that came due while the scheduler was not looking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedTickPolicy {
    /// Fire only if the latest occurrence is within the misfire threshold.
    #[default]
    Skip,
    /// Fire once for the latest occurrence, however late.
    CatchUp,
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the loop evaluates schedules.
    pub tick_interval: Duration,
    /// Maximum lateness under [`MissedTickPolicy::Skip`]. Defaults to two ticks.
    pub misfire_threshold: Option<Duration>,
    pub missed_ticks: MissedTickPolicy,
    /// How long shutdown waits for in-flight runs.
    pub shutdown_grace: Duration,
    /// Applied to jobs without their own max duration.
    pub default_timeout: Option<Duration>,
    /// Run history kept per job. `None` keeps everything.
    pub max_runs_per_job: Option<usize>,
    /// Deployment environment matched against job allow-lists.
    pub environment: Option<String>,
}

impl SchedulerConfig {
    pub fn misfire_threshold(&self) -> Duration {
        self.misfire_threshold
            .unwrap_or_else(|| self.tick_interval.saturating_mul(2))
    }

    /// Reject settings the loop cannot run with.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.tick_interval.is_zero() {
            return Err(SchedulerError::Configuration(
                "tick_interval must be positive".into(),
            ));
        }
        if self.max_runs_per_job == Some(0) {
            return Err(SchedulerError::Configuration(
                "max_runs_per_job must be at least 1".into(),
            ));
        }
        if self.default_timeout.is_some_and(|d| d.is_zero()) {
            return Err(SchedulerError::Configuration(
                "default_timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            misfire_threshold: None,
            missed_ticks: MissedTickPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
            default_timeout: None,
            max_runs_per_job: None,
            environment: None,
        }
    }
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Run a job now.
    Trigger {
        job_id: JobId,
        response: oneshot::Sender<Result<DispatchOutcome, SchedulerError>>,
    },
    /// Pause the scheduler.
    Pause { response: oneshot::Sender<()> },
    /// Resume the scheduler.
    Resume { response: oneshot::Sender<()> },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
