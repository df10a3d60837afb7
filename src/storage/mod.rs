//! Storage abstraction for run history and per-job status.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite).

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::core::types::{JobId, RunId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The run already has a terminal outcome.
    #[error("run already finished: {0}")]
    AlreadyFinished(RunId),

    /// The backend cannot be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Started and not yet finished.
    InProgress,
    /// Handler returned `Ok`.
    Success,
    /// Handler returned an error or panicked.
    Failure,
    /// Handler exceeded its max duration, or was abandoned at shutdown.
    Timeout,
    /// Not executed because a previous run was still in flight.
    SkippedOverlap,
    /// Found in progress after a restart.
    Interrupted,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::InProgress => "in_progress",
            RunOutcome::Success => "success",
            RunOutcome::Failure => "failure",
            RunOutcome::Timeout => "timeout",
            RunOutcome::SkippedOverlap => "skipped_overlap",
            RunOutcome::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(RunOutcome::InProgress),
            "success" => Some(RunOutcome::Success),
            "failure" => Some(RunOutcome::Failure),
            "timeout" => Some(RunOutcome::Timeout),
            "skipped_overlap" => Some(RunOutcome::SkippedOverlap),
            "interrupted" => Some(RunOutcome::Interrupted),
            _ => None,
        }
    }

    /// Whether the run is finished.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunOutcome::InProgress)
    }

    /// Whether the handler actually ran to an outcome (skips excluded).
    pub fn is_executed(&self) -> bool {
        self.is_terminal() && !matches!(self, RunOutcome::SkippedOverlap)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// An occurrence of the job's rule, or a retry of one.
    #[default]
    Schedule,
    /// A manual trigger, or a retry of one.
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Schedule => "schedule",
            RunTrigger::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "schedule" => Some(RunTrigger::Schedule),
            "manual" => Some(RunTrigger::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run identifier.
    pub id: RunId,
    /// Parent job identifier.
    pub job_id: JobId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Occurrence this run belongs to.
    pub scheduled_at: DateTime<Utc>,
    /// What started the run.
    #[serde(default)]
    pub trigger: RunTrigger,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run ended (if finished).
    pub ended_at: Option<DateTime<Utc>>,
    /// Run outcome.
    pub outcome: RunOutcome,
    /// Error message (if failed).
    pub error: Option<String>,
    /// Output reported by the handler.
    pub output: Option<String>,
}

impl RunRecord {
    /// Wall-clock duration of a finished run.
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }

    /// Lateness of the start relative to the scheduled time.
    pub fn delay(&self) -> Duration {
        (self.started_at - self.scheduled_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// A run about to be recorded.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: RunId,
    pub job_id: JobId,
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub error: Option<String>,
}

impl NewRun {
    /// An in-progress run with a fresh id.
    pub fn new(
        job_id: JobId,
        scheduled_at: DateTime<Utc>,
        started_at: DateTime<Utc>,
        attempt: u32,
    ) -> Self {
        Self {
            id: RunId::new(),
            job_id,
            attempt,
            scheduled_at,
            trigger: RunTrigger::Schedule,
            started_at,
            outcome: RunOutcome::InProgress,
            error: None,
        }
    }

    pub fn with_trigger(mut self, trigger: RunTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Turn this into a finished `SkippedOverlap` record.
    pub fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.outcome = RunOutcome::SkippedOverlap;
        self.error = Some(reason.into());
        self
    }

    /// The record as it is first stored. Terminal outcomes end at `started_at`.
    pub fn into_record(self) -> RunRecord {
        RunRecord {
            ended_at: self.outcome.is_terminal().then_some(self.started_at),
            id: self.id,
            job_id: self.job_id,
            attempt: self.attempt,
            scheduled_at: self.scheduled_at,
            trigger: self.trigger,
            started_at: self.started_at,
            outcome: self.outcome,
            error: self.error,
            output: None,
        }
    }
}

/// How a run finished.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub ended_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub output: Option<String>,
}

impl RunCompletion {
    pub fn success(ended_at: DateTime<Utc>, output: Option<String>) -> Self {
        Self {
            ended_at,
            outcome: RunOutcome::Success,
            error: None,
            output,
        }
    }

    pub fn failure(ended_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            ended_at,
            outcome: RunOutcome::Failure,
            error: Some(error.into()),
            output: None,
        }
    }

    pub fn timeout(ended_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            ended_at,
            outcome: RunOutcome::Timeout,
            error: Some(error.into()),
            output: None,
        }
    }

    /// Apply to an in-progress record.
    pub(crate) fn apply(self, record: &mut RunRecord) {
        record.ended_at = Some(self.ended_at);
        record.outcome = self.outcome;
        record.error = self.error;
        record.output = self.output;
    }
}

/// Durable current status of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub paused: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_id: Option<RunId>,
    pub last_outcome: Option<RunOutcome>,
    pub last_scheduled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    pub(crate) fn new(job_id: JobId, updated_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            paused: false,
            next_run_at: None,
            last_run_id: None,
            last_outcome: None,
            last_scheduled_at: None,
            updated_at,
        }
    }

    pub(crate) fn apply_run(&mut self, record: &RunRecord) {
        self.last_run_id = Some(record.id.clone());
        self.last_outcome = Some(record.outcome);
        self.last_scheduled_at = Some(record.scheduled_at);
        self.updated_at = record.ended_at.unwrap_or(record.started_at);
    }
}

/// Storage trait for run history and job status.
#[async_trait]
pub trait Storage: Send + Sync {
    // Run operations

    /// Insert a run. `InProgress` runs stay open until [`Storage::record_end`].
    async fn record_start(&self, run: NewRun) -> Result<RunId, StorageError>;

    /// Finish an in-progress run and return the updated record.
    async fn record_end(
        &self,
        id: &RunId,
        completion: RunCompletion,
    ) -> Result<RunRecord, StorageError>;

    /// Get a run by ID.
    async fn get_run(&self, id: &RunId) -> Result<RunRecord, StorageError>;

    /// Most recently started run of a job, of any outcome.
    async fn last_run(&self, job_id: &JobId) -> Result<Option<RunRecord>, StorageError>;

    /// Whether the job has an in-progress run.
    async fn is_running(&self, job_id: &JobId) -> Result<bool, StorageError>;

    /// List runs for a job, most recent first.
    /// Returns at most `limit` runs.
    async fn list_runs(&self, job_id: &JobId, limit: usize)
    -> Result<Vec<RunRecord>, StorageError>;

    /// Mark every in-progress run as interrupted and return the updated records.
    async fn reconcile_interrupted(
        &self,
        at: DateTime<Utc>,
    ) -> Result<Vec<RunRecord>, StorageError>;

    /// Delete finished runs beyond the `keep` most recent. Returns how many were removed.
    async fn prune_runs(&self, job_id: &JobId, keep: usize) -> Result<usize, StorageError>;

    // Status operations

    /// Upsert the scheduling half of a job's status.
    async fn update_schedule_status(
        &self,
        job_id: &JobId,
        paused: bool,
        next_run_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Upsert the last-run half of a job's status.
    async fn update_run_status(&self, record: &RunRecord) -> Result<(), StorageError>;

    /// Get a job's status.
    async fn get_status(&self, job_id: &JobId) -> Result<Option<JobStatus>, StorageError>;

    /// All statuses, ordered by job id.
    async fn list_statuses(&self) -> Result<Vec<JobStatus>, StorageError>;

    /// Delete a job's status.
    async fn delete_status(&self, job_id: &JobId) -> Result<(), StorageError>;
}

/// Error recorded on runs found in progress at startup.
pub(crate) const INTERRUPTED_MESSAGE: &str = "scheduler stopped while the run was in progress";
