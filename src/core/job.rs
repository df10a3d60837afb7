//! Job definitions and the handler contract.
//!
//! A [`JobDefinition`] pairs a [`RecurrenceRule`] with a [`JobHandler`] and
//! the policies that govern execution: timeout, retries, overlap and
//! cross-job dependencies. Definitions are immutable once registered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::retry::{RetryError, RetryPolicy};
use super::schedule::{RecurrenceRule, ScheduleError};
use super::types::{JobId, RunId};

/// Errors that can occur when validating a job definition.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job id is empty.
    #[error("job id must not be empty")]
    EmptyId,

    /// Invalid recurrence rule.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    /// Invalid retry policy.
    #[error("invalid retry policy: {0}")]
    InvalidRetry(#[from] RetryError),

    /// Invalid dependency.
    #[error("invalid dependency: {0}")]
    InvalidDependency(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors a handler can report. Any of them turns the run into a failure.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Execution failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// External command failed with exit code. The captured stderr is part
    /// of the message so it reaches the run record.
    #[error("command exited with code {code}{}", detail_suffix(.stderr))]
    CommandFailed { code: i32, stderr: String },

    /// An HTTP request answered with a non-success status.
    #[error("request returned status {status}{}", detail_suffix(.body))]
    HttpStatus { status: u16, body: String },

    /// The handler gave up waiting on something.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A transient error that may succeed on retry.
    #[error("transient error: {0}")]
    Transient(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Check if this error is considered transient (should trigger retry).
    pub fn is_transient(&self) -> bool {
        match self {
            HandlerError::Transient(_) | HandlerError::Timeout(_) => true,
            HandlerError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {}", detail)
    }
}

/// Context handed to a handler for one execution attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job being executed.
    pub job_id: JobId,
    /// Run record for this attempt.
    pub run_id: RunId,
    /// Occurrence this run belongs to. Retries keep the original value.
    pub scheduled_at: DateTime<Utc>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancelled when the run times out or the scheduler abandons it.
    pub cancellation: CancellationToken,
}

impl JobContext {
    /// Whether the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Wait until the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// The unit of work a job executes.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use tickwork::{HandlerError, JobContext, JobHandler};
///
/// struct Cleanup;
///
/// #[async_trait]
/// impl JobHandler for Cleanup {
///     async fn run(&self, ctx: JobContext) -> Result<Option<String>, HandlerError> {
///         if ctx.is_cancelled() {
///             return Err(HandlerError::ExecutionFailed("cancelled".into()));
///         }
///         Ok(Some(format!("cleaned up for {}", ctx.job_id)))
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one attempt. `Ok` carries optional output to keep on the run record.
    async fn run(&self, ctx: JobContext) -> Result<Option<String>, HandlerError>;
}

/// Handler backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<String>, HandlerError>> + Send,
{
    async fn run(&self, ctx: JobContext) -> Result<Option<String>, HandlerError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// What to do when a job comes due while a previous run is still in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Record a skipped run and do not invoke the handler.
    #[default]
    Skip,
    /// Start the run once the current one finishes.
    Queue,
    /// Run alongside the current one.
    Concurrent,
}

/// A schedulable job.
#[derive(Clone)]
pub struct JobDefinition {
    id: JobId,
    name: String,
    description: Option<String>,
    rule: RecurrenceRule,
    handler: Arc<dyn JobHandler>,
    max_duration: Option<Duration>,
    retry: RetryPolicy,
    overlap: OverlapPolicy,
    depends_on: Vec<JobId>,
    environments: Vec<String>,
    enabled: bool,
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("rule", &self.rule)
            .field("max_duration", &self.max_duration)
            .field("retry", &self.retry)
            .field("overlap", &self.overlap)
            .field("depends_on", &self.depends_on)
            .field("environments", &self.environments)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl JobDefinition {
    /// Create a job. The name defaults to the id.
    pub fn new(id: impl Into<JobId>, rule: RecurrenceRule, handler: Arc<dyn JobHandler>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            description: None,
            rule,
            handler,
            max_duration: None,
            retry: RetryPolicy::default(),
            overlap: OverlapPolicy::default(),
            depends_on: Vec::new(),
            environments: Vec::new(),
            enabled: true,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Cap how long one attempt may run.
    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = Some(max);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the overlap policy.
    pub fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    /// Require `job_id`'s latest run to have succeeded before this job fires.
    pub fn depends_on(mut self, job_id: impl Into<JobId>) -> Self {
        self.depends_on.push(job_id.into());
        self
    }

    /// Restrict the job to the named environments.
    pub fn with_environments<I, S>(mut self, environments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environments = environments.into_iter().map(Into::into).collect();
        self
    }

    /// Set whether the job starts unpaused.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn rule(&self) -> &RecurrenceRule {
        &self.rule
    }

    pub fn handler(&self) -> &Arc<dyn JobHandler> {
        &self.handler
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn overlap(&self) -> OverlapPolicy {
        self.overlap
    }

    pub fn dependencies(&self) -> &[JobId] {
        &self.depends_on
    }

    pub fn environments(&self) -> &[String] {
        &self.environments
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the job may run in `environment`.
    ///
    /// An empty allow-list matches everything. A restricted job never runs
    /// when no environment is configured.
    pub fn runs_in(&self, environment: Option<&str>) -> bool {
        if self.environments.is_empty() {
            return true;
        }
        environment.is_some_and(|env| self.environments.iter().any(|e| e == env))
    }

    /// Validate the definition on its own. Dependency existence is checked
    /// by the registry.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.id.is_blank() {
            return Err(JobError::EmptyId);
        }
        self.rule.validate()?;
        self.retry.validate()?;

        if self.max_duration.is_some_and(|d| d.is_zero()) {
            return Err(JobError::InvalidConfig(
                "max_duration must be positive".into(),
            ));
        }

        let mut seen = HashSet::new();
        for dep in &self.depends_on {
            if dep == &self.id {
                return Err(JobError::InvalidDependency(
                    "job cannot depend on itself".to_string(),
                ));
            }
            if !seen.insert(dep) {
                return Err(JobError::InvalidDependency(format!(
                    "duplicate dependency '{}'",
                    dep
                )));
            }
        }

        Ok(())
    }
}
