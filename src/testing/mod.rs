//! Testing utilities for users of the tickwork library.
//!
//! This module provides helpers for testing scheduling behavior:
//!
//! - [`CountingHandler`]: A handler that succeeds and counts its runs
//! - [`FailingHandler`]: A handler that fails N times then succeeds
//! - [`GatedHandler`]: A handler that blocks until released
//! - [`SleepHandler`]: A handler that sleeps, optionally ignoring cancellation
//! - [`RecordingEventHandler`]: Captures lifecycle events
//! - [`FailingStorage`]: In-memory storage with switchable failures

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::job::{HandlerError, JobContext, JobHandler};
use crate::core::types::{JobId, RunId};
use crate::events::{Event, EventHandler, SkipReason};
use crate::storage::{
    InMemoryStorage, JobStatus, NewRun, RunCompletion, RunRecord, Storage, StorageError,
};

/// A handler that succeeds and counts how often it ran.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tickwork::testing::CountingHandler;
/// use tickwork::{JobDefinition, RecurrenceRule};
///
/// let counter = CountingHandler::new();
/// let job = JobDefinition::new("tick", RecurrenceRule::every(Duration::from_secs(1)), counter.clone());
/// assert_eq!(counter.count(), 0);
/// # let _ = job;
/// ```
#[derive(Default)]
pub struct CountingHandler {
    count: AtomicU32,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of completed runs.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn run(&self, _ctx: JobContext) -> Result<Option<String>, HandlerError> {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(format!("run {}", n)))
    }
}

/// A handler that fails a configurable number of times before succeeding.
///
/// Useful for testing retry logic and error handling.
///
/// ```
/// use tickwork::testing::FailingHandler;
///
/// // Fails 2 times, then succeeds on the 3rd attempt
/// let handler = FailingHandler::new(2);
/// ```
pub struct FailingHandler {
    state: Mutex<FailingHandlerState>,
    error_message: String,
    transient: bool,
}

struct FailingHandlerState {
    failures_remaining: u32,
    call_count: u32,
}

impl FailingHandler {
    /// Create a handler that fails `fail_count` times then succeeds.
    pub fn new(fail_count: u32) -> Arc<Self> {
        Arc::new(Self::build(fail_count, false))
    }

    /// Create a handler that never succeeds.
    pub fn always() -> Arc<Self> {
        Arc::new(Self::build(u32::MAX, false))
    }

    /// Like [`FailingHandler::new`], but failures are transient.
    pub fn transient(fail_count: u32) -> Arc<Self> {
        Arc::new(Self::build(fail_count, true))
    }

    fn build(fail_count: u32, transient: bool) -> Self {
        Self {
            state: Mutex::new(FailingHandlerState {
                failures_remaining: fail_count,
                call_count: 0,
            }),
            error_message: "intentional test failure".to_string(),
            transient,
        }
    }

    /// Get the number of times this handler has been called.
    pub async fn call_count(&self) -> u32 {
        self.state.lock().await.call_count
    }

    /// Get the number of failures remaining before success.
    pub async fn failures_remaining(&self) -> u32 {
        self.state.lock().await.failures_remaining
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn run(&self, _ctx: JobContext) -> Result<Option<String>, HandlerError> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            if self.transient {
                Err(HandlerError::Transient(self.error_message.clone()))
            } else {
                Err(HandlerError::ExecutionFailed(self.error_message.clone()))
            }
        } else {
            Ok(None)
        }
    }
}

/// A handler that blocks until [`GatedHandler::release`] is called.
///
/// Every run after the release passes straight through.
#[derive(Default)]
pub struct GatedHandler {
    gate: CancellationToken,
    started: AtomicU32,
    finished: AtomicU32,
}

impl GatedHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Let waiting and future runs complete.
    pub fn release(&self) {
        self.gate.cancel();
    }

    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> u32 {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for GatedHandler {
    async fn run(&self, ctx: JobContext) -> Result<Option<String>, HandlerError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = self.gate.cancelled() => {}
            _ = ctx.cancelled() => {
                return Err(HandlerError::ExecutionFailed("cancelled".into()));
            }
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

/// A handler that sleeps for a fixed duration.
pub struct SleepHandler {
    duration: Duration,
    honor_cancellation: bool,
    completed: AtomicBool,
}

impl SleepHandler {
    /// Sleep, stopping early if the run is cancelled.
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            honor_cancellation: true,
            completed: AtomicBool::new(false),
        })
    }

    /// Sleep the full duration whatever happens.
    pub fn stubborn(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            honor_cancellation: false,
            completed: AtomicBool::new(false),
        })
    }

    /// Whether a run slept to the end.
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for SleepHandler {
    async fn run(&self, ctx: JobContext) -> Result<Option<String>, HandlerError> {
        if self.honor_cancellation {
            tokio::select! {
                _ = tokio::time::sleep(self.duration) => {}
                _ = ctx.cancelled() => {
                    return Err(HandlerError::ExecutionFailed("cancelled".into()));
                }
            }
        } else {
            tokio::time::sleep(self.duration).await;
        }
        self.completed.store(true, Ordering::SeqCst);
        Ok(None)
    }
}

/// Event handler that records every event it receives.
#[derive(Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Final records of completed runs, in completion order.
    pub async fn completed(&self) -> Vec<RunRecord> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                Event::JobCompleted { record, .. } => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    /// Skipped occurrences with their reasons.
    pub async fn skipped(&self) -> Vec<(JobId, SkipReason)> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                Event::JobSkipped { job_id, reason, .. } => Some((job_id.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    /// Wait until at least `n` runs have completed.
    pub async fn wait_for_completions(&self, n: usize, timeout: Duration) -> Vec<RunRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let completed = self.completed().await;
            if completed.len() >= n || tokio::time::Instant::now() >= deadline {
                return completed;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// A storage wrapper that can be configured to fail.
///
/// Wraps [`InMemoryStorage`] and returns [`StorageError::Unavailable`] for
/// reads or writes while the matching switch is on.
#[derive(Default)]
pub struct FailingStorage {
    inner: InMemoryStorage,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FailingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The wrapped storage, bypassing injected failures.
    pub fn inner(&self) -> &InMemoryStorage {
        &self.inner
    }

    fn read(&self, op: &str) -> Result<(), StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("injected {} error", op)));
        }
        Ok(())
    }

    fn write(&self, op: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("injected {} error", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FailingStorage {
    async fn record_start(&self, run: NewRun) -> Result<RunId, StorageError> {
        self.write("record_start")?;
        self.inner.record_start(run).await
    }

    async fn record_end(
        &self,
        id: &RunId,
        completion: RunCompletion,
    ) -> Result<RunRecord, StorageError> {
        self.write("record_end")?;
        self.inner.record_end(id, completion).await
    }

    async fn get_run(&self, id: &RunId) -> Result<RunRecord, StorageError> {
        self.read("get_run")?;
        self.inner.get_run(id).await
    }

    async fn last_run(&self, job_id: &JobId) -> Result<Option<RunRecord>, StorageError> {
        self.read("last_run")?;
        self.inner.last_run(job_id).await
    }

    async fn is_running(&self, job_id: &JobId) -> Result<bool, StorageError> {
        self.read("is_running")?;
        self.inner.is_running(job_id).await
    }

    async fn list_runs(&self, job_id: &JobId, limit: usize) -> Result<Vec<RunRecord>, StorageError> {
        self.read("list_runs")?;
        self.inner.list_runs(job_id, limit).await
    }

    async fn reconcile_interrupted(&self, at: DateTime<Utc>) -> Result<Vec<RunRecord>, StorageError> {
        self.write("reconcile_interrupted")?;
        self.inner.reconcile_interrupted(at).await
    }

    async fn prune_runs(&self, job_id: &JobId, keep: usize) -> Result<usize, StorageError> {
        self.write("prune_runs")?;
        self.inner.prune_runs(job_id, keep).await
    }

    async fn update_schedule_status(
        &self,
        job_id: &JobId,
        paused: bool,
        next_run_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.write("update_schedule_status")?;
        self.inner
            .update_schedule_status(job_id, paused, next_run_at, at)
            .await
    }

    async fn update_run_status(&self, record: &RunRecord) -> Result<(), StorageError> {
        self.write("update_run_status")?;
        self.inner.update_run_status(record).await
    }

    async fn get_status(&self, job_id: &JobId) -> Result<Option<JobStatus>, StorageError> {
        self.read("get_status")?;
        self.inner.get_status(job_id).await
    }

    async fn list_statuses(&self) -> Result<Vec<JobStatus>, StorageError> {
        self.read("list_statuses")?;
        self.inner.list_statuses().await
    }

    async fn delete_status(&self, job_id: &JobId) -> Result<(), StorageError> {
        self.write("delete_status")?;
        self.inner.delete_status(job_id).await
    }
}
