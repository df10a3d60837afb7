//! Run dispatch and supervision.
//!
//! The [`Dispatcher`] admits due occurrences under each job's overlap
//! policy, records them in storage, runs the handler on its own task with a
//! timeout, and writes the outcome back. Failed runs are queued for retry
//! with the job's backoff; the scheduler loop collects them once due.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::core::clock::Clock;
use crate::core::job::{HandlerError, JobContext, JobDefinition, OverlapPolicy};
use crate::core::retry::RetryCondition;
use crate::core::types::{JobId, RunId};
use crate::events::{Event, EventBus, SkipReason};
use crate::scheduler::SchedulerError;
use crate::storage::{NewRun, RunCompletion, RunOutcome, RunRecord, RunTrigger, Storage};

/// Queued occurrences kept per job under [`OverlapPolicy::Queue`].
const MAX_QUEUED_PER_JOB: usize = 16;

/// Recent records scanned when looking for a dependency's latest executed run.
const DEPENDENCY_SCAN_LIMIT: usize = 20;

/// Polling interval while waiting for in-flight runs to finish.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) const ABANDONED_MESSAGE: &str = "abandoned after shutdown grace period";

/// Result of offering an occurrence to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A run started.
    Started(RunId),
    /// Another run is in flight; this one will start when it finishes.
    Queued,
    /// Another run is in flight; a skip record was written.
    Skipped(RunId),
}

impl DispatchOutcome {
    /// Id of the run record written for this dispatch, if any.
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            DispatchOutcome::Started(id) | DispatchOutcome::Skipped(id) => Some(id),
            DispatchOutcome::Queued => None,
        }
    }
}

/// A failed run waiting for its backoff to elapse.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRetry {
    pub job_id: JobId,
    /// Occurrence being retried.
    pub scheduled_at: DateTime<Utc>,
    /// Attempt number the retry will run as.
    pub attempt: u32,
    /// What started the first attempt.
    pub trigger: RunTrigger,
    pub due_at: DateTime<Utc>,
}

/// A run currently executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningJob {
    pub run_id: RunId,
    pub job_id: JobId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

struct QueuedRun {
    job: Arc<JobDefinition>,
    scheduled_at: DateTime<Utc>,
    attempt: u32,
    trigger: RunTrigger,
}

#[derive(Default)]
struct Slot {
    running: usize,
    queued: VecDeque<QueuedRun>,
}

struct RunningExecution {
    info: RunningJob,
    cancel: CancellationToken,
    monitor: Option<AbortHandle>,
}

enum Admission {
    Run,
    Queued,
    Skip,
}

enum Finished {
    Returned(Result<Option<String>, HandlerError>),
    Panicked(String),
    TimedOut(Duration),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Starts and supervises job runs.
pub struct Dispatcher {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    default_timeout: Option<Duration>,
    max_runs_per_job: Option<usize>,
    slots: Mutex<HashMap<JobId, Slot>>,
    running: Mutex<HashMap<RunId, RunningExecution>>,
    retries: Mutex<Vec<PendingRetry>>,
    last_known: Mutex<HashMap<JobId, RunRecord>>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, events: Arc<EventBus>) -> Self {
        Self {
            storage,
            clock,
            events,
            default_timeout: None,
            max_runs_per_job: None,
            slots: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            retries: Mutex::new(Vec::new()),
            last_known: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Timeout for jobs without their own max duration.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Prune each job's history to this many records after every run.
    pub fn with_max_runs_per_job(mut self, keep: Option<usize>) -> Self {
        self.max_runs_per_job = keep;
        self
    }

    /// Offer an occurrence for execution.
    ///
    /// Admission is decided under one lock, so two concurrent dispatches of
    /// a job with [`OverlapPolicy::Skip`] never both start.
    pub async fn dispatch(
        self: &Arc<Self>,
        job: Arc<JobDefinition>,
        scheduled_at: DateTime<Utc>,
        attempt: u32,
    ) -> Result<DispatchOutcome, SchedulerError> {
        self.dispatch_as(job, scheduled_at, attempt, RunTrigger::Schedule)
            .await
    }

    /// Like [`Dispatcher::dispatch`], recording what started the run.
    pub async fn dispatch_as(
        self: &Arc<Self>,
        job: Arc<JobDefinition>,
        scheduled_at: DateTime<Utc>,
        attempt: u32,
        trigger: RunTrigger,
    ) -> Result<DispatchOutcome, SchedulerError> {
        if self.is_closed() {
            return Err(SchedulerError::ShuttingDown);
        }

        match self.admit(&job, scheduled_at, attempt, trigger) {
            Admission::Run => Ok(DispatchOutcome::Started(
                self.start_run(job, scheduled_at, attempt, trigger).await,
            )),
            Admission::Queued => {
                tracing::debug!(job_id = %job.id(), "Run queued behind in-flight run");
                Ok(DispatchOutcome::Queued)
            }
            Admission::Skip => Ok(DispatchOutcome::Skipped(
                self.record_skip(&job, scheduled_at, attempt, trigger).await,
            )),
        }
    }

    fn admit(
        &self,
        job: &Arc<JobDefinition>,
        scheduled_at: DateTime<Utc>,
        attempt: u32,
        trigger: RunTrigger,
    ) -> Admission {
        let mut slots = lock(&self.slots);
        let slot = slots.entry(job.id().clone()).or_default();

        if slot.running == 0 {
            slot.running = 1;
            return Admission::Run;
        }

        match job.overlap() {
            OverlapPolicy::Concurrent => {
                slot.running += 1;
                Admission::Run
            }
            OverlapPolicy::Skip => Admission::Skip,
            OverlapPolicy::Queue if slot.queued.len() < MAX_QUEUED_PER_JOB => {
                slot.queued.push_back(QueuedRun {
                    job: Arc::clone(job),
                    scheduled_at,
                    attempt,
                    trigger,
                });
                Admission::Queued
            }
            OverlapPolicy::Queue => {
                tracing::warn!(
                    job_id = %job.id(),
                    limit = MAX_QUEUED_PER_JOB,
                    "Run queue full, skipping occurrence"
                );
                Admission::Skip
            }
        }
    }

    async fn record_skip(
        &self,
        job: &JobDefinition,
        scheduled_at: DateTime<Utc>,
        attempt: u32,
        trigger: RunTrigger,
    ) -> RunId {
        let now = self.clock.now();
        let run = NewRun::new(job.id().clone(), scheduled_at, now, attempt)
            .with_trigger(trigger)
            .skipped("previous run still in flight");
        let local_id = run.id.clone();

        let run_id = match self.storage.record_start(run).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(job_id = %job.id(), error = %e, "Failed to record skipped run");
                local_id
            }
        };

        tracing::info!(job_id = %job.id(), %scheduled_at, "Skipping run, previous run still in flight");
        self.events
            .emit(Event::JobSkipped {
                job_id: job.id().clone(),
                scheduled_at,
                reason: SkipReason::Overlap,
                timestamp: now,
            })
            .await;
        run_id
    }

    /// Start a run on a new supervising task. The caller must already hold a
    /// slot for the job.
    async fn start_run(
        self: &Arc<Self>,
        job: Arc<JobDefinition>,
        scheduled_at: DateTime<Utc>,
        attempt: u32,
        trigger: RunTrigger,
    ) -> RunId {
        let (record, cancel) = self
            .begin_run(&job, scheduled_at, attempt, trigger, None)
            .await;
        let run_id = record.id.clone();

        let this = Arc::clone(self);
        let monitor = tokio::spawn(async move { this.supervise(job, record, cancel).await });
        if let Some(entry) = lock(&self.running).get_mut(&run_id) {
            entry.monitor = Some(monitor.abort_handle());
        }

        run_id
    }

    /// Record the start of a run and make it visible as in flight.
    async fn begin_run(
        &self,
        job: &JobDefinition,
        scheduled_at: DateTime<Utc>,
        attempt: u32,
        trigger: RunTrigger,
        monitor: Option<AbortHandle>,
    ) -> (RunRecord, CancellationToken) {
        let now = self.clock.now();
        let run = NewRun::new(job.id().clone(), scheduled_at, now, attempt).with_trigger(trigger);
        let mut record = run.clone().into_record();

        match self.storage.record_start(run).await {
            Ok(id) => record.id = id,
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id(),
                    error = %e,
                    "Failed to record run start, continuing without storage"
                );
            }
        }

        tracing::info!(job_id = %job.id(), run_id = %record.id, attempt, "Starting run");

        let cancel = CancellationToken::new();
        lock(&self.running).insert(
            record.id.clone(),
            RunningExecution {
                info: RunningJob {
                    run_id: record.id.clone(),
                    job_id: job.id().clone(),
                    attempt,
                    started_at: now,
                },
                cancel: cancel.clone(),
                monitor,
            },
        );

        self.events
            .emit(Event::JobStarted {
                job_id: job.id().clone(),
                run_id: record.id.clone(),
                scheduled_at,
                attempt,
                timestamp: now,
            })
            .await;

        (record, cancel)
    }

    /// Run the handler, record the outcome, then keep going with any run
    /// queued behind this one.
    async fn supervise(
        self: Arc<Self>,
        mut job: Arc<JobDefinition>,
        mut record: RunRecord,
        mut cancel: CancellationToken,
    ) {
        loop {
            let (completion, transient) = self.execute(&job, &record, &cancel).await;
            let Some((next, monitor)) = self.finish(&job, record, completion, transient).await else {
                return;
            };
            (record, cancel) = self
                .begin_run(&next.job, next.scheduled_at, next.attempt, next.trigger, monitor)
                .await;
            job = next.job;
        }
    }

    async fn execute(
        &self,
        job: &JobDefinition,
        record: &RunRecord,
        cancel: &CancellationToken,
    ) -> (RunCompletion, bool) {
        let ctx = JobContext {
            job_id: record.job_id.clone(),
            run_id: record.id.clone(),
            scheduled_at: record.scheduled_at,
            attempt: record.attempt,
            cancellation: cancel.clone(),
        };
        let handler = Arc::clone(job.handler());
        let mut task = tokio::spawn(async move { handler.run(ctx).await });

        let joined = match job.max_duration().or(self.default_timeout) {
            Some(limit) => tokio::time::timeout(limit, &mut task)
                .await
                .map_err(|_| limit),
            None => Ok((&mut task).await),
        };

        let finished = match joined {
            Ok(Ok(result)) => Finished::Returned(result),
            Ok(Err(join_error)) if join_error.is_panic() => {
                Finished::Panicked(panic_message(join_error.into_panic()))
            }
            Ok(Err(_)) => Finished::Panicked("handler task was cancelled".to_string()),
            Err(limit) => {
                // The handler task is detached; the token asks it to stop.
                cancel.cancel();
                Finished::TimedOut(limit)
            }
        };

        let now = self.clock.now();
        match finished {
            Finished::Returned(Ok(output)) => (RunCompletion::success(now, output), false),
            Finished::Returned(Err(e)) => {
                let transient = e.is_transient();
                (RunCompletion::failure(now, e.to_string()), transient)
            }
            Finished::Panicked(message) => (
                RunCompletion::failure(now, format!("handler panicked: {}", message)),
                false,
            ),
            Finished::TimedOut(limit) => (
                RunCompletion::timeout(now, format!("exceeded max duration of {:?}", limit)),
                false,
            ),
        }
    }

    /// Close out a run. Returns the queued run that inherits the slot, along
    /// with the supervising task's abort handle.
    async fn finish(
        &self,
        job: &Arc<JobDefinition>,
        mut record: RunRecord,
        completion: RunCompletion,
        transient: bool,
    ) -> Option<(QueuedRun, Option<AbortHandle>)> {
        let record = match self.storage.record_end(&record.id, completion.clone()).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(
                    job_id = %record.job_id,
                    run_id = %record.id,
                    error = %e,
                    "Failed to record run end"
                );
                completion.apply(&mut record);
                record
            }
        };

        match record.outcome {
            RunOutcome::Success => tracing::info!(
                job_id = %record.job_id,
                run_id = %record.id,
                "Run succeeded"
            ),
            _ => tracing::warn!(
                job_id = %record.job_id,
                run_id = %record.id,
                outcome = %record.outcome,
                error = record.error.as_deref().unwrap_or(""),
                "Run did not succeed"
            ),
        }

        self.persist_finished(&record).await;
        self.schedule_retry(job, &record, transient).await;

        let monitor = lock(&self.running)
            .remove(&record.id)
            .and_then(|e| e.monitor);
        let next = self.release_slot(job.id());

        self.events.emit(Event::job_completed(record)).await;

        next.map(|next| (next, monitor))
    }

    async fn persist_finished(&self, record: &RunRecord) {
        if let Err(e) = self.storage.update_run_status(record).await {
            tracing::warn!(job_id = %record.job_id, error = %e, "Failed to update job status");
        }
        if let Some(keep) = self.max_runs_per_job {
            match self.storage.prune_runs(&record.job_id, keep).await {
                Ok(0) => {}
                Ok(pruned) => tracing::debug!(job_id = %record.job_id, pruned, "Pruned run history"),
                Err(e) => tracing::warn!(job_id = %record.job_id, error = %e, "Failed to prune run history"),
            }
        }
        lock(&self.last_known).insert(record.job_id.clone(), record.clone());
    }

    async fn schedule_retry(&self, job: &JobDefinition, record: &RunRecord, transient: bool) {
        let policy = job.retry();
        let retryable = match (record.outcome, policy.retry_on) {
            (_, RetryCondition::Never) => false,
            (RunOutcome::Failure, RetryCondition::Always) => true,
            (RunOutcome::Failure, RetryCondition::TransientOnly) => transient,
            (RunOutcome::Timeout, _) => true,
            _ => false,
        };
        if !retryable || !policy.should_retry(record.attempt) || self.is_closed() {
            return;
        }

        let ended_at = record.ended_at.unwrap_or(record.started_at);
        let delay = chrono::Duration::from_std(policy.delay_for(record.attempt))
            .unwrap_or(chrono::Duration::MAX);
        let due_at = ended_at
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let retry = PendingRetry {
            job_id: record.job_id.clone(),
            scheduled_at: record.scheduled_at,
            attempt: record.attempt + 1,
            trigger: record.trigger,
            due_at,
        };

        tracing::info!(
            job_id = %retry.job_id,
            attempt = retry.attempt,
            %due_at,
            "Scheduling retry"
        );
        lock(&self.retries).push(retry.clone());

        self.events
            .emit(Event::RetryScheduled {
                job_id: retry.job_id,
                attempt: retry.attempt,
                due_at,
                timestamp: ended_at,
            })
            .await;
    }

    /// Give the job's slot to the next queued run, or free it.
    fn release_slot(&self, job_id: &JobId) -> Option<QueuedRun> {
        let mut slots = lock(&self.slots);
        let slot = slots.get_mut(job_id)?;

        if !self.is_closed() {
            if let Some(next) = slot.queued.pop_front() {
                return Some(next);
            }
        }

        slot.running = slot.running.saturating_sub(1);
        if slot.running == 0 && slot.queued.is_empty() {
            slots.remove(job_id);
        }
        None
    }

    /// Remove and return retries due at or before `now`, earliest first.
    pub fn take_due_retries(&self, now: DateTime<Utc>) -> Vec<PendingRetry> {
        let mut retries = lock(&self.retries);
        let (mut due, pending): (Vec<_>, Vec<_>) =
            retries.drain(..).partition(|r| r.due_at <= now);
        *retries = pending;
        due.sort_by_key(|r| r.due_at);
        due
    }

    /// Retries waiting for their backoff, earliest first.
    pub fn pending_retries(&self) -> Vec<PendingRetry> {
        let mut pending = lock(&self.retries).clone();
        pending.sort_by_key(|r| r.due_at);
        pending
    }

    /// Drop queued runs and pending retries for a job.
    pub fn forget_job(&self, job_id: &JobId) {
        lock(&self.retries).retain(|r| &r.job_id != job_id);
        if let Some(slot) = lock(&self.slots).get_mut(job_id) {
            slot.queued.clear();
        }
    }

    /// Runs currently executing.
    pub fn running_jobs(&self) -> Vec<RunningJob> {
        let mut jobs: Vec<_> = lock(&self.running).values().map(|e| e.info.clone()).collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    /// Number of runs currently executing.
    pub fn in_flight(&self) -> usize {
        lock(&self.running).len()
    }

    pub fn is_running(&self, job_id: &JobId) -> bool {
        lock(&self.running).values().any(|e| &e.info.job_id == job_id)
    }

    /// Whether no run is executing or waiting in a queue.
    pub fn is_idle(&self) -> bool {
        lock(&self.slots).is_empty()
    }

    /// Most recent executed run seen by this process.
    pub fn last_known(&self, job_id: &JobId) -> Option<RunRecord> {
        lock(&self.last_known).get(job_id).cloned()
    }

    /// Most recent run of a job, preferring storage.
    pub async fn last_run(&self, job_id: &JobId) -> Result<Option<RunRecord>, SchedulerError> {
        match self.storage.last_run(job_id).await {
            Ok(record) => Ok(record),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Storage unavailable, using last known run");
                match self.last_known(job_id) {
                    Some(known) => Ok(Some(known)),
                    None => Err(e.into()),
                }
            }
        }
    }

    /// Whether the latest executed run of `dependency` succeeded.
    pub async fn dependency_satisfied(&self, dependency: &JobId) -> bool {
        let stored = match self.storage.list_runs(dependency, DEPENDENCY_SCAN_LIMIT).await {
            Ok(runs) => runs.into_iter().find(|r| r.outcome.is_executed()),
            Err(e) => {
                tracing::warn!(job_id = %dependency, error = %e, "Failed to read dependency history");
                None
            }
        };

        let latest = match (stored, self.last_known(dependency)) {
            (Some(stored), Some(known)) if known.started_at > stored.started_at => Some(known),
            (Some(stored), _) => Some(stored),
            (None, known) => known,
        };

        latest.is_some_and(|r| r.outcome == RunOutcome::Success)
    }

    /// Refuse new runs and drop queued runs and pending retries. Returns the
    /// number dropped.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut dropped = lock(&self.retries).drain(..).count();
        for slot in lock(&self.slots).values_mut() {
            dropped += slot.queued.len();
            slot.queued.clear();
        }
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until no run is in flight. Returns false if `grace` elapsed first.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.is_idle() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    /// Cancel whatever is still running and close its record as a timeout.
    pub async fn abandon_running(&self) -> usize {
        let abandoned: Vec<RunningExecution> =
            lock(&self.running).drain().map(|(_, e)| e).collect();
        lock(&self.slots).clear();

        let now = self.clock.now();
        for execution in &abandoned {
            execution.cancel.cancel();
            if let Some(monitor) = &execution.monitor {
                monitor.abort();
            }

            let run_id = &execution.info.run_id;
            tracing::warn!(
                job_id = %execution.info.job_id,
                run_id = %run_id,
                "Abandoning run after shutdown grace period"
            );
            match self
                .storage
                .record_end(run_id, RunCompletion::timeout(now, ABANDONED_MESSAGE))
                .await
            {
                Ok(record) => {
                    if let Err(e) = self.storage.update_run_status(&record).await {
                        tracing::warn!(job_id = %record.job_id, error = %e, "Failed to update job status");
                    }
                    self.events.emit(Event::job_completed(record)).await;
                }
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "Failed to record abandoned run");
                }
            }
        }
        abandoned.len()
    }

    /// Drop bookkeeping for supervising tasks that exited without finishing
    /// their run.
    pub fn cleanup_finished(&self) {
        let mut running = lock(&self.running);
        let before = running.len();
        running.retain(|_, e| e.monitor.as_ref().is_none_or(|m| !m.is_finished()));
        let removed = before - running.len();
        if removed > 0 {
            tracing::debug!(removed, "Cleaned up finished run monitors");
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
