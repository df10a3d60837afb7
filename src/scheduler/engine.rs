//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Firing jobs when their recurrence rule comes due
//! - Applying the missed-tick policy after stalls and restarts
//! - Gating runs on cross-job dependencies
//! - Dispatching retries once their backoff has elapsed
//! - Recovering runs interrupted by a crash
//! - Draining in-flight runs on shutdown

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::registry::{JobRegistry, JobSummary};
use super::types::{LoopState, MissedTickPolicy, SchedulerCommand, SchedulerConfig, SchedulerError};
use crate::core::clock::{Clock, SystemClock};
use crate::core::job::JobDefinition;
use crate::core::types::JobId;
use crate::events::{Event, EventBus, SkipReason};
use crate::execution::{DispatchOutcome, Dispatcher, PendingRetry, RunningJob};
use crate::storage::{RunRecord, RunTrigger, Storage};

/// Run history searched for the latest scheduled occurrence on startup.
const ANCHOR_SCAN_LIMIT: usize = 100;

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Scheduled occurrences offered to the dispatcher.
    pub dispatched: Vec<(JobId, DispatchOutcome)>,
    /// Retries offered to the dispatcher.
    pub retried: Vec<(JobId, DispatchOutcome)>,
    /// Occurrences dropped by the missed-tick policy.
    pub misfired: Vec<JobId>,
    /// Occurrences held back by an unmet dependency.
    pub blocked: Vec<JobId>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty()
            && self.retried.is_empty()
            && self.misfired.is_empty()
            && self.blocked.is_empty()
    }
}

/// Shared scheduler state. Cloning is cheap; every clone sees the same
/// registry, dispatcher and storage.
#[derive(Clone)]
pub struct SchedulerState {
    pub(crate) config: Arc<SchedulerConfig>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) loop_state: Arc<RwLock<LoopState>>,
}

impl SchedulerState {
    fn build(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        storage: Arc<dyn Storage>,
        events: Arc<EventBus>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        let dispatcher = Dispatcher::new(Arc::clone(&storage), Arc::clone(&clock), Arc::clone(&events))
            .with_default_timeout(config.default_timeout)
            .with_max_runs_per_job(config.max_runs_per_job);

        Self {
            config: Arc::new(config),
            clock,
            storage,
            events,
            registry,
            dispatcher: Arc::new(dispatcher),
            loop_state: Arc::new(RwLock::new(LoopState::Idle)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Add a job and publish its schedule status.
    pub async fn register(&self, job: JobDefinition) -> Result<JobSummary, SchedulerError> {
        let job = self.registry.register(job, self.now())?;
        tracing::info!(job_id = %job.id(), rule = %job.rule(), "Registered job");
        let summary = self
            .registry
            .summary(job.id())
            .ok_or_else(|| SchedulerError::NotFound(job.id().clone()))?;
        self.publish_schedule(&summary).await;
        Ok(summary)
    }

    /// Remove a job. Queued runs and pending retries are dropped; a run in
    /// flight finishes normally.
    pub async fn deregister(&self, job_id: &JobId) -> Result<(), SchedulerError> {
        self.registry.deregister(job_id)?;
        self.dispatcher.forget_job(job_id);
        tracing::info!(job_id = %job_id, "Deregistered job");

        if let Err(e) = self.storage.delete_status(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to delete job status");
        }
        Ok(())
    }

    /// Pause or resume a single job.
    pub async fn set_job_paused(&self, job_id: &JobId, paused: bool) -> Result<JobSummary, SchedulerError> {
        let summary = self.registry.set_paused(job_id, paused, self.now())?;
        tracing::info!(job_id = %job_id, paused, "Job pause state changed");
        self.publish_schedule(&summary).await;
        Ok(summary)
    }

    /// Evaluate schedules and retries once at the clock's current time.
    pub async fn tick(&self) -> TickReport {
        let now = self.now();
        let mut report = TickReport::default();

        let due = self.registry.collect_due(
            now,
            self.config.missed_ticks,
            self.config.misfire_threshold(),
            self.config.environment.as_deref(),
        );

        for occurrence in due {
            let job = occurrence.job;
            self.publish_status(job.id(), false, occurrence.next_due).await;

            if !occurrence.fire {
                tracing::info!(
                    job_id = %job.id(),
                    scheduled_at = %occurrence.scheduled_at,
                    skipped = occurrence.skipped,
                    "Occurrence older than misfire threshold, skipping"
                );
                self.events
                    .emit(Event::JobSkipped {
                        job_id: job.id().clone(),
                        scheduled_at: occurrence.scheduled_at,
                        reason: SkipReason::Misfire,
                        timestamp: now,
                    })
                    .await;
                report.misfired.push(job.id().clone());
                continue;
            }

            if occurrence.skipped > 0 {
                tracing::info!(
                    job_id = %job.id(),
                    skipped = occurrence.skipped,
                    "Collapsed missed occurrences into one run"
                );
            }

            if let Some(dependency) = self.unmet_dependency(&job).await {
                tracing::info!(
                    job_id = %job.id(),
                    dependency = %dependency,
                    "Dependency not satisfied, skipping occurrence"
                );
                self.events
                    .emit(Event::JobSkipped {
                        job_id: job.id().clone(),
                        scheduled_at: occurrence.scheduled_at,
                        reason: SkipReason::DependencyNotMet { dependency },
                        timestamp: now,
                    })
                    .await;
                report.blocked.push(job.id().clone());
                continue;
            }

            match self
                .dispatcher
                .dispatch(Arc::clone(&job), occurrence.scheduled_at, 1)
                .await
            {
                Ok(outcome) => report.dispatched.push((job.id().clone(), outcome)),
                Err(e) => tracing::warn!(job_id = %job.id(), error = %e, "Failed to dispatch job"),
            }
        }

        for retry in self.dispatcher.take_due_retries(now) {
            // Retries run the current definition.
            let Some(current) = self.registry.get(&retry.job_id) else {
                tracing::debug!(job_id = %retry.job_id, "Dropping retry for deregistered job");
                continue;
            };

            match self
                .dispatcher
                .dispatch_as(current, retry.scheduled_at, retry.attempt, retry.trigger)
                .await
            {
                Ok(outcome) => report.retried.push((retry.job_id, outcome)),
                Err(e) => tracing::warn!(job_id = %retry.job_id, error = %e, "Failed to dispatch retry"),
            }
        }

        self.dispatcher.cleanup_finished();
        report
    }

    /// Force a run now. Respects the overlap policy and dependencies, and
    /// works while the job or the scheduler is paused.
    pub async fn trigger(&self, job_id: &JobId) -> Result<DispatchOutcome, SchedulerError> {
        let job = self
            .registry
            .get(job_id)
            .ok_or_else(|| SchedulerError::NotFound(job_id.clone()))?;

        if let Some(dependency) = self.unmet_dependency(&job).await {
            return Err(SchedulerError::DependencyNotSatisfied(format!(
                "job '{}' requires a successful run of '{}'",
                job_id, dependency
            )));
        }

        tracing::info!(job_id = %job_id, "Manually triggering job");
        self.dispatcher
            .dispatch_as(job, self.now(), 1, RunTrigger::Manual)
            .await
    }

    /// First dependency whose latest executed run did not succeed.
    async fn unmet_dependency(&self, job: &JobDefinition) -> Option<JobId> {
        for dependency in job.dependencies() {
            if !self.dispatcher.dependency_satisfied(dependency).await {
                return Some(dependency.clone());
            }
        }
        None
    }

    /// Close runs left in progress by a previous process as interrupted.
    pub async fn recover(&self) -> Result<Vec<RunRecord>, SchedulerError> {
        let interrupted = self.storage.reconcile_interrupted(self.now()).await?;
        for record in &interrupted {
            tracing::warn!(
                job_id = %record.job_id,
                run_id = %record.id,
                "Marked run interrupted by previous shutdown"
            );
            if let Err(e) = self.storage.update_run_status(record).await {
                tracing::warn!(job_id = %record.job_id, error = %e, "Failed to update job status");
            }
        }
        Ok(interrupted)
    }

    /// Continue each job's schedule from its last scheduled occurrence so
    /// occurrences missed while stopped are seen by the missed-tick policy.
    /// Manual triggers never move the anchor.
    async fn restore_anchors(&self) {
        let now = self.now();
        for job in self.registry.list() {
            match self.storage.list_runs(job.id(), ANCHOR_SCAN_LIMIT).await {
                Ok(runs) => {
                    let anchor = runs
                        .iter()
                        .find(|r| r.trigger == RunTrigger::Schedule && r.scheduled_at < now);
                    if let Some(last) = anchor {
                        self.registry.restore_anchor(job.id(), last.scheduled_at);
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id(), error = %e, "Failed to read run history, keeping fresh schedule");
                }
            }
        }
    }

    /// Upsert status for every registered job and remove stale entries.
    async fn sync_statuses(&self) {
        let summaries = self.registry.summaries();
        let current: HashSet<JobId> = summaries.iter().map(|s| s.id.clone()).collect();

        for summary in &summaries {
            self.publish_schedule(summary).await;
        }

        match self.storage.list_statuses().await {
            Ok(statuses) => {
                for status in statuses {
                    if !current.contains(&status.job_id) {
                        tracing::info!(job_id = %status.job_id, "Removing stale job status");
                        if let Err(e) = self.storage.delete_status(&status.job_id).await {
                            tracing::warn!(job_id = %status.job_id, error = %e, "Failed to delete stale job status");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list job statuses for stale cleanup");
            }
        }
    }

    async fn publish_schedule(&self, summary: &JobSummary) {
        self.publish_status(&summary.id, summary.paused, summary.next_due)
            .await;
    }

    async fn publish_status(&self, job_id: &JobId, paused: bool, next_due: Option<DateTime<Utc>>) {
        if let Err(e) = self
            .storage
            .update_schedule_status(job_id, paused, next_due, self.now())
            .await
        {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to update job status");
        }
    }

    /// Stop accepting work, wait for in-flight runs, then abandon the rest.
    async fn drain(&self) -> usize {
        self.set_loop_state(LoopState::Draining).await;

        let dropped = self.dispatcher.close();
        if dropped > 0 {
            tracing::info!(dropped, "Dropped queued runs and pending retries");
        }

        let in_flight = self.dispatcher.in_flight();
        self.events
            .emit(Event::SchedulerDraining {
                in_flight,
                timestamp: self.now(),
            })
            .await;

        let grace = self.config.shutdown_grace;
        let abandoned = if in_flight == 0 && self.dispatcher.is_idle() {
            tracing::info!("No running jobs to wait for during shutdown");
            0
        } else {
            tracing::info!(
                "Graceful shutdown: waiting for {} running job(s) to complete (timeout: {:?})",
                in_flight,
                grace
            );
            let start = tokio::time::Instant::now();
            if self.dispatcher.wait_idle(grace).await {
                tracing::info!("All running jobs completed gracefully in {:?}", start.elapsed());
                0
            } else {
                tracing::warn!(
                    "Graceful shutdown timeout ({:?}) exceeded with {} job(s) still running",
                    grace,
                    self.dispatcher.in_flight()
                );
                self.dispatcher.abandon_running().await
            }
        };

        self.set_loop_state(LoopState::Stopped).await;
        self.events
            .emit(Event::SchedulerStopped {
                abandoned,
                timestamp: self.now(),
            })
            .await;
        abandoned
    }

    pub(crate) async fn loop_state(&self) -> LoopState {
        *self.loop_state.read().await
    }

    async fn set_loop_state(&self, state: LoopState) {
        *self.loop_state.write().await = state;
    }

    /// Main scheduler loop.
    async fn run(self, mut command_rx: mpsc::Receiver<SchedulerCommand>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.loop_state().await == LoopState::Idle {
                        self.set_loop_state(LoopState::Ticking).await;
                        let report = self.tick().await;
                        if !report.is_empty() {
                            tracing::debug!(?report, "Tick complete");
                        }
                        // A command may have changed the state meanwhile.
                        let mut state = self.loop_state.write().await;
                        if *state == LoopState::Ticking {
                            *state = LoopState::Idle;
                        }
                    } else {
                        self.dispatcher.cleanup_finished();
                    }
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        SchedulerCommand::Trigger { job_id, response } => {
                            let result = self.trigger(&job_id).await;
                            let _ = response.send(result);
                        }
                        SchedulerCommand::Pause { response } => {
                            self.set_loop_state(LoopState::Paused).await;
                            tracing::info!("Scheduler paused");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Resume { response } => {
                            let skipped = self.registry.skip_missed(self.now());
                            self.set_loop_state(LoopState::Idle).await;
                            tracing::info!(skipped, "Scheduler resumed, skipping any schedules that fired during pause");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Shutdown { response } => {
                            self.drain().await;
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Main scheduler.
pub struct Scheduler<S: Storage> {
    storage: Arc<S>,
    state: SchedulerState,
}

impl<S: Storage + 'static> Scheduler<S> {
    /// Create a new scheduler with the given storage.
    pub fn new(storage: S) -> Self {
        Self::with_storage(Arc::new(storage))
    }

    /// Create a new scheduler with shared storage.
    pub fn with_storage(storage: Arc<S>) -> Self {
        let state = SchedulerState::build(
            SchedulerConfig::default(),
            Arc::new(SystemClock),
            Arc::clone(&storage) as Arc<dyn Storage>,
            Arc::new(EventBus::new()),
            Arc::new(JobRegistry::new()),
        );
        Self { storage, state }
    }

    fn rebuild(self, update: impl FnOnce(&mut SchedulerParts)) -> Self {
        let SchedulerState {
            config,
            clock,
            storage,
            events,
            registry,
            ..
        } = self.state;
        let mut parts = SchedulerParts {
            config: (*config).clone(),
            clock,
            events,
        };
        update(&mut parts);
        Self {
            storage: self.storage,
            state: SchedulerState::build(parts.config, parts.clock, storage, parts.events, registry),
        }
    }

    /// Replace all settings at once.
    pub fn with_config(self, config: SchedulerConfig) -> Self {
        self.rebuild(|p| p.config = config)
    }

    /// Set the clock used for schedule evaluation and run timestamps.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        self.rebuild(|p| p.clock = clock)
    }

    /// Set the event bus.
    pub fn with_event_bus(self, event_bus: EventBus) -> Self {
        self.rebuild(|p| p.events = Arc::new(event_bus))
    }

    /// Set the tick interval.
    pub fn with_tick_interval(self, interval: Duration) -> Self {
        self.rebuild(|p| p.config.tick_interval = interval)
    }

    pub fn with_missed_tick_policy(self, policy: MissedTickPolicy) -> Self {
        self.rebuild(|p| p.config.missed_ticks = policy)
    }

    pub fn with_misfire_threshold(self, threshold: Duration) -> Self {
        self.rebuild(|p| p.config.misfire_threshold = Some(threshold))
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_grace(self, grace: Duration) -> Self {
        self.rebuild(|p| p.config.shutdown_grace = grace)
    }

    pub fn with_default_timeout(self, timeout: Duration) -> Self {
        self.rebuild(|p| p.config.default_timeout = Some(timeout))
    }

    pub fn with_max_runs_per_job(self, keep: usize) -> Self {
        self.rebuild(|p| p.config.max_runs_per_job = Some(keep))
    }

    /// Only run jobs allowed in this environment.
    pub fn with_environment(self, environment: impl Into<String>) -> Self {
        let environment = environment.into();
        self.rebuild(|p| p.config.environment = Some(environment))
    }

    /// Register a job with the scheduler.
    pub fn register(&self, job: JobDefinition) -> Result<(), SchedulerError> {
        let job = self.state.registry.register(job, self.state.now())?;
        tracing::info!(job_id = %job.id(), rule = %job.rule(), "Registered job");
        Ok(())
    }

    /// Remove a job before the scheduler starts.
    pub fn deregister(&self, job_id: &JobId) -> Result<(), SchedulerError> {
        self.state.registry.deregister(job_id)?;
        self.state.dispatcher.forget_job(job_id);
        Ok(())
    }

    /// Summaries of registered jobs, in registration order.
    pub fn jobs(&self) -> Vec<JobSummary> {
        self.state.registry.summaries()
    }

    pub fn get_job(&self, id: &JobId) -> Option<Arc<JobDefinition>> {
        self.state.registry.get(id)
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.state.events
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.state.config
    }

    /// Shared state, for driving the scheduler without the background loop.
    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Evaluate schedules once. Useful with a manual clock.
    pub async fn tick(&self) -> TickReport {
        self.state.tick().await
    }

    /// Run a job now.
    pub async fn trigger(&self, job_id: &JobId) -> Result<DispatchOutcome, SchedulerError> {
        self.state.trigger(job_id).await
    }

    /// Recover runs interrupted by a previous crash.
    pub async fn recover(&self) -> Result<Vec<RunRecord>, SchedulerError> {
        self.state.recover().await
    }

    pub fn running_jobs(&self) -> Vec<RunningJob> {
        self.state.dispatcher.running_jobs()
    }

    pub fn pending_retries(&self) -> Vec<PendingRetry> {
        self.state.dispatcher.pending_retries()
    }

    /// Wait until no run is in flight.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.state.dispatcher.wait_idle(timeout).await
    }

    /// Start the scheduler and return a handle for controlling it.
    ///
    /// Interrupted runs are reconciled first, then each job's schedule is
    /// continued from its last recorded occurrence.
    pub async fn start(self) -> Result<(SchedulerHandle, JoinHandle<()>), SchedulerError> {
        self.state.config.validate()?;

        let interrupted = self.state.recover().await?;
        if !interrupted.is_empty() {
            tracing::warn!(count = interrupted.len(), "Recovered interrupted runs");
        }
        self.state.restore_anchors().await;
        self.state.sync_statuses().await;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let handle = SchedulerHandle {
            command_tx,
            state: self.state.clone(),
        };

        tracing::info!(
            jobs = self.state.registry.len(),
            tick = ?self.state.config.tick_interval,
            "Scheduler started"
        );
        let state = self.state;
        let scheduler_task = tokio::spawn(async move {
            state.run(command_rx).await;
        });

        Ok((handle, scheduler_task))
    }
}

struct SchedulerParts {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
}
