//! Scheduler handle for controlling a running scheduler.
//!
//! Trigger, pause, resume and shutdown go through the loop's command
//! channel. Registry changes and reads act on the shared state directly.

use tokio::sync::{mpsc, oneshot};

use super::engine::SchedulerState;
use super::registry::JobSummary;
use super::types::{LoopState, SchedulerCommand, SchedulerError};
use crate::core::job::JobDefinition;
use crate::core::types::JobId;
use crate::execution::{DispatchOutcome, PendingRetry, RunningJob};
use crate::storage::RunRecord;

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: SchedulerState,
}

impl SchedulerHandle {
    /// Helper to send a command that returns a result and wait for response.
    async fn send_result_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<Result<T, SchedulerError>>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?
    }

    /// Helper to send a command that returns unit and wait for response.
    async fn send_unit_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<()>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?;

        Ok(())
    }

    /// Run a job now, subject to its overlap policy and dependencies.
    pub async fn trigger(&self, job_id: impl Into<JobId>) -> Result<DispatchOutcome, SchedulerError> {
        let job_id = job_id.into();
        self.send_result_command(
            |response| SchedulerCommand::Trigger { job_id, response },
            "trigger",
        )
        .await
    }

    /// Pause the scheduler.
    ///
    /// While paused, scheduled jobs and retries are held, but manual triggers still work.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Pause { response }, "pause")
            .await
    }

    /// Resume the scheduler. Occurrences that fell inside the pause are skipped.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Resume { response }, "resume")
            .await
    }

    /// Drain in-flight runs and stop the loop.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Register a job while the scheduler runs.
    pub async fn register(&self, job: JobDefinition) -> Result<JobSummary, SchedulerError> {
        self.state.register(job).await
    }

    /// Remove a job while the scheduler runs.
    pub async fn deregister(&self, job_id: impl Into<JobId>) -> Result<(), SchedulerError> {
        self.state.deregister(&job_id.into()).await
    }

    /// Stop scheduling one job. Manual triggers still work.
    pub async fn pause_job(&self, job_id: impl Into<JobId>) -> Result<JobSummary, SchedulerError> {
        self.state.set_job_paused(&job_id.into(), true).await
    }

    /// Resume one job. Occurrences that fell inside the pause are skipped.
    pub async fn resume_job(&self, job_id: impl Into<JobId>) -> Result<JobSummary, SchedulerError> {
        self.state.set_job_paused(&job_id.into(), false).await
    }

    /// Summaries of registered jobs, in registration order.
    pub fn jobs(&self) -> Vec<JobSummary> {
        self.state.registry.summaries()
    }

    pub fn job(&self, job_id: impl Into<JobId>) -> Option<JobSummary> {
        self.state.registry.summary(&job_id.into())
    }

    /// Most recent run of a job.
    pub async fn last_run(&self, job_id: impl Into<JobId>) -> Result<Option<RunRecord>, SchedulerError> {
        let job_id = job_id.into();
        if !self.state.registry.contains(&job_id) {
            return Err(SchedulerError::NotFound(job_id));
        }
        self.state.dispatcher.last_run(&job_id).await
    }

    /// Recent runs of a job, most recent first.
    pub async fn history(
        &self,
        job_id: impl Into<JobId>,
        limit: usize,
    ) -> Result<Vec<RunRecord>, SchedulerError> {
        Ok(self.state.storage.list_runs(&job_id.into(), limit).await?)
    }

    pub fn running_jobs(&self) -> Vec<RunningJob> {
        self.state.dispatcher.running_jobs()
    }

    pub fn pending_retries(&self) -> Vec<PendingRetry> {
        self.state.dispatcher.pending_retries()
    }

    /// Get the current loop state.
    pub async fn state(&self) -> LoopState {
        self.state.loop_state().await
    }

    /// Check if the scheduler is running (not paused, draining or stopped).
    pub async fn is_running(&self) -> bool {
        matches!(self.state().await, LoopState::Idle | LoopState::Ticking)
    }

    /// Check if the scheduler is paused.
    pub async fn is_paused(&self) -> bool {
        self.state().await == LoopState::Paused
    }
}
