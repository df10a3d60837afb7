//! Per-job run counters fed by the event bus.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{Event, EventHandler};
use crate::core::types::JobId;
use crate::storage::RunOutcome;

/// Counters for one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    /// Runs started, retries included.
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    /// Skips for any reason: overlap, unmet dependency or misfire.
    pub skipped: u64,
    pub retries_scheduled: u64,
    /// Summed duration of executed runs, in milliseconds.
    pub total_duration_ms: u64,
}

impl JobMetrics {
    /// Average duration of executed runs.
    pub fn avg_duration(&self) -> Option<Duration> {
        let executed = self.successes + self.failures + self.timeouts;
        if executed == 0 {
            return None;
        }
        Some(Duration::from_millis(self.total_duration_ms / executed))
    }

    /// Fraction of executed runs that succeeded.
    pub fn success_rate(&self) -> Option<f64> {
        let executed = self.successes + self.failures + self.timeouts;
        if executed == 0 {
            return None;
        }
        Some(self.successes as f64 / executed as f64)
    }
}

/// Serializable point-in-time copy of the counters, keyed by job id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub jobs: BTreeMap<String, JobMetrics>,
}

/// Event handler that aggregates run counters per job.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    jobs: Mutex<BTreeMap<JobId, JobMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for one job.
    pub fn job(&self, job_id: &JobId) -> Option<JobMetrics> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        MetricsSnapshot {
            jobs: jobs
                .iter()
                .map(|(id, m)| (id.to_string(), m.clone()))
                .collect(),
        }
    }

    fn record(&self, job_id: &JobId, update: impl FnOnce(&mut JobMetrics)) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        update(jobs.entry(job_id.clone()).or_default());
    }
}

#[async_trait]
impl EventHandler for MetricsCollector {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobStarted { job_id, .. } => self.record(job_id, |m| m.attempts += 1),
            Event::JobCompleted { record, .. } => {
                let duration_ms = record
                    .duration()
                    .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                    .unwrap_or(0);
                self.record(&record.job_id, |m| match record.outcome {
                    RunOutcome::Success => {
                        m.successes += 1;
                        m.total_duration_ms = m.total_duration_ms.saturating_add(duration_ms);
                    }
                    RunOutcome::Failure | RunOutcome::Interrupted => {
                        m.failures += 1;
                        m.total_duration_ms = m.total_duration_ms.saturating_add(duration_ms);
                    }
                    RunOutcome::Timeout => {
                        m.timeouts += 1;
                        m.total_duration_ms = m.total_duration_ms.saturating_add(duration_ms);
                    }
                    RunOutcome::SkippedOverlap | RunOutcome::InProgress => {}
                });
            }
            Event::JobSkipped { job_id, .. } => self.record(job_id, |m| m.skipped += 1),
            Event::RetryScheduled { job_id, .. } => {
                self.record(job_id, |m| m.retries_scheduled += 1)
            }
            Event::SchedulerDraining { .. } | Event::SchedulerStopped { .. } => {}
        }
    }
}
