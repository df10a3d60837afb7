//! Job registry: registered definitions plus per-job scheduling state.
//!
//! All mutation and the loop's due-set computation share one mutex. The
//! lock is never held across an `.await`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::types::{MissedTickPolicy, SchedulerError};
use crate::core::job::{JobDefinition, OverlapPolicy};
use crate::core::types::JobId;

/// Upper bound on occurrences walked for one job in one tick.
const MAX_CATCHUP_STEPS: usize = 1000;

struct RegisteredJob {
    def: Arc<JobDefinition>,
    next_due: Option<DateTime<Utc>>,
    last_scheduled: Option<DateTime<Utc>>,
    paused: bool,
}

/// Read-only view of a registered job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub description: Option<String>,
    pub rule: String,
    pub overlap: OverlapPolicy,
    pub depends_on: Vec<JobId>,
    pub paused: bool,
    pub next_due: Option<DateTime<Utc>>,
    pub last_scheduled: Option<DateTime<Utc>>,
}

/// An occurrence found due during a tick.
#[derive(Debug, Clone)]
pub(crate) struct DueOccurrence {
    pub job: Arc<JobDefinition>,
    /// Most recent occurrence at or before the tick time.
    pub scheduled_at: DateTime<Utc>,
    /// Next-due time already stored for the job.
    pub next_due: Option<DateTime<Utc>>,
    /// Occurrences passed over to reach `scheduled_at`.
    pub skipped: usize,
    /// False when the missed-tick policy drops the occurrence.
    pub fire: bool,
}

/// Ordered set of job definitions.
#[derive(Default)]
pub struct JobRegistry {
    entries: Mutex<Vec<RegisteredJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RegisteredJob>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a job. Its first due time is the rule's first occurrence after `now`.
    pub fn register(
        &self,
        job: JobDefinition,
        now: DateTime<Utc>,
    ) -> Result<Arc<JobDefinition>, SchedulerError> {
        job.validate()?;

        let mut entries = self.lock();
        if entries.iter().any(|e| e.def.id() == job.id()) {
            return Err(SchedulerError::DuplicateId(job.id().clone()));
        }
        for dep in job.dependencies() {
            if !entries.iter().any(|e| e.def.id() == dep) {
                return Err(SchedulerError::Configuration(format!(
                    "job '{}' depends on unknown job '{}'",
                    job.id(),
                    dep
                )));
            }
        }

        let def = Arc::new(job);
        entries.push(RegisteredJob {
            next_due: def.rule().next_run(now),
            last_scheduled: None,
            paused: !def.is_enabled(),
            def: Arc::clone(&def),
        });
        Ok(def)
    }

    /// Remove a job.
    pub fn deregister(&self, id: &JobId) -> Result<Arc<JobDefinition>, SchedulerError> {
        let mut entries = self.lock();
        let pos = entries
            .iter()
            .position(|e| e.def.id() == id)
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
        Ok(entries.remove(pos).def)
    }

    pub fn get(&self, id: &JobId) -> Option<Arc<JobDefinition>> {
        self.lock()
            .iter()
            .find(|e| e.def.id() == id)
            .map(|e| Arc::clone(&e.def))
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.lock().iter().any(|e| e.def.id() == id)
    }

    /// Definitions in registration order.
    pub fn list(&self) -> Vec<Arc<JobDefinition>> {
        self.lock().iter().map(|e| Arc::clone(&e.def)).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Summaries in registration order.
    pub fn summaries(&self) -> Vec<JobSummary> {
        self.lock().iter().map(summarize).collect()
    }

    pub fn summary(&self, id: &JobId) -> Option<JobSummary> {
        self.lock().iter().find(|e| e.def.id() == id).map(summarize)
    }

    /// Pause or resume one job. Resuming skips occurrences that fell inside
    /// the pause. Returns the updated summary.
    pub fn set_paused(
        &self,
        id: &JobId,
        paused: bool,
        now: DateTime<Utc>,
    ) -> Result<JobSummary, SchedulerError> {
        let mut entries = self.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.def.id() == id)
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;

        if entry.paused && !paused && entry.next_due.is_some_and(|due| due <= now) {
            entry.next_due = entry.def.rule().next_run(now);
        }
        entry.paused = paused;
        Ok(summarize(entry))
    }

    /// Push every overdue job past `now`. Used when the whole scheduler resumes.
    pub fn skip_missed(&self, now: DateTime<Utc>) -> usize {
        let mut skipped = 0;
        for entry in self.lock().iter_mut() {
            if entry.next_due.is_some_and(|due| due <= now) {
                entry.next_due = entry.def.rule().next_run(now);
                skipped += 1;
            }
        }
        skipped
    }

    /// Continue a job's schedule from an occurrence that ran before a restart.
    pub fn restore_anchor(&self, id: &JobId, last_scheduled: DateTime<Utc>) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.def.id() == id) else {
            return false;
        };
        entry.last_scheduled = Some(last_scheduled);
        entry.next_due = entry.def.rule().next_run(last_scheduled);
        true
    }

    /// Find jobs due at `now`, advance their next-due times, and decide per
    /// the missed-tick policy whether each fires.
    pub(crate) fn collect_due(
        &self,
        now: DateTime<Utc>,
        policy: MissedTickPolicy,
        threshold: Duration,
        environment: Option<&str>,
    ) -> Vec<DueOccurrence> {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let mut due = Vec::new();

        for entry in self.lock().iter_mut() {
            if entry.paused {
                continue;
            }
            let Some(first) = entry.next_due.filter(|due| *due <= now) else {
                continue;
            };

            let rule = entry.def.rule();
            let mut latest = first;
            let mut skipped = 0;
            let next = loop {
                match rule.next_run(latest) {
                    Some(n) if n <= now => {
                        latest = n;
                        skipped += 1;
                        if skipped >= MAX_CATCHUP_STEPS {
                            tracing::warn!(
                                job_id = %entry.def.id(),
                                steps = MAX_CATCHUP_STEPS,
                                "Too many missed occurrences, jumping to the next one after now"
                            );
                            break rule.next_run(now);
                        }
                    }
                    other => break other,
                }
            };

            entry.next_due = next;
            entry.last_scheduled = Some(latest);

            if !entry.def.runs_in(environment) {
                tracing::debug!(job_id = %entry.def.id(), "Job not enabled in this environment");
                continue;
            }

            let fire = match policy {
                MissedTickPolicy::Skip => now - latest <= threshold,
                MissedTickPolicy::CatchUp => true,
            };

            due.push(DueOccurrence {
                job: Arc::clone(&entry.def),
                scheduled_at: latest,
                next_due: next,
                skipped,
                fire,
            });
        }

        due
    }
}

fn summarize(entry: &RegisteredJob) -> JobSummary {
    JobSummary {
        id: entry.def.id().clone(),
        name: entry.def.name().to_string(),
        description: entry.def.description().map(str::to_string),
        rule: entry.def.rule().to_string(),
        overlap: entry.def.overlap(),
        depends_on: entry.def.dependencies().to_vec(),
        paused: entry.paused,
        next_due: entry.next_due,
        last_scheduled: entry.last_scheduled,
    }
}
