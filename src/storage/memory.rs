//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{
    INTERRUPTED_MESSAGE, JobStatus, NewRun, RunCompletion, RunOutcome, RunRecord, Storage,
    StorageError,
};
use crate::core::types::{JobId, RunId};

/// Runs in insertion order, with an id index.
#[derive(Default)]
struct RunTable {
    records: Vec<RunRecord>,
    index: HashMap<RunId, usize>,
}

impl RunTable {
    fn get_mut(&mut self, id: &RunId) -> Option<&mut RunRecord> {
        let pos = *self.index.get(id)?;
        self.records.get_mut(pos)
    }

    /// Runs of a job, most recent first. Ties on `started_at` go to the later insert.
    fn for_job<'a>(&'a self, job_id: &JobId) -> Vec<&'a RunRecord> {
        let mut runs: Vec<_> = self
            .records
            .iter()
            .rev()
            .filter(|r| &r.job_id == job_id)
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    fn reindex(&mut self) {
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(pos, r)| (r.id.clone(), pos))
            .collect();
    }
}

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    runs: RwLock<RunTable>,
    statuses: RwLock<HashMap<JobId, JobStatus>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(RunTable::default()),
            statuses: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn record_start(&self, run: NewRun) -> Result<RunId, StorageError> {
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        if runs.index.contains_key(&run.id) {
            return Err(StorageError::DuplicateKey(format!("run: {}", run.id)));
        }
        let id = run.id.clone();
        let pos = runs.records.len();
        runs.records.push(run.into_record());
        runs.index.insert(id.clone(), pos);
        Ok(id)
    }

    async fn record_end(
        &self,
        id: &RunId,
        completion: RunCompletion,
    ) -> Result<RunRecord, StorageError> {
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        let record = runs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("run: {}", id)))?;
        if record.outcome.is_terminal() {
            return Err(StorageError::AlreadyFinished(id.clone()));
        }
        completion.apply(record);
        Ok(record.clone())
    }

    async fn get_run(&self, id: &RunId) -> Result<RunRecord, StorageError> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        runs.index
            .get(id)
            .and_then(|&pos| runs.records.get(pos))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("run: {}", id)))
    }

    async fn last_run(&self, job_id: &JobId) -> Result<Option<RunRecord>, StorageError> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(runs.for_job(job_id).first().map(|r| (*r).clone()))
    }

    async fn is_running(&self, job_id: &JobId) -> Result<bool, StorageError> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(runs
            .records
            .iter()
            .any(|r| &r.job_id == job_id && r.outcome == RunOutcome::InProgress))
    }

    async fn list_runs(&self, job_id: &JobId, limit: usize) -> Result<Vec<RunRecord>, StorageError> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(runs
            .for_job(job_id)
            .into_iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn reconcile_interrupted(
        &self,
        at: DateTime<Utc>,
    ) -> Result<Vec<RunRecord>, StorageError> {
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut interrupted = Vec::new();
        for record in runs
            .records
            .iter_mut()
            .filter(|r| r.outcome == RunOutcome::InProgress)
        {
            record.outcome = RunOutcome::Interrupted;
            record.ended_at = Some(at);
            record.error = Some(INTERRUPTED_MESSAGE.to_string());
            interrupted.push(record.clone());
        }
        Ok(interrupted)
    }

    async fn prune_runs(&self, job_id: &JobId, keep: usize) -> Result<usize, StorageError> {
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        let doomed: Vec<RunId> = runs
            .for_job(job_id)
            .into_iter()
            .skip(keep)
            .filter(|r| r.outcome.is_terminal())
            .map(|r| r.id.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        runs.records.retain(|r| !doomed.contains(&r.id));
        runs.reindex();
        Ok(doomed.len())
    }

    async fn update_schedule_status(
        &self,
        job_id: &JobId,
        paused: bool,
        next_run_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut statuses = self
            .statuses
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let status = statuses
            .entry(job_id.clone())
            .or_insert_with(|| JobStatus::new(job_id.clone(), at));
        status.paused = paused;
        status.next_run_at = next_run_at;
        status.updated_at = at;
        Ok(())
    }

    async fn update_run_status(&self, record: &RunRecord) -> Result<(), StorageError> {
        let mut statuses = self
            .statuses
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        statuses
            .entry(record.job_id.clone())
            .or_insert_with(|| JobStatus::new(record.job_id.clone(), record.started_at))
            .apply_run(record);
        Ok(())
    }

    async fn get_status(&self, job_id: &JobId) -> Result<Option<JobStatus>, StorageError> {
        let statuses = self
            .statuses
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(statuses.get(job_id).cloned())
    }

    async fn list_statuses(&self) -> Result<Vec<JobStatus>, StorageError> {
        let statuses = self
            .statuses
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = statuses.values().cloned().collect();
        result.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(result)
    }

    async fn delete_status(&self, job_id: &JobId) -> Result<(), StorageError> {
        let mut statuses = self
            .statuses
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        statuses
            .remove(job_id)
            .ok_or_else(|| StorageError::NotFound(format!("job status: {}", job_id)))?;
        Ok(())
    }
}
