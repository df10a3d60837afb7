//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Timestamps are stored
//! as Unix milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use super::{
    INTERRUPTED_MESSAGE, JobStatus, NewRun, RunCompletion, RunOutcome, RunRecord, RunTrigger, Storage,
    StorageError,
};
use crate::core::types::{JobId, RunId};

const RUN_COLUMNS: &str =
    "id, job_id, attempt, scheduled_at, started_at, ended_at, outcome, error, output, triggered_by";

const STATUS_COLUMNS: &str =
    "job_id, paused, next_run_at, last_run_id, last_outcome, last_scheduled_at, updated_at";

type RunRow = (
    String,
    String,
    i64,
    i64,
    i64,
    Option<i64>,
    String,
    Option<String>,
    Option<String>,
    String,
);

type StatusRow = (
    String,
    bool,
    Option<i64>,
    Option<String>,
    Option<String>,
    Option<i64>,
    i64,
);

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        // One connection that never recycles, or the database goes with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn db_error(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::Unavailable(e.to_string())
        }
        other => StorageError::Other(other.to_string()),
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::SerializationError(format!("timestamp out of range: {}", ms)))
}

fn parse_outcome(s: &str) -> Result<RunOutcome, StorageError> {
    RunOutcome::parse(s)
        .ok_or_else(|| StorageError::SerializationError(format!("unknown outcome: {}", s)))
}

fn parse_trigger(s: &str) -> Result<RunTrigger, StorageError> {
    RunTrigger::parse(s)
        .ok_or_else(|| StorageError::SerializationError(format!("unknown trigger: {}", s)))
}

fn parse_run_id(s: &str) -> Result<RunId, StorageError> {
    s.parse()
        .map_err(|e| StorageError::SerializationError(format!("invalid uuid: {}", e)))
}

fn row_to_record(row: RunRow) -> Result<RunRecord, StorageError> {
    Ok(RunRecord {
        id: parse_run_id(&row.0)?,
        job_id: JobId::new(row.1),
        attempt: u32::try_from(row.2)
            .map_err(|_| StorageError::SerializationError(format!("bad attempt: {}", row.2)))?,
        scheduled_at: from_millis(row.3)?,
        started_at: from_millis(row.4)?,
        ended_at: row.5.map(from_millis).transpose()?,
        outcome: parse_outcome(&row.6)?,
        error: row.7,
        output: row.8,
        trigger: parse_trigger(&row.9)?,
    })
}

fn row_to_status(row: StatusRow) -> Result<JobStatus, StorageError> {
    Ok(JobStatus {
        job_id: JobId::new(row.0),
        paused: row.1,
        next_run_at: row.2.map(from_millis).transpose()?,
        last_run_id: row.3.as_deref().map(parse_run_id).transpose()?,
        last_outcome: row.4.as_deref().map(parse_outcome).transpose()?,
        last_scheduled_at: row.5.map(from_millis).transpose()?,
        updated_at: from_millis(row.6)?,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn record_start(&self, run: NewRun) -> Result<RunId, StorageError> {
        let id = run.id.clone();
        let record = run.into_record();
        let result = sqlx::query(
            r#"
            INSERT INTO runs (id, job_id, attempt, scheduled_at, started_at, ended_at, outcome, error, output, triggered_by)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.job_id.as_str())
        .bind(i64::from(record.attempt))
        .bind(record.scheduled_at.timestamp_millis())
        .bind(record.started_at.timestamp_millis())
        .bind(record.ended_at.map(|t| t.timestamp_millis()))
        .bind(record.outcome.as_str())
        .bind(&record.error)
        .bind(&record.output)
        .bind(record.trigger.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("run: {}", id)))
            }
            Err(e) => Err(db_error(e)),
        }
    }

    async fn record_end(
        &self,
        id: &RunId,
        completion: RunCompletion,
    ) -> Result<RunRecord, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET ended_at = ?, outcome = ?, error = ?, output = ?
            WHERE id = ? AND outcome = 'in_progress'
            "#,
        )
        .bind(completion.ended_at.timestamp_millis())
        .bind(completion.outcome.as_str())
        .bind(&completion.error)
        .bind(&completion.output)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            let existing: Option<(String,)> =
                sqlx::query_as("SELECT outcome FROM runs WHERE id = ?")
                    .bind(id.to_string())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db_error)?;
            return Err(match existing {
                Some(_) => StorageError::AlreadyFinished(id.clone()),
                None => StorageError::NotFound(format!("run: {}", id)),
            });
        }

        self.get_run(id).await
    }

    async fn get_run(&self, id: &RunId) -> Result<RunRecord, StorageError> {
        let row: RunRow = sqlx::query_as(&format!("SELECT {} FROM runs WHERE id = ?", RUN_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| StorageError::NotFound(format!("run: {}", id)))?;

        row_to_record(row)
    }

    async fn last_run(&self, job_id: &JobId) -> Result<Option<RunRecord>, StorageError> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {} FROM runs WHERE job_id = ? ORDER BY started_at DESC, rowid DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(row_to_record).transpose()
    }

    async fn is_running(&self, job_id: &JobId) -> Result<bool, StorageError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM runs WHERE job_id = ? AND outcome = 'in_progress'",
        )
        .bind(job_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(count > 0)
    }

    async fn list_runs(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<RunRecord>, StorageError> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {} FROM runs WHERE job_id = ? ORDER BY started_at DESC, rowid DESC LIMIT ?",
            RUN_COLUMNS
        ))
        .bind(job_id.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(row_to_record).collect()
    }

    async fn reconcile_interrupted(
        &self,
        at: DateTime<Utc>,
    ) -> Result<Vec<RunRecord>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {} FROM runs WHERE outcome = 'in_progress' ORDER BY started_at, rowid",
            RUN_COLUMNS
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;

        sqlx::query(
            "UPDATE runs SET outcome = 'interrupted', ended_at = ?, error = ? WHERE outcome = 'in_progress'",
        )
        .bind(at.timestamp_millis())
        .bind(INTERRUPTED_MESSAGE)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        rows.into_iter()
            .map(|row| {
                let mut record = row_to_record(row)?;
                record.outcome = RunOutcome::Interrupted;
                record.ended_at = Some(at);
                record.error = Some(INTERRUPTED_MESSAGE.to_string());
                Ok(record)
            })
            .collect()
    }

    async fn prune_runs(&self, job_id: &JobId, keep: usize) -> Result<usize, StorageError> {
        let result = sqlx::query(
            r#"
            DELETE FROM runs
            WHERE job_id = ? AND outcome != 'in_progress' AND id NOT IN (
                SELECT id FROM runs WHERE job_id = ?
                ORDER BY started_at DESC, rowid DESC LIMIT ?
            )
            "#,
        )
        .bind(job_id.as_str())
        .bind(job_id.as_str())
        .bind(i64::try_from(keep).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() as usize)
    }

    async fn update_schedule_status(
        &self,
        job_id: &JobId,
        paused: bool,
        next_run_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO job_status (job_id, paused, next_run_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (job_id) DO UPDATE SET
                paused = excluded.paused,
                next_run_at = excluded.next_run_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(job_id.as_str())
        .bind(paused)
        .bind(next_run_at.map(|t| t.timestamp_millis()))
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn update_run_status(&self, record: &RunRecord) -> Result<(), StorageError> {
        let updated_at = record.ended_at.unwrap_or(record.started_at);
        sqlx::query(
            r#"
            INSERT INTO job_status (job_id, paused, last_run_id, last_outcome, last_scheduled_at, updated_at)
            VALUES (?, 0, ?, ?, ?, ?)
            ON CONFLICT (job_id) DO UPDATE SET
                last_run_id = excluded.last_run_id,
                last_outcome = excluded.last_outcome,
                last_scheduled_at = excluded.last_scheduled_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.job_id.as_str())
        .bind(record.id.to_string())
        .bind(record.outcome.as_str())
        .bind(record.scheduled_at.timestamp_millis())
        .bind(updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_status(&self, job_id: &JobId) -> Result<Option<JobStatus>, StorageError> {
        let row: Option<StatusRow> = sqlx::query_as(&format!(
            "SELECT {} FROM job_status WHERE job_id = ?",
            STATUS_COLUMNS
        ))
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(row_to_status).transpose()
    }

    async fn list_statuses(&self) -> Result<Vec<JobStatus>, StorageError> {
        let rows: Vec<StatusRow> = sqlx::query_as(&format!(
            "SELECT {} FROM job_status ORDER BY job_id",
            STATUS_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(row_to_status).collect()
    }

    async fn delete_status(&self, job_id: &JobId) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM job_status WHERE job_id = ?")
            .bind(job_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job status: {}", job_id)));
        }
        Ok(())
    }
}
