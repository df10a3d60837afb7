//! Lifecycle events and event handling.
//!
//! This module provides event emission for job lifecycle events,
//! enabling observability into scheduling and execution.

mod metrics;

pub use metrics::{JobMetrics, MetricsCollector, MetricsSnapshot};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::types::{JobId, RunId};
use crate::storage::RunRecord;

/// Why a due occurrence did not run.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// A previous run was still in flight.
    Overlap,
    /// A dependency's latest run did not succeed.
    DependencyNotMet { dependency: JobId },
    /// The occurrence was older than the misfire threshold.
    Misfire,
}

/// Lifecycle events emitted during scheduling and execution.
#[derive(Debug, Clone)]
pub enum Event {
    /// A run has started.
    JobStarted {
        job_id: JobId,
        run_id: RunId,
        scheduled_at: DateTime<Utc>,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// A run finished. Carries the final record.
    JobCompleted {
        record: RunRecord,
        timestamp: DateTime<Utc>,
    },

    /// A due occurrence was not executed.
    JobSkipped {
        job_id: JobId,
        scheduled_at: DateTime<Utc>,
        reason: SkipReason,
        timestamp: DateTime<Utc>,
    },

    /// A failed run will be retried.
    RetryScheduled {
        job_id: JobId,
        /// Attempt number of the upcoming retry.
        attempt: u32,
        due_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// Shutdown began; waiting for in-flight runs.
    SchedulerDraining {
        in_flight: usize,
        timestamp: DateTime<Utc>,
    },

    /// The scheduler loop exited.
    SchedulerStopped {
        /// Runs still in flight when the grace period ran out.
        abandoned: usize,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::JobStarted { timestamp, .. } => *timestamp,
            Event::JobCompleted { timestamp, .. } => *timestamp,
            Event::JobSkipped { timestamp, .. } => *timestamp,
            Event::RetryScheduled { timestamp, .. } => *timestamp,
            Event::SchedulerDraining { timestamp, .. } => *timestamp,
            Event::SchedulerStopped { timestamp, .. } => *timestamp,
        }
    }

    /// Job this event concerns, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Event::JobStarted { job_id, .. }
            | Event::JobSkipped { job_id, .. }
            | Event::RetryScheduled { job_id, .. } => Some(job_id),
            Event::JobCompleted { record, .. } => Some(&record.job_id),
            Event::SchedulerDraining { .. } | Event::SchedulerStopped { .. } => None,
        }
    }

    /// Create a JobCompleted event stamped with the record's end time.
    pub fn job_completed(record: RunRecord) -> Self {
        let timestamp = record.ended_at.unwrap_or(record.started_at);
        Event::JobCompleted { record, timestamp }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await.clone();
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
