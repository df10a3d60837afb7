//! Scheduler engine for job execution.
//!
//! This module provides the job registry, the main scheduling loop that
//! fires jobs at their scheduled times, and the handle used to control it.

mod engine;
mod handle;
mod registry;
mod types;

pub use engine::{Scheduler, SchedulerState, TickReport};
pub use handle::SchedulerHandle;
pub use registry::{JobRegistry, JobSummary};
pub use types::{LoopState, MissedTickPolicy, SchedulerConfig, SchedulerError};
