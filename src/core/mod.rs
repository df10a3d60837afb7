//! Core domain types: identifiers, clocks, recurrence rules, retry policies
//! and job definitions.

pub mod clock;
pub mod cron;
pub mod frequency;
pub mod job;
pub mod retry;
pub mod schedule;
pub mod types;
