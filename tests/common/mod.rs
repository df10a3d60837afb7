//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tickwork::{
    InMemoryStorage, JobDefinition, JobHandler, ManualClock, RecurrenceRule, RunId, RunOutcome,
    RunRecord, Scheduler, Storage,
};

/// Fixed starting instant for manual-clock tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

/// `t0()` plus `n` seconds.
pub fn at(n: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(n)
}

/// Interval job firing every `seconds`.
pub fn every(id: &str, seconds: u64, handler: Arc<dyn JobHandler>) -> JobDefinition {
    JobDefinition::new(id, RecurrenceRule::every(Duration::from_secs(seconds)), handler)
}

/// Scheduler over in-memory storage driven by a manual clock set to `t0()`.
pub fn manual_scheduler() -> (Scheduler<InMemoryStorage>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let scheduler = Scheduler::new(InMemoryStorage::new()).with_clock(clock.clone());
    (scheduler, clock)
}

/// Wait until no run is in flight or queued.
pub async fn settle<S: Storage + 'static>(scheduler: &Scheduler<S>) {
    assert!(
        scheduler.wait_idle(Duration::from_secs(5)).await,
        "runs still in flight after 5s"
    );
}

/// Wait for a run to reach an expected outcome, polling storage.
///
/// This is more reliable than fixed sleeps since execution time can vary.
/// Polls storage every 10ms and times out after the specified duration.
///
/// # Panics
///
/// Panics if the timeout is reached before the run reaches the expected outcome.
pub async fn wait_for_run_outcome(
    storage: &dyn Storage,
    run_id: &RunId,
    expected: RunOutcome,
    timeout: Duration,
) -> RunRecord {
    let start = tokio::time::Instant::now();
    loop {
        let run = storage.get_run(run_id).await.unwrap();
        if run.outcome == expected {
            return run;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for run {} to reach {:?}, current outcome: {:?}",
                run_id, expected, run.outcome
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// True if no two executed runs overlap in time.
pub fn executed_runs_disjoint(runs: &[RunRecord]) -> bool {
    let mut spans: Vec<(DateTime<Utc>, DateTime<Utc>)> = runs
        .iter()
        .filter(|r| r.outcome.is_executed())
        .map(|r| (r.started_at, r.ended_at.unwrap_or(DateTime::<Utc>::MAX_UTC)))
        .collect();
    spans.sort();
    spans.windows(2).all(|w| w[0].1 <= w[1].0)
}
