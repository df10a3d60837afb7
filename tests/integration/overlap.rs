//! Overlap policy integration tests.
//!
//! Tests that verify admission stays atomic when many dispatches race for
//! the same job.

use crate::common::{executed_runs_disjoint, every, manual_scheduler, settle};
use std::time::Duration;
use tickwork::testing::{GatedHandler, SleepHandler};
use tickwork::{DispatchOutcome, InMemoryStorage, JobId, OverlapPolicy, RunOutcome, Scheduler, Storage};

const RACERS: usize = 20;

/// Test: Concurrent triggers of a Skip job start exactly one run.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_skip_admits_one_run_under_concurrent_triggers() {
    let (scheduler, _clock) = manual_scheduler();
    let gate = GatedHandler::new();
    scheduler.register(every("exclusive", 3600, gate.clone())).unwrap();
    let job_id = JobId::new("exclusive");

    let mut tasks = Vec::with_capacity(RACERS);
    for _ in 0..RACERS {
        let state = scheduler.state().clone();
        let job_id = job_id.clone();
        tasks.push(tokio::spawn(async move { state.trigger(&job_id).await }));
    }

    let mut started = 0;
    let mut skipped = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            DispatchOutcome::Started(_) => started += 1,
            DispatchOutcome::Skipped(_) => skipped += 1,
            DispatchOutcome::Queued => panic!("skip policy never queues"),
        }
    }
    assert_eq!(started, 1);
    assert_eq!(skipped, RACERS - 1);

    gate.release();
    settle(&scheduler).await;

    let runs = scheduler.storage().list_runs(&job_id, 100).await.unwrap();
    assert_eq!(runs.len(), RACERS);
    assert_eq!(
        runs.iter().filter(|r| r.outcome == RunOutcome::Success).count(),
        1
    );
    assert!(executed_runs_disjoint(&runs));
}

/// Test: Repeated real-time triggers of a Skip job never produce overlapping runs.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_skip_runs_never_overlap_in_real_time() {
    let scheduler = Scheduler::new(InMemoryStorage::new());
    let sleeper = SleepHandler::new(Duration::from_millis(20));
    scheduler.register(every("busy", 3600, sleeper)).unwrap();
    let job_id = JobId::new("busy");

    for _ in 0..10 {
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let state = scheduler.state().clone();
            let job_id = job_id.clone();
            tasks.push(tokio::spawn(async move { state.trigger(&job_id).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    settle(&scheduler).await;

    let runs = scheduler.storage().list_runs(&job_id, 100).await.unwrap();
    assert!(runs.iter().any(|r| r.outcome == RunOutcome::Success));
    assert!(executed_runs_disjoint(&runs));
}

/// Test: Queue policy runs the queued occurrence after the current one.
#[tokio::test]
async fn test_queue_runs_back_to_back() {
    let (scheduler, _clock) = manual_scheduler();
    let gate = GatedHandler::new();
    scheduler
        .register(every("serial", 3600, gate.clone()).with_overlap(OverlapPolicy::Queue))
        .unwrap();
    let job_id = JobId::new("serial");

    assert!(matches!(
        scheduler.trigger(&job_id).await.unwrap(),
        DispatchOutcome::Started(_)
    ));
    assert_eq!(
        scheduler.trigger(&job_id).await.unwrap(),
        DispatchOutcome::Queued
    );
    assert_eq!(scheduler.running_jobs().len(), 1);

    gate.release();
    settle(&scheduler).await;

    assert_eq!(gate.finished(), 2);
    let runs = scheduler.storage().list_runs(&job_id, 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.outcome == RunOutcome::Success));
    assert!(executed_runs_disjoint(&runs));
}

/// Test: Concurrent policy starts every trigger.
#[tokio::test]
async fn test_concurrent_runs_side_by_side() {
    let (scheduler, _clock) = manual_scheduler();
    let gate = GatedHandler::new();
    scheduler
        .register(every("fanout", 3600, gate.clone()).with_overlap(OverlapPolicy::Concurrent))
        .unwrap();
    let job_id = JobId::new("fanout");

    for _ in 0..3 {
        assert!(matches!(
            scheduler.trigger(&job_id).await.unwrap(),
            DispatchOutcome::Started(_)
        ));
    }
    assert_eq!(scheduler.running_jobs().len(), 3);

    gate.release();
    settle(&scheduler).await;
    assert_eq!(gate.finished(), 3);
}
