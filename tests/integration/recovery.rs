//! Recovery scenario integration tests.
//!
//! Tests that verify the system can recover from interruptions
//! and keep scheduling jobs whose previous run never finished.

use crate::common::{at, every, t0, wait_for_run_outcome};
use std::sync::Arc;
use std::time::Duration;
use tickwork::storage::{NewRun, RunCompletion, RunTrigger};
use tickwork::testing::{CountingHandler, RecordingEventHandler};
use tickwork::{
    DispatchOutcome, InMemoryStorage, JobId, ManualClock, MissedTickPolicy, RunOutcome, Scheduler,
    Storage,
};

/// Test: Recover interrupted runs on startup.
#[tokio::test]
async fn test_recover_interrupted_runs_on_startup() {
    let storage = Arc::new(InMemoryStorage::new());

    // Simulate runs left in progress by a crashed process.
    let run1 = storage
        .record_start(NewRun::new(JobId::new("job1"), at(0), at(1), 1))
        .await
        .unwrap();
    let run2 = storage
        .record_start(NewRun::new(JobId::new("job2"), at(0), at(2), 2))
        .await
        .unwrap();

    let scheduler = Scheduler::with_storage(Arc::clone(&storage))
        .with_clock(Arc::new(ManualClock::new(at(100))));

    let recovered = scheduler.recover().await.unwrap();
    assert_eq!(recovered.len(), 2);

    for run_id in [&run1, &run2] {
        let run = storage.get_run(run_id).await.unwrap();
        assert_eq!(run.outcome, RunOutcome::Interrupted);
        assert_eq!(run.ended_at, Some(at(100)));
    }

    let status = storage.get_status(&JobId::new("job2")).await.unwrap().unwrap();
    assert_eq!(status.last_outcome, Some(RunOutcome::Interrupted));
}

/// Test: Finished runs are not affected by recovery.
#[tokio::test]
async fn test_finished_runs_not_affected_by_recovery() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let scheduler = Scheduler::with_storage(Arc::clone(&storage)).with_clock(clock.clone());
    let counter = CountingHandler::new();
    scheduler.register(every("done", 3600, counter.clone())).unwrap();

    let run_id = match scheduler.trigger(&JobId::new("done")).await.unwrap() {
        DispatchOutcome::Started(run_id) => run_id,
        other => panic!("expected start, got {:?}", other),
    };
    wait_for_run_outcome(
        storage.as_ref(),
        &run_id,
        RunOutcome::Success,
        Duration::from_secs(5),
    )
    .await;

    clock.set(at(10));
    let recovered = scheduler.recover().await.unwrap();
    assert!(recovered.is_empty());
    assert_eq!(
        storage.get_run(&run_id).await.unwrap().outcome,
        RunOutcome::Success
    );
}

/// Test: Recovery handles empty storage gracefully.
#[tokio::test]
async fn test_recovery_with_empty_storage() {
    let scheduler = Scheduler::new(InMemoryStorage::new());
    let recovered = scheduler.recover().await.unwrap();
    assert_eq!(recovered.len(), 0);
}

/// Test: After a crash, start() marks the orphaned run interrupted and the job runs again.
#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_crash_recovery_with_sqlite() {
    use tickwork::SqliteStorage;

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("runs.db");
    let job_id = JobId::new("nightly");

    // First process: a run starts and the process dies before it ends.
    let orphan = {
        let storage = SqliteStorage::new(&db_path).await.unwrap();
        let run_id = storage
            .record_start(NewRun::new(job_id.clone(), at(0), at(0), 1))
            .await
            .unwrap();
        storage.close().await;
        run_id
    };

    // Second process.
    let storage = Arc::new(SqliteStorage::new(&db_path).await.unwrap());
    let counter = CountingHandler::new();
    let scheduler = Scheduler::with_storage(Arc::clone(&storage));
    scheduler.register(every("nightly", 3600, counter.clone())).unwrap();

    let (handle, task) = scheduler.start().await.unwrap();

    let interrupted = storage.get_run(&orphan).await.unwrap();
    assert_eq!(interrupted.outcome, RunOutcome::Interrupted);
    assert!(interrupted.ended_at.is_some());

    let outcome = handle.trigger("nightly").await.unwrap();
    let run_id = outcome.run_id().cloned().unwrap();
    assert!(matches!(outcome, DispatchOutcome::Started(_)));
    wait_for_run_outcome(
        storage.as_ref(),
        &run_id,
        RunOutcome::Success,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(counter.count(), 1);

    let history = handle.history("nightly", 10).await.unwrap();
    let outcomes: Vec<RunOutcome> = history.iter().map(|r| r.outcome).collect();
    assert_eq!(outcomes, vec![RunOutcome::Success, RunOutcome::Interrupted]);

    handle.shutdown().await.unwrap();
    let _ = task.await;

    // Nothing is left in progress after a clean shutdown.
    let storage = SqliteStorage::new(&db_path).await.unwrap();
    assert!(!storage.is_running(&job_id).await.unwrap());
}

/// Test: A restarted scheduler continues the schedule from the last recorded occurrence.
#[tokio::test]
async fn test_restart_applies_missed_tick_policy() {
    let storage = Arc::new(InMemoryStorage::new());
    let job_id = JobId::new("hourly");

    // Last occurrence ran at t=3600 and the process stopped.
    let last = storage
        .record_start(NewRun::new(job_id.clone(), at(3600), at(3600), 1))
        .await
        .unwrap();
    storage
        .record_end(&last, RunCompletion::success(at(3601), None))
        .await
        .unwrap();

    // Restart two and a half hours later, with catch-up enabled.
    let recorder = RecordingEventHandler::new();
    let scheduler = Scheduler::with_storage(Arc::clone(&storage))
        .with_clock(Arc::new(ManualClock::new(at(3600 + 9000))))
        .with_missed_tick_policy(MissedTickPolicy::CatchUp);
    scheduler.event_bus().register(recorder.clone()).await;
    let counter = CountingHandler::new();
    scheduler.register(every("hourly", 3600, counter.clone())).unwrap();

    let (handle, task) = scheduler.start().await.unwrap();

    // Occurrences at t=7200 and t=10800 were missed; catch-up fires the latest once.
    let completed = recorder
        .wait_for_completions(1, Duration::from_secs(5))
        .await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].scheduled_at, at(10800));

    let summary = handle.job("hourly").unwrap();
    assert_eq!(summary.last_scheduled, Some(at(10800)));
    assert_eq!(summary.next_due, Some(at(14400)));

    handle.shutdown().await.unwrap();
    let _ = task.await;
    assert_eq!(counter.count(), 1);
}

/// Test: A manual run after the last scheduled one does not shift the
/// schedule's phase on restart.
#[tokio::test]
async fn test_restart_ignores_manual_runs_for_anchor() {
    let storage = Arc::new(InMemoryStorage::new());
    let job_id = JobId::new("hourly");

    let scheduled = storage
        .record_start(NewRun::new(job_id.clone(), at(3600), at(3600), 1))
        .await
        .unwrap();
    storage
        .record_end(&scheduled, RunCompletion::success(at(3601), None))
        .await
        .unwrap();

    // Someone triggered the job by hand at t=5000.
    let manual = storage
        .record_start(
            NewRun::new(job_id.clone(), at(5000), at(5000), 1).with_trigger(RunTrigger::Manual),
        )
        .await
        .unwrap();
    storage
        .record_end(&manual, RunCompletion::success(at(5001), None))
        .await
        .unwrap();

    let scheduler = Scheduler::with_storage(Arc::clone(&storage))
        .with_clock(Arc::new(ManualClock::new(at(6000))));
    scheduler.register(every("hourly", 3600, CountingHandler::new())).unwrap();
    let (handle, task) = scheduler.start().await.unwrap();

    let summary = handle.job("hourly").unwrap();
    assert_eq!(summary.last_scheduled, Some(at(3600)));
    assert_eq!(summary.next_due, Some(at(7200)));

    let latest = storage.last_run(&job_id).await.unwrap().unwrap();
    assert_eq!(latest.trigger, RunTrigger::Manual);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}
