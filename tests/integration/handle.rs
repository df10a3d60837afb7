//! Scheduler handle integration tests.
//!
//! Tests that verify runtime control of a running scheduler: registration,
//! pausing, manual triggers and run history.

use crate::common::{every, manual_scheduler, wait_for_run_outcome};
use std::time::Duration;
use tickwork::testing::{CountingHandler, GatedHandler};
use tickwork::{DispatchOutcome, JobId, LoopState, RunOutcome, RunTrigger, SchedulerError, Storage};

/// Test: Scheduler state transitions.
#[tokio::test]
async fn test_scheduler_state_transitions() {
    let (scheduler, _clock) = manual_scheduler();
    let (handle, task) = scheduler.start().await.unwrap();

    // Initially running
    assert!(handle.is_running().await);
    assert!(!handle.is_paused().await);

    // Pause
    handle.pause().await.unwrap();
    assert!(handle.is_paused().await);
    assert!(!handle.is_running().await);

    // Resume
    handle.resume().await.unwrap();
    assert!(handle.is_running().await);
    assert!(!handle.is_paused().await);

    // Shutdown
    handle.shutdown().await.unwrap();
    assert_eq!(handle.state().await, LoopState::Stopped);

    let _ = task.await;
}

/// Test: Jobs registered at runtime can be listed, triggered and removed; a
/// second removal reports the job as unknown.
#[tokio::test]
async fn test_register_and_deregister_at_runtime() {
    let (scheduler, _clock) = manual_scheduler();
    let storage = scheduler.storage().clone();
    let (handle, task) = scheduler.start().await.unwrap();

    let counter = CountingHandler::new();
    let summary = handle.register(every("late", 60, counter.clone())).await.unwrap();
    assert_eq!(summary.id, JobId::new("late"));
    assert_eq!(handle.jobs().len(), 1);
    assert!(storage.get_status(&summary.id).await.unwrap().is_some());

    let duplicate = handle.register(every("late", 30, counter.clone())).await;
    assert!(matches!(duplicate, Err(SchedulerError::DuplicateId(id)) if id.as_str() == "late"));

    let run_id = handle.trigger("late").await.unwrap().run_id().cloned().unwrap();
    wait_for_run_outcome(storage.as_ref(), &run_id, RunOutcome::Success, Duration::from_secs(5))
        .await;

    handle.deregister("late").await.unwrap();
    assert!(handle.jobs().is_empty());
    assert!(storage.get_status(&JobId::new("late")).await.unwrap().is_none());

    let again = handle.deregister("late").await;
    assert!(matches!(again, Err(SchedulerError::NotFound(id)) if id.as_str() == "late"));

    let trigger = handle.trigger("late").await;
    assert!(matches!(trigger, Err(SchedulerError::NotFound(_))));

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: Registering a job with an unknown dependency is a configuration error.
#[tokio::test]
async fn test_register_rejects_unknown_dependency() {
    let (scheduler, _clock) = manual_scheduler();
    let (handle, task) = scheduler.start().await.unwrap();

    let result = handle
        .register(every("child", 60, CountingHandler::new()).depends_on("parent"))
        .await;
    assert!(matches!(result, Err(SchedulerError::Configuration(_))));
    assert!(handle.jobs().is_empty());

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: Manual triggers work while a job or the whole scheduler is paused.
#[tokio::test]
async fn test_manual_trigger_while_paused() {
    let (scheduler, _clock) = manual_scheduler();
    let counter = CountingHandler::new();
    scheduler.register(every("manual", 60, counter.clone())).unwrap();
    let storage = scheduler.storage().clone();
    let (handle, task) = scheduler.start().await.unwrap();

    let summary = handle.pause_job("manual").await.unwrap();
    assert!(summary.paused);
    let status = storage.get_status(&JobId::new("manual")).await.unwrap().unwrap();
    assert!(status.paused);

    handle.pause().await.unwrap();
    let run_id = handle.trigger("manual").await.unwrap().run_id().cloned().unwrap();
    wait_for_run_outcome(storage.as_ref(), &run_id, RunOutcome::Success, Duration::from_secs(5))
        .await;
    assert_eq!(counter.count(), 1);

    let summary = handle.resume_job("manual").await.unwrap();
    assert!(!summary.paused);
    handle.resume().await.unwrap();

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: last_run and history reflect completed runs.
#[tokio::test]
async fn test_last_run_and_history() {
    let (scheduler, _clock) = manual_scheduler();
    scheduler.register(every("audit", 60, CountingHandler::new())).unwrap();
    let storage = scheduler.storage().clone();
    let (handle, task) = scheduler.start().await.unwrap();

    assert!(handle.last_run("audit").await.unwrap().is_none());
    assert!(matches!(
        handle.last_run("ghost").await,
        Err(SchedulerError::NotFound(_))
    ));

    for _ in 0..3 {
        let run_id = handle.trigger("audit").await.unwrap().run_id().cloned().unwrap();
        wait_for_run_outcome(storage.as_ref(), &run_id, RunOutcome::Success, Duration::from_secs(5))
            .await;
    }

    let last = handle.last_run("audit").await.unwrap().unwrap();
    assert_eq!(last.outcome, RunOutcome::Success);
    assert_eq!(last.output.as_deref(), Some("run 3"));
    assert_eq!(last.trigger, RunTrigger::Manual);

    let history = handle.history("audit", 2).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, last.id);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: running_jobs lists in-flight runs until they finish.
#[tokio::test]
async fn test_running_jobs_reports_in_flight_runs() {
    let (scheduler, _clock) = manual_scheduler();
    let gate = GatedHandler::new();
    scheduler.register(every("gated", 60, gate.clone())).unwrap();
    let (handle, task) = scheduler.start().await.unwrap();

    let outcome = handle.trigger("gated").await.unwrap();
    let run_id = match outcome {
        DispatchOutcome::Started(run_id) => run_id,
        other => panic!("expected start, got {:?}", other),
    };

    let running = handle.running_jobs();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].run_id, run_id);
    assert_eq!(running[0].job_id.as_str(), "gated");
    assert_eq!(running[0].attempt, 1);

    // A second trigger is skipped while the first is in flight.
    assert!(matches!(
        handle.trigger("gated").await.unwrap(),
        DispatchOutcome::Skipped(_)
    ));

    gate.release();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !handle.running_jobs().is_empty() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.shutdown().await.unwrap();
    let _ = task.await;
}
