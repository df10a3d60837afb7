//! Graceful shutdown integration tests.
//!
//! Tests that verify the scheduler waits for running jobs during shutdown,
//! abandons the ones that outlive the grace period, and drops queued work.

use crate::common::{every, wait_for_run_outcome};
use std::sync::Arc;
use std::time::Duration;
use tickwork::testing::{FailingHandler, RecordingEventHandler, SleepHandler};
use tickwork::{
    Event, EventBus, InMemoryStorage, JobId, LoopState, RetryPolicy, RunOutcome, Scheduler,
    SchedulerError, Storage,
};

/// Test: Graceful shutdown waits for running jobs to complete.
#[tokio::test]
async fn test_graceful_shutdown_waits_for_jobs() {
    let storage = Arc::new(InMemoryStorage::new());
    let event_bus = EventBus::new();
    let recorder = RecordingEventHandler::new();
    event_bus.register(recorder.clone()).await;

    let sleeper = SleepHandler::new(Duration::from_millis(300));
    let scheduler = Scheduler::with_storage(Arc::clone(&storage))
        .with_event_bus(event_bus)
        .with_shutdown_grace(Duration::from_secs(5));
    scheduler.register(every("slow", 3600, sleeper.clone())).unwrap();

    let (handle, task) = scheduler.start().await.unwrap();
    let run_id = handle
        .trigger("slow")
        .await
        .unwrap()
        .run_id()
        .cloned()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.running_jobs().len(), 1);

    handle.shutdown().await.unwrap();

    // Shutdown returned only after the run finished.
    assert!(sleeper.completed());
    assert_eq!(
        storage.get_run(&run_id).await.unwrap().outcome,
        RunOutcome::Success
    );
    assert_eq!(handle.state().await, LoopState::Stopped);

    let events = recorder.events().await;
    assert!(events.iter().any(|e| matches!(
        e,
        Event::SchedulerDraining { in_flight: 1, .. }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::SchedulerStopped { abandoned: 0, .. }
    )));

    let _ = task.await;
}

/// Test: Runs that outlive the grace period are cancelled and marked abandoned.
#[tokio::test]
async fn test_shutdown_abandons_runs_after_grace_period() {
    let storage = Arc::new(InMemoryStorage::new());
    let recorder = RecordingEventHandler::new();
    let scheduler = Scheduler::with_storage(Arc::clone(&storage))
        .with_shutdown_grace(Duration::from_millis(100));
    scheduler.event_bus().register(recorder.clone()).await;

    let sleeper = SleepHandler::stubborn(Duration::from_secs(30));
    scheduler.register(every("stuck", 3600, sleeper.clone())).unwrap();

    let (handle, task) = scheduler.start().await.unwrap();
    let run_id = handle
        .trigger("stuck")
        .await
        .unwrap()
        .run_id()
        .cloned()
        .unwrap();

    let start = tokio::time::Instant::now();
    handle.shutdown().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));

    let run = wait_for_run_outcome(
        storage.as_ref(),
        &run_id,
        RunOutcome::Timeout,
        Duration::from_secs(1),
    )
    .await;
    assert_eq!(
        run.error.as_deref(),
        Some("abandoned after shutdown grace period")
    );
    assert!(!sleeper.completed());
    assert!(handle.running_jobs().is_empty());

    let events = recorder.events().await;
    assert!(events.iter().any(|e| matches!(
        e,
        Event::SchedulerStopped { abandoned: 1, .. }
    )));

    let _ = task.await;
}

/// Test: Shutdown drops pending retries.
#[tokio::test]
async fn test_shutdown_drops_pending_retries() {
    let scheduler = Scheduler::new(InMemoryStorage::new());
    let handler = FailingHandler::always();
    scheduler
        .register(
            every("retrying", 3600, handler.clone())
                .with_retry(RetryPolicy::fixed(5, Duration::from_secs(60))),
        )
        .unwrap();

    let (handle, task) = scheduler.start().await.unwrap();
    handle.trigger("retrying").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while handle.pending_retries().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "retry never queued");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.shutdown().await.unwrap();
    assert!(handle.pending_retries().is_empty());
    assert_eq!(handler.call_count().await, 1);

    let _ = task.await;
}

/// Test: Shutdown with no running jobs completes immediately.
#[tokio::test]
async fn test_shutdown_with_no_running_jobs() {
    let scheduler = Scheduler::new(InMemoryStorage::new())
        .with_shutdown_grace(Duration::from_secs(30));

    let (handle, task) = scheduler.start().await.unwrap();

    let start = tokio::time::Instant::now();
    handle.shutdown().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));

    let _ = task.await;
}

/// Test: The handle reports a closed channel once the loop has stopped.
#[tokio::test]
async fn test_commands_fail_after_shutdown() {
    let scheduler = Scheduler::new(InMemoryStorage::new());
    scheduler
        .register(every("any", 3600, SleepHandler::new(Duration::ZERO)))
        .unwrap();

    let (handle, task) = scheduler.start().await.unwrap();
    handle.shutdown().await.unwrap();
    let _ = task.await;

    assert!(!handle.is_running().await);
    let result = handle.trigger(JobId::new("any")).await;
    assert!(matches!(result, Err(SchedulerError::ChannelError(_))));
}
