//! End-to-end scheduling scenarios driven by a manual clock.

use crate::common::{at, every, manual_scheduler, settle};
use std::sync::Arc;
use std::time::Duration;
use tickwork::testing::{CountingHandler, FailingHandler, GatedHandler, RecordingEventHandler};
use tickwork::{
    CommandHandler, DispatchOutcome, JobDefinition, JobId, RecurrenceRule, RetryPolicy,
    RunOutcome, SkipReason, Storage,
};

/// A 60-second interval job fires at t=60, succeeds, and comes due again at t=120.
#[tokio::test]
async fn test_interval_job_fires_and_reschedules() {
    let (scheduler, clock) = manual_scheduler();
    let counter = CountingHandler::new();
    scheduler.register(every("report", 60, counter.clone())).unwrap();

    assert_eq!(scheduler.jobs()[0].next_due, Some(at(60)));

    clock.set(at(59));
    assert!(scheduler.tick().await.is_empty());

    clock.set(at(60));
    let report = scheduler.tick().await;
    assert_eq!(report.dispatched.len(), 1);
    assert!(matches!(report.dispatched[0].1, DispatchOutcome::Started(_)));
    settle(&scheduler).await;

    let runs = scheduler
        .storage()
        .list_runs(&JobId::new("report"), 10)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].scheduled_at, at(60));
    assert_eq!(runs[0].outcome, RunOutcome::Success);
    assert_eq!(runs[0].attempt, 1);
    assert_eq!(runs[0].output.as_deref(), Some("run 1"));

    assert_eq!(scheduler.jobs()[0].next_due, Some(at(120)));

    clock.set(at(120));
    scheduler.tick().await;
    settle(&scheduler).await;
    assert_eq!(counter.count(), 2);
}

/// A tick while the run is in flight records a skip; the tick after completion dispatches.
#[tokio::test]
async fn test_overlap_skip_then_dispatch_after_completion() {
    let (scheduler, clock) = manual_scheduler();
    let recorder = RecordingEventHandler::new();
    scheduler.event_bus().register(recorder.clone()).await;

    let gate = GatedHandler::new();
    scheduler.register(every("slow", 60, gate.clone())).unwrap();
    let job_id = JobId::new("slow");

    clock.set(at(60));
    let first = scheduler.tick().await;
    assert!(matches!(first.dispatched[0].1, DispatchOutcome::Started(_)));

    clock.set(at(120));
    let second = scheduler.tick().await;
    let skipped_id = match &second.dispatched[0].1 {
        DispatchOutcome::Skipped(run_id) => run_id.clone(),
        other => panic!("expected skip, got {:?}", other),
    };

    let skipped = scheduler.storage().get_run(&skipped_id).await.unwrap();
    assert_eq!(skipped.outcome, RunOutcome::SkippedOverlap);
    assert_eq!(skipped.scheduled_at, at(120));
    assert_eq!(
        recorder.skipped().await,
        vec![(job_id.clone(), SkipReason::Overlap)]
    );

    gate.release();
    settle(&scheduler).await;

    clock.set(at(180));
    let third = scheduler.tick().await;
    assert!(matches!(third.dispatched[0].1, DispatchOutcome::Started(_)));
    settle(&scheduler).await;

    assert_eq!(gate.started(), 2);
    let runs = scheduler.storage().list_runs(&job_id, 10).await.unwrap();
    let outcomes: Vec<RunOutcome> = runs.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            RunOutcome::Success,
            RunOutcome::SkippedOverlap,
            RunOutcome::Success
        ]
    );
}

/// Three attempts with exponential backoff (5s base, doubling) retry at +5s
/// then +10s, and the final failure queues nothing further.
#[tokio::test]
async fn test_retry_backoff_until_attempts_exhausted() {
    let (scheduler, clock) = manual_scheduler();
    let recorder = RecordingEventHandler::new();
    scheduler.event_bus().register(recorder.clone()).await;

    let handler = FailingHandler::always();
    scheduler
        .register(
            every("flaky", 3600, handler.clone())
                .with_retry(RetryPolicy::exponential(3, Duration::from_secs(5), 2.0)),
        )
        .unwrap();
    let job_id = JobId::new("flaky");

    scheduler.trigger(&job_id).await.unwrap();
    settle(&scheduler).await;

    let pending = scheduler.pending_retries();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt, 2);
    assert_eq!(pending[0].due_at, at(5));
    assert_eq!(pending[0].scheduled_at, at(0));

    clock.set(at(4));
    assert!(scheduler.tick().await.retried.is_empty());

    clock.set(at(5));
    let report = scheduler.tick().await;
    assert_eq!(report.retried.len(), 1);
    settle(&scheduler).await;

    let pending = scheduler.pending_retries();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt, 3);
    assert_eq!(pending[0].due_at, at(15));

    clock.set(at(15));
    assert_eq!(scheduler.tick().await.retried.len(), 1);
    settle(&scheduler).await;

    assert!(scheduler.pending_retries().is_empty());
    assert_eq!(handler.call_count().await, 3);

    let runs = scheduler.storage().list_runs(&job_id, 10).await.unwrap();
    assert_eq!(runs.len(), 3);
    assert_eq!(runs[0].attempt, 3);
    assert_eq!(runs[0].outcome, RunOutcome::Failure);
    assert!(runs.iter().all(|r| r.scheduled_at == at(0)));

    let started: Vec<_> = runs.iter().rev().map(|r| r.started_at).collect();
    assert_eq!(started, vec![at(0), at(5), at(15)]);

    // Nothing further comes due.
    clock.set(at(600));
    assert!(scheduler.tick().await.retried.is_empty());
    assert_eq!(recorder.completed().await.len(), 3);
}

/// A failure that recovers on retry ends with a successful record.
#[tokio::test]
async fn test_retry_recovers_after_transient_failure() {
    let (scheduler, clock) = manual_scheduler();
    let handler = FailingHandler::transient(1);
    scheduler
        .register(every("sync", 3600, handler.clone()).with_retry(
            RetryPolicy::fixed(3, Duration::from_secs(30))
                .with_condition(tickwork::RetryCondition::TransientOnly),
        ))
        .unwrap();
    let job_id = JobId::new("sync");

    scheduler.trigger(&job_id).await.unwrap();
    settle(&scheduler).await;
    assert_eq!(scheduler.pending_retries().len(), 1);

    clock.set(at(30));
    scheduler.tick().await;
    settle(&scheduler).await;

    assert!(scheduler.pending_retries().is_empty());
    let last = scheduler.storage().last_run(&job_id).await.unwrap().unwrap();
    assert_eq!(last.outcome, RunOutcome::Success);
    assert_eq!(last.attempt, 2);
}

/// A downstream job waits until its dependency has succeeded.
#[tokio::test]
async fn test_dependency_chain() {
    let (scheduler, clock) = manual_scheduler();
    let recorder = RecordingEventHandler::new();
    scheduler.event_bus().register(recorder.clone()).await;

    let upstream = FailingHandler::new(1);
    let downstream = CountingHandler::new();
    scheduler.register(every("extract", 3600, upstream.clone())).unwrap();
    scheduler
        .register(every("load", 60, downstream.clone()).depends_on("extract"))
        .unwrap();
    let extract = JobId::new("extract");

    // Upstream has never run.
    clock.set(at(60));
    let report = scheduler.tick().await;
    assert_eq!(report.blocked, vec![JobId::new("load")]);

    // Upstream's latest run failed.
    scheduler.trigger(&extract).await.unwrap();
    settle(&scheduler).await;
    clock.set(at(120));
    let report = scheduler.tick().await;
    assert_eq!(report.blocked, vec![JobId::new("load")]);

    // Upstream's latest run succeeded.
    scheduler.trigger(&extract).await.unwrap();
    settle(&scheduler).await;
    clock.set(at(180));
    let report = scheduler.tick().await;
    assert!(report.blocked.is_empty());
    assert_eq!(report.dispatched.len(), 1);
    settle(&scheduler).await;
    assert_eq!(downstream.count(), 1);
    assert_eq!(upstream.call_count().await, 2);

    let blocked = recorder.skipped().await;
    assert_eq!(blocked.len(), 2);
    assert!(matches!(
        &blocked[0],
        (job, SkipReason::DependencyNotMet { dependency })
            if job.as_str() == "load" && dependency == &extract
    ));
}

/// A failing command's standard error is kept on its run record.
#[tokio::test]
async fn test_failed_command_stores_stderr() {
    let (scheduler, _clock) = manual_scheduler();
    scheduler
        .register(JobDefinition::new(
            "noisy",
            RecurrenceRule::every(Duration::from_secs(3600)),
            Arc::new(CommandHandler::shell("echo boom >&2; exit 3")),
        ))
        .unwrap();

    let run_id = scheduler
        .trigger(&JobId::new("noisy"))
        .await
        .unwrap()
        .run_id()
        .cloned()
        .unwrap();
    settle(&scheduler).await;

    let run = scheduler.storage().get_run(&run_id).await.unwrap();
    assert_eq!(run.outcome, RunOutcome::Failure);
    let error = run.error.unwrap();
    assert!(error.contains("code 3"), "unexpected error: {}", error);
    assert!(error.contains("boom"), "unexpected error: {}", error);
}
