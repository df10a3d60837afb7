//! YAML configuration integration tests.
//!
//! Tests that load job files from disk, register them into a scheduler and
//! run the resulting command jobs.

use crate::common::{at, settle, t0};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tickwork::{
    load_jobs_from_directory, load_jobs_from_directory_with, ConfigError, InMemoryStorage, JobId,
    ManualClock, MissedTickPolicy, RunOutcome, Scheduler, Storage, YamlLoader,
};

fn write_job(dir: &Path, file: &str, yaml: &str) {
    fs::write(dir.join(file), yaml).unwrap();
}

/// Answer each connection on a local port with the next canned response.
async fn serve_responses(responses: Vec<(&'static str, &'static str)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for (status, body) in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{}/hook", addr)
}

/// Test: A command job loaded from YAML fires on schedule and stores its stdout.
#[tokio::test]
async fn test_yaml_job_runs_and_records_output() {
    let dir = tempfile::tempdir().unwrap();
    write_job(
        dir.path(),
        "hello.yaml",
        r#"
id: hello
schedule:
  every: 1m
command: echo
args: ["hello"]
"#,
    );

    let clock = Arc::new(ManualClock::new(t0()));
    let scheduler = Scheduler::new(InMemoryStorage::new()).with_clock(clock.clone());
    for job in load_jobs_from_directory(dir.path()).unwrap() {
        scheduler.register(job).unwrap();
    }
    assert_eq!(scheduler.jobs()[0].next_due, Some(at(60)));

    clock.set(at(60));
    let report = scheduler.tick().await;
    assert_eq!(report.dispatched.len(), 1);
    settle(&scheduler).await;

    let last = scheduler
        .storage()
        .last_run(&JobId::new("hello"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.outcome, RunOutcome::Success);
    assert_eq!(last.output.as_deref(), Some("hello"));
}

/// Test: Jobs restricted to another environment advance without running.
#[tokio::test]
async fn test_environment_allow_list_from_yaml() {
    let dir = tempfile::tempdir().unwrap();
    write_job(
        dir.path(),
        "everywhere.yaml",
        r#"
id: everywhere
schedule:
  every: 60s
command: "true"
"#,
    );
    write_job(
        dir.path(),
        "prod_only.yml",
        r#"
id: prod_only
schedule:
  every: 60s
command: "true"
environments: [production]
"#,
    );

    let global = YamlLoader::parse_global_config("environment: staging\n").unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let scheduler = Scheduler::new(InMemoryStorage::new())
        .with_config(global.scheduler_config().unwrap())
        .with_clock(clock.clone());
    for job in load_jobs_from_directory_with(dir.path(), &global).unwrap() {
        scheduler.register(job).unwrap();
    }

    clock.set(at(60));
    let report = scheduler.tick().await;
    let dispatched: Vec<&str> = report.dispatched.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(dispatched, vec!["everywhere"]);
    settle(&scheduler).await;

    let storage = scheduler.storage();
    assert_eq!(storage.list_runs(&JobId::new("everywhere"), 10).await.unwrap().len(), 1);
    assert!(storage.list_runs(&JobId::new("prod_only"), 10).await.unwrap().is_empty());

    let prod_only = scheduler
        .jobs()
        .into_iter()
        .find(|j| j.id.as_str() == "prod_only")
        .unwrap();
    assert_eq!(prod_only.next_due, Some(at(120)));
}

/// Test: A failing command picks up the global default retry policy.
#[tokio::test]
async fn test_default_retry_applies_to_failing_command() {
    let dir = tempfile::tempdir().unwrap();
    write_job(
        dir.path(),
        "broken.yaml",
        r#"
id: broken
schedule:
  every: 1h
command: "false"
"#,
    );

    let global = YamlLoader::parse_global_config(
        r#"
default_retry:
  max_attempts: 2
  backoff:
    strategy: fixed
    base_secs: 10
"#,
    )
    .unwrap();

    let clock = Arc::new(ManualClock::new(t0()));
    let scheduler = Scheduler::new(InMemoryStorage::new()).with_clock(clock.clone());
    for job in load_jobs_from_directory_with(dir.path(), &global).unwrap() {
        scheduler.register(job).unwrap();
    }
    let job_id = JobId::new("broken");

    scheduler.trigger(&job_id).await.unwrap();
    settle(&scheduler).await;

    let pending = scheduler.pending_retries();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].due_at, at(10));

    clock.set(at(10));
    assert_eq!(scheduler.tick().await.retried.len(), 1);
    settle(&scheduler).await;
    assert!(scheduler.pending_retries().is_empty());

    let runs = scheduler.storage().list_runs(&job_id, 10).await.unwrap();
    let attempts: Vec<u32> = runs.iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![2, 1]);
    assert!(runs.iter().all(|r| r.outcome == RunOutcome::Failure));
}

/// Test: Dependencies are registered before their dependents regardless of file order.
#[tokio::test]
async fn test_directory_load_orders_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    write_job(
        dir.path(),
        "a_publish.yaml",
        r#"
id: publish
schedule:
  every: 1h
command: "true"
depends_on: [build]
"#,
    );
    write_job(
        dir.path(),
        "b_build.yaml",
        r#"
id: build
schedule:
  every: 1h
command: "true"
"#,
    );

    let jobs = load_jobs_from_directory(dir.path()).unwrap();
    let ids: Vec<&str> = jobs.iter().map(|j| j.id().as_str()).collect();
    assert_eq!(ids, vec!["build", "publish"]);

    let scheduler = Scheduler::new(InMemoryStorage::new());
    for job in jobs {
        scheduler.register(job).unwrap();
    }
    assert_eq!(scheduler.jobs().len(), 2);
}

/// Test: Duplicate job ids across files are rejected.
#[tokio::test]
async fn test_duplicate_ids_across_files() {
    let dir = tempfile::tempdir().unwrap();
    let job = r#"
id: twin
schedule:
  every: 1h
command: "true"
"#;
    write_job(dir.path(), "one.yaml", job);
    write_job(dir.path(), "two.yaml", job);

    let result = load_jobs_from_directory(dir.path());
    assert!(matches!(result, Err(ConfigError::DuplicateJob { ref id, .. }) if id == "twin"));
}

/// Test: Global settings map onto the scheduler configuration.
#[test]
fn test_global_config_maps_to_scheduler_config() {
    let global = YamlLoader::parse_global_config(
        r#"
tick_interval_secs: 5
missed_ticks: catch_up
shutdown_grace_secs: 12
default_timeout_secs: 300
max_runs_per_job: 50
environment: production
"#,
    )
    .unwrap();

    let config = global.scheduler_config().unwrap();
    assert_eq!(config.tick_interval, Duration::from_secs(5));
    assert_eq!(config.misfire_threshold(), Duration::from_secs(10));
    assert_eq!(config.missed_ticks, MissedTickPolicy::CatchUp);
    assert_eq!(config.shutdown_grace, Duration::from_secs(12));
    assert_eq!(config.default_timeout, Some(Duration::from_secs(300)));
    assert_eq!(config.max_runs_per_job, Some(50));
    assert_eq!(config.environment.as_deref(), Some("production"));

    let zero_tick = YamlLoader::parse_global_config("tick_interval_secs: 0\n").unwrap();
    assert!(matches!(
        zero_tick.scheduler_config(),
        Err(ConfigError::InvalidConfig(_))
    ));
}

/// Test: A URL job from YAML records the response body, and an error status
/// fails the run.
#[tokio::test]
async fn test_yaml_url_job_records_response() {
    let url = serve_responses(vec![
        ("200 OK", "warmed"),
        ("503 Service Unavailable", "try later"),
    ])
    .await;

    let dir = tempfile::tempdir().unwrap();
    write_job(
        dir.path(),
        "warm.yaml",
        &format!(
            "id: warm\nschedule:\n  every: 1m\nurl:\n  endpoint: {}\n  method: post\n  body: go\ntimeout_secs: 5\n",
            url
        ),
    );

    let clock = Arc::new(ManualClock::new(t0()));
    let scheduler = Scheduler::new(InMemoryStorage::new()).with_clock(clock.clone());
    for job in load_jobs_from_directory(dir.path()).unwrap() {
        scheduler.register(job).unwrap();
    }
    let job_id = JobId::new("warm");

    clock.set(at(60));
    assert_eq!(scheduler.tick().await.dispatched.len(), 1);
    settle(&scheduler).await;

    let first = scheduler.storage().last_run(&job_id).await.unwrap().unwrap();
    assert_eq!(first.outcome, RunOutcome::Success);
    assert_eq!(first.output.as_deref(), Some("warmed"));

    clock.set(at(120));
    assert_eq!(scheduler.tick().await.dispatched.len(), 1);
    settle(&scheduler).await;

    let second = scheduler.storage().last_run(&job_id).await.unwrap().unwrap();
    assert_eq!(second.outcome, RunOutcome::Failure);
    assert_eq!(
        second.error.as_deref(),
        Some("request returned status 503: try later")
    );
}
