//! Tests for worker selection, health and batch processing.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::config::{DistributionStrategy, RetryConfig, WorkerConfig};
use crate::coordination::InMemoryStore;
use crate::types::SkipReason;

fn config(workers: Vec<WorkerConfig>) -> Config {
    Config {
        workers,
        retry: RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        },
        ..Config::default()
    }
}

fn orchestrator(config: Config) -> Orchestrator {
    Orchestrator::new(config, Arc::new(InMemoryStore::new())).unwrap()
}

fn two_workers() -> Vec<WorkerConfig> {
    vec![WorkerConfig::direct(), WorkerConfig::proxy("127.0.0.1", 3128)]
}

fn transport_error() -> DownloadError {
    DownloadError::Transport("connection reset".into())
}

// -----------------------------------------------------------------------
// Initialization
// -----------------------------------------------------------------------

#[test]
fn invalid_descriptors_are_skipped() {
    let invalid = WorkerConfig {
        direct: false,
        host: Some("proxy.local".into()),
        port: None,
        ..WorkerConfig::default()
    };
    let orchestrator = orchestrator(config(vec![invalid, WorkerConfig::direct()]));

    assert_eq!(orchestrator.workers().len(), 1);
    assert_eq!(orchestrator.workers()[0].id(), WorkerId(0));
    assert_eq!(orchestrator.health()[0].status, HealthStatus::Healthy);
}

#[test]
fn zero_valid_workers_is_fatal() {
    let invalid = WorkerConfig {
        direct: false,
        ..WorkerConfig::default()
    };
    let result = Orchestrator::new(config(vec![invalid]), Arc::new(InMemoryStore::new()));
    assert!(matches!(result, Err(Error::NoWorkers)));
}

#[test]
fn holder_strings_carry_instance_worker_and_identity() {
    let mut config = config(two_workers());
    config.coordination.instance_id = Some("host-a".into());
    let orchestrator = orchestrator(config);

    assert_eq!(orchestrator.workers()[0].holder(), "host-a/worker-0/direct");
    assert_eq!(
        orchestrator.workers()[1].holder(),
        "host-a/worker-1/proxy:127.0.0.1:3128"
    );
}

// -----------------------------------------------------------------------
// Selection and health
// -----------------------------------------------------------------------

#[test]
fn unhealthy_worker_is_excluded_while_another_is_healthy() {
    let mut config = config(two_workers());
    config.strategy = DistributionStrategy::FirstAvailable;
    let orchestrator = orchestrator(config);

    for _ in 0..3 {
        orchestrator.record_failure(WorkerId(0), &transport_error());
    }

    assert_eq!(orchestrator.health()[0].status, HealthStatus::Unhealthy);
    for _ in 0..5 {
        assert_eq!(orchestrator.select_worker().unwrap().id(), WorkerId(1));
    }
}

#[test]
fn degraded_worker_is_not_a_candidate() {
    let mut config = config(two_workers());
    config.strategy = DistributionStrategy::FirstAvailable;
    let orchestrator = orchestrator(config);

    orchestrator.record_failure(WorkerId(0), &transport_error());

    assert_eq!(orchestrator.health()[0].status, HealthStatus::Degraded);
    assert_eq!(orchestrator.select_worker().unwrap().id(), WorkerId(1));
}

#[test]
fn single_unhealthy_worker_is_still_selected() {
    let orchestrator = orchestrator(config(vec![WorkerConfig::direct()]));

    for _ in 0..3 {
        orchestrator.record_failure(WorkerId(0), &transport_error());
    }

    assert_eq!(orchestrator.health()[0].status, HealthStatus::Unhealthy);
    assert_eq!(orchestrator.select_worker().unwrap().id(), WorkerId(0));
}

#[test]
fn round_robin_alternates_between_healthy_workers() {
    let mut config = config(two_workers());
    config.strategy = DistributionStrategy::RoundRobin;
    let orchestrator = orchestrator(config);

    let picks: Vec<_> = (0..4)
        .map(|_| orchestrator.select_worker().unwrap().id().0)
        .collect();

    assert_eq!(picks, vec![0, 1, 0, 1]);
}

#[tokio::test]
async fn load_balanced_avoids_busy_worker() {
    let orchestrator = orchestrator(config(two_workers()));
    let busy = &orchestrator.workers()[0];

    let selected = busy
        .with_post_slot(async { orchestrator.select_worker().unwrap().id() })
        .await;

    assert_eq!(selected, WorkerId(1));
}

#[tokio::test(start_paused = true)]
async fn unhealthy_worker_recovers_after_cooldown() {
    let orchestrator = orchestrator(config(two_workers()));
    let mut events = orchestrator.subscribe();
    for _ in 0..3 {
        orchestrator.record_failure(WorkerId(0), &transport_error());
    }

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(
        orchestrator.attempt_recovery(WorkerId(0)),
        Some(HealthStatus::Unhealthy)
    );

    tokio::time::advance(Duration::from_secs(240)).await;
    assert_eq!(
        orchestrator.attempt_recovery(WorkerId(0)),
        Some(HealthStatus::Healthy)
    );
    assert_eq!(orchestrator.health()[0].consecutive_failures, 0);

    let transitions: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            Event::WorkerHealthChanged { worker, to, .. } => Some((worker, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (WorkerId(0), HealthStatus::Degraded),
            (WorkerId(0), HealthStatus::Unhealthy),
            (WorkerId(0), HealthStatus::Healthy),
        ]
    );
}

// -----------------------------------------------------------------------
// Submission
// -----------------------------------------------------------------------

#[tokio::test]
async fn submit_downloads_and_resets_failure_streak() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("data"))
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(config(vec![WorkerConfig::direct()]));
    orchestrator.record_failure(WorkerId(0), &transport_error());

    let outcome = orchestrator
        .submit(Task::new(format!("{}/f", server.uri()), dir.path().join("f")))
        .await
        .unwrap();

    assert!(matches!(outcome, TaskOutcome::Downloaded { bytes: 4, .. }));
    let health = orchestrator.health();
    assert_eq!(health[0].status, HealthStatus::Healthy);
    assert_eq!(health[0].consecutive_failures, 0);
}

#[tokio::test]
async fn failed_submit_counts_against_worker_health() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(config(vec![WorkerConfig::direct()]));

    let err = orchestrator
        .submit(Task::new(format!("{}/f", server.uri()), dir.path().join("f")))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Download(DownloadError::RetriesExhausted { attempts: 1, .. })
    ));
    assert_eq!(orchestrator.health()[0].status, HealthStatus::Degraded);
    assert_eq!(orchestrator.stats().await.totals.failed, 1);
}

#[tokio::test]
async fn skip_marked_rejection_does_not_touch_health() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(config(vec![WorkerConfig::direct()]));
    let task = Task::new("http://127.0.0.1:9/x", dir.path().join("x"));
    let key = TaskCoordinator::derive_key(&task);
    orchestrator
        .coordinator()
        .set_skip_marker(&key, "timeout")
        .await
        .unwrap();

    let err = orchestrator.submit(task).await.unwrap_err();

    assert!(matches!(err, Error::Download(DownloadError::SkipMarked)));
    assert_eq!(orchestrator.health()[0].status, HealthStatus::Healthy);
}

#[tokio::test]
async fn destination_check_failure_does_not_touch_health() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(config(vec![WorkerConfig::direct()]));
    let blocker = dir.path().join("file");
    tokio::fs::write(&blocker, b"x").await.unwrap();

    for i in 0..4 {
        let task = Task::new("http://127.0.0.1:9/x", blocker.join(i.to_string()));
        let err = orchestrator.submit(task.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Download(DownloadError::DestinationCheck(_))
        ));
        let key = TaskCoordinator::derive_key(&task);
        assert!(orchestrator.coordinator().failure(&key).await.unwrap().is_none());
    }

    let health = orchestrator.health();
    assert_eq!(health[0].status, HealthStatus::Healthy);
    assert_eq!(health[0].consecutive_failures, 0);
}

#[tokio::test]
async fn submit_batch_aggregates_per_unit_results() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("xy"))
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(config(two_workers_direct()));
    let existing = dir.path().join("post-2/0");
    tokio::fs::create_dir_all(existing.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&existing, b"old").await.unwrap();

    let posts = vec![1usize, 2, 3];
    let base = server.uri();
    let stats = orchestrator
        .submit_batch(posts, |post| {
            (0..*post)
                .map(|i| {
                    Task::new(
                        format!("{base}/{post}/{i}"),
                        dir.path().join(format!("post-{post}/{i}")),
                    )
                    .with_post("artist", post.to_string())
                })
                .collect()
        })
        .await
        .unwrap();

    let tasks: Vec<_> = stats.units.iter().map(|u| (u.index, u.tasks)).collect();
    assert_eq!(tasks, vec![(0, 1), (1, 2), (2, 3)]);
    assert_eq!(stats.totals.downloaded, 5);
    assert_eq!(stats.totals.skipped, 1);
    assert_eq!(stats.totals.bytes, 10);
    assert_eq!(stats.units[1].counts.skipped, 1);

    let totals = orchestrator.stats().await;
    assert_eq!(totals.totals, stats.totals);
    assert_eq!(totals.pending_tasks, 0);
    assert_eq!(totals.healthy_workers, 2);
}

fn two_workers_direct() -> Vec<WorkerConfig> {
    vec![WorkerConfig::direct(), WorkerConfig::direct()]
}

#[tokio::test]
async fn resubmitting_a_completed_task_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("once"))
        .expect(1)
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(config(vec![WorkerConfig::direct()]));
    let task = Task::new(format!("{}/once", server.uri()), dir.path().join("once"));

    orchestrator.submit(task.clone()).await.unwrap();
    tokio::fs::remove_file(&task.destination).await.unwrap();
    let outcome = orchestrator.submit(task).await.unwrap();

    assert_eq!(
        outcome,
        TaskOutcome::Skipped {
            reason: SkipReason::AlreadyCompleted
        }
    );
}

#[tokio::test]
async fn units_cut_off_by_shutdown_count_as_failed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("slow")
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let mut config = config(vec![WorkerConfig::direct()]);
    config.limits.post_limit = 1;
    let orchestrator = orchestrator(config);
    let base = server.uri();

    let (stats, _) = tokio::join!(
        orchestrator.submit_batch(vec![1usize, 2], |post| {
            (0..*post)
                .map(|i| {
                    Task::new(
                        format!("{base}/{post}/{i}"),
                        dir.path().join(format!("{post}-{i}")),
                    )
                })
                .collect()
        }),
        async {
            // The first unit holds the only post slot until its transfer ends
            tokio::time::sleep(Duration::from_millis(100)).await;
            orchestrator.shutdown().await.unwrap();
        }
    );
    let stats = stats.unwrap();

    assert_eq!(stats.units[0].counts.downloaded, 1);
    assert_eq!(stats.units[1].counts.failed, 2);
    for unit in &stats.units {
        assert_eq!(unit.counts.total(), unit.tasks as u64);
    }
}

// -----------------------------------------------------------------------
// Shutdown
// -----------------------------------------------------------------------

#[tokio::test]
async fn shutdown_stops_accepting_and_resets_stats() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(config(vec![WorkerConfig::direct()]));
    let existing = dir.path().join("there");
    tokio::fs::write(&existing, b"x").await.unwrap();
    orchestrator
        .submit(Task::new("http://127.0.0.1:9/", &existing))
        .await
        .unwrap();
    assert_eq!(orchestrator.stats().await.totals.skipped, 1);

    orchestrator.shutdown().await.unwrap();

    assert!(!orchestrator.is_accepting());
    assert_eq!(orchestrator.stats().await.totals, TaskCounts::default());
    let err = orchestrator
        .submit(Task::new("http://127.0.0.1:9/", dir.path().join("new")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
    let err = orchestrator
        .submit_batch(Vec::<u8>::new(), |_| Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
}
