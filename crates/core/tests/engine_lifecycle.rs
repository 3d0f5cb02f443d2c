//! Engine lifecycle integration tests.
//!
//! These tests drive a full engine with the mock renderer:
//! - Priority ordering and the global concurrency cap
//! - Retry with backoff and terminal failures
//! - Cancellation of queued and running jobs
//! - Graceful shutdown and recovery from persistence

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use framequeue_core::{
    config::Config,
    create_persistence_system,
    job::JobFilter,
    recovery::ErrorCategory,
    renderer::RenderError,
    resources::ResourceSnapshot,
    testing::{fixtures, MockRenderer},
    CancelOutcome, JobSpec, JobState, Persistence, RenderEngine, ResourceStatus, SchedulerError,
    SqlitePersistence,
};

/// Test helper bundling an engine with its mock renderer.
struct TestHarness {
    engine: RenderEngine,
    renderer: Arc<MockRenderer>,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_config(fixtures::fast_config())
    }

    fn with_config(config: Config) -> Self {
        let renderer = Arc::new(MockRenderer::new());
        let engine = RenderEngine::new(config, renderer.clone());
        Self { engine, renderer }
    }

    fn submit(&self, spec: JobSpec) -> String {
        self.engine.submit(spec).expect("Failed to submit job")
    }

    /// Poll until the job reaches `expected`. Gives up early on a different terminal state.
    async fn wait_for_state(&self, job_id: &str, expected: JobState, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        let poll_interval = Duration::from_millis(10);

        while start.elapsed() < timeout {
            if let Ok(job) = self.engine.get_job(job_id) {
                if job.state == expected {
                    return true;
                }
                if job.state.is_terminal() {
                    return false;
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
        false
    }

    async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.engine.wait_idle())
            .await
            .expect("Engine did not go idle");
    }
}

#[tokio::test]
async fn test_job_completes_with_result() {
    let harness = TestHarness::new();
    harness.engine.start();

    let id = harness.submit(fixtures::typing_job("hello world"));
    assert!(
        harness
            .wait_for_state(&id, JobState::Completed, Duration::from_secs(5))
            .await
    );

    let job = harness.engine.get_job(&id).unwrap();
    assert_eq!(job.progress, 100.0);
    assert_eq!(job.result_ref, Some(format!("mock://{}", id)));
    assert_eq!(job.attempt_count, 0);
    assert!(job.eta.is_none());
    assert!(job.started_at.is_some());
    assert!(job.finished_at.is_some());

    let status = harness.engine.status();
    assert_eq!(status.pool.total_processed, 1);
    assert_eq!(status.estimator.total_samples, 1);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_follows_priority_then_submission_order() {
    let mut config = fixtures::fast_config();
    config.scheduler.max_concurrent_jobs = 1;
    config.worker.workers = 1;
    let harness = TestHarness::with_config(config);

    let low = harness.submit(fixtures::matrix_job(15).with_priority("low"));
    let first_normal = harness.submit(fixtures::matrix_job(15));
    let urgent = harness.submit(fixtures::matrix_job(15).with_priority("urgent"));
    let second_normal = harness.submit(fixtures::matrix_job(15).with_priority("normal"));

    harness.engine.start();
    harness.wait_idle().await;

    let order: Vec<String> = harness
        .renderer
        .recorded_renders()
        .await
        .into_iter()
        .map(|r| r.request.job_id)
        .collect();
    assert_eq!(order, vec![urgent, first_normal, second_normal, low]);
    assert_eq!(harness.renderer.max_concurrent(), 1);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_global_cap_is_never_exceeded() {
    let mut config = fixtures::fast_config();
    config.scheduler.max_concurrent_jobs = 2;
    config.worker.workers = 5;
    let harness = TestHarness::with_config(config);
    harness.renderer.set_duration(Duration::from_millis(40)).await;

    for _ in 0..8 {
        harness.submit(fixtures::matrix_job(15));
    }
    harness.engine.start();
    harness.wait_idle().await;

    assert_eq!(harness.renderer.render_count().await, 8);
    assert!(harness.renderer.max_concurrent() <= 2);
    assert_eq!(harness.engine.status().jobs.get(&JobState::Completed), Some(&8));

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let harness = TestHarness::new();
    harness
        .renderer
        .fail_next(RenderError::Network {
            reason: "connection reset by peer".to_string(),
        })
        .await;
    harness.engine.start();

    let id = harness.submit(fixtures::matrix_job(15));
    assert!(
        harness
            .wait_for_state(&id, JobState::Completed, Duration::from_secs(5))
            .await
    );

    let job = harness.engine.get_job(&id).unwrap();
    assert_eq!(job.attempt_count, 1);
    let error = job.error.expect("last error kept after recovery");
    assert_eq!(error.category, ErrorCategory::Network);
    assert!(error.retriable);

    let renders = harness.renderer.recorded_renders().await;
    assert_eq!(renders.len(), 2);
    assert!(!renders[0].success);
    assert_eq!(renders[1].request.attempt, 1);

    let status = harness.engine.status();
    assert_eq!(status.pool.total_retried, 1);
    assert_eq!(status.errors.total, 1);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_validation_failure_is_terminal() {
    let harness = TestHarness::new();
    harness
        .renderer
        .fail_next(RenderError::invalid_parameters("unsupported font"))
        .await;
    harness.engine.start();

    let id = harness.submit(fixtures::typing_job("hi"));
    assert!(
        harness
            .wait_for_state(&id, JobState::Failed, Duration::from_secs(5))
            .await
    );

    let job = harness.engine.get_job(&id).unwrap();
    let error = job.error.expect("failure recorded");
    assert_eq!(error.category, ErrorCategory::Validation);
    assert!(!error.retriable);
    assert_eq!(job.attempt_count, 0);
    assert_eq!(harness.renderer.render_count().await, 1);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_retries_exhausted_marks_failed() {
    let mut config = fixtures::fast_config();
    config.worker.max_retries = 2;
    let harness = TestHarness::with_config(config);
    for _ in 0..3 {
        harness
            .renderer
            .fail_next(RenderError::ResourceExhausted {
                reason: "no space left on device".to_string(),
            })
            .await;
    }
    harness.engine.start();

    let id = harness.submit(fixtures::matrix_job(15));
    assert!(
        harness
            .wait_for_state(&id, JobState::Failed, Duration::from_secs(5))
            .await
    );

    let job = harness.engine.get_job(&id).unwrap();
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.error.unwrap().category, ErrorCategory::Resource);
    assert_eq!(harness.renderer.render_count().await, 3);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_renderer_panic_fails_job_and_keeps_worker() {
    let mut config = fixtures::fast_config();
    config.worker.workers = 1;
    config.worker.max_retries = 1;
    let harness = TestHarness::with_config(config);
    harness.renderer.panic_next(2);
    harness.engine.start();

    let doomed = harness.submit(fixtures::matrix_job(15));
    assert!(
        harness
            .wait_for_state(&doomed, JobState::Failed, Duration::from_secs(5))
            .await
    );
    let job = harness.engine.get_job(&doomed).unwrap();
    assert_eq!(job.attempt_count, 1);
    let error = job.error.expect("panic recorded");
    assert!(error.message.contains("renderer panicked"));

    // The only worker is still serving the queue.
    let next = harness.submit(fixtures::matrix_job(15));
    assert!(
        harness
            .wait_for_state(&next, JobState::Completed, Duration::from_secs(5))
            .await
    );
    assert_eq!(harness.engine.status().pool.total_failed, 1);

    harness.engine.shutdown().await;
}

fn host(cpu_percent: f32) -> ResourceSnapshot {
    ResourceSnapshot {
        cpu_percent,
        memory_percent: 20.0,
        disk_percent: Some(20.0),
    }
}

#[tokio::test]
async fn test_critical_pressure_holds_work_until_relieved() {
    let harness = TestHarness::new();
    let queued = harness.submit(fixtures::matrix_job(15));

    let resources = harness.engine.resources();
    resources.observe(host(97.0));
    assert_eq!(
        harness.engine.submit(fixtures::matrix_job(15).with_priority("urgent")),
        Err(SchedulerError::ResourcePressure {
            status: ResourceStatus::Critical
        })
    );

    harness.engine.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(harness.renderer.render_count().await, 0);
    assert_eq!(harness.engine.get_job(&queued).unwrap().state, JobState::Queued);
    let status = harness.engine.status();
    assert_eq!(status.scheduler.effective_concurrency, 0);
    assert_eq!(status.resources.unwrap().cpu_percent, 97.0);

    // High still admits normal work but not low.
    resources.observe(host(88.0));
    assert!(matches!(
        harness.engine.submit(fixtures::matrix_job(15).with_priority("low")),
        Err(SchedulerError::ResourcePressure { .. })
    ));
    let normal = harness.submit(fixtures::matrix_job(15));

    resources.observe(host(10.0));
    harness.wait_idle().await;
    assert_eq!(harness.engine.get_job(&queued).unwrap().state, JobState::Completed);
    assert_eq!(harness.engine.get_job(&normal).unwrap().state, JobState::Completed);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_queued_job_never_renders() {
    let harness = TestHarness::new();
    let id = harness.submit(fixtures::matrix_job(15));

    assert_eq!(harness.engine.cancel_job(&id).unwrap(), CancelOutcome::Cancelled);
    harness.engine.start();
    harness.wait_idle().await;

    assert_eq!(harness.engine.get_job(&id).unwrap().state, JobState::Cancelled);
    assert_eq!(harness.renderer.render_count().await, 0);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_job() {
    let harness = TestHarness::new();
    harness.renderer.set_duration(Duration::from_secs(10)).await;
    harness.engine.start();

    let id = harness.submit(fixtures::matrix_job(15));
    assert!(
        harness
            .wait_for_state(&id, JobState::Running, Duration::from_secs(2))
            .await
    );

    assert_eq!(harness.engine.cancel_job(&id).unwrap(), CancelOutcome::Requested);
    assert!(
        harness
            .wait_for_state(&id, JobState::Cancelled, Duration::from_secs(2))
            .await
    );
    assert!(harness.engine.get_job(&id).unwrap().result_ref.is_none());

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_progress_is_visible_while_running() {
    let harness = TestHarness::new();
    harness.renderer.set_duration(Duration::from_millis(400)).await;
    harness.renderer.set_steps(4).await;
    harness.engine.start();

    let id = harness.submit(fixtures::matrix_job(15));
    let mut seen = 0.0_f32;
    for _ in 0..100 {
        let job = harness.engine.get_job(&id).unwrap();
        if job.state == JobState::Running && job.progress > 0.0 && job.progress < 100.0 {
            seen = job.progress;
            assert!(job.eta.is_some());
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen > 0.0);

    harness.wait_idle().await;
    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_stuck_jobs() {
    let mut config = fixtures::fast_config();
    config.worker.shutdown_timeout_secs = 0;
    let harness = TestHarness::with_config(config);
    harness.renderer.set_duration(Duration::from_secs(30)).await;
    harness.renderer.set_ignore_cancel(true).await;
    harness.engine.start();

    let id = harness.submit(fixtures::matrix_job(15));
    assert!(
        harness
            .wait_for_state(&id, JobState::Running, Duration::from_secs(2))
            .await
    );

    tokio::time::timeout(Duration::from_secs(5), harness.engine.shutdown())
        .await
        .expect("shutdown did not finish");
    assert_eq!(harness.engine.get_job(&id).unwrap().state, JobState::Cancelled);
    assert!(harness.engine.submit(fixtures::matrix_job(15)).is_err());
}

#[tokio::test]
async fn test_queued_jobs_survive_restart() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = dir.path().join("framequeue.db");

    let id = {
        let store: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::new(&db_path).expect("Failed to open database"));
        let (handle, writer) = create_persistence_system(store.clone(), 64);
        let writer_task = tokio::spawn(writer.run());
        let engine = RenderEngine::with_persistence(
            fixtures::fast_config(),
            Arc::new(MockRenderer::new()),
            store,
            handle,
        );
        let id = engine.submit(fixtures::typing_job("persist me")).unwrap();
        drop(engine);
        writer_task.await.unwrap();
        id
    };

    let store: Arc<dyn Persistence> =
        Arc::new(SqlitePersistence::new(&db_path).expect("Failed to reopen database"));
    let (handle, writer) = create_persistence_system(store.clone(), 64);
    let writer_task = tokio::spawn(writer.run());
    let renderer = Arc::new(MockRenderer::new());
    let engine = RenderEngine::with_persistence(
        fixtures::fast_config(),
        renderer.clone(),
        store.clone(),
        handle,
    );

    let report = engine.recover().unwrap();
    assert_eq!(report.jobs, 1);
    assert_eq!(report.interrupted, 0);
    assert_eq!(engine.get_job(&id).unwrap().state, JobState::Queued);

    engine.start();
    tokio::time::timeout(Duration::from_secs(5), engine.wait_idle())
        .await
        .unwrap();
    assert_eq!(engine.get_job(&id).unwrap().state, JobState::Completed);
    assert_eq!(renderer.render_count().await, 1);

    engine.shutdown().await;
    drop(engine);
    writer_task.await.unwrap();

    let saved = store.load_job(&id).unwrap().unwrap();
    assert_eq!(saved.state, JobState::Completed);
    assert_eq!(
        store
            .list_jobs(&JobFilter::new().with_state(JobState::Queued))
            .unwrap()
            .len(),
        0
    );
}
