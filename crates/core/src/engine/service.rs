use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{EngineStatus, RecoveryReport};
use crate::batch::{AdmissionState, BatchOrchestrator, BatchSpec, BatchState, BatchView};
use crate::config::Config;
use crate::error::SchedulerError;
use crate::estimator::{Estimate, Estimator, ShapeSignature};
use crate::job::{Job, JobFilter, JobSpec, JobState, JobStore, JobView, Priority, RenderKind, RenderParameters};
use crate::persistence::{Persistence, PersistenceError, PersistenceHandle};
use crate::recovery::{ErrorContext, RecoveryStrategist};
use crate::renderer::{RenderError, Renderer};
use crate::resources::ResourceMonitor;
use crate::scheduler::{CancelOutcome, Scheduler};
use crate::worker::{WorkerContext, WorkerPool};

/// Extra time given to workers after the cancel grace period before they are aborted.
const ABORT_MARGIN: Duration = Duration::from_secs(1);

/// Owns every component and exposes the job and batch API.
pub struct RenderEngine {
    config: Config,
    store: Arc<JobStore>,
    scheduler: Arc<Scheduler>,
    pool: WorkerPool,
    batches: Arc<BatchOrchestrator>,
    estimator: Arc<Estimator>,
    strategist: Arc<RecoveryStrategist>,
    resources: Arc<ResourceMonitor>,
    persistence: Option<Arc<dyn Persistence>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl RenderEngine {
    /// An engine without a persistence mirror.
    pub fn new(config: Config, renderer: Arc<dyn Renderer>) -> Self {
        Self::build(config, renderer, None)
    }

    /// An engine mirroring every job and batch change through `mirror`, and
    /// able to [`recover`](Self::recover) from `persistence`.
    pub fn with_persistence(
        config: Config,
        renderer: Arc<dyn Renderer>,
        persistence: Arc<dyn Persistence>,
        mirror: PersistenceHandle,
    ) -> Self {
        Self::build(config, renderer, Some((persistence, mirror)))
    }

    fn build(
        config: Config,
        renderer: Arc<dyn Renderer>,
        persistence: Option<(Arc<dyn Persistence>, PersistenceHandle)>,
    ) -> Self {
        let (persistence, mirror) = match persistence {
            Some((store, handle)) => (Some(store), Some(handle)),
            None => (None, None),
        };

        let store = match mirror.clone() {
            Some(handle) => JobStore::new().with_mirror(handle),
            None => JobStore::new(),
        };
        let store = Arc::new(store);
        let resources = Arc::new(ResourceMonitor::new(config.resources.clone()));
        let scheduler = Arc::new(
            Scheduler::new(config.scheduler.clone(), store.clone())
                .with_resource_monitor(resources.clone()),
        );
        let estimator = Arc::new(Estimator::new(config.estimator.clone()));
        let strategist = Arc::new(RecoveryStrategist::new(&config.retry));

        let batches = BatchOrchestrator::new(scheduler.clone(), estimator.clone());
        let batches = Arc::new(match mirror {
            Some(handle) => batches.with_mirror(handle),
            None => batches,
        });

        let pool = WorkerPool::new(WorkerContext::new(
            config.worker.clone(),
            scheduler.clone(),
            renderer,
            estimator.clone(),
            strategist.clone(),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            store,
            scheduler,
            pool,
            batches,
            estimator,
            strategist,
            resources,
            persistence,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn workers and background tasks.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Render engine already started");
            return;
        }
        info!(
            workers = self.config.worker.workers,
            max_concurrent_jobs = self.config.scheduler.max_concurrent_jobs,
            "Starting render engine"
        );
        let listener = self
            .batches
            .spawn_event_listener(self.shutdown_tx.subscribe());
        self.lock_tasks().push(listener);

        if self.config.resources.enabled {
            let disk_path = self
                .config
                .resources
                .disk_path
                .clone()
                .unwrap_or_else(|| self.config.renderer.output_dir.clone());
            let sampler = self.resources.spawn(disk_path, self.shutdown_tx.subscribe());
            self.lock_tasks().push(sampler);
        }
        self.pool.start();
    }

    /// Stop admitting work, wait for running jobs, then cancel whatever is
    /// still running once the shutdown timeout expires.
    pub async fn shutdown(&self) {
        info!("Shutting down render engine");
        self.scheduler.close();

        if self.started.load(Ordering::SeqCst) {
            let timeout = self.config.worker.shutdown_timeout();
            if !self.pool.join(timeout).await {
                let cancelled = self.cancel_running();
                warn!(
                    cancelled,
                    timeout_secs = timeout.as_secs(),
                    "Shutdown timeout reached, cancelled running jobs"
                );
                let grace = self.config.worker.cancel_grace() + ABORT_MARGIN;
                if !self.pool.join(grace).await {
                    self.pool.abort();
                }
            }
        }

        let _ = self.shutdown_tx.send(());
        let tasks = std::mem::take(&mut *self.lock_tasks());
        join_all(tasks).await;
        info!("Render engine stopped");
    }

    /// Raise the cancel flag of every job actively rendering.
    fn cancel_running(&self) -> usize {
        self.store
            .list(&JobFilter::new().with_state(JobState::Running))
            .into_iter()
            .filter(|job| !job.is_backing_off())
            .filter_map(|job| self.store.cancel_flag(&job.id).ok())
            .filter(|flag| flag.cancel())
            .count()
    }

    /// Resolves once no job is Queued or Running. Children of batches that
    /// were never started count as Queued.
    pub async fn wait_idle(&self) {
        let mut events = self.store.subscribe();
        loop {
            if self.store.active_count() == 0 {
                return;
            }
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }
        }
    }

    /// Restore state from persistence: batches with all their children, then
    /// unfinished standalone jobs. Jobs found Running were interrupted and go
    /// back to the queue as a new attempt.
    pub fn recover(&self) -> Result<RecoveryReport, PersistenceError> {
        let Some(persistence) = self.persistence.clone() else {
            debug!("No persistence configured, nothing to recover");
            return Ok(RecoveryReport::default());
        };
        let mut report = RecoveryReport::default();

        for batch in persistence.list_batches()? {
            let enqueue = batch.admission != AdmissionState::Pending;
            let children = persistence.list_jobs(&JobFilter::new().with_batch(&batch.id))?;
            self.batches.restore(batch);
            for job in children {
                self.restore_job(job, enqueue, &mut report);
            }
            report.batches += 1;
        }

        for state in [JobState::Queued, JobState::Running] {
            for job in persistence.list_jobs(&JobFilter::new().with_state(state))? {
                if job.batch_id.is_none() && !self.store.contains(&job.id) {
                    self.restore_job(job, true, &mut report);
                }
            }
        }

        info!(
            batches = report.batches,
            jobs = report.jobs,
            interrupted = report.interrupted,
            failed = report.failed,
            "Recovered state from persistence"
        );
        Ok(report)
    }

    fn restore_job(&self, mut job: Job, enqueue: bool, report: &mut RecoveryReport) {
        if job.state == JobState::Running {
            report.interrupted += 1;
            self.settle_interrupted(&mut job);
            if job.state == JobState::Failed {
                report.failed += 1;
            }
        }
        let queued = job.state == JobState::Queued;
        let job_id = job.id.clone();
        self.store.insert(job);
        report.jobs += 1;

        if queued && enqueue {
            if let Err(e) = self.scheduler.enqueue(&job_id) {
                warn!(job_id = %job_id, "Could not re-queue recovered job: {}", e);
            }
        }
    }

    /// The interrupted attempt counts as a failure: it goes back to the
    /// queue as the next attempt while the retry budget allows, else it fails.
    fn settle_interrupted(&self, job: &mut Job) {
        let err = RenderError::failed("render interrupted before it finished");
        let context = ErrorContext::new("recover")
            .for_job(&job.id, job.kind)
            .with_attempt_count(job.attempt_count);
        let record = self
            .strategist
            .analyze(&err, &context, self.config.worker.max_retries);

        job.progress = 0.0;
        job.next_attempt_at = None;
        if record.retriable {
            job.state = JobState::Queued;
            job.attempt_count += 1;
        } else {
            warn!(
                job_id = %job.id,
                attempt = job.attempt_count,
                "Interrupted job has no retries left, marking failed"
            );
            job.state = JobState::Failed;
            job.finished_at = Some(Utc::now());
        }
        job.last_error = Some(record);
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Validate and queue a job. `priority` must be one of the five lowercase names.
    pub fn submit_job(
        &self,
        kind: &str,
        parameters: Value,
        priority: &str,
    ) -> Result<String, SchedulerError> {
        self.submit(JobSpec::new(kind, parameters).with_priority(priority))
    }

    /// Queue a job described by `spec`; a missing priority means `normal`.
    pub fn submit(&self, spec: JobSpec) -> Result<String, SchedulerError> {
        let (kind, parameters, priority) = spec.resolve(Priority::default())?;
        self.scheduler.submit(Job::new(kind, parameters, priority))
    }

    pub fn get_job(&self, job_id: &str) -> Result<JobView, SchedulerError> {
        let job = self.store.get(job_id)?;
        let eta = self.estimator.remaining(&job);
        Ok(JobView::new(job, eta))
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<CancelOutcome, SchedulerError> {
        self.scheduler.cancel(job_id)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<JobView> {
        self.store
            .list(filter)
            .into_iter()
            .map(|job| {
                let eta = self.estimator.remaining(&job);
                JobView::new(job, eta)
            })
            .collect()
    }

    // =========================================================================
    // Batches
    // =========================================================================

    pub fn create_batch(&self, spec: BatchSpec) -> Result<String, SchedulerError> {
        self.batches.create_batch(spec)
    }

    pub fn start_batch(&self, batch_id: &str) -> Result<(), SchedulerError> {
        self.batches.start(batch_id)
    }

    pub fn pause_batch(&self, batch_id: &str) -> Result<(), SchedulerError> {
        self.batches.pause(batch_id)
    }

    pub fn resume_batch(&self, batch_id: &str) -> Result<(), SchedulerError> {
        self.batches.resume(batch_id)
    }

    pub fn cancel_batch(&self, batch_id: &str) -> Result<usize, SchedulerError> {
        self.batches.cancel(batch_id)
    }

    pub fn get_batch(&self, batch_id: &str) -> Result<BatchView, SchedulerError> {
        self.batches.get_batch(batch_id)
    }

    pub fn list_batches(&self, state: Option<BatchState>) -> Vec<BatchView> {
        self.batches.list_batches(state)
    }

    pub fn delete_batch(&self, batch_id: &str) -> Result<(), SchedulerError> {
        self.batches.delete_batch(batch_id).map(|_| ())
    }

    // =========================================================================
    // Estimates & status
    // =========================================================================

    pub fn get_estimate(&self, shape: &ShapeSignature) -> Estimate {
        self.estimator.estimate(shape)
    }

    /// Estimate a job that has not been submitted.
    pub fn estimate_for(&self, kind: &str, parameters: Value) -> Result<Estimate, SchedulerError> {
        let kind: RenderKind = kind.parse()?;
        let parameters = RenderParameters::parse(kind, parameters)?;
        Ok(self.estimator.estimate_for(kind, &parameters))
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            scheduler: self.scheduler.status(),
            pool: self.pool.status(),
            jobs: self.store.counts(),
            batches: self.batches.len(),
            estimator: self.estimator.statistics(),
            errors: self.strategist.statistics(),
            resources: self.resources.last_snapshot(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn estimator(&self) -> &Arc<Estimator> {
        &self.estimator
    }

    pub fn strategist(&self) -> &Arc<RecoveryStrategist> {
        &self.strategist
    }

    pub fn resources(&self) -> &Arc<ResourceMonitor> {
        &self.resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryPersistence, PersistenceCommand};
    use crate::testing::MockRenderer;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn engine() -> RenderEngine {
        RenderEngine::new(Config::default(), Arc::new(MockRenderer::new()))
    }

    #[test]
    fn test_submit_job_validates_at_boundary() {
        let engine = engine();
        assert_eq!(
            engine.submit_job("typing", json!({}), "URGENT"),
            Err(SchedulerError::InvalidPriority("URGENT".to_string()))
        );
        assert_eq!(
            engine.submit_job("hologram", json!({}), "normal"),
            Err(SchedulerError::UnknownKind("hologram".to_string()))
        );
        assert!(matches!(
            engine.submit_job("matrix", json!({ "duration_secs": 9999 }), "normal"),
            Err(SchedulerError::InvalidParameters(_))
        ));

        let id = engine
            .submit_job("typing", json!({ "custom_text": "hello" }), "high")
            .unwrap();
        let view = engine.get_job(&id).unwrap();
        assert_eq!(view.state, JobState::Queued);
        assert_eq!(view.priority, Priority::High);
        assert!(view.eta.is_some());
    }

    #[test]
    fn test_estimate_for_unsubmitted_job() {
        let engine = engine();
        let estimate = engine
            .estimate_for("matrix", json!({ "duration_secs": 20 }))
            .unwrap();
        assert!(estimate.seconds > 20.0);
        assert_eq!(estimate.sample_count, 0);
    }

    #[tokio::test]
    async fn test_recover_requeues_interrupted_jobs() {
        let persistence = Arc::new(MemoryPersistence::new());
        let mut interrupted = Job::new(
            RenderKind::Matrix,
            RenderParameters::defaults(RenderKind::Matrix),
            Priority::Normal,
        );
        interrupted.state = JobState::Running;
        interrupted.progress = 60.0;
        let mut done = interrupted.clone();
        done.id = "done".to_string();
        done.state = JobState::Completed;
        persistence.save_job(&interrupted).unwrap();
        persistence.save_job(&done).unwrap();

        let (tx, _rx) = mpsc::channel::<PersistenceCommand>(64);
        let engine = RenderEngine::with_persistence(
            Config::default(),
            Arc::new(MockRenderer::new()),
            persistence,
            PersistenceHandle::new(tx),
        );
        let report = engine.recover().unwrap();

        assert_eq!(report.jobs, 1);
        assert_eq!(report.interrupted, 1);
        assert_eq!(report.failed, 0);
        let job = engine.store().get(&interrupted.id).unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.progress, 0.0);
        assert!(engine.scheduler().is_queued(&interrupted.id));
        assert!(!engine.store().contains("done"));
    }

    #[tokio::test]
    async fn test_recover_fails_interrupted_job_without_retries_left() {
        let persistence = Arc::new(MemoryPersistence::new());
        let mut exhausted = Job::new(
            RenderKind::Typing,
            RenderParameters::defaults(RenderKind::Typing),
            Priority::Normal,
        );
        exhausted.state = JobState::Running;
        exhausted.attempt_count = 3;
        persistence.save_job(&exhausted).unwrap();

        let (tx, _rx) = mpsc::channel::<PersistenceCommand>(64);
        let mut config = Config::default();
        config.worker.max_retries = 3;
        let engine = RenderEngine::with_persistence(
            config,
            Arc::new(MockRenderer::new()),
            persistence,
            PersistenceHandle::new(tx),
        );
        let report = engine.recover().unwrap();

        assert_eq!(report.interrupted, 1);
        assert_eq!(report.failed, 1);
        let job = engine.store().get(&exhausted.id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempt_count, 3);
        assert!(job.finished_at.is_some());
        let record = job.last_error.unwrap();
        assert!(!record.retriable);
        assert!(record.message.contains("interrupted"));
        assert!(!engine.scheduler().is_queued(&exhausted.id));
        assert_eq!(engine.store().active_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let engine = engine();
        engine.start();
        engine.shutdown().await;
        assert_eq!(
            engine.submit_job("typing", json!({}), "normal"),
            Err(SchedulerError::ShuttingDown)
        );
    }
}
