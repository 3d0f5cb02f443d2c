use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::aggregate::{aggregate_progress, child_counts, derive_state};
use super::types::{
    AdmissionState, Batch, BatchEta, BatchSpec, BatchState, BatchView, FailPolicy,
    DEFAULT_CONCURRENCY_LIMIT,
};
use crate::error::SchedulerError;
use crate::estimator::Estimator;
use crate::job::{Job, JobEvent, JobState, Priority};
use crate::metrics;
use crate::persistence::PersistenceHandle;
use crate::scheduler::Scheduler;

/// Creates batches, gates their children through the scheduler and
/// aggregates their state.
pub struct BatchOrchestrator {
    scheduler: Arc<Scheduler>,
    estimator: Arc<Estimator>,
    batches: RwLock<HashMap<String, Batch>>,
    mirror: Option<PersistenceHandle>,
}

impl BatchOrchestrator {
    pub fn new(scheduler: Arc<Scheduler>, estimator: Arc<Estimator>) -> Self {
        Self {
            scheduler,
            estimator,
            batches: RwLock::new(HashMap::new()),
            mirror: None,
        }
    }

    /// Mirror batch changes to persistence (write-behind).
    pub fn with_mirror(mut self, mirror: PersistenceHandle) -> Self {
        self.mirror = Some(mirror);
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Batch>> {
        self.batches.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Batch>> {
        self.batches.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn mirror(&self, batch: &Batch) {
        if let Some(ref mirror) = self.mirror {
            mirror.save_batch(batch);
        }
    }

    fn batch(&self, batch_id: &str) -> Result<Batch, SchedulerError> {
        self.read()
            .get(batch_id)
            .cloned()
            .ok_or_else(|| SchedulerError::BatchNotFound(batch_id.to_string()))
    }

    /// Move admission from `expected` to `next`, or fail with `InvalidBatch`.
    fn set_admission(
        &self,
        batch_id: &str,
        expected: AdmissionState,
        next: AdmissionState,
    ) -> Result<Batch, SchedulerError> {
        let snapshot = {
            let mut batches = self.write();
            let batch = batches
                .get_mut(batch_id)
                .ok_or_else(|| SchedulerError::BatchNotFound(batch_id.to_string()))?;
            if batch.admission != expected {
                return Err(SchedulerError::InvalidBatch(format!(
                    "batch {} is {:?}, expected {:?}",
                    batch_id, batch.admission, expected
                )));
            }
            batch.admission = next;
            if next == AdmissionState::Admitting && batch.started_at.is_none() {
                batch.started_at = Some(Utc::now());
            }
            batch.clone()
        };
        self.mirror(&snapshot);
        Ok(snapshot)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Validate every child, then register the batch with its children
    /// Queued but not yet admitted to the scheduler.
    pub fn create_batch(&self, spec: BatchSpec) -> Result<String, SchedulerError> {
        if self.scheduler.is_closed() {
            return Err(SchedulerError::ShuttingDown);
        }
        if spec.jobs.is_empty() {
            return Err(SchedulerError::InvalidBatch(format!(
                "batch {:?} has no jobs",
                spec.name
            )));
        }
        let priority = match spec.priority.as_deref() {
            Some(p) => p.parse::<Priority>()?,
            None => Priority::default(),
        };
        self.scheduler.resources().check_admission(priority)?;

        let requested = spec.concurrency_limit.unwrap_or(DEFAULT_CONCURRENCY_LIMIT);
        if requested == 0 {
            return Err(SchedulerError::InvalidBatch(
                "concurrency_limit must be at least 1".to_string(),
            ));
        }
        let cap = self.scheduler.config().max_concurrent_jobs;
        let concurrency_limit = if requested > cap {
            warn!(
                requested,
                cap, "Batch concurrency limit above global cap, clamping"
            );
            cap
        } else {
            requested
        };

        let resolved = spec
            .jobs
            .into_iter()
            .map(|job| job.resolve(priority))
            .collect::<Result<Vec<_>, _>>()?;
        self.scheduler.ensure_capacity(resolved.len())?;

        let batch_id = uuid::Uuid::new_v4().to_string();
        let children: Vec<Job> = resolved
            .into_iter()
            .map(|(kind, params, priority)| Job::new(kind, params, priority).with_batch(&batch_id))
            .collect();
        let batch = Batch {
            id: batch_id.clone(),
            name: spec.name,
            description: spec.description,
            priority,
            concurrency_limit,
            job_ids: children.iter().map(|job| job.id.clone()).collect(),
            fail_policy: spec.fail_policy,
            admission: AdmissionState::Pending,
            created_at: Utc::now(),
            started_at: None,
        };

        self.scheduler
            .register_batch(&batch_id, concurrency_limit, false);
        self.write().insert(batch_id.clone(), batch.clone());
        self.mirror(&batch);

        let store = self.scheduler.store();
        for child in children {
            metrics::JOBS_SUBMITTED
                .with_label_values(&[child.kind.as_str()])
                .inc();
            store.insert(child);
        }

        info!(
            batch_id = %batch_id,
            name = %batch.name,
            jobs = batch.job_ids.len(),
            concurrency_limit,
            fail_policy = ?batch.fail_policy,
            "Batch created"
        );
        Ok(batch_id)
    }

    /// Start admitting children, up to the batch limit at a time.
    pub fn start(&self, batch_id: &str) -> Result<(), SchedulerError> {
        let batch = self.set_admission(batch_id, AdmissionState::Pending, AdmissionState::Admitting)?;
        self.scheduler.set_batch_admitting(batch_id, true)?;

        let mut admitted = 0;
        for job_id in &batch.job_ids {
            match self.scheduler.enqueue(job_id) {
                Ok(()) => admitted += 1,
                // Cancelled before the batch started.
                Err(SchedulerError::InvalidTransition { .. }) => {}
                Err(e) => warn!(batch_id = %batch_id, job_id = %job_id, "Could not admit child: {}", e),
            }
        }
        info!(batch_id = %batch_id, admitted, "Batch started");
        Ok(())
    }

    /// Stop admitting new children. Running children finish normally.
    pub fn pause(&self, batch_id: &str) -> Result<(), SchedulerError> {
        self.set_admission(batch_id, AdmissionState::Admitting, AdmissionState::Paused)?;
        self.scheduler.set_batch_admitting(batch_id, false)?;
        info!(batch_id = %batch_id, "Batch paused");
        Ok(())
    }

    pub fn resume(&self, batch_id: &str) -> Result<(), SchedulerError> {
        self.set_admission(batch_id, AdmissionState::Paused, AdmissionState::Admitting)?;
        self.scheduler.set_batch_admitting(batch_id, true)?;
        info!(batch_id = %batch_id, "Batch resumed");
        Ok(())
    }

    /// Cancel every unfinished child. Returns how many were cancelled or signalled.
    pub fn cancel(&self, batch_id: &str) -> Result<usize, SchedulerError> {
        let batch = self.batch(batch_id)?;
        self.scheduler.set_batch_admitting(batch_id, false)?;
        let cancelled = self.cancel_children(&batch);
        info!(batch_id = %batch_id, cancelled, "Batch cancelled");
        Ok(cancelled)
    }

    fn cancel_children(&self, batch: &Batch) -> usize {
        let mut cancelled = 0;
        for job_id in &batch.job_ids {
            match self.scheduler.cancel(job_id) {
                Ok(_) => cancelled += 1,
                // Already terminal or deleted.
                Err(SchedulerError::InvalidTransition { .. } | SchedulerError::JobNotFound(_)) => {}
                Err(e) => warn!(batch_id = %batch.id, job_id = %job_id, "Could not cancel child: {}", e),
            }
        }
        cancelled
    }

    pub fn get_batch(&self, batch_id: &str) -> Result<BatchView, SchedulerError> {
        let batch = self.batch(batch_id)?;
        Ok(self.view(batch))
    }

    pub fn state(&self, batch_id: &str) -> Result<BatchState, SchedulerError> {
        self.get_batch(batch_id).map(|view| view.state)
    }

    /// All batches, oldest first, optionally only those in `state`.
    pub fn list_batches(&self, state: Option<BatchState>) -> Vec<BatchView> {
        let mut batches: Vec<Batch> = self.read().values().cloned().collect();
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        batches
            .into_iter()
            .map(|batch| self.view(batch))
            .filter(|view| match state {
                Some(s) => view.state == s,
                None => true,
            })
            .collect()
    }

    /// Remove a finished batch and its children.
    pub fn delete_batch(&self, batch_id: &str) -> Result<Batch, SchedulerError> {
        let view = self.get_batch(batch_id)?;
        if !view.state.is_terminal() {
            return Err(SchedulerError::BatchNotTerminal(batch_id.to_string()));
        }
        let batch = self
            .write()
            .remove(batch_id)
            .ok_or_else(|| SchedulerError::BatchNotFound(batch_id.to_string()))?;
        self.scheduler.remove_batch(batch_id);

        let store = self.scheduler.store();
        for job_id in &batch.job_ids {
            if let Err(e) = store.remove(job_id) {
                debug!(job_id = %job_id, "Child already gone: {}", e);
            }
        }
        if let Some(ref mirror) = self.mirror {
            mirror.delete_batch(batch_id);
        }
        info!(batch_id = %batch_id, state = %view.state, "Batch deleted");
        Ok(batch)
    }

    /// Re-register a batch loaded from persistence. Children must already be in the store.
    pub fn restore(&self, batch: Batch) {
        let admitting = batch.admission == AdmissionState::Admitting;
        self.scheduler
            .register_batch(&batch.id, batch.concurrency_limit, admitting);
        debug!(batch_id = %batch.id, admission = ?batch.admission, "Batch restored");
        self.write().insert(batch.id.clone(), batch);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn view(&self, batch: Batch) -> BatchView {
        let store = self.scheduler.store();
        let children: Vec<Job> = batch
            .job_ids
            .iter()
            .filter_map(|id| store.get(id).ok())
            .collect();
        let counts = child_counts(&children);
        let state = derive_state(&batch, &counts);
        let progress = aggregate_progress(&children);
        let eta = self.eta(&batch, &children);

        BatchView {
            id: batch.id,
            name: batch.name,
            description: batch.description,
            priority: batch.priority,
            concurrency_limit: batch.concurrency_limit,
            fail_policy: batch.fail_policy,
            state,
            progress,
            counts,
            eta,
            job_ids: batch.job_ids,
            created_at: batch.created_at,
            started_at: batch.started_at,
        }
    }

    /// Sum of child remaining estimates divided by the parallelism the batch can use.
    fn eta(&self, batch: &Batch, children: &[Job]) -> Option<BatchEta> {
        let estimates: Vec<_> = children
            .iter()
            .filter_map(|job| self.estimator.remaining(job))
            .collect();
        if estimates.is_empty() {
            return None;
        }
        let parallelism = batch.concurrency_limit.min(estimates.len()).max(1);
        let total: f64 = estimates.iter().map(|e| e.seconds).sum();
        let confidence =
            estimates.iter().map(|e| e.confidence).sum::<f64>() / estimates.len() as f64;
        Some(BatchEta {
            seconds: total / parallelism as f64,
            confidence,
        })
    }

    // =========================================================================
    // Fail-fast
    // =========================================================================

    /// React to a job event. A failed child of a `fail_fast` batch cancels its siblings.
    pub fn handle_event(&self, event: &JobEvent) {
        if let JobEvent::Transitioned {
            batch_id: Some(batch_id),
            to: JobState::Failed,
            ..
        } = event
        {
            self.apply_fail_fast(batch_id);
        }
    }

    fn apply_fail_fast(&self, batch_id: &str) {
        let Ok(batch) = self.batch(batch_id) else {
            return;
        };
        if batch.fail_policy != FailPolicy::FailFast {
            return;
        }
        let store = self.scheduler.store();
        let failed = batch
            .job_ids
            .iter()
            .any(|id| store.get(id).is_ok_and(|job| job.state == JobState::Failed));
        if !failed {
            return;
        }
        if let Err(e) = self.scheduler.set_batch_admitting(batch_id, false) {
            debug!(batch_id = %batch_id, "Gate already gone: {}", e);
        }
        let cancelled = self.cancel_children(&batch);
        if cancelled > 0 {
            warn!(batch_id = %batch_id, cancelled, "Child failed, cancelling rest of fail-fast batch");
        }
    }

    /// Re-check every fail-fast batch, used after missing events.
    fn sweep_fail_fast(&self) {
        let ids: Vec<String> = self
            .read()
            .values()
            .filter(|b| b.fail_policy == FailPolicy::FailFast)
            .map(|b| b.id.clone())
            .collect();
        for id in ids {
            self.apply_fail_fast(&id);
        }
    }

    /// Spawn the background task applying fail-fast cancellation.
    pub fn spawn_event_listener(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut events = self.scheduler.store().subscribe();

        tokio::spawn(async move {
            debug!("Batch event listener started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = events.recv() => match event {
                        Ok(event) => orchestrator.handle_event(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Batch event listener lagged, rescanning");
                            orchestrator.sweep_fail_fast();
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!("Batch event listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EstimatorConfig, SchedulerConfig};
    use crate::job::{JobSpec, JobStore};
    use serde_json::json;

    fn orchestrator(capacity: usize) -> BatchOrchestrator {
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig {
                max_concurrent_jobs: capacity,
                ..SchedulerConfig::default()
            },
            Arc::new(JobStore::new()),
        ));
        BatchOrchestrator::new(
            scheduler,
            Arc::new(Estimator::new(EstimatorConfig::default())),
        )
    }

    fn specs(n: usize) -> Vec<JobSpec> {
        (0..n)
            .map(|_| JobSpec::new("matrix", json!({ "duration_secs": 10 })))
            .collect()
    }

    /// Dequeue and mark Running, as a worker would.
    fn run_next(orchestrator: &BatchOrchestrator) -> Option<crate::scheduler::Dispatch> {
        let dispatch = orchestrator.scheduler.try_dequeue()?;
        orchestrator
            .scheduler
            .store()
            .transition(&dispatch.job.id, JobState::Queued, JobState::Running)
            .unwrap();
        Some(dispatch)
    }

    #[test]
    fn test_children_wait_for_start() {
        let orchestrator = orchestrator(4);
        let id = orchestrator
            .create_batch(BatchSpec::new("b", specs(3)).with_concurrency_limit(2))
            .unwrap();

        assert_eq!(orchestrator.state(&id).unwrap(), BatchState::Pending);
        assert!(orchestrator.scheduler.try_dequeue().is_none());

        orchestrator.start(&id).unwrap();
        let _a = run_next(&orchestrator).unwrap();
        let _b = run_next(&orchestrator).unwrap();
        // Batch limit of 2 reached, global cap of 4 is not.
        assert!(run_next(&orchestrator).is_none());
        assert_eq!(orchestrator.state(&id).unwrap(), BatchState::Running);

        let view = orchestrator.get_batch(&id).unwrap();
        assert_eq!(view.counts.running, 2);
        assert_eq!(view.counts.queued, 1);
        assert!(view.eta.is_some());
    }

    #[test]
    fn test_children_inherit_batch_priority() {
        let orchestrator = orchestrator(2);
        let mut jobs = specs(1);
        jobs.push(JobSpec::new("typing", json!(null)).with_priority("low"));
        let id = orchestrator
            .create_batch(BatchSpec::new("b", jobs).with_priority("high"))
            .unwrap();

        let view = orchestrator.get_batch(&id).unwrap();
        let store = orchestrator.scheduler.store();
        assert_eq!(store.get(&view.job_ids[0]).unwrap().priority, Priority::High);
        assert_eq!(store.get(&view.job_ids[1]).unwrap().priority, Priority::Low);
    }

    #[test]
    fn test_invalid_batches_rejected() {
        let orchestrator = orchestrator(2);
        assert!(matches!(
            orchestrator.create_batch(BatchSpec::new("empty", Vec::new())),
            Err(SchedulerError::InvalidBatch(_))
        ));
        assert!(matches!(
            orchestrator.create_batch(BatchSpec::new("zero", specs(1)).with_concurrency_limit(0)),
            Err(SchedulerError::InvalidBatch(_))
        ));
        assert_eq!(
            orchestrator.create_batch(BatchSpec::new("p", specs(1)).with_priority("asap")),
            Err(SchedulerError::InvalidPriority("asap".to_string()))
        );

        // One bad child rejects the whole batch.
        let mut jobs = specs(2);
        jobs.push(JobSpec::new("fireworks", json!({})));
        assert_eq!(
            orchestrator.create_batch(BatchSpec::new("bad", jobs)),
            Err(SchedulerError::UnknownKind("fireworks".to_string()))
        );
        assert!(orchestrator.is_empty());
        assert_eq!(orchestrator.scheduler.store().list(&Default::default()).len(), 0);
    }

    #[test]
    fn test_low_priority_batch_refused_under_high_pressure() {
        use crate::config::ResourcesConfig;
        use crate::resources::{ResourceMonitor, ResourceSnapshot, ResourceStatus};

        let monitor = Arc::new(ResourceMonitor::new(ResourcesConfig::default()));
        let scheduler = Arc::new(
            Scheduler::new(SchedulerConfig::default(), Arc::new(JobStore::new()))
                .with_resource_monitor(monitor.clone()),
        );
        let orchestrator = BatchOrchestrator::new(
            scheduler,
            Arc::new(Estimator::new(EstimatorConfig::default())),
        );
        monitor.observe(ResourceSnapshot {
            cpu_percent: 10.0,
            memory_percent: 90.0,
            disk_percent: None,
        });

        assert_eq!(
            orchestrator.create_batch(BatchSpec::new("later", specs(2)).with_priority("low")),
            Err(SchedulerError::ResourcePressure {
                status: ResourceStatus::High
            })
        );
        assert!(orchestrator.is_empty());
        assert!(orchestrator
            .create_batch(BatchSpec::new("now", specs(2)).with_priority("high"))
            .is_ok());
    }

    #[test]
    fn test_limit_clamped_to_global_cap() {
        let orchestrator = orchestrator(2);
        let id = orchestrator
            .create_batch(BatchSpec::new("b", specs(1)).with_concurrency_limit(10))
            .unwrap();
        assert_eq!(orchestrator.get_batch(&id).unwrap().concurrency_limit, 2);
    }

    #[test]
    fn test_pause_and_resume() {
        let orchestrator = orchestrator(4);
        let id = orchestrator
            .create_batch(BatchSpec::new("b", specs(3)).with_concurrency_limit(1))
            .unwrap();
        assert!(matches!(orchestrator.pause(&id), Err(SchedulerError::InvalidBatch(_))));

        orchestrator.start(&id).unwrap();
        let running = run_next(&orchestrator).unwrap();
        orchestrator.pause(&id).unwrap();
        assert_eq!(orchestrator.state(&id).unwrap(), BatchState::Paused);

        // Running child finishes; nothing new is admitted.
        orchestrator
            .scheduler
            .store()
            .transition(&running.job.id, JobState::Running, JobState::Completed)
            .unwrap();
        drop(running);
        assert!(orchestrator.scheduler.try_dequeue().is_none());

        orchestrator.resume(&id).unwrap();
        assert!(run_next(&orchestrator).is_some());
        assert_eq!(orchestrator.state(&id).unwrap(), BatchState::Running);
    }

    #[test]
    fn test_cancel_batch() {
        let orchestrator = orchestrator(4);
        let id = orchestrator
            .create_batch(BatchSpec::new("b", specs(3)).with_concurrency_limit(1))
            .unwrap();
        orchestrator.start(&id).unwrap();
        let running = run_next(&orchestrator).unwrap();

        assert_eq!(orchestrator.cancel(&id).unwrap(), 3);
        assert!(running.cancel.is_cancelled());

        // The worker acknowledges the cancel.
        orchestrator
            .scheduler
            .store()
            .transition(&running.job.id, JobState::Running, JobState::Cancelled)
            .unwrap();
        assert_eq!(orchestrator.state(&id).unwrap(), BatchState::Cancelled);
    }

    #[test]
    fn test_fail_fast_cancels_siblings() {
        let orchestrator = orchestrator(4);
        let id = orchestrator
            .create_batch(
                BatchSpec::new("b", specs(3))
                    .with_concurrency_limit(1)
                    .with_fail_policy(FailPolicy::FailFast),
            )
            .unwrap();
        orchestrator.start(&id).unwrap();
        let running = run_next(&orchestrator).unwrap();

        let mut events = orchestrator.scheduler.store().subscribe();
        orchestrator
            .scheduler
            .store()
            .transition(&running.job.id, JobState::Running, JobState::Failed)
            .unwrap();
        let event = events.try_recv().unwrap();
        orchestrator.handle_event(&event);

        let view = orchestrator.get_batch(&id).unwrap();
        assert_eq!(view.state, BatchState::Failed);
        assert_eq!(view.counts.failed, 1);
        assert_eq!(view.counts.cancelled, 2);
    }

    #[test]
    fn test_best_effort_keeps_going() {
        let orchestrator = orchestrator(4);
        let id = orchestrator
            .create_batch(BatchSpec::new("b", specs(2)).with_concurrency_limit(1))
            .unwrap();
        orchestrator.start(&id).unwrap();
        let store = orchestrator.scheduler.store().clone();

        let first = run_next(&orchestrator).unwrap();
        store
            .transition(&first.job.id, JobState::Running, JobState::Failed)
            .unwrap();
        drop(first);
        assert_eq!(orchestrator.state(&id).unwrap(), BatchState::Running);

        let second = run_next(&orchestrator).unwrap();
        store
            .transition(&second.job.id, JobState::Running, JobState::Completed)
            .unwrap();
        let view = orchestrator.get_batch(&id).unwrap();
        assert_eq!(view.state, BatchState::Failed);
        assert_eq!(view.counts.completed, 1);
    }

    #[test]
    fn test_delete_requires_terminal() {
        let orchestrator = orchestrator(2);
        let id = orchestrator
            .create_batch(BatchSpec::new("b", specs(2)))
            .unwrap();
        assert_eq!(
            orchestrator.delete_batch(&id),
            Err(SchedulerError::BatchNotTerminal(id.clone()))
        );

        orchestrator.cancel(&id).unwrap();
        let batch = orchestrator.delete_batch(&id).unwrap();
        assert_eq!(batch.job_ids.len(), 2);
        assert!(!orchestrator.scheduler.store().contains(&batch.job_ids[0]));
        assert_eq!(
            orchestrator.get_batch(&id).unwrap_err(),
            SchedulerError::BatchNotFound(id)
        );
    }

    #[test]
    fn test_list_batches_filters_by_state() {
        let orchestrator = orchestrator(2);
        let a = orchestrator.create_batch(BatchSpec::new("a", specs(1))).unwrap();
        let b = orchestrator.create_batch(BatchSpec::new("b", specs(1))).unwrap();
        orchestrator.cancel(&b).unwrap();

        assert_eq!(orchestrator.list_batches(None).len(), 2);
        let pending = orchestrator.list_batches(Some(BatchState::Pending));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a);
    }
}
