use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::permits::{AdmissionPermit, BatchGate};
use super::queue::PriorityQueue;
use crate::config::{ResourcesConfig, SchedulerConfig};
use crate::error::SchedulerError;
use crate::job::{CancelFlag, Job, JobState, JobStore, Priority};
use crate::metrics;
use crate::resources::{ResourceMonitor, ResourceStatus};

/// A job handed to a worker together with the permits it runs under.
#[derive(Debug)]
pub struct Dispatch {
    /// Snapshot taken at dequeue time, still Queued.
    pub job: Job,
    pub permit: AdmissionPermit,
    pub cancel: CancelFlag,
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was Queued and is now Cancelled.
    Cancelled,
    /// The job is Running; its worker has been signalled.
    Requested,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchGateStatus {
    pub batch_id: String,
    pub limit: usize,
    pub running: usize,
    pub admitting: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub accepting: bool,
    pub queue_depth: usize,
    pub depth_by_priority: BTreeMap<Priority, usize>,
    pub max_concurrent_jobs: usize,
    /// `max_concurrent_jobs` scaled down for resource pressure.
    pub effective_concurrency: usize,
    pub resource_status: ResourceStatus,
    pub running: usize,
    pub batches: Vec<BatchGateStatus>,
}

/// Orders Queued jobs and decides which one may run next.
///
/// Lock order is queue, then batch gates, then the job store.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<JobStore>,
    queue: Mutex<PriorityQueue>,
    global: Arc<Semaphore>,
    gates: Mutex<HashMap<String, BatchGate>>,
    wake: Arc<Notify>,
    closed: AtomicBool,
    resources: Arc<ResourceMonitor>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: Arc<JobStore>) -> Self {
        let global = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Self {
            config,
            store,
            queue: Mutex::new(PriorityQueue::new()),
            global,
            gates: Mutex::new(HashMap::new()),
            wake: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
            resources: Arc::new(ResourceMonitor::new(ResourcesConfig::default())),
        }
    }

    /// Throttle admission by `monitor` instead of a monitor that stays Healthy.
    pub fn with_resource_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.resources = monitor;
        self
    }

    pub fn resources(&self) -> &Arc<ResourceMonitor> {
        &self.resources
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lock_queue(&self) -> MutexGuard<'_, PriorityQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_gates(&self) -> MutexGuard<'_, HashMap<String, BatchGate>> {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.wake.notify_waiters();
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Register a new Queued job and make it eligible for dispatch.
    pub fn submit(&self, job: Job) -> Result<String, SchedulerError> {
        if self.is_closed() {
            return Err(SchedulerError::ShuttingDown);
        }
        if job.state != JobState::Queued {
            return Err(SchedulerError::InvalidTransition {
                job_id: job.id,
                from: job.state,
                to: JobState::Queued,
            });
        }
        self.resources.check_admission(job.priority)?;

        let job_id = job.id.clone();
        {
            let mut queue = self.lock_queue();
            if queue.len() >= self.config.max_queue_size {
                return Err(SchedulerError::QueueFull {
                    capacity: self.config.max_queue_size,
                });
            }
            queue.push(
                job.id.clone(),
                job.batch_id.clone(),
                job.effective_priority,
                job.promoted,
                Instant::now(),
            );
            metrics::QUEUE_DEPTH.set(queue.len() as i64);
            metrics::JOBS_SUBMITTED
                .with_label_values(&[job.kind.as_str()])
                .inc();
            info!(job_id = %job_id, kind = %job.kind, priority = %job.priority, "Job queued");
            self.store.insert(job);
        }
        self.notify();
        Ok(job_id)
    }

    /// Fails with `QueueFull` unless `additional` more jobs fit.
    pub fn ensure_capacity(&self, additional: usize) -> Result<(), SchedulerError> {
        let queued = self.lock_queue().len();
        if queued + additional > self.config.max_queue_size {
            return Err(SchedulerError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }
        Ok(())
    }

    /// Put an already registered Queued job (a batch child) into the queue.
    pub fn enqueue(&self, job_id: &str) -> Result<(), SchedulerError> {
        {
            let mut queue = self.lock_queue();
            let job = self.store.get(job_id)?;
            if job.state != JobState::Queued {
                return Err(SchedulerError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: job.state,
                    to: JobState::Queued,
                });
            }
            if queue.contains(job_id) {
                return Ok(());
            }
            queue.push(
                job.id,
                job.batch_id,
                job.effective_priority,
                job.promoted,
                Instant::now(),
            );
            metrics::QUEUE_DEPTH.set(queue.len() as i64);
        }
        self.notify();
        Ok(())
    }

    /// `Running -> Queued` for a retry, putting the job back at the end of its bucket.
    pub fn requeue(&self, job_id: &str) -> Result<Job, SchedulerError> {
        let job = {
            let mut queue = self.lock_queue();
            let job = self
                .store
                .transition(job_id, JobState::Running, JobState::Queued)?;
            queue.push(
                job.id.clone(),
                job.batch_id.clone(),
                job.effective_priority,
                job.promoted,
                Instant::now(),
            );
            metrics::QUEUE_DEPTH.set(queue.len() as i64);
            job
        };
        info!(job_id = %job_id, attempt = job.attempt_count, "Job re-queued for retry");
        self.notify();
        Ok(job)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Wait until a job is admissible and return it with its permits.
    /// Returns `None` once the scheduler is closed.
    pub async fn dequeue_next(&self) -> Option<Dispatch> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(dispatch) = self.try_dequeue() {
                return Some(dispatch);
            }

            tokio::select! {
                _ = &mut notified => {}
                // Re-check periodically so starved jobs get promoted and
                // eased resource pressure is picked up.
                _ = tokio::time::sleep(self.config.promotion_interval()) => {}
            }
        }
    }

    /// Non-blocking variant of [`dequeue_next`](Self::dequeue_next).
    pub fn try_dequeue(&self) -> Option<Dispatch> {
        if self.is_closed() {
            return None;
        }
        let mut queue = self.lock_queue();
        self.promote_starved(&mut queue);

        let capacity = self
            .resources
            .effective_capacity(self.config.max_concurrent_jobs);
        if self.running_count() >= capacity {
            return None;
        }

        loop {
            // Global first, then batch.
            let global = self.global.clone().try_acquire_owned().ok()?;
            let gates = self.lock_gates();
            let (entry, batch_permit) = queue.pop_first_with(|entry| match &entry.batch_id {
                None => Some(None),
                Some(batch_id) => gates
                    .get(batch_id)
                    .and_then(BatchGate::try_acquire)
                    .map(Some),
            })?;
            drop(gates);
            metrics::QUEUE_DEPTH.set(queue.len() as i64);

            let job = match self.store.get(&entry.job_id) {
                Ok(job) if job.state == JobState::Queued => job,
                _ => {
                    // Cancelled or removed while waiting.
                    debug!(job_id = %entry.job_id, "Dropping stale queue entry");
                    continue;
                }
            };
            let cancel = match self.store.cancel_flag(&job.id) {
                Ok(cancel) => cancel,
                Err(_) => continue,
            };

            debug!(
                job_id = %job.id,
                priority = %entry.priority,
                batch_id = entry.batch_id.as_deref().unwrap_or("-"),
                "Job admitted"
            );
            return Some(Dispatch {
                job,
                permit: AdmissionPermit::new(global, batch_permit, self.wake.clone()),
                cancel,
            });
        }
    }

    fn promote_starved(&self, queue: &mut PriorityQueue) {
        let promotions = queue.promote_starved(Instant::now(), self.config.max_wait());
        for promotion in promotions {
            info!(
                job_id = %promotion.job_id,
                from = %promotion.from,
                to = %promotion.to,
                "Promoted starved job"
            );
            metrics::PROMOTIONS.inc();
            let to = promotion.to;
            if let Err(e) = self.store.annotate(&promotion.job_id, |job| {
                job.effective_priority = to;
                job.promoted = true;
            }) {
                warn!(job_id = %promotion.job_id, "Failed to record promotion: {}", e);
            }
        }
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Queued jobs go straight to Cancelled; Running jobs get their cancel flag raised.
    pub fn cancel(&self, job_id: &str) -> Result<CancelOutcome, SchedulerError> {
        let job = self.store.get(job_id)?;
        match job.state {
            JobState::Queued => {
                let result = {
                    let mut queue = self.lock_queue();
                    queue.remove(job_id);
                    metrics::QUEUE_DEPTH.set(queue.len() as i64);
                    self.store
                        .transition(job_id, JobState::Queued, JobState::Cancelled)
                };
                match result {
                    Ok(_) => {
                        info!(job_id = %job_id, "Cancelled queued job");
                        Ok(CancelOutcome::Cancelled)
                    }
                    // A worker took it first.
                    Err(SchedulerError::InvalidTransition {
                        from: JobState::Running,
                        ..
                    }) => self.signal_cancel(job_id),
                    Err(e) => Err(e),
                }
            }
            JobState::Running => self.signal_cancel(job_id),
            state => Err(SchedulerError::InvalidTransition {
                job_id: job_id.to_string(),
                from: state,
                to: JobState::Cancelled,
            }),
        }
    }

    fn signal_cancel(&self, job_id: &str) -> Result<CancelOutcome, SchedulerError> {
        let flag = self.store.cancel_flag(job_id)?;
        if flag.cancel() {
            info!(job_id = %job_id, "Cancellation requested for running job");
        }
        Ok(CancelOutcome::Requested)
    }

    // =========================================================================
    // Batch gates
    // =========================================================================

    pub fn register_batch(&self, batch_id: &str, limit: usize, admitting: bool) {
        self.lock_gates()
            .insert(batch_id.to_string(), BatchGate::new(limit, admitting));
        if admitting {
            self.notify();
        }
    }

    pub fn set_batch_admitting(
        &self,
        batch_id: &str,
        admitting: bool,
    ) -> Result<(), SchedulerError> {
        {
            let mut gates = self.lock_gates();
            let gate = gates
                .get_mut(batch_id)
                .ok_or_else(|| SchedulerError::BatchNotFound(batch_id.to_string()))?;
            gate.set_admitting(admitting);
        }
        if admitting {
            self.notify();
        }
        Ok(())
    }

    /// Forget a batch gate and any of its entries still queued.
    pub fn remove_batch(&self, batch_id: &str) {
        let mut queue = self.lock_queue();
        queue.remove_batch(batch_id);
        metrics::QUEUE_DEPTH.set(queue.len() as i64);
        self.lock_gates().remove(batch_id);
    }

    pub fn batch_running(&self, batch_id: &str) -> Option<usize> {
        self.lock_gates().get(batch_id).map(BatchGate::running)
    }

    // =========================================================================
    // Lifecycle & status
    // =========================================================================

    /// Refuse new submissions and release every waiting worker.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Scheduler closed to new work");
        }
        self.notify();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Jobs currently holding a global permit.
    pub fn running_count(&self) -> usize {
        self.config.max_concurrent_jobs - self.global.available_permits()
    }

    pub fn queue_depth(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn is_queued(&self, job_id: &str) -> bool {
        self.lock_queue().contains(job_id)
    }

    pub fn status(&self) -> SchedulerStatus {
        let (queue_depth, depth_by_priority) = {
            let queue = self.lock_queue();
            let depth = Priority::ALL
                .into_iter()
                .map(|p| (p, queue.depth(p)))
                .collect();
            (queue.len(), depth)
        };
        let mut batches: Vec<BatchGateStatus> = self
            .lock_gates()
            .iter()
            .map(|(batch_id, gate)| BatchGateStatus {
                batch_id: batch_id.clone(),
                limit: gate.limit(),
                running: gate.running(),
                admitting: gate.is_admitting(),
            })
            .collect();
        batches.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));

        SchedulerStatus {
            accepting: !self.is_closed(),
            queue_depth,
            depth_by_priority,
            max_concurrent_jobs: self.config.max_concurrent_jobs,
            effective_concurrency: self
                .resources
                .effective_capacity(self.config.max_concurrent_jobs),
            resource_status: self.resources.status(),
            running: self.running_count(),
            batches,
        }
    }
}
