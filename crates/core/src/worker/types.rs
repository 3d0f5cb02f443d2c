use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::WorkerConfig;
use crate::estimator::Estimator;
use crate::recovery::RecoveryStrategist;
use crate::renderer::Renderer;
use crate::scheduler::Scheduler;

/// Everything a worker needs, cloned into each worker task.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub scheduler: Arc<Scheduler>,
    pub renderer: Arc<dyn Renderer>,
    pub estimator: Arc<Estimator>,
    pub strategist: Arc<RecoveryStrategist>,
    pub(crate) stats: Arc<PoolStats>,
}

impl WorkerContext {
    pub fn new(
        config: WorkerConfig,
        scheduler: Arc<Scheduler>,
        renderer: Arc<dyn Renderer>,
        estimator: Arc<Estimator>,
        strategist: Arc<RecoveryStrategist>,
    ) -> Self {
        Self {
            config,
            scheduler,
            renderer,
            estimator,
            strategist,
            stats: Arc::new(PoolStats::default()),
        }
    }
}

/// Status of the worker pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Whether worker tasks are running.
    pub running: bool,
    /// Configured number of workers.
    pub workers: usize,
    /// Renders in flight.
    pub active_jobs: usize,
    /// Jobs completed since startup.
    pub total_processed: u64,
    /// Jobs that ended Failed.
    pub total_failed: u64,
    /// Retries scheduled.
    pub total_retried: u64,
    /// Running jobs that ended Cancelled.
    pub total_cancelled: u64,
}

/// Tracks statistics for the pool.
#[derive(Debug, Default)]
pub(crate) struct PoolStats {
    pub active: AtomicU64,
    pub total_processed: AtomicU64,
    pub total_failed: AtomicU64,
    pub total_retried: AtomicU64,
    pub total_cancelled: AtomicU64,
}

impl PoolStats {
    pub fn to_status(&self, running: bool, workers: usize) -> PoolStatus {
        PoolStatus {
            running,
            workers,
            active_jobs: self.active.load(Ordering::Relaxed) as usize,
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_retried: self.total_retried.load(Ordering::Relaxed),
            total_cancelled: self.total_cancelled.load(Ordering::Relaxed),
        }
    }
}
