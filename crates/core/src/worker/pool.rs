use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::execute::process;
use super::types::{PoolStatus, WorkerContext};

/// Fixed set of worker tasks pulling from the scheduler.
///
/// Workers exit once the scheduler is closed and their current job is done.
pub struct WorkerPool {
    ctx: WorkerContext,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl WorkerPool {
    pub fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the configured number of workers.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Worker pool already running");
            return;
        }

        let workers = self.ctx.config.workers;
        info!(workers, renderer = self.ctx.renderer.name(), "Starting worker pool");
        let mut handles = self.lock_handles();
        for worker_id in 0..workers {
            let ctx = self.ctx.clone();
            handles.push(tokio::spawn(async move {
                Self::worker_loop(ctx, worker_id).await;
            }));
        }
    }

    async fn worker_loop(ctx: WorkerContext, worker_id: usize) {
        info!(worker = worker_id, "Worker started");
        while let Some(dispatch) = ctx.scheduler.dequeue_next().await {
            process(&ctx, worker_id, dispatch).await;
        }
        info!(worker = worker_id, "Worker stopped");
    }

    /// Wait up to `timeout` for every worker to exit. Returns false if some
    /// are still busy; they can be waited on again.
    pub async fn join(&self, timeout: Duration) -> bool {
        let mut handles = std::mem::take(&mut *self.lock_handles());
        let finished = tokio::time::timeout(timeout, join_all(handles.iter_mut()))
            .await
            .is_ok();
        if finished {
            self.running.store(false, Ordering::SeqCst);
            info!("Worker pool stopped");
        } else {
            self.lock_handles().extend(handles);
        }
        finished
    }

    /// Abort every worker task. In-flight renders are dropped.
    pub fn abort(&self) {
        let handles = std::mem::take(&mut *self.lock_handles());
        if !handles.is_empty() {
            warn!(workers = handles.len(), "Aborting worker tasks");
        }
        for handle in handles {
            handle.abort();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    pub fn status(&self) -> PoolStatus {
        self.ctx
            .stats
            .to_status(self.is_running(), self.ctx.config.workers)
    }
}
