//! Two-level concurrency gate. The global permit is always taken before the
//! batch permit, and both are returned together when the admission drops.

use std::sync::Arc;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Secondary limit for one batch.
#[derive(Debug)]
pub struct BatchGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
    /// Paused or not yet started batches admit nothing.
    admitting: bool,
}

impl BatchGate {
    pub fn new(limit: usize, admitting: bool) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            admitting,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_admitting(&self) -> bool {
        self.admitting
    }

    pub fn set_admitting(&mut self, admitting: bool) {
        self.admitting = admitting;
    }

    /// Children currently holding a permit.
    pub fn running(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        if !self.admitting {
            return None;
        }
        self.semaphore.clone().try_acquire_owned().ok()
    }
}

/// Held by a worker for as long as its job runs.
///
/// Dropping it returns both permits exactly once and wakes waiting workers.
#[derive(Debug)]
pub struct AdmissionPermit {
    global: Option<OwnedSemaphorePermit>,
    batch: Option<OwnedSemaphorePermit>,
    wake: Arc<Notify>,
}

impl AdmissionPermit {
    pub(crate) fn new(
        global: OwnedSemaphorePermit,
        batch: Option<OwnedSemaphorePermit>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            global: Some(global),
            batch,
            wake,
        }
    }

    pub fn has_batch_permit(&self) -> bool {
        self.batch.is_some()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        // Release in reverse acquisition order, then wake.
        self.batch.take();
        self.global.take();
        self.wake.notify_waiters();
    }
}
