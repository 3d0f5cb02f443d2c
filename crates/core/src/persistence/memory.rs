use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Persistence, PersistenceError};
use crate::batch::Batch;
use crate::job::{Job, JobFilter};

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<String, Job>,
    batches: HashMap<String, Batch>,
}

/// In-process persistence, for tests and for running without a database.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    tables: Mutex<Tables>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Persistence for MemoryPersistence {
    fn save_job(&self, job: &Job) -> Result<(), PersistenceError> {
        let mut tables = self.lock();
        let stale = tables
            .jobs
            .get(&job.id)
            .is_some_and(|existing| existing.updated_at > job.updated_at);
        if !stale {
            tables.jobs.insert(job.id.clone(), job.clone());
        }
        Ok(())
    }

    fn save_batch(&self, batch: &Batch) -> Result<(), PersistenceError> {
        self.lock().batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    fn load_job(&self, job_id: &str) -> Result<Option<Job>, PersistenceError> {
        Ok(self.lock().jobs.get(job_id).cloned())
    }

    fn load_batch(&self, batch_id: &str) -> Result<Option<Batch>, PersistenceError> {
        Ok(self.lock().batches.get(batch_id).cloned())
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, PersistenceError> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    fn list_batches(&self) -> Result<Vec<Batch>, PersistenceError> {
        let mut batches: Vec<Batch> = self.lock().batches.values().cloned().collect();
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(batches)
    }

    fn delete_batch(&self, batch_id: &str) -> Result<(), PersistenceError> {
        let mut tables = self.lock();
        tables.batches.remove(batch_id);
        tables
            .jobs
            .retain(|_, job| job.batch_id.as_deref() != Some(batch_id));
        Ok(())
    }
}
