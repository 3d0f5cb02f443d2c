use thiserror::Error;

use crate::batch::Batch;
use crate::job::{Job, JobFilter};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Durable snapshots of jobs and batches.
pub trait Persistence: Send + Sync {
    /// Insert or replace. An older snapshot never overwrites a newer one.
    fn save_job(&self, job: &Job) -> Result<(), PersistenceError>;

    fn save_batch(&self, batch: &Batch) -> Result<(), PersistenceError>;

    fn load_job(&self, job_id: &str) -> Result<Option<Job>, PersistenceError>;

    fn load_batch(&self, batch_id: &str) -> Result<Option<Batch>, PersistenceError>;

    /// Jobs matching `filter`, oldest first.
    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, PersistenceError>;

    fn list_batches(&self) -> Result<Vec<Batch>, PersistenceError>;

    /// Remove a batch together with its child jobs.
    fn delete_batch(&self, batch_id: &str) -> Result<(), PersistenceError>;
}
