use tokio::sync::mpsc;

use crate::batch::Batch;
use crate::job::Job;

/// A write queued for the persistence writer.
#[derive(Debug, Clone)]
pub enum PersistenceCommand {
    SaveJob(Box<Job>),
    SaveBatch(Box<Batch>),
    DeleteBatch(String),
}

/// Handle for mirroring changes to persistence.
///
/// This is cheaply cloneable and never blocks: when the channel is full or
/// closed the write is dropped and logged.
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<PersistenceCommand>,
}

impl PersistenceHandle {
    pub fn new(tx: mpsc::Sender<PersistenceCommand>) -> Self {
        Self { tx }
    }

    pub fn save_job(&self, job: &Job) -> bool {
        self.try_send(PersistenceCommand::SaveJob(Box::new(job.clone())))
    }

    pub fn save_batch(&self, batch: &Batch) -> bool {
        self.try_send(PersistenceCommand::SaveBatch(Box::new(batch.clone())))
    }

    pub fn delete_batch(&self, batch_id: &str) -> bool {
        self.try_send(PersistenceCommand::DeleteBatch(batch_id.to_string()))
    }

    fn try_send(&self, command: PersistenceCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to queue persistence write: {}", e);
                false
            }
        }
    }
}
