use std::sync::Arc;

use tokio::sync::mpsc;

use super::{Persistence, PersistenceCommand, PersistenceHandle};

/// Background task draining queued writes into a [`Persistence`] store.
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistenceCommand>,
    store: Arc<dyn Persistence>,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistenceCommand>, store: Arc<dyn Persistence>) -> Self {
        Self { rx, store }
    }

    /// Run the writer until every handle has been dropped.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        tracing::info!("Persistence writer started");

        while let Some(command) = self.rx.recv().await {
            let result = match &command {
                PersistenceCommand::SaveJob(job) => self.store.save_job(job),
                PersistenceCommand::SaveBatch(batch) => self.store.save_batch(batch),
                PersistenceCommand::DeleteBatch(batch_id) => self.store.delete_batch(batch_id),
            };
            if let Err(e) = result {
                tracing::error!("Failed to persist {}: {}", command_name(&command), e);
            }
        }

        tracing::info!("Persistence writer shutting down");
    }
}

fn command_name(command: &PersistenceCommand) -> String {
    match command {
        PersistenceCommand::SaveJob(job) => format!("job {}", job.id),
        PersistenceCommand::SaveBatch(batch) => format!("batch {}", batch.id),
        PersistenceCommand::DeleteBatch(batch_id) => format!("deletion of batch {}", batch_id),
    }
}

/// Create a complete persistence system
///
/// Returns:
/// - `PersistenceHandle` - give this to the job store and batch orchestrator
/// - `PersistenceWriter` - spawn this as a background task with `tokio::spawn(writer.run())`
pub fn create_persistence_system(
    store: Arc<dyn Persistence>,
    buffer_size: usize,
) -> (PersistenceHandle, PersistenceWriter) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let handle = PersistenceHandle::new(tx);
    let writer = PersistenceWriter::new(rx, store);
    (handle, writer)
}
