//! Errors returned synchronously by submit, cancel, transition and batch operations.

use thiserror::Error;

use crate::job::JobState;
use crate::resources::ResourceStatus;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("invalid priority: {0:?} (expected urgent, high, normal, low or background)")]
    InvalidPriority(String),

    #[error("cannot transition job {job_id} from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    #[error("unknown job kind: {0:?}")]
    UnknownKind(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("batch {0} still has unfinished jobs")]
    BatchNotTerminal(String),

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("rejected under {status} resource pressure")]
    ResourcePressure { status: ResourceStatus },
}
