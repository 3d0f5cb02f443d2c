//! Priority queue, starvation control and two-level admission.

mod admission;
mod permits;
mod queue;

pub use admission::{BatchGateStatus, CancelOutcome, Dispatch, Scheduler, SchedulerStatus};
pub use permits::{AdmissionPermit, BatchGate};
pub use queue::{PriorityQueue, Promotion, QueueEntry};
