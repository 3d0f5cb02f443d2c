//! Batches: named groups of jobs with a secondary concurrency limit and a
//! state derived from their children.

mod aggregate;
mod orchestrator;
mod types;

pub use aggregate::{aggregate_progress, child_counts, derive_state};
pub use orchestrator::BatchOrchestrator;
pub use types::{
    AdmissionState, Batch, BatchCounts, BatchEta, BatchSpec, BatchState, BatchView, FailPolicy,
    DEFAULT_CONCURRENCY_LIMIT,
};
