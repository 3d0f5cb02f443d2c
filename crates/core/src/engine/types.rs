use std::collections::HashMap;

use serde::Serialize;

use crate::estimator::EstimatorStatistics;
use crate::job::JobState;
use crate::recovery::ErrorStatistics;
use crate::resources::ResourceSnapshot;
use crate::scheduler::SchedulerStatus;
use crate::worker::PoolStatus;

/// Snapshot of every component.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub scheduler: SchedulerStatus,
    pub pool: PoolStatus,
    pub jobs: HashMap<JobState, usize>,
    pub batches: usize,
    pub estimator: EstimatorStatistics,
    pub errors: ErrorStatistics,
    /// Latest host sample; None until the monitor has run.
    pub resources: Option<ResourceSnapshot>,
}

/// What [`RenderEngine::recover`](super::RenderEngine::recover) restored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub batches: usize,
    pub jobs: usize,
    /// Jobs found Running when the previous process stopped.
    pub interrupted: usize,
    /// Interrupted jobs that had no retries left and were marked Failed.
    pub failed: usize,
}
