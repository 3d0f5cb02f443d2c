use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobSpec, Priority};

/// Children admitted at once when a batch does not say otherwise.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 2;

/// What happens to the rest of a batch when a child fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Cancel every unfinished child and fail the batch.
    FailFast,
    /// Let the other children finish.
    #[default]
    BestEffort,
}

/// Whether the batch is currently letting children into the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionState {
    /// Created, not yet started.
    #[default]
    Pending,
    Admitting,
    Paused,
}

/// Aggregate state, always derived from the children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group of jobs. Membership is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: Priority,
    pub concurrency_limit: usize,
    /// Children in submission order.
    pub job_ids: Vec<String>,
    pub fail_policy: FailPolicy,
    pub admission: AdmissionState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Request to create a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Lowercase priority name; `normal` when absent.
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
    #[serde(default)]
    pub fail_policy: FailPolicy,
    pub jobs: Vec<JobSpec>,
}

impl BatchSpec {
    pub fn new(name: impl Into<String>, jobs: Vec<JobSpec>) -> Self {
        Self {
            name: name.into(),
            description: None,
            priority: None,
            concurrency_limit: None,
            fail_policy: FailPolicy::default(),
            jobs,
        }
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn with_fail_policy(mut self, policy: FailPolicy) -> Self {
        self.fail_policy = policy;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Children per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchCounts {
    pub fn unfinished(&self) -> usize {
        self.queued + self.running
    }
}

/// Remaining time for the whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchEta {
    pub seconds: f64,
    /// Mean confidence of the unfinished children.
    pub confidence: f64,
}

/// Read-only snapshot returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchView {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub concurrency_limit: usize,
    pub fail_policy: FailPolicy,
    pub state: BatchState,
    /// Mean child progress in [0, 100].
    pub progress: f32,
    pub counts: BatchCounts,
    pub eta: Option<BatchEta>,
    pub job_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}
