use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::params::{RenderKind, RenderParameters};
use crate::error::SchedulerError;
use crate::estimator::Estimate;
use crate::recovery::ErrorRecord;

// =============================================================================
// Priority
// =============================================================================

/// Scheduling priority, highest first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl Priority {
    /// All priorities in dequeue order.
    pub const ALL: [Priority; 5] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Bucket index, 0 is served first.
    pub fn rank(&self) -> usize {
        *self as usize
    }

    /// One level up. Urgent stays urgent.
    pub fn promoted(&self) -> Priority {
        match self {
            Priority::Urgent | Priority::High => Priority::Urgent,
            Priority::Normal => Priority::High,
            Priority::Low => Priority::Normal,
            Priority::Background => Priority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Background => "background",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = SchedulerError;

    /// Only the exact lowercase names are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| SchedulerError::InvalidPriority(s.to_string()))
    }
}

// =============================================================================
// State machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// The six legal edges of the lifecycle.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Queued)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

// =============================================================================
// Job
// =============================================================================

/// One unit of render work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: RenderKind,
    /// Priority requested at submission.
    pub priority: Priority,
    /// Priority the queue currently files the job under.
    pub effective_priority: Priority,
    /// Set once the starvation sweep has promoted this job.
    pub promoted: bool,
    pub parameters: RenderParameters,
    pub state: JobState,
    /// Percent complete in [0, 100].
    pub progress: f32,
    pub created_at: DateTime<Utc>,
    /// Start of the current (or last) attempt.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: Option<ErrorRecord>,
    pub result_ref: Option<String>,
    pub batch_id: Option<String>,
    /// Set while a failed attempt waits out its backoff delay.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(kind: RenderKind, parameters: RenderParameters, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            priority,
            effective_priority: priority,
            promoted: false,
            parameters,
            state: JobState::Queued,
            progress: 0.0,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            attempt_count: 0,
            last_error: None,
            result_ref: None,
            batch_id: None,
            next_attempt_at: None,
        }
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    /// Whether the job is waiting out a retry delay.
    pub fn is_backing_off(&self) -> bool {
        self.state == JobState::Running && self.next_attempt_at.is_some()
    }
}

/// Unvalidated job description as received from a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub kind: String,
    #[serde(default)]
    pub parameters: Value,
    /// Inherits the batch priority (or `normal`) when absent.
    #[serde(default)]
    pub priority: Option<String>,
}

impl JobSpec {
    pub fn new(kind: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: kind.into(),
            parameters,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    /// Validate into its typed parts.
    pub fn resolve(
        self,
        default_priority: Priority,
    ) -> Result<(RenderKind, RenderParameters, Priority), SchedulerError> {
        let kind: RenderKind = self.kind.parse()?;
        let priority = match self.priority {
            Some(p) => p.parse()?,
            None => default_priority,
        };
        let params = RenderParameters::parse(kind, self.parameters)?;
        Ok((kind, params, priority))
    }
}

/// Caller-facing snapshot of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
    pub kind: RenderKind,
    pub priority: Priority,
    pub state: JobState,
    pub progress: f32,
    /// Remaining time; absent once the job is terminal.
    pub eta: Option<Estimate>,
    pub error: Option<ErrorRecord>,
    pub attempt_count: u32,
    pub result_ref: Option<String>,
    pub batch_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl JobView {
    pub fn new(job: Job, eta: Option<Estimate>) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            priority: job.effective_priority,
            state: job.state,
            progress: job.progress,
            eta,
            error: job.last_error,
            attempt_count: job.attempt_count,
            result_ref: job.result_ref,
            batch_id: job.batch_id,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            next_attempt_at: job.next_attempt_at,
        }
    }
}
