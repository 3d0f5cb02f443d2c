use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::RenderKind;

/// Execution-time failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Validation,
    Resource,
    System,
    Renderer,
    FileIo,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::Network,
        ErrorCategory::Validation,
        ErrorCategory::Resource,
        ErrorCategory::System,
        ErrorCategory::Renderer,
        ErrorCategory::FileIo,
        ErrorCategory::Timeout,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Resource => "resource",
            ErrorCategory::System => "system",
            ErrorCategory::Renderer => "renderer",
            ErrorCategory::FileIo => "file_io",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Message suitable for showing to the person who submitted the job.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCategory::Network => {
                "A network dependency could not be reached. The job will be retried."
            }
            ErrorCategory::Validation => {
                "The job parameters were rejected. Correct them and submit again."
            }
            ErrorCategory::Resource => {
                "The machine ran short of resources. Try a shorter or lower quality render."
            }
            ErrorCategory::System => "The render host reported a system error. Try again later.",
            ErrorCategory::Renderer => "Encoding the video failed.",
            ErrorCategory::FileIo => {
                "A file could not be read or written. Check permissions and free disk space."
            }
            ErrorCategory::Timeout => {
                "The render took too long. Try again with a shorter duration."
            }
            ErrorCategory::Unknown => "An unexpected error occurred.",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    ReduceQuality,
    AlternativeMethod,
    Skip,
    Abort,
    ManualIntervention,
}

/// What to do about a failure, with how much to trust the advice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySuggestion {
    pub strategy: RecoveryStrategy,
    pub description: String,
    /// In [0, 1].
    pub confidence: f64,
    /// In [0, 1].
    pub estimated_success_rate: f64,
}

/// Where a failure happened.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Name of the failing operation, e.g. `render`.
    pub operation: String,
    pub job_id: Option<String>,
    pub kind: Option<RenderKind>,
    /// Retries already made before this failure.
    pub attempt_count: u32,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn for_job(mut self, job_id: impl Into<String>, kind: RenderKind) -> Self {
        self.job_id = Some(job_id.into());
        self.kind = Some(kind);
        self
    }

    pub fn with_attempt_count(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count;
        self
    }
}

/// Classified failure attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub message: String,
    pub user_message: String,
    /// Whether this failure is followed by another attempt.
    pub retriable: bool,
    pub suggestion: RecoverySuggestion,
    pub attempt_count: u32,
    pub occurred_at: DateTime<Utc>,
}
