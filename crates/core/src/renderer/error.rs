//! Error types for the renderer module.

use thiserror::Error;

/// Errors that can occur while producing an artifact.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The renderer rejected the parameters.
    #[error("Invalid render parameters: {reason}")]
    InvalidParameters { reason: String },

    /// The attempt exceeded its hard execution timeout.
    #[error("Render timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// The renderer acknowledged a cancel request.
    #[error("Render cancelled")]
    Cancelled,

    /// The render program could not be started.
    #[error("Failed to start renderer {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    /// The render program exited unsuccessfully.
    #[error("Renderer exited with status {code:?}: {stderr}")]
    ProcessFailed { code: Option<i32>, stderr: String },

    /// Machine resources ran out (memory, disk, handles).
    #[error("Resource exhausted: {reason}")]
    ResourceExhausted { reason: String },

    /// A remote dependency could not be reached.
    #[error("Network error: {reason}")]
    Network { reason: String },

    /// I/O error while rendering.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else the renderer reports.
    #[error("Render failed: {reason}")]
    Failed { reason: String },
}

/// Discriminant of [`RenderError`] used by classification rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderErrorKind {
    InvalidParameters,
    Timeout,
    Cancelled,
    Spawn,
    Process,
    Resource,
    Network,
    Io,
    Failed,
}

impl RenderError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn invalid_parameters(reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> RenderErrorKind {
        match self {
            Self::InvalidParameters { .. } => RenderErrorKind::InvalidParameters,
            Self::Timeout { .. } => RenderErrorKind::Timeout,
            Self::Cancelled => RenderErrorKind::Cancelled,
            Self::SpawnFailed { .. } => RenderErrorKind::Spawn,
            Self::ProcessFailed { .. } => RenderErrorKind::Process,
            Self::ResourceExhausted { .. } => RenderErrorKind::Resource,
            Self::Network { .. } => RenderErrorKind::Network,
            Self::Io(_) => RenderErrorKind::Io,
            Self::Failed { .. } => RenderErrorKind::Failed,
        }
    }

    /// The part of the error worth matching against message rules.
    /// For a failed process this is its stderr rather than the exit status line.
    pub fn detail(&self) -> String {
        match self {
            Self::ProcessFailed { stderr, .. } => stderr.clone(),
            Self::InvalidParameters { reason }
            | Self::ResourceExhausted { reason }
            | Self::Network { reason }
            | Self::Failed { reason } => reason.clone(),
            other => other.to_string(),
        }
    }
}
