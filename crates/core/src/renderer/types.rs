use serde::{Deserialize, Serialize};

use crate::job::{Job, RenderKind, RenderParameters};

/// What a renderer is asked to produce for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub job_id: String,
    pub kind: RenderKind,
    pub parameters: RenderParameters,
    /// Zero for the first attempt.
    pub attempt: u32,
}

impl RenderRequest {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            kind: job.kind,
            parameters: job.parameters.clone(),
            attempt: job.attempt_count,
        }
    }
}

/// A finished artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderOutput {
    /// Opaque reference to the artifact, usually a path.
    pub result_ref: String,
    pub size_bytes: Option<u64>,
}

impl RenderOutput {
    pub fn new(result_ref: impl Into<String>) -> Self {
        Self {
            result_ref: result_ref.into(),
            size_bytes: None,
        }
    }
}
