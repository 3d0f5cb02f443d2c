//! Work manifest: the jobs and batches the daemon submits at startup.
//!
//! ```toml
//! [[jobs]]
//! kind = "typing"
//! priority = "high"
//! parameters = { custom_text = "hello", duration_secs = 30 }
//!
//! [[batches]]
//! name = "nightly"
//! concurrency_limit = 2
//! fail_policy = "fail_fast"
//!
//! [[batches.jobs]]
//! kind = "matrix"
//! parameters = { duration_secs = 20 }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use framequeue_core::{BatchSpec, JobSpec, RenderEngine};

#[derive(Debug, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub batches: Vec<ManifestBatch>,
}

#[derive(Debug, Deserialize)]
pub struct ManifestBatch {
    #[serde(flatten)]
    pub spec: BatchSpec,
    /// Start admitting children right after creation.
    #[serde(default = "default_start")]
    pub start: bool,
}

fn default_start() -> bool {
    true
}

/// What happened to the manifest entries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubmitSummary {
    pub jobs: usize,
    pub batches: usize,
    pub rejected: usize,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {:?}", path))?;
        Self::parse(&text).with_context(|| format!("Failed to parse manifest {:?}", path))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Submit every entry. Rejected entries are logged and skipped.
    pub fn submit(self, engine: &RenderEngine) -> SubmitSummary {
        let mut summary = SubmitSummary::default();

        for spec in self.jobs {
            let kind = spec.kind.clone();
            match engine.submit(spec) {
                Ok(job_id) => {
                    info!(job_id = %job_id, kind = %kind, "Submitted job from manifest");
                    summary.jobs += 1;
                }
                Err(e) => {
                    warn!(kind = %kind, "Manifest job rejected: {}", e);
                    summary.rejected += 1;
                }
            }
        }

        for batch in self.batches {
            let name = batch.spec.name.clone();
            let created = engine.create_batch(batch.spec).and_then(|batch_id| {
                if batch.start {
                    engine.start_batch(&batch_id)?;
                }
                Ok(batch_id)
            });
            match created {
                Ok(batch_id) => {
                    info!(batch_id = %batch_id, name = %name, started = batch.start, "Created batch from manifest");
                    summary.batches += 1;
                }
                Err(e) => {
                    warn!(name = %name, "Manifest batch rejected: {}", e);
                    summary.rejected += 1;
                }
            }
        }

        summary
    }
}
