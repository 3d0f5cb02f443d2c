//! Testing utilities for engine-level tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use framequeue_core::testing::{fixtures, MockRenderer};
//!
//! let renderer = Arc::new(MockRenderer::new());
//! renderer.fail_next(RenderError::Network { reason: "connection reset".into() }).await;
//!
//! let engine = RenderEngine::new(fixtures::fast_config(), renderer.clone());
//! engine.start();
//! ```

mod mock_renderer;

pub use mock_renderer::{MockRenderer, RecordedRender};

/// Test fixtures and helper functions.
pub mod fixtures {
    use serde_json::{json, Value};

    use crate::batch::BatchSpec;
    use crate::config::{Config, ResourcesConfig, RetryConfig, SchedulerConfig, WorkerConfig};
    use crate::job::JobSpec;

    /// Configuration with short delays so retries and promotions happen within a test.
    /// Host sampling is off so admission never depends on the machine running the tests.
    pub fn fast_config() -> Config {
        Config {
            scheduler: SchedulerConfig {
                max_concurrent_jobs: 2,
                promotion_interval_ms: 20,
                ..SchedulerConfig::default()
            },
            worker: WorkerConfig {
                workers: 2,
                cancel_grace_ms: 100,
                shutdown_timeout_secs: 2,
                ..WorkerConfig::default()
            },
            retry: RetryConfig {
                base_delay_ms: 10,
                max_delay_ms: 50,
                ..RetryConfig::default()
            },
            resources: ResourcesConfig {
                enabled: false,
                ..ResourcesConfig::default()
            },
            ..Config::default()
        }
    }

    /// Typing render parameters with the given text.
    pub fn typing_params(text: &str) -> Value {
        json!({ "custom_text": text, "duration_secs": 30 })
    }

    /// Matrix render parameters with the given duration.
    pub fn matrix_params(duration_secs: u32) -> Value {
        json!({ "duration_secs": duration_secs })
    }

    pub fn typing_job(text: &str) -> JobSpec {
        JobSpec::new("typing", typing_params(text))
    }

    pub fn matrix_job(duration_secs: u32) -> JobSpec {
        JobSpec::new("matrix", matrix_params(duration_secs))
    }

    /// A batch of `count` matrix jobs.
    pub fn matrix_batch(name: &str, count: usize) -> BatchSpec {
        BatchSpec::new(name, (0..count).map(|_| matrix_job(15)).collect())
    }
}
