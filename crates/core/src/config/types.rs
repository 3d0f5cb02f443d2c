use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// =============================================================================
// Scheduler
// =============================================================================

/// Admission and ordering settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Process-wide cap on concurrently running jobs.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Maximum number of Queued jobs before submissions are refused.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// A job waiting longer than this is promoted one priority level (once).
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// How often the starvation sweep runs while workers are idle.
    #[serde(default = "default_promotion_interval_ms")]
    pub promotion_interval_ms: u64,
}

impl SchedulerConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn promotion_interval(&self) -> Duration {
        Duration::from_millis(self.promotion_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_queue_size: default_max_queue_size(),
            max_wait_secs: default_max_wait_secs(),
            promotion_interval_ms: default_promotion_interval_ms(),
        }
    }
}

fn default_max_concurrent_jobs() -> usize {
    2
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_max_wait_secs() -> u64 {
    300
}

fn default_promotion_interval_ms() -> u64 {
    1000
}

// =============================================================================
// Worker pool
// =============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Number of worker tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Hard execution timeout per attempt.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Retries allowed for retriable categories.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How long a cancelled render may take to acknowledge before it is dropped.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// How long shutdown waits for running jobs before cancelling them.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            job_timeout_secs: default_job_timeout_secs(),
            max_retries: default_max_retries(),
            cancel_grace_ms: default_cancel_grace_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_job_timeout_secs() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    3
}

fn default_cancel_grace_ms() -> u64 {
    2000
}

fn default_shutdown_timeout_secs() -> u64 {
    300
}

// =============================================================================
// Retry
// =============================================================================

/// Exponential backoff parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Retry cap for `system` and `unknown` errors.
    #[serde(default = "default_strict_retry_cap")]
    pub strict_retry_cap: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
            max_delay_ms: default_max_delay_ms(),
            strict_retry_cap: default_strict_retry_cap(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_strict_retry_cap() -> u32 {
    1
}

// =============================================================================
// Estimator
// =============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EstimatorConfig {
    /// Ring buffer capacity per shape signature.
    #[serde(default = "default_samples_per_shape")]
    pub samples_per_shape: usize,
    /// Successful samples needed before history replaces the fallback formula.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Confidence reported for fallback estimates; the floor for all estimates.
    #[serde(default = "default_fallback_confidence")]
    pub fallback_confidence: f64,
    /// Samples older than this carry the minimum recency weight.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            samples_per_shape: default_samples_per_shape(),
            min_samples: default_min_samples(),
            fallback_confidence: default_fallback_confidence(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_samples_per_shape() -> usize {
    200
}

fn default_min_samples() -> usize {
    3
}

fn default_fallback_confidence() -> f64 {
    0.3
}

fn default_retention_days() -> u32 {
    30
}

// =============================================================================
// Persistence
// =============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_persistence_enabled")]
    pub enabled: bool,
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Capacity of the write-behind channel.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: default_persistence_enabled(),
            path: default_db_path(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_persistence_enabled() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    PathBuf::from("framequeue.db")
}

fn default_buffer_size() -> usize {
    1024
}

// =============================================================================
// Renderer
// =============================================================================

/// External render program invoked once per attempt.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RendererConfig {
    /// Program to execute (resolved through PATH).
    #[serde(default = "default_renderer_program")]
    pub program: String,
    /// Extra arguments passed before the request is written to stdin.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Exposed to the program as FRAMEQUEUE_OUTPUT_DIR.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            program: default_renderer_program(),
            args: Vec::new(),
            working_dir: None,
            output_dir: default_output_dir(),
        }
    }
}

fn default_renderer_program() -> String {
    "framequeue-render".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

// =============================================================================
// Resources
// =============================================================================

/// Percent-used levels at which one resource counts as under pressure.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct PressureThresholds {
    pub moderate: f32,
    pub high: f32,
    pub critical: f32,
}

impl PressureThresholds {
    pub const fn new(moderate: f32, high: f32, critical: f32) -> Self {
        Self {
            moderate,
            high,
            critical,
        }
    }

    fn is_ordered(&self) -> bool {
        self.moderate > 0.0
            && self.moderate <= self.high
            && self.high <= self.critical
            && self.critical <= 100.0
    }
}

/// Host sampling that throttles admission under CPU, memory or disk pressure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourcesConfig {
    #[serde(default = "default_resources_enabled")]
    pub enabled: bool,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_cpu_thresholds")]
    pub cpu: PressureThresholds,
    #[serde(default = "default_memory_thresholds")]
    pub memory: PressureThresholds,
    #[serde(default = "default_disk_thresholds")]
    pub disk: PressureThresholds,
    /// Filesystem watched for disk pressure. Defaults to `renderer.output_dir`.
    #[serde(default)]
    pub disk_path: Option<PathBuf>,
}

impl ResourcesConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Name of the first threshold set that is out of order, if any.
    pub fn invalid_thresholds(&self) -> Option<&'static str> {
        [("cpu", &self.cpu), ("memory", &self.memory), ("disk", &self.disk)]
            .into_iter()
            .find(|(_, thresholds)| !thresholds.is_ordered())
            .map(|(name, _)| name)
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            enabled: default_resources_enabled(),
            check_interval_secs: default_check_interval_secs(),
            cpu: default_cpu_thresholds(),
            memory: default_memory_thresholds(),
            disk: default_disk_thresholds(),
            disk_path: None,
        }
    }
}

fn default_resources_enabled() -> bool {
    true
}

fn default_check_interval_secs() -> u64 {
    10
}

fn default_cpu_thresholds() -> PressureThresholds {
    PressureThresholds::new(70.0, 85.0, 95.0)
}

fn default_memory_thresholds() -> PressureThresholds {
    PressureThresholds::new(70.0, 85.0, 95.0)
}

fn default_disk_thresholds() -> PressureThresholds {
    PressureThresholds::new(80.0, 90.0, 95.0)
}

// =============================================================================
// Metrics & logging
// =============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// When set, the daemon periodically writes the text exposition here.
    #[serde(default)]
    pub textfile_path: Option<PathBuf>,
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            textfile_path: None,
            interval_secs: default_metrics_interval_secs(),
        }
    }
}

fn default_metrics_interval_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Used when RUST_LOG is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.max_concurrent_jobs, 2);
        assert_eq!(config.scheduler.max_queue_size, 1000);
        assert_eq!(config.worker.job_timeout(), Duration::from_secs(3600));
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.estimator.samples_per_shape, 200);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.persistence.enabled);
        assert!(config.metrics.textfile_path.is_none());
        assert!(config.resources.enabled);
        assert_eq!(config.resources.check_interval(), Duration::from_secs(10));
        assert_eq!(config.resources.disk, PressureThresholds::new(80.0, 90.0, 95.0));
    }

    #[test]
    fn test_resource_thresholds_from_toml() {
        let config: Config = toml::from_str(
            r#"
[resources]
check_interval_secs = 5

[resources.memory]
moderate = 60.0
high = 75.0
critical = 90.0
"#,
        )
        .unwrap();
        assert_eq!(config.resources.check_interval_secs, 5);
        assert_eq!(config.resources.memory.high, 75.0);
        assert_eq!(config.resources.cpu, PressureThresholds::new(70.0, 85.0, 95.0));
        assert!(config.resources.invalid_thresholds().is_none());

        let mut resources = config.resources;
        resources.disk.high = 99.0;
        assert_eq!(resources.invalid_thresholds(), Some("disk"));
    }

    #[test]
    fn test_default_matches_empty_toml() {
        let parsed: Config = toml::from_str("").unwrap();
        let built = Config::default();
        assert_eq!(parsed.metrics.interval_secs, built.metrics.interval_secs);
        assert_eq!(parsed.worker.cancel_grace(), built.worker.cancel_grace());
        assert_eq!(parsed.estimator.min_samples, built.estimator.min_samples);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
[scheduler]
max_concurrent_jobs = 8

[logging]
format = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_concurrent_jobs, 8);
        assert_eq!(config.scheduler.max_wait_secs, 300);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.filter, "info");
    }
}
