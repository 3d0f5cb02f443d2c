use super::{types::Config, ConfigError};

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let fail = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

    if config.scheduler.max_concurrent_jobs == 0 {
        return fail("scheduler.max_concurrent_jobs cannot be 0");
    }
    if config.scheduler.max_queue_size == 0 {
        return fail("scheduler.max_queue_size cannot be 0");
    }
    if config.scheduler.promotion_interval_ms == 0 {
        return fail("scheduler.promotion_interval_ms cannot be 0");
    }
    if config.worker.workers == 0 {
        return fail("worker.workers cannot be 0");
    }
    if config.worker.job_timeout_secs == 0 {
        return fail("worker.job_timeout_secs cannot be 0");
    }
    if config.retry.base_delay_ms == 0 {
        return fail("retry.base_delay_ms cannot be 0");
    }
    if config.retry.factor.is_nan() || config.retry.factor < 1.0 {
        return fail("retry.factor must be >= 1.0");
    }
    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        return fail("retry.max_delay_ms must be >= retry.base_delay_ms");
    }
    if config.estimator.samples_per_shape == 0 {
        return fail("estimator.samples_per_shape cannot be 0");
    }
    let floor = config.estimator.fallback_confidence;
    if floor.is_nan() || floor <= 0.0 || floor > 1.0 {
        return fail("estimator.fallback_confidence must be in (0, 1]");
    }
    if config.renderer.program.trim().is_empty() {
        return fail("renderer.program cannot be empty");
    }
    if config.resources.enabled && config.resources.check_interval_secs == 0 {
        return fail("resources.check_interval_secs cannot be 0");
    }
    if let Some(name) = config.resources.invalid_thresholds() {
        return Err(ConfigError::ValidationError(format!(
            "resources.{} thresholds must satisfy 0 < moderate <= high <= critical <= 100",
            name
        )));
    }

    Ok(())
}
