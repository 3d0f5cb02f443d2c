use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// `min(base * factor^n + jitter, cap)` with jitter drawn from `[0, base)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, factor: f64, cap: Duration) -> Self {
        Self { base, factor, cap }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            config.factor,
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Deterministic part of the delay for the given retry count.
    pub fn delay_without_jitter(&self, attempt_count: u32) -> Duration {
        self.clamp(self.exponential(attempt_count))
    }

    /// Delay before the next attempt, jittered.
    pub fn delay(&self, attempt_count: u32) -> Duration {
        let base = self.base.as_secs_f64();
        let jitter = if base > 0.0 {
            rand::rng().random_range(0.0..base)
        } else {
            0.0
        };
        self.clamp(self.exponential(attempt_count) + jitter)
    }

    fn exponential(&self, attempt_count: u32) -> f64 {
        let exponent = i32::try_from(attempt_count).unwrap_or(i32::MAX);
        self.base.as_secs_f64() * self.factor.powi(exponent)
    }

    fn clamp(&self, secs: f64) -> Duration {
        let capped = secs.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_doubles_then_clamps() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(30));
        let secs: Vec<u64> = (0..8)
            .map(|n| policy.delay_without_jitter(n).as_secs())
            .collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_jitter_stays_below_base_and_under_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(30));
        for n in 0..10 {
            let plain = policy.delay_without_jitter(n);
            for _ in 0..50 {
                let jittered = policy.delay(n);
                assert!(jittered >= plain);
                assert!(jittered < plain + Duration::from_secs(1));
                assert!(jittered <= Duration::from_secs(30));
            }
        }
    }

    #[test]
    fn test_huge_attempt_count_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_without_jitter(u32::MAX), Duration::from_secs(30));
        assert_eq!(policy.delay(10_000), Duration::from_secs(30));
    }
}
