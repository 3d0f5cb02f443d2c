use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use super::backoff::BackoffPolicy;
use super::classifier::ErrorClassifier;
use super::history::{ErrorHistory, ErrorStatistics};
use super::policy::{OutcomeStats, PolicyTable};
use super::types::{ErrorCategory, ErrorContext, ErrorRecord, RecoverySuggestion};
use crate::config::RetryConfig;
use crate::renderer::RenderError;

/// Decides what happens after a failed attempt.
pub struct RecoveryStrategist {
    classifier: ErrorClassifier,
    backoff: BackoffPolicy,
    strict_retry_cap: u32,
    policy: Mutex<PolicyTable>,
    history: Mutex<ErrorHistory>,
}

impl Default for RecoveryStrategist {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl RecoveryStrategist {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            classifier: ErrorClassifier::new(),
            backoff: BackoffPolicy::from_config(config),
            strict_retry_cap: config.strict_retry_cap,
            policy: Mutex::new(PolicyTable::new()),
            history: Mutex::new(ErrorHistory::default()),
        }
    }

    pub fn classify(&self, error: &RenderError, context: &ErrorContext) -> ErrorCategory {
        self.classifier.classify(error, context)
    }

    /// Static eligibility: only validation errors are never retried.
    pub fn retriable(&self, category: ErrorCategory) -> bool {
        category != ErrorCategory::Validation
    }

    /// Retry budget for a category given the configured maximum.
    pub fn retry_cap(&self, category: ErrorCategory, max_retries: u32) -> u32 {
        match category {
            ErrorCategory::Validation => 0,
            ErrorCategory::System | ErrorCategory::Unknown => {
                max_retries.min(self.strict_retry_cap)
            }
            _ => max_retries,
        }
    }

    pub fn should_retry(
        &self,
        category: ErrorCategory,
        attempt_count: u32,
        max_retries: u32,
    ) -> bool {
        self.retriable(category) && attempt_count < self.retry_cap(category, max_retries)
    }

    /// Jittered delay before retry number `attempt_count + 1`.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        self.backoff.delay(attempt_count)
    }

    pub fn backoff_policy(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn recovery_suggestion(
        &self,
        category: ErrorCategory,
        context: &ErrorContext,
    ) -> RecoverySuggestion {
        self.policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .suggest(category, context.attempt_count)
    }

    /// Classify a failure, decide whether it is retried, and record it.
    pub fn analyze(
        &self,
        error: &RenderError,
        context: &ErrorContext,
        max_retries: u32,
    ) -> ErrorRecord {
        let category = self.classify(error, context);
        let retriable = self.should_retry(category, context.attempt_count, max_retries);
        let record = ErrorRecord {
            category,
            message: error.to_string(),
            user_message: category.user_message().to_string(),
            retriable,
            suggestion: self.recovery_suggestion(category, context),
            attempt_count: context.attempt_count,
            occurred_at: Utc::now(),
        };

        debug!(
            job_id = context.job_id.as_deref().unwrap_or("-"),
            category = %category,
            rule = self.classifier.explain(error, context).unwrap_or("none"),
            retriable,
            "Classified render failure"
        );

        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        record
    }

    /// Feed back whether a retried job eventually succeeded.
    pub fn record_outcome(&self, category: ErrorCategory, succeeded: bool) {
        self.policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_outcome(category, succeeded);
    }

    pub fn outcomes(&self, category: ErrorCategory) -> OutcomeStats {
        self.policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .outcomes(category)
    }

    pub fn statistics(&self) -> ErrorStatistics {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategist() -> RecoveryStrategist {
        RecoveryStrategist::new(&RetryConfig::default())
    }

    #[test]
    fn test_retriable_table() {
        let s = strategist();
        assert!(!s.retriable(ErrorCategory::Validation));
        for category in [
            ErrorCategory::Network,
            ErrorCategory::Resource,
            ErrorCategory::Renderer,
            ErrorCategory::FileIo,
            ErrorCategory::Timeout,
            ErrorCategory::System,
            ErrorCategory::Unknown,
        ] {
            assert!(s.retriable(category), "{} should be retriable", category);
        }
    }

    #[test]
    fn test_strict_cap_for_system_and_unknown() {
        let s = strategist();
        assert!(s.should_retry(ErrorCategory::Unknown, 0, 3));
        assert!(!s.should_retry(ErrorCategory::Unknown, 1, 3));
        assert!(!s.should_retry(ErrorCategory::System, 1, 3));
        assert!(s.should_retry(ErrorCategory::Network, 2, 3));
        assert!(!s.should_retry(ErrorCategory::Network, 3, 3));
        assert!(!s.should_retry(ErrorCategory::Validation, 0, 3));
    }

    #[test]
    fn test_analyze_builds_record_and_history() {
        let s = strategist();
        let ctx = ErrorContext::new("render").with_attempt_count(0);
        let record = s.analyze(&RenderError::invalid_parameters("bad font"), &ctx, 3);

        assert_eq!(record.category, ErrorCategory::Validation);
        assert!(!record.retriable);
        assert_eq!(record.user_message, ErrorCategory::Validation.user_message());
        assert_eq!(s.statistics().total, 1);
    }

    #[test]
    fn test_record_outcome_is_tracked() {
        let s = strategist();
        s.record_outcome(ErrorCategory::Network, true);
        s.record_outcome(ErrorCategory::Network, false);
        let stats = s.outcomes(ErrorCategory::Network);
        assert_eq!((stats.successes, stats.failures), (1, 1));
    }
}
