//! Static recovery advice per category, refined by observed retry outcomes.

use std::collections::HashMap;

use serde::Serialize;

use super::types::{ErrorCategory, RecoveryStrategy, RecoverySuggestion};

const CONFIDENCE_PENALTY_PER_ATTEMPT: f64 = 0.1;
const SUCCESS_PENALTY_PER_ATTEMPT: f64 = 0.15;
const PENALTY_FLOOR: f64 = 0.1;
/// Outcomes needed before observations override the static rate.
const MIN_OUTCOMES: u64 = 5;
/// Weight of the static rate, in pseudo-observations.
const PRIOR_WEIGHT: f64 = 5.0;

/// One entry of the policy table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecoveryAction {
    pub strategy: RecoveryStrategy,
    pub description: &'static str,
    pub confidence: f64,
    pub success_rate: f64,
}

impl RecoveryAction {
    const fn new(
        strategy: RecoveryStrategy,
        description: &'static str,
        confidence: f64,
        success_rate: f64,
    ) -> Self {
        Self {
            strategy,
            description,
            confidence,
            success_rate,
        }
    }

    fn score(&self) -> f64 {
        self.confidence * self.success_rate
    }
}

const NETWORK_ACTIONS: &[RecoveryAction] = &[RecoveryAction::new(
    RecoveryStrategy::Retry,
    "Retry with exponential backoff once the network recovers",
    0.8,
    0.7,
)];

const VALIDATION_ACTIONS: &[RecoveryAction] = &[RecoveryAction::new(
    RecoveryStrategy::Abort,
    "Fix the job parameters and submit a new job",
    0.9,
    0.0,
)];

const RESOURCE_ACTIONS: &[RecoveryAction] = &[
    RecoveryAction::new(
        RecoveryStrategy::ReduceQuality,
        "Lower resolution or duration to reduce memory and disk use",
        0.7,
        0.6,
    ),
    RecoveryAction::new(
        RecoveryStrategy::Retry,
        "Retry once resources are released",
        0.6,
        0.5,
    ),
];

const RENDERER_ACTIONS: &[RecoveryAction] = &[
    RecoveryAction::new(
        RecoveryStrategy::AlternativeMethod,
        "Retry with alternative encoder settings",
        0.8,
        0.7,
    ),
    RecoveryAction::new(
        RecoveryStrategy::ReduceQuality,
        "Retry at reduced output quality",
        0.9,
        0.8,
    ),
];

const FILE_IO_ACTIONS: &[RecoveryAction] = &[
    RecoveryAction::new(
        RecoveryStrategy::Retry,
        "Retry the file operation",
        0.8,
        0.7,
    ),
    RecoveryAction::new(
        RecoveryStrategy::AlternativeMethod,
        "Write the artifact to an alternative location",
        0.6,
        0.5,
    ),
];

const TIMEOUT_ACTIONS: &[RecoveryAction] = &[RecoveryAction::new(
    RecoveryStrategy::Retry,
    "Retry, or split the render into shorter clips",
    0.7,
    0.6,
)];

const SYSTEM_ACTIONS: &[RecoveryAction] = &[RecoveryAction::new(
    RecoveryStrategy::ManualIntervention,
    "Check the render host configuration and environment",
    0.6,
    0.3,
)];

const UNKNOWN_ACTIONS: &[RecoveryAction] = &[RecoveryAction::new(
    RecoveryStrategy::Retry,
    "Retry the operation",
    0.4,
    0.3,
)];

/// Retry outcomes observed for one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeStats {
    pub successes: u64,
    pub failures: u64,
}

impl OutcomeStats {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    outcomes: HashMap<ErrorCategory, OutcomeStats>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidate actions for a category, in table order.
    pub fn actions(category: ErrorCategory) -> &'static [RecoveryAction] {
        match category {
            ErrorCategory::Network => NETWORK_ACTIONS,
            ErrorCategory::Validation => VALIDATION_ACTIONS,
            ErrorCategory::Resource => RESOURCE_ACTIONS,
            ErrorCategory::Renderer => RENDERER_ACTIONS,
            ErrorCategory::FileIo => FILE_IO_ACTIONS,
            ErrorCategory::Timeout => TIMEOUT_ACTIONS,
            ErrorCategory::System => SYSTEM_ACTIONS,
            ErrorCategory::Unknown => UNKNOWN_ACTIONS,
        }
    }

    /// Best action for the category, adjusted for how many retries already happened.
    pub fn suggest(&self, category: ErrorCategory, attempt_count: u32) -> RecoverySuggestion {
        let actions = Self::actions(category);
        // Every category has at least one action.
        let best = actions
            .iter()
            .copied()
            .max_by(|a, b| a.score().total_cmp(&b.score()))
            .unwrap_or(RecoveryAction::new(
                RecoveryStrategy::ManualIntervention,
                "Inspect the failure manually",
                0.1,
                0.1,
            ));

        let penalty = f64::from(attempt_count);
        let confidence =
            apply_penalty(best.confidence, CONFIDENCE_PENALTY_PER_ATTEMPT * penalty);
        let rate = self.refined_rate(category, best.success_rate);
        let rate = apply_penalty(rate, SUCCESS_PENALTY_PER_ATTEMPT * penalty);

        RecoverySuggestion {
            strategy: best.strategy,
            description: best.description.to_string(),
            confidence,
            estimated_success_rate: rate,
        }
    }

    /// Static rate until enough outcomes exist, then a smoothed observed rate.
    pub fn refined_rate(&self, category: ErrorCategory, prior: f64) -> f64 {
        match self.outcomes.get(&category) {
            Some(stats) if stats.total() >= MIN_OUTCOMES => {
                (prior * PRIOR_WEIGHT + stats.successes as f64)
                    / (PRIOR_WEIGHT + stats.total() as f64)
            }
            _ => prior,
        }
    }

    pub fn record_outcome(&mut self, category: ErrorCategory, succeeded: bool) {
        let stats = self.outcomes.entry(category).or_default();
        if succeeded {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
    }

    pub fn outcomes(&self, category: ErrorCategory) -> OutcomeStats {
        self.outcomes.get(&category).copied().unwrap_or_default()
    }
}

/// Subtract the penalty, never going below the floor unless the base already was.
fn apply_penalty(base: f64, penalty: f64) -> f64 {
    (base - penalty).max(base.min(PENALTY_FLOOR)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_default_suggestion_is_deterministic() {
        let table = PolicyTable::new();
        let first = table.suggest(ErrorCategory::Network, 0);
        let second = table.suggest(ErrorCategory::Network, 0);
        assert_eq!(first, second);
        assert_eq!(first.strategy, RecoveryStrategy::Retry);
        assert!(approx(first.confidence, 0.8));
        assert!(approx(first.estimated_success_rate, 0.7));
    }

    #[test]
    fn test_best_action_by_score() {
        let suggestion = PolicyTable::new().suggest(ErrorCategory::Renderer, 0);
        assert_eq!(suggestion.strategy, RecoveryStrategy::ReduceQuality);
    }

    #[test]
    fn test_attempt_penalty_with_floor() {
        let table = PolicyTable::new();
        let second = table.suggest(ErrorCategory::Network, 1);
        assert!(approx(second.confidence, 0.7));
        assert!(approx(second.estimated_success_rate, 0.55));

        let late = table.suggest(ErrorCategory::Network, 10);
        assert!(approx(late.confidence, 0.1));
        assert!(approx(late.estimated_success_rate, 0.1));

        let validation = table.suggest(ErrorCategory::Validation, 3);
        assert!(approx(validation.estimated_success_rate, 0.0));
    }

    #[test]
    fn test_outcomes_refine_only_after_threshold() {
        let mut table = PolicyTable::new();
        for _ in 0..4 {
            table.record_outcome(ErrorCategory::Timeout, false);
        }
        assert!(approx(table.refined_rate(ErrorCategory::Timeout, 0.6), 0.6));

        table.record_outcome(ErrorCategory::Timeout, false);
        // (0.6 * 5 + 0) / (5 + 5)
        assert!(approx(table.refined_rate(ErrorCategory::Timeout, 0.6), 0.3));
        assert_eq!(table.outcomes(ErrorCategory::Timeout).failures, 5);
    }

    #[test]
    fn test_tables_keep_declared_order() {
        let resource = PolicyTable::actions(ErrorCategory::Resource);
        assert_eq!(resource.len(), 2);
        assert_eq!(resource[0].strategy, RecoveryStrategy::ReduceQuality);
        assert_eq!(resource[1].strategy, RecoveryStrategy::Retry);
        assert_eq!(
            PolicyTable::actions(ErrorCategory::Validation)[0].strategy,
            RecoveryStrategy::Abort
        );
    }

    #[test]
    fn test_every_category_has_an_action() {
        for category in ErrorCategory::ALL {
            assert!(!PolicyTable::actions(category).is_empty());
        }
    }
}
