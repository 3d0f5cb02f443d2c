//! Failure classification, retry eligibility, backoff and recovery suggestions.

mod backoff;
mod classifier;
mod history;
mod policy;
mod strategist;
mod types;

pub use backoff::BackoffPolicy;
pub use classifier::ErrorClassifier;
pub use history::{ErrorHistory, ErrorStatistics};
pub use policy::{OutcomeStats, PolicyTable, RecoveryAction};
pub use strategist::RecoveryStrategist;
pub use types::{ErrorCategory, ErrorContext, ErrorRecord, RecoveryStrategy, RecoverySuggestion};
