use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use super::types::{ErrorCategory, ErrorRecord};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
const RECENT_ERRORS: usize = 10;

/// Bounded log of classified failures, oldest evicted first.
#[derive(Debug, Clone)]
pub struct ErrorHistory {
    entries: VecDeque<ErrorRecord>,
    capacity: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total: usize,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub most_common: Option<ErrorCategory>,
    /// Newest last.
    pub recent: Vec<ErrorRecord>,
}

impl Default for ErrorHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ErrorHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: ErrorRecord) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn statistics(&self) -> ErrorStatistics {
        let mut by_category = BTreeMap::new();
        for record in &self.entries {
            *by_category.entry(record.category).or_insert(0) += 1;
        }
        // Ties go to the category listed first.
        let most_common = by_category
            .iter()
            .fold(None::<(ErrorCategory, usize)>, |best, (&category, &count)| {
                match best {
                    Some((_, best_count)) if best_count >= count => best,
                    _ => Some((category, count)),
                }
            })
            .map(|(category, _)| category);
        let skip = self.entries.len().saturating_sub(RECENT_ERRORS);

        ErrorStatistics {
            total: self.entries.len(),
            by_category,
            most_common,
            recent: self.entries.iter().skip(skip).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{PolicyTable, RecoverySuggestion};
    use chrono::Utc;

    fn record(category: ErrorCategory, message: &str) -> ErrorRecord {
        let suggestion: RecoverySuggestion = PolicyTable::new().suggest(category, 0);
        ErrorRecord {
            category,
            message: message.to_string(),
            user_message: category.user_message().to_string(),
            retriable: true,
            suggestion,
            attempt_count: 0,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut history = ErrorHistory::with_capacity(3);
        for i in 0..5 {
            history.push(record(ErrorCategory::Network, &format!("e{}", i)));
        }
        assert_eq!(history.len(), 3);
        let stats = history.statistics();
        let messages: Vec<&str> = stats.recent.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["e2", "e3", "e4"]);
    }

    #[test]
    fn test_statistics_counts_categories() {
        let mut history = ErrorHistory::default();
        history.push(record(ErrorCategory::Timeout, "a"));
        history.push(record(ErrorCategory::Renderer, "b"));
        history.push(record(ErrorCategory::Renderer, "c"));

        let stats = history.statistics();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_category.get(&ErrorCategory::Renderer), Some(&2));
        assert_eq!(stats.most_common, Some(ErrorCategory::Renderer));
    }

    #[test]
    fn test_empty_history() {
        let stats = ErrorHistory::default().statistics();
        assert_eq!(stats.total, 0);
        assert!(stats.most_common.is_none());
        assert!(stats.recent.is_empty());
    }
}
