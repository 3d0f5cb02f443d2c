//! Ordered rule table mapping failures to categories. First match wins.

use regex_lite::Regex;

use super::types::{ErrorCategory, ErrorContext};
use crate::renderer::{RenderError, RenderErrorKind};

enum Matcher {
    Kind(RenderErrorKind),
    Message(Regex),
    Operation(Regex),
}

struct ClassificationRule {
    name: &'static str,
    matcher: Matcher,
    category: ErrorCategory,
}

impl ClassificationRule {
    fn matches(&self, error: &RenderError, detail: &str, context: &ErrorContext) -> bool {
        match &self.matcher {
            Matcher::Kind(kind) => error.kind() == *kind,
            Matcher::Message(re) => re.is_match(detail),
            Matcher::Operation(re) => re.is_match(&context.operation),
        }
    }
}

const KIND_RULES: &[(&str, RenderErrorKind, ErrorCategory)] = &[
    ("timeout_error", RenderErrorKind::Timeout, ErrorCategory::Timeout),
    (
        "rejected_parameters",
        RenderErrorKind::InvalidParameters,
        ErrorCategory::Validation,
    ),
    ("network_error", RenderErrorKind::Network, ErrorCategory::Network),
    ("resource_error", RenderErrorKind::Resource, ErrorCategory::Resource),
    ("spawn_error", RenderErrorKind::Spawn, ErrorCategory::System),
    ("io_error", RenderErrorKind::Io, ErrorCategory::FileIo),
];

const MESSAGE_RULES: &[(&str, &str, ErrorCategory)] = &[
    (
        "validation_message",
        r"(?i)\b(invalid|validation|missing required|required field|bad parameter|out of range)\b",
        ErrorCategory::Validation,
    ),
    (
        "timeout_message",
        r"(?i)(timed out|deadline exceeded|\bexpired\b)",
        ErrorCategory::Timeout,
    ),
    (
        "network_message",
        r"(?i)(connection (refused|reset|closed)|network|unreachable|\bdns\b|socket)",
        ErrorCategory::Network,
    ),
    (
        "resource_message",
        r"(?i)(out of memory|\bmemory\b|no space left|disk full|quota|too many open files|permission denied|resource)",
        ErrorCategory::Resource,
    ),
    (
        "renderer_message",
        r"(?i)(ffmpeg|codec|encod|decod|\bstream\b|font|surface|display|\bsdl\b|render)",
        ErrorCategory::Renderer,
    ),
    (
        "file_io_message",
        r"(?i)(no such file|file not found|\bread\b|\bwrite\b|\bopen\b|\bi/o\b|\bio\b)",
        ErrorCategory::FileIo,
    ),
    (
        "system_message",
        r"(?i)(\bsystem\b|\bos\b|platform|environment|\bpath\b|directory)",
        ErrorCategory::System,
    ),
];

const OPERATION_RULES: &[(&str, &str, ErrorCategory)] = &[
    (
        "render_operation",
        r"(?i)(render|encode|frame)",
        ErrorCategory::Renderer,
    ),
    (
        "file_operation",
        r"(?i)(save|load|file|upload|write)",
        ErrorCategory::FileIo,
    ),
];

/// Deterministic classifier: typed error kinds first, then message
/// keywords, then the failing operation's name.
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        let kinds = KIND_RULES
            .iter()
            .map(|&(name, kind, category)| ClassificationRule {
                name,
                matcher: Matcher::Kind(kind),
                category,
            });
        let messages = MESSAGE_RULES.iter().filter_map(|&(name, pattern, category)| {
            Regex::new(pattern).ok().map(|re| ClassificationRule {
                name,
                matcher: Matcher::Message(re),
                category,
            })
        });
        let operations = OPERATION_RULES
            .iter()
            .filter_map(|&(name, pattern, category)| {
                Regex::new(pattern).ok().map(|re| ClassificationRule {
                    name,
                    matcher: Matcher::Operation(re),
                    category,
                })
            });

        Self {
            rules: kinds.chain(messages).chain(operations).collect(),
        }
    }

    pub fn classify(&self, error: &RenderError, context: &ErrorContext) -> ErrorCategory {
        self.matching_rule(error, context)
            .map(|rule| rule.category)
            .unwrap_or(ErrorCategory::Unknown)
    }

    /// Name of the rule that decided the category, if any.
    pub fn explain(&self, error: &RenderError, context: &ErrorContext) -> Option<&'static str> {
        self.matching_rule(error, context).map(|rule| rule.name)
    }

    fn matching_rule(
        &self,
        error: &RenderError,
        context: &ErrorContext,
    ) -> Option<&ClassificationRule> {
        if error.kind() == RenderErrorKind::Cancelled {
            return None;
        }
        let detail = error.detail();
        self.rules
            .iter()
            .find(|rule| rule.matches(error, &detail, context))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
