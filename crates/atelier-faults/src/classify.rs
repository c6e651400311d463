use chrono::{DateTime, Utc};
use regex::RegexSet;
use serde::{Deserialize, Serialize};

use atelier_types::{ErrorSeverity, RawErrorKind, TaskFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Resource,
    Validation,
    Permanent,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn recoverable(self) -> bool {
        matches!(self, ErrorCategory::Transient | ErrorCategory::Resource)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetryWithBackoff,
    QueueAndWait,
    FailFast,
    DeadLetter,
    RetryOnce,
}

/// The outcome of classifying one failure: what happened, how bad it is,
/// and how recovery should proceed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub strategy: RecoveryStrategy,
    pub error_kind: RawErrorKind,
    pub message: String,
    pub recoverable: bool,
    pub severity: ErrorSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_time_secs: Option<u64>,
    #[serde(default)]
    pub notify_user: bool,
    #[serde(default)]
    pub alert_admin: bool,
    pub timestamp: DateTime<Utc>,
}

const TRANSIENT_PATTERNS: &[&str] = &[
    r"connection reset",
    r"timeout",
    r"temporary failure",
    r"resource temporarily unavailable",
    r"connection refused",
    r"network unreachable",
    r"broken pipe",
    r"connection aborted",
];

const RESOURCE_PATTERNS: &[&str] = &[
    r"out of memory",
    r"no space left",
    r"gpu memory",
    r"resource exhausted",
    r"cannot allocate memory",
    r"insufficient resources",
    r"quota exceeded",
    r"too many open files",
];

const VALIDATION_PATTERNS: &[&str] = &[
    r"invalid input",
    r"schema validation",
    r"type error",
    r"constraint violation",
    r"invalid parameter",
    r"validation failed",
    r"format error",
    r"missing required",
];

const PERMANENT_PATTERNS: &[&str] = &[
    r"model not found",
    r"permission denied",
    r"invalid configuration",
    r"unsupported operation",
    r"authentication failed",
    r"access denied",
    r"not implemented",
    r"feature disabled",
];

/// Maps failures to categories: first by the reported kind, then by
/// case-insensitive message patterns, defaulting to unknown/retry-once.
pub struct ErrorClassifier {
    transient: RegexSet,
    resource: RegexSet,
    validation: RegexSet,
    permanent: RegexSet,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        let build = |patterns: &[&str]| {
            let insensitive: Vec<String> =
                patterns.iter().map(|p| format!("(?i){p}")).collect();
            RegexSet::new(insensitive).expect("classifier patterns are static and valid")
        };
        Self {
            transient: build(TRANSIENT_PATTERNS),
            resource: build(RESOURCE_PATTERNS),
            validation: build(VALIDATION_PATTERNS),
            permanent: build(PERMANENT_PATTERNS),
        }
    }

    pub fn classify(&self, failure: &TaskFailure) -> ErrorClassification {
        if let Some(category) = kind_category(failure.kind) {
            return self.build(category, failure);
        }

        let message = failure.message.as_str();
        let category = if self.transient.is_match(message) {
            Some(ErrorCategory::Transient)
        } else if self.resource.is_match(message) {
            Some(ErrorCategory::Resource)
        } else if self.validation.is_match(message) {
            Some(ErrorCategory::Validation)
        } else if self.permanent.is_match(message) {
            Some(ErrorCategory::Permanent)
        } else {
            None
        };

        match category {
            Some(category) => self.build(category, failure),
            None => ErrorClassification {
                category: ErrorCategory::Unknown,
                strategy: RecoveryStrategy::RetryOnce,
                error_kind: failure.kind,
                message: failure.message.clone(),
                recoverable: false,
                severity: ErrorSeverity::Medium,
                max_retries: Some(1),
                wait_time_secs: None,
                notify_user: false,
                alert_admin: false,
                timestamp: Utc::now(),
            },
        }
    }

    fn build(&self, category: ErrorCategory, failure: &TaskFailure) -> ErrorClassification {
        let (strategy, severity, max_retries, wait_time_secs, notify_user, alert_admin) =
            match category {
                ErrorCategory::Transient => (
                    RecoveryStrategy::RetryWithBackoff,
                    ErrorSeverity::Low,
                    Some(3),
                    None,
                    false,
                    false,
                ),
                ErrorCategory::Resource => (
                    RecoveryStrategy::QueueAndWait,
                    ErrorSeverity::High,
                    None,
                    Some(300),
                    false,
                    false,
                ),
                ErrorCategory::Validation => (
                    RecoveryStrategy::FailFast,
                    ErrorSeverity::Medium,
                    None,
                    None,
                    true,
                    false,
                ),
                ErrorCategory::Permanent => (
                    RecoveryStrategy::DeadLetter,
                    ErrorSeverity::Critical,
                    None,
                    None,
                    false,
                    true,
                ),
                ErrorCategory::Unknown => (
                    RecoveryStrategy::RetryOnce,
                    ErrorSeverity::Medium,
                    Some(1),
                    None,
                    false,
                    false,
                ),
            };

        ErrorClassification {
            category,
            strategy,
            error_kind: failure.kind,
            message: failure.message.clone(),
            recoverable: category.recoverable(),
            severity,
            max_retries,
            wait_time_secs,
            notify_user,
            alert_admin,
            timestamp: Utc::now(),
        }
    }
}

fn kind_category(kind: RawErrorKind) -> Option<ErrorCategory> {
    match kind {
        RawErrorKind::Connection | RawErrorKind::Timeout => Some(ErrorCategory::Transient),
        RawErrorKind::Memory => Some(ErrorCategory::Resource),
        RawErrorKind::Value | RawErrorKind::Type => Some(ErrorCategory::Validation),
        RawErrorKind::Permission | RawErrorKind::NotImplemented => Some(ErrorCategory::Permanent),
        RawErrorKind::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_table_wins_over_message() {
        let classifier = ErrorClassifier::new();
        // Message looks permanent, but the kind says connection.
        let failure = TaskFailure::new(RawErrorKind::Connection, "permission denied upstream");
        let classification = classifier.classify(&failure);
        assert_eq!(classification.category, ErrorCategory::Transient);
        assert_eq!(classification.strategy, RecoveryStrategy::RetryWithBackoff);
        assert!(classification.recoverable);
        assert_eq!(classification.max_retries, Some(3));
    }

    #[test]
    fn transient_patterns_match_case_insensitively() {
        let classifier = ErrorClassifier::new();
        let failure = TaskFailure::other("Connection RESET by peer");
        let classification = classifier.classify(&failure);
        assert_eq!(classification.category, ErrorCategory::Transient);
        assert_eq!(classification.severity, ErrorSeverity::Low);
    }

    #[test]
    fn oom_routes_to_queue_and_wait() {
        let classifier = ErrorClassifier::new();
        let failure = TaskFailure::other("CUDA out of memory: tried to allocate 2.5 GiB");
        let classification = classifier.classify(&failure);
        assert_eq!(classification.category, ErrorCategory::Resource);
        assert_eq!(classification.strategy, RecoveryStrategy::QueueAndWait);
        assert_eq!(classification.wait_time_secs, Some(300));
        assert!(classification.recoverable);
    }

    #[test]
    fn validation_notifies_user_and_never_retries() {
        let classifier = ErrorClassifier::new();
        let failure = TaskFailure::other("validation failed: prompt must not be empty");
        let classification = classifier.classify(&failure);
        assert_eq!(classification.category, ErrorCategory::Validation);
        assert_eq!(classification.strategy, RecoveryStrategy::FailFast);
        assert!(classification.notify_user);
        assert!(!classification.recoverable);
    }

    #[test]
    fn permanent_alerts_admin() {
        let classifier = ErrorClassifier::new();
        let failure = TaskFailure::other("model not found: sdxl-turbo");
        let classification = classifier.classify(&failure);
        assert_eq!(classification.category, ErrorCategory::Permanent);
        assert_eq!(classification.strategy, RecoveryStrategy::DeadLetter);
        assert_eq!(classification.severity, ErrorSeverity::Critical);
        assert!(classification.alert_admin);
    }

    #[test]
    fn unmatched_message_is_unknown_retry_once() {
        let classifier = ErrorClassifier::new();
        let failure = TaskFailure::other("flux capacitor misaligned");
        let classification = classifier.classify(&failure);
        assert_eq!(classification.category, ErrorCategory::Unknown);
        assert_eq!(classification.strategy, RecoveryStrategy::RetryOnce);
        assert_eq!(classification.max_retries, Some(1));
        assert!(!classification.recoverable);
    }

    #[test]
    fn memory_kind_is_resource() {
        let classifier = ErrorClassifier::new();
        let failure = TaskFailure::new(RawErrorKind::Memory, "allocation failure");
        assert_eq!(
            classifier.classify(&failure).category,
            ErrorCategory::Resource
        );
    }
}
