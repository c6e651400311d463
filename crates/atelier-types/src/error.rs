use serde::{Deserialize, Serialize};

/// Stable machine-readable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    ResourceNotFound,
    TaskError,
    WorkflowExecutionError,
    WorkflowTimeout,
    InsufficientResources,
    CircuitBreakerOpen,
    DispatchError,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// The only error shape the orchestrator hands to the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub details: ErrorDetails,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: ErrorDetails::default(),
        }
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }
}

/// Severity attached to classifications, system issues, and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

/// Coarse kind reported alongside a failure message by whatever raised it.
/// Classification consults this before falling back to message patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawErrorKind {
    Connection,
    Timeout,
    Memory,
    Value,
    Type,
    Permission,
    NotImplemented,
    Other,
}

impl RawErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RawErrorKind::Connection => "connection",
            RawErrorKind::Timeout => "timeout",
            RawErrorKind::Memory => "memory",
            RawErrorKind::Value => "value",
            RawErrorKind::Type => "type",
            RawErrorKind::Permission => "permission",
            RawErrorKind::NotImplemented => "not_implemented",
            RawErrorKind::Other => "other",
        }
    }
}

/// A failure observed at a component boundary, normalized for the
/// classification pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: RawErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: RawErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(RawErrorKind::Other, message)
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let payload = ErrorPayload::new(ErrorCode::InsufficientResources, "no vram");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["code"], "INSUFFICIENT_RESOURCES");
    }

    #[test]
    fn empty_details_serialize_to_empty_object() {
        let payload = ErrorPayload::new(ErrorCode::TaskError, "boom");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["details"], serde_json::json!({}));
    }

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
    }
}
