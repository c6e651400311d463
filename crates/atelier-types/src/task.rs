use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Preparing,
    Executing,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// A submission as received from the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl SubmitRequest {
    pub fn new(template_id: impl Into<String>, inputs: Value) -> Self {
        Self {
            template_id: template_id.into(),
            version: None,
            inputs,
            quality: None,
            project_id: None,
            shot_id: None,
            user_id: None,
            priority: 0,
            metadata: None,
        }
    }
}

/// A validated task as it flows through the queue and the worker boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub template_id: String,
    pub template_version: String,
    pub category: String,
    pub inputs: Value,
    #[serde(default)]
    pub priority: i32,
    pub tracking_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl TaskSpec {
    pub fn new(
        template_id: impl Into<String>,
        template_version: impl Into<String>,
        category: impl Into<String>,
        inputs: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            template_id: template_id.into(),
            template_version: template_version.into(),
            category: category.into(),
            inputs,
            priority: 0,
            tracking_id: uuid::Uuid::new_v4().to_string(),
            project_id: None,
            shot_id: None,
            user_id: None,
            submitted_at: Utc::now(),
            retry_count: 0,
            previous_error: None,
            retry_delay_secs: None,
            metadata: None,
        }
    }
}

/// Returned to the caller as soon as a submission is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: String,
    pub tracking_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub template_id: String,
    pub status: TaskStatus,
    pub overall_progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Result of one worker execution, as reported back over the RPC boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outputs: Value,
    #[serde(default)]
    pub resource_usage: HashMap<String, f64>,
    pub duration_secs: f64,
}

/// An immutable, numbered artifact version produced by a successful task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Take {
    pub id: String,
    pub task_id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shot_id: Option<String>,
    pub number: u32,
    pub outputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}
