use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    FileUpload,
    ResourceAllocation,
    TaskSubmission,
    ModelLoading,
    OutputGeneration,
    DatabaseWrite,
    QueueOperation,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::FileUpload => "file_upload",
            OperationKind::ResourceAllocation => "resource_allocation",
            OperationKind::TaskSubmission => "task_submission",
            OperationKind::ModelLoading => "model_loading",
            OperationKind::OutputGeneration => "output_generation",
            OperationKind::DatabaseWrite => "database_write",
            OperationKind::QueueOperation => "queue_operation",
        }
    }
}

/// A side-effecting operation that may need undoing if its task is
/// abandoned. `data` carries the kind-specific fields (paths, ids).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: String,
    pub kind: OperationKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    pub fn new(kind: OperationKind, data: Value) -> Self {
        Self {
            operation_id: fresh_operation_id(),
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

// Operation ids only need uniqueness within the failure log.
fn fresh_operation_id() -> String {
    format!("op_{:032x}", rand::random::<u128>())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationResult {
    pub success: bool,
    pub operation_kind: OperationKind,
    pub action_taken: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CompensationResult {
    fn ok(kind: OperationKind, action: impl Into<String>) -> Self {
        Self {
            success: true,
            operation_kind: kind,
            action_taken: action.into(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    fn failed(kind: OperationKind, action: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            operation_kind: kind,
            action_taken: action.into(),
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedCompensation {
    pub operation: Operation,
    pub original_error: String,
    pub compensation_error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompensationStats {
    pub total_compensations: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub failed_compensations_pending: usize,
}

/// Side-effect undo hooks, implemented by the services that own the
/// side effects. The engine itself never touches artifact bytes.
#[async_trait]
pub trait CompensationHooks: Send + Sync {
    /// Remove a partial artifact; `Ok(false)` when it did not exist.
    async fn remove_artifact(&self, path: &str) -> Result<bool, String>;
    async fn release_allocation(&self, allocation_id: &str) -> Result<(), String>;
    /// `Ok(false)` when the task had already left the queue.
    async fn cancel_queued_task(&self, task_id: &str, queue: &str) -> Result<bool, String>;
    async fn unload_model(&self, model_id: &str, gpu_id: Option<&str>) -> Result<(), String>;
    async fn rollback_transaction(&self, transaction_id: &str) -> Result<(), String>;
    async fn remove_queued_message(&self, queue: &str, message_id: &str) -> Result<(), String>;
}

/// Best-effort undo of partial side-effects. Never throws: a failing hook
/// is recorded for manual intervention and reported as `success = false`.
pub struct CompensationManager {
    hooks: Arc<dyn CompensationHooks>,
    history: Mutex<Vec<CompensationResult>>,
    failed: Mutex<Vec<FailedCompensation>>,
}

impl CompensationManager {
    pub fn new(hooks: Arc<dyn CompensationHooks>) -> Self {
        Self {
            hooks,
            history: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
        }
    }

    pub async fn compensate(&self, operation: &Operation, original_error: &str) -> CompensationResult {
        let result = match operation.kind {
            OperationKind::FileUpload => self.undo_file_upload(operation).await,
            OperationKind::ResourceAllocation => self.undo_resource_allocation(operation).await,
            OperationKind::TaskSubmission => self.undo_task_submission(operation).await,
            OperationKind::ModelLoading => self.undo_model_loading(operation).await,
            OperationKind::OutputGeneration => self.undo_output_generation(operation).await,
            OperationKind::DatabaseWrite => self.undo_database_write(operation).await,
            OperationKind::QueueOperation => self.undo_queue_operation(operation).await,
        };

        if result.success {
            info!(
                operation = operation.kind.as_str(),
                action = %result.action_taken,
                "compensated failed operation"
            );
        } else {
            error!(
                operation = operation.kind.as_str(),
                error = result.error.as_deref().unwrap_or(""),
                "compensation failed, recorded for manual intervention"
            );
            self.failed.lock().await.push(FailedCompensation {
                operation: operation.clone(),
                original_error: original_error.to_string(),
                compensation_error: result.error.clone().unwrap_or_default(),
                timestamp: Utc::now(),
            });
        }

        self.history.lock().await.push(result.clone());
        result
    }

    async fn undo_file_upload(&self, operation: &Operation) -> CompensationResult {
        let kind = operation.kind;
        let Some(file_path) = operation.data.get("file_path").and_then(Value::as_str) else {
            return CompensationResult::ok(kind, "no_file_to_clean");
        };

        match self.hooks.remove_artifact(file_path).await {
            Ok(removed) => {
                if let Some(temp_path) = operation.data.get("temp_path").and_then(Value::as_str) {
                    let _ = self.hooks.remove_artifact(temp_path).await;
                }
                if removed {
                    CompensationResult::ok(kind, format!("removed_file: {file_path}"))
                } else {
                    CompensationResult::ok(kind, "file_not_found")
                }
            }
            Err(err) => CompensationResult::failed(kind, "cleanup_failed", err),
        }
    }

    async fn undo_resource_allocation(&self, operation: &Operation) -> CompensationResult {
        let kind = operation.kind;
        let Some(allocation_id) = operation.data.get("allocation_id").and_then(Value::as_str)
        else {
            return CompensationResult::ok(kind, "no_allocation_to_release");
        };
        let resource_type = operation
            .data
            .get("resource_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        match self.hooks.release_allocation(allocation_id).await {
            Ok(()) => CompensationResult::ok(
                kind,
                format!("released_{resource_type}: {allocation_id}"),
            ),
            Err(err) => CompensationResult::failed(kind, "release_failed", err),
        }
    }

    async fn undo_task_submission(&self, operation: &Operation) -> CompensationResult {
        let kind = operation.kind;
        let Some(task_id) = operation.data.get("task_id").and_then(Value::as_str) else {
            return CompensationResult::ok(kind, "no_task_to_cancel");
        };
        let queue = operation
            .data
            .get("queue_name")
            .and_then(Value::as_str)
            .unwrap_or("default");

        match self.hooks.cancel_queued_task(task_id, queue).await {
            Ok(true) => CompensationResult::ok(kind, format!("cancelled_task: {task_id}")),
            Ok(false) => CompensationResult::ok(kind, format!("task_already_processed: {task_id}")),
            Err(err) => CompensationResult::failed(kind, "cancellation_failed", err),
        }
    }

    async fn undo_model_loading(&self, operation: &Operation) -> CompensationResult {
        let kind = operation.kind;
        let Some(model_id) = operation.data.get("model_id").and_then(Value::as_str) else {
            return CompensationResult::ok(kind, "no_model_to_unload");
        };
        let gpu_id = operation.data.get("gpu_id").and_then(Value::as_str);

        match self.hooks.unload_model(model_id, gpu_id).await {
            Ok(()) => CompensationResult::ok(kind, format!("unloaded_model: {model_id}")),
            Err(err) => CompensationResult::failed(kind, "unload_failed", err),
        }
    }

    async fn undo_output_generation(&self, operation: &Operation) -> CompensationResult {
        let kind = operation.kind;
        let paths: Vec<&str> = operation
            .data
            .get("output_paths")
            .and_then(Value::as_array)
            .map(|paths| paths.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        if paths.is_empty() {
            return CompensationResult::ok(kind, "no_outputs_to_clean");
        }

        let mut cleaned = 0usize;
        let mut failures = Vec::new();
        for path in paths {
            match self.hooks.remove_artifact(path).await {
                Ok(_) => cleaned += 1,
                Err(err) => failures.push(format!("{path}: {err}")),
            }
        }

        if failures.is_empty() {
            CompensationResult::ok(kind, format!("cleaned_outputs: {cleaned} files"))
        } else {
            CompensationResult::failed(
                kind,
                format!("partial_cleanup: cleaned={cleaned}, failed={}", failures.len()),
                failures.join("; "),
            )
        }
    }

    async fn undo_database_write(&self, operation: &Operation) -> CompensationResult {
        let kind = operation.kind;
        let Some(transaction_id) = operation.data.get("transaction_id").and_then(Value::as_str)
        else {
            return CompensationResult::ok(kind, "no_transaction_to_rollback");
        };

        match self.hooks.rollback_transaction(transaction_id).await {
            Ok(()) => CompensationResult::ok(kind, format!("rolled_back: {transaction_id}")),
            Err(err) => CompensationResult::failed(kind, "rollback_failed", err),
        }
    }

    async fn undo_queue_operation(&self, operation: &Operation) -> CompensationResult {
        let kind = operation.kind;
        let is_publish = operation.data.get("queue_operation").and_then(Value::as_str)
            == Some("publish");
        let message_id = operation.data.get("message_id").and_then(Value::as_str);

        match (is_publish, message_id) {
            (true, Some(message_id)) => {
                let queue = operation
                    .data
                    .get("queue_name")
                    .and_then(Value::as_str)
                    .unwrap_or("default");
                match self.hooks.remove_queued_message(queue, message_id).await {
                    Ok(()) => {
                        CompensationResult::ok(kind, format!("removed_message: {message_id}"))
                    }
                    Err(err) => CompensationResult::failed(kind, "message_removal_failed", err),
                }
            }
            _ => CompensationResult::ok(kind, "no_queue_action_needed"),
        }
    }

    pub async fn stats(&self) -> CompensationStats {
        let history = self.history.lock().await;
        let total = history.len();
        let successful = history.iter().filter(|r| r.success).count();
        CompensationStats {
            total_compensations: total,
            successful,
            failed: total - successful,
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            failed_compensations_pending: self.failed.lock().await.len(),
        }
    }

    /// Failed compensations awaiting manual intervention.
    pub async fn failed_compensations(&self) -> Vec<FailedCompensation> {
        self.failed.lock().await.clone()
    }
}

/// Hooks that ignore every undo request. Useful where a deployment has no
/// artifact store wired in yet.
pub struct NoopCompensationHooks;

#[async_trait]
impl CompensationHooks for NoopCompensationHooks {
    async fn remove_artifact(&self, path: &str) -> Result<bool, String> {
        warn!(path, "no artifact store configured; skipping removal");
        Ok(false)
    }

    async fn release_allocation(&self, _allocation_id: &str) -> Result<(), String> {
        Ok(())
    }

    async fn cancel_queued_task(&self, _task_id: &str, _queue: &str) -> Result<bool, String> {
        Ok(false)
    }

    async fn unload_model(&self, _model_id: &str, _gpu_id: Option<&str>) -> Result<(), String> {
        Ok(())
    }

    async fn rollback_transaction(&self, _transaction_id: &str) -> Result<(), String> {
        Ok(())
    }

    async fn remove_queued_message(&self, _queue: &str, _message_id: &str) -> Result<(), String> {
        Ok(())
    }
}
