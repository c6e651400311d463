use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    General,
    Gpu,
    Cpu,
    Io,
}

impl WorkerType {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerType::General => "general",
            WorkerType::Gpu => "gpu",
            WorkerType::Cpu => "cpu",
            WorkerType::Io => "io",
        }
    }

    pub fn all() -> [WorkerType; 4] {
        [
            WorkerType::General,
            WorkerType::Gpu,
            WorkerType::Cpu,
            WorkerType::Io,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Active,
    Idle,
    Busy,
    Stopping,
    Failed,
}

impl WorkerStatus {
    /// Statuses in which the worker holds a live ledger allocation and can
    /// be offered work.
    pub fn is_serving(self) -> bool {
        matches!(
            self,
            WorkerStatus::Active | WorkerStatus::Idle | WorkerStatus::Busy
        )
    }
}

/// One worker instance tracked by the pool manager and mirrored into the
/// shared directory under `worker:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub worker_type: WorkerType,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub tasks_failed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    pub resources: ResourceVector,
    #[serde(default)]
    pub queues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_since: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    pub fn new(
        id: impl Into<String>,
        worker_type: WorkerType,
        resources: ResourceVector,
        queues: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            worker_type,
            status: WorkerStatus::Starting,
            started_at: Utc::now(),
            last_heartbeat: None,
            tasks_completed: 0,
            tasks_failed: 0,
            current_task_id: None,
            resources,
            queues,
            idle_since: None,
        }
    }

    pub fn failure_ratio(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            return 0.0;
        }
        self.tasks_failed as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serving_statuses_hold_allocations() {
        assert!(WorkerStatus::Active.is_serving());
        assert!(WorkerStatus::Idle.is_serving());
        assert!(WorkerStatus::Busy.is_serving());
        assert!(!WorkerStatus::Starting.is_serving());
        assert!(!WorkerStatus::Stopping.is_serving());
        assert!(!WorkerStatus::Failed.is_serving());
    }

    #[test]
    fn failure_ratio_handles_zero_history() {
        let record = WorkerRecord::new(
            "worker_general_0001",
            WorkerType::General,
            ResourceVector::default(),
            vec!["default".to_string()],
        );
        assert_eq!(record.failure_ratio(), 0.0);
    }

    #[test]
    fn worker_record_serializes_type_field() {
        let record = WorkerRecord::new(
            "worker_gpu_0001",
            WorkerType::Gpu,
            ResourceVector::new(2.0, 4.0, 8.0, 1),
            vec!["gpu".to_string(), "generation".to_string()],
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "gpu");
        assert_eq!(value["status"], "starting");
    }
}
