use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use atelier_types::{progress_events, EngineEvent, StageStatus, TaskStatus};

use crate::stages::StageDefinition;

pub const MAX_LOG_ENTRIES: usize = 1000;
pub const PROGRESS_TTL_SECS: u64 = 24 * 3600;

pub fn progress_store_key(task_id: &str) -> String {
    format!("progress:{task_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageProgress {
    pub name: String,
    pub description: String,
    pub weight: f64,
    pub status: StageStatus,
    /// Stage-local progress in [0, 1].
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageProgress {
    pub fn from_definition(definition: &StageDefinition, weight: f64) -> Self {
        Self {
            name: definition.name.clone(),
            description: definition.description.clone(),
            weight,
            status: StageStatus::Pending,
            progress: 0.0,
            message: None,
            metadata: Map::new(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    fn effective_progress(&self) -> f64 {
        match self.status {
            StageStatus::Completed | StageStatus::Skipped => 1.0,
            StageStatus::InProgress => self.progress,
            StageStatus::Pending | StageStatus::Failed => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<usize>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// The full progress record for one task. Persisted as JSON under
/// `progress:{task_id}` with a 24 h TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub template_id: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub quality: String,
    pub status: TaskStatus,
    pub current_stage: usize,
    pub stages: Vec<StageProgress>,
    /// Overall task progress in [0, 100].
    pub overall_progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub resource_usage: HashMap<String, f64>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskProgress {
    pub fn new(
        task_id: impl Into<String>,
        template_id: impl Into<String>,
        category: impl Into<String>,
        quality: impl Into<String>,
        stages: Vec<StageProgress>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            template_id: template_id.into(),
            category: category.into(),
            quality: quality.into(),
            status: TaskStatus::Queued,
            current_stage: 0,
            stages,
            overall_progress: 0.0,
            eta: None,
            preview_url: None,
            resource_usage: HashMap::new(),
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Weighted overall progress on the [0, 100] scale, rounded to a whole
    /// percent. Weights are treated as already normalized.
    pub fn recompute_overall(&mut self) {
        let weighted: f64 = self
            .stages
            .iter()
            .map(|stage| stage.weight * stage.effective_progress())
            .sum();
        self.overall_progress = (weighted * 100.0).round().clamp(0.0, 100.0);
    }

    /// Task status derived from stage statuses; never written independently.
    pub fn derive_status(&self) -> TaskStatus {
        if self.status == TaskStatus::Cancelled {
            return TaskStatus::Cancelled;
        }
        if self.stages.iter().any(|s| s.status == StageStatus::Failed) {
            return TaskStatus::Failed;
        }
        if !self.stages.is_empty()
            && self
                .stages
                .iter()
                .all(|s| matches!(s.status, StageStatus::Completed | StageStatus::Skipped))
        {
            return TaskStatus::Completed;
        }

        let Some(current) = self.stages.get(self.current_stage) else {
            return TaskStatus::Executing;
        };
        let name = current.name.as_str();
        if name.contains("queue") {
            TaskStatus::Queued
        } else if matches!(name, "preparation" | "model_loading" | "context_loading") {
            TaskStatus::Preparing
        } else if matches!(name, "generation" | "frame_generation" | "synthesis" | "execution") {
            TaskStatus::Executing
        } else if matches!(
            name,
            "finalization" | "post_processing" | "video_encoding" | "normalization" | "formatting"
        ) {
            TaskStatus::Finalizing
        } else {
            TaskStatus::Executing
        }
    }

    /// Append a log entry, evicting oldest-first past the cap.
    pub fn push_log(
        &mut self,
        level: &str,
        message: impl Into<String>,
        stage: Option<usize>,
        metadata: Map<String, Value>,
    ) {
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: message.into(),
            stage,
            metadata,
        });
        if self.logs.len() > MAX_LOG_ENTRIES {
            let excess = self.logs.len() - MAX_LOG_ENTRIES;
            self.logs.drain(0..excess);
        }
    }

    pub fn stage_durations(&self) -> HashMap<usize, f64> {
        self.stages
            .iter()
            .enumerate()
            .filter_map(|(index, stage)| stage.duration_secs().map(|d| (index, d)))
            .collect()
    }

    pub fn total_duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    /// Payload for `progress.update` events.
    pub fn to_update_event(&self) -> EngineEvent {
        let stages: Map<String, Value> = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, stage)| {
                (
                    index.to_string(),
                    json!({
                        "name": stage.name,
                        "status": stage.status,
                        "progress": stage.progress,
                        "message": stage.message,
                    }),
                )
            })
            .collect();

        EngineEvent::new(
            progress_events::UPDATE,
            json!({
                "task_id": self.task_id,
                "status": self.status,
                "current_stage": self.current_stage,
                "overall_progress": self.overall_progress,
                "eta": self.eta,
                "stages": stages,
                "preview_url": self.preview_url,
                "resource_usage": self.resource_usage,
                "message": self.stages.get(self.current_stage).and_then(|s| s.message.clone()),
                "updated_at": self.updated_at,
            }),
        )
    }

    pub fn to_terminal_event(&self, outputs: Option<&Value>) -> EngineEvent {
        let event = match self.status {
            TaskStatus::Completed => progress_events::COMPLETED,
            TaskStatus::Cancelled => progress_events::CANCELLED,
            _ => progress_events::FAILED,
        };
        EngineEvent::new(
            event,
            json!({
                "task_id": self.task_id,
                "status": self.status,
                "overall_progress": self.overall_progress,
                "outputs": outputs,
                "error_message": self.error,
                "updated_at": self.updated_at,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{normalized_weights, stages_for_category};

    pub(crate) fn image_progress(task_id: &str) -> TaskProgress {
        let definitions = stages_for_category("image_generation");
        let weights = normalized_weights(&definitions);
        let stages = definitions
            .iter()
            .zip(weights)
            .map(|(d, w)| StageProgress::from_definition(d, w))
            .collect();
        TaskProgress::new(task_id, "image_gen", "image_generation", "standard", stages)
    }

    #[test]
    fn overall_progress_weighs_stages() {
        let mut progress = image_progress("t-1");
        progress.stages[0].status = StageStatus::Completed;
        progress.stages[1].status = StageStatus::Completed;
        progress.stages[2].status = StageStatus::InProgress;
        progress.stages[2].progress = 0.5;
        progress.recompute_overall();
        // 0.05 + 0.15 + 0.70*0.5 = 0.55
        assert_eq!(progress.overall_progress, 55.0);
    }

    #[test]
    fn skipped_stages_count_as_complete() {
        let mut progress = image_progress("t-1");
        for stage in &mut progress.stages {
            stage.status = StageStatus::Completed;
        }
        progress.stages[3].status = StageStatus::Skipped;
        progress.recompute_overall();
        assert_eq!(progress.overall_progress, 100.0);
        assert_eq!(progress.derive_status(), TaskStatus::Completed);
    }

    #[test]
    fn failed_stage_fails_the_task() {
        let mut progress = image_progress("t-1");
        progress.stages[2].status = StageStatus::Failed;
        assert_eq!(progress.derive_status(), TaskStatus::Failed);
    }

    #[test]
    fn status_follows_current_stage_name() {
        let mut progress = image_progress("t-1");
        progress.current_stage = 0;
        assert_eq!(progress.derive_status(), TaskStatus::Queued);
        progress.current_stage = 1;
        progress.stages[1].status = StageStatus::InProgress;
        assert_eq!(progress.derive_status(), TaskStatus::Preparing);
        progress.current_stage = 2;
        progress.stages[2].status = StageStatus::InProgress;
        assert_eq!(progress.derive_status(), TaskStatus::Executing);
        progress.current_stage = 3;
        progress.stages[3].status = StageStatus::InProgress;
        assert_eq!(progress.derive_status(), TaskStatus::Finalizing);
    }

    #[test]
    fn log_ring_evicts_oldest_first() {
        let mut progress = image_progress("t-1");
        for index in 0..(MAX_LOG_ENTRIES + 10) {
            progress.push_log("info", format!("entry {index}"), None, Map::new());
        }
        assert_eq!(progress.logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(progress.logs[0].message, "entry 10");
    }

    #[test]
    fn serde_round_trip_preserves_logs_and_stages() {
        let mut progress = image_progress("t-1");
        progress.push_log("info", "created", None, Map::new());
        progress.push_log("error", "hiccup", Some(2), Map::new());
        progress.stages[0].status = StageStatus::Completed;
        progress.recompute_overall();

        let raw = serde_json::to_string(&progress).unwrap();
        let back: TaskProgress = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.logs.len(), 2);
        assert_eq!(back.logs[1].message, "hiccup");
        assert_eq!(back.stages.len(), 4);
        assert_eq!(back.overall_progress, progress.overall_progress);
        assert_eq!(back.status, progress.status);
    }

    #[test]
    fn update_event_matches_schema() {
        let mut progress = image_progress("t-1");
        progress.recompute_overall();
        let event = progress.to_update_event();
        assert_eq!(event.event, "progress.update");
        assert_eq!(event.payload["task_id"], "t-1");
        assert!(event.payload["stages"]["0"]["name"].is_string());
    }
}
