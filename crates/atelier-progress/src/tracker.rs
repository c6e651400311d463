use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use atelier_store::{EventBus, StateStore};
use atelier_types::{StageStatus, TaskStatus};

use crate::eta::{EtaPredictor, TaskHistoryEntry};
use crate::model::{progress_store_key, StageProgress, TaskProgress, PROGRESS_TTL_SECS};
use crate::preview::PreviewGenerator;
use crate::stages::{normalized_weights, should_skip_stage, StageCatalog};
use crate::ProgressError;

/// Aggregated progress over a set of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: String,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub overall_progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<chrono::DateTime<Utc>>,
    pub task_summaries: Vec<Value>,
}

/// Per-task stage machine with persistence and event fan-out. All mutation
/// paths serialize through a per-task lock; the shared store is the source
/// of truth across processes.
pub struct ProgressTracker {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    pub stages: StageCatalog,
    pub eta: EtaPredictor,
    preview: PreviewGenerator,
    cache: RwLock<HashMap<String, TaskProgress>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn StateStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            stages: StageCatalog::new(),
            eta: EtaPredictor::new(),
            preview: PreviewGenerator::new(),
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Initialize tracking for a task. Stage metadata flags may mark
    /// optional stages skipped up front.
    pub async fn create(
        &self,
        task_id: &str,
        template_id: &str,
        category: &str,
        quality: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<TaskProgress, ProgressError> {
        let definitions = self.stages.stages_for(template_id, category).await;
        let weights = normalized_weights(&definitions);
        let context = metadata.clone().unwrap_or_default();
        let stages: Vec<StageProgress> = definitions
            .iter()
            .zip(weights)
            .map(|(definition, weight)| {
                let mut stage = StageProgress::from_definition(definition, weight);
                if should_skip_stage(definition, &context) {
                    stage.status = StageStatus::Skipped;
                }
                stage
            })
            .collect();

        let mut progress = TaskProgress::new(task_id, template_id, category, quality, stages);
        progress.push_log(
            "info",
            "task created",
            None,
            metadata.unwrap_or_default(),
        );
        progress.recompute_overall();

        self.persist(&progress).await?;
        self.bus.publish(progress.to_update_event());
        Ok(progress)
    }

    /// Update one stage. Progress is clamped to [0, 1]; the first
    /// `in_progress` transition stamps start times; terminal stage statuses
    /// stamp completion. Task status is derived, never written directly.
    pub async fn update_stage(
        &self,
        task_id: &str,
        stage_index: usize,
        status: StageStatus,
        progress: f64,
        message: Option<String>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<TaskProgress, ProgressError> {
        let lock = self.task_lock(task_id).await;
        let _guard = lock.lock().await;

        let mut record = self
            .load(task_id)
            .await?
            .ok_or_else(|| ProgressError::NotFound {
                task_id: task_id.to_string(),
            })?;

        if record.status.is_terminal() {
            debug!(task_id, "ignoring stage update for terminal task");
            return Ok(record);
        }

        let total = record.stages.len();
        let stage = record
            .stages
            .get_mut(stage_index)
            .ok_or(ProgressError::InvalidStage {
                task_id: task_id.to_string(),
                index: stage_index,
                total,
            })?;

        let clamped = progress.clamp(0.0, 1.0);
        stage.status = status;
        stage.progress = clamped;
        if let Some(message) = &message {
            stage.message = Some(message.clone());
        }
        if let Some(metadata) = &metadata {
            for (key, value) in metadata {
                stage.metadata.insert(key.clone(), value.clone());
            }
        }

        let now = Utc::now();
        match status {
            StageStatus::InProgress => {
                if stage.started_at.is_none() {
                    stage.started_at = Some(now);
                }
                if record.started_at.is_none() {
                    record.started_at = Some(now);
                }
            }
            StageStatus::Completed | StageStatus::Failed => {
                if stage.completed_at.is_none() {
                    stage.completed_at = Some(now);
                }
            }
            _ => {}
        }

        let stage_name = record.stages[stage_index].name.clone();
        record.current_stage = stage_index;
        record.status = record.derive_status();
        record.recompute_overall();
        record.updated_at = now;

        let level = if status == StageStatus::Failed { "error" } else { "info" };
        let mut log_metadata = Map::new();
        log_metadata.insert("progress".to_string(), serde_json::json!(clamped));
        record.push_log(
            level,
            format!("stage '{stage_name}' {}", status_label(status)),
            Some(stage_index),
            log_metadata,
        );

        if status == StageStatus::Failed {
            if let Some(message) = message {
                record.error = Some(message);
            }
        }

        if status == StageStatus::InProgress {
            let prediction = self
                .eta
                .predict(
                    &record.template_id,
                    &record.quality,
                    stage_index,
                    clamped,
                    record.stages.len(),
                )
                .await;
            record.eta = Some(prediction.eta);

            if let Some(reference) = self
                .preview
                .maybe_generate(task_id, &record.category, &stage_name, clamped)
                .await
            {
                record.preview_url = Some(reference);
            }
        }

        self.persist(&record).await?;
        self.bus.publish(record.to_update_event());
        Ok(record)
    }

    /// Force completion: every remaining stage completes, history is
    /// recorded, and the terminal event carries the outputs. No-op on an
    /// already-terminal task.
    pub async fn complete(
        &self,
        task_id: &str,
        outputs: Option<&Value>,
    ) -> Result<TaskProgress, ProgressError> {
        let lock = self.task_lock(task_id).await;
        let _guard = lock.lock().await;

        let mut record = self
            .load(task_id)
            .await?
            .ok_or_else(|| ProgressError::NotFound {
                task_id: task_id.to_string(),
            })?;

        if record.status.is_terminal() {
            return Ok(record);
        }

        let now = Utc::now();
        if record.started_at.is_none() {
            record.started_at = Some(now);
        }
        for stage in &mut record.stages {
            if matches!(stage.status, StageStatus::Pending | StageStatus::InProgress) {
                stage.status = StageStatus::Completed;
                stage.progress = 1.0;
                if stage.started_at.is_none() {
                    stage.started_at = Some(now);
                }
                if stage.completed_at.is_none() {
                    stage.completed_at = Some(now);
                }
            }
        }
        record.current_stage = record.stages.len().saturating_sub(1);
        record.status = record.derive_status();
        record.completed_at = Some(now);
        record.updated_at = now;
        record.recompute_overall();

        if let Some(total) = record.total_duration_secs() {
            self.eta
                .record_completion(TaskHistoryEntry {
                    task_id: record.task_id.clone(),
                    template_id: record.template_id.clone(),
                    quality: record.quality.clone(),
                    stage_durations: record.stage_durations(),
                    total_duration: total,
                    completed_at: now,
                    success: true,
                })
                .await;
        }
        self.preview.cleanup_task(task_id).await;

        self.persist(&record).await?;
        self.bus.publish(record.to_terminal_event(outputs));
        Ok(record)
    }

    /// Mark the task failed at `stage_index` (default: current stage).
    pub async fn fail(
        &self,
        task_id: &str,
        error: &str,
        stage_index: Option<usize>,
    ) -> Result<TaskProgress, ProgressError> {
        let lock = self.task_lock(task_id).await;
        let _guard = lock.lock().await;

        let mut record = self
            .load(task_id)
            .await?
            .ok_or_else(|| ProgressError::NotFound {
                task_id: task_id.to_string(),
            })?;

        if record.status.is_terminal() {
            return Ok(record);
        }

        let now = Utc::now();
        let index = stage_index
            .unwrap_or(record.current_stage)
            .min(record.stages.len().saturating_sub(1));
        if let Some(stage) = record.stages.get_mut(index) {
            stage.status = StageStatus::Failed;
            stage.completed_at = Some(now);
            stage.message = Some(error.to_string());
        }
        record.current_stage = index;
        record.error = Some(error.to_string());
        record.status = record.derive_status();
        record.completed_at = Some(now);
        record.updated_at = now;
        record.recompute_overall();
        record.push_log("error", error.to_string(), Some(index), Map::new());

        self.preview.cleanup_task(task_id).await;
        self.persist(&record).await?;
        self.bus.publish(record.to_terminal_event(None));
        Ok(record)
    }

    /// Cancel a task. Cancelling an already-terminal task is a successful
    /// no-op; an unknown task is not.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, ProgressError> {
        let lock = self.task_lock(task_id).await;
        let _guard = lock.lock().await;

        let Some(mut record) = self.load(task_id).await? else {
            return Ok(false);
        };
        if record.status.is_terminal() {
            return Ok(true);
        }

        let now = Utc::now();
        record.status = TaskStatus::Cancelled;
        record.completed_at = Some(now);
        record.updated_at = now;
        record.push_log("info", "task cancelled", None, Map::new());

        self.preview.cleanup_task(task_id).await;
        self.persist(&record).await?;
        self.bus.publish(record.to_terminal_event(None));
        Ok(true)
    }

    pub async fn update_resource_usage(
        &self,
        task_id: &str,
        usage: HashMap<String, f64>,
    ) -> Result<(), ProgressError> {
        let lock = self.task_lock(task_id).await;
        let _guard = lock.lock().await;

        let Some(mut record) = self.load(task_id).await? else {
            return Ok(());
        };
        record.resource_usage = usage;
        record.updated_at = Utc::now();
        self.persist(&record).await?;
        self.bus.publish(record.to_update_event());
        Ok(())
    }

    pub async fn add_log(
        &self,
        task_id: &str,
        level: &str,
        message: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<(), ProgressError> {
        let lock = self.task_lock(task_id).await;
        let _guard = lock.lock().await;

        let Some(mut record) = self.load(task_id).await? else {
            return Ok(());
        };
        record.push_log(level, message, None, metadata.unwrap_or_default());
        record.updated_at = Utc::now();
        self.persist(&record).await
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<TaskProgress>, ProgressError> {
        self.load(task_id).await
    }

    /// Task logs, newest last, optionally filtered by level.
    pub async fn logs(
        &self,
        task_id: &str,
        level: Option<&str>,
    ) -> Result<Vec<crate::model::LogEntry>, ProgressError> {
        let Some(record) = self.load(task_id).await? else {
            return Ok(Vec::new());
        };
        Ok(record
            .logs
            .into_iter()
            .filter(|entry| level.map(|level| entry.level == level).unwrap_or(true))
            .collect())
    }

    /// Tasks currently cached in this process that are not terminal.
    pub async fn active(&self) -> Vec<TaskProgress> {
        self.cache
            .read()
            .await
            .values()
            .filter(|p| !p.status.is_terminal())
            .cloned()
            .collect()
    }

    pub async fn batch(&self, batch_id: &str, task_ids: &[String]) -> BatchProgress {
        let mut records = Vec::new();
        for task_id in task_ids {
            if let Ok(Some(record)) = self.load(task_id).await {
                records.push(record);
            }
        }

        let total_tasks = records.len();
        let completed_tasks = records
            .iter()
            .filter(|p| p.status == TaskStatus::Completed)
            .count();
        let failed_tasks = records
            .iter()
            .filter(|p| p.status == TaskStatus::Failed)
            .count();
        let overall_progress = if total_tasks == 0 {
            0.0
        } else {
            records.iter().map(|p| p.overall_progress).sum::<f64>() / total_tasks as f64
        };
        let eta = records
            .iter()
            .filter(|p| !p.status.is_terminal())
            .filter_map(|p| p.eta)
            .max();
        let task_summaries = records
            .iter()
            .map(|p| {
                serde_json::json!({
                    "task_id": p.task_id,
                    "status": p.status,
                    "progress": p.overall_progress,
                    "current_stage": p.current_stage,
                    "eta": p.eta,
                })
            })
            .collect();

        BatchProgress {
            batch_id: batch_id.to_string(),
            total_tasks,
            completed_tasks,
            failed_tasks,
            overall_progress,
            eta,
            task_summaries,
        }
    }

    /// Drop the in-process cache entry and per-task lock. The persisted
    /// record ages out via its store TTL.
    pub async fn evict(&self, task_id: &str) {
        self.cache.write().await.remove(task_id);
        self.locks.lock().await.remove(task_id);
        self.preview.cleanup_task(task_id).await;
    }

    async fn load(&self, task_id: &str) -> Result<Option<TaskProgress>, ProgressError> {
        if let Some(record) = self.cache.read().await.get(task_id) {
            return Ok(Some(record.clone()));
        }
        let Some(raw) = self.store.get(&progress_store_key(task_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<TaskProgress>(&raw) {
            Ok(record) => {
                self.cache
                    .write()
                    .await
                    .insert(task_id.to_string(), record.clone());
                Ok(Some(record))
            }
            Err(err) => {
                warn!(task_id, error = %err, "corrupt progress record in store");
                Ok(None)
            }
        }
    }

    async fn persist(&self, record: &TaskProgress) -> Result<(), ProgressError> {
        let raw = serde_json::to_string(record).map_err(atelier_store::StoreError::from)?;
        self.store
            .set(
                &progress_store_key(&record.task_id),
                raw,
                Some(Duration::from_secs(PROGRESS_TTL_SECS)),
            )
            .await?;
        self.cache
            .write()
            .await
            .insert(record.task_id.clone(), record.clone());
        Ok(())
    }
}

fn status_label(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Pending => "pending",
        StageStatus::InProgress => "in_progress",
        StageStatus::Completed => "completed",
        StageStatus::Failed => "failed",
        StageStatus::Skipped => "skipped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_store::MemoryStore;
    use atelier_types::EngineEvent;

    fn collect_events(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn tracker() -> (ProgressTracker, EventBus) {
        let bus = EventBus::new();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        (ProgressTracker::new(store, bus.clone()), bus)
    }

    #[tokio::test]
    async fn create_builds_category_stages_and_persists() {
        let (tracker, _bus) = tracker();
        let progress = tracker
            .create("t-1", "image_gen", "image_generation", "standard", None)
            .await
            .unwrap();
        assert_eq!(progress.stages.len(), 4);
        assert_eq!(progress.status, TaskStatus::Queued);
        assert_eq!(progress.overall_progress, 0.0);

        let loaded = tracker.get("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.stages[2].name, "generation");
    }

    #[tokio::test]
    async fn update_clamps_progress_and_derives_status() {
        let (tracker, _bus) = tracker();
        tracker
            .create("t-1", "image_gen", "image_generation", "standard", None)
            .await
            .unwrap();

        let record = tracker
            .update_stage("t-1", 2, StageStatus::InProgress, 1.2, None, None)
            .await
            .unwrap();
        assert_eq!(record.stages[2].progress, 1.0);
        assert_eq!(record.status, TaskStatus::Executing);
        assert!(record.started_at.is_some());
        assert!(record.eta.is_some());

        let record = tracker
            .update_stage("t-1", 2, StageStatus::InProgress, -0.1, None, None)
            .await
            .unwrap();
        assert_eq!(record.stages[2].progress, 0.0);
    }

    #[tokio::test]
    async fn out_of_range_stage_errors() {
        let (tracker, _bus) = tracker();
        tracker
            .create("t-1", "image_gen", "image_generation", "standard", None)
            .await
            .unwrap();
        let err = tracker
            .update_stage("t-1", 9, StageStatus::InProgress, 0.1, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProgressError::InvalidStage { index: 9, .. }));
    }

    #[tokio::test]
    async fn overall_progress_invariant_holds_across_updates() {
        let (tracker, _bus) = tracker();
        tracker
            .create("t-1", "image_gen", "image_generation", "standard", None)
            .await
            .unwrap();
        tracker
            .update_stage("t-1", 0, StageStatus::Completed, 1.0, None, None)
            .await
            .unwrap();
        tracker
            .update_stage("t-1", 1, StageStatus::Completed, 1.0, None, None)
            .await
            .unwrap();
        let record = tracker
            .update_stage("t-1", 2, StageStatus::InProgress, 0.5, None, None)
            .await
            .unwrap();
        assert_eq!(record.overall_progress, 55.0);
    }

    #[tokio::test]
    async fn complete_marks_all_stages_and_reaches_100() {
        let (tracker, bus) = tracker();
        let mut rx = bus.subscribe();
        tracker
            .create("t-1", "image_gen", "image_generation", "standard", None)
            .await
            .unwrap();
        tracker
            .update_stage("t-1", 2, StageStatus::InProgress, 0.9, None, None)
            .await
            .unwrap();
        let record = tracker
            .complete("t-1", Some(&serde_json::json!({"image": "out.png"})))
            .await
            .unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.overall_progress, 100.0);
        assert_eq!(tracker.eta.history_len().await, 1);

        let events = collect_events(&mut rx);
        let terminal = events.last().unwrap();
        assert_eq!(terminal.event, "progress.completed");
        assert_eq!(terminal.payload["outputs"]["image"], "out.png");
    }

    #[tokio::test]
    async fn fail_marks_stage_and_emits_failed_event() {
        let (tracker, bus) = tracker();
        let mut rx = bus.subscribe();
        tracker
            .create("t-1", "image_gen", "image_generation", "standard", None)
            .await
            .unwrap();
        tracker
            .update_stage("t-1", 2, StageStatus::InProgress, 0.4, None, None)
            .await
            .unwrap();
        let record = tracker.fail("t-1", "gpu exploded", None).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("gpu exploded"));
        assert_eq!(record.stages[2].status, StageStatus::Failed);

        let events = collect_events(&mut rx);
        let terminal = events.last().unwrap();
        assert_eq!(terminal.event, "progress.failed");
        assert_eq!(terminal.payload["error_message"], "gpu exploded");
    }

    #[tokio::test]
    async fn cancel_after_terminal_is_successful_noop() {
        let (tracker, _bus) = tracker();
        tracker
            .create("t-1", "image_gen", "image_generation", "standard", None)
            .await
            .unwrap();
        tracker.complete("t-1", None).await.unwrap();
        assert!(tracker.cancel("t-1").await.unwrap());
        let record = tracker.get("t-1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_unknown_task_returns_false() {
        let (tracker, _bus) = tracker();
        assert!(!tracker.cancel("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn updates_after_terminal_are_ignored() {
        let (tracker, _bus) = tracker();
        tracker
            .create("t-1", "image_gen", "image_generation", "standard", None)
            .await
            .unwrap();
        tracker.cancel("t-1").await.unwrap();
        let record = tracker
            .update_stage("t-1", 2, StageStatus::InProgress, 0.5, None, None)
            .await
            .unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn skip_flags_mark_stages_at_creation() {
        let (tracker, _bus) = tracker();
        let mut metadata = Map::new();
        metadata.insert("skip_post_processing".to_string(), serde_json::json!(true));
        let progress = tracker
            .create("t-1", "image_gen", "image_generation", "standard", Some(metadata))
            .await
            .unwrap();
        assert_eq!(progress.stages[3].status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn preview_reference_set_at_interval() {
        let (tracker, _bus) = tracker();
        tracker
            .create("t-1", "image_gen", "image_generation", "standard", None)
            .await
            .unwrap();
        let record = tracker
            .update_stage("t-1", 2, StageStatus::InProgress, 0.5, None, None)
            .await
            .unwrap();
        assert_eq!(record.preview_url.as_deref(), Some("preview://t-1/50"));
    }

    #[tokio::test]
    async fn logs_filter_by_level() {
        let (tracker, _bus) = tracker();
        tracker
            .create("t-1", "image_gen", "image_generation", "standard", None)
            .await
            .unwrap();
        tracker
            .add_log("t-1", "error", "worker hiccup", None)
            .await
            .unwrap();

        let all = tracker.logs("t-1", None).await.unwrap();
        assert_eq!(all.len(), 2);
        let errors = tracker.logs("t-1", Some("error")).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "worker hiccup");
        assert!(tracker.logs("ghost", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_aggregates_tasks() {
        let (tracker, _bus) = tracker();
        tracker
            .create("t-1", "image_gen", "image_generation", "standard", None)
            .await
            .unwrap();
        tracker
            .create("t-2", "image_gen", "image_generation", "standard", None)
            .await
            .unwrap();
        tracker.complete("t-1", None).await.unwrap();

        let batch = tracker
            .batch("b-1", &["t-1".to_string(), "t-2".to_string()])
            .await;
        assert_eq!(batch.total_tasks, 2);
        assert_eq!(batch.completed_tasks, 1);
        assert_eq!(batch.overall_progress, 50.0);
    }

    #[tokio::test]
    async fn progress_survives_cache_eviction_via_store() {
        let (tracker, _bus) = tracker();
        tracker
            .create("t-1", "image_gen", "image_generation", "standard", None)
            .await
            .unwrap();
        tracker
            .update_stage("t-1", 0, StageStatus::Completed, 1.0, None, None)
            .await
            .unwrap();
        tracker.evict("t-1").await;
        let reloaded = tracker.get("t-1").await.unwrap().unwrap();
        assert_eq!(reloaded.stages[0].status, StageStatus::Completed);
        assert_eq!(reloaded.logs.len(), 2);
    }
}
