use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use atelier_faults::TaskResubmitter;
use atelier_pool::TaskQueue;
use atelier_types::{ExecutionResult, Take, TaskFailure, TaskSpec};

/// Streamed progress signals from a worker during execution.
#[derive(Debug, Clone)]
pub enum WorkerSignal {
    QueuePosition(u32),
    ModelLoading(f64),
    ExecutionProgress(f64),
    PostProcessing(f64),
    ResourceUsage(HashMap<String, f64>),
    Log { level: String, message: String },
}

/// The worker RPC boundary. The real implementation talks to a remote
/// inference runtime; the engine only sees inputs, signals, and results.
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    async fn execute(
        &self,
        task: &TaskSpec,
        signals: mpsc::Sender<WorkerSignal>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, TaskFailure>;
}

/// Artifact-version service; must hand out strictly increasing take numbers
/// per shot, starting at 1.
#[async_trait]
pub trait TakesService: Send + Sync {
    async fn create_take(
        &self,
        task_id: &str,
        project_id: &str,
        shot_id: Option<&str>,
        outputs: Value,
        metadata: Value,
    ) -> Result<Take, String>;
}

/// Project workspace lookups and housekeeping.
#[async_trait]
pub trait WorkspaceService: Send + Sync {
    async fn project_exists(&self, project_id: &str) -> bool;
    async fn resolve_asset(&self, project_id: &str, asset_id: &str) -> Result<String, String>;
    /// Housekeeping hooks used by self-healing; return the number of items
    /// affected.
    async fn cleanup_old_files(&self, days: u32) -> usize;
    async fn archive_old_projects(&self, days: u32) -> usize;
}

/// Resubmits retried tasks onto the main queue after their backoff delay.
pub struct QueueResubmitter {
    queue: Arc<TaskQueue>,
}

impl QueueResubmitter {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl TaskResubmitter for QueueResubmitter {
    async fn resubmit(&self, task: TaskSpec, delay: Duration) {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(task).await;
        });
    }
}

/// Cancellation tokens keyed by task id. Creating a token for an existing
/// task replaces the old one.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: RwLock<HashMap<String, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(task_id.to_string(), token.clone());
        token
    }

    pub async fn cancel(&self, task_id: &str) -> bool {
        match self.tokens.read().await.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, task_id: &str) {
        self.tokens.write().await.remove(task_id);
    }
}

/// In-memory takes service for tests and single-node runs; enforces the
/// monotonic per-shot numbering contract.
#[derive(Default)]
pub struct InMemoryTakes {
    counters: Mutex<HashMap<String, u32>>,
    created: Mutex<Vec<Take>>,
}

impl InMemoryTakes {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn takes(&self) -> Vec<Take> {
        self.created.lock().await.clone()
    }
}

#[async_trait]
impl TakesService for InMemoryTakes {
    async fn create_take(
        &self,
        task_id: &str,
        project_id: &str,
        shot_id: Option<&str>,
        outputs: Value,
        metadata: Value,
    ) -> Result<Take, String> {
        let counter_key = format!("{project_id}/{}", shot_id.unwrap_or("_renders"));
        let number = {
            let mut counters = self.counters.lock().await;
            let counter = counters.entry(counter_key).or_insert(0);
            *counter += 1;
            *counter
        };
        let take = Take {
            id: format!("take_{number:03}"),
            task_id: task_id.to_string(),
            project_id: project_id.to_string(),
            shot_id: shot_id.map(str::to_string),
            number,
            outputs,
            metadata: Some(metadata),
            created_at: chrono::Utc::now(),
        };
        self.created.lock().await.push(take.clone());
        Ok(take)
    }
}

/// Workspace fake backed by a fixed project set.
#[derive(Default)]
pub struct InMemoryWorkspace {
    pub projects: Vec<String>,
}

impl InMemoryWorkspace {
    pub fn with_projects(projects: &[&str]) -> Self {
        Self {
            projects: projects.iter().map(|p| p.to_string()).collect(),
        }
    }
}

#[async_trait]
impl WorkspaceService for InMemoryWorkspace {
    async fn project_exists(&self, project_id: &str) -> bool {
        self.projects.iter().any(|p| p == project_id)
    }

    async fn resolve_asset(&self, project_id: &str, asset_id: &str) -> Result<String, String> {
        if !self.project_exists(project_id).await {
            return Err(format!("unknown project '{project_id}'"));
        }
        Ok(format!("/workspace/{project_id}/assets/{asset_id}"))
    }

    async fn cleanup_old_files(&self, _days: u32) -> usize {
        0
    }

    async fn archive_old_projects(&self, _days: u32) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn take_numbers_increase_per_shot_from_one() {
        let takes = InMemoryTakes::new();
        let first = takes
            .create_take("t-1", "proj", Some("shot_010"), json!({}), json!({}))
            .await
            .unwrap();
        let second = takes
            .create_take("t-2", "proj", Some("shot_010"), json!({}), json!({}))
            .await
            .unwrap();
        let other_shot = takes
            .create_take("t-3", "proj", Some("shot_020"), json!({}), json!({}))
            .await
            .unwrap();

        assert_eq!(first.number, 1);
        assert_eq!(second.number, 2);
        assert_eq!(other_shot.number, 1);
        assert_eq!(first.id, "take_001");
    }

    #[tokio::test]
    async fn cancellation_registry_round_trip() {
        let registry = CancellationRegistry::new();
        let token = registry.create("t-1").await;
        assert!(!token.is_cancelled());
        assert!(registry.cancel("t-1").await);
        assert!(token.is_cancelled());
        assert!(!registry.cancel("ghost").await);
        registry.remove("t-1").await;
        assert!(!registry.cancel("t-1").await);
    }

    #[tokio::test]
    async fn queue_resubmitter_delays_then_pushes() {
        let queue = Arc::new(TaskQueue::new());
        let resubmitter = QueueResubmitter::new(queue.clone());
        let task = TaskSpec::new("image_gen", "1.0.0", "image_generation", json!({}));
        resubmitter
            .resubmit(task, Duration::from_millis(30))
            .await;
        assert_eq!(queue.depth().await, 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(queue.depth().await, 1);
    }

    #[tokio::test]
    async fn workspace_resolves_assets_for_known_projects() {
        let workspace = InMemoryWorkspace::with_projects(&["film_a"]);
        assert!(workspace.project_exists("film_a").await);
        let path = workspace.resolve_asset("film_a", "ref_board").await.unwrap();
        assert_eq!(path, "/workspace/film_a/assets/ref_board");
        assert!(workspace.resolve_asset("film_b", "x").await.is_err());
    }
}
