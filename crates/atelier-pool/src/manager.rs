use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use atelier_faults::{PoolHealthView, UnhealthyWorker};
use atelier_store::StateStore;
use atelier_types::{WorkerRecord, WorkerStatus, WorkerType};

use crate::ledger::{Allocation, ResourceLedger};
use crate::queue::TaskQueue;
use crate::PoolError;

pub const WORKER_TTL_SECS: u64 = 300;

pub fn worker_store_key(worker_id: &str) -> String {
    format!("worker:{worker_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Queue depth per active worker that triggers a scale-up.
    pub scale_up_threshold: usize,
    /// Queue depth at or below which idle workers may be retired.
    pub scale_down_threshold: usize,
    pub idle_timeout_secs: u64,
    pub health_check_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            scale_up_threshold: 5,
            scale_down_threshold: 0,
            idle_timeout_secs: 300,
            health_check_interval_secs: 30,
        }
    }
}

/// Launches and stops the actual worker processes. The engine only tracks
/// records; process supervision is the runtime's concern.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    async fn start(&self, record: &WorkerRecord) -> Result<(), String>;
    async fn stop(&self, record: &WorkerRecord) -> Result<(), String>;
}

/// Runtime for tests and single-process deployments: workers exist only as
/// records.
pub struct InProcessRuntime;

#[async_trait]
impl WorkerRuntime for InProcessRuntime {
    async fn start(&self, _record: &WorkerRecord) -> Result<(), String> {
        Ok(())
    }

    async fn stop(&self, _record: &WorkerRecord) -> Result<(), String> {
        Ok(())
    }
}

struct WorkerEntry {
    record: WorkerRecord,
    allocation: Allocation,
}

/// Tracks worker instances, admits them against the ledger, autoscales on
/// queue pressure, and health-checks heartbeats and failure ratios.
pub struct WorkerPool {
    pub config: PoolConfig,
    ledger: Arc<ResourceLedger>,
    runtime: Arc<dyn WorkerRuntime>,
    store: Arc<dyn StateStore>,
    queue: Arc<TaskQueue>,
    workers: RwLock<HashMap<String, WorkerEntry>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        ledger: Arc<ResourceLedger>,
        runtime: Arc<dyn WorkerRuntime>,
        store: Arc<dyn StateStore>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            config,
            ledger,
            runtime,
            store,
            queue,
            workers: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the minimum worker set and the scaling and health loops.
    pub async fn start(self: &Arc<Self>) {
        info!("starting worker pool");
        for _ in 0..self.config.min_workers {
            if let Err(err) = self.spawn_worker(WorkerType::General).await {
                error!(error = %err, "failed to spawn initial worker");
            }
        }

        let scaling = self.clone();
        let scaling_cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scaling_cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(10)) => {
                        scaling.scaling_tick().await;
                    }
                }
            }
        });

        let health = self.clone();
        let health_cancel = self.cancel.clone();
        let interval = Duration::from_secs(self.config.health_check_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = health_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        health.health_tick().await;
                    }
                }
            }
        });

        info!(workers = self.worker_ids().await.len(), "worker pool started");
    }

    /// Stop the loops and gracefully terminate every worker.
    pub async fn stop(&self) {
        info!("stopping worker pool");
        self.cancel.cancel();
        for worker_id in self.worker_ids().await {
            let _ = self.terminate_worker(&worker_id, true).await;
        }
    }

    pub async fn worker_ids(&self) -> Vec<String> {
        self.workers.read().await.keys().cloned().collect()
    }

    pub async fn worker(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.workers
            .read()
            .await
            .get(worker_id)
            .map(|entry| entry.record.clone())
    }

    pub async fn workers_with_status(&self, status: WorkerStatus) -> Vec<WorkerRecord> {
        self.workers
            .read()
            .await
            .values()
            .filter(|entry| entry.record.status == status)
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub async fn spawn_worker(&self, worker_type: WorkerType) -> Result<String, PoolError> {
        {
            let workers = self.workers.read().await;
            if workers.len() >= self.config.max_workers {
                warn!("cannot spawn worker: maximum workers reached");
                return Err(PoolError::AtCapacity {
                    max: self.config.max_workers,
                });
            }
        }

        let allocation = self
            .ledger
            .allocate(worker_type)
            .await
            .ok_or(PoolError::InsufficientResources { worker_type })?;

        let worker_id = format!(
            "worker_{}_{}",
            worker_type.as_str(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let mut record = WorkerRecord::new(
            worker_id.clone(),
            worker_type,
            allocation.resources,
            queues_for_type(worker_type),
        );

        if let Err(reason) = self.runtime.start(&record).await {
            self.ledger.release(&allocation).await;
            return Err(PoolError::SpawnFailed { worker_id, reason });
        }

        record.status = WorkerStatus::Active;
        record.last_heartbeat = Some(Utc::now());
        if let Err(err) = self.register_in_directory(&record).await {
            warn!(worker_id = %record.id, error = %err, "failed to register worker in directory");
        }

        info!(worker_id = %record.id, worker_type = worker_type.as_str(), "spawned worker");
        self.workers
            .write()
            .await
            .insert(worker_id.clone(), WorkerEntry { record, allocation });
        Ok(worker_id)
    }

    pub async fn terminate_worker(
        &self,
        worker_id: &str,
        graceful: bool,
    ) -> Result<(), PoolError> {
        {
            let mut workers = self.workers.write().await;
            let entry = workers
                .get_mut(worker_id)
                .ok_or_else(|| PoolError::UnknownWorker {
                    worker_id: worker_id.to_string(),
                })?;
            entry.record.status = WorkerStatus::Stopping;
        }
        info!(worker_id, graceful, "terminating worker");

        if graceful {
            // Bounded wait for the current task to clear.
            for _ in 0..60 {
                let busy = self
                    .workers
                    .read()
                    .await
                    .get(worker_id)
                    .is_some_and(|entry| entry.record.current_task_id.is_some());
                if !busy {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        let Some(entry) = self.workers.write().await.remove(worker_id) else {
            return Ok(());
        };
        if let Err(reason) = self.runtime.stop(&entry.record).await {
            warn!(worker_id, %reason, "worker process stop reported an error");
        }
        let _ = self.store.delete(&worker_store_key(worker_id)).await;
        self.ledger.release(&entry.allocation).await;
        info!(worker_id, "worker terminated");
        Ok(())
    }

    /// Record a heartbeat and refresh the directory TTL.
    pub async fn heartbeat(&self, worker_id: &str) -> bool {
        let record = {
            let mut workers = self.workers.write().await;
            let Some(entry) = workers.get_mut(worker_id) else {
                return false;
            };
            entry.record.last_heartbeat = Some(Utc::now());
            entry.record.clone()
        };
        let _ = self.register_in_directory(&record).await;
        true
    }

    /// Claim a free worker for a task, marking it busy.
    pub async fn claim_worker(&self, task_id: &str) -> Option<String> {
        let mut workers = self.workers.write().await;
        let entry = workers.values_mut().find(|entry| {
            matches!(
                entry.record.status,
                WorkerStatus::Active | WorkerStatus::Idle
            )
        })?;
        entry.record.status = WorkerStatus::Busy;
        entry.record.current_task_id = Some(task_id.to_string());
        entry.record.idle_since = None;
        entry.record.last_heartbeat = Some(Utc::now());
        Some(entry.record.id.clone())
    }

    /// Release a claimed worker after a task finishes.
    pub async fn release_worker(&self, worker_id: &str, task_succeeded: bool) {
        let record = {
            let mut workers = self.workers.write().await;
            let Some(entry) = workers.get_mut(worker_id) else {
                return;
            };
            entry.record.current_task_id = None;
            entry.record.status = WorkerStatus::Idle;
            entry.record.idle_since = Some(Utc::now());
            entry.record.last_heartbeat = Some(Utc::now());
            if task_succeeded {
                entry.record.tasks_completed += 1;
            } else {
                entry.record.tasks_failed += 1;
            }
            entry.record.clone()
        };
        let _ = self.register_in_directory(&record).await;
    }

    async fn register_in_directory(&self, record: &WorkerRecord) -> Result<(), PoolError> {
        let raw = serde_json::to_string(record).map_err(atelier_store::StoreError::from)?;
        self.store
            .set(
                &worker_store_key(&record.id),
                raw,
                Some(Duration::from_secs(WORKER_TTL_SECS)),
            )
            .await?;
        Ok(())
    }

    /// One scaling decision: spawn when the queue outpaces active workers,
    /// retire the longest-idle worker when the queue is quiet.
    pub async fn scaling_tick(&self) {
        let queue_depth = self.queue.depth().await;
        let (active, idle): (usize, Vec<WorkerRecord>) = {
            let workers = self.workers.read().await;
            let active = workers
                .values()
                .filter(|entry| {
                    matches!(
                        entry.record.status,
                        WorkerStatus::Active | WorkerStatus::Busy
                    )
                })
                .count();
            let idle = workers
                .values()
                .filter(|entry| entry.record.status == WorkerStatus::Idle)
                .map(|entry| entry.record.clone())
                .collect();
            (active, idle)
        };

        if queue_depth > self.config.scale_up_threshold * active
            && active < self.config.max_workers
        {
            let worker_type = self.worker_type_for_queue_head().await;
            if let Err(err) = self.spawn_worker(worker_type).await {
                warn!(error = %err, "scale-up spawn failed");
            }
            return;
        }

        if !idle.is_empty() && queue_depth <= self.config.scale_down_threshold {
            let total = self.workers.read().await.len();
            if total <= self.config.min_workers {
                return;
            }
            let oldest = idle
                .iter()
                .min_by_key(|record| record.idle_since.unwrap_or(record.started_at));
            if let Some(record) = oldest {
                let idle_for = record
                    .idle_since
                    .map(|since| Utc::now() - since)
                    .unwrap_or_else(ChronoDuration::zero);
                if idle_for >= ChronoDuration::seconds(self.config.idle_timeout_secs as i64) {
                    let _ = self.terminate_worker(&record.id, true).await;
                }
            }
        }
    }

    /// Heuristic worker type for the queue head; generation-heavy queues
    /// would map to GPU workers, everything else to general.
    async fn worker_type_for_queue_head(&self) -> WorkerType {
        WorkerType::General
    }

    /// One health pass: stale heartbeats and high failure ratios mark a
    /// worker failed; failed workers are force-terminated and replaced when
    /// the pool would drop under the minimum.
    pub async fn health_tick(&self) {
        let stale_after = ChronoDuration::seconds(
            (self.config.health_check_interval_secs * 2).max(120) as i64,
        );
        let now = Utc::now();

        let mut failed = Vec::new();
        {
            let mut workers = self.workers.write().await;
            for entry in workers.values_mut() {
                if !entry.record.status.is_serving() {
                    continue;
                }
                let stale = entry
                    .record
                    .last_heartbeat
                    .map(|at| now - at > stale_after)
                    .unwrap_or(false);
                let total = entry.record.tasks_completed + entry.record.tasks_failed;
                let failing = total >= 10 && entry.record.failure_ratio() > 0.5;
                if stale || failing {
                    warn!(
                        worker_id = %entry.record.id,
                        stale,
                        failure_ratio = entry.record.failure_ratio(),
                        "marking worker failed"
                    );
                    entry.record.status = WorkerStatus::Failed;
                    failed.push(entry.record.id.clone());
                }
            }
        }

        for worker_id in failed {
            let _ = self.terminate_worker(&worker_id, false).await;
            if self.workers.read().await.len() < self.config.min_workers {
                if let Err(err) = self.spawn_worker(WorkerType::General).await {
                    error!(error = %err, "failed to spawn replacement worker");
                }
            }
        }
    }

    pub async fn metrics(&self) -> Value {
        let workers = self.workers.read().await;
        let count_status = |status: WorkerStatus| {
            workers
                .values()
                .filter(|entry| entry.record.status == status)
                .count()
        };
        let by_type: HashMap<&'static str, usize> = WorkerType::all()
            .iter()
            .map(|worker_type| {
                (
                    worker_type.as_str(),
                    workers
                        .values()
                        .filter(|entry| entry.record.worker_type == *worker_type)
                        .count(),
                )
            })
            .collect();

        let totals = self.ledger.totals();
        let allocated = self.ledger.allocated().await;
        let percent = |part: f64, whole: f64| if whole > 0.0 { part / whole * 100.0 } else { 0.0 };

        json!({
            "total_workers": workers.len(),
            "active_workers": count_status(WorkerStatus::Active) + count_status(WorkerStatus::Busy),
            "idle_workers": count_status(WorkerStatus::Idle),
            "busy_workers": count_status(WorkerStatus::Busy),
            "worker_types": by_type,
            "resource_utilization": {
                "cpu_percent": percent(allocated.cpu_cores, totals.cpu_cores),
                "memory_percent": percent(allocated.memory_gb, totals.memory_gb),
                "gpu_percent": percent(allocated.gpu_memory_gb, totals.gpu_memory_gb),
            },
            "queue_depth": self.queue.depth().await,
            "scaling_limits": {
                "min_workers": self.config.min_workers,
                "max_workers": self.config.max_workers,
                "scale_up_threshold": self.config.scale_up_threshold,
                "scale_down_threshold": self.config.scale_down_threshold,
            },
        })
    }
}

#[async_trait]
impl PoolHealthView for WorkerPool {
    async fn unhealthy_workers(&self) -> Vec<UnhealthyWorker> {
        let stale_after = ChronoDuration::seconds(
            (self.config.health_check_interval_secs * 2).max(120) as i64,
        );
        let now = Utc::now();
        self.workers
            .read()
            .await
            .values()
            .filter(|entry| {
                entry.record.status == WorkerStatus::Failed
                    || entry
                        .record
                        .last_heartbeat
                        .map(|at| now - at > stale_after)
                        .unwrap_or(false)
            })
            .map(|entry| UnhealthyWorker {
                worker_id: entry.record.id.clone(),
                last_heartbeat: entry.record.last_heartbeat,
                status: format!("{:?}", entry.record.status).to_lowercase(),
            })
            .collect()
    }

    async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }
}

fn queues_for_type(worker_type: WorkerType) -> Vec<String> {
    let names: &[&str] = match worker_type {
        WorkerType::General => &["default"],
        WorkerType::Gpu => &["gpu", "generation"],
        WorkerType::Cpu => &["cpu", "processing"],
        WorkerType::Io => &["io", "file_operations"],
    };
    names.iter().map(|name| name.to_string()).collect()
}
