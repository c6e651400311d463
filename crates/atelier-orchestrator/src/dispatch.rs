use chrono::{Duration as ChronoDuration, Utc};
use futures::Stream;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use atelier_faults::{
    AlertService, BreakerSet, CompensationHooks, CompensationManager, ErrorClassifier,
    NotificationService, Operation, OperationKind, RecoveryManager, Remediator, SelfHealer,
    SysinfoProbe,
};
use atelier_pool::{
    DeadLetterQueue, InProcessRuntime, ResourceLedger, TaskQueue, WaitList, WorkerPool,
};
use atelier_progress::{ProgressTracker, TaskProgress};
use atelier_store::{EventBus, StateStore};
use atelier_templates::{
    PresetManager, Template, TemplateRegistry, QUALITY_SIDECAR_KEY,
};
use atelier_types::{
    EngineEvent, ErrorCode, ErrorDetails, ErrorPayload, ExecutionResult, RawErrorKind,
    ResourceVector, StageStatus, SubmitReceipt, SubmitRequest, TaskFailure, TaskSpec, TaskStatus,
    TaskSummary,
};

use crate::collaborators::{
    CancellationRegistry, QueueResubmitter, TakesService, WorkerRpc, WorkerSignal,
    WorkspaceService,
};
use crate::config::EngineConfig;

/// External collaborators injected at construction.
pub struct EngineDeps {
    pub store: Arc<dyn StateStore>,
    pub rpc: Arc<dyn WorkerRpc>,
    pub takes: Arc<dyn TakesService>,
    pub workspace: Arc<dyn WorkspaceService>,
    pub notifications: Option<Arc<dyn NotificationService>>,
    pub alerts: Option<Arc<dyn AlertService>>,
}

/// Ledger- and queue-backed undo hooks for the compensation manager.
struct EngineCompensationHooks {
    ledger: Arc<ResourceLedger>,
    queue: Arc<TaskQueue>,
    workspace: Arc<dyn WorkspaceService>,
}

#[async_trait::async_trait]
impl CompensationHooks for EngineCompensationHooks {
    async fn remove_artifact(&self, _path: &str) -> Result<bool, String> {
        // Artifact bytes live with the workspace service; nothing to do here
        // beyond acknowledging the request.
        Ok(false)
    }

    async fn release_allocation(&self, allocation_id: &str) -> Result<(), String> {
        self.ledger.release_by_id(allocation_id).await;
        Ok(())
    }

    async fn cancel_queued_task(&self, task_id: &str, _queue: &str) -> Result<bool, String> {
        Ok(self.queue.remove(task_id).await)
    }

    async fn unload_model(&self, _model_id: &str, _gpu_id: Option<&str>) -> Result<(), String> {
        Ok(())
    }

    async fn rollback_transaction(&self, _transaction_id: &str) -> Result<(), String> {
        Ok(())
    }

    async fn remove_queued_message(&self, _queue: &str, _message_id: &str) -> Result<(), String> {
        let _ = self.workspace.cleanup_old_files(0).await;
        Ok(())
    }
}

/// Remediation actions wired over the pool, queue, and workspace.
struct EngineRemediator {
    pool: Arc<WorkerPool>,
    queue: Arc<TaskQueue>,
    workspace: Arc<dyn WorkspaceService>,
}

#[async_trait::async_trait]
impl Remediator for EngineRemediator {
    async fn restart_worker(&self, worker_id: &str, graceful: bool) -> bool {
        if self.pool.terminate_worker(worker_id, graceful).await.is_err() {
            return false;
        }
        self.pool
            .spawn_worker(atelier_types::WorkerType::General)
            .await
            .is_ok()
    }

    async fn request_workers(&self, additional: usize) -> bool {
        let mut spawned = 0;
        for _ in 0..additional {
            if self
                .pool
                .spawn_worker(atelier_types::WorkerType::General)
                .await
                .is_ok()
            {
                spawned += 1;
            }
        }
        spawned > 0
    }

    async fn restart_queue_processing(&self) -> bool {
        // Dispatch runs continuously; lifting any throttle is the restart.
        self.queue.set_rate_limit(None).await;
        true
    }

    async fn clear_caches(&self) -> bool {
        true
    }

    async fn throttle(&self, tasks_per_minute: u32) -> bool {
        self.queue.set_rate_limit(Some(tasks_per_minute)).await;
        true
    }

    async fn cleanup_old_files(&self, days: u32) -> usize {
        self.workspace.cleanup_old_files(days).await
    }

    async fn archive_old_projects(&self, days: u32) -> usize {
        self.workspace.archive_old_projects(days).await
    }
}

/// End-to-end task orchestration: submission, dispatch, breaker-guarded
/// execution, failure routing, and take creation.
pub struct Orchestrator {
    pub config: EngineConfig,
    pub registry: Arc<TemplateRegistry>,
    pub presets: Arc<PresetManager>,
    pub tracker: Arc<ProgressTracker>,
    pub pool: Arc<WorkerPool>,
    pub ledger: Arc<ResourceLedger>,
    pub queue: Arc<TaskQueue>,
    pub wait_list: Arc<WaitList>,
    pub dead_letters: Arc<DeadLetterQueue>,
    pub breakers: Arc<BreakerSet>,
    pub classifier: ErrorClassifier,
    pub recovery: Arc<RecoveryManager>,
    pub compensation: Arc<CompensationManager>,
    pub analytics: Arc<atelier_faults::ErrorAnalytics>,
    pub healer: Arc<SelfHealer>,
    pub bus: EventBus,
    rpc: Arc<dyn WorkerRpc>,
    takes: Arc<dyn TakesService>,
    workspace: Arc<dyn WorkspaceService>,
    tasks: RwLock<HashMap<String, TaskSpec>>,
    operations: RwLock<HashMap<String, Vec<Operation>>>,
    cancellations: CancellationRegistry,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Arc<Self> {
        let bus = EventBus::new();
        let ledger = Arc::new(ResourceLedger::discover(
            config.gpu_memory_gb,
            config.gpu_count,
        ));
        Self::with_ledger(config, deps, ledger, bus)
    }

    /// Construction with an explicit ledger; tests pin totals this way.
    pub fn with_ledger(
        config: EngineConfig,
        deps: EngineDeps,
        ledger: Arc<ResourceLedger>,
        bus: EventBus,
    ) -> Arc<Self> {
        let queue = Arc::new(TaskQueue::new());
        let wait_list = Arc::new(WaitList::new());
        let dead_letters = Arc::new(DeadLetterQueue::new());
        let registry = Arc::new(TemplateRegistry::new(config.template_dirs.clone()));
        let presets = Arc::new(PresetManager::new());
        let tracker = Arc::new(ProgressTracker::new(deps.store.clone(), bus.clone()));
        let pool = Arc::new(WorkerPool::new(
            config.pool.clone(),
            ledger.clone(),
            Arc::new(InProcessRuntime),
            deps.store.clone(),
            queue.clone(),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            Arc::new(QueueResubmitter::new(queue.clone())),
            wait_list.clone(),
            dead_letters.clone(),
            deps.notifications.clone(),
            deps.alerts.clone(),
        ));
        let compensation = Arc::new(CompensationManager::new(Arc::new(EngineCompensationHooks {
            ledger: ledger.clone(),
            queue: queue.clone(),
            workspace: deps.workspace.clone(),
        })));
        let analytics = Arc::new(
            atelier_faults::ErrorAnalytics::new(deps.alerts.clone())
                .with_requests_per_minute(config.requests_per_minute),
        );
        let healer = {
            let mut healer = SelfHealer::new(
                Arc::new(SysinfoProbe::new()),
                pool.clone(),
                queue.clone(),
                Arc::new(EngineRemediator {
                    pool: pool.clone(),
                    queue: queue.clone(),
                    workspace: deps.workspace.clone(),
                }),
            );
            healer.interval = Duration::from_secs(config.healing_interval_secs);
            Arc::new(healer)
        };

        Arc::new(Self {
            config,
            registry,
            presets,
            tracker,
            pool,
            ledger,
            queue,
            wait_list,
            dead_letters,
            breakers: Arc::new(BreakerSet::new()),
            classifier: ErrorClassifier::new(),
            recovery,
            compensation,
            analytics,
            healer,
            bus,
            rpc: deps.rpc,
            takes: deps.takes,
            workspace: deps.workspace,
            tasks: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
            cancellations: CancellationRegistry::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Initialize the registry and start every background activity: worker
    /// pool, dispatcher, wait-list reaper, and self-healing loop.
    pub async fn start(self: &Arc<Self>) {
        self.registry.initialize().await;
        self.pool.start().await;

        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.dispatch_loop().await });

        let reaper = self.clone();
        tokio::spawn(async move { reaper.wait_reaper_loop().await });

        self.healer.clone().spawn(self.cancel.child_token());
        info!("orchestrator started");
    }

    pub async fn shutdown(&self) {
        info!("shutting down orchestrator");
        self.cancel.cancel();
        for task_id in self.tasks.read().await.keys().cloned().collect::<Vec<_>>() {
            let _ = self.cancel_task(&task_id).await;
        }
        self.pool.stop().await;
    }

    /// Single submission entry point.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, ErrorPayload> {
        if let Some(project_id) = &request.project_id {
            if !self.workspace.project_exists(project_id).await {
                return Err(ErrorPayload::new(
                    ErrorCode::ResourceNotFound,
                    format!("project '{project_id}' not found"),
                )
                .with_details(ErrorDetails {
                    resource_type: Some("project".to_string()),
                    ..ErrorDetails::default()
                }));
            }
        }

        let inputs = self
            .resolve_asset_refs(request.project_id.as_deref(), request.inputs.clone())
            .await?;

        let template = self
            .registry
            .get(&request.template_id, request.version.as_deref())
            .await
            .map_err(|err| err.to_payload())?;

        let validated = template
            .validate_inputs(&inputs)
            .map_err(|err| err.to_payload())?;

        let (final_inputs, quality) = match &request.quality {
            Some(preset_id) => {
                let applied = self
                    .presets
                    .apply(preset_id, &template, &validated)
                    .await
                    .map_err(|err| {
                        ErrorPayload::new(ErrorCode::ValidationError, err.to_string())
                    })?;
                (applied, preset_id.clone())
            }
            None => (validated, "standard".to_string()),
        };

        self.check_capacity(&template)?;

        let mut task = TaskSpec::new(
            template.id(),
            template.version(),
            template.category(),
            final_inputs,
        );
        task.priority = request.priority;
        task.project_id = request.project_id.clone();
        task.shot_id = request.shot_id.clone();
        task.user_id = request.user_id.clone();
        task.metadata = request.metadata.clone();

        let metadata_map = request
            .metadata
            .as_ref()
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        self.tracker
            .create(
                &task.id,
                template.id(),
                template.category(),
                &quality,
                Some(metadata_map),
            )
            .await
            .map_err(|err| ErrorPayload::new(ErrorCode::DispatchError, err.to_string()))?;

        let estimated_completion = self.estimate_completion(&template, &task);
        self.cancellations.create(&task.id).await;
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        self.record_operation(
            &task.id,
            Operation::new(
                OperationKind::TaskSubmission,
                json!({"task_id": task.id, "queue_name": "default"}),
            ),
        )
        .await;

        let receipt = SubmitReceipt {
            task_id: task.id.clone(),
            tracking_id: task.tracking_id.clone(),
            status: TaskStatus::Queued,
            estimated_completion,
        };
        info!(task_id = %task.id, template_id = %task.template_id, "task submitted");
        self.queue.push(task).await;
        Ok(receipt)
    }

    /// Replace `asset://…` strings with concrete workspace paths.
    async fn resolve_asset_refs(
        &self,
        project_id: Option<&str>,
        inputs: Value,
    ) -> Result<Value, ErrorPayload> {
        let map = match inputs {
            Value::Object(map) => map,
            other => return Ok(other),
        };
        let mut out = Map::new();
        for (key, value) in map {
            let asset_id = value
                .as_str()
                .and_then(|text| text.strip_prefix("asset://"))
                .map(str::to_string);
            let resolved = match asset_id {
                Some(asset_id) => {
                    let Some(project_id) = project_id else {
                        return Err(ErrorPayload::new(
                            ErrorCode::ValidationError,
                            "asset references require a project_id",
                        )
                        .with_details(ErrorDetails {
                            field: Some(key.clone()),
                            ..ErrorDetails::default()
                        }));
                    };
                    let path = self
                        .workspace
                        .resolve_asset(project_id, &asset_id)
                        .await
                        .map_err(|err| {
                            ErrorPayload::new(ErrorCode::ResourceNotFound, err).with_details(
                                ErrorDetails {
                                    field: Some(key.clone()),
                                    resource_type: Some("asset".to_string()),
                                    ..ErrorDetails::default()
                                },
                            )
                        })?;
                    Value::String(path)
                }
                None => value,
            };
            out.insert(key, resolved);
        }
        Ok(Value::Object(out))
    }

    /// Reject submissions whose template can never fit the node.
    fn check_capacity(&self, template: &Template) -> Result<(), ErrorPayload> {
        let resources = &template.body.requirements.resources;
        let needed = ResourceVector::new(
            resources.cpu_cores,
            resources.memory_gb,
            resources.vram_gb,
            if resources.gpu { 1 } else { 0 },
        );
        let totals = self.ledger.totals();
        if !needed.fits_within(&totals) {
            let (resource_type, required, available) = if resources.vram_gb > totals.gpu_memory_gb
            {
                ("vram_gb", resources.vram_gb, totals.gpu_memory_gb)
            } else if resources.memory_gb > totals.memory_gb {
                ("memory_gb", resources.memory_gb, totals.memory_gb)
            } else {
                ("cpu_cores", resources.cpu_cores, totals.cpu_cores)
            };
            return Err(ErrorPayload::new(
                ErrorCode::InsufficientResources,
                format!(
                    "template requires {required} {resource_type} but the node has {available}"
                ),
            )
            .with_details(ErrorDetails {
                resource_type: Some(resource_type.to_string()),
                required: Some(required),
                available: Some(available),
                ..ErrorDetails::default()
            }));
        }
        Ok(())
    }

    fn estimate_completion(
        &self,
        template: &Template,
        task: &TaskSpec,
    ) -> Option<chrono::DateTime<Utc>> {
        let base = template
            .body
            .requirements
            .resources
            .estimated_time_seconds
            .unwrap_or(60.0);
        let scaled = task
            .inputs
            .get(QUALITY_SIDECAR_KEY)
            .and_then(|sidecar| sidecar.get("estimated_time"))
            .and_then(Value::as_f64)
            .unwrap_or(base);
        Some(Utc::now() + ChronoDuration::milliseconds((scaled * 1000.0) as i64))
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<bool, ErrorPayload> {
        self.cancellations.cancel(task_id).await;
        self.queue.remove(task_id).await;
        self.wait_list.remove(task_id).await;
        let cancelled = self
            .tracker
            .cancel(task_id)
            .await
            .map_err(|err| ErrorPayload::new(ErrorCode::TaskError, err.to_string()))?;
        if cancelled {
            self.tasks.write().await.remove(task_id);
        }
        Ok(cancelled)
    }

    pub async fn task_status(&self, task_id: &str) -> Option<TaskProgress> {
        self.tracker.get(task_id).await.ok().flatten()
    }

    pub async fn list_active(
        &self,
        user_id: Option<&str>,
        project_id: Option<&str>,
    ) -> Vec<TaskSummary> {
        let tasks = self.tasks.read().await;
        let mut out = Vec::new();
        for progress in self.tracker.active().await {
            let Some(task) = tasks.get(&progress.task_id) else {
                continue;
            };
            if let Some(user_id) = user_id {
                if task.user_id.as_deref() != Some(user_id) {
                    continue;
                }
            }
            if let Some(project_id) = project_id {
                if task.project_id.as_deref() != Some(project_id) {
                    continue;
                }
            }
            out.push(TaskSummary {
                task_id: task.id.clone(),
                template_id: task.template_id.clone(),
                status: progress.status,
                overall_progress: progress.overall_progress,
                user_id: task.user_id.clone(),
                project_id: task.project_id.clone(),
                submitted_at: task.submitted_at,
            });
        }
        out.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        out
    }

    pub fn subscribe(&self, task_id: &str) -> impl Stream<Item = EngineEvent> {
        self.bus.subscribe_task(task_id.to_string())
    }

    async fn record_operation(&self, task_id: &str, operation: Operation) {
        self.operations
            .write()
            .await
            .entry(task_id.to_string())
            .or_default()
            .push(operation);
    }

    /// Main dispatch loop: pop, claim a worker, execute.
    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let Some(task) = self.queue.wait_pop(&self.cancel).await else {
                break;
            };

            if let Some(tasks_per_minute) = self.queue.rate_limit().await {
                let pause = Duration::from_secs_f64(60.0 / tasks_per_minute.max(1) as f64);
                tokio::time::sleep(pause).await;
            }

            // A cancelled task may still be in flight through the queue.
            let token = match self.tasks.read().await.get(&task.id) {
                Some(_) => self.cancellations.create(&task.id).await,
                None => continue,
            };

            let worker_id = loop {
                if let Some(worker_id) = self.pool.claim_worker(&task.id).await {
                    break Some(worker_id);
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => break None,
                    _ = token.cancelled() => break None,
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                }
            };
            let Some(worker_id) = worker_id else {
                if token.is_cancelled() {
                    continue;
                }
                // Engine shutdown: put the task back for a future run.
                self.queue.push(task).await;
                break;
            };

            let executor = self.clone();
            tokio::spawn(async move {
                executor.execute_task(task, worker_id, token).await;
            });
        }
    }

    /// Re-admit parked tasks whose wait deadline has passed.
    async fn wait_reaper_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.wait_reap_interval_secs);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    for task in self.wait_list.drain_due(Utc::now()).await {
                        info!(task_id = %task.id, "re-admitting task from wait list");
                        self.queue.push(task).await;
                    }
                }
            }
        }
    }

    async fn execute_task(&self, task: TaskSpec, worker_id: String, token: CancellationToken) {
        let service = task
            .inputs
            .get("service")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        let breaker = self.breakers.breaker(&service).await;

        if let Err(open) = breaker.acquire().await {
            self.pool.release_worker(&worker_id, false).await;
            let failure = TaskFailure::new(RawErrorKind::Connection, open.to_string());
            self.handle_failure(&task, failure).await;
            return;
        }

        let (signal_tx, signal_rx) = mpsc::channel::<WorkerSignal>(64);
        let signal_pump = {
            let tracker = self.tracker.clone();
            let task_id = task.id.clone();
            tokio::spawn(async move {
                pump_signals(tracker, task_id, signal_rx).await;
            })
        };

        let timeout = Duration::from_secs(self.config.task_timeout_secs);
        let execution = tokio::select! {
            _ = token.cancelled() => None,
            result = tokio::time::timeout(
                timeout,
                self.rpc.execute(&task, signal_tx, token.clone()),
            ) => Some(result),
        };
        signal_pump.abort();

        match execution {
            None => {
                // Cooperative cancellation: progress was already marked and
                // the call outcome says nothing about the downstream.
                self.pool.release_worker(&worker_id, false).await;
                self.finish_task(&task.id).await;
            }
            Some(Err(_elapsed)) => {
                breaker.record_failure().await;
                self.pool.release_worker(&worker_id, false).await;
                warn!(task_id = %task.id, timeout_secs = timeout.as_secs(), "task timed out");
                self.cancellations.cancel(&task.id).await;
                let failure = TaskFailure::new(
                    RawErrorKind::Timeout,
                    format!(
                        "workflow execution timed out after {} seconds",
                        timeout.as_secs()
                    ),
                );
                self.handle_failure(&task, failure).await;
            }
            Some(Ok(Ok(result))) => {
                breaker.record_success().await;
                self.pool.release_worker(&worker_id, true).await;
                self.queue.record_completion().await;
                self.complete_task(&task, result).await;
            }
            Some(Ok(Err(failure))) => {
                breaker.record_failure().await;
                self.pool.release_worker(&worker_id, false).await;
                self.handle_failure(&task, failure).await;
            }
        }
    }

    async fn complete_task(&self, task: &TaskSpec, result: ExecutionResult) {
        if !result.resource_usage.is_empty() {
            let _ = self
                .tracker
                .update_resource_usage(&task.id, result.resource_usage.clone())
                .await;
        }

        if let Some(project_id) = &task.project_id {
            let storage_breaker = self.breakers.breaker("storage").await;
            let outcome = storage_breaker
                .call(|| {
                    self.takes.create_take(
                        &task.id,
                        project_id,
                        task.shot_id.as_deref(),
                        result.outputs.clone(),
                        json!({
                            "task_id": task.id,
                            "template_id": task.template_id,
                            "duration_secs": result.duration_secs,
                            "resource_usage": result.resource_usage,
                        }),
                    )
                })
                .await;
            match outcome {
                Ok(Ok(take)) => {
                    info!(task_id = %task.id, take = %take.id, number = take.number, "take created");
                    self.bus.publish(EngineEvent::new(
                        "take.created",
                        json!({
                            "task_id": task.id,
                            "project_id": project_id,
                            "shot_id": task.shot_id,
                            "take_id": take.id,
                            "take_number": take.number,
                        }),
                    ));
                }
                Ok(Err(err)) => {
                    // A failed take does not fail the workflow.
                    error!(task_id = %task.id, error = %err, "take creation failed");
                }
                Err(open) => {
                    error!(task_id = %task.id, error = %open, "storage breaker open; take skipped");
                }
            }
        }

        if let Err(err) = self.tracker.complete(&task.id, Some(&result.outputs)).await {
            error!(task_id = %task.id, error = %err, "failed to record completion");
        }
        self.finish_task(&task.id).await;
    }

    async fn handle_failure(&self, task: &TaskSpec, failure: TaskFailure) {
        let classification = self.classifier.classify(&failure);
        self.analytics.record_error(&classification).await;

        let result = self.recovery.handle(task, &failure, &classification).await;
        self.analytics
            .record_recovery(classification.category, result.success)
            .await;

        if result.success {
            // Retry or park: the task stays live and its progress record
            // remains non-terminal.
            let _ = self
                .tracker
                .add_log(
                    &task.id,
                    "warn",
                    &format!("recovery: {} ({})", result.action, failure.message),
                    None,
                )
                .await;
            return;
        }

        // Recovery abandoned: undo recorded side-effects, then finalize.
        let operations = self
            .operations
            .write()
            .await
            .remove(&task.id)
            .unwrap_or_default();
        for operation in &operations {
            self.compensation
                .compensate(operation, &failure.message)
                .await;
        }

        let _ = self.tracker.fail(&task.id, &failure.message, None).await;
        self.finish_task(&task.id).await;
    }

    /// Drop bookkeeping for a task that reached a terminal state.
    async fn finish_task(&self, task_id: &str) {
        self.tasks.write().await.remove(task_id);
        self.operations.write().await.remove(task_id);
        self.cancellations.remove(task_id).await;
    }
}

/// Translate worker signals into stage updates. Stage indexes follow the
/// four-stage category tables: 0 queue, 1 loading, 2 main, 3 finishing.
async fn pump_signals(
    tracker: Arc<ProgressTracker>,
    task_id: String,
    mut rx: mpsc::Receiver<WorkerSignal>,
) {
    let mut reached = 0usize;
    while let Some(signal) = rx.recv().await {
        let result = match signal {
            WorkerSignal::QueuePosition(position) => {
                tracker
                    .update_stage(
                        &task_id,
                        0,
                        StageStatus::InProgress,
                        0.5,
                        Some(format!("queue position {position}")),
                        None,
                    )
                    .await
            }
            WorkerSignal::ModelLoading(progress) => {
                advance(&tracker, &task_id, &mut reached, 1).await;
                tracker
                    .update_stage(&task_id, 1, StageStatus::InProgress, progress, None, None)
                    .await
            }
            WorkerSignal::ExecutionProgress(progress) => {
                advance(&tracker, &task_id, &mut reached, 2).await;
                tracker
                    .update_stage(&task_id, 2, StageStatus::InProgress, progress, None, None)
                    .await
            }
            WorkerSignal::PostProcessing(progress) => {
                advance(&tracker, &task_id, &mut reached, 3).await;
                tracker
                    .update_stage(&task_id, 3, StageStatus::InProgress, progress, None, None)
                    .await
            }
            WorkerSignal::ResourceUsage(usage) => {
                let _ = tracker.update_resource_usage(&task_id, usage).await;
                continue;
            }
            WorkerSignal::Log { level, message } => {
                let _ = tracker.add_log(&task_id, &level, &message, None).await;
                continue;
            }
        };
        if result.is_err() {
            break;
        }
    }
}

/// Complete every stage below `target` exactly once.
async fn advance(
    tracker: &Arc<ProgressTracker>,
    task_id: &str,
    reached: &mut usize,
    target: usize,
) {
    while *reached < target {
        let _ = tracker
            .update_stage(task_id, *reached, StageStatus::Completed, 1.0, None, None)
            .await;
        *reached += 1;
    }
}
