use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use atelier_types::ErrorSeverity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    WorkerUnresponsive,
    QueueBacklog,
    QueueStalled,
    ResourceLeak,
    HighCpuUsage,
    LowDiskSpace,
    WorkspaceFull,
    ModelCorruption,
    DiagnosticFailure,
}

impl IssueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueKind::WorkerUnresponsive => "worker_unresponsive",
            IssueKind::QueueBacklog => "queue_backlog",
            IssueKind::QueueStalled => "queue_stalled",
            IssueKind::ResourceLeak => "resource_leak",
            IssueKind::HighCpuUsage => "high_cpu_usage",
            IssueKind::LowDiskSpace => "low_disk_space",
            IssueKind::WorkspaceFull => "workspace_full",
            IssueKind::ModelCorruption => "model_corruption",
            IssueKind::DiagnosticFailure => "diagnostic_failure",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemIssue {
    pub issue_id: String,
    pub kind: IssueKind,
    pub severity: ErrorSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub details: Value,
    pub detected_at: DateTime<Utc>,
}

impl SystemIssue {
    pub fn new(kind: IssueKind, severity: ErrorSeverity) -> Self {
        Self {
            issue_id: format!("issue_{:016x}", rand::random::<u64>()),
            kind,
            severity,
            target: None,
            details: Value::Null,
            detected_at: Utc::now(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingResult {
    pub success: bool,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub issue_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingRecord {
    pub timestamp: DateTime<Utc>,
    pub issue: SystemIssue,
    pub action: String,
    pub success: bool,
}

/// Host-level resource percentages consulted by diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub workspace_percent: f64,
}

pub trait HostProbe: Send + Sync {
    fn sample(&self) -> HostSample;
}

/// Probe backed by sysinfo; disk/workspace figures default to zero when the
/// mount cannot be resolved.
pub struct SysinfoProbe {
    system: std::sync::Mutex<sysinfo::System>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: std::sync::Mutex::new(sysinfo::System::new()),
        }
    }
}

impl HostProbe for SysinfoProbe {
    fn sample(&self) -> HostSample {
        let mut system = self.system.lock().expect("probe mutex poisoned");
        system.refresh_cpu();
        system.refresh_memory();
        let cpu_percent = system.global_cpu_info().cpu_usage() as f64;
        let memory_percent = if system.total_memory() > 0 {
            system.used_memory() as f64 / system.total_memory() as f64 * 100.0
        } else {
            0.0
        };
        HostSample {
            cpu_percent,
            memory_percent,
            disk_percent: 0.0,
            workspace_percent: 0.0,
        }
    }
}

/// A worker the diagnostics consider unhealthy.
#[derive(Debug, Clone, Serialize)]
pub struct UnhealthyWorker {
    pub worker_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub status: String,
}

/// Read-only view of the worker pool for diagnostics.
#[async_trait]
pub trait PoolHealthView: Send + Sync {
    async fn unhealthy_workers(&self) -> Vec<UnhealthyWorker>;
    async fn worker_count(&self) -> usize;
}

/// Read-only queue metrics for diagnostics.
#[async_trait]
pub trait QueueHealthView: Send + Sync {
    async fn depth(&self) -> usize;
    /// Tasks per second over the recent window.
    async fn processing_rate(&self) -> f64;
}

/// Remediation actions; implemented over the pool manager, queue, and
/// storage collaborators.
#[async_trait]
pub trait Remediator: Send + Sync {
    async fn restart_worker(&self, worker_id: &str, graceful: bool) -> bool;
    async fn request_workers(&self, additional: usize) -> bool;
    async fn restart_queue_processing(&self) -> bool;
    async fn clear_caches(&self) -> bool;
    async fn throttle(&self, tasks_per_minute: u32) -> bool;
    /// Returns the number of files removed.
    async fn cleanup_old_files(&self, days: u32) -> usize;
    /// Returns the number of projects archived.
    async fn archive_old_projects(&self, days: u32) -> usize;
}

const BACKLOG_SECONDS: f64 = 300.0;
const CPU_LIMIT: f64 = 90.0;
const MEMORY_LIMIT: f64 = 90.0;
const DISK_LIMIT: f64 = 95.0;
const WORKSPACE_LIMIT: f64 = 90.0;
const DEGRADE_AFTER_FAILURES: u32 = 3;

/// Periodic diagnostics plus a remediation table. Repeated failures on the
/// same issue kind degrade that remediation until a success resets it.
pub struct SelfHealer {
    probe: Arc<dyn HostProbe>,
    pool: Arc<dyn PoolHealthView>,
    queue: Arc<dyn QueueHealthView>,
    remediator: Arc<dyn Remediator>,
    history: Mutex<Vec<HealingRecord>>,
    consecutive_failures: Mutex<HashMap<IssueKind, u32>>,
    pub interval: Duration,
}

impl SelfHealer {
    pub fn new(
        probe: Arc<dyn HostProbe>,
        pool: Arc<dyn PoolHealthView>,
        queue: Arc<dyn QueueHealthView>,
        remediator: Arc<dyn Remediator>,
    ) -> Self {
        Self {
            probe,
            pool,
            queue,
            remediator,
            history: Mutex::new(Vec::new()),
            consecutive_failures: Mutex::new(HashMap::new()),
            interval: Duration::from_secs(60),
        }
    }

    pub async fn diagnose(&self) -> Vec<SystemIssue> {
        let mut issues = Vec::new();

        for worker in self.pool.unhealthy_workers().await {
            issues.push(
                SystemIssue::new(IssueKind::WorkerUnresponsive, ErrorSeverity::High)
                    .with_target(worker.worker_id.clone())
                    .with_details(json!({
                        "last_heartbeat": worker.last_heartbeat,
                        "status": worker.status,
                    })),
            );
        }

        let depth = self.queue.depth().await;
        let rate = self.queue.processing_rate().await;
        if rate > 0.0 && depth as f64 > rate * BACKLOG_SECONDS {
            issues.push(
                SystemIssue::new(IssueKind::QueueBacklog, ErrorSeverity::Medium).with_details(
                    json!({
                        "depth": depth,
                        "rate": rate,
                        "estimated_wait": depth as f64 / rate,
                    }),
                ),
            );
        }
        if rate == 0.0 && depth > 0 {
            issues.push(
                SystemIssue::new(IssueKind::QueueStalled, ErrorSeverity::High)
                    .with_details(json!({"depth": depth})),
            );
        }

        let host = self.probe.sample();
        if host.cpu_percent > CPU_LIMIT {
            issues.push(
                SystemIssue::new(IssueKind::HighCpuUsage, ErrorSeverity::High)
                    .with_details(json!({"cpu_percent": host.cpu_percent})),
            );
        }
        if host.memory_percent > MEMORY_LIMIT {
            issues.push(
                SystemIssue::new(IssueKind::ResourceLeak, ErrorSeverity::High)
                    .with_details(json!({"memory_percent": host.memory_percent})),
            );
        }
        if host.disk_percent > DISK_LIMIT {
            issues.push(
                SystemIssue::new(IssueKind::LowDiskSpace, ErrorSeverity::Critical)
                    .with_details(json!({"disk_percent": host.disk_percent})),
            );
        }
        if host.workspace_percent > WORKSPACE_LIMIT {
            issues.push(
                SystemIssue::new(IssueKind::WorkspaceFull, ErrorSeverity::High)
                    .with_details(json!({"workspace_percent": host.workspace_percent})),
            );
        }

        issues
    }

    pub async fn heal(&self, issue: &SystemIssue) -> HealingResult {
        {
            let failures = self.consecutive_failures.lock().await;
            if failures.get(&issue.kind).copied().unwrap_or(0) >= DEGRADE_AFTER_FAILURES {
                let result = HealingResult {
                    success: false,
                    action: "remediation_degraded".to_string(),
                    reason: Some(format!(
                        "remediation for {} disabled after repeated failures",
                        issue.kind.as_str()
                    )),
                    issue_id: issue.issue_id.clone(),
                    timestamp: Utc::now(),
                };
                self.record(issue, &result).await;
                return result;
            }
        }

        info!(
            issue = issue.kind.as_str(),
            severity = issue.severity.as_str(),
            "attempting remediation"
        );

        let (success, action, reason) = match issue.kind {
            IssueKind::WorkerUnresponsive => {
                let worker_id = issue.target.clone().unwrap_or_default();
                let restarted = self.remediator.restart_worker(&worker_id, true).await
                    || self.remediator.restart_worker(&worker_id, false).await;
                (
                    restarted,
                    format!("restarted_worker_{worker_id}"),
                    (!restarted).then(|| "failed to restart worker".to_string()),
                )
            }
            IssueKind::QueueBacklog => {
                let scaled = self.remediator.request_workers(2).await;
                (
                    scaled,
                    "requested_additional_workers".to_string(),
                    (!scaled).then(|| "failed to scale workers".to_string()),
                )
            }
            IssueKind::QueueStalled => {
                let restarted = self.remediator.restart_queue_processing().await;
                (
                    restarted,
                    "restarted_queue_processing".to_string(),
                    (!restarted).then(|| "failed to restart queue".to_string()),
                )
            }
            IssueKind::ResourceLeak => {
                let cleared = self.remediator.clear_caches().await;
                (cleared, "cleared_memory_and_caches".to_string(), None)
            }
            IssueKind::HighCpuUsage => {
                let throttled = self.remediator.throttle(30).await;
                (
                    throttled,
                    "throttled_task_processing".to_string(),
                    (!throttled).then(|| "failed to throttle".to_string()),
                )
            }
            IssueKind::LowDiskSpace => {
                let cleaned = self.remediator.cleanup_old_files(7).await;
                (
                    cleaned > 0,
                    format!("cleaned_{cleaned}_old_files"),
                    (cleaned == 0).then(|| "no files to clean".to_string()),
                )
            }
            IssueKind::WorkspaceFull => {
                let archived = self.remediator.archive_old_projects(30).await;
                (
                    archived > 0,
                    format!("archived_{archived}_old_projects"),
                    (archived == 0).then(|| "no projects to archive".to_string()),
                )
            }
            IssueKind::ModelCorruption | IssueKind::DiagnosticFailure => (
                false,
                "no_remediation_available".to_string(),
                Some("manual intervention required".to_string()),
            ),
        };

        let result = HealingResult {
            success,
            action,
            reason,
            issue_id: issue.issue_id.clone(),
            timestamp: Utc::now(),
        };

        if result.success {
            info!(issue = issue.kind.as_str(), action = %result.action, "remediation succeeded");
        } else {
            warn!(
                issue = issue.kind.as_str(),
                reason = result.reason.as_deref().unwrap_or(""),
                "remediation failed"
            );
        }

        self.record(issue, &result).await;
        result
    }

    async fn record(&self, issue: &SystemIssue, result: &HealingResult) {
        {
            let mut failures = self.consecutive_failures.lock().await;
            if result.success {
                failures.remove(&issue.kind);
            } else {
                *failures.entry(issue.kind).or_default() += 1;
            }
        }
        self.history.lock().await.push(HealingRecord {
            timestamp: result.timestamp,
            issue: issue.clone(),
            action: result.action.clone(),
            success: result.success,
        });
    }

    /// One diagnose-and-heal pass.
    pub async fn run_cycle(&self) -> Vec<HealingResult> {
        let issues = self.diagnose().await;
        if !issues.is_empty() {
            info!(count = issues.len(), "detected system issues");
        }
        let mut results = Vec::new();
        for issue in &issues {
            results.push(self.heal(issue).await);
        }
        results
    }

    pub async fn stats(&self) -> Value {
        let history = self.history.lock().await;
        let total = history.len();
        let successful = history.iter().filter(|r| r.success).count();

        let mut by_kind: HashMap<&'static str, (u32, u32)> = HashMap::new();
        for record in history.iter() {
            let entry = by_kind.entry(record.issue.kind.as_str()).or_default();
            entry.0 += 1;
            if record.success {
                entry.1 += 1;
            }
        }
        let by_kind: HashMap<&'static str, Value> = by_kind
            .into_iter()
            .map(|(kind, (attempts, successes))| {
                (kind, json!({"attempts": attempts, "successes": successes}))
            })
            .collect();

        json!({
            "total_healing_attempts": total,
            "successful_healings": successful,
            "success_rate": if total > 0 { successful as f64 / total as f64 } else { 0.0 },
            "by_issue_type": by_kind,
            "recent_healings": history.iter().rev().take(10).map(|record| json!({
                "timestamp": record.timestamp,
                "issue_type": record.issue.kind.as_str(),
                "action": record.action,
                "success": record.success,
            })).collect::<Vec<_>>(),
        })
    }

    /// Spawn the periodic healing loop. Errors back off to five minutes.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {
                        let results = self.run_cycle().await;
                        if results.iter().any(|r| !r.success) {
                            error!("one or more remediations failed this cycle");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StaticProbe(HostSample);
    impl HostProbe for StaticProbe {
        fn sample(&self) -> HostSample {
            self.0
        }
    }

    #[derive(Default)]
    struct FakePool {
        unhealthy: Vec<UnhealthyWorker>,
    }

    #[async_trait]
    impl PoolHealthView for FakePool {
        async fn unhealthy_workers(&self) -> Vec<UnhealthyWorker> {
            self.unhealthy.clone()
        }
        async fn worker_count(&self) -> usize {
            2
        }
    }

    struct FakeQueue {
        depth: usize,
        rate: f64,
    }

    #[async_trait]
    impl QueueHealthView for FakeQueue {
        async fn depth(&self) -> usize {
            self.depth
        }
        async fn processing_rate(&self) -> f64 {
            self.rate
        }
    }

    #[derive(Default)]
    struct FakeRemediator {
        restarted: Mutex<Vec<(String, bool)>>,
        scale_calls: AtomicUsize,
        restart_fails: AtomicBool,
    }

    #[async_trait]
    impl Remediator for FakeRemediator {
        async fn restart_worker(&self, worker_id: &str, graceful: bool) -> bool {
            self.restarted
                .lock()
                .await
                .push((worker_id.to_string(), graceful));
            !self.restart_fails.load(Ordering::SeqCst)
        }
        async fn request_workers(&self, _additional: usize) -> bool {
            self.scale_calls.fetch_add(1, Ordering::SeqCst);
            true
        }
        async fn restart_queue_processing(&self) -> bool {
            true
        }
        async fn clear_caches(&self) -> bool {
            true
        }
        async fn throttle(&self, _tasks_per_minute: u32) -> bool {
            true
        }
        async fn cleanup_old_files(&self, _days: u32) -> usize {
            4
        }
        async fn archive_old_projects(&self, _days: u32) -> usize {
            0
        }
    }

    fn healer(
        sample: HostSample,
        pool: FakePool,
        queue: FakeQueue,
        remediator: Arc<FakeRemediator>,
    ) -> SelfHealer {
        SelfHealer::new(
            Arc::new(StaticProbe(sample)),
            Arc::new(pool),
            Arc::new(queue),
            remediator,
        )
    }

    #[tokio::test]
    async fn quiet_system_reports_no_issues() {
        let healer = healer(
            HostSample::default(),
            FakePool::default(),
            FakeQueue { depth: 0, rate: 1.0 },
            Arc::new(FakeRemediator::default()),
        );
        assert!(healer.diagnose().await.is_empty());
    }

    #[tokio::test]
    async fn backlog_and_stall_detected() {
        let backlog = healer(
            HostSample::default(),
            FakePool::default(),
            FakeQueue { depth: 400, rate: 1.0 },
            Arc::new(FakeRemediator::default()),
        );
        let issues = backlog.diagnose().await;
        assert!(issues.iter().any(|i| i.kind == IssueKind::QueueBacklog));

        let stalled = healer(
            HostSample::default(),
            FakePool::default(),
            FakeQueue { depth: 5, rate: 0.0 },
            Arc::new(FakeRemediator::default()),
        );
        let issues = stalled.diagnose().await;
        assert!(issues.iter().any(|i| i.kind == IssueKind::QueueStalled));
    }

    #[tokio::test]
    async fn host_pressure_maps_to_issue_kinds() {
        let healer = healer(
            HostSample {
                cpu_percent: 95.0,
                memory_percent: 92.0,
                disk_percent: 97.0,
                workspace_percent: 95.0,
            },
            FakePool::default(),
            FakeQueue { depth: 0, rate: 1.0 },
            Arc::new(FakeRemediator::default()),
        );
        let issues = healer.diagnose().await;
        let kinds: Vec<IssueKind> = issues.iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&IssueKind::HighCpuUsage));
        assert!(kinds.contains(&IssueKind::ResourceLeak));
        assert!(kinds.contains(&IssueKind::LowDiskSpace));
        assert!(kinds.contains(&IssueKind::WorkspaceFull));
    }

    #[tokio::test]
    async fn unresponsive_worker_gets_restarted() {
        let remediator = Arc::new(FakeRemediator::default());
        let healer = healer(
            HostSample::default(),
            FakePool {
                unhealthy: vec![UnhealthyWorker {
                    worker_id: "worker_gpu_01".to_string(),
                    last_heartbeat: None,
                    status: "failed".to_string(),
                }],
            },
            FakeQueue { depth: 0, rate: 1.0 },
            remediator.clone(),
        );
        let results = healer.run_cycle().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        let restarted = remediator.restarted.lock().await;
        assert_eq!(restarted[0], ("worker_gpu_01".to_string(), true));
    }

    #[tokio::test]
    async fn backlog_requests_more_workers() {
        let remediator = Arc::new(FakeRemediator::default());
        let healer = healer(
            HostSample::default(),
            FakePool::default(),
            FakeQueue { depth: 400, rate: 1.0 },
            remediator.clone(),
        );
        healer.run_cycle().await;
        assert_eq!(remediator.scale_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_failures_degrade_remediation() {
        let remediator = Arc::new(FakeRemediator::default());
        remediator.restart_fails.store(true, Ordering::SeqCst);
        let healer = healer(
            HostSample::default(),
            FakePool {
                unhealthy: vec![UnhealthyWorker {
                    worker_id: "worker_cpu_02".to_string(),
                    last_heartbeat: None,
                    status: "failed".to_string(),
                }],
            },
            FakeQueue { depth: 0, rate: 1.0 },
            remediator.clone(),
        );

        let issue = SystemIssue::new(IssueKind::WorkerUnresponsive, ErrorSeverity::High)
            .with_target("worker_cpu_02");
        for _ in 0..3 {
            assert!(!healer.heal(&issue).await.success);
        }
        let degraded = healer.heal(&issue).await;
        assert_eq!(degraded.action, "remediation_degraded");

        let stats = healer.stats().await;
        assert_eq!(stats["total_healing_attempts"], 4);
        assert_eq!(stats["successful_healings"], 0);
    }

    #[tokio::test]
    async fn workspace_with_nothing_to_archive_reports_failure() {
        let healer = healer(
            HostSample {
                workspace_percent: 95.0,
                ..HostSample::default()
            },
            FakePool::default(),
            FakeQueue { depth: 0, rate: 1.0 },
            Arc::new(FakeRemediator::default()),
        );
        let results = healer.run_cycle().await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(results[0].reason.as_deref(), Some("no projects to archive"));
    }
}
