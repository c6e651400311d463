use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use atelier_types::{TaskFailure, TaskSpec};

use crate::classify::{ErrorClassification, RecoveryStrategy};
use crate::history::ErrorHistoryBook;
use crate::{AlertService, NotificationService};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryResult {
    pub fn success(action: &str) -> Self {
        Self {
            success: true,
            action: action.to_string(),
            reason: None,
            error: None,
            metadata: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(action: &str, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            action: action.to_string(),
            reason: Some(reason.into()),
            error: None,
            metadata: Value::Null,
            timestamp: Utc::now(),
        }
    }

    fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Resubmits a task to the execution queue after a delay.
#[async_trait]
pub trait TaskResubmitter: Send + Sync {
    async fn resubmit(&self, task: TaskSpec, delay: Duration);
}

/// Parks tasks that must wait for resources to free up.
#[async_trait]
pub trait ResourceWaitQueue: Send + Sync {
    async fn park(&self, task: TaskSpec, reason: String, wait_until: DateTime<Utc>);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task: TaskSpec,
    pub error: String,
    pub classification: ErrorClassification,
    pub timestamp: DateTime<Utc>,
}

/// Terminal sink for permanently-failed tasks.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn push(&self, entry: DeadLetterEntry);
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 1.0,
            max_delay_secs: 60.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    /// `min(base·2^(attempt−1), max)` plus symmetric jitter, floored at 0.
    pub fn delay_for_attempt(&self, attempt: u32) -> f64 {
        let exponential = self.base_delay_secs * 2f64.powi(attempt.saturating_sub(1) as i32);
        let delay = exponential.min(self.max_delay_secs);
        let jitter = delay * self.jitter_factor * (2.0 * rand::thread_rng().gen::<f64>() - 1.0);
        (delay + jitter).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RecoveryMetrics {
    pub total_attempts: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
}

impl RecoveryMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        self.successful_recoveries as f64 / self.total_attempts as f64
    }
}

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_WAIT_SECS: u64 = 300;
const RECENT_ERROR_LIMIT: usize = 5;
const RECENT_ERROR_WINDOW_MINUTES: i64 = 5;

/// Executes the recovery strategy selected by classification, guarded by
/// recoverability and the per-task recent-error cap.
pub struct RecoveryManager {
    resubmitter: Arc<dyn TaskResubmitter>,
    wait_queue: Arc<dyn ResourceWaitQueue>,
    dead_letters: Arc<dyn DeadLetterSink>,
    notifications: Option<Arc<dyn NotificationService>>,
    alerts: Option<Arc<dyn AlertService>>,
    pub history: ErrorHistoryBook,
    backoff: BackoffConfig,
    metrics: Mutex<RecoveryMetrics>,
}

impl RecoveryManager {
    pub fn new(
        resubmitter: Arc<dyn TaskResubmitter>,
        wait_queue: Arc<dyn ResourceWaitQueue>,
        dead_letters: Arc<dyn DeadLetterSink>,
        notifications: Option<Arc<dyn NotificationService>>,
        alerts: Option<Arc<dyn AlertService>>,
    ) -> Self {
        Self {
            resubmitter,
            wait_queue,
            dead_letters,
            notifications,
            alerts,
            history: ErrorHistoryBook::new(),
            backoff: BackoffConfig::default(),
            metrics: Mutex::new(RecoveryMetrics::default()),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn metrics(&self) -> RecoveryMetrics {
        *self.metrics.lock().await
    }

    pub async fn handle(
        &self,
        task: &TaskSpec,
        failure: &TaskFailure,
        classification: &ErrorClassification,
    ) -> RecoveryResult {
        error!(
            task_id = %task.id,
            template_id = %task.template_id,
            category = classification.category.as_str(),
            recoverable = classification.recoverable,
            "task error"
        );

        self.history
            .record_error(&task.id, classification.clone())
            .await;

        if !self.should_attempt(task, classification).await {
            let result = RecoveryResult::failure(
                "abandoned",
                "max recovery attempts exceeded or non-recoverable error",
            );
            self.record(&task.id, result.clone()).await;
            return result;
        }

        let result = match classification.strategy {
            RecoveryStrategy::RetryWithBackoff => {
                self.retry(task, failure, classification, None).await
            }
            RecoveryStrategy::RetryOnce => self.retry(task, failure, classification, Some(1)).await,
            RecoveryStrategy::QueueAndWait => self.queue_and_wait(task, failure, classification).await,
            RecoveryStrategy::FailFast => self.fail_fast(task, failure, classification).await,
            RecoveryStrategy::DeadLetter => self.dead_letter(task, failure, classification).await,
        };

        self.record(&task.id, result.clone()).await;
        result
    }

    async fn should_attempt(&self, task: &TaskSpec, classification: &ErrorClassification) -> bool {
        if !classification.recoverable {
            return false;
        }
        let recent = self
            .history
            .recent_error_count(&task.id, RECENT_ERROR_WINDOW_MINUTES)
            .await;
        if recent >= RECENT_ERROR_LIMIT {
            warn!(task_id = %task.id, recent, "too many recovery attempts for task");
            return false;
        }
        true
    }

    async fn retry(
        &self,
        task: &TaskSpec,
        failure: &TaskFailure,
        classification: &ErrorClassification,
        cap: Option<u32>,
    ) -> RecoveryResult {
        let max_retries = cap
            .or(classification.max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES);
        let attempt = task.retry_count + 1;

        if attempt > max_retries {
            return RecoveryResult::failure(
                "max_retries_exceeded",
                format!("exceeded maximum retries ({max_retries})"),
            );
        }

        let delay_secs = self.backoff.delay_for_attempt(attempt);
        info!(
            task_id = %task.id,
            attempt,
            max_retries,
            delay_secs,
            "scheduling retry"
        );

        let mut retry_task = task.clone();
        retry_task.retry_count = attempt;
        retry_task.previous_error = Some(failure.message.clone());
        retry_task.retry_delay_secs = Some(delay_secs);

        self.resubmitter
            .resubmit(retry_task, Duration::from_secs_f64(delay_secs))
            .await;

        RecoveryResult::success("retry_scheduled").with_metadata(json!({
            "attempt": attempt,
            "delay": delay_secs,
            "next_attempt_at":
                Utc::now() + ChronoDuration::milliseconds((delay_secs * 1000.0) as i64),
        }))
    }

    async fn queue_and_wait(
        &self,
        task: &TaskSpec,
        failure: &TaskFailure,
        classification: &ErrorClassification,
    ) -> RecoveryResult {
        let wait_secs = classification.wait_time_secs.unwrap_or(DEFAULT_WAIT_SECS);
        let wait_until = Utc::now() + ChronoDuration::seconds(wait_secs as i64);

        self.wait_queue
            .park(task.clone(), failure.message.clone(), wait_until)
            .await;

        info!(task_id = %task.id, wait_secs, "task parked for resource availability");
        RecoveryResult::success("queued_for_resources").with_metadata(json!({
            "wait_time": wait_secs,
            "reason": failure.message,
        }))
    }

    async fn fail_fast(
        &self,
        task: &TaskSpec,
        failure: &TaskFailure,
        classification: &ErrorClassification,
    ) -> RecoveryResult {
        let mut notified = false;
        if classification.notify_user {
            if let Some(notifications) = &self.notifications {
                notifications
                    .notify_error(&task.id, &failure.message, classification.severity)
                    .await;
                notified = true;
            }
        }

        warn!(task_id = %task.id, error = %failure.message, "task failed fast");
        let mut result = RecoveryResult::failure("failed_validation", failure.message.clone());
        result.metadata = json!({"notified": notified});
        result
    }

    async fn dead_letter(
        &self,
        task: &TaskSpec,
        failure: &TaskFailure,
        classification: &ErrorClassification,
    ) -> RecoveryResult {
        self.dead_letters
            .push(DeadLetterEntry {
                task: task.clone(),
                error: failure.message.clone(),
                classification: classification.clone(),
                timestamp: Utc::now(),
            })
            .await;

        let mut alerted = false;
        if classification.alert_admin {
            if let Some(alerts) = &self.alerts {
                alerts
                    .send_alert(
                        classification.severity,
                        &format!("task {} moved to dead letter queue", task.id),
                        json!({
                            "error": failure.message,
                            "template_id": task.template_id,
                        }),
                    )
                    .await;
                alerted = true;
            }
        }

        error!(task_id = %task.id, error = %failure.message, "task moved to dead letter queue");
        let mut result = RecoveryResult::failure(
            "dead_letter_queue",
            "permanent failure, manual intervention required",
        );
        result.metadata = json!({"alerted": alerted});
        result
    }

    async fn record(&self, task_id: &str, result: RecoveryResult) {
        let mut metrics = self.metrics.lock().await;
        metrics.total_attempts += 1;
        if result.success {
            metrics.successful_recoveries += 1;
        } else {
            metrics.failed_recoveries += 1;
        }
        drop(metrics);
        self.history.record_recovery(task_id, result).await;
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    #[derive(Default)]
    pub struct RecordingSinks {
        pub resubmitted: Mutex<Vec<(TaskSpec, Duration)>>,
        pub parked: Mutex<Vec<(TaskSpec, String, DateTime<Utc>)>>,
        pub dead_letters: Mutex<Vec<DeadLetterEntry>>,
        pub notifications: Mutex<Vec<String>>,
        pub alerts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskResubmitter for RecordingSinks {
        async fn resubmit(&self, task: TaskSpec, delay: Duration) {
            self.resubmitted.lock().await.push((task, delay));
        }
    }

    #[async_trait]
    impl ResourceWaitQueue for RecordingSinks {
        async fn park(&self, task: TaskSpec, reason: String, wait_until: DateTime<Utc>) {
            self.parked.lock().await.push((task, reason, wait_until));
        }
    }

    #[async_trait]
    impl DeadLetterSink for RecordingSinks {
        async fn push(&self, entry: DeadLetterEntry) {
            self.dead_letters.lock().await.push(entry);
        }
    }

    #[async_trait]
    impl NotificationService for RecordingSinks {
        async fn notify_error(&self, task_id: &str, message: &str, _severity: atelier_types::ErrorSeverity) {
            self.notifications
                .lock()
                .await
                .push(format!("{task_id}: {message}"));
        }
    }

    #[async_trait]
    impl AlertService for RecordingSinks {
        async fn send_alert(&self, _level: atelier_types::ErrorSeverity, message: &str, _details: Value) {
            self.alerts.lock().await.push(message.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingSinks;
    use super::*;
    use crate::classify::ErrorClassifier;
    use atelier_types::RawErrorKind;
    use serde_json::json;

    fn task() -> TaskSpec {
        TaskSpec::new("image_gen", "1.0.0", "image_generation", json!({"prompt": "a cat"}))
    }

    fn manager(sinks: &Arc<RecordingSinks>) -> RecoveryManager {
        RecoveryManager::new(
            sinks.clone(),
            sinks.clone(),
            sinks.clone(),
            Some(sinks.clone()),
            Some(sinks.clone()),
        )
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let backoff = BackoffConfig {
            jitter_factor: 0.0,
            ..BackoffConfig::default()
        };
        assert_eq!(backoff.delay_for_attempt(1), 1.0);
        assert_eq!(backoff.delay_for_attempt(2), 2.0);
        assert_eq!(backoff.delay_for_attempt(3), 4.0);
        assert_eq!(backoff.delay_for_attempt(10), 60.0);
    }

    #[test]
    fn jitter_stays_within_band() {
        let backoff = BackoffConfig::default();
        for _ in 0..100 {
            let delay = backoff.delay_for_attempt(1);
            assert!((0.9..=1.1).contains(&delay), "delay {delay}");
        }
    }

    #[tokio::test]
    async fn transient_error_schedules_retry() {
        let sinks = Arc::new(RecordingSinks::default());
        let manager = manager(&sinks);
        let failure = TaskFailure::new(RawErrorKind::Connection, "connection reset");
        let classification = ErrorClassifier::new().classify(&failure);

        let result = manager.handle(&task(), &failure, &classification).await;
        assert!(result.success);
        assert_eq!(result.action, "retry_scheduled");
        assert_eq!(result.metadata["attempt"], 1);

        let resubmitted = sinks.resubmitted.lock().await;
        assert_eq!(resubmitted.len(), 1);
        let (retry_task, delay) = &resubmitted[0];
        assert_eq!(retry_task.retry_count, 1);
        assert_eq!(
            retry_task.previous_error.as_deref(),
            Some("connection reset")
        );
        // attempt 1 → ~1s ±10% jitter
        assert!((0.9..=1.1).contains(&delay.as_secs_f64()));
    }

    #[tokio::test]
    async fn retry_past_budget_reports_max_retries_exceeded() {
        let sinks = Arc::new(RecordingSinks::default());
        let manager = manager(&sinks);
        let failure = TaskFailure::new(RawErrorKind::Connection, "connection reset");
        let classification = ErrorClassifier::new().classify(&failure);

        let mut exhausted = task();
        exhausted.retry_count = 3;
        let result = manager.handle(&exhausted, &failure, &classification).await;
        assert!(!result.success);
        assert_eq!(result.action, "max_retries_exceeded");
        assert!(sinks.resubmitted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn resource_error_parks_with_wait_deadline() {
        let sinks = Arc::new(RecordingSinks::default());
        let manager = manager(&sinks);
        let failure = TaskFailure::other("gpu memory exhausted");
        let classification = ErrorClassifier::new().classify(&failure);

        let result = manager.handle(&task(), &failure, &classification).await;
        assert!(result.success);
        assert_eq!(result.action, "queued_for_resources");
        assert_eq!(result.metadata["wait_time"], 300);

        let parked = sinks.parked.lock().await;
        assert_eq!(parked.len(), 1);
        let wait = (parked[0].2 - Utc::now()).num_seconds();
        assert!((295..=300).contains(&wait), "wait {wait}");
    }

    #[tokio::test]
    async fn validation_error_notifies_and_fails() {
        let sinks = Arc::new(RecordingSinks::default());
        let manager = manager(&sinks);
        let failure = TaskFailure::other("invalid input: prompt empty");
        let classification = ErrorClassifier::new().classify(&failure);

        let result = manager.handle(&task(), &failure, &classification).await;
        assert!(!result.success);
        assert_eq!(result.action, "failed_validation");
        assert_eq!(result.metadata["notified"], true);
        assert_eq!(sinks.notifications.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn permanent_error_dead_letters_and_alerts() {
        let sinks = Arc::new(RecordingSinks::default());
        let manager = manager(&sinks);
        let failure = TaskFailure::other("model not found: sdxl");
        let classification = ErrorClassifier::new().classify(&failure);

        let result = manager.handle(&task(), &failure, &classification).await;
        assert!(!result.success);
        assert_eq!(result.action, "dead_letter_queue");
        assert_eq!(sinks.dead_letters.lock().await.len(), 1);
        assert_eq!(sinks.alerts.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn error_storm_abandons_recovery() {
        let sinks = Arc::new(RecordingSinks::default());
        let manager = manager(&sinks);
        let failure = TaskFailure::new(RawErrorKind::Connection, "connection reset");
        let classification = ErrorClassifier::new().classify(&failure);
        let task = task();

        let mut last = None;
        for _ in 0..8 {
            last = Some(manager.handle(&task, &failure, &classification).await);
        }
        let last = last.unwrap();
        assert!(!last.success);
        assert_eq!(last.action, "abandoned");
    }

    #[tokio::test]
    async fn metrics_track_outcomes() {
        let sinks = Arc::new(RecordingSinks::default());
        let manager = manager(&sinks);
        let transient = TaskFailure::new(RawErrorKind::Connection, "connection reset");
        let permanent = TaskFailure::other("permission denied");
        let classifier = ErrorClassifier::new();

        manager
            .handle(&task(), &transient, &classifier.classify(&transient))
            .await;
        manager
            .handle(&task(), &permanent, &classifier.classify(&permanent))
            .await;

        let metrics = manager.metrics().await;
        assert_eq!(metrics.total_attempts, 2);
        assert_eq!(metrics.successful_recoveries, 1);
        assert_eq!(metrics.success_rate(), 0.5);
    }
}
