use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::info;

use atelier_faults::{DeadLetterEntry, DeadLetterSink, QueueHealthView, ResourceWaitQueue};
use atelier_types::TaskSpec;

const RATE_WINDOW_SECS: i64 = 60;

/// Priority-ordered task queue feeding the dispatcher. Higher priority
/// first, FIFO within a priority. Also tracks completion throughput for
/// diagnostics and an optional rate limit set by self-healing.
pub struct TaskQueue {
    tasks: Mutex<VecDeque<TaskSpec>>,
    notify: Notify,
    completions: Mutex<VecDeque<DateTime<Utc>>>,
    rate_limit_per_minute: Mutex<Option<u32>>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            completions: Mutex::new(VecDeque::new()),
            rate_limit_per_minute: Mutex::new(None),
        }
    }

    pub async fn push(&self, task: TaskSpec) {
        let mut tasks = self.tasks.lock().await;
        // Insert after the last entry with priority >= the new task's.
        let position = tasks
            .iter()
            .position(|existing| existing.priority < task.priority)
            .unwrap_or(tasks.len());
        tasks.insert(position, task);
        drop(tasks);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> Option<TaskSpec> {
        self.tasks.lock().await.pop_front()
    }

    /// Wait until a task is available or the token is cancelled.
    pub async fn wait_pop(&self, cancel: &CancellationToken) -> Option<TaskSpec> {
        loop {
            if let Some(task) = self.pop().await {
                return Some(task);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Remove a queued-but-unstarted task (cancellation path).
    pub async fn remove(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|task| task.id != task_id);
        before != tasks.len()
    }

    pub async fn depth(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn contains(&self, task_id: &str) -> bool {
        self.tasks.lock().await.iter().any(|task| task.id == task_id)
    }

    /// Record one completed task for throughput accounting.
    pub async fn record_completion(&self) {
        let now = Utc::now();
        let cutoff = now - ChronoDuration::seconds(RATE_WINDOW_SECS);
        let mut completions = self.completions.lock().await;
        completions.push_back(now);
        while completions.front().is_some_and(|at| *at < cutoff) {
            completions.pop_front();
        }
    }

    /// Completions per second over the recent window.
    pub async fn processing_rate(&self) -> f64 {
        let cutoff = Utc::now() - ChronoDuration::seconds(RATE_WINDOW_SECS);
        let completions = self.completions.lock().await;
        let recent = completions.iter().filter(|at| **at > cutoff).count();
        recent as f64 / RATE_WINDOW_SECS as f64
    }

    pub async fn set_rate_limit(&self, tasks_per_minute: Option<u32>) {
        *self.rate_limit_per_minute.lock().await = tasks_per_minute;
    }

    pub async fn rate_limit(&self) -> Option<u32> {
        *self.rate_limit_per_minute.lock().await
    }
}

#[async_trait]
impl QueueHealthView for TaskQueue {
    async fn depth(&self) -> usize {
        TaskQueue::depth(self).await
    }

    async fn processing_rate(&self) -> f64 {
        TaskQueue::processing_rate(self).await
    }
}

/// A task parked until resources are expected to free up.
#[derive(Debug, Clone)]
pub struct WaitingTask {
    pub task: TaskSpec,
    pub reason: String,
    pub wait_until: DateTime<Utc>,
}

/// Holding area for resource-starved tasks; a reaper drains due entries
/// back into the main queue.
#[derive(Default)]
pub struct WaitList {
    waiting: Mutex<Vec<WaitingTask>>,
}

impl WaitList {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.waiting.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove and return every entry whose wait deadline has passed.
    pub async fn drain_due(&self, now: DateTime<Utc>) -> Vec<TaskSpec> {
        let mut waiting = self.waiting.lock().await;
        let (due, pending): (Vec<WaitingTask>, Vec<WaitingTask>) = waiting
            .drain(..)
            .partition(|entry| entry.wait_until <= now);
        *waiting = pending;
        due.into_iter().map(|entry| entry.task).collect()
    }

    pub async fn remove(&self, task_id: &str) -> bool {
        let mut waiting = self.waiting.lock().await;
        let before = waiting.len();
        waiting.retain(|entry| entry.task.id != task_id);
        before != waiting.len()
    }
}

#[async_trait]
impl ResourceWaitQueue for WaitList {
    async fn park(&self, task: TaskSpec, reason: String, wait_until: DateTime<Utc>) {
        info!(task_id = %task.id, %reason, "parking task until resources free up");
        self.waiting.lock().await.push(WaitingTask {
            task,
            reason,
            wait_until,
        });
    }
}

/// Terminal sink for permanently-failed tasks awaiting manual inspection.
#[derive(Default)]
pub struct DeadLetterQueue {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().await.clone()
    }

    /// Pull one entry back out for manual resubmission.
    pub async fn take(&self, task_id: &str) -> Option<DeadLetterEntry> {
        let mut entries = self.entries.lock().await;
        let index = entries.iter().position(|entry| entry.task.id == task_id)?;
        Some(entries.remove(index))
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterQueue {
    async fn push(&self, entry: DeadLetterEntry) {
        info!(task_id = %entry.task.id, error = %entry.error, "task dead-lettered");
        self.entries.lock().await.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(priority: i32) -> TaskSpec {
        let mut spec = TaskSpec::new("image_gen", "1.0.0", "image_generation", json!({}));
        spec.priority = priority;
        spec
    }

    #[tokio::test]
    async fn fifo_within_priority_high_first() {
        let queue = TaskQueue::new();
        let a = task(0);
        let b = task(5);
        let c = task(0);
        let (a_id, b_id, c_id) = (a.id.clone(), b.id.clone(), c.id.clone());
        queue.push(a).await;
        queue.push(b).await;
        queue.push(c).await;

        assert_eq!(queue.pop().await.unwrap().id, b_id);
        assert_eq!(queue.pop().await.unwrap().id, a_id);
        assert_eq!(queue.pop().await.unwrap().id, c_id);
    }

    #[tokio::test]
    async fn remove_drops_queued_task() {
        let queue = TaskQueue::new();
        let a = task(0);
        let a_id = a.id.clone();
        queue.push(a).await;
        assert!(queue.contains(&a_id).await);
        assert!(queue.remove(&a_id).await);
        assert!(!queue.remove(&a_id).await);
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn wait_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(TaskQueue::new());
        let cancel = CancellationToken::new();
        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.wait_pop(&cancel).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(task(0)).await;
        let popped = waiter.await.unwrap();
        assert!(popped.is_some());
    }

    #[tokio::test]
    async fn wait_pop_returns_none_on_cancel() {
        let queue = TaskQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.wait_pop(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn processing_rate_reflects_completions() {
        let queue = TaskQueue::new();
        assert_eq!(queue.processing_rate().await, 0.0);
        for _ in 0..30 {
            queue.record_completion().await;
        }
        let rate = queue.processing_rate().await;
        assert!((rate - 0.5).abs() < 1e-9, "rate {rate}");
    }

    #[tokio::test]
    async fn wait_list_drains_only_due_entries() {
        let list = WaitList::new();
        let due = task(0);
        let later = task(0);
        let due_id = due.id.clone();
        list.park(due, "oom".to_string(), Utc::now() - ChronoDuration::seconds(1))
            .await;
        list.park(
            later,
            "oom".to_string(),
            Utc::now() + ChronoDuration::seconds(300),
        )
        .await;

        let drained = list.drain_due(Utc::now()).await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, due_id);
        assert_eq!(list.len().await, 1);
    }

    #[tokio::test]
    async fn dead_letter_queue_keeps_full_context() {
        use atelier_faults::ErrorClassifier;
        use atelier_types::TaskFailure;

        let dlq = DeadLetterQueue::new();
        let spec = task(0);
        let task_id = spec.id.clone();
        let failure = TaskFailure::other("model not found");
        let classification = ErrorClassifier::new().classify(&failure);
        dlq.push(DeadLetterEntry {
            task: spec,
            error: "model not found".to_string(),
            classification,
            timestamp: Utc::now(),
        })
        .await;

        assert_eq!(dlq.len().await, 1);
        let entry = dlq.take(&task_id).await.unwrap();
        assert_eq!(entry.error, "model not found");
        assert!(dlq.is_empty().await);
    }
}
