use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::classify::ErrorClassification;
use crate::recovery::RecoveryResult;

/// Append-only error record for one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHistory {
    pub task_id: String,
    pub errors: Vec<ErrorClassification>,
    pub recovery_attempts: Vec<RecoveryResult>,
    pub total_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,
}

/// Per-task error histories; the recovery guard consults the recent-error
/// window here.
#[derive(Default)]
pub struct ErrorHistoryBook {
    histories: Mutex<HashMap<String, ErrorHistory>>,
}

impl ErrorHistoryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_error(&self, task_id: &str, classification: ErrorClassification) {
        let mut histories = self.histories.lock().await;
        let history = histories
            .entry(task_id.to_string())
            .or_insert_with(|| ErrorHistory {
                task_id: task_id.to_string(),
                ..ErrorHistory::default()
            });
        history.errors.push(classification);
        history.last_error_time = Some(Utc::now());
    }

    pub async fn record_recovery(&self, task_id: &str, result: RecoveryResult) {
        let mut histories = self.histories.lock().await;
        let history = histories
            .entry(task_id.to_string())
            .or_insert_with(|| ErrorHistory {
                task_id: task_id.to_string(),
                ..ErrorHistory::default()
            });
        if result.action == "retry_scheduled" {
            history.total_retries += 1;
        }
        history.recovery_attempts.push(result);
    }

    /// Number of errors recorded for this task in the last `minutes`.
    pub async fn recent_error_count(&self, task_id: &str, minutes: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::minutes(minutes);
        let histories = self.histories.lock().await;
        histories
            .get(task_id)
            .map(|history| {
                history
                    .errors
                    .iter()
                    .filter(|error| error.timestamp > cutoff)
                    .count()
            })
            .unwrap_or(0)
    }

    pub async fn history(&self, task_id: &str) -> Option<ErrorHistory> {
        self.histories.lock().await.get(task_id).cloned()
    }

    /// Drop histories whose last error is older than `hours`.
    pub async fn cleanup_older_than(&self, hours: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(hours);
        let mut histories = self.histories.lock().await;
        let before = histories.len();
        histories.retain(|_, history| {
            history
                .last_error_time
                .map(|at| at > cutoff)
                .unwrap_or(false)
        });
        before - histories.len()
    }
}
