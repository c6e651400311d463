use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use atelier_types::ErrorSeverity;

use crate::classify::{ErrorCategory, ErrorClassification};
use crate::AlertService;

const WINDOW_CAP: usize = 1000;
const CRITICAL_LOOKBACK: usize = 20;

/// Alerting thresholds; all runtime-mutable through the admin surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Errors per request in the analysis window.
    pub error_rate: f64,
    /// Occurrences of one error kind in the window.
    pub specific_error_count: usize,
    /// 1 − recovery successes / attempts.
    pub recovery_failure_rate: f64,
    /// Multiplier over the baseline rate that counts as a spike.
    pub error_spike: f64,
    /// Critical-severity events within the recent window.
    pub critical_errors: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.1,
            specific_error_count: 10,
            recovery_failure_rate: 0.2,
            error_spike: 2.0,
            critical_errors: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAnomaly {
    #[serde(rename = "type")]
    pub anomaly_type: String,
    pub severity: ErrorSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAnalysisReport {
    pub total_errors: usize,
    pub error_rate: f64,
    pub error_distribution: HashMap<String, usize>,
    pub anomalies: Vec<ErrorAnomaly>,
    pub recommendations: Vec<String>,
    pub analysis_window_minutes: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Metrics {
    counts: HashMap<String, u64>,
    window: VecDeque<ErrorClassification>,
    recovery_attempts: HashMap<String, u64>,
    recovery_successes: HashMap<String, u64>,
    last_seen: HashMap<String, DateTime<Utc>>,
}

/// Rolling error counters with anomaly detection and operator alerting.
pub struct ErrorAnalytics {
    metrics: Mutex<Metrics>,
    thresholds: RwLock<AlertThresholds>,
    alerts: Option<Arc<dyn AlertService>>,
    baseline_error_rate: f64,
    /// Assumed request throughput used by the recent-rate heuristic; swap
    /// in observed throughput where available.
    requests_per_minute: f64,
}

impl ErrorAnalytics {
    pub fn new(alerts: Option<Arc<dyn AlertService>>) -> Self {
        Self {
            metrics: Mutex::new(Metrics::default()),
            thresholds: RwLock::new(AlertThresholds::default()),
            alerts,
            baseline_error_rate: 0.05,
            requests_per_minute: 100.0,
        }
    }

    pub fn with_requests_per_minute(mut self, requests_per_minute: f64) -> Self {
        self.requests_per_minute = requests_per_minute;
        self
    }

    pub async fn thresholds(&self) -> AlertThresholds {
        *self.thresholds.read().await
    }

    pub async fn set_thresholds(&self, thresholds: AlertThresholds) {
        *self.thresholds.write().await = thresholds;
    }

    pub async fn record_error(&self, classification: &ErrorClassification) {
        let critical_alert = {
            let mut metrics = self.metrics.lock().await;
            *metrics
                .counts
                .entry(classification.category.as_str().to_string())
                .or_default() += 1;
            *metrics
                .counts
                .entry(classification.error_kind.as_str().to_string())
                .or_default() += 1;
            metrics
                .last_seen
                .insert(classification.error_kind.as_str().to_string(), Utc::now());

            metrics.window.push_back(classification.clone());
            while metrics.window.len() > WINDOW_CAP {
                metrics.window.pop_front();
            }

            if classification.severity == ErrorSeverity::Critical {
                let recent_critical = metrics
                    .window
                    .iter()
                    .rev()
                    .take(CRITICAL_LOOKBACK)
                    .filter(|e| e.severity == ErrorSeverity::Critical)
                    .count();
                let threshold = self.thresholds.read().await.critical_errors;
                (recent_critical >= threshold).then_some(recent_critical)
            } else {
                None
            }
        };

        if let (Some(count), Some(alerts)) = (critical_alert, &self.alerts) {
            alerts
                .send_alert(
                    ErrorSeverity::Critical,
                    &format!("critical error threshold exceeded: {count} errors"),
                    json!({
                        "error_type": classification.error_kind.as_str(),
                        "category": classification.category.as_str(),
                        "message": classification.message,
                    }),
                )
                .await;
        }
    }

    pub async fn record_recovery(&self, category: ErrorCategory, success: bool) {
        let mut metrics = self.metrics.lock().await;
        *metrics
            .recovery_attempts
            .entry(category.as_str().to_string())
            .or_default() += 1;
        if success {
            *metrics
                .recovery_successes
                .entry(category.as_str().to_string())
                .or_default() += 1;
        }
    }

    pub async fn analyze(&self, window_minutes: i64) -> ErrorAnalysisReport {
        let thresholds = *self.thresholds.read().await;
        let cutoff = Utc::now() - ChronoDuration::minutes(window_minutes);

        let (recent, window_len, recovery_failure_rate) = {
            let metrics = self.metrics.lock().await;
            let recent: Vec<ErrorClassification> = metrics
                .window
                .iter()
                .filter(|e| e.timestamp > cutoff)
                .cloned()
                .collect();
            let attempts: u64 = metrics.recovery_attempts.values().sum();
            let successes: u64 = metrics.recovery_successes.values().sum();
            let failure_rate = if attempts > 0 {
                1.0 - successes as f64 / attempts as f64
            } else {
                0.0
            };
            (recent, metrics.window.len(), failure_rate)
        };

        let total_errors = recent.len();
        let error_rate = total_errors as f64 / window_len.max(1) as f64;

        let mut distribution: HashMap<String, usize> = HashMap::new();
        let mut severity_counts: HashMap<ErrorSeverity, usize> = HashMap::new();
        for error in &recent {
            *distribution
                .entry(error.category.as_str().to_string())
                .or_default() += 1;
            *severity_counts.entry(error.severity).or_default() += 1;
        }

        let mut anomalies = Vec::new();

        if error_rate > thresholds.error_rate {
            anomalies.push(ErrorAnomaly {
                anomaly_type: "high_error_rate".to_string(),
                severity: ErrorSeverity::Critical,
                value: Some(error_rate),
                threshold: Some(thresholds.error_rate),
                error_type: None,
                count: None,
                detected_at: Utc::now(),
            });
        }

        for (error_type, count) in &distribution {
            if *count > thresholds.specific_error_count {
                anomalies.push(ErrorAnomaly {
                    anomaly_type: "frequent_error".to_string(),
                    severity: ErrorSeverity::High,
                    value: None,
                    threshold: None,
                    error_type: Some(error_type.clone()),
                    count: Some(*count),
                    detected_at: Utc::now(),
                });
            }
        }

        if error_rate > self.baseline_error_rate * thresholds.error_spike {
            anomalies.push(ErrorAnomaly {
                anomaly_type: "error_spike".to_string(),
                severity: ErrorSeverity::High,
                value: Some(error_rate / self.baseline_error_rate),
                threshold: Some(thresholds.error_spike),
                error_type: None,
                count: None,
                detected_at: Utc::now(),
            });
        }

        let critical_count = severity_counts
            .get(&ErrorSeverity::Critical)
            .copied()
            .unwrap_or(0);
        if critical_count >= thresholds.critical_errors {
            anomalies.push(ErrorAnomaly {
                anomaly_type: "critical_error_threshold".to_string(),
                severity: ErrorSeverity::Critical,
                value: None,
                threshold: Some(thresholds.critical_errors as f64),
                error_type: None,
                count: Some(critical_count),
                detected_at: Utc::now(),
            });
        }

        if recovery_failure_rate > thresholds.recovery_failure_rate {
            anomalies.push(ErrorAnomaly {
                anomaly_type: "high_recovery_failure".to_string(),
                severity: ErrorSeverity::High,
                value: Some(recovery_failure_rate),
                threshold: Some(thresholds.recovery_failure_rate),
                error_type: None,
                count: None,
                detected_at: Utc::now(),
            });
        }

        if let Some(alerts) = &self.alerts {
            let critical: Vec<&ErrorAnomaly> = anomalies
                .iter()
                .filter(|a| a.severity == ErrorSeverity::Critical)
                .collect();
            if !critical.is_empty() {
                alerts
                    .send_alert(
                        ErrorSeverity::Critical,
                        &format!("critical anomalies detected: {}", critical.len()),
                        json!({ "anomalies": critical }),
                    )
                    .await;
            }
        }

        let recommendations = recommendations_for(&anomalies, &distribution, error_rate);

        ErrorAnalysisReport {
            total_errors,
            error_rate,
            error_distribution: distribution,
            anomalies,
            recommendations,
            analysis_window_minutes: window_minutes,
            timestamp: Utc::now(),
        }
    }

    /// Errors in the last `minutes` against the assumed request throughput.
    pub async fn recent_error_rate(&self, minutes: i64) -> f64 {
        let cutoff = Utc::now() - ChronoDuration::minutes(minutes);
        let metrics = self.metrics.lock().await;
        let recent = metrics.window.iter().filter(|e| e.timestamp > cutoff).count();
        recent as f64 / (minutes as f64 * self.requests_per_minute)
    }

    pub async fn top_errors(&self, limit: usize) -> Vec<(String, usize)> {
        let metrics = self.metrics.lock().await;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for error in &metrics.window {
            *counts
                .entry(error.error_kind.as_str().to_string())
                .or_default() += 1;
        }
        let mut out: Vec<(String, usize)> = counts.into_iter().collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out.truncate(limit);
        out
    }

    pub async fn stats(&self) -> serde_json::Value {
        let metrics = self.metrics.lock().await;
        let total: u64 = ErrorCategory::ALL
            .iter()
            .map(|c| metrics.counts.get(c.as_str()).copied().unwrap_or(0))
            .sum();

        let category_distribution: HashMap<String, serde_json::Value> = ErrorCategory::ALL
            .iter()
            .map(|category| {
                let count = metrics.counts.get(category.as_str()).copied().unwrap_or(0);
                (
                    category.as_str().to_string(),
                    json!({
                        "count": count,
                        "percentage": if total > 0 { count as f64 / total as f64 } else { 0.0 },
                    }),
                )
            })
            .collect();

        let recovery: HashMap<String, serde_json::Value> = metrics
            .recovery_attempts
            .iter()
            .map(|(category, attempts)| {
                let successes = metrics
                    .recovery_successes
                    .get(category)
                    .copied()
                    .unwrap_or(0);
                (
                    category.clone(),
                    json!({
                        "attempts": attempts,
                        "successes": successes,
                        "success_rate":
                            if *attempts > 0 { successes as f64 / *attempts as f64 } else { 0.0 },
                    }),
                )
            })
            .collect();

        json!({
            "total_errors": total,
            "category_distribution": category_distribution,
            "recovery_stats": recovery,
        })
    }
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 5] = [
        ErrorCategory::Transient,
        ErrorCategory::Resource,
        ErrorCategory::Validation,
        ErrorCategory::Permanent,
        ErrorCategory::Unknown,
    ];
}

fn recommendations_for(
    anomalies: &[ErrorAnomaly],
    distribution: &HashMap<String, usize>,
    error_rate: f64,
) -> Vec<String> {
    let mut out = Vec::new();

    for anomaly in anomalies {
        match anomaly.anomaly_type.as_str() {
            "high_error_rate" => out.push(format!(
                "Consider scaling up workers or investigating system load. Current error rate: {:.1}%",
                anomaly.value.unwrap_or(0.0) * 100.0
            )),
            "frequent_error" if anomaly.error_type.as_deref() == Some("resource") => out.push(
                "Resource errors detected: check GPU and memory availability; consider resource pooling or queuing."
                    .to_string(),
            ),
            "frequent_error" if anomaly.error_type.as_deref() == Some("transient") => out.push(
                "High number of transient errors: check network stability and external service health."
                    .to_string(),
            ),
            "error_spike" => out.push(format!(
                "Error spike detected ({:.1}x normal). Investigate recent changes or external factors.",
                anomaly.value.unwrap_or(0.0)
            )),
            "critical_error_threshold" => out.push(format!(
                "Multiple critical errors detected ({}). Immediate investigation required.",
                anomaly.count.unwrap_or(0)
            )),
            "high_recovery_failure" => out.push(format!(
                "Recovery mechanisms failing ({:.1}% failure rate). Review recovery strategies and thresholds.",
                anomaly.value.unwrap_or(0.0) * 100.0
            )),
            _ => {}
        }
    }

    if distribution.get("validation").copied().unwrap_or(0) > 5 {
        out.push(
            "Multiple validation errors: review input validation and improve user feedback."
                .to_string(),
        );
    }

    if error_rate > 0.05 && !anomalies.iter().any(|a| a.anomaly_type == "high_error_rate") {
        out.push("Elevated error rate detected. Monitor closely for trends.".to_string());
    }

    out
}
