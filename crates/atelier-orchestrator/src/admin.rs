use serde_json::{json, Value};
use std::collections::HashMap;

use atelier_faults::{AlertThresholds, BreakerStats, ErrorAnalysisReport, ErrorHistory, HealingResult};

use crate::dispatch::Orchestrator;

/// Operational surface consumed by admin transports. Everything here is
/// read-mostly; the two mutations are breaker resets and alert thresholds.
impl Orchestrator {
    pub async fn error_analysis(&self, window_minutes: i64) -> ErrorAnalysisReport {
        self.analytics.analyze(window_minutes).await
    }

    pub async fn circuit_breakers(&self) -> HashMap<String, BreakerStats> {
        self.breakers.all_stats().await
    }

    pub async fn reset_circuit_breaker(&self, name: &str) -> bool {
        self.breakers.reset(name).await
    }

    /// Run one diagnostics-and-remediation cycle immediately.
    pub async fn trigger_diagnose(&self) -> Vec<HealingResult> {
        self.healer.run_cycle().await
    }

    pub async fn alert_thresholds(&self) -> AlertThresholds {
        self.analytics.thresholds().await
    }

    pub async fn update_alert_thresholds(&self, thresholds: AlertThresholds) {
        self.analytics.set_thresholds(thresholds).await;
    }

    pub async fn task_error_history(&self, task_id: &str) -> Option<ErrorHistory> {
        self.recovery.history.history(task_id).await
    }

    pub async fn list_templates(
        &self,
        category: Option<&str>,
        tags: Option<&[String]>,
    ) -> Vec<atelier_templates::TemplateInfo> {
        self.registry.list(category, tags).await
    }

    pub async fn get_template(
        &self,
        template_id: &str,
        version: Option<&str>,
    ) -> Result<std::sync::Arc<atelier_templates::Template>, atelier_templates::TemplateError> {
        self.registry.get(template_id, version).await
    }

    pub async fn reload_template(
        &self,
        template_id: &str,
        version: &str,
    ) -> Result<String, atelier_templates::TemplateError> {
        self.registry.reload(template_id, version).await
    }

    /// One combined snapshot for dashboards.
    pub async fn system_report(&self) -> Value {
        json!({
            "workers": self.pool.metrics().await,
            "breakers": self.breakers.health().await,
            "queue_depth": self.queue.depth().await,
            "wait_list_depth": self.wait_list.len().await,
            "dead_letters": self.dead_letters.len().await,
            "recovery": self.recovery.metrics().await,
            "compensation": self.compensation.stats().await,
            "healing": self.healer.stats().await,
            "errors": self.analytics.stats().await,
        })
    }
}
