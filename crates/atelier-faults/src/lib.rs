pub mod analytics;
pub mod breaker;
pub mod classify;
pub mod compensation;
pub mod healing;
pub mod history;
pub mod recovery;

pub use analytics::*;
pub use breaker::*;
pub use classify::*;
pub use compensation::*;
pub use healing::*;
pub use history::*;
pub use recovery::*;

use async_trait::async_trait;
use serde_json::Value;

use atelier_types::ErrorSeverity;

/// User-facing failure notifications; implemented by the transport layer.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify_error(&self, task_id: &str, message: &str, severity: ErrorSeverity);
}

/// Operator alerting; implemented by the transport layer.
#[async_trait]
pub trait AlertService: Send + Sync {
    async fn send_alert(&self, level: ErrorSeverity, message: &str, details: Value);
}
