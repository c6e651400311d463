use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event published on the engine bus. `event` is a dotted type name such as
/// `progress.update` or `worker.spawned`; the payload shape is owned by the
/// publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            at: Utc::now(),
        }
    }

    /// Task id carried by the payload, when present. Subscribers filter on
    /// this to follow a single task.
    pub fn task_id(&self) -> Option<&str> {
        self.payload.get("task_id").and_then(Value::as_str)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.payload.get("project_id").and_then(Value::as_str)
    }
}

/// Progress event type names, kept as constants so publishers and tests
/// cannot drift apart.
pub mod progress_events {
    pub const UPDATE: &str = "progress.update";
    pub const COMPLETED: &str = "progress.completed";
    pub const FAILED: &str = "progress.failed";
    pub const CANCELLED: &str = "progress.cancelled";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_id_is_read_from_payload() {
        let event = EngineEvent::new(
            progress_events::UPDATE,
            json!({"task_id": "t-1", "overall_progress": 40.0}),
        );
        assert_eq!(event.task_id(), Some("t-1"));
        assert_eq!(event.project_id(), None);
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = EngineEvent::new("worker.spawned", json!({"worker_id": "w-1"}));
        let raw = serde_json::to_string(&event).unwrap();
        let back: EngineEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.event, "worker.spawned");
        assert_eq!(back.payload["worker_id"], "w-1");
    }
}
