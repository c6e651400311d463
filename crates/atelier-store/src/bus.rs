use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use atelier_types::EngineEvent;

/// Engine-wide pub/sub fan-out. Slow subscribers lag and drop events rather
/// than back-pressuring publishers; per-task ordering is preserved for
/// subscribers that keep up.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Stream of events for a single task. Dropping the stream unsubscribes;
    /// nothing about the task is retained by the subscription.
    pub fn subscribe_task(&self, task_id: impl Into<String>) -> impl Stream<Item = EngineEvent> {
        let task_id = task_id.into();
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| match item {
            Ok(event) if event.task_id() == Some(task_id.as_str()) => Some(event),
            Ok(_) => None,
            // Lagged receivers skip missed events and continue.
            Err(BroadcastStreamRecvError::Lagged(_)) => None,
        })
    }

    /// Stream of events scoped to one project.
    pub fn subscribe_project(&self, project_id: impl Into<String>) -> impl Stream<Item = EngineEvent> {
        let project_id = project_id.into();
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| match item {
            Ok(event) if event.project_id() == Some(project_id.as_str()) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(_)) => None,
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::new("progress.update", json!({"task_id": "t-1"})));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "progress.update");
    }

    #[tokio::test]
    async fn task_stream_filters_other_tasks() {
        let bus = EventBus::new();
        let mut stream = Box::pin(bus.subscribe_task("t-1"));
        bus.publish(EngineEvent::new("progress.update", json!({"task_id": "t-2"})));
        bus.publish(EngineEvent::new(
            "progress.update",
            json!({"task_id": "t-1", "overall_progress": 10.0}),
        ));
        bus.publish(EngineEvent::new("progress.completed", json!({"task_id": "t-1"})));

        let first = stream.next().await.unwrap();
        assert_eq!(first.payload["overall_progress"], 10.0);
        let second = stream.next().await.unwrap();
        assert_eq!(second.event, "progress.completed");
    }

    #[tokio::test]
    async fn per_task_order_is_preserved() {
        let bus = EventBus::new();
        let mut stream = Box::pin(bus.subscribe_task("t-1"));
        for step in 0..5 {
            bus.publish(EngineEvent::new(
                "progress.update",
                json!({"task_id": "t-1", "step": step}),
            ));
        }
        for step in 0..5 {
            let event = stream.next().await.unwrap();
            assert_eq!(event.payload["step"], step);
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::new("worker.spawned", json!({"worker_id": "w-1"})));
    }
}
