//! Broadcast event sink for workflow lifecycle notifications.
//!
//! Built on `tokio::sync::broadcast`, so multiple consumers (websockets,
//! audit tails, tests) can observe the same stream. Publishing with no
//! active subscribers is a no-op; delivery is fire-and-forget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_core::repository::EventSink;
use tokio::sync::broadcast;
use tracing::debug;

/// One published workflow event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub data: Value,
    pub published_at: DateTime<Utc>,
}

/// Multi-consumer sink over a broadcast channel.
///
/// Cloning the sink clones the sender, allowing multiple producers and
/// consumers.
pub struct BroadcastEventSink {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl BroadcastEventSink {
    /// Create a new sink with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Clone for BroadcastEventSink {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for BroadcastEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastEventSink")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

impl EventSink for BroadcastEventSink {
    async fn publish(&self, event_type: &str, subject: Option<&str>, data: &Value) {
        let event = WorkflowEvent {
            event_type: event_type.to_string(),
            subject: subject.map(str::to_string),
            data: data.clone(),
            published_at: Utc::now(),
        };
        // No subscribers is fine; the event is dropped.
        if self.sender.send(event).is_err() {
            debug!(event_type, "event published with no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let sink = BroadcastEventSink::new(16);
        let mut rx = sink.subscribe();

        sink.publish(
            "instance.completed",
            Some("inst-1"),
            &json!({"status": "completed"}),
        )
        .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "instance.completed");
        assert_eq!(received.subject.as_deref(), Some("inst-1"));
        assert_eq!(received.data["status"], json!("completed"));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let sink = BroadcastEventSink::new(16);
        let mut rx1 = sink.subscribe();
        let mut rx2 = sink.subscribe();

        sink.publish("approval.decided", None, &json!({})).await;

        assert_eq!(rx1.recv().await.unwrap().event_type, "approval.decided");
        assert_eq!(rx2.recv().await.unwrap().event_type, "approval.decided");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let sink = BroadcastEventSink::new(16);
        sink.publish("instance.failed", None, &json!({})).await;
        sink.publish("instance.failed", None, &json!({})).await;
    }

    #[tokio::test]
    async fn clone_shares_channel() {
        let sink = BroadcastEventSink::new(16);
        let cloned = sink.clone();
        let mut rx = sink.subscribe();

        cloned.publish("instance.started", None, &json!({})).await;

        assert!(rx.try_recv().is_ok());
    }
}
