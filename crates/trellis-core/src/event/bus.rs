//! Broadcast event bus for distributing `WorkflowEvent` to subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op, so the engine can publish unconditionally.

use tokio::sync::broadcast;
use trellis_types::event::WorkflowEvent;

/// Multi-consumer bus for run lifecycle events.
///
/// Cloning the bus clones the sender; every clone feeds the same
/// subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a bus whose subscribers buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn skipped(node: &str) -> WorkflowEvent {
        WorkflowEvent::NodeSkipped {
            run_id: Uuid::nil(),
            node_id: node.to_string(),
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(skipped("a"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.node_id(), Some("a"));
    }

    #[tokio::test]
    async fn clones_feed_the_same_subscribers() {
        let bus = EventBus::new(16);
        let clone = bus.clone();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        clone.publish(skipped("b"));

        assert_eq!(rx1.recv().await.unwrap().node_id(), Some("b"));
        assert_eq!(rx2.recv().await.unwrap().node_id(), Some("b"));
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(skipped("a"));
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn debug_shows_receiver_count() {
        let bus = EventBus::default();
        let _rx = bus.subscribe();
        let debug = format!("{bus:?}");
        assert!(debug.contains("receiver_count: 1"));
    }
}
