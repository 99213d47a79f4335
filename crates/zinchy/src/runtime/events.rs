//! Runtime lifecycle events.

use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications published by a runtime client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    Connected,
    Disconnected,
    Error(String),
}

/// Fan-out of runtime events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_events() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(RuntimeEvent::Connected);
        bus.emit(RuntimeEvent::Error("boom".to_string()));

        assert_eq!(a.recv().await.unwrap(), RuntimeEvent::Connected);
        assert_eq!(b.recv().await.unwrap(), RuntimeEvent::Connected);
        assert_eq!(
            a.recv().await.unwrap(),
            RuntimeEvent::Error("boom".to_string())
        );
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventBus::new().emit(RuntimeEvent::Disconnected);
    }
}
