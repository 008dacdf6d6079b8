use tokio::sync::broadcast;

use crate::StreamEvent;

/// Broadcast event bus shared by every collector component.
///
/// `publish()` is a sync call so it works from both async tasks and blocking
/// contexts. With no subscribers, events are silently dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: StreamEvent) {
        let _ = self.tx.send(event);
    }

    /// Each subscriber gets an independent receiver; slow subscribers observe
    /// `RecvError::Lagged(n)` instead of blocking producers.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(32)
    }
}
