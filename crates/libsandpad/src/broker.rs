use tokio::sync::broadcast;
use tracing::trace;

use sandpad_protocol::Event;

/// Fan-out of coordinator events to every subscribed rendering shell.
pub struct EventBroker {
    tx: broadcast::Sender<Event>,
}

impl EventBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn broadcast(&self, event: Event) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            trace!(?event, "event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EVENT_CAPACITY)
    }
}
