use flotilla_primitives::Event;
use tokio::sync::broadcast;
use tracing::debug;

const BUS_CAPACITY: usize = 256;

/// Broadcast fan-out of core events. Subscribers that fall behind lose the
/// oldest events; the core never blocks on slow consumers.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        debug!(?event, "Event");
        // An error only means there are no subscribers right now.
        let _subscribers = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
