//! Intra-node event broadcast.
//!
//! Replaces the ambient event-bus addresses of classic broker designs
//! with one typed channel. Connection tasks subscribe and react to
//! takeovers and shutdown; inter-node broadcast would attach here.

use tokio::sync::broadcast;

/// Events fanned out to connection tasks on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Another connection bound this client id; the old connection must
    /// close without publishing its will.
    SessionTakenOver { client_id: String },

    /// The broker is stopping.
    Shutdown,
}

/// Cloneable handle to the node-local event channel.
#[derive(Debug, Clone)]
pub struct Broadcast {
    sender: broadcast::Sender<BrokerEvent>,
}

impl Broadcast {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Broadcast { sender }
    }

    /// Send to all current subscribers. Lost events for lagging or absent
    /// receivers are fine; every event is recoverable from store state.
    pub fn send(&self, event: BrokerEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.sender.subscribe()
    }
}

impl Default for Broadcast {
    fn default() -> Self {
        Broadcast::new(64)
    }
}
