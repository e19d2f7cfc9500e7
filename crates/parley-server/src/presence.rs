use std::sync::Arc;

use tokio::sync::broadcast;

use parley_core::presence::PresenceEvent;

use crate::client::ClientRegistry;

/// Topic-based publish/subscribe for presence events. Publishing never
/// blocks and never surfaces delivery failures; the bridge task fans each
/// event out to the connections subscribed to the event's room.
#[derive(Clone)]
pub struct PresenceBroadcaster {
    tx: broadcast::Sender<PresenceEvent>,
}

impl PresenceBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget publish. With no bridge running the event is dropped,
    /// which is fine — there is nobody to deliver to.
    pub fn publish(&self, event: PresenceEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::debug!(room = %e.0.room, "presence event dropped, no subscribers");
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.tx.subscribe()
    }
}

/// Start the forwarding bridge: reads from the broadcast channel and sends
/// serialized events to every client subscribed to the event's room. A
/// single task drains the channel, so per-room publish order is preserved.
pub fn start_bridge(
    registry: Arc<ClientRegistry>,
    mut rx: broadcast::Receiver<PresenceEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        registry.broadcast_to_room(event.room(), &json);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Presence bridge lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Presence channel closed");
                    break;
                }
            }
        }
    })
}
