//! Outbound fan-out of device status updates.

use devhub_core::DeviceStatusUpdate;
use tokio::sync::broadcast;

/// Receives every status update the service wants pushed to clients.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, update: &DeviceStatusUpdate);
}

/// Broadcaster backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<DeviceStatusUpdate>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceStatusUpdate> {
        self.tx.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast(&self, update: &DeviceStatusUpdate) {
        // No receivers is not an error.
        let _ = self.tx.send(update.clone());
    }
}
