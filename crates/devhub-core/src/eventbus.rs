//! Event bus for hub notifications.
//!
//! Delivery order: every subscriber observes events in publish order. A
//! subscriber that falls more than the channel capacity behind skips the
//! oldest events and keeps receiving from the newest retained one.

use crate::event::{EventMetadata, HubEvent};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Broadcast event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(HubEvent, EventMetadata)>,
    name: String,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    ///
    /// The capacity determines how many events are buffered for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            name: "default".to_string(),
        }
    }

    /// Create a new event bus with a name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            tx: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event with default metadata.
    ///
    /// Returns `true` if there was at least one subscriber.
    pub fn publish(&self, event: HubEvent) -> bool {
        self.publish_with_source(event, "system")
    }

    /// Publish an event with a custom source.
    pub fn publish_with_source(&self, event: HubEvent, source: impl Into<String>) -> bool {
        self.publish_with_metadata(event, EventMetadata::new(source))
    }

    /// Publish an event with custom metadata.
    pub fn publish_with_metadata(&self, event: HubEvent, metadata: EventMetadata) -> bool {
        tracing::trace!(bus = %self.name, event = %event, "publishing event");
        self.tx.send((event, metadata)).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to events matching a filter.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&HubEvent) -> bool + Send + 'static,
    {
        FilteredReceiver::new(self.tx.subscribe(), filter)
    }

    /// Create a filtered subscription helper for common patterns.
    pub fn filter(&self) -> FilterBuilder {
        FilterBuilder {
            tx: self.tx.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(HubEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` once the event bus is closed.
    pub async fn recv(&mut self) -> Option<(HubEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event bus receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<(HubEvent, EventMetadata)> {
        self.rx.try_recv().ok()
    }
}

/// Receiver for filtered events from the event bus.
pub struct FilteredReceiver<F>
where
    F: Fn(&HubEvent) -> bool + Send,
{
    rx: broadcast::Receiver<(HubEvent, EventMetadata)>,
    filter: F,
    skipped: u64,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&HubEvent) -> bool + Send,
{
    fn new(rx: broadcast::Receiver<(HubEvent, EventMetadata)>, filter: F) -> Self {
        Self {
            rx,
            filter,
            skipped: 0,
        }
    }

    /// Receive the next event matching the filter.
    ///
    /// Returns `None` once the event bus is closed.
    pub async fn recv(&mut self) -> Option<(HubEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.skipped += skipped;
                    tracing::warn!(skipped, "filtered event bus receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a matching event without blocking.
    pub fn try_recv(&mut self) -> Option<(HubEvent, EventMetadata)> {
        loop {
            match self.rx.try_recv() {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.skipped += skipped;
                    tracing::warn!(skipped, "filtered event bus receiver lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Total events dropped because this receiver fell behind.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

/// Builder for creating filtered subscriptions.
pub struct FilterBuilder {
    tx: broadcast::Sender<(HubEvent, EventMetadata)>,
}

impl FilterBuilder {
    /// Subscribe to device updates only.
    pub fn device_events(&self) -> FilteredReceiver<fn(&HubEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), HubEvent::is_device_event)
    }

    /// Subscribe to adapter lifecycle and health events only.
    pub fn adapter_events(&self) -> FilteredReceiver<fn(&HubEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), HubEvent::is_adapter_event)
    }

    /// Subscribe to updates for one device.
    pub fn device(
        &self,
        device_id: impl Into<String>,
    ) -> FilteredReceiver<impl Fn(&HubEvent) -> bool + Send + 'static> {
        let target = device_id.into();
        FilteredReceiver::new(self.tx.subscribe(), move |event| {
            event.device_id() == Some(target.as_str())
        })
    }

    /// Subscribe with a custom filter function.
    pub fn custom<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&HubEvent) -> bool + Send + 'static,
    {
        FilteredReceiver::new(self.tx.subscribe(), filter)
    }
}

/// Shared event bus handle.
pub type SharedEventBus = Arc<EventBus>;
