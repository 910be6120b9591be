//! Event bus for discovery events.
//!
//! The orchestrator publishes; the CLI, tests and any embedding service
//! subscribe. Publishing never blocks and never fails when nobody listens.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::event::{DiscoveryEvent, EventMetadata};

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Broadcast bus of `(DiscoveryEvent, EventMetadata)` pairs.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(DiscoveryEvent, EventMetadata)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// The capacity determines how many events are buffered for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event with default metadata.
    ///
    /// Returns `true` if there was at least one subscriber.
    pub fn publish(&self, event: DiscoveryEvent) -> bool {
        self.publish_with_source(event, "fieldscan")
    }

    pub fn publish_with_source(&self, event: DiscoveryEvent, source: impl Into<String>) -> bool {
        self.publish_with_metadata(event, EventMetadata::new(source))
    }

    pub fn publish_with_metadata(&self, event: DiscoveryEvent, metadata: EventMetadata) -> bool {
        self.tx.send((event, metadata)).is_ok()
    }

    /// Subscribe to all events.
    ///
    /// If the subscriber falls behind, older events are dropped.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to events matching a filter.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&DiscoveryEvent) -> bool + Send + 'static,
    {
        FilteredReceiver {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    /// Subscribe to operator-facing alert events only.
    pub fn alert_events(&self) -> FilteredReceiver<fn(&DiscoveryEvent) -> bool> {
        self.subscribe_filtered(DiscoveryEvent::is_alert_event)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared event bus handle.
pub type SharedEventBus = Arc<EventBus>;

/// Receiver for all events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(DiscoveryEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event; `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<(DiscoveryEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                // Missed some events, keep reading from the oldest retained one.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<(DiscoveryEvent, EventMetadata)> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<DiscoveryEvent> {
        let mut out = Vec::new();
        while let Some((event, _)) = self.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Receiver for filtered events from the event bus.
pub struct FilteredReceiver<F>
where
    F: Fn(&DiscoveryEvent) -> bool + Send,
{
    rx: broadcast::Receiver<(DiscoveryEvent, EventMetadata)>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&DiscoveryEvent) -> bool + Send,
{
    pub async fn recv(&mut self) -> Option<(DiscoveryEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<(DiscoveryEvent, EventMetadata)> {
        loop {
            match self.rx.try_recv() {
                Ok((event, meta)) if (self.filter)(&event) => return Some((event, meta)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
