//! Event bus.
//!
//! A thin wrapper over a tokio broadcast channel. Publishing never blocks
//! and never fails; slow subscribers lose the oldest events.

use tokio::sync::broadcast;
use tracing::trace;

use crate::events::Event;

/// Channel capacity for broadcast events
const CHANNEL_CAPACITY: usize = 1024;

/// Pub/sub channel for lifecycle events.
///
/// Clones share the same channel.
#[derive(Clone, Debug)]
pub struct EventBus<E = Event> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Create a bus buffering at most `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: E) {
        // no subscribers is fine
        if self.sender.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
