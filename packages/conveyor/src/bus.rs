//! Broadcast event bus.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: slow receivers may miss events
//! - **In-memory only**: events are not persisted
//! - **Publish order per subscriber**: each receiver observes events in the
//!   order they were published
//!
//! Publishing never blocks: a full channel lags the slow receiver rather
//! than stalling the publisher. For durability, rely on entity status
//! fields and the job queue, not the bus.

use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 4096;

/// Clonable broadcast bus for a single event type.
///
/// Clones share the underlying channel, so any clone can publish and any
/// clone can mint new subscribers.
#[derive(Clone)]
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with a specific capacity. The capacity bounds how far a
    /// slow receiver may fall behind before it starts lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers (fire-and-forget).
    ///
    /// Returns the number of receivers that got the event. Zero receivers
    /// is not an error.
    pub fn publish(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() {
        let bus: EventBus<u32> = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(42);
        assert_eq!(rx.recv().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus: EventBus<u32> = EventBus::new();
        assert_eq!(bus.publish(1), 0);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus: EventBus<&'static str> = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.publish("hello"), 2);
        assert_eq!(rx1.recv().await.unwrap(), "hello");
        assert_eq!(rx2.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus: EventBus<u32> = EventBus::new();
        let mut rx = bus.subscribe();

        for n in 0..10 {
            bus.publish(n);
        }
        for n in 0..10 {
            assert_eq!(rx.recv().await.unwrap(), n);
        }
    }

    #[tokio::test]
    async fn clones_share_the_channel() {
        let bus: EventBus<u32> = EventBus::new();
        let cloned = bus.clone();
        let mut rx = bus.subscribe();

        cloned.publish(7);
        assert_eq!(rx.recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus: EventBus<u32> = EventBus::new();
        bus.publish(1);

        let mut rx = bus.subscribe();
        bus.publish(2);
        assert_eq!(rx.recv().await.unwrap(), 2);
    }
}
