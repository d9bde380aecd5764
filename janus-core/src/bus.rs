//! Fan-out event bus feeding the SSE subscribers.
//!
//! Every subscriber gets its own bounded inbox. Publishing never blocks and
//! never fails: a subscriber whose inbox is full is evicted on the spot, so a
//! slow SSE consumer can never back-pressure a running flash pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

/// Inbox capacity per subscriber.
const INBOX_CAPACITY: usize = 256;

/// One event as delivered to a subscriber: a type tag plus the serialized
/// JSON payload.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub event_type: String,
    pub payload: String,
}

/// Broadcast bus with per-subscriber bounded inboxes.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<BusEvent>>>,
    counter: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send an event to every active subscriber.
    ///
    /// Serialization is best-effort: a payload that fails to encode is
    /// delivered as `null` rather than dropped.
    pub fn publish<T: Serialize>(&self, event_type: &str, payload: &T) {
        let payload = serde_json::to_string(payload).unwrap_or_else(|_| "null".to_string());
        let event = BusEvent {
            event_type: event_type.to_string(),
            payload,
        };
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|_, tx| tx.try_send(event.clone()).is_ok());
        let evicted = before - subscribers.len();
        if evicted > 0 {
            tracing::warn!(evicted, "evicted slow event subscribers");
        }
    }

    /// Register a new subscriber.
    ///
    /// Returns the subscriber id (for [`EventBus::unsubscribe`]) and the
    /// inbox receiver. Events arrive in publish order.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<BusEvent>) {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.subscribers.write().insert(id, tx);
        (id, rx)
    }

    /// Deregister a subscriber; safe to call for an already-evicted id.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe();

        for i in 0..10 {
            bus.publish("tick", &i);
        }

        for i in 0..10 {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.event_type, "tick");
            assert_eq!(ev.payload, i.to_string());
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_without_blocking() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        // Fill the inbox to the brim, then one more.
        for i in 0..=INBOX_CAPACITY {
            bus.publish("flood", &i);
        }
        assert_eq!(bus.subscriber_count(), 0);

        // The buffered prefix is still deliverable.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload, "0");
    }

    #[tokio::test]
    async fn other_subscribers_survive_an_eviction() {
        let bus = EventBus::new();
        let (_slow, _slow_rx) = bus.subscribe();
        let (_ok, mut ok_rx) = bus.subscribe();

        for i in 0..INBOX_CAPACITY {
            bus.publish("flood", &i);
            // Keep the healthy inbox drained.
            let _ = ok_rx.recv().await.unwrap();
        }
        bus.publish("flood", &"last");
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(ok_rx.recv().await.unwrap().payload, "\"last\"");
    }

    #[tokio::test]
    async fn unsubscribe_removes_inbox() {
        let bus = EventBus::new();
        let (id, _rx) = bus.subscribe();
        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);
        // Idempotent.
        bus.unsubscribe(id);
    }
}
