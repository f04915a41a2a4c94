//! Buffered in-process event bus.
//!
//! `publish` pushes into an unbounded channel and returns immediately. A
//! dispatcher task owns the other end and forwards events to per-topic
//! subscriber channels. Subscribers that fall away (dropped receivers) are
//! pruned on the next delivery; notification is best-effort by design.

use crate::event::Event;
use crate::sink::{EventError, EventSink};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

type Subscribers = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Event>>>>>;

/// An in-process event bus backed by an unbounded buffer.
#[derive(Debug, Clone)]
pub struct InMemoryEventBus {
    queue: mpsc::UnboundedSender<Event>,
    subscribers: Subscribers,
}

impl InMemoryEventBus {
    /// Creates the bus and spawns its dispatcher task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Event>();
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));

        let dispatch_to = Arc::clone(&subscribers);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut subscribers = dispatch_to.lock().unwrap();
                if let Some(list) = subscribers.get_mut(&event.topic) {
                    list.retain(|tx| tx.send(event.clone()).is_ok());
                }
            }
            debug!("event bus dispatcher stopped");
        });

        Self { queue, subscribers }
    }

    /// Subscribes to a topic; returns the receiving end of the feed.
    #[must_use]
    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Returns the number of live subscriptions for a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(topic)
            .map_or(0, Vec::len)
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for InMemoryEventBus {
    async fn publish(&self, topic: &str, payload: JsonValue) -> Result<(), EventError> {
        self.queue
            .send(Event::new(topic, payload))
            .map_err(|_| EventError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = InMemoryEventBus::new();
        let mut feed = bus.subscribe("orders");

        bus.publish("orders", json!({"id": 1})).await.unwrap();
        bus.publish("other", json!({"id": 2})).await.unwrap();
        bus.publish("orders", json!({"id": 3})).await.unwrap();

        let first = feed.recv().await.expect("event");
        assert_eq!(first.payload, json!({"id": 1}));
        let second = feed.recv().await.expect("event");
        assert_eq!(second.payload, json!({"id": 3}));
    }

    #[tokio::test]
    async fn publish_does_not_block_without_subscribers() {
        let bus = InMemoryEventBus::new();
        // No subscriber ever drains these; publish still returns immediately.
        for i in 0..100 {
            bus.publish("void", json!({"i": i})).await.unwrap();
        }
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::new();
        let feed = bus.subscribe("orders");
        assert_eq!(bus.subscriber_count("orders"), 1);
        drop(feed);

        bus.publish("orders", json!({})).await.unwrap();
        // Give the dispatcher a chance to run and prune.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.subscriber_count("orders"), 0);
    }
}
