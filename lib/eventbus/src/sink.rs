//! The one-way event sink contract.

use crate::event::Event;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Errors from event publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The event could not be enqueued.
    PublishFailed { message: String },
    /// The bus has shut down.
    Closed,
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublishFailed { message } => write!(f, "event publish failed: {message}"),
            Self::Closed => write!(f, "event bus is closed"),
        }
    }
}

impl std::error::Error for EventError {}

/// One-way event publication.
///
/// Implementations must never await subscriber completion inside `publish`;
/// publishing enqueues and returns so that node completion can never
/// deadlock on a slow subscriber.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publishes a payload to a topic.
    async fn publish(&self, topic: &str, payload: JsonValue) -> Result<(), EventError>;
}

/// An event sink that records everything published (test double).
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingSink {
    /// Creates an empty recording sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every recorded event, in publish order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Returns the recorded events for one topic.
    #[must_use]
    pub fn events_for(&self, topic: &str) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    /// Returns the number of recorded events for one topic.
    #[must_use]
    pub fn count_for(&self, topic: &str) -> usize {
        self.events_for(topic).len()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, topic: &str, payload: JsonValue) -> Result<(), EventError> {
        self.events
            .lock()
            .unwrap()
            .push(Event::new(topic, payload));
        Ok(())
    }
}
