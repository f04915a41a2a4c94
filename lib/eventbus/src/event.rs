//! Event payload types.

use cascade_core::ExecutionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// A published event: topic, payload, and publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The topic the event was published to.
    pub topic: String,
    /// The event payload.
    pub payload: JsonValue,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Deserializes the payload as an [`ExecutionEvent`], if it is one.
    #[must_use]
    pub fn as_execution_event(&self) -> Option<ExecutionEvent> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Lifecycle event kinds published on the execution and node topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowSuspended,
    WorkflowResumed,
    WorkflowCancelled,
    WorkflowCompensating,
    WorkflowCompensated,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeRetrying,
    NodeSkipped,
}

impl ExecutionEventKind {
    /// Returns true for node-scoped kinds.
    #[must_use]
    pub fn is_node_event(&self) -> bool {
        matches!(
            self,
            Self::NodeStarted
                | Self::NodeCompleted
                | Self::NodeFailed
                | Self::NodeRetrying
                | Self::NodeSkipped
        )
    }
}

/// A lifecycle event for an execution or one of its nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// The execution this event belongs to.
    pub execution_id: ExecutionId,
    /// The node this event belongs to, for node-scoped kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// The event kind.
    pub event_type: ExecutionEventKind,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Kind-specific details (error messages, retry counts, ...).
    #[serde(default)]
    pub data: JsonMap<String, JsonValue>,
}

impl ExecutionEvent {
    /// Creates an execution-scoped event.
    #[must_use]
    pub fn execution(execution_id: ExecutionId, event_type: ExecutionEventKind) -> Self {
        Self {
            execution_id,
            node_id: None,
            event_type,
            timestamp: Utc::now(),
            data: JsonMap::new(),
        }
    }

    /// Creates a node-scoped event.
    #[must_use]
    pub fn node(
        execution_id: ExecutionId,
        node_id: impl Into<String>,
        event_type: ExecutionEventKind,
    ) -> Self {
        Self {
            execution_id,
            node_id: Some(node_id.into()),
            event_type,
            timestamp: Utc::now(),
            data: JsonMap::new(),
        }
    }

    /// Attaches a data entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Serializes to the published payload form.
    #[must_use]
    pub fn into_payload(self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_kind_scoping() {
        assert!(ExecutionEventKind::NodeStarted.is_node_event());
        assert!(!ExecutionEventKind::WorkflowStarted.is_node_event());
    }

    #[test]
    fn execution_event_payload_round_trip() {
        let event = ExecutionEvent::node(ExecutionId::new(), "a", ExecutionEventKind::NodeFailed)
            .with_data("error", json!("boom"));
        let wrapped = Event::new("workflow.node.events", event.clone().into_payload());
        let parsed = wrapped.as_execution_event().expect("execution event");
        assert_eq!(parsed.event_type, ExecutionEventKind::NodeFailed);
        assert_eq!(parsed.node_id.as_deref(), Some("a"));
        assert_eq!(parsed.data.get("error"), Some(&json!("boom")));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ExecutionEventKind::WorkflowCompensating).unwrap();
        assert_eq!(json, "\"workflow_compensating\"");
    }
}
