//! State machine instances and their history.

use cascade_core::InstanceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// One record of a taken transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// The event that triggered the transition.
    pub event: String,
    /// The state the instance left.
    pub from_state: String,
    /// The state the instance entered.
    pub to_state: String,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

/// A live instance of a state machine workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineInstance {
    /// Unique identifier.
    pub instance_id: InstanceId,
    /// The state machine workflow this instance runs.
    pub workflow_id: String,
    /// The current state name.
    pub current_state: String,
    /// Instance variables; event payloads merge into these.
    #[serde(default)]
    pub variables: JsonMap<String, JsonValue>,
    /// Transition history, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance last changed.
    pub updated_at: DateTime<Utc>,
}

impl StateMachineInstance {
    /// Creates an instance in the given initial state.
    #[must_use]
    pub fn new(
        workflow_id: impl Into<String>,
        initial_state: impl Into<String>,
        variables: JsonMap<String, JsonValue>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: InstanceId::new(),
            workflow_id: workflow_id.into(),
            current_state: initial_state.into(),
            variables,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends a history record for a taken transition.
    pub fn add_history(&mut self, event: impl Into<String>, from: impl Into<String>, to: impl Into<String>) {
        self.history.push(HistoryRecord {
            event: event.into(),
            from_state: from.into(),
            to_state: to.into(),
            timestamp: Utc::now(),
        });
        self.updated_at = Utc::now();
    }
}

/// Queryable snapshot of an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    /// The instance id.
    pub instance_id: InstanceId,
    /// The workflow id.
    pub workflow_id: String,
    /// The current state name.
    pub current_state: String,
    /// True when the current state is final.
    pub is_final: bool,
    /// The instance variables.
    pub variables: JsonMap<String, JsonValue>,
    /// Transition history.
    pub history: Vec<HistoryRecord>,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance last changed.
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_records_accumulate_in_order() {
        let mut instance = StateMachineInstance::new("wf", "idle", JsonMap::new());
        instance.add_history("start", "idle", "processing");
        instance.add_history("complete", "processing", "completed");

        assert_eq!(instance.history.len(), 2);
        assert_eq!(instance.history[0].event, "start");
        assert_eq!(instance.history[1].to_state, "completed");
        assert!(instance.updated_at >= instance.created_at);
    }
}
