//! State machine definition types.
//!
//! A state machine workflow is a set of named states with guarded,
//! event-driven transitions and enter/exit/transition action lists.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// The kind of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// The single entry state of the machine.
    Initial,
    /// An intermediate state.
    #[default]
    Normal,
    /// A terminal state; reaching it completes the instance.
    Final,
}

/// An action dispatched through the action registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Action type, the registry key (built-ins: `log`, `set_variable`,
    /// `publish_event`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Parameters passed to the handler.
    #[serde(default)]
    pub params: JsonMap<String, JsonValue>,
    /// When true, a missing handler or handler failure is logged and
    /// skipped instead of failing the transition.
    #[serde(default)]
    pub optional: bool,
}

impl ActionSpec {
    /// Creates an action of the given type.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: JsonMap::new(),
            optional: false,
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Marks the action as optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A guarded, event-driven transition out of a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// The event name that triggers this transition.
    pub event: String,
    /// Optional guard predicate evaluated against instance variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Name of the target state.
    pub target: String,
    /// Actions run between the source's exit and the target's enter actions.
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

impl Transition {
    /// Creates a transition on `event` to `target`.
    #[must_use]
    pub fn new(event: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            condition: None,
            target: target.into(),
            actions: Vec::new(),
        }
    }

    /// Sets the guard condition.
    #[must_use]
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Adds a transition action.
    #[must_use]
    pub fn with_action(mut self, action: ActionSpec) -> Self {
        self.actions.push(action);
        self
    }
}

/// A state of a state machine workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// State name, unique within the workflow.
    pub name: String,
    /// State kind.
    #[serde(rename = "type", default)]
    pub kind: StateKind,
    /// Actions run when the state is entered.
    #[serde(default)]
    pub on_enter: Vec<ActionSpec>,
    /// Actions run when the state is exited.
    #[serde(default)]
    pub on_exit: Vec<ActionSpec>,
    /// Outgoing transitions, matched in declaration order.
    #[serde(default)]
    pub transitions: Vec<Transition>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: JsonMap<String, JsonValue>,
}

impl State {
    /// Creates a state of the given kind with no actions or transitions.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: StateKind) -> Self {
        Self {
            name: name.into(),
            kind,
            on_enter: Vec::new(),
            on_exit: Vec::new(),
            transitions: Vec::new(),
            metadata: JsonMap::new(),
        }
    }

    /// Adds an outgoing transition.
    #[must_use]
    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    /// Adds an enter action.
    #[must_use]
    pub fn with_on_enter(mut self, action: ActionSpec) -> Self {
        self.on_enter.push(action);
        self
    }

    /// Adds an exit action.
    #[must_use]
    pub fn with_on_exit(mut self, action: ActionSpec) -> Self {
        self.on_exit.push(action);
        self
    }
}
