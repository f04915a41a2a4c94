//! Error types for the state machine runtime.

use cascade_core::InstanceId;
use std::fmt;

/// Errors from state machine operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    /// No state machine workflow registered under the id.
    WorkflowNotFound { workflow_id: String },
    /// The workflow exists but is not a state machine.
    NotAStateMachine { workflow_id: String },
    /// No instance with the given id.
    InstanceNotFound { instance_id: InstanceId },
    /// A state referenced at runtime does not exist.
    StateNotFound { name: String },
    /// A transition could not be executed.
    TransitionFailed {
        current_state: String,
        target_state: String,
        message: String,
    },
    /// An action has no registered handler.
    UnknownAction { action: String },
    /// A required action failed.
    ActionFailed { action: String, message: String },
}

impl fmt::Display for StateMachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "state machine workflow not found: {workflow_id}")
            }
            Self::NotAStateMachine { workflow_id } => {
                write!(f, "workflow {workflow_id} is not a state machine")
            }
            Self::InstanceNotFound { instance_id } => {
                write!(f, "state machine instance not found: {instance_id}")
            }
            Self::StateNotFound { name } => write!(f, "state not found: {name}"),
            Self::TransitionFailed {
                current_state,
                target_state,
                message,
            } => {
                write!(
                    f,
                    "invalid state transition from '{current_state}' to '{target_state}': {message}"
                )
            }
            Self::UnknownAction { action } => write!(f, "no handler for action type: {action}"),
            Self::ActionFailed { action, message } => {
                write!(f, "action '{action}' failed: {message}")
            }
        }
    }
}

impl std::error::Error for StateMachineError {}
