//! Error types for the workflow crate.
//!
//! - `ValidationError`: a single structural defect in a workflow definition;
//!   validation collects all of them rather than stopping at the first.
//! - `ParseError`: failure to turn a document into a `Workflow`.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single validation defect in a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationError {
    /// Two nodes share the same ID.
    DuplicateNodeId { node_id: NodeId },
    /// An edge references a source node that does not exist.
    EdgeSourceNotFound { node_id: NodeId },
    /// An edge references a target node that does not exist.
    EdgeTargetNotFound { node_id: NodeId },
    /// A node depends on a node that does not exist.
    DependencyNotFound { node_id: NodeId, dependency: NodeId },
    /// The dependency graph of a DAG workflow contains a cycle.
    ///
    /// Carries the first cycle detected, in edge order.
    CycleDetected { cycle: Vec<NodeId> },
    /// A Control node is missing its subtype.
    ControlSubtypeMissing { node_id: NodeId },
    /// A Switch control node has no branches.
    SwitchBranchesMissing { node_id: NodeId },
    /// An Agent node has no `agent_id` in its config.
    AgentIdMissing { node_id: NodeId },
    /// A Tool node has no `tool_id` in its config.
    ToolIdMissing { node_id: NodeId },
    /// A state machine workflow has no `initial_state`.
    InitialStateMissing,
    /// The named initial state is not defined.
    InitialStateUnknown { name: String },
    /// A state machine must have exactly one state of kind Initial.
    InitialStateCount { count: usize },
    /// Two states share the same name.
    DuplicateStateName { name: String },
    /// A transition targets a state that does not exist.
    TransitionTargetUnknown { state: String, target: String },
    /// No Final state is reachable from the initial state.
    FinalStateUnreachable,
    /// A workflow variable shadows a node id, making `${name}` ambiguous.
    VariableShadowsNode { name: String },
    /// Nodes not connected to the rest of a multi-node DAG.
    IsolatedNodes { node_ids: Vec<NodeId> },
    /// The workflow kind is recognized but not executable.
    UnsupportedKind { kind: String },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNodeId { node_id } => {
                write!(f, "duplicate node id: {node_id}")
            }
            Self::EdgeSourceNotFound { node_id } => {
                write!(f, "edge source '{node_id}' not found in nodes")
            }
            Self::EdgeTargetNotFound { node_id } => {
                write!(f, "edge target '{node_id}' not found in nodes")
            }
            Self::DependencyNotFound {
                node_id,
                dependency,
            } => {
                write!(f, "node '{node_id}' depends on unknown node '{dependency}'")
            }
            Self::CycleDetected { cycle } => {
                let path = cycle
                    .iter()
                    .map(NodeId::as_str)
                    .collect::<Vec<_>>()
                    .join(" -> ");
                write!(f, "workflow contains a cycle: {path}")
            }
            Self::ControlSubtypeMissing { node_id } => {
                write!(f, "control node '{node_id}' has no subtype")
            }
            Self::SwitchBranchesMissing { node_id } => {
                write!(f, "switch node '{node_id}' has no branches")
            }
            Self::AgentIdMissing { node_id } => {
                write!(f, "agent node '{node_id}' has no agent_id")
            }
            Self::ToolIdMissing { node_id } => {
                write!(f, "tool node '{node_id}' has no tool_id")
            }
            Self::InitialStateMissing => {
                write!(f, "state machine has no initial_state")
            }
            Self::InitialStateUnknown { name } => {
                write!(f, "initial state '{name}' is not defined")
            }
            Self::InitialStateCount { count } => {
                write!(f, "state machine must have exactly one initial state, found {count}")
            }
            Self::DuplicateStateName { name } => {
                write!(f, "duplicate state name: {name}")
            }
            Self::TransitionTargetUnknown { state, target } => {
                write!(f, "state '{state}' has a transition to unknown state '{target}'")
            }
            Self::FinalStateUnreachable => {
                write!(f, "no final state is reachable from the initial state")
            }
            Self::VariableShadowsNode { name } => {
                write!(f, "variable '{name}' shadows a node id")
            }
            Self::IsolatedNodes { node_ids } => {
                let ids = node_ids
                    .iter()
                    .map(NodeId::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "isolated nodes found: {ids}")
            }
            Self::UnsupportedKind { kind } => {
                write!(f, "workflow kind '{kind}' is not supported")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Errors from parsing a workflow document.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// The document is not valid YAML.
    Yaml { message: String },
    /// The document is not valid JSON.
    Json { message: String },
    /// The document parsed but does not describe a workflow.
    InvalidDocument { message: String },
    /// The workflow parsed but failed validation.
    Validation { errors: Vec<ValidationError> },
}

impl ParseError {
    /// Returns the validation errors, if this is a validation failure.
    #[must_use]
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            Self::Validation { errors } => errors,
            _ => &[],
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yaml { message } => write!(f, "failed to parse YAML: {message}"),
            Self::Json { message } => write!(f, "failed to parse JSON: {message}"),
            Self::InvalidDocument { message } => {
                write!(f, "invalid workflow document: {message}")
            }
            Self::Validation { errors } => {
                write!(f, "workflow validation failed: ")?;
                for (i, error) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{error}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_names_the_cycle() {
        let err = ValidationError::CycleDetected {
            cycle: vec![NodeId::new("a"), NodeId::new("b"), NodeId::new("a")],
        };
        assert_eq!(err.to_string(), "workflow contains a cycle: a -> b -> a");
    }

    #[test]
    fn validation_errors_join_in_display() {
        let err = ParseError::Validation {
            errors: vec![
                ValidationError::InitialStateMissing,
                ValidationError::DuplicateStateName {
                    name: "idle".to_string(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("no initial_state"));
        assert!(text.contains("duplicate state name"));
    }

    #[test]
    fn parse_error_exposes_validation_errors() {
        let err = ParseError::Validation {
            errors: vec![ValidationError::InitialStateMissing],
        };
        assert_eq!(err.validation_errors().len(), 1);
        let err = ParseError::Yaml {
            message: "bad".to_string(),
        };
        assert!(err.validation_errors().is_empty());
    }
}
