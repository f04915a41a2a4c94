//! Workflow definition types.
//!
//! A workflow is a named, versioned definition that is immutable once
//! registered under a given `(id, version)`. DAG workflows carry nodes and
//! edges; state machine workflows carry states plus initial/final markers.

use crate::edge::Edge;
use crate::error::ValidationError;
use crate::graph::DependencyGraph;
use crate::node::{Node, NodeId, NodeKind};
use crate::state::{State, StateKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// The execution model of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Directed acyclic graph of nodes, driven by data-flow edges.
    #[default]
    Dag,
    /// Finite automaton driven by external events.
    StateMachine,
    /// Reserved; parses but is rejected by validation.
    Hybrid,
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dag => "dag",
            Self::StateMachine => "state_machine",
            Self::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// The action a workflow-level error handler applies when it matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerAction {
    /// Action type: `retry`, `skip`, `fail`, `fallback`, `compensate`,
    /// or `escalate`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Target node id for `fallback`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Action-specific parameters.
    #[serde(default)]
    pub params: JsonMap<String, JsonValue>,
}

impl HandlerAction {
    /// Creates an action of the given type.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            target: None,
            params: JsonMap::new(),
        }
    }

    /// Sets the fallback target node.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// A workflow-level error handler: an ordered `{match, action}` pair.
///
/// Handlers are matched in declaration order; the first match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlerSpec {
    /// Regex over node ids; absent matches every node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_pattern: Option<String>,
    /// Error kind name to match (e.g. `timeout`); absent matches every kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// The action applied on match.
    pub action: HandlerAction,
}

impl ErrorHandlerSpec {
    /// Creates a handler applying `action` to every error.
    #[must_use]
    pub fn new(action: HandlerAction) -> Self {
        Self {
            node_pattern: None,
            error_type: None,
            action,
        }
    }

    /// Restricts the handler to node ids matching a regex.
    #[must_use]
    pub fn with_node_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.node_pattern = Some(pattern.into());
        self
    }

    /// Restricts the handler to one error kind.
    #[must_use]
    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow identifier (document-assigned).
    pub id: String,
    /// Human-readable name; defaults to the id.
    #[serde(default)]
    pub name: String,
    /// Definition version. A new version is a new registration.
    #[serde(default = "Workflow::default_version")]
    pub version: String,
    /// Execution model.
    #[serde(rename = "type", default)]
    pub kind: WorkflowKind,
    /// Description of what this workflow does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Work nodes (DAG and hybrid kinds).
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Data-flow edges (DAG kind).
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// States (state machine kind).
    #[serde(default)]
    pub states: Vec<State>,
    /// Name of the initial state (state machine kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<String>,
    /// Names of the final states (state machine kind).
    #[serde(default)]
    pub final_states: Vec<String>,
    /// Workflow-level variables, seeded into every execution context.
    #[serde(default)]
    pub variables: JsonMap<String, JsonValue>,
    /// Trigger configurations (carried, not interpreted by the core).
    #[serde(default)]
    pub triggers: Vec<JsonValue>,
    /// Ordered workflow-level error handlers.
    #[serde(default)]
    pub error_handlers: Vec<ErrorHandlerSpec>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: JsonMap<String, JsonValue>,
    /// When this definition was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// When this definition was last updated.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    fn default_version() -> String {
        "1.0.0".to_string()
    }

    /// Creates an empty DAG workflow.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id,
            version: Self::default_version(),
            kind: WorkflowKind::Dag,
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            states: Vec::new(),
            initial_state: None,
            final_states: Vec::new(),
            variables: JsonMap::new(),
            triggers: Vec::new(),
            error_handlers: Vec::new(),
            metadata: JsonMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates an empty state machine workflow.
    #[must_use]
    pub fn state_machine(id: impl Into<String>, initial_state: impl Into<String>) -> Self {
        let mut workflow = Self::new(id);
        workflow.kind = WorkflowKind::StateMachine;
        workflow.initial_state = Some(initial_state.into());
        workflow
    }

    /// Sets the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Adds a node.
    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Adds an edge.
    #[must_use]
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Adds a state.
    #[must_use]
    pub fn with_state(mut self, state: State) -> Self {
        if state.kind == StateKind::Final && !self.final_states.contains(&state.name) {
            self.final_states.push(state.name.clone());
        }
        self.states.push(state);
        self
    }

    /// Sets a workflow variable.
    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Adds a workflow-level error handler.
    #[must_use]
    pub fn with_error_handler(mut self, handler: ErrorHandlerSpec) -> Self {
        self.error_handlers.push(handler);
        self
    }

    /// Returns the node with the given ID, if any.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == node_id)
    }

    /// Returns the state with the given name, if any.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.iter().find(|s| s.name == name)
    }

    /// Returns nodes with no dependencies (the execution entry points).
    #[must_use]
    pub fn entry_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.dependencies.is_empty())
            .collect()
    }

    /// Returns the edges leaving the given node.
    #[must_use]
    pub fn outgoing_edges(&self, node_id: &NodeId) -> Vec<&Edge> {
        self.edges.iter().filter(|e| &e.source == node_id).collect()
    }

    /// Returns the nodes directly downstream of the given node.
    #[must_use]
    pub fn downstream_nodes(&self, node_id: &NodeId) -> Vec<&Node> {
        let mut seen = HashSet::new();
        self.outgoing_edges(node_id)
            .into_iter()
            .filter(|e| seen.insert(e.target.clone()))
            .filter_map(|e| self.node(&e.target))
            .collect()
    }

    /// Returns true if this workflow name is marked final (state machines).
    #[must_use]
    pub fn is_final_state(&self, name: &str) -> bool {
        self.final_states.iter().any(|s| s == name)
    }

    /// Marks the workflow as updated.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Validates the definition, returning every defect found.
    ///
    /// An empty result means the workflow satisfies the structural
    /// invariants: resolvable edges and dependencies, acyclic DAG, exactly
    /// one initial state with a reachable final state, and no variable
    /// shadowing a node id.
    #[must_use]
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        match self.kind {
            WorkflowKind::Hybrid => {
                errors.push(ValidationError::UnsupportedKind {
                    kind: self.kind.to_string(),
                });
            }
            WorkflowKind::Dag => self.validate_dag(&mut errors),
            WorkflowKind::StateMachine => self.validate_state_machine(&mut errors),
        }

        errors
    }

    fn validate_dag(&self, errors: &mut Vec<ValidationError>) {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.clone()) {
                errors.push(ValidationError::DuplicateNodeId {
                    node_id: node.id.clone(),
                });
            }
            if let Err(e) = node.check() {
                errors.push(e);
            }
        }

        for edge in &self.edges {
            if !ids.contains(&edge.source) {
                errors.push(ValidationError::EdgeSourceNotFound {
                    node_id: edge.source.clone(),
                });
            }
            if !ids.contains(&edge.target) {
                errors.push(ValidationError::EdgeTargetNotFound {
                    node_id: edge.target.clone(),
                });
            }
        }

        for node in &self.nodes {
            for dep in &node.dependencies {
                if !ids.contains(dep) {
                    errors.push(ValidationError::DependencyNotFound {
                        node_id: node.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        for name in self.variables.keys() {
            if ids.contains(&NodeId::new(name.clone())) {
                errors.push(ValidationError::VariableShadowsNode { name: name.clone() });
            }
        }

        // Graph-level checks only make sense once endpoints resolve.
        if errors.is_empty() {
            let graph = DependencyGraph::from_workflow(self);
            if let Some(cycle) = graph.find_cycle() {
                errors.push(ValidationError::CycleDetected { cycle });
            }

            if self.nodes.len() > 1 {
                let mut connected: HashSet<&NodeId> = HashSet::new();
                for edge in &self.edges {
                    connected.insert(&edge.source);
                    connected.insert(&edge.target);
                }
                for node in &self.nodes {
                    for dep in &node.dependencies {
                        connected.insert(dep);
                        connected.insert(&node.id);
                    }
                }
                let isolated: Vec<NodeId> = self
                    .nodes
                    .iter()
                    .filter(|n| !connected.contains(&n.id))
                    .map(|n| n.id.clone())
                    .collect();
                if !isolated.is_empty() {
                    errors.push(ValidationError::IsolatedNodes { node_ids: isolated });
                }
            }
        }
    }

    fn validate_state_machine(&self, errors: &mut Vec<ValidationError>) {
        let mut names = HashSet::new();
        for state in &self.states {
            if !names.insert(state.name.as_str()) {
                errors.push(ValidationError::DuplicateStateName {
                    name: state.name.clone(),
                });
            }
        }

        let Some(initial) = self.initial_state.as_deref().filter(|s| !s.is_empty()) else {
            errors.push(ValidationError::InitialStateMissing);
            return;
        };
        if !names.contains(initial) {
            errors.push(ValidationError::InitialStateUnknown {
                name: initial.to_string(),
            });
            return;
        }

        let initial_count = self
            .states
            .iter()
            .filter(|s| s.kind == StateKind::Initial)
            .count();
        if initial_count != 1 {
            errors.push(ValidationError::InitialStateCount {
                count: initial_count,
            });
        }

        for state in &self.states {
            for transition in &state.transitions {
                if !names.contains(transition.target.as_str()) {
                    errors.push(ValidationError::TransitionTargetUnknown {
                        state: state.name.clone(),
                        target: transition.target.clone(),
                    });
                }
            }
        }

        // A final state must be reachable from the initial state.
        let transitions: HashMap<&str, Vec<&str>> = self
            .states
            .iter()
            .map(|s| {
                (
                    s.name.as_str(),
                    s.transitions.iter().map(|t| t.target.as_str()).collect(),
                )
            })
            .collect();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([initial]);
        let mut final_reachable = false;
        while let Some(name) = queue.pop_front() {
            if !visited.insert(name) {
                continue;
            }
            if self.is_final_state(name) {
                final_reachable = true;
                break;
            }
            if let Some(targets) = transitions.get(name) {
                for target in targets {
                    queue.push_back(target);
                }
            }
        }
        if !final_reachable {
            errors.push(ValidationError::FinalStateUnreachable);
        }
    }

    /// Returns true if every node of the given kind is present.
    #[must_use]
    pub fn has_node_kind(&self, kind: NodeKind) -> bool {
        self.nodes.iter().any(|n| n.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Transition;

    fn two_node_dag() -> Workflow {
        Workflow::new("wf")
            .with_node(Node::agent("a", "echo"))
            .with_node(Node::agent("b", "echo").with_dependency("a"))
            .with_edge(Edge::new("a", "b"))
    }

    #[test]
    fn valid_dag_passes_validation() {
        let workflow = two_node_dag();
        assert!(workflow.validate().is_empty());
    }

    #[test]
    fn duplicate_node_ids_rejected() {
        let workflow = Workflow::new("wf")
            .with_node(Node::agent("a", "echo"))
            .with_node(Node::agent("a", "echo"));
        let errors = workflow.validate();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, ValidationError::DuplicateNodeId { .. }))
        );
    }

    #[test]
    fn dangling_edge_rejected() {
        let workflow = Workflow::new("wf")
            .with_node(Node::agent("a", "echo"))
            .with_edge(Edge::new("a", "missing"));
        let errors = workflow.validate();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, ValidationError::EdgeTargetNotFound { .. }))
        );
    }

    #[test]
    fn cycle_rejected_and_named() {
        let workflow = Workflow::new("wf")
            .with_node(Node::agent("a", "echo").with_dependency("b"))
            .with_node(Node::agent("b", "echo").with_dependency("a"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "a"));
        let errors = workflow.validate();
        let cycle = errors
            .iter()
            .find_map(|e| match e {
                ValidationError::CycleDetected { cycle } => Some(cycle),
                _ => None,
            })
            .expect("cycle error");
        assert!(cycle.len() >= 2);
    }

    #[test]
    fn variable_shadowing_node_rejected() {
        let workflow = two_node_dag().with_variable("a", serde_json::json!(1));
        let errors = workflow.validate();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, ValidationError::VariableShadowsNode { .. }))
        );
    }

    #[test]
    fn isolated_node_rejected() {
        let workflow = two_node_dag().with_node(Node::agent("lonely", "echo"));
        let errors = workflow.validate();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, ValidationError::IsolatedNodes { .. }))
        );
    }

    #[test]
    fn hybrid_kind_rejected() {
        let mut workflow = Workflow::new("wf");
        workflow.kind = WorkflowKind::Hybrid;
        let errors = workflow.validate();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, ValidationError::UnsupportedKind { .. }))
        );
    }

    #[test]
    fn state_machine_requires_initial_state() {
        let mut workflow = Workflow::new("sm");
        workflow.kind = WorkflowKind::StateMachine;
        let errors = workflow.validate();
        assert!(errors.contains(&ValidationError::InitialStateMissing));
    }

    #[test]
    fn state_machine_happy_path_validates() {
        let workflow = Workflow::state_machine("sm", "idle")
            .with_state(
                State::new("idle", StateKind::Initial)
                    .with_transition(Transition::new("start", "done")),
            )
            .with_state(State::new("done", StateKind::Final));
        assert!(workflow.validate().is_empty());
    }

    #[test]
    fn unreachable_final_state_rejected() {
        let workflow = Workflow::state_machine("sm", "idle")
            .with_state(State::new("idle", StateKind::Initial))
            .with_state(State::new("done", StateKind::Final));
        let errors = workflow.validate();
        assert!(errors.contains(&ValidationError::FinalStateUnreachable));
    }

    #[test]
    fn transition_target_must_exist() {
        let workflow = Workflow::state_machine("sm", "idle")
            .with_state(
                State::new("idle", StateKind::Initial)
                    .with_transition(Transition::new("start", "nowhere")),
            )
            .with_state(State::new("done", StateKind::Final));
        let errors = workflow.validate();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, ValidationError::TransitionTargetUnknown { .. }))
        );
    }

    #[test]
    fn downstream_nodes_follow_edges() {
        let workflow = two_node_dag();
        let downstream = workflow.downstream_nodes(&NodeId::new("a"));
        assert_eq!(downstream.len(), 1);
        assert_eq!(downstream[0].id.as_str(), "b");
    }
}
