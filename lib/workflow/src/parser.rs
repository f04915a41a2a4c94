//! Workflow document parser.
//!
//! Accepts YAML or JSON text (or an already-deserialized value), normalizes
//! document shorthands, validates the result, and annotates parallel groups.
//!
//! Accepted shorthands, matching the document format:
//! - top-level `workflow` wrapper key (optional)
//! - `agent: <id>` / `tool: <id>` on nodes, folded into
//!   `config.agent_id` / `config.tool_id`
//! - `condition` / `branches` / `max_iterations` / `wait_all` / `body` on
//!   control nodes, folded into `config`
//! - `from` / `to` edge aliases for `source` / `target`
//! - `metadata.compensation` lifted into the node's `compensation` field

use crate::definition::{Workflow, WorkflowKind};
use crate::edge::Edge;
use crate::error::ParseError;
use crate::graph::DependencyGraph;
use crate::state::StateKind;
use serde_json::Value as JsonValue;
use tracing::debug;

/// Control-node shorthand keys folded into `config`.
const CONTROL_SHORTHAND_KEYS: [&str; 5] =
    ["condition", "branches", "max_iterations", "wait_all", "body"];

/// Parses workflow documents into validated [`Workflow`] values.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowParser;

impl WorkflowParser {
    /// Creates a parser.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Parses a document, trying YAML first and JSON second.
    ///
    /// # Errors
    ///
    /// Returns a parse error when the text is neither valid YAML nor valid
    /// JSON, when the document does not describe a workflow, or when the
    /// workflow fails validation.
    pub fn parse(&self, text: &str) -> Result<Workflow, ParseError> {
        match self.parse_yaml(text) {
            Ok(workflow) => Ok(workflow),
            Err(yaml_err) => match self.parse_json(text) {
                Ok(workflow) => Ok(workflow),
                // Validation failures are the same either way; the YAML error
                // is the more useful one for non-JSON input.
                Err(ParseError::Json { .. }) => Err(yaml_err),
                Err(other) => Err(other),
            },
        }
    }

    /// Parses a YAML document.
    ///
    /// # Errors
    ///
    /// Returns a parse error on invalid YAML or an invalid workflow.
    pub fn parse_yaml(&self, text: &str) -> Result<Workflow, ParseError> {
        let value: JsonValue = serde_yaml::from_str(text).map_err(|e| ParseError::Yaml {
            message: e.to_string(),
        })?;
        self.parse_value(value)
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns a parse error on invalid JSON or an invalid workflow.
    pub fn parse_json(&self, text: &str) -> Result<Workflow, ParseError> {
        let value: JsonValue = serde_json::from_str(text).map_err(|e| ParseError::Json {
            message: e.to_string(),
        })?;
        self.parse_value(value)
    }

    /// Parses an already-deserialized document value.
    ///
    /// # Errors
    ///
    /// Returns a parse error when the value does not describe a workflow or
    /// the workflow fails validation.
    pub fn parse_value(&self, mut value: JsonValue) -> Result<Workflow, ParseError> {
        // Unwrap the optional top-level `workflow` key.
        if let Some(object) = value.as_object_mut()
            && let Some(inner) = object.remove("workflow")
        {
            value = inner;
        }

        normalize_nodes(&mut value);

        let mut workflow: Workflow =
            serde_json::from_value(value).map_err(|e| ParseError::InvalidDocument {
                message: e.to_string(),
            })?;

        if workflow.id.is_empty() {
            return Err(ParseError::InvalidDocument {
                message: "workflow has no id".to_string(),
            });
        }
        if workflow.name.is_empty() {
            workflow.name = workflow.id.clone();
        }
        for node in &mut workflow.nodes {
            if node.name.is_empty() {
                node.name = node.id.as_str().to_string();
            }
        }

        if workflow.kind == WorkflowKind::StateMachine {
            reconcile_states(&mut workflow);
        } else {
            synthesize_edges(&mut workflow);
            synthesize_dependencies(&mut workflow);
        }

        let errors = workflow.validate();
        if !errors.is_empty() {
            return Err(ParseError::Validation { errors });
        }

        if workflow.kind == WorkflowKind::Dag {
            annotate_parallel_groups(&mut workflow);
        }

        debug!(
            workflow_id = %workflow.id,
            kind = %workflow.kind,
            nodes = workflow.nodes.len(),
            "parsed workflow"
        );
        Ok(workflow)
    }

    /// Serializes a workflow back to canonical JSON.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization fails (it does not for valid
    /// workflows).
    pub fn to_json(&self, workflow: &Workflow) -> Result<String, ParseError> {
        serde_json::to_string_pretty(workflow).map_err(|e| ParseError::Json {
            message: e.to_string(),
        })
    }

    /// Serializes a workflow back to canonical YAML.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization fails (it does not for valid
    /// workflows).
    pub fn to_yaml(&self, workflow: &Workflow) -> Result<String, ParseError> {
        serde_yaml::to_string(workflow).map_err(|e| ParseError::Yaml {
            message: e.to_string(),
        })
    }
}

/// Folds node-level document shorthands into the canonical shape.
fn normalize_nodes(value: &mut JsonValue) {
    let Some(nodes) = value
        .as_object_mut()
        .and_then(|o| o.get_mut("nodes"))
        .and_then(JsonValue::as_array_mut)
    else {
        return;
    };

    for node in nodes {
        let Some(object) = node.as_object_mut() else {
            continue;
        };

        // `agent: x` / `tool: x` shorthand.
        if let Some(agent) = object.remove("agent") {
            config_entry(object, "agent_id", agent);
        }
        if let Some(tool) = object.remove("tool") {
            config_entry(object, "tool_id", tool);
        }

        // Control shorthand keys live in config.
        let is_control = object.get("type").and_then(JsonValue::as_str) == Some("control");
        if is_control {
            for key in CONTROL_SHORTHAND_KEYS {
                if let Some(entry) = object.remove(key) {
                    config_entry(object, key, entry);
                }
            }
        }

        // `metadata.compensation` lifts into the typed field.
        if !object.contains_key("compensation")
            && let Some(compensation) = object
                .get_mut("metadata")
                .and_then(JsonValue::as_object_mut)
                .and_then(|m| m.remove("compensation"))
        {
            object.insert("compensation".to_string(), compensation);
        }
    }
}

fn config_entry(
    object: &mut serde_json::Map<String, JsonValue>,
    key: &str,
    entry: JsonValue,
) {
    let config = object
        .entry("config".to_string())
        .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
    if let Some(config) = config.as_object_mut()
        && !config.contains_key(key)
    {
        config.insert(key.to_string(), entry);
    }
}

/// Synthesizes one edge per `(dep -> node)` pair when no edges are declared.
fn synthesize_edges(workflow: &mut Workflow) {
    if !workflow.edges.is_empty() {
        return;
    }
    for node in &workflow.nodes {
        for dep in &node.dependencies {
            workflow
                .edges
                .push(Edge::new(dep.clone(), node.id.clone()));
        }
    }
}

/// Ensures every edge is mirrored in the target's dependency list, so the
/// coordinator's dependency checks agree with the edge set.
fn synthesize_dependencies(workflow: &mut Workflow) {
    let edges: Vec<(crate::node::NodeId, crate::node::NodeId)> = workflow
        .edges
        .iter()
        .map(|e| (e.source.clone(), e.target.clone()))
        .collect();
    for (source, target) in edges {
        if let Some(node) = workflow.nodes.iter_mut().find(|n| n.id == target)
            && !node.dependencies.contains(&source)
        {
            node.dependencies.push(source);
        }
    }
}

/// Reconciles state kinds with the workflow-level initial/final markers.
fn reconcile_states(workflow: &mut Workflow) {
    // A state of kind Initial supplies a missing `initial_state`.
    if workflow.initial_state.as_deref().unwrap_or("").is_empty() {
        workflow.initial_state = workflow
            .states
            .iter()
            .find(|s| s.kind == StateKind::Initial)
            .map(|s| s.name.clone());
    }

    let initial = workflow.initial_state.clone().unwrap_or_default();
    let final_states = workflow.final_states.clone();
    for state in &mut workflow.states {
        if state.name == initial && state.kind == StateKind::Normal {
            state.kind = StateKind::Initial;
        }
        if final_states.contains(&state.name) && state.kind == StateKind::Normal {
            state.kind = StateKind::Final;
        }
    }

    // Final-kind states register themselves in `final_states`.
    for state in &workflow.states {
        if state.kind == StateKind::Final && !workflow.final_states.contains(&state.name) {
            workflow.final_states.push(state.name.clone());
        }
    }
}

/// Marks each node with its Kahn layer index under `metadata.parallel_group`.
fn annotate_parallel_groups(workflow: &mut Workflow) {
    let layers = DependencyGraph::from_workflow(workflow).layers();
    for (group, layer) in layers.iter().enumerate() {
        for node_id in layer {
            if let Some(node) = workflow.nodes.iter_mut().find(|n| &n.id == node_id) {
                node.metadata
                    .insert("parallel_group".to_string(), JsonValue::from(group));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::node::{NodeId, NodeKind};

    const DAG_YAML: &str = r#"
workflow:
  id: report-pipeline
  name: Report pipeline
  type: dag
  nodes:
    - id: fetch
      type: tool
      tool: http-get
      outputs: [body]
    - id: summarize
      type: agent
      agent: summarizer
      inputs:
        content: "${fetch.body}"
      dependencies: [fetch]
    - id: publish
      type: tool
      tool: http-post
      dependencies: [summarize]
"#;

    const STATE_MACHINE_YAML: &str = r#"
workflow:
  id: approval
  type: state_machine
  initial_state: idle
  final_states: [completed]
  states:
    - name: idle
      transitions:
        - event: start
          target: processing
    - name: processing
      transitions:
        - event: complete
          target: completed
    - name: completed
"#;

    #[test]
    fn parses_dag_yaml_with_shorthands() {
        let workflow = WorkflowParser::new().parse(DAG_YAML).expect("parse");
        assert_eq!(workflow.id, "report-pipeline");
        assert_eq!(workflow.kind, WorkflowKind::Dag);
        assert_eq!(workflow.nodes.len(), 3);

        let fetch = workflow.node(&NodeId::new("fetch")).unwrap();
        assert_eq!(fetch.kind, NodeKind::Tool);
        assert_eq!(fetch.tool_id(), Some("http-get"));
    }

    #[test]
    fn synthesizes_edges_from_dependencies() {
        let workflow = WorkflowParser::new().parse(DAG_YAML).expect("parse");
        assert_eq!(workflow.edges.len(), 2);
        assert!(
            workflow
                .edges
                .iter()
                .any(|e| e.source.as_str() == "fetch" && e.target.as_str() == "summarize")
        );
    }

    #[test]
    fn synthesizes_dependencies_from_edges() {
        let json = r#"{
            "id": "wf",
            "type": "dag",
            "nodes": [
                {"id": "a", "type": "agent", "agent": "echo"},
                {"id": "b", "type": "agent", "agent": "echo"}
            ],
            "edges": [{"from": "a", "to": "b"}]
        }"#;
        let workflow = WorkflowParser::new().parse_json(json).expect("parse");
        let b = workflow.node(&NodeId::new("b")).unwrap();
        assert_eq!(b.dependencies, vec![NodeId::new("a")]);
    }

    #[test]
    fn parses_json_documents() {
        let json = r#"{"workflow": {"id": "j1", "type": "dag", "nodes": [
            {"id": "only", "type": "agent", "agent": "echo"}
        ]}}"#;
        let workflow = WorkflowParser::new().parse(json).expect("parse");
        assert_eq!(workflow.id, "j1");
    }

    #[test]
    fn annotates_parallel_groups() {
        let json = r#"{
            "id": "wf",
            "type": "dag",
            "nodes": [
                {"id": "a", "type": "agent", "agent": "echo"},
                {"id": "b", "type": "agent", "agent": "echo", "dependencies": ["a"]},
                {"id": "c", "type": "agent", "agent": "echo", "dependencies": ["a"]}
            ]
        }"#;
        let workflow = WorkflowParser::new().parse_json(json).expect("parse");
        let group = |id: &str| {
            workflow
                .node(&NodeId::new(id))
                .unwrap()
                .metadata
                .get("parallel_group")
                .and_then(JsonValue::as_u64)
                .unwrap()
        };
        assert_eq!(group("a"), 0);
        assert_eq!(group("b"), 1);
        assert_eq!(group("c"), 1);
    }

    #[test]
    fn parses_state_machine() {
        let workflow = WorkflowParser::new()
            .parse(STATE_MACHINE_YAML)
            .expect("parse");
        assert_eq!(workflow.kind, WorkflowKind::StateMachine);
        assert_eq!(workflow.initial_state.as_deref(), Some("idle"));
        assert_eq!(workflow.states.len(), 3);
        // The named initial/final states were reconciled to their kinds.
        assert_eq!(workflow.state("idle").unwrap().kind, StateKind::Initial);
        assert_eq!(workflow.state("completed").unwrap().kind, StateKind::Final);
    }

    #[test]
    fn rejects_cyclic_dag() {
        let json = r#"{
            "id": "wf",
            "type": "dag",
            "nodes": [
                {"id": "a", "type": "agent", "agent": "echo", "dependencies": ["b"]},
                {"id": "b", "type": "agent", "agent": "echo", "dependencies": ["a"]}
            ]
        }"#;
        let err = WorkflowParser::new().parse_json(json).unwrap_err();
        assert!(
            err.validation_errors()
                .iter()
                .any(|e| matches!(e, ValidationError::CycleDetected { .. }))
        );
    }

    #[test]
    fn rejects_control_node_without_subtype() {
        let json = r#"{
            "id": "wf",
            "type": "dag",
            "nodes": [{"id": "gate", "type": "control"}]
        }"#;
        let err = WorkflowParser::new().parse_json(json).unwrap_err();
        assert!(
            err.validation_errors()
                .iter()
                .any(|e| matches!(e, ValidationError::ControlSubtypeMissing { .. }))
        );
    }

    #[test]
    fn rejects_state_machine_without_initial_state() {
        let yaml = r#"
id: sm
type: state_machine
states:
  - name: only
"#;
        let err = WorkflowParser::new().parse(yaml).unwrap_err();
        assert!(
            err.validation_errors()
                .contains(&ValidationError::InitialStateMissing)
        );
    }

    #[test]
    fn rejects_hybrid_kind() {
        let json = r#"{"id": "h", "type": "hybrid"}"#;
        let err = WorkflowParser::new().parse_json(json).unwrap_err();
        assert!(
            err.validation_errors()
                .iter()
                .any(|e| matches!(e, ValidationError::UnsupportedKind { .. }))
        );
    }

    #[test]
    fn rejects_document_without_id() {
        let json = r#"{"type": "dag", "nodes": []}"#;
        let err = WorkflowParser::new().parse_json(json).unwrap_err();
        assert!(matches!(err, ParseError::InvalidDocument { .. }));
    }

    #[test]
    fn control_shorthand_folds_into_config() {
        let json = r#"{
            "id": "wf",
            "type": "dag",
            "nodes": [
                {"id": "a", "type": "agent", "agent": "echo"},
                {
                    "id": "route",
                    "type": "control",
                    "subtype": "switch",
                    "condition": "${a.kind}",
                    "branches": [{"case": "x", "target": "a"}],
                    "dependencies": ["a"]
                }
            ]
        }"#;
        let workflow = WorkflowParser::new().parse_json(json).expect("parse");
        let route = workflow.node(&NodeId::new("route")).unwrap();
        assert_eq!(route.config_str("condition"), Some("${a.kind}"));
        assert!(route.config_array("branches").is_some());
    }

    #[test]
    fn metadata_compensation_is_lifted() {
        let json = r#"{
            "id": "wf",
            "type": "dag",
            "nodes": [{
                "id": "a",
                "type": "agent",
                "agent": "echo",
                "metadata": {"compensation": {"action": "rollback"}}
            }]
        }"#;
        let workflow = WorkflowParser::new().parse_json(json).expect("parse");
        let node = workflow.node(&NodeId::new("a")).unwrap();
        assert_eq!(
            node.compensation.as_ref().map(|c| c.action.as_str()),
            Some("rollback")
        );
    }

    #[test]
    fn round_trip_preserves_the_workflow() {
        let parser = WorkflowParser::new();
        let workflow = parser.parse(DAG_YAML).expect("parse");

        let json = parser.to_json(&workflow).expect("serialize");
        let reparsed = parser.parse(&json).expect("reparse");
        assert_eq!(workflow, reparsed);

        let yaml = parser.to_yaml(&workflow).expect("serialize");
        let reparsed = parser.parse(&yaml).expect("reparse");
        assert_eq!(workflow, reparsed);
    }
}
