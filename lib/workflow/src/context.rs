//! Execution context: variables, initial inputs, and captured node outputs.
//!
//! Contexts form an `(parent, overrides)` chain for sub-workflow executions:
//! variable lookup walks to the parent when a key is absent locally. Inputs
//! are immutable after the execution starts; outputs are written only by the
//! coordinator as nodes complete.

use crate::node::NodeId;
use cascade_core::ExecutionId;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The output map captured for a completed node.
pub type OutputMap = JsonMap<String, JsonValue>;

/// Per-execution context shared by every node of the execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// The workflow this context belongs to.
    pub workflow_id: String,
    /// The execution this context belongs to.
    pub execution_id: ExecutionId,
    /// Mutable key/value variables.
    #[serde(default)]
    pub variables: JsonMap<String, JsonValue>,
    /// Initial inputs; immutable after start.
    #[serde(default)]
    pub inputs: JsonMap<String, JsonValue>,
    /// Captured outputs of completed nodes.
    #[serde(default)]
    pub outputs: BTreeMap<NodeId, OutputMap>,
    /// Free-form metadata passed through to agent invocations.
    #[serde(default)]
    pub metadata: JsonMap<String, JsonValue>,
    /// Parent context for sub-workflow executions.
    #[serde(skip)]
    pub parent: Option<Arc<ExecutionContext>>,
}

impl ExecutionContext {
    /// Creates a context with the given initial inputs.
    #[must_use]
    pub fn new(
        workflow_id: impl Into<String>,
        execution_id: ExecutionId,
        inputs: JsonMap<String, JsonValue>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id,
            variables: JsonMap::new(),
            inputs,
            outputs: BTreeMap::new(),
            metadata: JsonMap::new(),
            parent: None,
        }
    }

    /// Attaches a parent context (sub-workflow executions).
    #[must_use]
    pub fn with_parent(mut self, parent: Arc<ExecutionContext>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Looks up a variable, walking to the parent context when absent.
    #[must_use]
    pub fn variable(&self, key: &str) -> Option<&JsonValue> {
        match self.variables.get(key) {
            Some(value) => Some(value),
            None => self.parent.as_deref().and_then(|p| p.variable(key)),
        }
    }

    /// Sets a variable in this context (never in the parent).
    pub fn set_variable(&mut self, key: impl Into<String>, value: JsonValue) {
        self.variables.insert(key.into(), value);
    }

    /// Returns an initial input value.
    #[must_use]
    pub fn input(&self, key: &str) -> Option<&JsonValue> {
        self.inputs.get(key)
    }

    /// Returns the captured output of a completed node.
    #[must_use]
    pub fn node_output(&self, node_id: &NodeId) -> Option<&OutputMap> {
        self.outputs.get(node_id)
    }

    /// Records the output of a completed node.
    pub fn set_node_output(&mut self, node_id: NodeId, output: OutputMap) {
        self.outputs.insert(node_id, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let mut inputs = JsonMap::new();
        inputs.insert("m".to_string(), json!("hi"));
        ExecutionContext::new("wf", ExecutionId::new(), inputs)
    }

    #[test]
    fn variable_lookup_prefers_local() {
        let mut parent = context();
        parent.set_variable("shared", json!("parent"));
        parent.set_variable("only_parent", json!(1));

        let mut child = ExecutionContext::new("wf", ExecutionId::new(), JsonMap::new())
            .with_parent(Arc::new(parent));
        child.set_variable("shared", json!("child"));

        assert_eq!(child.variable("shared"), Some(&json!("child")));
        assert_eq!(child.variable("only_parent"), Some(&json!(1)));
        assert_eq!(child.variable("missing"), None);
    }

    #[test]
    fn set_variable_never_touches_parent() {
        let parent = Arc::new(context());
        let mut child = ExecutionContext::new("wf", ExecutionId::new(), JsonMap::new())
            .with_parent(Arc::clone(&parent));
        child.set_variable("x", json!(42));
        assert!(parent.variables.is_empty());
    }

    #[test]
    fn node_outputs_round_trip() {
        let mut ctx = context();
        let mut output = OutputMap::new();
        output.insert("msg".to_string(), json!("hi"));
        ctx.set_node_output(NodeId::new("a"), output.clone());
        assert_eq!(ctx.node_output(&NodeId::new("a")), Some(&output));
        assert_eq!(ctx.node_output(&NodeId::new("b")), None);
    }

    #[test]
    fn inputs_are_readable() {
        let ctx = context();
        assert_eq!(ctx.input("m"), Some(&json!("hi")));
    }
}
