//! Per-kind node executors.
//!
//! The coordinator resolves a node's inputs, then dispatches by node kind
//! through this table. Agent and Tool nodes delegate to the external
//! runtimes; Control nodes compute routing metadata the coordinator acts
//! on; Aggregation nodes combine upstream outputs; SubWorkflow nodes start
//! a child execution and wait for it.

use crate::engine::WorkflowEngine;
use crate::error::NodeError;
use async_trait::async_trait;
use cascade_runtime::{AgentRuntime, ToolRegistry};
use cascade_workflow::expression::{evaluate_predicate, resolve_input_value};
use cascade_workflow::{ControlSubtype, ExecutionContext, Node, OutputMap};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Executes one node kind against a resolved input bag and a context
/// snapshot, producing the node's output map.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Runs the node.
    async fn execute(
        &self,
        node: &Node,
        input: &JsonMap<String, JsonValue>,
        context: &ExecutionContext,
    ) -> Result<OutputMap, NodeError>;
}

/// Delegates to the agent runtime via `config.agent_id`.
pub struct AgentNodeExecutor {
    agents: Arc<dyn AgentRuntime>,
}

impl AgentNodeExecutor {
    /// Creates the executor.
    #[must_use]
    pub fn new(agents: Arc<dyn AgentRuntime>) -> Self {
        Self { agents }
    }
}

#[async_trait]
impl NodeExecutor for AgentNodeExecutor {
    async fn execute(
        &self,
        node: &Node,
        input: &JsonMap<String, JsonValue>,
        context: &ExecutionContext,
    ) -> Result<OutputMap, NodeError> {
        let agent_id = node
            .agent_id()
            .ok_or_else(|| NodeError::execution(format!("node {} has no agent_id", node.id)))?;
        let output = self
            .agents
            .invoke_agent(agent_id, input.clone(), &context.metadata)
            .await?;
        Ok(output)
    }
}

/// Delegates to the tool registry via `config.tool_id`.
pub struct ToolNodeExecutor {
    tools: Arc<dyn ToolRegistry>,
}

impl ToolNodeExecutor {
    /// Creates the executor.
    #[must_use]
    pub fn new(tools: Arc<dyn ToolRegistry>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl NodeExecutor for ToolNodeExecutor {
    async fn execute(
        &self,
        node: &Node,
        input: &JsonMap<String, JsonValue>,
        _context: &ExecutionContext,
    ) -> Result<OutputMap, NodeError> {
        let tool_id = node
            .tool_id()
            .ok_or_else(|| NodeError::execution(format!("node {} has no tool_id", node.id)))?;
        let output = self.tools.invoke_tool(tool_id, input.clone()).await?;
        Ok(output)
    }
}

/// Evaluates control nodes: switch, parallel, loop, condition.
///
/// Control execution is pure: the output records the routing decision, and
/// the coordinator gates downstream activation on it.
pub struct ControlNodeExecutor;

#[async_trait]
impl NodeExecutor for ControlNodeExecutor {
    async fn execute(
        &self,
        node: &Node,
        _input: &JsonMap<String, JsonValue>,
        context: &ExecutionContext,
    ) -> Result<OutputMap, NodeError> {
        match node.subtype {
            Some(ControlSubtype::Switch) => execute_switch(node, context),
            Some(ControlSubtype::Parallel) => execute_parallel(node),
            Some(ControlSubtype::Loop) => execute_loop(node, context),
            Some(ControlSubtype::Condition) => execute_condition(node, context),
            None => Err(NodeError::execution(format!(
                "control node {} has no subtype",
                node.id
            ))),
        }
    }
}

fn execute_switch(node: &Node, context: &ExecutionContext) -> Result<OutputMap, NodeError> {
    let condition = node.config_str("condition").unwrap_or_default();
    let value = resolve_input_value(condition, context).unwrap_or(JsonValue::Null);

    let branches = node.config_array("branches").cloned().unwrap_or_default();
    let mut selected: Option<JsonValue> = None;
    for branch in &branches {
        let Some(branch) = branch.as_object() else {
            continue;
        };
        if let Some(case) = branch.get("case") {
            if case_matches(case, &value) {
                selected = branch.get("target").cloned();
                break;
            }
        } else if let Some(default) = branch.get("default") {
            // The default branch applies unless a later case matches.
            selected = Some(
                branch
                    .get("target")
                    .cloned()
                    .unwrap_or_else(|| default.clone()),
            );
        }
    }

    let mut output = OutputMap::new();
    output.insert(
        "selected_branch".to_string(),
        selected.unwrap_or(JsonValue::Null),
    );
    Ok(output)
}

/// Case values match on JSON equality, with a string-form fallback so that
/// `case: "3"` matches a numeric 3.
fn case_matches(case: &JsonValue, value: &JsonValue) -> bool {
    if case == value {
        return true;
    }
    match (case.as_str(), value) {
        (Some(s), JsonValue::Number(n)) => s == n.to_string(),
        (Some(s), JsonValue::Bool(b)) => s == b.to_string(),
        _ => false,
    }
}

fn execute_parallel(node: &Node) -> Result<OutputMap, NodeError> {
    let mut output = OutputMap::new();
    output.insert(
        "branches".to_string(),
        node.config
            .get("branches")
            .cloned()
            .unwrap_or_else(|| json!([])),
    );
    output.insert(
        "wait_all".to_string(),
        json!(node.config_bool("wait_all").unwrap_or(true)),
    );
    Ok(output)
}

fn execute_loop(node: &Node, context: &ExecutionContext) -> Result<OutputMap, NodeError> {
    let mut output = OutputMap::new();
    output.insert(
        "condition".to_string(),
        json!(node.config_str("condition").unwrap_or_default()),
    );
    output.insert(
        "max_iterations".to_string(),
        json!(node.config_u64("max_iterations").unwrap_or(100)),
    );
    output.insert(
        "current_iteration".to_string(),
        context
            .variable("loop_iteration")
            .cloned()
            .unwrap_or_else(|| json!(0)),
    );
    Ok(output)
}

fn execute_condition(node: &Node, context: &ExecutionContext) -> Result<OutputMap, NodeError> {
    let condition = node.config_str("condition").unwrap_or_default();
    let mut output = OutputMap::new();
    output.insert(
        "result".to_string(),
        json!(evaluate_predicate(condition, context)),
    );
    Ok(output)
}

/// Combines upstream outputs according to `config.strategy`.
///
/// `merge` shallow-merges the dependency outputs in dependency order
/// (last writer wins); `collect` nests each output under its node id.
pub struct AggregationNodeExecutor;

#[async_trait]
impl NodeExecutor for AggregationNodeExecutor {
    async fn execute(
        &self,
        node: &Node,
        _input: &JsonMap<String, JsonValue>,
        context: &ExecutionContext,
    ) -> Result<OutputMap, NodeError> {
        let strategy = node.config_str("strategy").unwrap_or("merge");
        let mut output = OutputMap::new();

        match strategy {
            "collect" => {
                for dep in &node.dependencies {
                    if let Some(upstream) = context.node_output(dep) {
                        output.insert(
                            dep.as_str().to_string(),
                            JsonValue::Object(upstream.clone()),
                        );
                    }
                }
            }
            _ => {
                for dep in &node.dependencies {
                    if let Some(upstream) = context.node_output(dep) {
                        for (key, value) in upstream {
                            output.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }

        Ok(output)
    }
}

/// Starts a child execution of `config.workflow_id` and waits for it.
pub struct SubWorkflowExecutor {
    engine: Weak<WorkflowEngine>,
}

impl SubWorkflowExecutor {
    /// Creates the executor over a weak engine handle.
    #[must_use]
    pub fn new(engine: Weak<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl NodeExecutor for SubWorkflowExecutor {
    async fn execute(
        &self,
        node: &Node,
        input: &JsonMap<String, JsonValue>,
        context: &ExecutionContext,
    ) -> Result<OutputMap, NodeError> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| NodeError::execution("engine has shut down"))?;
        let workflow_id = node.config_str("workflow_id").ok_or_else(|| {
            NodeError::execution(format!("node {} has no workflow_id", node.id))
        })?;

        let child_id = engine
            .start_child_execution(workflow_id, input.clone(), context)
            .await
            .map_err(|e| NodeError::execution(e.to_string()))?;

        let view = engine
            .wait_for_completion(child_id, Duration::from_secs(node.timeout_secs()))
            .await
            .map_err(|e| NodeError::execution(e.to_string()))?;

        if view.status != cascade_workflow::ExecutionStatus::Completed {
            return Err(NodeError::execution(format!(
                "sub-workflow {workflow_id} finished in status {:?}",
                view.status
            )));
        }

        // The child's captured outputs, nested per node id, become the
        // node's output.
        let mut output = OutputMap::new();
        if let Some(outputs) = engine.execution_outputs(child_id).await {
            for (node_id, upstream) in outputs {
                output.insert(node_id.as_str().to_string(), JsonValue::Object(upstream));
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::ExecutionId;
    use cascade_runtime::EchoAgentRuntime;
    use cascade_workflow::NodeId;

    fn context() -> ExecutionContext {
        ExecutionContext::new("wf", ExecutionId::new(), JsonMap::new())
    }

    fn input(value: JsonValue) -> JsonMap<String, JsonValue> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn agent_executor_invokes_runtime() {
        let executor = AgentNodeExecutor::new(Arc::new(EchoAgentRuntime));
        let node = Node::agent("a", "echo");
        let output = executor
            .execute(&node, &input(json!({"msg": "hi"})), &context())
            .await
            .unwrap();
        assert_eq!(output.get("msg"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn switch_selects_matching_case() {
        let mut ctx = context();
        ctx.set_variable("kind", json!("invoice"));
        let node = Node::control("route", ControlSubtype::Switch)
            .with_config("condition", json!("${kind}"))
            .with_config(
                "branches",
                json!([
                    {"case": "invoice", "target": "billing"},
                    {"case": "receipt", "target": "archive"},
                    {"default": "triage"}
                ]),
            );

        let output = ControlNodeExecutor
            .execute(&node, &JsonMap::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(output.get("selected_branch"), Some(&json!("billing")));
    }

    #[tokio::test]
    async fn switch_falls_back_to_default() {
        let mut ctx = context();
        ctx.set_variable("kind", json!("unknown"));
        let node = Node::control("route", ControlSubtype::Switch)
            .with_config("condition", json!("${kind}"))
            .with_config(
                "branches",
                json!([
                    {"case": "invoice", "target": "billing"},
                    {"default": "triage"}
                ]),
            );

        let output = ControlNodeExecutor
            .execute(&node, &JsonMap::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(output.get("selected_branch"), Some(&json!("triage")));
    }

    #[tokio::test]
    async fn switch_without_match_selects_null() {
        let ctx = context();
        let node = Node::control("route", ControlSubtype::Switch)
            .with_config("condition", json!("${missing}"))
            .with_config("branches", json!([{"case": "x", "target": "t"}]));

        let output = ControlNodeExecutor
            .execute(&node, &JsonMap::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(output.get("selected_branch"), Some(&JsonValue::Null));
    }

    #[tokio::test]
    async fn parallel_reports_branches_and_wait_all() {
        let node = Node::control("fan", ControlSubtype::Parallel)
            .with_config("branches", json!(["t1", "t2"]))
            .with_config("wait_all", json!(false));
        let output = ControlNodeExecutor
            .execute(&node, &JsonMap::new(), &context())
            .await
            .unwrap();
        assert_eq!(output.get("branches"), Some(&json!(["t1", "t2"])));
        assert_eq!(output.get("wait_all"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn condition_evaluates_predicate() {
        let mut ctx = context();
        ctx.set_variable("ok", json!(true));
        let node =
            Node::control("gate", ControlSubtype::Condition).with_config("condition", json!("${ok}"));
        let output = ControlNodeExecutor
            .execute(&node, &JsonMap::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(output.get("result"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn merge_aggregation_is_last_writer_wins() {
        let mut ctx = context();
        let mut first = OutputMap::new();
        first.insert("shared".to_string(), json!("from_t1"));
        first.insert("only_t1".to_string(), json!(1));
        let mut second = OutputMap::new();
        second.insert("shared".to_string(), json!("from_t2"));
        ctx.set_node_output(NodeId::new("t1"), first);
        ctx.set_node_output(NodeId::new("t2"), second);

        let node = Node::aggregation("agg", "merge")
            .with_dependency("t1")
            .with_dependency("t2");
        let output = AggregationNodeExecutor
            .execute(&node, &JsonMap::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(output.get("shared"), Some(&json!("from_t2")));
        assert_eq!(output.get("only_t1"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn collect_aggregation_nests_by_node_id() {
        let mut ctx = context();
        let mut upstream = OutputMap::new();
        upstream.insert("v".to_string(), json!(1));
        ctx.set_node_output(NodeId::new("t1"), upstream);

        let node = Node::aggregation("agg", "collect").with_dependency("t1");
        let output = AggregationNodeExecutor
            .execute(&node, &JsonMap::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(output.get("t1"), Some(&json!({"v": 1})));
    }
}
