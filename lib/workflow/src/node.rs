//! Workflow node types and configurations.
//!
//! Nodes are the units of work in a workflow. Each node has:
//! - An ID unique within its workflow (document-assigned)
//! - A kind (Agent, Tool, Control, Aggregation, SubWorkflow)
//! - A free-form config bag interpreted by its executor
//! - Input reference expressions, exported output names, and dependencies

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;

/// Default per-node execution timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// A node identifier, unique within a single workflow.
///
/// Unlike execution ids, node ids come from the workflow document and are
/// plain strings chosen by the author.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node ID from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The kind of a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Delegates to an external agent runtime by `agent_id`.
    Agent,
    /// Delegates to a tool registry by `tool_id`.
    Tool,
    /// Graph control flow (switch, parallel, loop, condition).
    Control,
    /// Combines upstream outputs according to a strategy.
    Aggregation,
    /// Starts a child execution of another workflow.
    SubWorkflow,
}

impl NodeKind {
    /// Returns the canonical string form used in documents and registries.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Control => "control",
            Self::Aggregation => "aggregation",
            Self::SubWorkflow => "sub_workflow",
        }
    }

    /// All node kinds, in document order.
    #[must_use]
    pub fn all() -> [NodeKind; 5] {
        [
            Self::Agent,
            Self::Tool,
            Self::Control,
            Self::Aggregation,
            Self::SubWorkflow,
        ]
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subtype of a Control node. Required iff `kind == Control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSubtype {
    /// Evaluate a condition and gate downstream edges to one branch.
    Switch,
    /// Fan out to sibling branches.
    Parallel,
    /// Re-run a body until a predicate is false or iterations cap out.
    Loop,
    /// Boolean guard over downstream activation.
    Condition,
}

impl fmt::Display for ControlSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Switch => "switch",
            Self::Parallel => "parallel",
            Self::Loop => "loop",
            Self::Condition => "condition",
        };
        f.write_str(s)
    }
}

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay: `retry_delay`.
    Fixed,
    /// Linear growth: `retry_delay * (retry + 1)`.
    Linear,
    /// Exponential growth: `retry_delay * backoff_factor^retry`.
    #[default]
    Exponential,
}

/// Per-node retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    #[serde(default = "RetryPolicy::default_max_retries")]
    pub max_retries: u32,
    /// Base delay in seconds.
    #[serde(default = "RetryPolicy::default_retry_delay")]
    pub retry_delay: f64,
    /// Ceiling for the computed delay, in seconds.
    #[serde(default = "RetryPolicy::default_max_delay")]
    pub max_delay: f64,
    /// Multiplier for exponential backoff.
    #[serde(default = "RetryPolicy::default_backoff_factor")]
    pub backoff_factor: f64,
    /// How the delay grows across retries.
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Whether to add a uniform random component (up to 10% of the delay).
    #[serde(default = "RetryPolicy::default_jitter")]
    pub jitter: bool,
    /// Error kinds eligible for retry. Empty means all kinds.
    #[serde(default)]
    pub retry_on: Vec<String>,
    /// Error kinds never retried, even when listed in `retry_on`.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl RetryPolicy {
    fn default_max_retries() -> u32 {
        3
    }

    fn default_retry_delay() -> f64 {
        1.0
    }

    fn default_max_delay() -> f64 {
        60.0
    }

    fn default_backoff_factor() -> f64 {
        2.0
    }

    fn default_jitter() -> bool {
        true
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            retry_delay: Self::default_retry_delay(),
            max_delay: Self::default_max_delay(),
            backoff_factor: Self::default_backoff_factor(),
            strategy: BackoffStrategy::default(),
            jitter: Self::default_jitter(),
            retry_on: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

/// Compensation declared by a node, run when the execution unwinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationSpec {
    /// Compensation action type (e.g. "rollback", "undo", "notify").
    #[serde(default = "CompensationSpec::default_action")]
    pub action: String,
    /// Parameters passed to the compensation handler.
    #[serde(default)]
    pub params: JsonMap<String, JsonValue>,
    /// Timeout for the compensation action, in seconds.
    #[serde(default = "CompensationSpec::default_timeout")]
    pub timeout: u64,
}

impl CompensationSpec {
    fn default_action() -> String {
        "rollback".to_string()
    }

    fn default_timeout() -> u64 {
        300
    }

    /// Creates a compensation spec for the given action type.
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: JsonMap::new(),
            timeout: Self::default_timeout(),
        }
    }
}

impl Default for CompensationSpec {
    fn default() -> Self {
        Self::new(Self::default_action())
    }
}

/// A workflow node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node within the workflow.
    pub id: NodeId,
    /// Human-readable name; defaults to the ID.
    #[serde(default)]
    pub name: String,
    /// Node kind (determines which executor runs it).
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Control subtype; required iff `kind == Control`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<ControlSubtype>,
    /// Executor-specific configuration.
    #[serde(default)]
    pub config: JsonMap<String, JsonValue>,
    /// Input parameter name -> reference expression.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Names of the output fields this node exports.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// IDs of nodes that must succeed before this node runs.
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    /// Execution timeout in seconds; engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Retry policy applied on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Compensation declared for the unwind path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationSpec>,
    /// Free-form metadata (carries parallel-group and priority markers).
    #[serde(default)]
    pub metadata: JsonMap<String, JsonValue>,
}

impl Node {
    /// Creates a node of the given kind with an empty configuration.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.as_str().to_string(),
            id,
            kind,
            subtype: None,
            config: JsonMap::new(),
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            dependencies: Vec::new(),
            timeout: None,
            retry_policy: None,
            compensation: None,
            metadata: JsonMap::new(),
        }
    }

    /// Creates an agent node delegating to `agent_id`.
    #[must_use]
    pub fn agent(id: impl Into<NodeId>, agent_id: impl Into<String>) -> Self {
        let mut node = Self::new(id, NodeKind::Agent);
        node.config
            .insert("agent_id".to_string(), JsonValue::String(agent_id.into()));
        node
    }

    /// Creates a tool node delegating to `tool_id`.
    #[must_use]
    pub fn tool(id: impl Into<NodeId>, tool_id: impl Into<String>) -> Self {
        let mut node = Self::new(id, NodeKind::Tool);
        node.config
            .insert("tool_id".to_string(), JsonValue::String(tool_id.into()));
        node
    }

    /// Creates a control node with the given subtype.
    #[must_use]
    pub fn control(id: impl Into<NodeId>, subtype: ControlSubtype) -> Self {
        let mut node = Self::new(id, NodeKind::Control);
        node.subtype = Some(subtype);
        node
    }

    /// Creates an aggregation node with the given strategy.
    #[must_use]
    pub fn aggregation(id: impl Into<NodeId>, strategy: impl Into<String>) -> Self {
        let mut node = Self::new(id, NodeKind::Aggregation);
        node.config
            .insert("strategy".to_string(), JsonValue::String(strategy.into()));
        node
    }

    /// Creates a sub-workflow node starting `workflow_id`.
    #[must_use]
    pub fn sub_workflow(id: impl Into<NodeId>, workflow_id: impl Into<String>) -> Self {
        let mut node = Self::new(id, NodeKind::SubWorkflow);
        node.config.insert(
            "workflow_id".to_string(),
            JsonValue::String(workflow_id.into()),
        );
        node
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds an input reference expression.
    #[must_use]
    pub fn with_input(mut self, key: impl Into<String>, expr: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), expr.into());
        self
    }

    /// Adds a dependency on another node.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<NodeId>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    /// Sets the execution timeout in seconds.
    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sets the compensation spec.
    #[must_use]
    pub fn with_compensation(mut self, compensation: CompensationSpec) -> Self {
        self.compensation = Some(compensation);
        self
    }

    /// Inserts a config entry.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Returns the configured agent id, if any.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.config.get("agent_id").and_then(JsonValue::as_str)
    }

    /// Returns the configured tool id, if any.
    #[must_use]
    pub fn tool_id(&self) -> Option<&str> {
        self.config.get("tool_id").and_then(JsonValue::as_str)
    }

    /// Returns a string config entry.
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(JsonValue::as_str)
    }

    /// Returns a boolean config entry.
    #[must_use]
    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(JsonValue::as_bool)
    }

    /// Returns an unsigned integer config entry.
    #[must_use]
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(JsonValue::as_u64)
    }

    /// Returns an array config entry.
    #[must_use]
    pub fn config_array(&self, key: &str) -> Option<&Vec<JsonValue>> {
        self.config.get(key).and_then(JsonValue::as_array)
    }

    /// Returns the scheduling priority from metadata (defaults to 0).
    #[must_use]
    pub fn priority(&self) -> i64 {
        self.metadata
            .get("priority")
            .and_then(JsonValue::as_i64)
            .unwrap_or(0)
    }

    /// Returns the effective timeout in seconds.
    #[must_use]
    pub fn timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    /// Checks structural invariants that do not need the whole workflow.
    ///
    /// # Errors
    ///
    /// Returns an error if a Control node has no subtype, or if an Agent/Tool
    /// node is missing its `agent_id`/`tool_id` config entry.
    pub fn check(&self) -> Result<(), ValidationError> {
        match self.kind {
            NodeKind::Control => {
                if self.subtype.is_none() {
                    return Err(ValidationError::ControlSubtypeMissing {
                        node_id: self.id.clone(),
                    });
                }
                if self.subtype == Some(ControlSubtype::Switch)
                    && self.config_array("branches").is_none_or(Vec::is_empty)
                {
                    return Err(ValidationError::SwitchBranchesMissing {
                        node_id: self.id.clone(),
                    });
                }
            }
            NodeKind::Agent => {
                if self.agent_id().is_none() {
                    return Err(ValidationError::AgentIdMissing {
                        node_id: self.id.clone(),
                    });
                }
            }
            NodeKind::Tool => {
                if self.tool_id().is_none() {
                    return Err(ValidationError::ToolIdMissing {
                        node_id: self.id.clone(),
                    });
                }
            }
            NodeKind::Aggregation | NodeKind::SubWorkflow => {}
        }
        Ok(())
    }
}
