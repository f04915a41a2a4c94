//! Execution records and their lifecycle.
//!
//! An `Execution` is one concrete run of a workflow. It owns the context and
//! the per-node execution records; downstream logic reaches node records by
//! node-id lookup, never by parent pointers. Executions are mutated only by
//! the coordinator on event boundaries and are frozen once terminal.

use crate::context::{ExecutionContext, OutputMap};
use crate::node::NodeId;
use cascade_core::{ExecutionId, NodeExecutionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{BTreeMap, HashMap};

/// The overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not yet started.
    Pending,
    /// Actively executing nodes.
    Running,
    /// Admission frozen; in-flight nodes drain.
    Suspended,
    /// Every node finished in Success or Skipped.
    Completed,
    /// At least one node failed terminally.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
    /// Unwinding via the compensation manager.
    Compensating,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The status of a single node execution within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
    /// Dependencies not yet satisfied.
    Waiting,
    /// Dependencies satisfied; queued for admission.
    Ready,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Success,
    /// Failed terminally (or pending a retry decision).
    Failed,
    /// Skipped; counts as satisfied-with-no-output for downstream nodes.
    Skipped,
    /// Failed and re-queued with a backoff delay.
    Retrying,
    /// Cancelled before completion.
    Cancelled,
}

impl NodeExecutionStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped | Self::Cancelled)
    }

    /// Returns true if a dependency in this status lets downstream proceed.
    #[must_use]
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }

    /// Returns true if the transition to `next` follows the lifecycle:
    /// Waiting -> Ready -> Running -> (Success | Failed | Skipped |
    /// Cancelled), with Failed -> Retrying -> Running for retries. Skip and
    /// cancel are reachable from any non-terminal status.
    #[must_use]
    pub fn can_transition_to(&self, next: NodeExecutionStatus) -> bool {
        use NodeExecutionStatus as S;
        match (self, next) {
            (S::Waiting, S::Ready) => true,
            (S::Ready, S::Running) => true,
            (S::Running, S::Success | S::Failed) => true,
            (S::Failed, S::Retrying) => true,
            (S::Retrying, S::Running | S::Failed) => true,
            (S::Waiting | S::Ready | S::Running | S::Retrying, S::Skipped | S::Cancelled) => true,
            _ => false,
        }
    }
}

/// Error details recorded on a failed node execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error kind name (see the engine's error taxonomy).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
}

impl ErrorInfo {
    /// Creates an error info stamped with the current time.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Execution record for a single node within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Unique identifier for this record.
    pub id: NodeExecutionId,
    /// The execution this record belongs to.
    pub execution_id: ExecutionId,
    /// The node being executed.
    pub node_id: NodeId,
    /// Current status.
    pub status: NodeExecutionStatus,
    /// Captured input, resolved at dispatch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<JsonMap<String, JsonValue>>,
    /// Captured output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputMap>,
    /// Error details on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Number of retries performed so far.
    pub retry_count: u32,
    /// When execution started (first attempt).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When execution reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeExecution {
    /// Creates a new record in Waiting status.
    #[must_use]
    pub fn new(execution_id: ExecutionId, node_id: NodeId) -> Self {
        Self {
            id: NodeExecutionId::new(),
            execution_id,
            node_id,
            status: NodeExecutionStatus::Waiting,
            input: None,
            output: None,
            error: None,
            retry_count: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Marks the node ready for admission.
    pub fn mark_ready(&mut self) {
        self.status = NodeExecutionStatus::Ready;
    }

    /// Starts (or restarts, after a retry) execution.
    pub fn start(&mut self, input: Option<JsonMap<String, JsonValue>>) {
        self.status = NodeExecutionStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if input.is_some() {
            self.input = input;
        }
    }

    /// Marks the node successful with its output.
    pub fn succeed(&mut self, output: OutputMap) {
        self.status = NodeExecutionStatus::Success;
        self.output = Some(output);
        self.finished_at = Some(Utc::now());
    }

    /// Marks the node failed with error details.
    pub fn fail(&mut self, error: ErrorInfo) {
        self.status = NodeExecutionStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    /// Marks the node as retrying; bumps the retry counter.
    pub fn retrying(&mut self) {
        self.status = NodeExecutionStatus::Retrying;
        self.retry_count += 1;
        self.finished_at = None;
    }

    /// Marks the node skipped.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = NodeExecutionStatus::Skipped;
        self.error = Some(ErrorInfo::new("skipped", reason));
        self.finished_at = Some(Utc::now());
    }

    /// Marks the node cancelled.
    pub fn cancel(&mut self) {
        self.status = NodeExecutionStatus::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    /// Returns the duration in seconds, if the node started.
    #[must_use]
    pub fn duration_secs(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.finished_at?;
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

/// One concrete run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier.
    pub id: ExecutionId,
    /// The workflow being executed.
    pub workflow_id: String,
    /// The workflow definition version.
    pub workflow_version: String,
    /// Parent execution, for sub-workflow runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<ExecutionId>,
    /// Current status.
    pub status: ExecutionStatus,
    /// Shared execution context.
    pub context: ExecutionContext,
    /// Per-node execution records, keyed by node id.
    #[serde(default)]
    pub node_executions: HashMap<NodeId, NodeExecution>,
    /// When the execution started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the execution reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Creates a pending execution with the given initial inputs.
    #[must_use]
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_version: impl Into<String>,
        inputs: JsonMap<String, JsonValue>,
    ) -> Self {
        let workflow_id = workflow_id.into();
        let id = ExecutionId::new();
        let now = Utc::now();
        Self {
            id,
            context: ExecutionContext::new(workflow_id.clone(), id, inputs),
            workflow_id,
            workflow_version: workflow_version.into(),
            parent_execution_id: None,
            status: ExecutionStatus::Pending,
            node_executions: HashMap::new(),
            started_at: None,
            finished_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Starts the execution.
    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
        self.touch();
    }

    /// Marks the execution completed.
    pub fn complete(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.touch();
    }

    /// Marks the execution failed.
    pub fn fail(&mut self, error_message: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.error_message = Some(error_message.into());
        self.finished_at = Some(Utc::now());
        self.touch();
    }

    /// Marks the execution cancelled.
    pub fn cancel(&mut self) {
        self.status = ExecutionStatus::Cancelled;
        self.finished_at = Some(Utc::now());
        self.touch();
    }

    /// Freezes admission without interrupting in-flight nodes.
    pub fn suspend(&mut self) {
        self.status = ExecutionStatus::Suspended;
        self.touch();
    }

    /// Restores admission after a suspend.
    pub fn resume(&mut self) {
        self.status = ExecutionStatus::Running;
        self.touch();
    }

    /// Enters the compensating phase.
    pub fn compensating(&mut self) {
        self.status = ExecutionStatus::Compensating;
        self.touch();
    }

    /// Returns true if the status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the node execution record for a node, if any.
    #[must_use]
    pub fn node_execution(&self, node_id: &NodeId) -> Option<&NodeExecution> {
        self.node_executions.get(node_id)
    }

    /// Returns a mutable node execution record, creating it in Waiting
    /// status when absent.
    pub fn ensure_node_execution(&mut self, node_id: &NodeId) -> &mut NodeExecution {
        let execution_id = self.id;
        self.node_executions
            .entry(node_id.clone())
            .or_insert_with(|| NodeExecution::new(execution_id, node_id.clone()))
    }

    /// Returns true if all of `dependencies` are satisfied (Success, or
    /// Skipped under the skip-forward rule) and the node itself has not
    /// already run.
    #[must_use]
    pub fn can_execute_node(&self, node_id: &NodeId, dependencies: &[NodeId]) -> bool {
        for dep in dependencies {
            let satisfied = self
                .node_executions
                .get(dep)
                .is_some_and(|d| d.status.satisfies_dependency());
            if !satisfied {
                return false;
            }
        }

        !self.node_executions.get(node_id).is_some_and(|n| {
            matches!(
                n.status,
                NodeExecutionStatus::Running
                    | NodeExecutionStatus::Success
                    | NodeExecutionStatus::Cancelled
            )
        })
    }

    /// Records a node's output into the context and marks it successful.
    pub fn record_node_output(&mut self, node_id: &NodeId, output: OutputMap) {
        self.ensure_node_execution(node_id).succeed(output.clone());
        self.context.set_node_output(node_id.clone(), output);
        self.touch();
    }

    /// Returns the ids of nodes currently in Success status, ordered by
    /// start time (compensation planning input).
    #[must_use]
    pub fn successful_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<&NodeExecution> = self
            .node_executions
            .values()
            .filter(|n| n.status == NodeExecutionStatus::Success)
            .collect();
        nodes.sort_by_key(|n| n.started_at);
        nodes.iter().map(|n| n.node_id.clone()).collect()
    }

    /// Returns the duration in seconds, if the execution started.
    #[must_use]
    pub fn duration_secs(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }

    /// Builds the queryable status view.
    #[must_use]
    pub fn status_view(&self) -> ExecutionStatusView {
        ExecutionStatusView {
            execution_id: self.id,
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            start_time: self.started_at,
            end_time: self.finished_at,
            duration: self.duration_secs(),
            node_executions: self
                .node_executions
                .iter()
                .map(|(id, n)| {
                    (
                        id.clone(),
                        NodeStatusView {
                            status: n.status,
                            start_time: n.started_at,
                            duration: n.duration_secs(),
                            retry_count: n.retry_count,
                        },
                    )
                })
                .collect(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Queryable status snapshot of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusView {
    /// The execution id.
    pub execution_id: ExecutionId,
    /// The workflow id.
    pub workflow_id: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// When the execution started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the execution finished.
    pub end_time: Option<DateTime<Utc>>,
    /// Duration in seconds.
    pub duration: Option<f64>,
    /// Per-node snapshots.
    pub node_executions: BTreeMap<NodeId, NodeStatusView>,
}

/// Per-node status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusView {
    /// Node status.
    pub status: NodeExecutionStatus,
    /// When the node started.
    pub start_time: Option<DateTime<Utc>>,
    /// Duration in seconds.
    pub duration: Option<f64>,
    /// Retries performed.
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution() -> Execution {
        Execution::new("wf", "1.0.0", JsonMap::new())
    }

    #[test]
    fn execution_status_terminal() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Suspended.is_terminal());
        assert!(!ExecutionStatus::Compensating.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn node_lifecycle_transitions() {
        use NodeExecutionStatus as S;
        assert!(S::Waiting.can_transition_to(S::Ready));
        assert!(S::Ready.can_transition_to(S::Running));
        assert!(S::Running.can_transition_to(S::Success));
        assert!(S::Running.can_transition_to(S::Failed));
        assert!(S::Failed.can_transition_to(S::Retrying));
        assert!(S::Retrying.can_transition_to(S::Running));
        assert!(!S::Success.can_transition_to(S::Running));
        assert!(!S::Waiting.can_transition_to(S::Running));
        assert!(!S::Cancelled.can_transition_to(S::Ready));
    }

    #[test]
    fn skipped_dependency_satisfies_downstream() {
        let mut exec = execution();
        exec.ensure_node_execution(&NodeId::new("a"))
            .skip("policy says skip");
        assert!(exec.can_execute_node(&NodeId::new("b"), &[NodeId::new("a")]));
    }

    #[test]
    fn failed_dependency_blocks_downstream() {
        let mut exec = execution();
        exec.ensure_node_execution(&NodeId::new("a"))
            .fail(ErrorInfo::new("node_execution", "boom"));
        assert!(!exec.can_execute_node(&NodeId::new("b"), &[NodeId::new("a")]));
    }

    #[test]
    fn completed_node_does_not_rerun() {
        let mut exec = execution();
        exec.record_node_output(&NodeId::new("a"), OutputMap::new());
        assert!(!exec.can_execute_node(&NodeId::new("a"), &[]));
    }

    #[test]
    fn record_output_updates_context() {
        let mut exec = execution();
        let mut output = OutputMap::new();
        output.insert("msg".to_string(), json!("hi"));
        exec.record_node_output(&NodeId::new("a"), output.clone());

        assert_eq!(exec.context.node_output(&NodeId::new("a")), Some(&output));
        assert_eq!(
            exec.node_execution(&NodeId::new("a")).unwrap().status,
            NodeExecutionStatus::Success
        );
    }

    #[test]
    fn retrying_bumps_counter_and_clears_finish() {
        let mut exec = execution();
        let record = exec.ensure_node_execution(&NodeId::new("a"));
        record.start(None);
        record.fail(ErrorInfo::new("node_execution", "boom"));
        record.retrying();
        assert_eq!(record.status, NodeExecutionStatus::Retrying);
        assert_eq!(record.retry_count, 1);
        assert!(record.finished_at.is_none());
    }

    #[test]
    fn successful_nodes_ordered_by_start_time() {
        let mut exec = execution();
        for id in ["first", "second"] {
            let record = exec.ensure_node_execution(&NodeId::new(id));
            record.start(None);
            record.succeed(OutputMap::new());
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(
            exec.successful_nodes(),
            vec![NodeId::new("first"), NodeId::new("second")]
        );
    }

    #[test]
    fn status_view_reports_nodes() {
        let mut exec = execution();
        exec.start();
        exec.record_node_output(&NodeId::new("a"), OutputMap::new());
        exec.complete();

        let view = exec.status_view();
        assert_eq!(view.status, ExecutionStatus::Completed);
        assert!(view.duration.is_some());
        assert_eq!(
            view.node_executions[&NodeId::new("a")].status,
            NodeExecutionStatus::Success
        );
    }

    #[test]
    fn suspend_resume_round_trip() {
        let mut exec = execution();
        exec.start();
        exec.suspend();
        assert_eq!(exec.status, ExecutionStatus::Suspended);
        exec.resume();
        assert_eq!(exec.status, ExecutionStatus::Running);
    }
}
