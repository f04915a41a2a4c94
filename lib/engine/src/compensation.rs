//! Saga-style compensation.
//!
//! When an execution unwinds, the manager collects the successful nodes that
//! declare a compensation block, orders them by the chosen strategy, and
//! runs one compensation record per node through a handler registry.
//! Built-ins: `rollback`, `undo`, `notify`, `cleanup`.

use crate::error::NodeError;
use async_trait::async_trait;
use cascade_core::ExecutionId;
use cascade_workflow::{Execution, Node, NodeId, OutputMap, Workflow};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{error, info, warn};

/// Ordering of compensation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStrategy {
    /// Original execution order.
    Sequential,
    /// All records dispatched concurrently.
    Parallel,
    /// Reverse execution order (by node start time).
    #[default]
    Reverse,
}

/// Status of one compensation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Not yet attempted.
    Pending,
    /// Currently running.
    Executing,
    /// Finished successfully.
    Completed,
    /// Failed (or had no handler).
    Failed,
    /// Abandoned after an earlier record failed.
    Unprocessed,
}

/// One planned compensation action against a successful node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    /// The node being compensated.
    pub node_id: NodeId,
    /// The compensation action type.
    pub action: String,
    /// Parameters for the handler.
    #[serde(default)]
    pub params: JsonMap<String, JsonValue>,
    /// Current status.
    pub status: RecordStatus,
    /// Handler result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OutputMap>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl CompensationRecord {
    fn new(node: &Node) -> Option<Self> {
        let spec = node.compensation.as_ref()?;
        Some(Self {
            node_id: node.id.clone(),
            action: spec.action.clone(),
            params: spec.params.clone(),
            status: RecordStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
        })
    }
}

/// A compensation plan for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationPlan {
    /// The workflow being unwound.
    pub workflow_id: String,
    /// The execution being unwound.
    pub execution_id: ExecutionId,
    /// The node whose failure triggered the unwind.
    pub failed_node_id: NodeId,
    /// Record ordering.
    pub strategy: CompensationStrategy,
    /// Records in execution order.
    pub records: Vec<CompensationRecord>,
    /// When the plan was built.
    pub created_at: DateTime<Utc>,
}

/// Counts and per-record summaries for a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStatus {
    /// The execution the plan belongs to.
    pub execution_id: ExecutionId,
    /// Record ordering.
    pub strategy: CompensationStrategy,
    /// Total number of records.
    pub total_actions: usize,
    /// Records completed.
    pub completed: usize,
    /// Records failed.
    pub failed: usize,
    /// Records executing.
    pub executing: usize,
    /// Records pending.
    pub pending: usize,
    /// Records abandoned after an earlier failure.
    pub unprocessed: usize,
    /// Per-record summaries.
    pub records: Vec<CompensationRecord>,
}

/// Handles one compensation action type.
#[async_trait]
pub trait CompensationHandler: Send + Sync {
    /// Runs the compensation for one record.
    async fn compensate(
        &self,
        record: &CompensationRecord,
        execution: &Execution,
    ) -> Result<OutputMap, NodeError>;
}

/// Builds and executes compensation plans.
pub struct CompensationManager {
    handlers: RwLock<HashMap<String, Arc<dyn CompensationHandler>>>,
    plans: AsyncRwLock<HashMap<ExecutionId, CompensationPlan>>,
}

impl CompensationManager {
    /// Creates a manager with the built-in handlers registered.
    #[must_use]
    pub fn new() -> Self {
        let manager = Self {
            handlers: RwLock::new(HashMap::new()),
            plans: AsyncRwLock::new(HashMap::new()),
        };
        manager.register_handler("rollback", Arc::new(RollbackHandler));
        manager.register_handler("undo", Arc::new(UndoHandler));
        manager.register_handler("notify", Arc::new(NotifyHandler));
        manager.register_handler("cleanup", Arc::new(CleanupHandler));
        manager
    }

    /// Registers (or replaces) a handler for an action type.
    pub fn register_handler(&self, action: impl Into<String>, handler: Arc<dyn CompensationHandler>) {
        let action = action.into();
        info!(action, "registered compensation handler");
        self.handlers.write().unwrap().insert(action, handler);
    }

    /// Builds the plan for an unwinding execution.
    ///
    /// Collects the Success nodes that declare a compensation block (the
    /// failed node excluded), ordered by node start time, reversed for the
    /// Reverse strategy.
    pub async fn create_plan(
        &self,
        workflow: &Workflow,
        execution: &Execution,
        failed_node_id: &NodeId,
        strategy: CompensationStrategy,
    ) -> CompensationPlan {
        let mut records: Vec<CompensationRecord> = execution
            .successful_nodes()
            .iter()
            .filter(|id| *id != failed_node_id)
            .filter_map(|id| workflow.node(id))
            .filter_map(CompensationRecord::new)
            .collect();

        if strategy == CompensationStrategy::Reverse {
            records.reverse();
        }

        let plan = CompensationPlan {
            workflow_id: workflow.id.clone(),
            execution_id: execution.id,
            failed_node_id: failed_node_id.clone(),
            strategy,
            records,
            created_at: Utc::now(),
        };

        info!(
            execution_id = %plan.execution_id,
            actions = plan.records.len(),
            "created compensation plan"
        );
        self.plans.write().await.insert(plan.execution_id, plan.clone());
        plan
    }

    /// Executes the stored plan for an execution.
    ///
    /// Sequential and Reverse plans run records one by one and abandon the
    /// rest on the first handler failure (missing handlers mark the record
    /// failed and continue). Parallel plans dispatch every record
    /// concurrently. Returns true iff every record completed.
    pub async fn execute(&self, execution_id: ExecutionId, execution: &Execution) -> bool {
        let Some(plan) = self.plans.read().await.get(&execution_id).cloned() else {
            warn!(%execution_id, "no compensation plan to execute");
            return false;
        };

        info!(%execution_id, strategy = ?plan.strategy, "starting compensation");
        let records = match plan.strategy {
            CompensationStrategy::Parallel => self.run_parallel(plan.records, execution).await,
            CompensationStrategy::Sequential | CompensationStrategy::Reverse => {
                self.run_sequential(plan.records, execution).await
            }
        };

        let success = records.iter().all(|r| r.status == RecordStatus::Completed);
        if success {
            info!(%execution_id, "compensation completed");
        } else {
            error!(%execution_id, "compensation failed");
        }

        if let Some(stored) = self.plans.write().await.get_mut(&execution_id) {
            stored.records = records;
        }
        success
    }

    async fn run_sequential(
        &self,
        mut records: Vec<CompensationRecord>,
        execution: &Execution,
    ) -> Vec<CompensationRecord> {
        let mut abandoned_from = None;

        for (index, record) in records.iter_mut().enumerate() {
            record.status = RecordStatus::Executing;
            let Some(handler) = self.handler(&record.action) else {
                warn!(action = %record.action, "no handler for compensation action");
                record.status = RecordStatus::Failed;
                record.error = Some(format!("no handler for action: {}", record.action));
                continue;
            };

            match handler.compensate(record, execution).await {
                Ok(result) => {
                    info!(node_id = %record.node_id, action = %record.action, "compensated node");
                    record.status = RecordStatus::Completed;
                    record.result = Some(result);
                }
                Err(e) => {
                    error!(node_id = %record.node_id, error = %e, "compensation record failed");
                    record.status = RecordStatus::Failed;
                    record.error = Some(e.to_string());
                    abandoned_from = Some(index + 1);
                    break;
                }
            }
        }

        if let Some(from) = abandoned_from {
            for record in &mut records[from..] {
                record.status = RecordStatus::Unprocessed;
            }
        }
        records
    }

    async fn run_parallel(
        &self,
        records: Vec<CompensationRecord>,
        execution: &Execution,
    ) -> Vec<CompensationRecord> {
        let futures = records.into_iter().map(|mut record| async move {
            record.status = RecordStatus::Executing;
            let Some(handler) = self.handler(&record.action) else {
                record.status = RecordStatus::Failed;
                record.error = Some(format!("no handler for action: {}", record.action));
                return record;
            };
            match handler.compensate(&record, execution).await {
                Ok(result) => {
                    record.status = RecordStatus::Completed;
                    record.result = Some(result);
                }
                Err(e) => {
                    record.status = RecordStatus::Failed;
                    record.error = Some(e.to_string());
                }
            }
            record
        });

        join_all(futures).await
    }

    /// Returns the status query for an execution's plan.
    pub async fn status(&self, execution_id: ExecutionId) -> Option<CompensationStatus> {
        let plans = self.plans.read().await;
        let plan = plans.get(&execution_id)?;
        let count = |status: RecordStatus| plan.records.iter().filter(|r| r.status == status).count();
        Some(CompensationStatus {
            execution_id,
            strategy: plan.strategy,
            total_actions: plan.records.len(),
            completed: count(RecordStatus::Completed),
            failed: count(RecordStatus::Failed),
            executing: count(RecordStatus::Executing),
            pending: count(RecordStatus::Pending),
            unprocessed: count(RecordStatus::Unprocessed),
            records: plan.records.clone(),
        })
    }

    fn handler(&self, action: &str) -> Option<Arc<dyn CompensationHandler>> {
        self.handlers.read().unwrap().get(action).cloned()
    }
}

impl Default for CompensationManager {
    fn default() -> Self {
        Self::new()
    }
}

fn result_map(status: &str, record: &CompensationRecord) -> OutputMap {
    let mut map = OutputMap::new();
    map.insert("status".to_string(), json!(status));
    map.insert("node_id".to_string(), json!(record.node_id));
    map.insert("timestamp".to_string(), json!(Utc::now()));
    map
}

/// Rolls back the node's side effects.
struct RollbackHandler;

#[async_trait]
impl CompensationHandler for RollbackHandler {
    async fn compensate(
        &self,
        record: &CompensationRecord,
        execution: &Execution,
    ) -> Result<OutputMap, NodeError> {
        if execution.node_execution(&record.node_id).is_none() {
            let mut map = result_map("skipped", record);
            map.insert("reason".to_string(), json!("node not executed"));
            return Ok(map);
        }
        info!(node_id = %record.node_id, "rolling back node");
        Ok(result_map("rolled_back", record))
    }
}

/// Undoes the node using its captured output.
struct UndoHandler;

#[async_trait]
impl CompensationHandler for UndoHandler {
    async fn compensate(
        &self,
        record: &CompensationRecord,
        execution: &Execution,
    ) -> Result<OutputMap, NodeError> {
        let has_output = execution
            .node_execution(&record.node_id)
            .and_then(|n| n.output.as_ref())
            .is_some();
        if !has_output {
            let mut map = result_map("skipped", record);
            map.insert("reason".to_string(), json!("no output to undo"));
            return Ok(map);
        }
        info!(node_id = %record.node_id, "undoing node");
        Ok(result_map("undone", record))
    }
}

/// Emits a compensation notification.
struct NotifyHandler;

#[async_trait]
impl CompensationHandler for NotifyHandler {
    async fn compensate(
        &self,
        record: &CompensationRecord,
        _execution: &Execution,
    ) -> Result<OutputMap, NodeError> {
        info!(node_id = %record.node_id, "sending compensation notification");
        let mut map = result_map("notified", record);
        map.insert(
            "notification_type".to_string(),
            record
                .params
                .get("type")
                .cloned()
                .unwrap_or_else(|| json!("email")),
        );
        Ok(map)
    }
}

/// Cleans up resources held by the node.
struct CleanupHandler;

#[async_trait]
impl CompensationHandler for CleanupHandler {
    async fn compensate(
        &self,
        record: &CompensationRecord,
        _execution: &Execution,
    ) -> Result<OutputMap, NodeError> {
        info!(node_id = %record.node_id, "cleaning up node resources");
        Ok(result_map("cleaned_up", record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_workflow::CompensationSpec;

    /// Handler that fails every record.
    struct FailingHandler;

    #[async_trait]
    impl CompensationHandler for FailingHandler {
        async fn compensate(
            &self,
            _record: &CompensationRecord,
            _execution: &Execution,
        ) -> Result<OutputMap, NodeError> {
            Err(NodeError::execution("handler exploded"))
        }
    }

    fn workflow_with_compensation() -> Workflow {
        Workflow::new("wf")
            .with_node(
                Node::agent("reserve", "echo").with_compensation(CompensationSpec::new("rollback")),
            )
            .with_node(
                Node::agent("charge", "echo")
                    .with_dependency("reserve")
                    .with_compensation(CompensationSpec::new("undo")),
            )
            .with_node(Node::agent("confirm", "echo").with_dependency("charge"))
    }

    fn execution_with_successes(workflow: &Workflow, succeeded: &[&str]) -> Execution {
        let mut execution = Execution::new(workflow.id.clone(), "1.0.0", JsonMap::new());
        execution.start();
        for id in succeeded {
            let node_id = NodeId::new(*id);
            let record = execution.ensure_node_execution(&node_id);
            record.start(None);
            record.succeed(OutputMap::new());
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        execution
    }

    #[tokio::test]
    async fn plan_covers_successful_nodes_with_compensation() {
        let manager = CompensationManager::new();
        let workflow = workflow_with_compensation();
        let execution = execution_with_successes(&workflow, &["reserve", "charge"]);

        let plan = manager
            .create_plan(
                &workflow,
                &execution,
                &NodeId::new("confirm"),
                CompensationStrategy::Reverse,
            )
            .await;

        // `confirm` has no compensation block; `charge` ran last so it
        // compensates first under Reverse.
        assert_eq!(plan.records.len(), 2);
        assert_eq!(plan.records[0].node_id, NodeId::new("charge"));
        assert_eq!(plan.records[1].node_id, NodeId::new("reserve"));
        assert!(plan.records.iter().all(|r| r.status == RecordStatus::Pending));
    }

    #[tokio::test]
    async fn sequential_execution_completes_records() {
        let manager = CompensationManager::new();
        let workflow = workflow_with_compensation();
        let execution = execution_with_successes(&workflow, &["reserve", "charge"]);

        manager
            .create_plan(
                &workflow,
                &execution,
                &NodeId::new("confirm"),
                CompensationStrategy::Sequential,
            )
            .await;
        assert!(manager.execute(execution.id, &execution).await);

        let status = manager.status(execution.id).await.unwrap();
        assert_eq!(status.total_actions, 2);
        assert_eq!(status.completed, 2);
        assert_eq!(status.failed, 0);
    }

    #[tokio::test]
    async fn first_failure_abandons_the_rest() {
        let manager = CompensationManager::new();
        manager.register_handler("rollback", Arc::new(FailingHandler));

        let workflow = Workflow::new("wf")
            .with_node(Node::agent("a", "echo").with_compensation(CompensationSpec::new("rollback")))
            .with_node(
                Node::agent("b", "echo")
                    .with_dependency("a")
                    .with_compensation(CompensationSpec::new("rollback")),
            )
            .with_node(Node::agent("fail", "echo").with_dependency("b"));
        let execution = execution_with_successes(&workflow, &["a", "b"]);

        manager
            .create_plan(
                &workflow,
                &execution,
                &NodeId::new("fail"),
                CompensationStrategy::Sequential,
            )
            .await;
        assert!(!manager.execute(execution.id, &execution).await);

        let status = manager.status(execution.id).await.unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.unprocessed, 1);
    }

    #[tokio::test]
    async fn unknown_action_marks_failed_and_continues() {
        let manager = CompensationManager::new();
        let workflow = Workflow::new("wf")
            .with_node(Node::agent("a", "echo").with_compensation(CompensationSpec::new("teleport")))
            .with_node(
                Node::agent("b", "echo")
                    .with_dependency("a")
                    .with_compensation(CompensationSpec::new("cleanup")),
            )
            .with_node(Node::agent("fail", "echo").with_dependency("b"));
        let execution = execution_with_successes(&workflow, &["a", "b"]);

        manager
            .create_plan(
                &workflow,
                &execution,
                &NodeId::new("fail"),
                CompensationStrategy::Sequential,
            )
            .await;
        assert!(!manager.execute(execution.id, &execution).await);

        let status = manager.status(execution.id).await.unwrap();
        // The unknown action failed, but the cleanup record still ran.
        assert_eq!(status.failed, 1);
        assert_eq!(status.completed, 1);
    }

    #[tokio::test]
    async fn parallel_execution_runs_every_record() {
        let manager = CompensationManager::new();
        manager.register_handler("explode", Arc::new(FailingHandler));

        let workflow = Workflow::new("wf")
            .with_node(Node::agent("a", "echo").with_compensation(CompensationSpec::new("rollback")))
            .with_node(
                Node::agent("b", "echo")
                    .with_dependency("a")
                    .with_compensation(CompensationSpec::new("explode")),
            )
            .with_node(
                Node::agent("c", "echo")
                    .with_dependency("b")
                    .with_compensation(CompensationSpec::new("notify")),
            )
            .with_node(Node::agent("fail", "echo").with_dependency("c"));
        let execution = execution_with_successes(&workflow, &["a", "b", "c"]);

        manager
            .create_plan(
                &workflow,
                &execution,
                &NodeId::new("fail"),
                CompensationStrategy::Parallel,
            )
            .await;
        assert!(!manager.execute(execution.id, &execution).await);

        let status = manager.status(execution.id).await.unwrap();
        // Siblings are not aborted by the failing record.
        assert_eq!(status.completed, 2);
        assert_eq!(status.failed, 1);
        assert_eq!(status.unprocessed, 0);
    }

    #[tokio::test]
    async fn undo_skips_nodes_without_output() {
        let manager = CompensationManager::new();
        let workflow = Workflow::new("wf")
            .with_node(Node::agent("a", "echo").with_compensation(CompensationSpec::new("undo")))
            .with_node(Node::agent("fail", "echo").with_dependency("a"));

        // `a` succeeded, but record no output for it.
        let mut execution = Execution::new("wf", "1.0.0", JsonMap::new());
        execution.start();
        let record = execution.ensure_node_execution(&NodeId::new("a"));
        record.start(None);
        record.status = cascade_workflow::NodeExecutionStatus::Success;

        manager
            .create_plan(
                &workflow,
                &execution,
                &NodeId::new("fail"),
                CompensationStrategy::Reverse,
            )
            .await;
        assert!(manager.execute(execution.id, &execution).await);

        let status = manager.status(execution.id).await.unwrap();
        let result = status.records[0].result.as_ref().unwrap();
        assert_eq!(result.get("status"), Some(&json!("skipped")));
    }
}
