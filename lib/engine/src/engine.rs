//! The workflow engine: execution lifecycle and DAG coordination.
//!
//! One engine instance serves many executions. Per-execution state lives in
//! an `Arc<Mutex<Execution>>` (the per-execution mutual-exclusion region:
//! node workers run in parallel, but their updates to the shared record are
//! serialized), plus a cancellation token workers select against.
//!
//! The engine implements the scheduler's `SchedulerContext` (node lookup,
//! dependency checks, admission gating) and registers itself as the task
//! executor for every node kind; per-kind dispatch happens through the
//! `NodeExecutor` table.

use crate::compensation::{CompensationManager, CompensationStatus, CompensationStrategy};
use crate::error::{EngineError, ErrorKind, NodeError};
use crate::error_handler::{ErrorHandler, ErrorStrategy, backoff_delay};
use crate::executor::{
    AgentNodeExecutor, AggregationNodeExecutor, ControlNodeExecutor, NodeExecutor,
    SubWorkflowExecutor, ToolNodeExecutor,
};
use async_trait::async_trait;
use cascade_core::ExecutionId;
use cascade_eventbus::{EventSink, ExecutionEvent, ExecutionEventKind, topic};
use cascade_runtime::{AgentRuntime, ToolRegistry};
use cascade_scheduler::{
    Admission, ScheduledTask, SchedulerContext, TaskExecutor, TaskScheduler,
};
use cascade_storage::{ExecutionRepository, WorkflowRepository};
use cascade_workflow::expression::{evaluate_predicate, resolve_input_value};
use cascade_workflow::{
    ControlSubtype, Execution, ExecutionContext, ExecutionStatus, ExecutionStatusView,
    NodeExecution, NodeExecutionStatus, NodeKind, OutputMap, Workflow, WorkflowKind,
    WorkflowParser,
};
use cascade_workflow::{Node, NodeId};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How downstream edges of a completed node are gated.
enum DownstreamGate {
    /// Edges propagate; conditional edges evaluate their predicate.
    All,
    /// Only edges matching the selected switch branch propagate; the rest
    /// of the targets are skipped.
    SwitchBranch(Option<String>),
    /// A Condition node's boolean gates every edge.
    ConditionResult(bool),
}

#[derive(Clone)]
struct ExecutionEntry {
    execution: Arc<AsyncMutex<Execution>>,
    workflow: Arc<Workflow>,
    cancel: CancellationToken,
    /// Loops currently re-running their bodies; completion is deferred
    /// while any are active.
    active_loops: Arc<AtomicUsize>,
}

/// The workflow engine facade and DAG execution coordinator.
pub struct WorkflowEngine {
    parser: WorkflowParser,
    workflow_repo: Arc<dyn WorkflowRepository>,
    execution_repo: Arc<dyn ExecutionRepository>,
    scheduler: Arc<TaskScheduler>,
    sink: Arc<dyn EventSink>,
    error_handler: ErrorHandler,
    compensation: Arc<CompensationManager>,
    executors: HashMap<NodeKind, Arc<dyn NodeExecutor>>,
    workflows: AsyncRwLock<HashMap<String, Arc<Workflow>>>,
    executions: AsyncRwLock<HashMap<ExecutionId, ExecutionEntry>>,
}

impl WorkflowEngine {
    /// Creates an engine over its collaborators.
    #[must_use]
    pub fn new(
        workflow_repo: Arc<dyn WorkflowRepository>,
        execution_repo: Arc<dyn ExecutionRepository>,
        scheduler: Arc<TaskScheduler>,
        sink: Arc<dyn EventSink>,
        agents: Arc<dyn AgentRuntime>,
        tools: Arc<dyn ToolRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<WorkflowEngine>| {
            let mut executors: HashMap<NodeKind, Arc<dyn NodeExecutor>> = HashMap::new();
            executors.insert(NodeKind::Agent, Arc::new(AgentNodeExecutor::new(agents)));
            executors.insert(NodeKind::Tool, Arc::new(ToolNodeExecutor::new(tools)));
            executors.insert(NodeKind::Control, Arc::new(ControlNodeExecutor));
            executors.insert(NodeKind::Aggregation, Arc::new(AggregationNodeExecutor));
            executors.insert(
                NodeKind::SubWorkflow,
                Arc::new(SubWorkflowExecutor::new(weak.clone())),
            );

            Self {
                parser: WorkflowParser::new(),
                workflow_repo,
                execution_repo,
                scheduler,
                sink,
                error_handler: ErrorHandler::new(),
                compensation: Arc::new(CompensationManager::new()),
                executors,
                workflows: AsyncRwLock::new(HashMap::new()),
                executions: AsyncRwLock::new(HashMap::new()),
            }
        })
    }

    /// Registers the engine with its scheduler and starts the scheduler
    /// loop.
    ///
    /// # Errors
    ///
    /// Returns an error when the scheduler is already running.
    pub fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let task_executor: Arc<dyn TaskExecutor> = Arc::new(EngineTaskExecutor {
            engine: Arc::downgrade(self),
        });
        for kind in NodeKind::all() {
            self.scheduler.register_executor(kind, Arc::clone(&task_executor));
        }
        self.scheduler
            .start(Arc::clone(self) as Arc<dyn SchedulerContext>)?;
        Ok(())
    }

    /// Stops the scheduler loop.
    ///
    /// # Errors
    ///
    /// Returns an error when the scheduler is not running.
    pub fn stop(&self) -> Result<(), EngineError> {
        self.scheduler.stop()?;
        Ok(())
    }

    /// Returns the compensation manager (handler registration, status).
    #[must_use]
    pub fn compensation(&self) -> &Arc<CompensationManager> {
        &self.compensation
    }

    /// Parses, validates, persists, and announces a workflow definition.
    ///
    /// # Errors
    ///
    /// Returns parse/validation errors or a storage failure.
    pub async fn create_workflow(&self, document: &str) -> Result<String, EngineError> {
        let workflow = self.parser.parse(document)?;
        self.register_workflow(workflow).await
    }

    /// Registers an already-built workflow definition.
    ///
    /// # Errors
    ///
    /// Returns validation errors or a storage failure.
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<String, EngineError> {
        let errors = workflow.validate();
        if !errors.is_empty() {
            return Err(EngineError::Parse(
                cascade_workflow::ParseError::Validation { errors },
            ));
        }

        self.workflow_repo.save(workflow.clone()).await?;
        let workflow_id = workflow.id.clone();
        let name = workflow.name.clone();
        self.workflows
            .write()
            .await
            .insert(workflow_id.clone(), Arc::new(workflow));

        let _ = self
            .sink
            .publish(
                topic::WORKFLOW_CREATED,
                json!({"workflow_id": workflow_id, "name": name}),
            )
            .await;
        info!(workflow_id, "workflow registered");
        Ok(workflow_id)
    }

    /// Starts an execution of a DAG workflow with the given initial inputs.
    ///
    /// Dependency-free nodes are enqueued ready; the rest wait. Returns the
    /// execution id immediately; progress is observable through events and
    /// [`Self::execution_status`].
    ///
    /// # Errors
    ///
    /// Returns an error when the workflow is unknown or not a DAG.
    pub async fn start_execution(
        &self,
        workflow_id: &str,
        inputs: JsonMap<String, JsonValue>,
    ) -> Result<ExecutionId, EngineError> {
        self.start_execution_inner(workflow_id, inputs, None).await
    }

    /// Starts a child execution whose context chains to `parent`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::start_execution`].
    pub async fn start_child_execution(
        &self,
        workflow_id: &str,
        inputs: JsonMap<String, JsonValue>,
        parent: &ExecutionContext,
    ) -> Result<ExecutionId, EngineError> {
        self.start_execution_inner(
            workflow_id,
            inputs,
            Some((parent.execution_id, Arc::new(parent.clone()))),
        )
        .await
    }

    async fn start_execution_inner(
        &self,
        workflow_id: &str,
        inputs: JsonMap<String, JsonValue>,
        parent: Option<(ExecutionId, Arc<ExecutionContext>)>,
    ) -> Result<ExecutionId, EngineError> {
        let workflow = self.get_workflow(workflow_id).await?;
        if workflow.kind != WorkflowKind::Dag {
            return Err(EngineError::UnsupportedKind {
                workflow_id: workflow_id.to_string(),
                kind: workflow.kind.to_string(),
            });
        }

        let mut execution = Execution::new(&workflow.id, &workflow.version, inputs);
        for (key, value) in &workflow.variables {
            execution.context.set_variable(key.clone(), value.clone());
        }
        if let Some((parent_id, parent_context)) = parent {
            execution.parent_execution_id = Some(parent_id);
            execution.context.parent = Some(parent_context);
        }

        for node in &workflow.nodes {
            let record = execution.ensure_node_execution(&node.id);
            if node.dependencies.is_empty() {
                record.mark_ready();
            }
        }
        execution.start();

        let execution_id = execution.id;
        self.execution_repo.save(execution.clone()).await?;

        let entry = ExecutionEntry {
            execution: Arc::new(AsyncMutex::new(execution)),
            workflow: Arc::clone(&workflow),
            cancel: CancellationToken::new(),
            active_loops: Arc::new(AtomicUsize::new(0)),
        };
        self.executions.write().await.insert(execution_id, entry);

        self.publish_execution_event(
            execution_id,
            ExecutionEventKind::WorkflowStarted,
            JsonMap::new(),
        )
        .await;

        for node in &workflow.nodes {
            let task = ScheduledTask::new(execution_id, node.id.clone(), node.priority());
            if node.dependencies.is_empty() {
                self.scheduler.schedule_ready(task);
            } else {
                self.scheduler.schedule_waiting(task);
            }
        }

        info!(%execution_id, workflow_id, "execution started");
        Ok(execution_id)
    }

    /// Cancels an execution.
    ///
    /// Queued tasks are discarded, in-flight workers observe the
    /// cancellation signal at their next suspension point, and their node
    /// records end Cancelled. Cancelling a cancelled execution is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error when the execution is unknown or already Completed
    /// or Failed.
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<(), EngineError> {
        let entry = self.entry(execution_id).await.ok_or(
            EngineError::ExecutionNotFound { execution_id },
        )?;

        {
            let mut execution = entry.execution.lock().await;
            match execution.status {
                ExecutionStatus::Cancelled => return Ok(()),
                status if status.is_terminal() => {
                    return Err(EngineError::InvalidStatus {
                        execution_id,
                        status,
                        operation: "cancel",
                    });
                }
                _ => {}
            }
            execution.cancel();
            for record in execution.node_executions.values_mut() {
                // Running nodes mark themselves when they observe the
                // cancellation signal.
                if !record.status.is_terminal() && record.status != NodeExecutionStatus::Running {
                    record.cancel();
                }
            }
        }

        entry.cancel.cancel();
        self.scheduler.purge_execution(execution_id);
        self.publish_execution_event(
            execution_id,
            ExecutionEventKind::WorkflowCancelled,
            JsonMap::new(),
        )
        .await;
        self.persist(&entry).await;
        info!(%execution_id, "execution cancelled");
        Ok(())
    }

    /// Freezes admission for an execution without interrupting in-flight
    /// nodes.
    ///
    /// # Errors
    ///
    /// Returns an error when the execution is unknown or not Running.
    pub async fn suspend(&self, execution_id: ExecutionId) -> Result<(), EngineError> {
        let entry = self.entry(execution_id).await.ok_or(
            EngineError::ExecutionNotFound { execution_id },
        )?;
        {
            let mut execution = entry.execution.lock().await;
            if execution.status != ExecutionStatus::Running {
                return Err(EngineError::InvalidStatus {
                    execution_id,
                    status: execution.status,
                    operation: "suspend",
                });
            }
            execution.suspend();
        }
        self.publish_execution_event(
            execution_id,
            ExecutionEventKind::WorkflowSuspended,
            JsonMap::new(),
        )
        .await;
        self.persist(&entry).await;
        Ok(())
    }

    /// Restores admission after a suspend.
    ///
    /// # Errors
    ///
    /// Returns an error when the execution is unknown or not Suspended.
    pub async fn resume(&self, execution_id: ExecutionId) -> Result<(), EngineError> {
        let entry = self.entry(execution_id).await.ok_or(
            EngineError::ExecutionNotFound { execution_id },
        )?;
        {
            let mut execution = entry.execution.lock().await;
            if execution.status != ExecutionStatus::Suspended {
                return Err(EngineError::InvalidStatus {
                    execution_id,
                    status: execution.status,
                    operation: "resume",
                });
            }
            execution.resume();
        }
        self.publish_execution_event(
            execution_id,
            ExecutionEventKind::WorkflowResumed,
            JsonMap::new(),
        )
        .await;
        self.persist(&entry).await;
        Ok(())
    }

    /// Returns the queryable status view of an execution.
    ///
    /// # Errors
    ///
    /// Returns an error when the execution is unknown.
    pub async fn execution_status(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionStatusView, EngineError> {
        if let Some(entry) = self.entry(execution_id).await {
            return Ok(entry.execution.lock().await.status_view());
        }
        match self.execution_repo.get(execution_id).await? {
            Some(execution) => Ok(execution.status_view()),
            None => Err(EngineError::ExecutionNotFound { execution_id }),
        }
    }

    /// Returns the captured node outputs of an execution.
    pub async fn execution_outputs(
        &self,
        execution_id: ExecutionId,
    ) -> Option<BTreeMap<NodeId, OutputMap>> {
        let entry = self.entry(execution_id).await?;
        let execution = entry.execution.lock().await;
        Some(execution.context.outputs.clone())
    }

    /// Returns the compensation status for an execution, if a plan exists.
    pub async fn compensation_status(
        &self,
        execution_id: ExecutionId,
    ) -> Option<CompensationStatus> {
        self.compensation.status(execution_id).await
    }

    /// Polls until the execution reaches a terminal status or the timeout
    /// elapses, returning the final status view.
    ///
    /// # Errors
    ///
    /// Returns an error when the execution is unknown.
    pub async fn wait_for_completion(
        &self,
        execution_id: ExecutionId,
        timeout: Duration,
    ) -> Result<ExecutionStatusView, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let view = self.execution_status(execution_id).await?;
            if view.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(view);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Removes terminal executions older than `days` from the repository.
    ///
    /// # Errors
    ///
    /// Returns a storage failure.
    pub async fn cleanup_executions(&self, days: i64) -> Result<usize, EngineError> {
        Ok(self.execution_repo.cleanup_older_than(days).await?)
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Arc<Workflow>, EngineError> {
        if let Some(workflow) = self.workflows.read().await.get(workflow_id) {
            return Ok(Arc::clone(workflow));
        }
        match self.workflow_repo.get(workflow_id).await? {
            Some(workflow) => {
                let workflow = Arc::new(workflow);
                self.workflows
                    .write()
                    .await
                    .insert(workflow_id.to_string(), Arc::clone(&workflow));
                Ok(workflow)
            }
            None => Err(EngineError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            }),
        }
    }

    async fn entry(&self, execution_id: ExecutionId) -> Option<ExecutionEntry> {
        self.executions.read().await.get(&execution_id).cloned()
    }

    /// Runs one scheduled node task: input preparation, dispatch with
    /// timeout and cancellation, output capture, and downstream triggering.
    pub(crate) async fn execute_node_task(self: &Arc<Self>, task: ScheduledTask, node: Node) {
        let Some(entry) = self.entry(task.execution_id).await else {
            warn!(execution_id = %task.execution_id, "task for unknown execution");
            return;
        };

        let (input, context_snapshot) = {
            let mut execution = entry.execution.lock().await;
            if execution.is_terminal() {
                return;
            }
            let status = execution
                .node_execution(&node.id)
                .map(|r| r.status)
                .unwrap_or(NodeExecutionStatus::Waiting);
            if !matches!(
                status,
                NodeExecutionStatus::Waiting
                    | NodeExecutionStatus::Ready
                    | NodeExecutionStatus::Retrying
            ) {
                debug!(node_id = %node.id, ?status, "node no longer runnable");
                return;
            }
            if !execution.can_execute_node(&node.id, &node.dependencies) {
                debug!(node_id = %node.id, "dependencies regressed; task dropped");
                return;
            }

            let mut input = JsonMap::new();
            for (key, expr) in &node.inputs {
                // Unresolvable references stay absent (optional inputs).
                if let Some(value) = resolve_input_value(expr, &execution.context) {
                    input.insert(key.clone(), value);
                }
            }
            let record = execution.ensure_node_execution(&node.id);
            if record.status == NodeExecutionStatus::Waiting {
                record.mark_ready();
            }
            record.start(Some(input.clone()));
            (input, execution.context.clone())
        };

        self.publish_node_event(
            task.execution_id,
            &node.id,
            ExecutionEventKind::NodeStarted,
            {
                let mut data = JsonMap::new();
                data.insert("input".to_string(), JsonValue::Object(input.clone()));
                data
            },
        )
        .await;
        self.persist(&entry).await;

        let Some(executor) = self.executors.get(&node.kind).cloned() else {
            let error = NodeError::new(
                ErrorKind::Scheduling,
                format!("no executor for node kind {}", node.kind),
            );
            self.handle_node_error(&entry, task, &node, error).await;
            return;
        };

        let timeout_secs = node.timeout_secs();
        let result = tokio::select! {
            () = entry.cancel.cancelled() => Err(NodeError::cancelled()),
            outcome = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                executor.execute(&node, &input, &context_snapshot),
            ) => match outcome {
                Ok(result) => result,
                Err(_) => Err(NodeError::timeout(&node.id, timeout_secs)),
            },
        };

        match result {
            Ok(output) => self.handle_node_success(&entry, &task, &node, output).await,
            Err(error) => self.handle_node_error(&entry, task, &node, error).await,
        }
    }

    async fn handle_node_success(
        self: &Arc<Self>,
        entry: &ExecutionEntry,
        task: &ScheduledTask,
        node: &Node,
        output: OutputMap,
    ) {
        {
            let mut execution = entry.execution.lock().await;
            if execution.is_terminal() {
                return;
            }
            execution.record_node_output(&node.id, output.clone());
        }

        self.publish_node_event(
            task.execution_id,
            &node.id,
            ExecutionEventKind::NodeCompleted,
            JsonMap::new(),
        )
        .await;
        self.persist(entry).await;

        let gate = match (node.kind, node.subtype) {
            (NodeKind::Control, Some(ControlSubtype::Switch)) => DownstreamGate::SwitchBranch(
                output
                    .get("selected_branch")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
            ),
            (NodeKind::Control, Some(ControlSubtype::Condition)) => DownstreamGate::ConditionResult(
                output.get("result").and_then(JsonValue::as_bool).unwrap_or(false),
            ),
            _ => DownstreamGate::All,
        };

        if node.kind == NodeKind::Control {
            match node.subtype {
                Some(ControlSubtype::Parallel) => self.schedule_parallel_branches(entry, node).await,
                Some(ControlSubtype::Loop) => self.run_loop(entry, node).await,
                _ => {}
            }
        }

        self.trigger_downstream(entry, node, &gate).await;
        self.check_completion(entry).await;
    }

    /// Parallel control nodes immediately schedule their named sibling
    /// branches.
    async fn schedule_parallel_branches(&self, entry: &ExecutionEntry, node: &Node) {
        let branches: Vec<NodeId> = node
            .config_array("branches")
            .map(|b| {
                b.iter()
                    .filter_map(JsonValue::as_str)
                    .map(NodeId::new)
                    .collect()
            })
            .unwrap_or_default();
        for branch in branches {
            self.promote_if_ready(entry, &branch).await;
        }
    }

    /// Re-schedules the loop body until the predicate is false or the
    /// iteration cap is reached. The iteration counter lives in the
    /// execution context as `loop_iteration`.
    async fn run_loop(self: &Arc<Self>, entry: &ExecutionEntry, node: &Node) {
        entry.active_loops.fetch_add(1, Ordering::SeqCst);
        self.run_loop_inner(entry, node).await;
        entry.active_loops.fetch_sub(1, Ordering::SeqCst);
    }

    async fn run_loop_inner(self: &Arc<Self>, entry: &ExecutionEntry, node: &Node) {
        let body: Vec<NodeId> = node
            .config_array("body")
            .map(|b| {
                b.iter()
                    .filter_map(JsonValue::as_str)
                    .map(NodeId::new)
                    .collect()
            })
            .unwrap_or_default();
        if body.is_empty() {
            return;
        }
        let condition = node.config_str("condition").unwrap_or_default().to_string();
        let max_iterations = node.config_u64("max_iterations").unwrap_or(100);

        let mut iteration = {
            let mut execution = entry.execution.lock().await;
            let current = execution
                .context
                .variable("loop_iteration")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0);
            execution
                .context
                .set_variable("loop_iteration", json!(current));
            current
        };

        while iteration < max_iterations {
            let proceed = {
                let execution = entry.execution.lock().await;
                execution.status == ExecutionStatus::Running
                    && evaluate_predicate(&condition, &execution.context)
            };
            if !proceed {
                break;
            }

            debug!(node_id = %node.id, iteration, "starting loop iteration");
            {
                let mut execution = entry.execution.lock().await;
                let execution_id = execution.id;
                for id in &body {
                    let mut record = NodeExecution::new(execution_id, id.clone());
                    record.mark_ready();
                    execution.node_executions.insert(id.clone(), record);
                }
            }
            for id in &body {
                let priority = entry.workflow.node(id).map_or(0, Node::priority);
                self.scheduler.schedule_ready(ScheduledTask::new(
                    entry.execution.lock().await.id,
                    id.clone(),
                    priority,
                ));
            }

            // Wait for the body to reach terminal states.
            let mut failed = false;
            loop {
                if entry.cancel.is_cancelled() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                let execution = entry.execution.lock().await;
                if execution.is_terminal() {
                    return;
                }
                let done = body.iter().all(|id| {
                    execution
                        .node_execution(id)
                        .is_some_and(|r| r.status.is_terminal())
                });
                if done {
                    failed = body.iter().any(|id| {
                        execution
                            .node_execution(id)
                            .is_some_and(|r| r.status == NodeExecutionStatus::Failed)
                    });
                    break;
                }
            }

            iteration += 1;
            {
                let mut execution = entry.execution.lock().await;
                execution
                    .context
                    .set_variable("loop_iteration", json!(iteration));
            }
            if failed {
                break;
            }
        }
    }

    /// Walks the downstream successors of a completed (or skipped) node
    /// (edge targets plus nodes that list it as a dependency) and promotes
    /// those whose dependencies are all satisfied. Non-selected switch
    /// targets and false-gated edges are skipped, which cascades forward.
    async fn trigger_downstream(
        self: &Arc<Self>,
        entry: &ExecutionEntry,
        node: &Node,
        gate: &DownstreamGate,
    ) {
        let mut handled = std::collections::HashSet::new();

        for edge in entry.workflow.outgoing_edges(&node.id) {
            handled.insert(edge.target.clone());
            let propagate = match gate {
                DownstreamGate::All => match &edge.condition {
                    None => true,
                    Some(condition) => {
                        let execution = entry.execution.lock().await;
                        evaluate_predicate(condition, &execution.context)
                    }
                },
                DownstreamGate::SwitchBranch(selected) => match selected {
                    Some(selected) => {
                        edge.target.as_str() == selected
                            || edge.condition.as_deref() == Some(selected.as_str())
                    }
                    None => false,
                },
                DownstreamGate::ConditionResult(result) => *result,
            };

            if propagate {
                self.promote_if_ready(entry, &edge.target).await;
            } else {
                self.skip_node(entry, &edge.target, "branch not selected")
                    .await;
            }
        }

        // Dependency-declared successors without an explicit edge.
        let dependents: Vec<NodeId> = entry
            .workflow
            .nodes
            .iter()
            .filter(|n| n.dependencies.contains(&node.id) && !handled.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        for dependent in dependents {
            let propagate = match gate {
                DownstreamGate::All => true,
                DownstreamGate::SwitchBranch(selected) => {
                    selected.as_deref() == Some(dependent.as_str())
                }
                DownstreamGate::ConditionResult(result) => *result,
            };
            if propagate {
                self.promote_if_ready(entry, &dependent).await;
            } else {
                self.skip_node(entry, &dependent, "branch not selected").await;
            }
        }
    }

    /// Promotes a node to the ready queue once its dependencies allow it.
    ///
    /// The Waiting -> Ready transition happens at most once per record, so
    /// two upstream completions racing here schedule the node exactly once.
    async fn promote_if_ready(&self, entry: &ExecutionEntry, node_id: &NodeId) {
        let Some(node) = entry.workflow.node(node_id) else {
            return;
        };

        let newly_ready = {
            let mut execution = entry.execution.lock().await;
            if execution.status != ExecutionStatus::Running
                && execution.status != ExecutionStatus::Suspended
            {
                return;
            }
            if !deps_satisfied(&entry.workflow, &execution, node) {
                return;
            }
            let record = execution.ensure_node_execution(node_id);
            if record.status == NodeExecutionStatus::Waiting {
                record.mark_ready();
                true
            } else {
                false
            }
        };

        if newly_ready {
            let execution_id = entry.execution.lock().await.id;
            if !self.scheduler.promote_waiting(execution_id, node_id) {
                self.scheduler.schedule_ready(ScheduledTask::new(
                    execution_id,
                    node_id.clone(),
                    node.priority(),
                ));
            }
        }
    }

    /// Marks a node Skipped (branch not selected or skip policy) and lets
    /// downstream evaluation proceed as if it had succeeded.
    async fn skip_node(self: &Arc<Self>, entry: &ExecutionEntry, node_id: &NodeId, reason: &str) {
        let execution_id = {
            let mut execution = entry.execution.lock().await;
            let record = execution.ensure_node_execution(node_id);
            if record.status.is_terminal() || record.status == NodeExecutionStatus::Running {
                return;
            }
            record.skip(reason);
            execution.id
        };

        self.publish_node_event(execution_id, node_id, ExecutionEventKind::NodeSkipped, {
            let mut data = JsonMap::new();
            data.insert("reason".to_string(), json!(reason));
            data
        })
        .await;

        if let Some(node) = entry.workflow.node(node_id) {
            // Skip-forward: downstream sees the skipped dependency as
            // satisfied-with-no-output.
            Box::pin(self.trigger_downstream(entry, node, &DownstreamGate::All)).await;
        }
        self.check_completion(entry).await;
    }

    /// Completes the execution once every node is terminal.
    async fn check_completion(self: &Arc<Self>, entry: &ExecutionEntry) {
        // A loop re-running its body makes nodes non-terminal again;
        // completion waits for it.
        if entry.active_loops.load(Ordering::SeqCst) > 0 {
            return;
        }
        let outcome = {
            let mut execution = entry.execution.lock().await;
            if execution.status != ExecutionStatus::Running {
                return;
            }
            let statuses: Vec<NodeExecutionStatus> = entry
                .workflow
                .nodes
                .iter()
                .filter_map(|n| execution.node_execution(&n.id))
                .map(|r| r.status)
                .collect();
            if statuses.len() < entry.workflow.nodes.len()
                || statuses.iter().any(|s| !s.is_terminal())
            {
                return;
            }

            if statuses.iter().all(|s| s.satisfies_dependency()) {
                execution.complete();
                Some(ExecutionEventKind::WorkflowCompleted)
            } else {
                execution.fail("workflow finished with failed nodes");
                Some(ExecutionEventKind::WorkflowFailed)
            }
        };

        if let Some(kind) = outcome {
            let execution_id = entry.execution.lock().await.id;
            self.publish_execution_event(execution_id, kind, JsonMap::new())
                .await;
            self.persist(entry).await;
            info!(%execution_id, event = ?kind, "execution finished");
        }
    }

    /// Routes a node failure through the error handler.
    async fn handle_node_error(
        self: &Arc<Self>,
        entry: &ExecutionEntry,
        task: ScheduledTask,
        node: &Node,
        mut error: NodeError,
    ) {
        if error.kind == ErrorKind::Cancelled {
            let mut execution = entry.execution.lock().await;
            if let Some(record) = execution.node_executions.get_mut(&node.id)
                && !record.status.is_terminal()
            {
                record.cancel();
            }
            return;
        }

        // Exhausted retry policies reclassify the error before selection.
        if let Some(policy) = &node.retry_policy
            && task.retry_count >= policy.max_retries
            && error.kind != ErrorKind::RetryExhausted
        {
            error = error.into_retry_exhausted(task.retry_count);
        }

        let strategy =
            self.error_handler
                .determine_strategy(&entry.workflow, node, &error, task.retry_count);
        warn!(
            execution_id = %task.execution_id,
            node_id = %node.id,
            error = %error,
            ?strategy,
            "node failed"
        );

        match strategy {
            ErrorStrategy::Retry => self.retry_node(entry, task, node, &error).await,
            ErrorStrategy::Skip => {
                {
                    let mut execution = entry.execution.lock().await;
                    if let Some(record) = execution.node_executions.get_mut(&node.id) {
                        record.skip(error.message.clone());
                    }
                }
                self.publish_node_event(
                    task.execution_id,
                    &node.id,
                    ExecutionEventKind::NodeSkipped,
                    {
                        let mut data = JsonMap::new();
                        data.insert("reason".to_string(), json!(error.message));
                        data
                    },
                )
                .await;
                self.persist(entry).await;
                self.trigger_downstream(entry, node, &DownstreamGate::All).await;
                self.check_completion(entry).await;
            }
            ErrorStrategy::Fail => {
                self.fail_execution(entry, &task, node, &error).await;
            }
            ErrorStrategy::Fallback { target } => {
                self.fallback_node(entry, &task, node, &error, &target).await;
            }
            ErrorStrategy::Compensate => {
                self.compensate_execution(entry, &task, node, &error).await;
            }
            ErrorStrategy::Escalate => {
                let _ = self
                    .sink
                    .publish(
                        topic::ERROR_ESCALATED,
                        json!({
                            "execution_id": task.execution_id,
                            "node_id": node.id,
                            "error": error.message,
                            "kind": error.kind.as_str(),
                        }),
                    )
                    .await;
                self.fail_execution(entry, &task, node, &error).await;
            }
        }
    }

    async fn retry_node(
        &self,
        entry: &ExecutionEntry,
        task: ScheduledTask,
        node: &Node,
        error: &NodeError,
    ) {
        let Some(policy) = node.retry_policy.as_ref() else {
            return;
        };
        {
            let mut execution = entry.execution.lock().await;
            if let Some(record) = execution.node_executions.get_mut(&node.id) {
                record.fail(error.to_error_info());
                record.retrying();
            }
        }

        let delay = backoff_delay(policy, task.retry_count);
        self.publish_node_event(
            task.execution_id,
            &node.id,
            ExecutionEventKind::NodeRetrying,
            {
                let mut data = JsonMap::new();
                data.insert("retry_count".to_string(), json!(task.retry_count + 1));
                data.insert("delay_secs".to_string(), json!(delay.as_secs_f64()));
                data.insert("error".to_string(), json!(error.message));
                data
            },
        )
        .await;
        self.persist(entry).await;

        info!(
            execution_id = %task.execution_id,
            node_id = %node.id,
            attempt = task.retry_count + 1,
            delay_ms = delay.as_millis() as u64,
            "retrying node"
        );
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.scheduler.schedule_ready(task.for_retry(delay));
    }

    async fn fail_execution(
        self: &Arc<Self>,
        entry: &ExecutionEntry,
        task: &ScheduledTask,
        node: &Node,
        error: &NodeError,
    ) {
        {
            let mut execution = entry.execution.lock().await;
            if let Some(record) = execution.node_executions.get_mut(&node.id) {
                record.fail(error.to_error_info());
            }
            if !execution.is_terminal() {
                execution.fail(format!("node {} failed: {}", node.id, error.message));
            }
        }

        self.publish_node_event(
            task.execution_id,
            &node.id,
            ExecutionEventKind::NodeFailed,
            {
                let mut data = JsonMap::new();
                data.insert("error".to_string(), json!(error.message));
                data.insert("kind".to_string(), json!(error.kind.as_str()));
                data
            },
        )
        .await;
        self.publish_execution_event(task.execution_id, ExecutionEventKind::WorkflowFailed, {
            let mut data = JsonMap::new();
            data.insert("error".to_string(), json!(error.message));
            data
        })
        .await;

        // Other in-flight nodes of this execution receive cancellation.
        entry.cancel.cancel();
        self.scheduler.purge_execution(task.execution_id);
        self.persist(entry).await;
    }

    /// Reroutes a failure to a named fallback node. The failed node is
    /// recorded as skipped-with-error so downstream joins still resolve.
    async fn fallback_node(
        self: &Arc<Self>,
        entry: &ExecutionEntry,
        task: &ScheduledTask,
        node: &Node,
        error: &NodeError,
        target: &str,
    ) {
        let target_id = NodeId::new(target);
        if entry.workflow.node(&target_id).is_none() {
            warn!(target, "fallback target does not exist; failing");
            self.fail_execution(entry, task, node, error).await;
            return;
        }

        self.publish_node_event(
            task.execution_id,
            &node.id,
            ExecutionEventKind::NodeFailed,
            {
                let mut data = JsonMap::new();
                data.insert("error".to_string(), json!(error.message));
                data.insert("fallback".to_string(), json!(target));
                data
            },
        )
        .await;

        {
            let mut execution = entry.execution.lock().await;
            if let Some(record) = execution.node_executions.get_mut(&node.id) {
                record.skip(format!("failed, rerouted to {target}: {}", error.message));
            }
            let execution_id = execution.id;
            let record = execution.ensure_node_execution(&target_id);
            if record.status == NodeExecutionStatus::Waiting {
                record.mark_ready();
            } else if record.status.is_terminal() {
                // Re-run an already-finished fallback target.
                let mut fresh = NodeExecution::new(execution_id, target_id.clone());
                fresh.mark_ready();
                execution.node_executions.insert(target_id.clone(), fresh);
            }
        }
        self.persist(entry).await;

        let priority = entry
            .workflow
            .node(&target_id)
            .map_or(0, Node::priority);
        if !self.scheduler.promote_waiting(task.execution_id, &target_id) {
            self.scheduler.schedule_ready(ScheduledTask::new(
                task.execution_id,
                target_id,
                priority,
            ));
        }
    }

    /// Unwinds the execution: marks it Compensating, drains in-flight
    /// nodes, builds and runs the compensation plan, then records the final
    /// failure.
    async fn compensate_execution(
        self: &Arc<Self>,
        entry: &ExecutionEntry,
        task: &ScheduledTask,
        node: &Node,
        error: &NodeError,
    ) {
        {
            let mut execution = entry.execution.lock().await;
            if let Some(record) = execution.node_executions.get_mut(&node.id) {
                record.fail(error.to_error_info());
            }
            if execution.is_terminal() {
                return;
            }
            execution.compensating();
        }

        self.publish_node_event(
            task.execution_id,
            &node.id,
            ExecutionEventKind::NodeFailed,
            {
                let mut data = JsonMap::new();
                data.insert("error".to_string(), json!(error.message));
                data.insert("kind".to_string(), json!(error.kind.as_str()));
                data
            },
        )
        .await;
        self.publish_execution_event(
            task.execution_id,
            ExecutionEventKind::WorkflowCompensating,
            {
                let mut data = JsonMap::new();
                data.insert("failed_node".to_string(), json!(node.id));
                data
            },
        )
        .await;
        self.persist(entry).await;

        // Let in-flight nodes drain before unwinding.
        self.wait_for_drain(entry, Duration::from_secs(30)).await;

        let snapshot = entry.execution.lock().await.clone();
        self.compensation
            .create_plan(
                &entry.workflow,
                &snapshot,
                &node.id,
                CompensationStrategy::Reverse,
            )
            .await;
        let compensated = self.compensation.execute(task.execution_id, &snapshot).await;

        {
            let mut execution = entry.execution.lock().await;
            execution.fail(format!(
                "node {} failed: {}; compensation {}",
                node.id,
                error.message,
                if compensated { "completed" } else { "failed" }
            ));
        }
        let kind = if compensated {
            ExecutionEventKind::WorkflowCompensated
        } else {
            ExecutionEventKind::WorkflowFailed
        };
        self.publish_execution_event(task.execution_id, kind, JsonMap::new())
            .await;
        self.scheduler.purge_execution(task.execution_id);
        self.persist(entry).await;
    }

    /// Polls until no node of the execution is Running (bounded).
    async fn wait_for_drain(&self, entry: &ExecutionEntry, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let draining = {
                let execution = entry.execution.lock().await;
                execution
                    .node_executions
                    .values()
                    .any(|r| r.status == NodeExecutionStatus::Running)
            };
            if !draining || tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn publish_execution_event(
        &self,
        execution_id: ExecutionId,
        kind: ExecutionEventKind,
        data: JsonMap<String, JsonValue>,
    ) {
        let mut event = ExecutionEvent::execution(execution_id, kind);
        event.data = data;
        let _ = self
            .sink
            .publish(topic::EXECUTION_EVENTS, event.into_payload())
            .await;
    }

    async fn publish_node_event(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
        kind: ExecutionEventKind,
        data: JsonMap<String, JsonValue>,
    ) {
        let mut event = ExecutionEvent::node(execution_id, node_id.as_str(), kind);
        event.data = data;
        let _ = self
            .sink
            .publish(topic::NODE_EVENTS, event.into_payload())
            .await;
    }

    async fn persist(&self, entry: &ExecutionEntry) {
        let snapshot = entry.execution.lock().await.clone();
        if let Err(e) = self.execution_repo.update(snapshot).await {
            warn!(error = %e, "failed to persist execution");
        }
    }
}

/// Returns true when the node's dependencies allow it to run.
///
/// Beyond the standard all-Success-or-Skipped rule, dependencies that are
/// all branches of a `wait_all: false` Parallel node count as satisfied as
/// soon as any one branch succeeds.
fn deps_satisfied(workflow: &Workflow, execution: &Execution, node: &Node) -> bool {
    if execution.can_execute_node(&node.id, &node.dependencies) {
        return true;
    }
    if node.dependencies.is_empty() {
        return false;
    }

    let first_success_group = workflow.nodes.iter().any(|candidate| {
        candidate.kind == NodeKind::Control
            && candidate.subtype == Some(ControlSubtype::Parallel)
            && candidate.config_bool("wait_all") == Some(false)
            && node.dependencies.iter().all(|dep| {
                candidate
                    .config_array("branches")
                    .is_some_and(|branches| {
                        branches
                            .iter()
                            .filter_map(JsonValue::as_str)
                            .any(|b| b == dep.as_str())
                    })
            })
    });
    if !first_success_group {
        return false;
    }

    let any_success = node.dependencies.iter().any(|dep| {
        execution
            .node_execution(dep)
            .is_some_and(|r| r.status == NodeExecutionStatus::Success)
    });
    let self_runnable = !execution.node_execution(&node.id).is_some_and(|r| {
        matches!(
            r.status,
            NodeExecutionStatus::Running
                | NodeExecutionStatus::Success
                | NodeExecutionStatus::Cancelled
        )
    });
    any_success && self_runnable
}

/// Bridges the scheduler's per-kind executor registry to the engine.
struct EngineTaskExecutor {
    engine: Weak<WorkflowEngine>,
}

#[async_trait]
impl TaskExecutor for EngineTaskExecutor {
    async fn execute(&self, task: ScheduledTask, node: Node) {
        if let Some(engine) = self.engine.upgrade() {
            engine.execute_node_task(task, node).await;
        }
    }
}

#[async_trait]
impl SchedulerContext for WorkflowEngine {
    async fn node(&self, execution_id: ExecutionId, node_id: &NodeId) -> Option<Node> {
        let entry = self.entry(execution_id).await?;
        entry.workflow.node(node_id).cloned()
    }

    async fn dependencies_satisfied(&self, execution_id: ExecutionId, node_id: &NodeId) -> bool {
        let Some(entry) = self.entry(execution_id).await else {
            return false;
        };
        let Some(node) = entry.workflow.node(node_id) else {
            return false;
        };
        let execution = entry.execution.lock().await;
        deps_satisfied(&entry.workflow, &execution, node)
    }

    async fn admission(&self, execution_id: ExecutionId) -> Admission {
        let Some(entry) = self.entry(execution_id).await else {
            return Admission::Drop;
        };
        let execution = entry.execution.lock().await;
        match execution.status {
            ExecutionStatus::Running => Admission::Admit,
            ExecutionStatus::Pending | ExecutionStatus::Suspended => Admission::Defer,
            _ => Admission::Drop,
        }
    }
}
