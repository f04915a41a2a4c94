//! The task scheduler: ready queue, waiting map, running registry.
//!
//! The loop alternates two passes with a cooperative pause between them:
//!
//! 1. **Ready drain**: peek the highest-priority due task; gate it through
//!    the execution's admission state and the resource manager; on
//!    admission, move it to the running registry and spawn a worker that
//!    applies the kind-keyed rate limiter, invokes the registered executor,
//!    and releases resources on the way out. If resources are exhausted the
//!    task stays at the head and the pass ends (back-pressure is queue
//!    growth, never a drop).
//! 2. **Waiting sweep**: promote waiting tasks whose dependencies are all
//!    satisfied to the ready queue.

use crate::error::SchedulerError;
use crate::rate_limit::RateLimiterSet;
use crate::resource::{ResourceManager, ResourceUsage};
use crate::task::{ScheduledTask, TaskKey};
use async_trait::async_trait;
use cascade_core::ExecutionId;
use cascade_workflow::{Node, NodeId, NodeKind};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-execution admission decision for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The execution is running; the task may be dispatched.
    Admit,
    /// The execution is suspended; hold the task without dispatching.
    Defer,
    /// The execution is cancelled or terminal; discard the task.
    Drop,
}

/// The engine-side surface the scheduler consults.
#[async_trait]
pub trait SchedulerContext: Send + Sync {
    /// Looks up the node definition for a task.
    async fn node(&self, execution_id: ExecutionId, node_id: &NodeId) -> Option<Node>;

    /// Returns true once every dependency of the node is satisfied.
    async fn dependencies_satisfied(&self, execution_id: ExecutionId, node_id: &NodeId) -> bool;

    /// Returns the execution's admission state.
    async fn admission(&self, execution_id: ExecutionId) -> Admission;
}

/// Executes one task of a given node kind.
///
/// Executors are infallible from the scheduler's point of view: failure
/// handling (retry, skip, compensation) happens inside the engine.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Runs the task to completion.
    async fn execute(&self, task: ScheduledTask, node: Node);
}

/// Scheduler queue depths and resource usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Tasks in the ready queue.
    pub ready_queue_size: usize,
    /// Tasks waiting on dependencies.
    pub waiting_tasks_count: usize,
    /// Tasks currently running.
    pub running_tasks_count: usize,
    /// Resource manager snapshot.
    pub resource_usage: ResourceUsage,
}

#[derive(Debug, Default)]
struct Queues {
    ready: BinaryHeap<ScheduledTask>,
    waiting: HashMap<TaskKey, ScheduledTask>,
    running: HashMap<TaskKey, ScheduledTask>,
}

/// The task scheduler.
pub struct TaskScheduler {
    resources: Arc<ResourceManager>,
    rate_limiters: RateLimiterSet,
    queues: Mutex<Queues>,
    executors: RwLock<HashMap<NodeKind, Arc<dyn TaskExecutor>>>,
    loop_state: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    pass_interval: Duration,
}

impl TaskScheduler {
    /// Creates a scheduler over the given resource manager.
    #[must_use]
    pub fn new(resources: Arc<ResourceManager>) -> Self {
        Self {
            resources,
            rate_limiters: RateLimiterSet::new(),
            queues: Mutex::new(Queues::default()),
            executors: RwLock::new(HashMap::new()),
            loop_state: Mutex::new(None),
            pass_interval: Duration::from_millis(50),
        }
    }

    /// Overrides the pause between scheduler passes.
    #[must_use]
    pub fn with_pass_interval(mut self, interval: Duration) -> Self {
        self.pass_interval = interval;
        self
    }

    /// Registers the executor for a node kind.
    pub fn register_executor(&self, kind: NodeKind, executor: Arc<dyn TaskExecutor>) {
        self.executors.write().unwrap().insert(kind, executor);
    }

    /// Installs a rate limiter keyed by node kind name or arbitrary tag.
    pub fn set_rate_limiter(&self, key: impl Into<String>, limiter: crate::rate_limit::RateLimiter) {
        self.rate_limiters.set(key, limiter);
    }

    /// Enqueues a task whose dependencies are already satisfied.
    pub fn schedule_ready(&self, task: ScheduledTask) {
        debug!(execution_id = %task.execution_id, node_id = %task.node_id, "task ready");
        self.queues.lock().unwrap().ready.push(task);
    }

    /// Enqueues a task that still has unmet dependencies.
    pub fn schedule_waiting(&self, task: ScheduledTask) {
        debug!(execution_id = %task.execution_id, node_id = %task.node_id, "task waiting");
        let mut queues = self.queues.lock().unwrap();
        queues.waiting.insert(task.key(), task);
    }

    /// Moves a waiting task to the ready queue, if present.
    ///
    /// The engine calls this after publishing an upstream Success event, so
    /// the Ready push happens-after the event on every path.
    pub fn promote_waiting(&self, execution_id: ExecutionId, node_id: &NodeId) -> bool {
        let mut queues = self.queues.lock().unwrap();
        let key = (execution_id, node_id.clone());
        match queues.waiting.remove(&key) {
            Some(task) => {
                queues.ready.push(task);
                true
            }
            None => false,
        }
    }

    /// Discards every queued task of an execution (cancellation support).
    ///
    /// Running tasks are untouched; they observe cancellation through the
    /// engine's cancellation signal.
    pub fn purge_execution(&self, execution_id: ExecutionId) {
        let mut queues = self.queues.lock().unwrap();
        queues.waiting.retain(|(id, _), _| *id != execution_id);
        let remaining: Vec<ScheduledTask> = queues
            .ready
            .drain()
            .filter(|t| t.execution_id != execution_id)
            .collect();
        queues.ready = remaining.into_iter().collect();
    }

    /// Returns queue depths and resource usage.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let queues = self.queues.lock().unwrap();
        SchedulerStats {
            ready_queue_size: queues.ready.len(),
            waiting_tasks_count: queues.waiting.len(),
            running_tasks_count: queues.running.len(),
            resource_usage: self.resources.usage(),
        }
    }

    /// Returns the resource manager.
    #[must_use]
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Starts the scheduler loop.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` when the loop is active.
    pub fn start(self: &Arc<Self>, ctx: Arc<dyn SchedulerContext>) -> Result<(), SchedulerError> {
        let mut state = self.loop_state.lock().unwrap();
        if state.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!("task scheduler started");
            loop {
                scheduler.process_ready(&ctx).await;
                scheduler.sweep_waiting(&ctx).await;
                tokio::select! {
                    () = loop_token.cancelled() => break,
                    () = tokio::time::sleep(scheduler.pass_interval) => {}
                }
            }
            info!("task scheduler stopped");
        });

        *state = Some((token, handle));
        Ok(())
    }

    /// Stops the scheduler loop.
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` when the loop is not active.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        let mut state = self.loop_state.lock().unwrap();
        match state.take() {
            Some((token, _handle)) => {
                token.cancel();
                Ok(())
            }
            None => Err(SchedulerError::NotRunning),
        }
    }

    /// Drains admissible due tasks from the ready queue.
    async fn process_ready(self: &Arc<Self>, ctx: &Arc<dyn SchedulerContext>) {
        let now = Utc::now();
        // Tasks set aside this pass: not yet due, or execution suspended.
        let mut held = Vec::new();

        loop {
            let task = {
                let mut queues = self.queues.lock().unwrap();
                let Some(top) = queues.ready.peek() else { break };
                if !top.is_due(now) {
                    let not_due = queues.ready.pop().expect("peeked");
                    held.push(not_due);
                    continue;
                }
                queues.ready.pop().expect("peeked")
            };

            match ctx.admission(task.execution_id).await {
                Admission::Drop => {
                    debug!(execution_id = %task.execution_id, node_id = %task.node_id,
                        "dropping task for non-admissible execution");
                    continue;
                }
                Admission::Defer => {
                    held.push(task);
                    continue;
                }
                Admission::Admit => {}
            }

            let Some(node) = ctx.node(task.execution_id, &task.node_id).await else {
                warn!(execution_id = %task.execution_id, node_id = %task.node_id,
                    "unknown node; dropping task");
                continue;
            };

            if self.resources.try_allocate(task.task_id, &node).is_err() {
                // Capacity exhausted: leave the task at the head and end the
                // pass. Queue growth is the back-pressure signal.
                self.queues.lock().unwrap().ready.push(task);
                break;
            }

            let executor = self.executors.read().unwrap().get(&node.kind).cloned();
            let Some(executor) = executor else {
                warn!(kind = %node.kind, "no executor registered; dropping task");
                self.resources.release(task.task_id, &node);
                continue;
            };

            self.queues
                .lock()
                .unwrap()
                .running
                .insert(task.key(), task.clone());
            self.spawn_worker(task, node, executor);
        }

        if !held.is_empty() {
            let mut queues = self.queues.lock().unwrap();
            for task in held {
                queues.ready.push(task);
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, task: ScheduledTask, node: Node, executor: Arc<dyn TaskExecutor>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.rate_limiters.acquire(node.kind.as_str()).await;
            executor.execute(task.clone(), node.clone()).await;
            scheduler.resources.release(task.task_id, &node);
            scheduler.queues.lock().unwrap().running.remove(&task.key());
        });
    }

    /// Promotes waiting tasks whose dependencies are now satisfied.
    async fn sweep_waiting(&self, ctx: &Arc<dyn SchedulerContext>) {
        let keys: Vec<TaskKey> = {
            let queues = self.queues.lock().unwrap();
            queues.waiting.keys().cloned().collect()
        };

        for (execution_id, node_id) in keys {
            match ctx.admission(execution_id).await {
                Admission::Drop => {
                    let mut queues = self.queues.lock().unwrap();
                    queues.waiting.remove(&(execution_id, node_id));
                }
                Admission::Defer => {}
                Admission::Admit => {
                    if ctx.dependencies_satisfied(execution_id, &node_id).await {
                        self.promote_waiting(execution_id, &node_id);
                    }
                }
            }
        }
    }
}
