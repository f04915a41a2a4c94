//! Scheduled task records and priority ordering.

use cascade_core::{ExecutionId, TaskId};
use cascade_workflow::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::cmp::Ordering;

/// Key identifying a task within the scheduler's maps.
pub type TaskKey = (ExecutionId, NodeId);

/// One schedulable unit: a node of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Unique id for this scheduling attempt (resource accounting key).
    pub task_id: TaskId,
    /// The execution the node belongs to.
    pub execution_id: ExecutionId,
    /// The node to run.
    pub node_id: NodeId,
    /// Scheduling priority; higher runs first.
    pub priority: i64,
    /// Earliest time the task may run. Retry re-insertions move this to
    /// `now + backoff` while keeping the original priority.
    pub scheduled_time: DateTime<Utc>,
    /// Retries performed so far.
    pub retry_count: u32,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: JsonMap<String, JsonValue>,
}

impl ScheduledTask {
    /// Creates a task runnable immediately.
    #[must_use]
    pub fn new(execution_id: ExecutionId, node_id: NodeId, priority: i64) -> Self {
        Self {
            task_id: TaskId::new(),
            execution_id,
            node_id,
            priority,
            scheduled_time: Utc::now(),
            retry_count: 0,
            metadata: JsonMap::new(),
        }
    }

    /// Returns the scheduler map key.
    #[must_use]
    pub fn key(&self) -> TaskKey {
        (self.execution_id, self.node_id.clone())
    }

    /// Returns true once the scheduled time has passed.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time <= now
    }

    /// Re-stamps the task for a retry: fresh task id, bumped retry count,
    /// and a scheduled time no earlier than `now + delay`.
    #[must_use]
    pub fn for_retry(mut self, delay: chrono::Duration) -> Self {
        self.task_id = TaskId::new();
        self.retry_count += 1;
        self.scheduled_time = Utc::now() + delay;
        self
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id
    }
}

impl Eq for ScheduledTask {}

/// Max-heap ordering: higher priority first, then earlier scheduled time
/// (FIFO for equal priorities), then task id for determinism.
impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.scheduled_time.cmp(&self.scheduled_time))
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn higher_priority_pops_first() {
        let execution_id = ExecutionId::new();
        let mut heap = BinaryHeap::new();
        heap.push(ScheduledTask::new(execution_id, NodeId::new("low"), 0));
        heap.push(ScheduledTask::new(execution_id, NodeId::new("high"), 10));
        heap.push(ScheduledTask::new(execution_id, NodeId::new("mid"), 5));

        assert_eq!(heap.pop().unwrap().node_id.as_str(), "high");
        assert_eq!(heap.pop().unwrap().node_id.as_str(), "mid");
        assert_eq!(heap.pop().unwrap().node_id.as_str(), "low");
    }

    #[test]
    fn equal_priority_is_fifo_by_scheduled_time() {
        let execution_id = ExecutionId::new();
        let mut first = ScheduledTask::new(execution_id, NodeId::new("first"), 1);
        let mut second = ScheduledTask::new(execution_id, NodeId::new("second"), 1);
        first.scheduled_time = Utc::now() - chrono::Duration::seconds(2);
        second.scheduled_time = Utc::now() - chrono::Duration::seconds(1);

        let mut heap = BinaryHeap::new();
        heap.push(second);
        heap.push(first);
        assert_eq!(heap.pop().unwrap().node_id.as_str(), "first");
    }

    #[test]
    fn retry_restamps_time_and_counter() {
        let task = ScheduledTask::new(ExecutionId::new(), NodeId::new("n"), 3);
        let original_id = task.task_id;
        let before = Utc::now();
        let retried = task.for_retry(chrono::Duration::milliseconds(500));

        assert_eq!(retried.priority, 3);
        assert_eq!(retried.retry_count, 1);
        assert_ne!(retried.task_id, original_id);
        assert!(retried.scheduled_time >= before + chrono::Duration::milliseconds(500));
        assert!(!retried.is_due(Utc::now()));
    }
}
