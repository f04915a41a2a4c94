//! Admission control over concurrent tasks.
//!
//! The manager tracks active task ids in total, per node kind, and per agent
//! id. Check and allocation happen under a single mutual-exclusion region so
//! admission is atomic; callers must `release` on every exit path.

use crate::error::SchedulerError;
use cascade_core::TaskId;
use cascade_workflow::{Node, NodeKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

/// Concurrency quotas enforced by the resource manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceQuota {
    /// Global cap on concurrently running tasks.
    pub max_concurrent_tasks: usize,
    /// Per-node-kind caps; kinds not listed are uncapped.
    pub max_per_kind: HashMap<NodeKind, usize>,
    /// Per-agent-id caps; agents not listed are uncapped.
    pub max_per_agent: HashMap<String, usize>,
}

impl ResourceQuota {
    /// A quota with only the global cap set.
    #[must_use]
    pub fn with_max_concurrent(max_concurrent_tasks: usize) -> Self {
        Self {
            max_concurrent_tasks,
            ..Self::default()
        }
    }

    /// Caps one node kind.
    #[must_use]
    pub fn cap_kind(mut self, kind: NodeKind, max: usize) -> Self {
        self.max_per_kind.insert(kind, max);
        self
    }

    /// Caps one agent id.
    #[must_use]
    pub fn cap_agent(mut self, agent_id: impl Into<String>, max: usize) -> Self {
        self.max_per_agent.insert(agent_id.into(), max);
        self
    }
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 100,
            max_per_kind: HashMap::new(),
            max_per_agent: HashMap::new(),
        }
    }
}

/// A snapshot of current resource usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Number of active tasks.
    pub total_active_tasks: usize,
    /// The global cap.
    pub max_concurrent_tasks: usize,
    /// Active counts per node kind.
    pub active_by_kind: BTreeMap<String, usize>,
    /// Active counts per agent id.
    pub active_by_agent: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct ActiveSets {
    active: HashSet<TaskId>,
    by_kind: HashMap<NodeKind, HashSet<TaskId>>,
    by_agent: HashMap<String, HashSet<TaskId>>,
}

impl ActiveSets {
    fn blocked_reason(&self, quota: &ResourceQuota, node: &Node) -> Option<String> {
        if self.active.len() >= quota.max_concurrent_tasks {
            return Some("global concurrency limit reached".to_string());
        }

        if let Some(&cap) = quota.max_per_kind.get(&node.kind)
            && self.by_kind.get(&node.kind).map_or(0, HashSet::len) >= cap
        {
            return Some(format!("concurrency limit for kind '{}' reached", node.kind));
        }

        if node.kind == NodeKind::Agent
            && let Some(agent_id) = node.agent_id()
            && let Some(&cap) = quota.max_per_agent.get(agent_id)
            && self.by_agent.get(agent_id).map_or(0, HashSet::len) >= cap
        {
            return Some(format!("concurrency limit for agent '{agent_id}' reached"));
        }

        None
    }
}

/// Tracks active tasks and enforces concurrency quotas.
#[derive(Debug)]
pub struct ResourceManager {
    quota: ResourceQuota,
    sets: Mutex<ActiveSets>,
}

impl ResourceManager {
    /// Creates a manager with the given quota.
    #[must_use]
    pub fn new(quota: ResourceQuota) -> Self {
        Self {
            quota,
            sets: Mutex::new(ActiveSets::default()),
        }
    }

    /// Returns true if the node could currently be admitted.
    #[must_use]
    pub fn can_allocate(&self, node: &Node) -> bool {
        let sets = self.sets.lock().unwrap();
        sets.blocked_reason(&self.quota, node).is_none()
    }

    /// Atomically re-checks capacity and allocates.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` when any applicable quota is at capacity.
    pub fn try_allocate(&self, task_id: TaskId, node: &Node) -> Result<(), SchedulerError> {
        let mut sets = self.sets.lock().unwrap();
        if let Some(reason) = sets.blocked_reason(&self.quota, node) {
            return Err(SchedulerError::ResourceExhausted { task_id, reason });
        }

        sets.active.insert(task_id);
        sets.by_kind.entry(node.kind).or_default().insert(task_id);
        if node.kind == NodeKind::Agent
            && let Some(agent_id) = node.agent_id()
        {
            sets.by_agent
                .entry(agent_id.to_string())
                .or_default()
                .insert(task_id);
        }
        Ok(())
    }

    /// Releases a previously allocated task.
    pub fn release(&self, task_id: TaskId, node: &Node) {
        let mut sets = self.sets.lock().unwrap();
        sets.active.remove(&task_id);
        if let Some(kind_set) = sets.by_kind.get_mut(&node.kind) {
            kind_set.remove(&task_id);
        }
        if let Some(agent_id) = node.agent_id()
            && let Some(agent_set) = sets.by_agent.get_mut(agent_id)
        {
            agent_set.remove(&task_id);
        }
    }

    /// Returns a usage snapshot.
    #[must_use]
    pub fn usage(&self) -> ResourceUsage {
        let sets = self.sets.lock().unwrap();
        ResourceUsage {
            total_active_tasks: sets.active.len(),
            max_concurrent_tasks: self.quota.max_concurrent_tasks,
            active_by_kind: sets
                .by_kind
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.len()))
                .collect(),
            active_by_agent: sets
                .by_agent
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
        }
    }

    /// Returns the configured quota.
    #[must_use]
    pub fn quota(&self) -> &ResourceQuota {
        &self.quota
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(ResourceQuota::default())
    }
}
