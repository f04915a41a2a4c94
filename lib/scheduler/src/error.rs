//! Error types for the scheduler crate.

use cascade_core::TaskId;
use cascade_workflow::NodeKind;
use std::fmt;

/// Errors from scheduling operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Admission failed: a concurrency quota is exhausted.
    ResourceExhausted { task_id: TaskId, reason: String },
    /// No executor is registered for the node kind.
    ExecutorMissing { kind: NodeKind },
    /// The scheduler loop is already running.
    AlreadyRunning,
    /// The scheduler loop is not running.
    NotRunning,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted { task_id, reason } => {
                write!(f, "cannot allocate resources for task {task_id}: {reason}")
            }
            Self::ExecutorMissing { kind } => {
                write!(f, "no executor registered for node kind: {kind}")
            }
            Self::AlreadyRunning => write!(f, "scheduler already running"),
            Self::NotRunning => write!(f, "scheduler not running"),
        }
    }
}

impl std::error::Error for SchedulerError {}
