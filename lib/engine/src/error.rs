//! Engine error taxonomy.
//!
//! `ErrorKind` is the classification the error handler, retry policies, and
//! workflow-level handlers match on; `NodeError` is what node execution
//! produces; `EngineError` is what the engine facade returns to callers.

use cascade_core::ExecutionId;
use cascade_runtime::RuntimeError;
use cascade_scheduler::SchedulerError;
use cascade_storage::StorageError;
use cascade_workflow::{ErrorInfo, ExecutionStatus, NodeId, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of execution errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Document could not be parsed.
    Parse,
    /// Workflow failed validation.
    Validation,
    /// A node's executor failed.
    NodeExecution,
    /// A node exceeded its timeout.
    Timeout,
    /// The execution was cancelled.
    Cancelled,
    /// Admission was refused by the resource manager.
    ResourceExhausted,
    /// The scheduler could not dispatch the task.
    Scheduling,
    /// A state machine transition was invalid.
    StateTransition,
    /// A dependency failed or is missing.
    Dependency,
    /// A retry policy ran out of attempts.
    RetryExhausted,
    /// A concurrency limit was hit.
    ConcurrencyLimit,
}

impl ErrorKind {
    /// Returns the canonical name used in documents and `ErrorInfo`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Validation => "validation",
            Self::NodeExecution => "node_execution",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Scheduling => "scheduling",
            Self::StateTransition => "state_transition",
            Self::Dependency => "dependency",
            Self::RetryExhausted => "retry_exhausted",
            Self::ConcurrencyLimit => "concurrency_limit",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised while executing one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl NodeError {
    /// Creates a node error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A plain execution failure.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NodeExecution, message)
    }

    /// A timeout after `secs` seconds.
    #[must_use]
    pub fn timeout(node_id: &NodeId, secs: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("node {node_id} timed out after {secs}s"),
        )
    }

    /// A cancellation observed inside the node worker.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "execution cancelled")
    }

    /// Wraps this error as retry exhaustion after `retries` attempts.
    #[must_use]
    pub fn into_retry_exhausted(self, retries: u32) -> Self {
        Self::new(
            ErrorKind::RetryExhausted,
            format!("retry exhausted after {retries} attempts: {}", self.message),
        )
    }

    /// Converts to the `ErrorInfo` recorded on the node execution.
    #[must_use]
    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.kind.as_str(), self.message.clone())
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for NodeError {}

impl From<RuntimeError> for NodeError {
    fn from(e: RuntimeError) -> Self {
        Self::execution(e.to_string())
    }
}

/// Errors returned by the engine facade.
#[derive(Debug)]
pub enum EngineError {
    /// Workflow not found.
    WorkflowNotFound { workflow_id: String },
    /// Execution not found.
    ExecutionNotFound { execution_id: ExecutionId },
    /// The workflow kind cannot be driven by the DAG coordinator.
    UnsupportedKind { workflow_id: String, kind: String },
    /// The operation is invalid in the execution's current status.
    InvalidStatus {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        operation: &'static str,
    },
    /// Parsing or validation failed.
    Parse(ParseError),
    /// A repository operation failed.
    Storage(StorageError),
    /// A scheduler operation failed.
    Scheduler(SchedulerError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::ExecutionNotFound { execution_id } => {
                write!(f, "execution not found: {execution_id}")
            }
            Self::UnsupportedKind { workflow_id, kind } => {
                write!(f, "workflow {workflow_id} has kind '{kind}', which the DAG coordinator cannot run")
            }
            Self::InvalidStatus {
                execution_id,
                status,
                operation,
            } => {
                write!(
                    f,
                    "cannot {operation} execution {execution_id} in status {status:?}"
                )
            }
            Self::Parse(e) => write!(f, "{e}"),
            Self::Storage(e) => write!(f, "{e}"),
            Self::Scheduler(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ParseError> for EngineError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<SchedulerError> for EngineError {
    fn from(e: SchedulerError) -> Self {
        Self::Scheduler(e)
    }
}
