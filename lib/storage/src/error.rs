//! Error types for repository operations.

use cascade_core::ExecutionId;
use std::fmt;

/// Errors from repository operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Workflow not found.
    WorkflowNotFound { workflow_id: String },
    /// Execution not found.
    ExecutionNotFound { execution_id: ExecutionId },
    /// A definition is already registered under this `(id, version)`.
    AlreadyExists { workflow_id: String, version: String },
    /// Backend failure.
    Backend { message: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::ExecutionNotFound { execution_id } => {
                write!(f, "execution not found: {execution_id}")
            }
            Self::AlreadyExists {
                workflow_id,
                version,
            } => {
                write!(f, "workflow {workflow_id} v{version} already registered")
            }
            Self::Backend { message } => write!(f, "storage backend error: {message}"),
        }
    }
}

impl std::error::Error for StorageError {}
