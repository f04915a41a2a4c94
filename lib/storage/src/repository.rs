//! Repository contracts consumed by the engine.

use crate::error::StorageError;
use async_trait::async_trait;
use cascade_core::ExecutionId;
use cascade_workflow::{Execution, ExecutionStatus, Workflow};

/// Stores workflow definitions.
///
/// A definition is immutable once registered under a given `(id, version)`;
/// new versions are new registrations.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Persists a definition.
    async fn save(&self, workflow: Workflow) -> Result<(), StorageError>;

    /// Loads the latest version of a definition.
    async fn get(&self, workflow_id: &str) -> Result<Option<Workflow>, StorageError>;

    /// Loads a definition by name, optionally pinned to a version.
    async fn get_by_name(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<Workflow>, StorageError>;

    /// Lists definitions with offset/limit paging.
    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<Workflow>, StorageError>;

    /// Updates an existing definition in place (same id and version).
    async fn update(&self, workflow: Workflow) -> Result<(), StorageError>;

    /// Deletes a definition and all of its versions.
    async fn delete(&self, workflow_id: &str) -> Result<bool, StorageError>;
}

/// Stores execution records.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Persists an execution record.
    async fn save(&self, execution: Execution) -> Result<(), StorageError>;

    /// Loads an execution record.
    async fn get(&self, execution_id: ExecutionId) -> Result<Option<Execution>, StorageError>;

    /// Lists executions of one workflow.
    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Execution>, StorageError>;

    /// Lists executions in a given status.
    async fn list_by_status(
        &self,
        status: ExecutionStatus,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Execution>, StorageError>;

    /// Updates an existing execution record.
    async fn update(&self, execution: Execution) -> Result<(), StorageError>;

    /// Deletes an execution record.
    async fn delete(&self, execution_id: ExecutionId) -> Result<bool, StorageError>;

    /// Removes executions older than `days` that are in a terminal status.
    ///
    /// Non-terminal executions are never removed. Returns how many records
    /// were deleted.
    async fn cleanup_older_than(&self, days: i64) -> Result<usize, StorageError>;
}
