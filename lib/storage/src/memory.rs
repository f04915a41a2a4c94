//! In-memory repository implementations.

use crate::error::StorageError;
use crate::repository::{ExecutionRepository, WorkflowRepository};
use async_trait::async_trait;
use cascade_core::ExecutionId;
use cascade_workflow::{Execution, ExecutionStatus, Workflow};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory workflow store keyed by `(id, version)`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryWorkflowRepository {
    workflows: Arc<RwLock<HashMap<(String, String), Workflow>>>,
}

impl InMemoryWorkflowRepository {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save(&self, workflow: Workflow) -> Result<(), StorageError> {
        let key = (workflow.id.clone(), workflow.version.clone());
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&key) {
            return Err(StorageError::AlreadyExists {
                workflow_id: key.0,
                version: key.1,
            });
        }
        workflows.insert(key, workflow);
        Ok(())
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<Workflow>, StorageError> {
        let workflows = self.workflows.read().await;
        Ok(workflows
            .values()
            .filter(|w| w.id == workflow_id)
            .max_by(|a, b| a.version.cmp(&b.version))
            .cloned())
    }

    async fn get_by_name(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<Workflow>, StorageError> {
        let workflows = self.workflows.read().await;
        Ok(workflows
            .values()
            .filter(|w| w.name == name)
            .filter(|w| version.is_none_or(|v| w.version == v))
            .max_by(|a, b| a.version.cmp(&b.version))
            .cloned())
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<Workflow>, StorageError> {
        let workflows = self.workflows.read().await;
        let mut all: Vec<Workflow> = workflows.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.version.cmp(&b.version)));
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn update(&self, workflow: Workflow) -> Result<(), StorageError> {
        let key = (workflow.id.clone(), workflow.version.clone());
        let mut workflows = self.workflows.write().await;
        if !workflows.contains_key(&key) {
            return Err(StorageError::WorkflowNotFound {
                workflow_id: key.0,
            });
        }
        workflows.insert(key, workflow);
        Ok(())
    }

    async fn delete(&self, workflow_id: &str) -> Result<bool, StorageError> {
        let mut workflows = self.workflows.write().await;
        let before = workflows.len();
        workflows.retain(|(id, _), _| id != workflow_id);
        Ok(workflows.len() < before)
    }
}

/// In-memory execution store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryExecutionRepository {
    executions: Arc<RwLock<HashMap<ExecutionId, Execution>>>,
}

impl InMemoryExecutionRepository {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn save(&self, execution: Execution) -> Result<(), StorageError> {
        self.executions
            .write()
            .await
            .insert(execution.id, execution);
        Ok(())
    }

    async fn get(&self, execution_id: ExecutionId) -> Result<Option<Execution>, StorageError> {
        Ok(self.executions.read().await.get(&execution_id).cloned())
    }

    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Execution>, StorageError> {
        let executions = self.executions.read().await;
        let mut matching: Vec<Execution> = executions
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.created_at);
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Execution>, StorageError> {
        let executions = self.executions.read().await;
        let mut matching: Vec<Execution> = executions
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.created_at);
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn update(&self, execution: Execution) -> Result<(), StorageError> {
        let mut executions = self.executions.write().await;
        if !executions.contains_key(&execution.id) {
            return Err(StorageError::ExecutionNotFound {
                execution_id: execution.id,
            });
        }
        executions.insert(execution.id, execution);
        Ok(())
    }

    async fn delete(&self, execution_id: ExecutionId) -> Result<bool, StorageError> {
        Ok(self.executions.write().await.remove(&execution_id).is_some())
    }

    async fn cleanup_older_than(&self, days: i64) -> Result<usize, StorageError> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|_, e| !(e.is_terminal() && e.created_at < cutoff));
        let removed = before - executions.len();
        if removed > 0 {
            debug!(removed, days, "cleaned up old executions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map as JsonMap;

    #[tokio::test]
    async fn workflow_versions_are_immutable_registrations() {
        let repo = InMemoryWorkflowRepository::new();
        let workflow = Workflow::new("wf");
        repo.save(workflow.clone()).await.unwrap();

        // Same (id, version) cannot be re-registered.
        let err = repo.save(workflow.clone()).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));

        // A new version is a new registration.
        let v2 = workflow.clone().with_version("2.0.0");
        repo.save(v2).await.unwrap();
        let latest = repo.get("wf").await.unwrap().unwrap();
        assert_eq!(latest.version, "2.0.0");
    }

    #[tokio::test]
    async fn get_by_name_honors_version_pin() {
        let repo = InMemoryWorkflowRepository::new();
        repo.save(Workflow::new("wf").with_name("pipeline"))
            .await
            .unwrap();
        repo.save(Workflow::new("wf").with_name("pipeline").with_version("2.0.0"))
            .await
            .unwrap();

        let pinned = repo
            .get_by_name("pipeline", Some("1.0.0"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pinned.version, "1.0.0");
        assert!(repo.get_by_name("missing", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn execution_listing_by_status() {
        let repo = InMemoryExecutionRepository::new();
        let mut running = Execution::new("wf", "1.0.0", JsonMap::new());
        running.start();
        let mut done = Execution::new("wf", "1.0.0", JsonMap::new());
        done.start();
        done.complete();
        repo.save(running).await.unwrap();
        repo.save(done).await.unwrap();

        let completed = repo
            .list_by_status(ExecutionStatus::Completed, 0, 10)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        let by_workflow = repo.list_by_workflow("wf", 0, 10).await.unwrap();
        assert_eq!(by_workflow.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_executions() {
        let repo = InMemoryExecutionRepository::new();

        let mut old_done = Execution::new("wf", "1.0.0", JsonMap::new());
        old_done.complete();
        old_done.created_at = Utc::now() - Duration::days(40);

        let mut old_running = Execution::new("wf", "1.0.0", JsonMap::new());
        old_running.start();
        old_running.created_at = Utc::now() - Duration::days(40);

        let mut fresh_done = Execution::new("wf", "1.0.0", JsonMap::new());
        fresh_done.complete();

        let old_running_id = old_running.id;
        repo.save(old_done).await.unwrap();
        repo.save(old_running).await.unwrap();
        repo.save(fresh_done).await.unwrap();

        let removed = repo.cleanup_older_than(30).await.unwrap();
        assert_eq!(removed, 1);
        // The old-but-running execution survives.
        assert!(repo.get(old_running_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_requires_existing_record() {
        let repo = InMemoryExecutionRepository::new();
        let execution = Execution::new("wf", "1.0.0", JsonMap::new());
        let err = repo.update(execution.clone()).await.unwrap_err();
        assert!(matches!(err, StorageError::ExecutionNotFound { .. }));

        repo.save(execution.clone()).await.unwrap();
        assert!(repo.update(execution).await.is_ok());
    }
}
