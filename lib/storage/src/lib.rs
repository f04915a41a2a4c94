//! Repository contracts and in-memory stores.
//!
//! The core persists workflow definitions and execution records through
//! these contracts; durable backends are external collaborators. The
//! in-memory implementations back tests and single-process deployments.

pub mod error;
pub mod memory;
pub mod repository;

pub use error::StorageError;
pub use memory::{InMemoryExecutionRepository, InMemoryWorkflowRepository};
pub use repository::{ExecutionRepository, WorkflowRepository};
