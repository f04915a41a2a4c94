//! Workflow model, parsing, and validation for the cascade engine.
//!
//! This crate provides:
//!
//! - **Model**: `Workflow`, `Node`, `Edge`, `State` definition types and the
//!   `Execution` / `NodeExecution` / `ExecutionContext` runtime records
//! - **Graph**: dependency graph over petgraph with cycle detection and
//!   Kahn layering for parallel groups
//! - **Expressions**: `${path}` reference resolution and small boolean
//!   predicates (no general expression language)
//! - **Parser**: YAML/JSON documents to validated workflows

pub mod context;
pub mod definition;
pub mod edge;
pub mod error;
pub mod execution;
pub mod expression;
pub mod graph;
pub mod node;
pub mod parser;
pub mod state;

pub use context::{ExecutionContext, OutputMap};
pub use definition::{ErrorHandlerSpec, HandlerAction, Workflow, WorkflowKind};
pub use edge::Edge;
pub use error::{ParseError, ValidationError};
pub use execution::{
    ErrorInfo, Execution, ExecutionStatus, ExecutionStatusView, NodeExecution,
    NodeExecutionStatus, NodeStatusView,
};
pub use graph::DependencyGraph;
pub use node::{
    BackoffStrategy, CompensationSpec, ControlSubtype, Node, NodeId, NodeKind, RetryPolicy,
};
pub use parser::WorkflowParser;
pub use state::{ActionSpec, State, StateKind, Transition};
