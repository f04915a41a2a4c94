//! The cascade execution engine.
//!
//! This crate ties the workspace together:
//!
//! - **Coordinator**: per-execution node-state tracking, input preparation
//!   via reference resolution, timeout enforcement, downstream triggering
//! - **Executors**: agent, tool, control (switch/parallel/loop/condition),
//!   aggregation, and sub-workflow dispatch
//! - **Error handling**: retry with backoff, skip, fail, fallback,
//!   compensation, escalation, and a circuit breaker for external calls
//! - **Compensation**: Saga-style unwind of successful nodes
//! - **Facade**: `WorkflowEngine` with create/start/cancel/suspend/resume
//!   and the execution status view

pub mod compensation;
pub mod engine;
pub mod error;
pub mod error_handler;
pub mod executor;


pub use compensation::{
    CompensationHandler, CompensationManager, CompensationPlan, CompensationRecord,
    CompensationStatus, CompensationStrategy, RecordStatus,
};
pub use engine::WorkflowEngine;
pub use error::{EngineError, ErrorKind, NodeError};
pub use error_handler::{
    BreakerError, CircuitBreaker, CircuitState, ErrorHandler, ErrorStrategy, backoff_delay,
};
pub use executor::{
    AgentNodeExecutor, AggregationNodeExecutor, ControlNodeExecutor, NodeExecutor,
    SubWorkflowExecutor, ToolNodeExecutor,
};
