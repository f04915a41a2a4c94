//! Agent and tool invocation contracts.
//!
//! The engine never talks to execution backends directly; it invokes them by
//! id through [`AgentRuntime`] and [`ToolRegistry`]. This crate defines those
//! contracts plus in-memory implementations used by tests and local runs:
//! the echo runtime, a scripted runtime with per-agent handlers, and a
//! static tool registry with parameter validation.

pub mod agent;
pub mod error;
pub mod tool;
pub mod validate;

pub use agent::{AgentRuntime, EchoAgentRuntime, ScriptedAgentRuntime};
pub use error::{ParameterError, RuntimeError};
pub use tool::{StaticToolRegistry, ToolRegistry};
pub use validate::{ParameterSpec, validate_parameters};
