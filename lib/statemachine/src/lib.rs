//! Event-driven state machine runtime.
//!
//! An alternate execution driver to the DAG coordinator: instances hold a
//! current state and variables; external events walk the current state's
//! transitions in declaration order, run exit/transition/enter actions
//! through a pluggable registry, and advance the state. Reaching a final
//! state emits a completion event.

pub mod action;
pub mod error;
pub mod instance;
pub mod runtime;

pub use action::{ActionHandler, ActionRegistry};
pub use error::StateMachineError;
pub use instance::{HistoryRecord, InstanceStatus, StateMachineInstance};
pub use runtime::StateMachineRuntime;
