//! Topic names used by the core.

/// A workflow definition was registered.
pub const WORKFLOW_CREATED: &str = "workflow.created";

/// Execution lifecycle events (started, completed, failed, ...).
pub const EXECUTION_EVENTS: &str = "workflow.execution.events";

/// Node lifecycle events (started, completed, failed, retrying, skipped).
pub const NODE_EVENTS: &str = "workflow.node.events";

/// Out-of-band escalation events from the error handler.
pub const ERROR_ESCALATED: &str = "workflow.error.escalated";

/// A state machine instance changed state.
pub const STATE_CHANGED: &str = "statemachine.state_changed";

/// A state machine instance reached a final state.
pub const STATEMACHINE_COMPLETED: &str = "statemachine.completed";
