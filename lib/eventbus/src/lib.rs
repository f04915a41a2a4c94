//! Event sink contract and in-process event bus.
//!
//! The core publishes lifecycle events through the one-way [`EventSink`]
//! contract. Publishing must never await subscriber completion: the
//! in-process bus enqueues into an internal buffer and a dispatcher task
//! notifies subscribers best-effort on its own scheduling domain.

pub mod bus;
pub mod event;
pub mod sink;
pub mod topic;

pub use bus::InMemoryEventBus;
pub use event::{Event, ExecutionEvent, ExecutionEventKind};
pub use sink::{EventError, EventSink, RecordingSink};
