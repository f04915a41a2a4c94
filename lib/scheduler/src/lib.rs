//! Task scheduling for the cascade engine.
//!
//! This crate provides:
//!
//! - **Resource Manager**: admission control over concurrent tasks by total,
//!   by node kind, and by agent id
//! - **Rate Limiter**: token buckets keyed by node kind or arbitrary tag
//! - **Task Scheduler**: a priority-ordered ready queue, a waiting map keyed
//!   by unmet dependencies, a running registry, and pluggable per-kind
//!   executors
//!
//! The scheduler consults a [`SchedulerContext`] (implemented by the engine)
//! for node lookup, dependency checks, and per-execution admission gating.

pub mod error;
pub mod rate_limit;
pub mod resource;
pub mod scheduler;
pub mod task;

pub use error::SchedulerError;
pub use rate_limit::{RateLimiter, RateLimiterSet};
pub use resource::{ResourceManager, ResourceQuota, ResourceUsage};
pub use scheduler::{Admission, SchedulerContext, SchedulerStats, TaskExecutor, TaskScheduler};
pub use task::{ScheduledTask, TaskKey};
