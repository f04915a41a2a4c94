//! Error-handling policy: strategy selection, backoff, and the circuit
//! breaker for external-dependency calls.

use crate::error::{ErrorKind, NodeError};
use cascade_workflow::{BackoffStrategy, ErrorHandlerSpec, Node, RetryPolicy, Workflow};
use rand::Rng;
use regex::Regex;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// What to do about a failed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorStrategy {
    /// Re-enqueue the task with a backoff delay.
    Retry,
    /// Mark the node Skipped and let downstream proceed.
    Skip,
    /// Fail the node and the execution.
    Fail,
    /// Reroute to a named fallback node.
    Fallback { target: String },
    /// Unwind successful nodes through the compensation manager.
    Compensate,
    /// Emit an out-of-band event, then fail.
    Escalate,
}

/// Selects error strategies, in order:
///
/// 1. the node's retry policy, while attempts remain and the error kind is
///    retryable;
/// 2. the first matching workflow-level handler (declaration order);
/// 3. by error class (`Timeout` fails, `RetryExhausted` compensates);
/// 4. fail.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorHandler;

impl ErrorHandler {
    /// Creates a handler.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Determines the strategy for a node failure.
    #[must_use]
    pub fn determine_strategy(
        &self,
        workflow: &Workflow,
        node: &Node,
        error: &NodeError,
        retry_count: u32,
    ) -> ErrorStrategy {
        if let Some(policy) = &node.retry_policy
            && retry_count < policy.max_retries
            && is_retryable(error, policy)
        {
            return ErrorStrategy::Retry;
        }

        for handler in &workflow.error_handlers {
            if handler_matches(handler, node, error) {
                return strategy_from_action(handler);
            }
        }

        match error.kind {
            ErrorKind::Timeout => ErrorStrategy::Fail,
            ErrorKind::RetryExhausted => ErrorStrategy::Compensate,
            _ => ErrorStrategy::Fail,
        }
    }
}

/// Returns true when the policy allows retrying this error kind.
fn is_retryable(error: &NodeError, policy: &RetryPolicy) -> bool {
    let kind = error.kind.as_str();
    if policy.exclude.iter().any(|k| k == kind) {
        return false;
    }
    // Cancellation is never retried.
    if error.kind == ErrorKind::Cancelled {
        return false;
    }
    if policy.retry_on.is_empty() {
        return true;
    }
    policy.retry_on.iter().any(|k| k == kind)
}

/// Returns true when a workflow-level handler matches this failure.
fn handler_matches(handler: &ErrorHandlerSpec, node: &Node, error: &NodeError) -> bool {
    if let Some(pattern) = &handler.node_pattern {
        match Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(node.id.as_str()) {
                    return false;
                }
            }
            Err(e) => {
                warn!(pattern, error = %e, "invalid node_pattern in error handler");
                return false;
            }
        }
    }

    match handler.error_type.as_deref() {
        None => true,
        Some("execution_error") => error.kind == ErrorKind::NodeExecution,
        Some(name) => name == error.kind.as_str(),
    }
}

fn strategy_from_action(handler: &ErrorHandlerSpec) -> ErrorStrategy {
    match handler.action.kind.as_str() {
        "retry" => ErrorStrategy::Retry,
        "skip" => ErrorStrategy::Skip,
        "compensate" => ErrorStrategy::Compensate,
        "escalate" => ErrorStrategy::Escalate,
        "fallback" => match &handler.action.target {
            Some(target) => ErrorStrategy::Fallback {
                target: target.clone(),
            },
            // A fallback without a target downgrades to fail.
            None => ErrorStrategy::Fail,
        },
        "fail" => ErrorStrategy::Fail,
        other => {
            warn!(strategy = other, "unknown error handler action; failing");
            ErrorStrategy::Fail
        }
    }
}

/// Computes the retry delay for the given attempt.
///
/// `fixed` returns the base delay, `linear` scales with `retry + 1`, and
/// `exponential` scales with `backoff_factor^retry`; all are clamped to
/// `max_delay`. Jitter adds a uniform random component of up to 10%.
#[must_use]
pub fn backoff_delay(policy: &RetryPolicy, retry_count: u32) -> Duration {
    let base = policy.retry_delay.max(0.0);
    let raw = match policy.strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear => base * f64::from(retry_count + 1),
        BackoffStrategy::Exponential => base * policy.backoff_factor.powi(retry_count as i32),
    };
    let mut delay = raw.min(policy.max_delay.max(0.0));

    if policy.jitter && delay > 0.0 {
        delay += rand::thread_rng().gen_range(0.0..delay * 0.1);
    }

    Duration::from_secs_f64(delay)
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// One probe call decides: success closes, failure re-opens.
    HalfOpen,
}

/// Error returned by a circuit-breaker-wrapped call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// The breaker is open; the call was not attempted.
    Open,
    /// The call was attempted and failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "circuit breaker is open"),
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for BreakerError<E> {}

#[derive(Debug)]
struct BreakerCounters {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// A circuit breaker for external-dependency calls.
///
/// After `failure_threshold` consecutive failures the breaker opens and
/// rejects calls until `recovery_timeout` elapses; the next call probes in
/// half-open state, where a single success closes the breaker and a single
/// failure re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    counters: Mutex<BreakerCounters>,
}

impl CircuitBreaker {
    /// Creates a breaker.
    #[must_use]
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            counters: Mutex::new(BreakerCounters {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Returns the current state, applying recovery-timeout transitions.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut counters = self.counters.lock().unwrap();
        self.apply_recovery(&mut counters);
        counters.state
    }

    /// Runs a call through the breaker.
    ///
    /// # Errors
    ///
    /// Returns `BreakerError::Open` without attempting the call while open,
    /// or `BreakerError::Inner` with the call's own error.
    pub async fn call<T, E, Fut>(&self, fut: Fut) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let mut counters = self.counters.lock().unwrap();
            self.apply_recovery(&mut counters);
            if counters.state == CircuitState::Open {
                return Err(BreakerError::Open);
            }
        }

        match fut.await {
            Ok(value) => {
                let mut counters = self.counters.lock().unwrap();
                counters.consecutive_failures = 0;
                counters.state = CircuitState::Closed;
                Ok(value)
            }
            Err(e) => {
                let mut counters = self.counters.lock().unwrap();
                counters.consecutive_failures += 1;
                counters.last_failure = Some(Instant::now());
                if counters.state == CircuitState::HalfOpen
                    || counters.consecutive_failures >= self.failure_threshold
                {
                    if counters.state != CircuitState::Open {
                        warn!(
                            failures = counters.consecutive_failures,
                            "circuit breaker opened"
                        );
                    }
                    counters.state = CircuitState::Open;
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn apply_recovery(&self, counters: &mut BreakerCounters) {
        if counters.state == CircuitState::Open
            && let Some(last) = counters.last_failure
            && last.elapsed() >= self.recovery_timeout
        {
            counters.state = CircuitState::HalfOpen;
        }
    }
}
