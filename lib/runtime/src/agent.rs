//! Agent invocation contract and in-memory runtimes.

use crate::error::RuntimeError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Invokes agents by id.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Invokes the agent with the resolved input bag.
    ///
    /// `context` carries execution metadata the backend may use for routing
    /// or tracing; the returned map becomes the node's output.
    async fn invoke_agent(
        &self,
        agent_id: &str,
        input: JsonMap<String, JsonValue>,
        context: &JsonMap<String, JsonValue>,
    ) -> Result<JsonMap<String, JsonValue>, RuntimeError>;
}

/// A runtime whose agents all echo their input map back as output.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoAgentRuntime;

#[async_trait]
impl AgentRuntime for EchoAgentRuntime {
    async fn invoke_agent(
        &self,
        _agent_id: &str,
        input: JsonMap<String, JsonValue>,
        _context: &JsonMap<String, JsonValue>,
    ) -> Result<JsonMap<String, JsonValue>, RuntimeError> {
        Ok(input)
    }
}

type AgentHandler = Arc<
    dyn Fn(JsonMap<String, JsonValue>) -> BoxFuture<'static, Result<JsonMap<String, JsonValue>, RuntimeError>>
        + Send
        + Sync,
>;

/// A runtime with per-agent scripted behavior, for tests and local runs.
#[derive(Default, Clone)]
pub struct ScriptedAgentRuntime {
    handlers: Arc<Mutex<HashMap<String, AgentHandler>>>,
    calls: Arc<Mutex<HashMap<String, Arc<AtomicU32>>>>,
}

impl ScriptedAgentRuntime {
    /// Creates an empty scripted runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an agent backed by an async handler.
    pub fn register<F>(&self, agent_id: impl Into<String>, handler: F)
    where
        F: Fn(JsonMap<String, JsonValue>) -> BoxFuture<'static, Result<JsonMap<String, JsonValue>, RuntimeError>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(agent_id.into(), Arc::new(handler));
    }

    /// Registers an agent that echoes its input.
    pub fn register_echo(&self, agent_id: impl Into<String>) {
        self.register(agent_id, |input| Box::pin(async move { Ok(input) }));
    }

    /// Registers an agent returning a fixed output.
    pub fn register_output(&self, agent_id: impl Into<String>, output: JsonMap<String, JsonValue>) {
        self.register(agent_id, move |_| {
            let output = output.clone();
            Box::pin(async move { Ok(output) })
        });
    }

    /// Registers an agent that sleeps before returning a fixed output.
    pub fn register_delayed(
        &self,
        agent_id: impl Into<String>,
        delay: Duration,
        output: JsonMap<String, JsonValue>,
    ) {
        self.register(agent_id, move |_| {
            let output = output.clone();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(output)
            })
        });
    }

    /// Registers an agent that fails its first `failures` attempts, then
    /// echoes its input.
    pub fn register_flaky(&self, agent_id: impl Into<String>, failures: u32) {
        let attempts = Arc::new(AtomicU32::new(0));
        self.register(agent_id, move |input| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                if attempt <= failures {
                    Err(RuntimeError::InvocationFailed {
                        message: format!("scripted failure on attempt {attempt}"),
                    })
                } else {
                    Ok(input)
                }
            })
        });
    }

    /// Registers an agent that always fails.
    pub fn register_failing(&self, agent_id: impl Into<String>, message: impl Into<String>) {
        let message = message.into();
        self.register(agent_id, move |_| {
            let message = message.clone();
            Box::pin(async move { Err(RuntimeError::InvocationFailed { message }) })
        });
    }

    /// Returns how many times an agent has been invoked.
    #[must_use]
    pub fn call_count(&self, agent_id: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(agent_id)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    fn counter(&self, agent_id: &str) -> Arc<AtomicU32> {
        Arc::clone(
            self.calls
                .lock()
                .unwrap()
                .entry(agent_id.to_string())
                .or_default(),
        )
    }
}

#[async_trait]
impl AgentRuntime for ScriptedAgentRuntime {
    async fn invoke_agent(
        &self,
        agent_id: &str,
        input: JsonMap<String, JsonValue>,
        _context: &JsonMap<String, JsonValue>,
    ) -> Result<JsonMap<String, JsonValue>, RuntimeError> {
        let handler = self
            .handlers
            .lock()
            .unwrap()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RuntimeError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;
        self.counter(agent_id).fetch_add(1, Ordering::SeqCst);
        debug!(agent_id, "invoking scripted agent");
        handler(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(value: JsonValue) -> JsonMap<String, JsonValue> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn echo_runtime_echoes() {
        let runtime = EchoAgentRuntime;
        let result = runtime
            .invoke_agent("anything", input(json!({"msg": "hi"})), &JsonMap::new())
            .await
            .unwrap();
        assert_eq!(result.get("msg"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn scripted_runtime_unknown_agent_errors() {
        let runtime = ScriptedAgentRuntime::new();
        let err = runtime
            .invoke_agent("ghost", JsonMap::new(), &JsonMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AgentNotFound { .. }));
    }

    #[tokio::test]
    async fn flaky_agent_fails_then_succeeds() {
        let runtime = ScriptedAgentRuntime::new();
        runtime.register_flaky("flaky", 2);

        for attempt in 1..=2 {
            let err = runtime
                .invoke_agent("flaky", JsonMap::new(), &JsonMap::new())
                .await
                .unwrap_err();
            assert!(err.to_string().contains(&format!("attempt {attempt}")));
        }
        let ok = runtime
            .invoke_agent("flaky", input(json!({"k": 1})), &JsonMap::new())
            .await
            .unwrap();
        assert_eq!(ok.get("k"), Some(&json!(1)));
        assert_eq!(runtime.call_count("flaky"), 3);
    }

    #[tokio::test]
    async fn delayed_agent_waits() {
        let runtime = ScriptedAgentRuntime::new();
        runtime.register_delayed("slow", Duration::from_millis(30), JsonMap::new());
        let started = std::time::Instant::now();
        runtime
            .invoke_agent("slow", JsonMap::new(), &JsonMap::new())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
