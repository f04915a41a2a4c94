//! Tool invocation contract and a static in-memory registry.

use crate::error::{ParameterError, RuntimeError};
use crate::validate::{ParameterSpec, validate_parameters};
use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Invokes tools by id.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Invokes a tool with the given parameters.
    async fn invoke_tool(
        &self,
        tool_id: &str,
        parameters: JsonMap<String, JsonValue>,
    ) -> Result<JsonMap<String, JsonValue>, RuntimeError>;

    /// Validates parameters against the tool's declared specs.
    ///
    /// The default implementation accepts everything; registries that know
    /// their tools' parameters override this.
    fn validate_parameters(
        &self,
        _tool_id: &str,
        _parameters: &JsonMap<String, JsonValue>,
    ) -> Vec<ParameterError> {
        Vec::new()
    }
}

type ToolHandler = Arc<
    dyn Fn(JsonMap<String, JsonValue>) -> Result<JsonMap<String, JsonValue>, RuntimeError>
        + Send
        + Sync,
>;

struct ToolEntry {
    handler: ToolHandler,
    specs: Vec<ParameterSpec>,
}

/// An in-memory tool registry with per-tool parameter specs.
#[derive(Default, Clone)]
pub struct StaticToolRegistry {
    tools: Arc<Mutex<HashMap<String, Arc<ToolEntry>>>>,
}

impl StaticToolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool with its handler and parameter specs.
    pub fn register<F>(&self, tool_id: impl Into<String>, specs: Vec<ParameterSpec>, handler: F)
    where
        F: Fn(JsonMap<String, JsonValue>) -> Result<JsonMap<String, JsonValue>, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        self.tools.lock().unwrap().insert(
            tool_id.into(),
            Arc::new(ToolEntry {
                handler: Arc::new(handler),
                specs,
            }),
        );
    }

    /// Registers a tool that echoes its parameters.
    pub fn register_echo(&self, tool_id: impl Into<String>) {
        self.register(tool_id, Vec::new(), Ok);
    }

    fn entry(&self, tool_id: &str) -> Option<Arc<ToolEntry>> {
        self.tools.lock().unwrap().get(tool_id).cloned()
    }
}

#[async_trait]
impl ToolRegistry for StaticToolRegistry {
    async fn invoke_tool(
        &self,
        tool_id: &str,
        parameters: JsonMap<String, JsonValue>,
    ) -> Result<JsonMap<String, JsonValue>, RuntimeError> {
        let entry = self.entry(tool_id).ok_or_else(|| RuntimeError::ToolNotFound {
            tool_id: tool_id.to_string(),
        })?;

        let errors = validate_parameters(&entry.specs, &parameters);
        if !errors.is_empty() {
            return Err(RuntimeError::InvalidParameters { errors });
        }

        (entry.handler)(parameters)
    }

    fn validate_parameters(
        &self,
        tool_id: &str,
        parameters: &JsonMap<String, JsonValue>,
    ) -> Vec<ParameterError> {
        match self.entry(tool_id) {
            Some(entry) => validate_parameters(&entry.specs, parameters),
            None => vec![ParameterError::new(
                "tool_id",
                format!("unknown tool: {tool_id}"),
            )],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: JsonValue) -> JsonMap<String, JsonValue> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn echo_tool_round_trips_parameters() {
        let registry = StaticToolRegistry::new();
        registry.register_echo("echo");
        let out = registry
            .invoke_tool("echo", params(json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(out.get("a"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn unknown_tool_errors() {
        let registry = StaticToolRegistry::new();
        let err = registry.invoke_tool("ghost", JsonMap::new()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn parameters_validated_before_invocation() {
        let registry = StaticToolRegistry::new();
        registry.register(
            "strict",
            vec![ParameterSpec::required("url", "string")],
            |params| Ok(params),
        );

        let err = registry
            .invoke_tool("strict", params(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidParameters { .. }));

        let ok = registry
            .invoke_tool("strict", params(json!({"url": "https://example.com"})))
            .await;
        assert!(ok.is_ok());
    }

    #[test]
    fn validate_parameters_for_unknown_tool() {
        let registry = StaticToolRegistry::new();
        let errors =
            ToolRegistry::validate_parameters(&registry, "ghost", &JsonMap::new());
        assert_eq!(errors.len(), 1);
    }
}
