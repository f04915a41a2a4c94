//! Action dispatch for state enter/exit and transition actions.
//!
//! Actions are dispatched through a registry keyed by `action.type`.
//! Built-ins: `log`, `set_variable`, `publish_event`. Unknown types produce
//! an error unless the action is marked optional.

use crate::error::StateMachineError;
use async_trait::async_trait;
use cascade_eventbus::EventSink;
use cascade_workflow::ActionSpec;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Handles one action type.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Executes the action against the instance variables.
    async fn execute(
        &self,
        params: &JsonMap<String, JsonValue>,
        variables: &mut JsonMap<String, JsonValue>,
    ) -> Result<(), StateMachineError>;
}

/// Registry of action handlers keyed by action type.
#[derive(Clone)]
pub struct ActionRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn ActionHandler>>>>,
}

impl ActionRegistry {
    /// Creates a registry with the built-in handlers installed.
    #[must_use]
    pub fn with_builtins(sink: Arc<dyn EventSink>) -> Self {
        let registry = Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        };
        registry.register("log", Arc::new(LogAction));
        registry.register("set_variable", Arc::new(SetVariableAction));
        registry.register("publish_event", Arc::new(PublishEventAction { sink }));
        registry
    }

    /// Registers (or replaces) a handler for an action type.
    pub fn register(&self, kind: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.write().unwrap().insert(kind.into(), handler);
    }

    /// Runs a list of actions in order.
    ///
    /// # Errors
    ///
    /// Fails on the first non-optional action with a missing handler or a
    /// failing handler; optional actions log and continue.
    pub async fn run(
        &self,
        actions: &[ActionSpec],
        variables: &mut JsonMap<String, JsonValue>,
    ) -> Result<(), StateMachineError> {
        for action in actions {
            let handler = self.handlers.read().unwrap().get(&action.kind).cloned();
            let Some(handler) = handler else {
                if action.optional {
                    warn!(action = %action.kind, "skipping optional action with no handler");
                    continue;
                }
                return Err(StateMachineError::UnknownAction {
                    action: action.kind.clone(),
                });
            };

            match handler.execute(&action.params, variables).await {
                Ok(()) => {}
                Err(e) if action.optional => {
                    warn!(action = %action.kind, error = %e, "optional action failed");
                }
                Err(e) => {
                    return Err(StateMachineError::ActionFailed {
                        action: action.kind.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Logs a message at the configured level.
struct LogAction;

#[async_trait]
impl ActionHandler for LogAction {
    async fn execute(
        &self,
        params: &JsonMap<String, JsonValue>,
        _variables: &mut JsonMap<String, JsonValue>,
    ) -> Result<(), StateMachineError> {
        let message = params
            .get("message")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        match params.get("level").and_then(JsonValue::as_str) {
            Some("debug") => debug!(target: "statemachine", "{message}"),
            Some("warn") => warn!(target: "statemachine", "{message}"),
            _ => info!(target: "statemachine", "{message}"),
        }
        Ok(())
    }
}

/// Sets `params.name` to `params.value` in the instance variables.
struct SetVariableAction;

#[async_trait]
impl ActionHandler for SetVariableAction {
    async fn execute(
        &self,
        params: &JsonMap<String, JsonValue>,
        variables: &mut JsonMap<String, JsonValue>,
    ) -> Result<(), StateMachineError> {
        let Some(name) = params.get("name").and_then(JsonValue::as_str) else {
            return Err(StateMachineError::ActionFailed {
                action: "set_variable".to_string(),
                message: "missing 'name' parameter".to_string(),
            });
        };
        let value = params.get("value").cloned().unwrap_or(JsonValue::Null);
        variables.insert(name.to_string(), value);
        Ok(())
    }
}

/// Publishes `params.payload` to `params.topic`.
struct PublishEventAction {
    sink: Arc<dyn EventSink>,
}

#[async_trait]
impl ActionHandler for PublishEventAction {
    async fn execute(
        &self,
        params: &JsonMap<String, JsonValue>,
        _variables: &mut JsonMap<String, JsonValue>,
    ) -> Result<(), StateMachineError> {
        let Some(topic) = params.get("topic").and_then(JsonValue::as_str) else {
            return Err(StateMachineError::ActionFailed {
                action: "publish_event".to_string(),
                message: "missing 'topic' parameter".to_string(),
            });
        };
        let payload = params.get("payload").cloned().unwrap_or(JsonValue::Null);
        self.sink
            .publish(topic, payload)
            .await
            .map_err(|e| StateMachineError::ActionFailed {
                action: "publish_event".to_string(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_eventbus::RecordingSink;
    use serde_json::json;

    fn registry() -> (ActionRegistry, RecordingSink) {
        let sink = RecordingSink::new();
        let registry = ActionRegistry::with_builtins(Arc::new(sink.clone()));
        (registry, sink)
    }

    #[tokio::test]
    async fn set_variable_writes_variables() {
        let (registry, _) = registry();
        let mut variables = JsonMap::new();
        let actions = vec![
            ActionSpec::new("set_variable")
                .with_param("name", json!("counter"))
                .with_param("value", json!(7)),
        ];
        registry.run(&actions, &mut variables).await.unwrap();
        assert_eq!(variables.get("counter"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn publish_event_reaches_sink() {
        let (registry, sink) = registry();
        let mut variables = JsonMap::new();
        let actions = vec![
            ActionSpec::new("publish_event")
                .with_param("topic", json!("orders.created"))
                .with_param("payload", json!({"id": 1})),
        ];
        registry.run(&actions, &mut variables).await.unwrap();
        assert_eq!(sink.count_for("orders.created"), 1);
    }

    #[tokio::test]
    async fn unknown_action_errors_unless_optional() {
        let (registry, _) = registry();
        let mut variables = JsonMap::new();

        let err = registry
            .run(&[ActionSpec::new("teleport")], &mut variables)
            .await
            .unwrap_err();
        assert!(matches!(err, StateMachineError::UnknownAction { .. }));

        registry
            .run(&[ActionSpec::new("teleport").optional()], &mut variables)
            .await
            .expect("optional action is skipped");
    }

    #[tokio::test]
    async fn failing_required_action_stops_the_list() {
        let (registry, _) = registry();
        let mut variables = JsonMap::new();
        // set_variable without a name fails.
        let actions = vec![
            ActionSpec::new("set_variable"),
            ActionSpec::new("set_variable")
                .with_param("name", json!("never"))
                .with_param("value", json!(true)),
        ];
        let err = registry.run(&actions, &mut variables).await.unwrap_err();
        assert!(matches!(err, StateMachineError::ActionFailed { .. }));
        assert!(variables.is_empty());
    }
}
