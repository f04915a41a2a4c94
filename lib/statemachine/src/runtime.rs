//! The state machine runtime: instance store and event processing.

use crate::action::{ActionHandler, ActionRegistry};
use crate::error::StateMachineError;
use crate::instance::{InstanceStatus, StateMachineInstance};
use cascade_core::InstanceId;
use cascade_eventbus::{EventSink, topic};
use cascade_workflow::expression::evaluate_predicate_vars;
use cascade_workflow::{State, Transition, Workflow, WorkflowKind};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Runs state machine workflows.
pub struct StateMachineRuntime {
    workflows: RwLock<HashMap<String, Workflow>>,
    instances: RwLock<HashMap<InstanceId, StateMachineInstance>>,
    actions: ActionRegistry,
    sink: Arc<dyn EventSink>,
}

impl StateMachineRuntime {
    /// Creates a runtime publishing into the given sink, with the built-in
    /// actions registered.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            actions: ActionRegistry::with_builtins(Arc::clone(&sink)),
            sink,
        }
    }

    /// Registers a custom action handler.
    pub fn register_action(&self, kind: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.actions.register(kind, handler);
    }

    /// Registers a state machine workflow.
    ///
    /// # Errors
    ///
    /// Returns an error when the workflow is not a state machine.
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<(), StateMachineError> {
        if workflow.kind != WorkflowKind::StateMachine {
            return Err(StateMachineError::NotAStateMachine {
                workflow_id: workflow.id.clone(),
            });
        }
        info!(workflow_id = %workflow.id, "registered state machine workflow");
        self.workflows
            .write()
            .await
            .insert(workflow.id.clone(), workflow);
        Ok(())
    }

    /// Creates an instance in the workflow's initial state and runs that
    /// state's enter actions.
    ///
    /// # Errors
    ///
    /// Returns an error when the workflow is unknown, has no initial state,
    /// or a required enter action fails.
    pub async fn create_instance(
        &self,
        workflow_id: &str,
        initial_variables: JsonMap<String, JsonValue>,
    ) -> Result<InstanceId, StateMachineError> {
        let workflows = self.workflows.read().await;
        let workflow =
            workflows
                .get(workflow_id)
                .ok_or_else(|| StateMachineError::WorkflowNotFound {
                    workflow_id: workflow_id.to_string(),
                })?;
        let initial = workflow
            .initial_state
            .clone()
            .ok_or_else(|| StateMachineError::StateNotFound {
                name: "<initial>".to_string(),
            })?;

        let mut instance = StateMachineInstance::new(workflow_id, initial.clone(), initial_variables);

        if let Some(state) = workflow.state(&initial) {
            self.actions
                .run(&state.on_enter, &mut instance.variables)
                .await?;
        }

        let instance_id = instance.instance_id;
        info!(%instance_id, workflow_id, state = %initial, "created state machine instance");
        self.instances.write().await.insert(instance_id, instance);
        Ok(instance_id)
    }

    /// Processes an external event against an instance.
    ///
    /// Merges the payload into the instance variables, finds the first
    /// matching transition of the current state (declaration order, guard
    /// must hold), runs exit/transition/enter actions, advances the state,
    /// and publishes `state_changed` (plus `completed` when the target is
    /// final). Returns `false` when no transition matches; a false guard
    /// changes nothing and publishes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error when the instance or workflow is unknown, the
    /// current state is undefined, or a required action fails.
    pub async fn process_event(
        &self,
        instance_id: InstanceId,
        event: &str,
        payload: JsonMap<String, JsonValue>,
    ) -> Result<bool, StateMachineError> {
        let workflows = self.workflows.read().await;
        let mut instances = self.instances.write().await;
        let instance =
            instances
                .get_mut(&instance_id)
                .ok_or(StateMachineError::InstanceNotFound { instance_id })?;
        let workflow = workflows.get(&instance.workflow_id).ok_or_else(|| {
            StateMachineError::WorkflowNotFound {
                workflow_id: instance.workflow_id.clone(),
            }
        })?;

        // Events after completion are ignored without side effects.
        if workflow.is_final_state(&instance.current_state) {
            return Ok(false);
        }

        let current = workflow.state(&instance.current_state).ok_or_else(|| {
            StateMachineError::StateNotFound {
                name: instance.current_state.clone(),
            }
        })?;

        for (key, value) in payload {
            instance.variables.insert(key, value);
        }

        let Some(transition) = find_transition(current, event, &instance.variables) else {
            warn!(
                %instance_id,
                event,
                state = %instance.current_state,
                "no transition matches event"
            );
            return Ok(false);
        };
        let transition = transition.clone();

        let target = workflow.state(&transition.target).ok_or_else(|| {
            StateMachineError::TransitionFailed {
                current_state: current.name.clone(),
                target_state: transition.target.clone(),
                message: "target state not found".to_string(),
            }
        })?;

        info!(
            %instance_id,
            from = %current.name,
            to = %target.name,
            event,
            "executing transition"
        );

        self.actions
            .run(&current.on_exit, &mut instance.variables)
            .await?;
        self.actions
            .run(&transition.actions, &mut instance.variables)
            .await?;

        let from_state = instance.current_state.clone();
        instance.current_state = target.name.clone();
        instance.add_history(event, from_state.clone(), target.name.clone());

        self.actions
            .run(&target.on_enter, &mut instance.variables)
            .await?;

        let _ = self
            .sink
            .publish(
                topic::STATE_CHANGED,
                json!({
                    "instance_id": instance.instance_id,
                    "workflow_id": instance.workflow_id,
                    "from_state": from_state,
                    "to_state": target.name,
                    "event": event,
                }),
            )
            .await;

        if workflow.is_final_state(&target.name) {
            info!(%instance_id, state = %target.name, "instance reached final state");
            let _ = self
                .sink
                .publish(
                    topic::STATEMACHINE_COMPLETED,
                    json!({
                        "instance_id": instance.instance_id,
                        "workflow_id": instance.workflow_id,
                        "final_state": target.name,
                        "variables": instance.variables,
                    }),
                )
                .await;
        }

        Ok(true)
    }

    /// Returns a clone of an instance.
    pub async fn instance(&self, instance_id: InstanceId) -> Option<StateMachineInstance> {
        self.instances.read().await.get(&instance_id).cloned()
    }

    /// Returns the queryable status of an instance.
    pub async fn status(&self, instance_id: InstanceId) -> Option<InstanceStatus> {
        let instances = self.instances.read().await;
        let instance = instances.get(&instance_id)?;
        let workflows = self.workflows.read().await;
        let is_final = workflows
            .get(&instance.workflow_id)
            .is_some_and(|w| w.is_final_state(&instance.current_state));
        Some(InstanceStatus {
            instance_id: instance.instance_id,
            workflow_id: instance.workflow_id.clone(),
            current_state: instance.current_state.clone(),
            is_final,
            variables: instance.variables.clone(),
            history: instance.history.clone(),
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        })
    }
}

/// Finds the first transition of `state` matching `event` whose guard holds.
fn find_transition<'a>(
    state: &'a State,
    event: &str,
    variables: &JsonMap<String, JsonValue>,
) -> Option<&'a Transition> {
    state.transitions.iter().find(|t| {
        t.event == event
            && t.condition
                .as_deref()
                .is_none_or(|c| evaluate_predicate_vars(c, variables))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_eventbus::RecordingSink;
    use cascade_workflow::{ActionSpec, StateKind};
    use serde_json::json;

    fn approval_workflow() -> Workflow {
        Workflow::state_machine("approval", "idle")
            .with_state(
                State::new("idle", StateKind::Initial)
                    .with_transition(Transition::new("start", "processing")),
            )
            .with_state(
                State::new("processing", StateKind::Normal)
                    .with_transition(
                        Transition::new("complete", "completed")
                            .with_condition("${approved} == true"),
                    )
                    .with_transition(Transition::new("reject", "rejected")),
            )
            .with_state(State::new("completed", StateKind::Final))
            .with_state(State::new("rejected", StateKind::Final))
    }

    async fn runtime_with(workflow: Workflow) -> (StateMachineRuntime, RecordingSink) {
        let sink = RecordingSink::new();
        let runtime = StateMachineRuntime::new(Arc::new(sink.clone()));
        runtime.register_workflow(workflow).await.unwrap();
        (runtime, sink)
    }

    #[tokio::test]
    async fn happy_path_reaches_final_state() {
        let (runtime, sink) = runtime_with(approval_workflow()).await;
        let instance_id = runtime
            .create_instance("approval", JsonMap::new())
            .await
            .unwrap();

        assert!(runtime
            .process_event(instance_id, "start", JsonMap::new())
            .await
            .unwrap());
        let mut payload = JsonMap::new();
        payload.insert("approved".to_string(), json!(true));
        assert!(runtime
            .process_event(instance_id, "complete", payload)
            .await
            .unwrap());

        let status = runtime.status(instance_id).await.unwrap();
        assert_eq!(status.current_state, "completed");
        assert!(status.is_final);
        assert_eq!(status.history.len(), 2);
        assert_eq!(sink.count_for(topic::STATE_CHANGED), 2);
        assert_eq!(sink.count_for(topic::STATEMACHINE_COMPLETED), 1);
    }

    #[tokio::test]
    async fn false_guard_blocks_transition_without_events() {
        let (runtime, sink) = runtime_with(approval_workflow()).await;
        let instance_id = runtime
            .create_instance("approval", JsonMap::new())
            .await
            .unwrap();
        runtime
            .process_event(instance_id, "start", JsonMap::new())
            .await
            .unwrap();
        let published_before = sink.count_for(topic::STATE_CHANGED);

        // `approved` is unset, so the guard is false.
        let moved = runtime
            .process_event(instance_id, "complete", JsonMap::new())
            .await
            .unwrap();
        assert!(!moved);

        let status = runtime.status(instance_id).await.unwrap();
        assert_eq!(status.current_state, "processing");
        assert_eq!(sink.count_for(topic::STATE_CHANGED), published_before);
    }

    #[tokio::test]
    async fn unmatched_event_returns_false() {
        let (runtime, _) = runtime_with(approval_workflow()).await;
        let instance_id = runtime
            .create_instance("approval", JsonMap::new())
            .await
            .unwrap();
        let moved = runtime
            .process_event(instance_id, "unknown_event", JsonMap::new())
            .await
            .unwrap();
        assert!(!moved);
    }

    #[tokio::test]
    async fn events_after_final_state_are_ignored() {
        let (runtime, sink) = runtime_with(approval_workflow()).await;
        let instance_id = runtime
            .create_instance("approval", JsonMap::new())
            .await
            .unwrap();
        runtime
            .process_event(instance_id, "start", JsonMap::new())
            .await
            .unwrap();
        runtime
            .process_event(instance_id, "reject", JsonMap::new())
            .await
            .unwrap();
        assert_eq!(sink.count_for(topic::STATEMACHINE_COMPLETED), 1);

        let moved = runtime
            .process_event(instance_id, "start", JsonMap::new())
            .await
            .unwrap();
        assert!(!moved);
        assert_eq!(sink.count_for(topic::STATEMACHINE_COMPLETED), 1);
    }

    #[tokio::test]
    async fn enter_actions_run_on_create() {
        let sink = RecordingSink::new();
        let runtime = StateMachineRuntime::new(Arc::new(sink.clone()));
        let workflow = Workflow::state_machine("wf", "idle")
            .with_state(
                State::new("idle", StateKind::Initial)
                    .with_on_enter(
                        ActionSpec::new("set_variable")
                            .with_param("name", json!("entered"))
                            .with_param("value", json!(true)),
                    )
                    .with_transition(Transition::new("go", "done")),
            )
            .with_state(State::new("done", StateKind::Final));
        runtime.register_workflow(workflow).await.unwrap();

        let instance_id = runtime.create_instance("wf", JsonMap::new()).await.unwrap();
        let instance = runtime.instance(instance_id).await.unwrap();
        assert_eq!(instance.variables.get("entered"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn transition_actions_run_between_exit_and_enter() {
        let sink = RecordingSink::new();
        let runtime = StateMachineRuntime::new(Arc::new(sink.clone()));
        let workflow = Workflow::state_machine("wf", "a")
            .with_state(
                State::new("a", StateKind::Initial)
                    .with_on_exit(
                        ActionSpec::new("set_variable")
                            .with_param("name", json!("order"))
                            .with_param("value", json!("exit")),
                    )
                    .with_transition(Transition::new("go", "b").with_action(
                        ActionSpec::new("set_variable")
                            .with_param("name", json!("order"))
                            .with_param("value", json!("transition")),
                    )),
            )
            .with_state(State::new("b", StateKind::Final).with_on_enter(
                ActionSpec::new("set_variable")
                    .with_param("name", json!("order"))
                    .with_param("value", json!("enter")),
            ));
        runtime.register_workflow(workflow).await.unwrap();

        let instance_id = runtime.create_instance("wf", JsonMap::new()).await.unwrap();
        runtime
            .process_event(instance_id, "go", JsonMap::new())
            .await
            .unwrap();
        let instance = runtime.instance(instance_id).await.unwrap();
        // Enter actions run last, so they win the overwrite.
        assert_eq!(instance.variables.get("order"), Some(&json!("enter")));
    }

    #[tokio::test]
    async fn dag_workflow_is_rejected() {
        let sink = RecordingSink::new();
        let runtime = StateMachineRuntime::new(Arc::new(sink));
        let err = runtime
            .register_workflow(Workflow::new("dagger"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateMachineError::NotAStateMachine { .. }));
    }
}
