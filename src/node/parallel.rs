//! Parallel node: concurrent fan-out over a list of child states.
//!
//! Children run concurrently bounded by `maxConcurrency`, each in its own
//! copy-on-branch context. With `waitForAll` (the default) the node succeeds
//! only if every child succeeds, and the first failure cancels the still
//! running siblings cooperatively. With `waitForAll=false` one successful
//! child is enough and failures surface only in metadata. A per-child
//! timeout cancels a single lagging branch without affecting the others.
//!
//! Variable deltas are merged in completion order; conflicting writes are
//! last-completer-wins and the colliding keys are recorded in metadata.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::definition::{State, StateKind, Workflow};
use crate::execution::ExecutionContext;
use crate::node::{NodeEstimate, NodeExecutor, NodeRegistry, NodeResult, NodeSpec};
use crate::variables::VariableDelta;
use crate::{EngineError, EngineResult};

const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Bounded concurrent fan-out over child states.
pub struct ParallelNode {
    state: State,
    children: Vec<String>,
    wait_for_all: bool,
    max_concurrency: usize,
    timeout_per_child: Option<Duration>,
    workflow: Arc<Workflow>,
    registry: Arc<NodeRegistry>,
}

impl ParallelNode {
    /// Build from a node spec.
    pub fn from_spec(spec: NodeSpec) -> Self {
        let children = spec
            .state
            .config
            .get("children")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            children,
            wait_for_all: spec.state.config_bool("waitForAll").unwrap_or(true),
            max_concurrency: spec
                .state
                .config_u64("maxConcurrency")
                .map(|v| v.max(1) as usize)
                .unwrap_or(DEFAULT_MAX_CONCURRENCY),
            timeout_per_child: spec
                .state
                .config_u64("timeoutPerChildMs")
                .map(Duration::from_millis),
            workflow: spec.workflow,
            registry: spec.registry,
            state: spec.state,
        }
    }
}

struct ChildOutcome {
    child_id: String,
    result: Result<NodeResult, String>,
    log: Vec<crate::execution::ExecutionEvent>,
    delta: VariableDelta,
}

#[async_trait]
impl NodeExecutor for ParallelNode {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn name(&self) -> &str {
        &self.state.name
    }

    fn kind(&self) -> StateKind {
        StateKind::Parallel
    }

    fn validate(&self) -> EngineResult<()> {
        if self.children.is_empty() {
            return Err(EngineError::Validation(format!(
                "parallel state '{}' declares no children",
                self.state.id
            )));
        }
        for child in &self.children {
            if self.workflow.state(child).is_none() {
                return Err(EngineError::Validation(format!(
                    "parallel state '{}' references unknown child '{}'",
                    self.state.id, child
                )));
            }
        }
        Ok(())
    }

    fn estimate(&self) -> NodeEstimate {
        NodeEstimate {
            expected_duration_ms: 10 * self.children.len() as u64,
            parallelizable: true,
        }
    }

    async fn execute(&self, ctx: &mut ExecutionContext, input: Value) -> EngineResult<NodeResult> {
        ctx.check_cancelled()?;

        // One scope token covers the whole sibling group so a waitForAll
        // failure can cancel everything still in flight.
        let scope = ctx.cancellation().child_token();
        let limiter = Arc::new(Semaphore::new(self.max_concurrency));

        let mut branches = Vec::with_capacity(self.children.len());
        for child_id in &self.children {
            let state = self.workflow.state(child_id).cloned().ok_or_else(|| {
                EngineError::InvalidState(format!(
                    "parallel state '{}' references unknown child '{}'",
                    self.state.id, child_id
                ))
            })?;
            let executor = self.registry.build(&state, &self.workflow)?;
            let child_token = scope.child_token();
            let child_ctx = ctx.branch_with(child_token.clone());
            branches.push((child_id.clone(), executor, child_token, child_ctx));
        }

        let mut running: FuturesUnordered<_> = branches
            .into_iter()
            .map(|(child_id, executor, child_token, mut child_ctx)| {
                let limiter = limiter.clone();
                let input = input.clone();
                let timeout_per_child = self.timeout_per_child;
                async move {
                    let _permit = limiter.acquire().await.expect("semaphore closed");
                    let outcome = match timeout_per_child {
                        Some(timeout) => {
                            match tokio::time::timeout(
                                timeout,
                                executor.execute(&mut child_ctx, input),
                            )
                            .await
                            {
                                Ok(result) => result,
                                Err(_) => {
                                    // Cancel only the lagging branch.
                                    child_token.cancel();
                                    Err(EngineError::Timeout(format!(
                                        "child '{}' timed out after {:?}",
                                        child_id, timeout
                                    )))
                                }
                            }
                        }
                        None => executor.execute(&mut child_ctx, input).await,
                    };

                    let log = child_ctx.take_log();
                    match outcome {
                        Ok(result) if result.success => ChildOutcome {
                            child_id,
                            delta: result.variable_delta.clone(),
                            result: Ok(result),
                            log,
                        },
                        Ok(result) => ChildOutcome {
                            child_id,
                            result: Err(result
                                .error
                                .clone()
                                .unwrap_or_else(|| "child failed".to_string())),
                            delta: VariableDelta::new(),
                            log,
                        },
                        Err(e) => ChildOutcome {
                            child_id,
                            result: Err(e.to_string()),
                            delta: VariableDelta::new(),
                            log,
                        },
                    }
                }
            })
            .collect();

        let mut merged = VariableDelta::new();
        let mut collisions: Vec<String> = Vec::new();
        let mut successful = 0u64;
        let mut failures: Vec<(String, String)> = Vec::new();
        let mut first_failure: Option<String> = None;

        while let Some(outcome) = running.next().await {
            match outcome.result {
                Ok(_result) => {
                    successful += 1;
                    // Merge in completion order: last completer wins,
                    // collisions recorded.
                    collisions.extend(merged.merge(&outcome.delta));
                    ctx.join(&outcome.delta, outcome.log);
                }
                Err(error) => {
                    debug!(child = %outcome.child_id, error = %error, "parallel child failed");
                    ctx.join(&VariableDelta::new(), outcome.log);
                    if self.wait_for_all && first_failure.is_none() {
                        first_failure = Some(format!(
                            "child '{}' failed: {}",
                            outcome.child_id, error
                        ));
                        // Cooperatively cancel the rest of the group.
                        scope.cancel();
                    }
                    failures.push((outcome.child_id, error));
                }
            }
        }

        collisions.sort();
        collisions.dedup();
        let failure_meta: Vec<Value> = failures
            .iter()
            .map(|(child, error)| json!({ "child": child, "error": error }))
            .collect();

        let success = if self.wait_for_all {
            failures.is_empty()
        } else {
            successful > 0
        };

        let mut result = if success {
            NodeResult::ok(json!({ "successful": successful, "failed": failures.len() }))
        } else if self.wait_for_all {
            NodeResult::fail(
                first_failure.unwrap_or_else(|| "parallel group failed".to_string()),
            )
        } else {
            NodeResult::fail(format!(
                "all {} children of parallel state '{}' failed",
                self.children.len(),
                self.state.id
            ))
        };

        result.variable_delta = merged;
        Ok(result
            .with_meta("successful", Value::from(successful))
            .with_meta("failed", Value::from(failures.len() as u64))
            .with_meta("failures", Value::Array(failure_meta))
            .with_meta(
                "collisions",
                Value::Array(collisions.into_iter().map(Value::String).collect()),
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ActionDef, ActionKind, StateBuilder, WorkflowBuilder};
    use crate::event::EventBus;
    use crate::plugin::{HandlerRegistry, Plugin, PluginContext, PluginResult};
    use crate::services::ServiceLocator;
    use crate::variables::VariableStore;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Writes `key=value` from its config, optionally failing or sleeping.
    struct BranchPlugin;

    #[async_trait]
    impl Plugin for BranchPlugin {
        fn name(&self) -> &str {
            "branch"
        }

        async fn execute(&self, context: PluginContext) -> EngineResult<PluginResult> {
            if let Some(sleep_ms) = context.input_field("sleepMs").and_then(|v| v.as_u64()) {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                    _ = context.cancellation.cancelled() => {
                        return Err(EngineError::ExecutionFailed("branch cancelled".to_string()));
                    }
                }
            }
            if context
                .input_field("fail")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                return Ok(PluginResult::fail("branch exploded"));
            }
            let key = context
                .input_field("key")
                .and_then(|v| v.as_str())
                .unwrap_or("out")
                .to_string();
            let value = context.input_field("value").cloned().unwrap_or(Value::Null);
            Ok(PluginResult::ok(Value::Null).with_variables(HashMap::from([(key, value)])))
        }
    }

    fn child_state(id: &str, config: &[(&str, Value)]) -> State {
        let mut builder = StateBuilder::task(id);
        let mut action = ActionDef::new(format!("{}-a", id), ActionKind::PluginInvoke)
            .with_config("plugin", json!("branch"));
        for (key, value) in config {
            action = action.with_config(*key, value.clone());
        }
        builder = builder.action(action);
        builder.build()
    }

    async fn run_parallel(
        children: Vec<State>,
        config: &[(&str, Value)],
    ) -> (NodeResult, ExecutionContext) {
        let child_ids: Vec<Value> = children.iter().map(|s| json!(s.id)).collect();
        let mut builder = WorkflowBuilder::new("wf")
            .state(StateBuilder::task("seed").initial().build())
            .state(StateBuilder::end("end").build());
        for child in children {
            builder = builder.state(child);
        }
        let mut fan_out = StateBuilder::new("fan", StateKind::Parallel)
            .config("children", Value::Array(child_ids));
        for (key, value) in config {
            fan_out = fan_out.config(*key, value.clone());
        }
        let workflow = Arc::new(builder.state(fan_out.build()).build());

        let registry = NodeRegistry::new();
        let node = ParallelNode::from_spec(NodeSpec {
            state: workflow.state("fan").unwrap().clone(),
            workflow: workflow.clone(),
            registry,
        });

        let handlers = Arc::new(HandlerRegistry::new());
        handlers
            .register_plugin(Arc::new(BranchPlugin), json!({}))
            .await
            .unwrap();

        let execution = crate::execution::Execution::new("wf", json!({}), None);
        let mut ctx = ExecutionContext::new(
            &execution,
            VariableStore::new(),
            Arc::new(EventBus::new()),
            handlers,
            Arc::new(ServiceLocator::new()),
            CancellationToken::new(),
        );
        let result = node.execute(&mut ctx, json!({})).await.unwrap();
        (result, ctx)
    }

    #[tokio::test]
    async fn test_all_children_succeed() {
        let (result, ctx) = run_parallel(
            vec![
                child_state("a", &[("key", json!("a_out")), ("value", json!(1))]),
                child_state("b", &[("key", json!("b_out")), ("value", json!(2))]),
                child_state("c", &[("key", json!("c_out")), ("value", json!(3))]),
            ],
            &[],
        )
        .await;

        assert!(result.success);
        assert_eq!(result.meta_u64("successful"), 3);
        assert_eq!(result.meta_u64("failed"), 0);
        assert_eq!(ctx.variables.get("a_out"), Some(&json!(1)));
        assert_eq!(ctx.variables.get("b_out"), Some(&json!(2)));
        assert_eq!(ctx.variables.get("c_out"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_wait_for_all_fails_on_any_child_failure() {
        let (result, _ctx) = run_parallel(
            vec![
                child_state("a", &[("key", json!("a_out")), ("value", json!(1))]),
                child_state("b", &[("fail", json!(true))]),
                child_state("c", &[("key", json!("c_out")), ("value", json!(3))]),
            ],
            &[("waitForAll", json!(true))],
        )
        .await;

        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().contains("'b'"));
        assert_eq!(result.meta_u64("failed"), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_succeeds_without_wait_for_all() {
        let (result, ctx) = run_parallel(
            vec![
                child_state("a", &[("key", json!("a_out")), ("value", json!(1))]),
                child_state("b", &[("fail", json!(true))]),
                child_state("c", &[("key", json!("c_out")), ("value", json!(3))]),
            ],
            &[("waitForAll", json!(false))],
        )
        .await;

        assert!(result.success);
        assert_eq!(result.meta_u64("successful"), 2);
        assert_eq!(result.meta_u64("failed"), 1);
        // Deltas from the surviving children still merged.
        assert_eq!(ctx.variables.get("a_out"), Some(&json!(1)));
        assert_eq!(ctx.variables.get("c_out"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_all_children_failing_fails_even_without_wait_for_all() {
        let (result, _ctx) = run_parallel(
            vec![
                child_state("a", &[("fail", json!(true))]),
                child_state("b", &[("fail", json!(true))]),
            ],
            &[("waitForAll", json!(false))],
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.meta_u64("successful"), 0);
    }

    #[tokio::test]
    async fn test_conflicting_writes_are_recorded() {
        let (result, _ctx) = run_parallel(
            vec![
                child_state("a", &[("key", json!("shared")), ("value", json!("from-a"))]),
                child_state("b", &[("key", json!("shared")), ("value", json!("from-b"))]),
            ],
            &[],
        )
        .await;

        assert!(result.success);
        assert_eq!(
            result.metadata.get("collisions"),
            Some(&json!(["shared"]))
        );
    }

    #[tokio::test]
    async fn test_per_child_timeout_cancels_only_the_laggard() {
        let (result, ctx) = run_parallel(
            vec![
                child_state("fast", &[("key", json!("fast_out")), ("value", json!(1))]),
                child_state("slow", &[("sleepMs", json!(10_000))]),
            ],
            &[("waitForAll", json!(false)), ("timeoutPerChildMs", json!(50))],
        )
        .await;

        assert!(result.success);
        assert_eq!(result.meta_u64("successful"), 1);
        assert_eq!(result.meta_u64("failed"), 1);
        assert_eq!(ctx.variables.get("fast_out"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_validation_checks_children() {
        let workflow = Arc::new(
            WorkflowBuilder::new("wf")
                .state(StateBuilder::task("seed").initial().build())
                .state(StateBuilder::end("end").build())
                .build(),
        );
        let no_children = ParallelNode::from_spec(NodeSpec {
            state: StateBuilder::new("fan", StateKind::Parallel).build(),
            workflow: workflow.clone(),
            registry: NodeRegistry::new(),
        });
        assert!(no_children.validate().is_err());

        let unknown_child = ParallelNode::from_spec(NodeSpec {
            state: StateBuilder::new("fan", StateKind::Parallel)
                .config("children", json!(["ghost"]))
                .build(),
            workflow,
            registry: NodeRegistry::new(),
        });
        assert!(unknown_child.validate().is_err());
    }
}
