//! Loop node: while / for / foreach over the state's action list.
//!
//! Every iteration runs the body in a child context; its variable writes
//! propagate back to the parent before the next round, so loop conditions see
//! the latest state. All sub-kinds enforce an absolute iteration cap;
//! exceeding it terminates the loop successfully with `maxIterationsReached`
//! set. A body that writes a truthy `break` variable short-circuits the
//! remaining iterations. Iterator advancement is unconditional: a failed body
//! iteration is counted and the loop moves on.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::definition::{State, StateKind};
use crate::execution::ExecutionContext;
use crate::expr;
use crate::node::task::TaskNode;
use crate::node::{NodeEstimate, NodeExecutor, NodeResult, NodeSpec};
use crate::variables::VariableDelta;
use crate::{EngineError, EngineResult};

const DEFAULT_MAX_ITERATIONS: u64 = 1_000;
const BREAK_VARIABLE: &str = "break";

/// The three loop sub-kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    While,
    For,
    ForEach,
}

/// Iterates the state's action list as its body.
pub struct LoopNode {
    state: State,
    loop_kind: LoopKind,
    condition: Option<String>,
    collection: Option<String>,
    iterator: String,
    count: Option<u64>,
    max_iterations: u64,
    body: TaskNode,
}

impl LoopNode {
    /// Build from a node spec.
    pub fn from_spec(spec: NodeSpec) -> Self {
        let state = spec.state.clone();
        let loop_kind = match state.config_str("loopType") {
            Some("for") => LoopKind::For,
            Some("foreach") => LoopKind::ForEach,
            _ => LoopKind::While,
        };
        let iterator = state
            .config_str("iterator")
            .unwrap_or(match loop_kind {
                LoopKind::ForEach => "item",
                _ => "index",
            })
            .to_string();

        Self {
            loop_kind,
            condition: state.config_str("condition").map(str::to_string),
            collection: state.config_str("collection").map(str::to_string),
            iterator,
            count: state.config_u64("count"),
            max_iterations: state
                .config_u64("maxIterations")
                .unwrap_or(DEFAULT_MAX_ITERATIONS),
            body: TaskNode::from_spec(spec),
            state,
        }
    }

    /// Run one body iteration in a child context and fold its writes back.
    async fn run_body(
        &self,
        ctx: &mut ExecutionContext,
        delta: &mut VariableDelta,
        failed: &mut u64,
    ) -> EngineResult<bool> {
        let mut child = ctx.branch();
        let result = self.body.execute(&mut child, Value::Null).await?;
        let branch_log = child.take_log();

        if !result.success {
            debug!(state = %self.state.id, error = ?result.error, "loop body iteration failed");
            *failed += 1;
        }

        // Writes propagate to the parent even when later actions failed.
        delta.merge(&result.variable_delta);
        ctx.join(&result.variable_delta, branch_log);

        let break_requested = ctx
            .variables
            .get(BREAK_VARIABLE)
            .map(crate::variables::truthy)
            .unwrap_or(false);
        if break_requested {
            ctx.variables.remove(BREAK_VARIABLE);
            delta.unset(BREAK_VARIABLE);
        }
        Ok(break_requested)
    }
}

#[async_trait]
impl NodeExecutor for LoopNode {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn name(&self) -> &str {
        &self.state.name
    }

    fn kind(&self) -> StateKind {
        StateKind::Loop
    }

    fn validate(&self) -> EngineResult<()> {
        match self.loop_kind {
            LoopKind::While => {
                let condition = self.condition.as_deref().ok_or_else(|| {
                    EngineError::Validation(format!(
                        "while loop '{}' is missing the 'condition' config entry",
                        self.state.id
                    ))
                })?;
                expr::parse(condition).map_err(|e| {
                    EngineError::Validation(format!(
                        "while loop '{}' has an invalid condition: {}",
                        self.state.id, e
                    ))
                })?;
            }
            LoopKind::ForEach => {
                if self.collection.is_none() {
                    return Err(EngineError::Validation(format!(
                        "foreach loop '{}' is missing the 'collection' config entry",
                        self.state.id
                    )));
                }
            }
            LoopKind::For => {}
        }
        self.body.validate()
    }

    fn estimate(&self) -> NodeEstimate {
        let body = self.body.estimate();
        let rounds = self.count.unwrap_or(self.max_iterations.min(10));
        NodeEstimate {
            expected_duration_ms: body.expected_duration_ms.saturating_mul(rounds),
            parallelizable: false,
        }
    }

    async fn execute(&self, ctx: &mut ExecutionContext, _input: Value) -> EngineResult<NodeResult> {
        let mut delta = VariableDelta::new();
        let mut iterations = 0u64;
        let mut failed = 0u64;
        let mut broke_early = false;
        let mut capped = false;

        match self.loop_kind {
            LoopKind::While => {
                let condition = self.condition.as_deref().ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "while loop '{}' has no condition",
                        self.state.id
                    ))
                })?;
                loop {
                    ctx.check_cancelled()?;
                    if iterations >= self.max_iterations {
                        capped = true;
                        break;
                    }
                    if !expr::evaluate_bool(condition, &ctx.variables)? {
                        break;
                    }
                    iterations += 1;
                    if self.run_body(ctx, &mut delta, &mut failed).await? {
                        broke_early = true;
                        break;
                    }
                }
            }
            LoopKind::For => {
                let declared = self.count.unwrap_or(self.max_iterations);
                let rounds = declared.min(self.max_iterations);
                capped = declared > self.max_iterations;
                for index in 0..rounds {
                    ctx.check_cancelled()?;
                    ctx.variables.set(self.iterator.clone(), json!(index));
                    delta.set(self.iterator.clone(), json!(index));
                    iterations += 1;
                    if self.run_body(ctx, &mut delta, &mut failed).await? {
                        broke_early = true;
                        break;
                    }
                }
            }
            LoopKind::ForEach => {
                let collection_name = self.collection.as_deref().ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "foreach loop '{}' has no collection",
                        self.state.id
                    ))
                })?;
                let items = match ctx.variables.get(collection_name) {
                    Some(Value::Array(items)) => items.clone(),
                    Some(other) => {
                        return Ok(NodeResult::fail(format!(
                            "foreach loop '{}' expects an array at '{}', found {}",
                            self.state.id, collection_name, other
                        )));
                    }
                    None => {
                        return Ok(NodeResult::fail(format!(
                            "foreach loop '{}' found no '{}' variable",
                            self.state.id, collection_name
                        )));
                    }
                };

                for item in items {
                    ctx.check_cancelled()?;
                    if iterations >= self.max_iterations {
                        capped = true;
                        break;
                    }
                    ctx.variables.set(self.iterator.clone(), item.clone());
                    delta.set(self.iterator.clone(), item);
                    iterations += 1;
                    if self.run_body(ctx, &mut delta, &mut failed).await? {
                        broke_early = true;
                        break;
                    }
                }
            }
        }

        let mut result = NodeResult::ok(json!({ "iterations": iterations }));
        result.variable_delta = delta;
        Ok(result
            .with_meta("iterations", Value::from(iterations))
            .with_meta("maxIterationsReached", Value::Bool(capped))
            .with_meta("failedIterations", Value::from(failed))
            .with_meta("brokeEarly", Value::Bool(broke_early)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ActionDef, ActionKind, StateBuilder, WorkflowBuilder};
    use crate::event::EventBus;
    use crate::node::NodeRegistry;
    use crate::plugin::{HandlerRegistry, Plugin, PluginContext, PluginResult};
    use crate::services::ServiceLocator;
    use crate::variables::VariableStore;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Copies the value of one variable into another, optionally breaking
    /// after a threshold.
    struct CopyPlugin;

    #[async_trait]
    impl Plugin for CopyPlugin {
        fn name(&self) -> &str {
            "copy"
        }

        async fn execute(&self, context: PluginContext) -> EngineResult<PluginResult> {
            let from = context
                .input_field("from")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let to = context
                .input_field("to")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let value = context.variables.get(from).cloned().unwrap_or(Value::Null);
            Ok(PluginResult::ok(Value::Null)
                .with_variables(HashMap::from([(to.to_string(), value)])))
        }
    }

    /// Increments `counter`, setting `break` when it reaches `stopAt`.
    struct CountPlugin;

    #[async_trait]
    impl Plugin for CountPlugin {
        fn name(&self) -> &str {
            "count"
        }

        async fn execute(&self, context: PluginContext) -> EngineResult<PluginResult> {
            let current = context
                .variables
                .get("counter")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let stop_at = context.input_field("stopAt").and_then(|v| v.as_i64());
            let mut variables = HashMap::from([("counter".to_string(), json!(current + 1))]);
            if stop_at == Some(current + 1) {
                variables.insert("break".to_string(), json!(true));
            }
            Ok(PluginResult::ok(Value::Null).with_variables(variables))
        }
    }

    async fn handlers() -> Arc<HandlerRegistry> {
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register_plugin(Arc::new(CopyPlugin), json!({}))
            .await
            .unwrap();
        registry
            .register_plugin(Arc::new(CountPlugin), json!({}))
            .await
            .unwrap();
        registry
    }

    fn loop_node(state: State) -> LoopNode {
        let workflow = Arc::new(
            WorkflowBuilder::new("wf")
                .state(StateBuilder::task("seed").initial().build())
                .state(StateBuilder::end("end").build())
                .build(),
        );
        LoopNode::from_spec(NodeSpec {
            state,
            workflow,
            registry: NodeRegistry::new(),
        })
    }

    async fn run(node: &LoopNode, vars: &[(&str, Value)]) -> (NodeResult, ExecutionContext) {
        let execution = crate::execution::Execution::new("wf", json!({}), None);
        let mut variables = VariableStore::new();
        for (name, value) in vars {
            variables.set(*name, value.clone());
        }
        let mut ctx = ExecutionContext::new(
            &execution,
            variables,
            Arc::new(EventBus::new()),
            handlers().await,
            Arc::new(ServiceLocator::new()),
            CancellationToken::new(),
        );
        let result = node.execute(&mut ctx, json!({})).await.unwrap();
        (result, ctx)
    }

    #[tokio::test]
    async fn test_foreach_iterates_collection() {
        let state = StateBuilder::new("each", StateKind::Loop)
            .config("loopType", json!("foreach"))
            .config("collection", json!("items"))
            .config("iterator", json!("current"))
            .action(
                ActionDef::new("copy", ActionKind::PluginInvoke)
                    .with_config("plugin", json!("copy"))
                    .with_config("from", json!("current"))
                    .with_config("to", json!("last")),
            )
            .build();
        let node = loop_node(state);

        let (result, ctx) = run(&node, &[("items", json!(["x", "y", "z"]))]).await;
        assert!(result.success);
        assert_eq!(result.meta_u64("iterations"), 3);
        assert_eq!(result.metadata.get("maxIterationsReached"), Some(&json!(false)));
        assert_eq!(ctx.variables.get("last"), Some(&json!("z")));
    }

    #[tokio::test]
    async fn test_foreach_rejects_non_sequence() {
        let state = StateBuilder::new("each", StateKind::Loop)
            .config("loopType", json!("foreach"))
            .config("collection", json!("items"))
            .build();
        let node = loop_node(state);

        let (result, _ctx) = run(&node, &[("items", json!(42))]).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("expects an array"));
    }

    #[tokio::test]
    async fn test_while_terminates_on_condition() {
        let state = StateBuilder::new("w", StateKind::Loop)
            .config("loopType", json!("while"))
            .config("condition", json!("counter < 4"))
            .action(
                ActionDef::new("inc", ActionKind::PluginInvoke)
                    .with_config("plugin", json!("count")),
            )
            .build();
        let node = loop_node(state);

        let (result, ctx) = run(&node, &[("counter", json!(0))]).await;
        assert!(result.success);
        assert_eq!(result.meta_u64("iterations"), 4);
        assert_eq!(ctx.variables.get("counter"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_while_honours_iteration_cap() {
        let state = StateBuilder::new("w", StateKind::Loop)
            .config("loopType", json!("while"))
            .config("condition", json!("true"))
            .config("maxIterations", json!(5))
            .action(
                ActionDef::new("inc", ActionKind::PluginInvoke)
                    .with_config("plugin", json!("count")),
            )
            .build();
        let node = loop_node(state);

        let (result, _ctx) = run(&node, &[("counter", json!(0))]).await;
        // Capped, but still a successful completion.
        assert!(result.success);
        assert_eq!(result.meta_u64("iterations"), 5);
        assert_eq!(result.metadata.get("maxIterationsReached"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_for_exposes_index_and_break_short_circuits() {
        let state = StateBuilder::new("f", StateKind::Loop)
            .config("loopType", json!("for"))
            .config("count", json!(10))
            .action(
                ActionDef::new("inc", ActionKind::PluginInvoke)
                    .with_config("plugin", json!("count"))
                    .with_config("stopAt", json!(3)),
            )
            .build();
        let node = loop_node(state);

        let (result, ctx) = run(&node, &[("counter", json!(0))]).await;
        assert!(result.success);
        assert_eq!(result.meta_u64("iterations"), 3);
        assert_eq!(result.metadata.get("brokeEarly"), Some(&json!(true)));
        // The break variable does not leak into the store.
        assert!(ctx.variables.get("break").is_none());
        // The iterator variable held the last index.
        assert_eq!(ctx.variables.get("index"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_failed_body_iteration_advances() {
        // The guard references an undefined-only expression error to make the
        // body fail every round while the loop itself keeps going.
        let state = StateBuilder::new("f", StateKind::Loop)
            .config("loopType", json!("for"))
            .config("count", json!(3))
            .action(
                ActionDef::new("bad", ActionKind::PluginInvoke)
                    .with_config("plugin", json!("missing-plugin")),
            )
            .build();
        let node = loop_node(state);

        let (result, _ctx) = run(&node, &[]).await;
        assert!(result.success);
        assert_eq!(result.meta_u64("iterations"), 3);
        assert_eq!(result.meta_u64("failedIterations"), 3);
    }

    #[test]
    fn test_validation() {
        let missing_condition = loop_node(
            StateBuilder::new("w", StateKind::Loop)
                .config("loopType", json!("while"))
                .build(),
        );
        assert!(missing_condition.validate().is_err());

        let missing_collection = loop_node(
            StateBuilder::new("e", StateKind::Loop)
                .config("loopType", json!("foreach"))
                .build(),
        );
        assert!(missing_collection.validate().is_err());

        let fine = loop_node(
            StateBuilder::new("f", StateKind::Loop)
                .config("loopType", json!("for"))
                .config("count", json!(2))
                .build(),
        );
        fine.validate().unwrap();
    }
}
