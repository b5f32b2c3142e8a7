//! Parallel strategy: concurrent execution of the initial state group.
//!
//! Workflows with several initial states run them concurrently (bounded by
//! `max_concurrency`), merge variable deltas in completion order, then resume
//! sequentially from the common join state the group converges on. Workflows
//! that declare no parallelism at all degrade to the sequential walk, so the
//! strategy is always safe to select.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::definition::Workflow;
use crate::execution::{ExecutionContext, ExecutionStatus};
use crate::node::NodeRegistry;
use crate::strategy::{
    ExecutionResult, ExecutionStats, ExecutionStrategy, SequentialStrategy, StateExecutionRecord,
    select_transition,
};
use crate::{EngineError, EngineResult};

const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Concurrent-group graph walk.
pub struct ParallelStrategy {
    max_concurrency: usize,
    sequential: SequentialStrategy,
}

impl Default for ParallelStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelStrategy {
    /// A walker with the default concurrency bound.
    pub fn new() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            sequential: SequentialStrategy::new(),
        }
    }

    /// Override the concurrency bound for initial groups.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }
}

#[async_trait]
impl ExecutionStrategy for ParallelStrategy {
    fn name(&self) -> &'static str {
        "parallel"
    }

    async fn execute(
        &self,
        workflow: Arc<Workflow>,
        registry: Arc<NodeRegistry>,
        ctx: &mut ExecutionContext,
    ) -> EngineResult<ExecutionResult> {
        let initial_ids: Vec<String> = workflow
            .initial_states()
            .iter()
            .map(|s| s.id.clone())
            .collect();

        // Nothing to fan out: behave exactly like the sequential strategy.
        if initial_ids.len() <= 1 && !workflow.is_parallelizable() {
            debug!(workflow = %workflow.id, "no parallel groups declared, degrading to sequential");
            return self.sequential.execute(workflow, registry, ctx).await;
        }
        if initial_ids.len() <= 1 {
            // Parallel nodes inside the graph fan out on their own; the walk
            // itself stays sequential.
            return self.sequential.execute(workflow, registry, ctx).await;
        }

        let mut stats = ExecutionStats::started();
        let mut history = Vec::new();

        // Run the initial group concurrently, each member in its own branch.
        let limiter = Arc::new(Semaphore::new(self.max_concurrency));
        let mut running: FuturesUnordered<_> = initial_ids
            .iter()
            .map(|state_id| {
                let state_id = state_id.clone();
                let workflow = workflow.clone();
                let registry = registry.clone();
                let limiter = limiter.clone();
                let mut branch = ctx.branch();
                async move {
                    let _permit = limiter.acquire().await.expect("semaphore closed");
                    let state = match workflow.state(&state_id) {
                        Some(state) => state.clone(),
                        None => {
                            return (
                                state_id.clone(),
                                Err(EngineError::InvalidState(format!(
                                    "unknown initial state '{}'",
                                    state_id
                                ))),
                                branch,
                                Utc::now(),
                                0u64,
                            );
                        }
                    };
                    let started_at = Utc::now();
                    let started = Instant::now();
                    branch
                        .emit_scoped(
                            "state.entered",
                            json!({ "stateId": state.id }),
                            Some(state.id.clone()),
                            None,
                        )
                        .await;
                    let outcome = match registry.build(&state, &workflow) {
                        Ok(executor) => executor.execute(&mut branch, Value::Null).await,
                        Err(e) => Err(e),
                    };
                    let duration_ms = started.elapsed().as_millis() as u64;
                    branch
                        .emit_scoped(
                            "state.completed",
                            json!({
                                "stateId": state.id,
                                "success": matches!(&outcome, Ok(r) if r.success),
                                "durationMs": duration_ms,
                            }),
                            Some(state.id.clone()),
                            None,
                        )
                        .await;
                    (state_id, outcome, branch, started_at, duration_ms)
                }
            })
            .collect();

        let mut group_failed: Option<String> = None;
        let mut join_candidates: HashSet<String> = HashSet::new();
        let mut completed_members: Vec<String> = Vec::new();

        while let Some((state_id, outcome, mut branch, started_at, duration_ms)) =
            running.next().await
        {
            let branch_log = branch.take_log();
            match outcome {
                Ok(result) => {
                    stats.states_executed += 1;
                    stats.actions_executed += result.meta_u64("actionsAttempted");
                    stats.retries += result.meta_u64("retries");
                    history.push(StateExecutionRecord {
                        state_id: state_id.clone(),
                        success: result.success,
                        started_at,
                        duration_ms,
                        error: result.error.clone(),
                    });
                    // Merge in completion order.
                    ctx.join(&result.variable_delta, branch_log);

                    if !result.success {
                        group_failed.get_or_insert_with(|| {
                            result
                                .error
                                .unwrap_or_else(|| format!("initial state '{}' failed", state_id))
                        });
                        continue;
                    }
                    completed_members.push(state_id);
                }
                Err(e) => {
                    history.push(StateExecutionRecord {
                        state_id: state_id.clone(),
                        success: false,
                        started_at,
                        duration_ms,
                        error: Some(e.to_string()),
                    });
                    ctx.join(&crate::variables::VariableDelta::new(), branch_log);
                    group_failed.get_or_insert(e.to_string());
                }
            }
        }

        if let Some(error) = group_failed {
            stats.finish();
            return Ok(ExecutionResult {
                status: ExecutionStatus::Failed,
                output_data: store_snapshot(ctx),
                execution_stats: stats,
                state_history: {
                    let mut history = history;
                    if let Some(last_failed) =
                        history.iter_mut().rev().find(|r| !r.success && r.error.is_none())
                    {
                        last_failed.error = Some(error);
                    }
                    history
                },
            });
        }

        // The group resumes at the state its members converge on.
        for member in &completed_members {
            let is_final = workflow.state(member).map(|s| s.is_final).unwrap_or(false);
            if is_final {
                continue;
            }
            if let Some(transition) = select_transition(&workflow, member, &ctx.variables)? {
                join_candidates.insert(transition.to.clone());
            }
        }

        let status = match join_candidates.len() {
            0 => ExecutionStatus::Completed,
            1 => {
                let join_id = join_candidates.into_iter().next().expect("one candidate");
                self.sequential
                    .walk(&workflow, &registry, ctx, &join_id, &mut stats, &mut history)
                    .await?
            }
            _ => {
                return Err(EngineError::InvalidState(format!(
                    "initial group of workflow '{}' does not converge on a single join state",
                    workflow.id
                )));
            }
        };

        stats.finish();
        Ok(ExecutionResult {
            status,
            output_data: store_snapshot(ctx),
            execution_stats: stats,
            state_history: history,
        })
    }
}

fn store_snapshot(ctx: &ExecutionContext) -> Value {
    Value::Object(
        ctx.variables
            .values()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
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
    use tokio_util::sync::CancellationToken;

    struct StampPlugin;

    #[async_trait]
    impl Plugin for StampPlugin {
        fn name(&self) -> &str {
            "stamp"
        }

        async fn execute(&self, context: PluginContext) -> EngineResult<PluginResult> {
            let key = context
                .input_field("key")
                .and_then(|v| v.as_str())
                .unwrap_or("out")
                .to_string();
            Ok(PluginResult::ok(Value::Null)
                .with_variables(HashMap::from([(key, json!(true))])))
        }
    }

    async fn run(workflow: Workflow) -> (ExecutionResult, ExecutionContext) {
        let workflow = Arc::new(workflow);
        let handlers = Arc::new(HandlerRegistry::new());
        handlers
            .register_plugin(Arc::new(StampPlugin), json!({}))
            .await
            .unwrap();
        let execution = crate::execution::Execution::new(workflow.id.clone(), json!({}), None);
        let mut ctx = ExecutionContext::new(
            &execution,
            VariableStore::new(),
            Arc::new(EventBus::new()),
            handlers,
            Arc::new(ServiceLocator::new()),
            CancellationToken::new(),
        );
        let result = ParallelStrategy::new()
            .execute(workflow, NodeRegistry::new(), &mut ctx)
            .await
            .unwrap();
        (result, ctx)
    }

    fn stamp_state(id: &str, initial: bool) -> crate::definition::State {
        let mut builder = StateBuilder::task(id).action(
            ActionDef::new(format!("{}-a", id), ActionKind::PluginInvoke)
                .with_config("plugin", json!("stamp"))
                .with_config("key", json!(format!("{}_done", id))),
        );
        if initial {
            builder = builder.initial();
        }
        builder.build()
    }

    #[tokio::test]
    async fn test_concurrent_initial_group_joins() {
        let workflow = WorkflowBuilder::new("wf-par")
            .state(stamp_state("a", true))
            .state(stamp_state("b", true))
            .state(StateBuilder::end("join").build())
            .transition("a", "join")
            .transition("b", "join")
            .build();

        let (result, ctx) = run(workflow).await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        // Both members plus the join state ran.
        assert_eq!(result.execution_stats.states_executed, 3);
        assert_eq!(ctx.variables.get("a_done"), Some(&json!(true)));
        assert_eq!(ctx.variables.get("b_done"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_degrades_to_sequential_without_parallelism() {
        let workflow = WorkflowBuilder::new("wf-seq")
            .state(stamp_state("only", true))
            .state(StateBuilder::end("end").build())
            .transition("only", "end")
            .build();

        let (result, _ctx) = run(workflow).await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.execution_stats.states_executed, 2);
    }

    #[tokio::test]
    async fn test_member_failure_fails_the_group() {
        let failing = StateBuilder::task("bad")
            .initial()
            .action(
                ActionDef::new("nope", ActionKind::PluginInvoke)
                    .with_config("plugin", json!("missing")),
            )
            .build();
        let workflow = WorkflowBuilder::new("wf-par-fail")
            .state(stamp_state("good", true))
            .state(failing)
            .state(StateBuilder::end("join").build())
            .transition("good", "join")
            .transition("bad", "join")
            .build();

        let (result, _ctx) = run(workflow).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.first_error().is_some());
    }

    #[tokio::test]
    async fn test_divergent_group_is_rejected() {
        let workflow = WorkflowBuilder::new("wf-diverge")
            .state(stamp_state("a", true))
            .state(stamp_state("b", true))
            .state(StateBuilder::end("x").build())
            .state(StateBuilder::end("y").build())
            .transition("a", "x")
            .transition("b", "y")
            .build();

        let workflow = Arc::new(workflow);
        let handlers = Arc::new(HandlerRegistry::new());
        handlers
            .register_plugin(Arc::new(StampPlugin), json!({}))
            .await
            .unwrap();
        let execution = crate::execution::Execution::new("wf-diverge", json!({}), None);
        let mut ctx = ExecutionContext::new(
            &execution,
            VariableStore::new(),
            Arc::new(EventBus::new()),
            handlers,
            Arc::new(ServiceLocator::new()),
            CancellationToken::new(),
        );
        let outcome = ParallelStrategy::new()
            .execute(workflow, NodeRegistry::new(), &mut ctx)
            .await;
        assert!(matches!(outcome, Err(EngineError::InvalidState(_))));
    }
}
