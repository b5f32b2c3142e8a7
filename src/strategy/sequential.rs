//! Sequential strategy: one active node at a time.
//!
//! Starts at the initial state, executes it, applies the node's variable
//! delta, then follows the highest-priority eligible transition. Terminates
//! when a state is final, when no eligible transition remains, or on failure.
//! `state.entered` / `state.completed` events bracket every visit.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::definition::Workflow;
use crate::execution::{ExecutionContext, ExecutionStatus};
use crate::node::NodeRegistry;
use crate::strategy::{
    ExecutionResult, ExecutionStats, ExecutionStrategy, StateExecutionRecord, select_transition,
};
use crate::{EngineError, EngineResult};

const DEFAULT_MAX_STEPS: usize = 10_000;

/// Single-active-node graph walk.
pub struct SequentialStrategy {
    max_steps: usize,
}

impl Default for SequentialStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl SequentialStrategy {
    /// A walker with the default step limit.
    pub fn new() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Override the runaway-execution step limit.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Walk the graph from `start_state_id`, accumulating into the given
    /// stats and history. Also used by the parallel strategy after a join.
    pub(crate) async fn walk(
        &self,
        workflow: &Arc<Workflow>,
        registry: &Arc<NodeRegistry>,
        ctx: &mut ExecutionContext,
        start_state_id: &str,
        stats: &mut ExecutionStats,
        history: &mut Vec<StateExecutionRecord>,
    ) -> EngineResult<ExecutionStatus> {
        let mut current_id = start_state_id.to_string();
        let mut steps = 0usize;

        loop {
            if ctx.cancellation().is_cancelled() {
                return Ok(ExecutionStatus::Cancelled);
            }
            if steps >= self.max_steps {
                return Err(EngineError::ExecutionFailed(format!(
                    "workflow '{}' exceeded {} steps",
                    workflow.id, self.max_steps
                )));
            }
            steps += 1;

            let state = workflow.state(&current_id).ok_or_else(|| {
                EngineError::InvalidState(format!(
                    "workflow '{}' has no state '{}'",
                    workflow.id, current_id
                ))
            })?;

            ctx.emit_scoped(
                "state.entered",
                json!({ "stateId": state.id }),
                Some(state.id.clone()),
                None,
            )
            .await;

            let executor = registry.build(state, workflow)?;
            let started_at = Utc::now();
            let started = Instant::now();
            let result = executor.execute(ctx, Value::Null).await?;
            let duration_ms = started.elapsed().as_millis() as u64;

            stats.states_executed += 1;
            stats.actions_executed += result.meta_u64("actionsAttempted");
            stats.retries += result.meta_u64("retries");
            ctx.variables.apply(&result.variable_delta);

            history.push(StateExecutionRecord {
                state_id: state.id.clone(),
                success: result.success,
                started_at,
                duration_ms,
                error: result.error.clone(),
            });

            ctx.emit_scoped(
                "state.completed",
                json!({
                    "stateId": state.id,
                    "success": result.success,
                    "durationMs": duration_ms,
                }),
                Some(state.id.clone()),
                None,
            )
            .await;

            if !result.success {
                warn!(workflow = %workflow.id, state = %state.id, error = ?result.error, "state failed");
                return Ok(ExecutionStatus::Failed);
            }

            if result
                .metadata
                .get("shouldWait")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                debug!(workflow = %workflow.id, state = %state.id, "execution moved to waiting");
                return Ok(ExecutionStatus::Waiting);
            }

            if state.is_final {
                return Ok(ExecutionStatus::Completed);
            }

            // A node-issued routing decision wins over transition selection.
            let next_id = match result.next_node_id {
                Some(next) => {
                    if workflow.state(&next).is_none() {
                        return Err(EngineError::InvalidState(format!(
                            "state '{}' routed to unknown state '{}'",
                            state.id, next
                        )));
                    }
                    Some(next)
                }
                None => select_transition(workflow, &state.id, &ctx.variables)?
                    .map(|t| t.to.clone()),
            };

            match next_id {
                Some(next) => current_id = next,
                // No eligible transition left: the walk ends normally.
                None => return Ok(ExecutionStatus::Completed),
            }
        }
    }
}

#[async_trait]
impl ExecutionStrategy for SequentialStrategy {
    fn name(&self) -> &'static str {
        "sequential"
    }

    async fn execute(
        &self,
        workflow: Arc<Workflow>,
        registry: Arc<NodeRegistry>,
        ctx: &mut ExecutionContext,
    ) -> EngineResult<ExecutionResult> {
        let mut stats = ExecutionStats::started();
        let mut history = Vec::new();

        let start_id = workflow
            .initial_states()
            .first()
            .map(|s| s.id.clone())
            .ok_or_else(|| {
                EngineError::Validation(format!("workflow '{}' has no initial state", workflow.id))
            })?;

        let status = self
            .walk(&workflow, &registry, ctx, &start_id, &mut stats, &mut history)
            .await?;
        stats.finish();

        Ok(ExecutionResult {
            status,
            output_data: Value::Object(
                ctx.variables
                    .values()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            execution_stats: stats,
            state_history: history,
        })
    }
}
