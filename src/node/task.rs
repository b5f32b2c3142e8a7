//! Task node: runs the state's ordered action list.
//!
//! Per action: evaluate the optional guard (skip when false), dispatch to the
//! handler registered for the action kind, merge the returned variable delta,
//! and on failure retry under the action's policy (falling back to the
//! node's). Exhausted retries either abort the node with the first error or,
//! with `continueOnError` set, record the failure and move on.
//!
//! A node-level timeout cancels the in-flight action and fails the node with
//! a timeout error. The result metadata carries the attempted / succeeded /
//! failed / skipped counters and the total retry count.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use crate::definition::{ActionDef, ActionKind, RetryPolicy, State, StateKind};
use crate::execution::ExecutionContext;
use crate::expr;
use crate::node::{NodeEstimate, NodeExecutor, NodeResult, NodeSpec};
use crate::plugin::PluginContext;
use crate::variables::{VariableDelta, VariableStore};
use crate::{EngineError, EngineResult};

/// Executes a state's ordered action list.
pub struct TaskNode {
    state: State,
    continue_on_error: bool,
}

struct ActionFailure {
    message: String,
    kind: &'static str,
    retriable_hint: bool,
}

struct ActionLoopOutcome {
    delta: VariableDelta,
    next_node_id: Option<String>,
    should_wait: bool,
    attempted: u64,
    succeeded: u64,
    failed: u64,
    skipped: u64,
    retries: u64,
    first_error: Option<String>,
}

impl TaskNode {
    /// Build from a node spec.
    pub fn from_spec(spec: NodeSpec) -> Self {
        let continue_on_error = spec.state.config_bool("continueOnError").unwrap_or(false);
        Self {
            state: spec.state,
            continue_on_error,
        }
    }

    /// Build a wait-state wrapper: a task whose single action sleeps for the
    /// state's configured duration (unless the state declares actions).
    pub fn wait_from_spec(spec: NodeSpec) -> Self {
        let mut state = spec.state;
        if state.actions.is_empty() {
            let duration_ms = state.config_u64("durationMs").unwrap_or(0);
            state.actions.push(
                ActionDef::new(format!("{}-wait", state.id), ActionKind::Wait)
                    .with_config("durationMs", Value::from(duration_ms)),
            );
        }
        Self {
            continue_on_error: state.config_bool("continueOnError").unwrap_or(false),
            state,
        }
    }

    fn effective_policy<'a>(&'a self, action: &'a ActionDef) -> Option<&'a RetryPolicy> {
        action.retry_policy.as_ref().or(self.state.retry_policy.as_ref())
    }

    async fn run_actions(&self, ctx: &ExecutionContext) -> EngineResult<ActionLoopOutcome> {
        // Work on a branch-local copy so each action observes its
        // predecessors' writes while the delta stays explicit.
        let mut vars = ctx.variables.clone();
        let mut outcome = ActionLoopOutcome {
            delta: VariableDelta::new(),
            next_node_id: None,
            should_wait: false,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            retries: 0,
            first_error: None,
        };

        for action in &self.state.actions {
            ctx.check_cancelled()?;

            if let Some(guard) = &action.guard {
                match expr::evaluate_bool(guard, &vars) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(action = %action.id, "action skipped by guard");
                        outcome.skipped += 1;
                        continue;
                    }
                    Err(e) => {
                        // Expression failures are never retried.
                        outcome.attempted += 1;
                        outcome.failed += 1;
                        let message = format!("guard of action '{}' failed: {}", action.id, e);
                        if self.continue_on_error {
                            outcome.first_error.get_or_insert(message);
                            continue;
                        }
                        outcome.first_error = Some(message);
                        return Ok(outcome);
                    }
                }
            }

            outcome.attempted += 1;
            match self.run_action_with_retries(ctx, action, &vars, &mut outcome.retries).await? {
                Ok(result) => {
                    outcome.succeeded += 1;
                    if let Some(variables) = result.variables {
                        for (name, value) in variables {
                            vars.set(name.clone(), value.clone());
                            outcome.delta.set(name, value);
                        }
                    }
                    if let Some(next_state) = result.next_state {
                        outcome.next_node_id = Some(next_state);
                    }
                    if result.should_wait {
                        outcome.should_wait = true;
                    }
                }
                Err(failure) => {
                    outcome.failed += 1;
                    let message =
                        format!("action '{}' failed: {}", action.id, failure.message);
                    if self.continue_on_error {
                        warn!(action = %action.id, error = %failure.message, "action failed, continuing");
                        outcome.first_error.get_or_insert(message);
                        continue;
                    }
                    outcome.first_error = Some(message);
                    return Ok(outcome);
                }
            }
        }

        Ok(outcome)
    }

    /// Run one action, retrying under its effective policy. The outer
    /// `EngineResult` carries cancellation; the inner result is the action's
    /// business outcome.
    async fn run_action_with_retries(
        &self,
        ctx: &ExecutionContext,
        action: &ActionDef,
        vars: &VariableStore,
        retries: &mut u64,
    ) -> EngineResult<Result<crate::plugin::PluginResult, ActionFailure>> {
        let policy = self.effective_policy(action);
        let max_attempts = policy.map(|p| p.max_attempts.max(1)).unwrap_or(1);
        let mut attempt = 1u32;

        loop {
            ctx.check_cancelled()?;
            match self.dispatch(ctx, action, vars).await {
                Ok(result) if result.success => return Ok(Ok(result)),
                Ok(result) => {
                    ctx.check_cancelled()?;
                    let failure = ActionFailure {
                        message: result
                            .error
                            .clone()
                            .unwrap_or_else(|| "action handler reported failure".to_string()),
                        kind: "plugin",
                        retriable_hint: result.should_retry,
                    };
                    if !self.should_retry(policy, &failure, attempt, max_attempts) {
                        return Ok(Err(failure));
                    }
                }
                Err(error) => {
                    ctx.check_cancelled()?;
                    let failure = ActionFailure {
                        kind: error.kind(),
                        retriable_hint: false,
                        message: error.to_string(),
                    };
                    if !self.should_retry(policy, &failure, attempt, max_attempts) {
                        return Ok(Err(failure));
                    }
                }
            }

            let delay = policy
                .map(|p| p.delay_for(attempt))
                .unwrap_or(Duration::ZERO);
            debug!(action = %action.id, attempt, ?delay, "retrying action");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancellation().cancelled() => {
                    return Err(EngineError::ExecutionFailed(format!(
                        "execution '{}' was cancelled",
                        ctx.execution_id
                    )));
                }
            }
            *retries += 1;
            attempt += 1;
        }
    }

    fn should_retry(
        &self,
        policy: Option<&RetryPolicy>,
        failure: &ActionFailure,
        attempt: u32,
        max_attempts: u32,
    ) -> bool {
        if attempt >= max_attempts {
            return false;
        }
        match policy {
            Some(policy) => failure.retriable_hint || policy.applies_to(failure.kind),
            None => false,
        }
    }

    /// Resolve the handler for the action and invoke it, applying the
    /// per-action timeout if one is declared.
    async fn dispatch(
        &self,
        ctx: &ExecutionContext,
        action: &ActionDef,
        vars: &VariableStore,
    ) -> EngineResult<crate::plugin::PluginResult> {
        let handler = ctx.handlers().resolve(action.kind, &action.config)?;
        let plugin_ctx = PluginContext {
            execution_id: ctx.execution_id.clone(),
            workflow_id: ctx.workflow_id.clone(),
            user_id: ctx.user_id.clone(),
            input: Value::Object(action.config.clone()),
            variables: vars.clone(),
            services: ctx.services(),
            cancellation: ctx.cancellation().clone(),
        };

        match action.timeout_ms {
            Some(timeout_ms) => {
                match tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    handler.execute(plugin_ctx),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Timeout(format!(
                        "action '{}' timed out after {}ms",
                        action.id, timeout_ms
                    ))),
                }
            }
            None => handler.execute(plugin_ctx).await,
        }
    }
}

#[async_trait]
impl NodeExecutor for TaskNode {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn name(&self) -> &str {
        &self.state.name
    }

    fn kind(&self) -> StateKind {
        self.state.kind
    }

    fn validate(&self) -> EngineResult<()> {
        for action in &self.state.actions {
            if action.kind == ActionKind::PluginInvoke
                && action.config.get("plugin").and_then(|v| v.as_str()).is_none()
            {
                return Err(EngineError::Validation(format!(
                    "action '{}' in state '{}' is missing the 'plugin' config entry",
                    action.id, self.state.id
                )));
            }
        }
        Ok(())
    }

    fn estimate(&self) -> NodeEstimate {
        let wait_ms: u64 = self
            .state
            .actions
            .iter()
            .filter(|a| matches!(a.kind, ActionKind::Wait | ActionKind::Timer))
            .filter_map(|a| a.config.get("durationMs").and_then(|v| v.as_u64()))
            .sum();
        NodeEstimate {
            expected_duration_ms: wait_ms + 10 * self.state.actions.len() as u64,
            parallelizable: false,
        }
    }

    async fn execute(&self, ctx: &mut ExecutionContext, _input: Value) -> EngineResult<NodeResult> {
        ctx.check_cancelled()?;

        let outcome = match self.state.timeout_ms {
            Some(timeout_ms) => {
                match tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    self.run_actions(ctx),
                )
                .await
                {
                    Ok(outcome) => outcome?,
                    Err(_) => {
                        // Dropping the action-loop future abandons the
                        // in-flight action at its next suspension point.
                        return Ok(NodeResult::fail(format!(
                            "state '{}' timed out after {}ms",
                            self.state.id, timeout_ms
                        ))
                        .with_meta("timedOut", Value::Bool(true)));
                    }
                }
            }
            None => self.run_actions(ctx).await?,
        };

        let aborted = outcome.first_error.is_some() && !self.continue_on_error;
        let mut result = if aborted {
            NodeResult::fail(outcome.first_error.clone().unwrap_or_default())
        } else {
            NodeResult::ok(json!({ "actionsExecuted": outcome.succeeded }))
        };

        result.variable_delta = outcome.delta;
        result.next_node_id = outcome.next_node_id;
        if outcome.should_wait {
            result = result.with_meta("shouldWait", Value::Bool(true));
        }
        if self.continue_on_error {
            if let Some(error) = outcome.first_error {
                result = result.with_meta("absorbedError", Value::String(error));
            }
        }
        Ok(result
            .with_meta("actionsAttempted", Value::from(outcome.attempted))
            .with_meta("actionsSucceeded", Value::from(outcome.succeeded))
            .with_meta("actionsFailed", Value::from(outcome.failed))
            .with_meta("actionsSkipped", Value::from(outcome.skipped))
            .with_meta("retries", Value::from(outcome.retries)))
    }
}
