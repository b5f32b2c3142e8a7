//! Condition node: evaluates its expression once and routes to the
//! configured true / false / default target.
//!
//! Expression failures are not retried: they fall back to the default target
//! when one is configured, otherwise the node fails. The boolean outcome is
//! stored under the node's own id (`{ "conditionResult": … }`) so downstream
//! expressions can introspect it as `<nodeId>.conditionResult`.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::definition::{State, StateKind};
use crate::execution::ExecutionContext;
use crate::expr;
use crate::node::{NodeEstimate, NodeExecutor, NodeResult, NodeSpec};
use crate::{EngineError, EngineResult};

/// One-shot expression routing.
pub struct ConditionNode {
    state: State,
    expression: Option<String>,
    true_node_id: Option<String>,
    false_node_id: Option<String>,
    default_node_id: Option<String>,
}

impl ConditionNode {
    /// Build from a node spec.
    pub fn from_spec(spec: NodeSpec) -> Self {
        let expression = spec.state.config_str("expression").map(str::to_string);
        let true_node_id = spec.state.config_str("trueNodeId").map(str::to_string);
        let false_node_id = spec.state.config_str("falseNodeId").map(str::to_string);
        let default_node_id = spec.state.config_str("defaultNodeId").map(str::to_string);
        Self {
            state: spec.state,
            expression,
            true_node_id,
            false_node_id,
            default_node_id,
        }
    }
}

#[async_trait]
impl NodeExecutor for ConditionNode {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn name(&self) -> &str {
        &self.state.name
    }

    fn kind(&self) -> StateKind {
        StateKind::Condition
    }

    fn validate(&self) -> EngineResult<()> {
        let expression = self.expression.as_deref().ok_or_else(|| {
            EngineError::Validation(format!(
                "condition state '{}' is missing the 'expression' config entry",
                self.state.id
            ))
        })?;
        expr::parse(expression).map_err(|e| {
            EngineError::Validation(format!(
                "condition state '{}' has an invalid expression: {}",
                self.state.id, e
            ))
        })?;
        if self.true_node_id.is_none() && self.false_node_id.is_none() {
            return Err(EngineError::Validation(format!(
                "condition state '{}' routes nowhere: set trueNodeId or falseNodeId",
                self.state.id
            )));
        }
        Ok(())
    }

    fn estimate(&self) -> NodeEstimate {
        NodeEstimate {
            expected_duration_ms: 1,
            parallelizable: false,
        }
    }

    async fn execute(&self, ctx: &mut ExecutionContext, _input: Value) -> EngineResult<NodeResult> {
        ctx.check_cancelled()?;

        let expression = self.expression.as_deref().ok_or_else(|| {
            EngineError::Configuration(format!(
                "condition state '{}' has no expression",
                self.state.id
            ))
        })?;

        let verdict = match expr::evaluate_bool(expression, &ctx.variables) {
            Ok(verdict) => verdict,
            Err(e) => {
                // Evaluation failures route to the default target; without
                // one the node fails. Never retried.
                debug!(state = %self.state.id, error = %e, "condition evaluation failed");
                return match &self.default_node_id {
                    Some(default) => Ok(NodeResult::ok(json!({ "evaluationError": e.to_string() }))
                        .with_next(default.clone())
                        .with_meta("defaulted", Value::Bool(true))),
                    None => Ok(NodeResult::fail(format!(
                        "condition '{}' could not be evaluated: {}",
                        self.state.id, e
                    ))),
                };
            }
        };

        let target = if verdict {
            self.true_node_id.as_ref().or(self.default_node_id.as_ref())
        } else {
            self.false_node_id.as_ref().or(self.default_node_id.as_ref())
        };

        let mut result = NodeResult::ok(json!({ "conditionResult": verdict }));
        result
            .variable_delta
            .set(self.state.id.clone(), json!({ "conditionResult": verdict }));
        result = result.with_meta("conditionResult", Value::Bool(verdict));
        match target {
            Some(next) => Ok(result.with_next(next.clone())),
            None => Ok(result),
        }
    }
}
