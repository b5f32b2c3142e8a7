//! # Execution Strategies
//!
//! A strategy walks the state graph of a workflow and produces an
//! [`ExecutionResult`]. Strategies are interchangeable: the engine holds
//! exactly one at a time and can be reconfigured between executions.
//!
//! - [`sequential::SequentialStrategy`]: one active node at a time,
//!   highest-priority eligible transition after each state
//! - [`parallel::ParallelStrategy`]: concurrent initial groups with a join,
//!   degrading to sequential for workflows that declare no parallelism
//! - [`adaptive::AdaptiveStrategy`]: inspects the workflow and picks one of
//!   the above, emitting a `strategy.selected` event with its rationale

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::EngineResult;
use crate::definition::{Transition, Workflow};
use crate::execution::{ExecutionContext, ExecutionStatus};
use crate::expr;
use crate::node::NodeRegistry;
use crate::variables::VariableStore;

pub mod adaptive;
pub mod parallel;
pub mod sequential;

pub use adaptive::AdaptiveStrategy;
pub use parallel::ParallelStrategy;
pub use sequential::SequentialStrategy;

/// Wall-clock and work counters for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub states_executed: u64,
    pub actions_executed: u64,
    pub retries: u64,
}

impl ExecutionStats {
    /// Fresh counters starting now.
    pub fn started() -> Self {
        let now = Utc::now();
        Self {
            start_time: now,
            end_time: now,
            duration_ms: 0,
            states_executed: 0,
            actions_executed: 0,
            retries: 0,
        }
    }

    /// Stamp the end time and duration.
    pub fn finish(&mut self) {
        self.end_time = Utc::now();
        self.duration_ms = (self.end_time - self.start_time).num_milliseconds().max(0) as u64;
    }
}

/// Outcome of one state visit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateExecutionRecord {
    pub state_id: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a strategy hands back to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output_data: Value,
    pub execution_stats: ExecutionStats,
    pub state_history: Vec<StateExecutionRecord>,
}

impl ExecutionResult {
    /// The error recorded on the first failed state, if any.
    pub fn first_error(&self) -> Option<&str> {
        self.state_history
            .iter()
            .find_map(|record| record.error.as_deref())
    }
}

/// The policy for walking a workflow graph.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// Strategy name, used in events and logs.
    fn name(&self) -> &'static str;

    /// Drive the workflow to a terminal status.
    async fn execute(
        &self,
        workflow: Arc<Workflow>,
        registry: Arc<NodeRegistry>,
        ctx: &mut ExecutionContext,
    ) -> EngineResult<ExecutionResult>;
}

/// Pick the transition to take out of a state: the highest-priority one whose
/// guard and condition both hold, with definition order as the tie-break.
pub(crate) fn select_transition<'a>(
    workflow: &'a Workflow,
    state_id: &str,
    vars: &VariableStore,
) -> EngineResult<Option<&'a Transition>> {
    for transition in workflow.transitions_from(state_id) {
        if let Some(guard) = &transition.guard {
            if !expr::evaluate_bool(guard, vars)? {
                continue;
            }
        }
        match &transition.condition {
            Some(condition) => {
                if expr::evaluate_bool(condition, vars)? {
                    return Ok(Some(transition));
                }
            }
            None => return Ok(Some(transition)),
        }
    }
    Ok(None)
}
