//! Adaptive strategy: inspects the workflow and picks sequential or parallel.
//!
//! The analysis looks at graph size, branching factor and declared
//! parallelisability (parallel nodes, concurrent initial states). Small or
//! non-parallelisable workflows run sequentially; everything else runs under
//! the parallel strategy. The choice and its rationale are emitted as a
//! `strategy.selected` event before execution starts.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::EngineResult;
use crate::definition::{StateKind, Workflow};
use crate::execution::ExecutionContext;
use crate::node::NodeRegistry;
use crate::strategy::{
    ExecutionResult, ExecutionStrategy, ParallelStrategy, SequentialStrategy,
};

const DEFAULT_SMALL_WORKFLOW_STATES: usize = 5;

/// Per-workflow analysis backing the selection.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowAnalysis {
    pub state_count: usize,
    pub transition_count: usize,
    /// Largest number of outgoing transitions from any single state.
    pub max_branching: usize,
    pub parallel_node_count: usize,
    pub initial_state_count: usize,
    pub parallelizable: bool,
}

impl WorkflowAnalysis {
    /// Inspect a workflow definition.
    pub fn of(workflow: &Workflow) -> Self {
        let max_branching = workflow
            .states
            .iter()
            .map(|s| workflow.transitions.iter().filter(|t| t.from == s.id).count())
            .max()
            .unwrap_or(0);
        let parallel_node_count = workflow
            .states
            .iter()
            .filter(|s| s.kind == StateKind::Parallel)
            .count();
        let initial_state_count = workflow.initial_states().len();
        Self {
            state_count: workflow.states.len(),
            transition_count: workflow.transitions.len(),
            max_branching,
            parallel_node_count,
            initial_state_count,
            parallelizable: initial_state_count > 1 || parallel_node_count > 0,
        }
    }
}

/// Selects a concrete strategy per execution.
pub struct AdaptiveStrategy {
    small_workflow_states: usize,
    sequential: SequentialStrategy,
    parallel: ParallelStrategy,
}

impl Default for AdaptiveStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveStrategy {
    /// An adaptive selector with the default size threshold.
    pub fn new() -> Self {
        Self {
            small_workflow_states: DEFAULT_SMALL_WORKFLOW_STATES,
            sequential: SequentialStrategy::new(),
            parallel: ParallelStrategy::new(),
        }
    }

    /// Workflows with fewer states than this always run sequentially.
    pub fn with_small_workflow_states(mut self, states: usize) -> Self {
        self.small_workflow_states = states;
        self
    }

    /// The strategy name the analysis selects, with a human-readable reason.
    pub fn select(&self, analysis: &WorkflowAnalysis) -> (&'static str, String) {
        if !analysis.parallelizable {
            return (
                self.sequential.name(),
                "workflow declares no parallelism".to_string(),
            );
        }
        if analysis.state_count < self.small_workflow_states {
            return (
                self.sequential.name(),
                format!(
                    "workflow is small ({} states < {})",
                    analysis.state_count, self.small_workflow_states
                ),
            );
        }
        (
            self.parallel.name(),
            format!(
                "{} initial states, {} parallel nodes",
                analysis.initial_state_count, analysis.parallel_node_count
            ),
        )
    }
}

#[async_trait]
impl ExecutionStrategy for AdaptiveStrategy {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    async fn execute(
        &self,
        workflow: Arc<Workflow>,
        registry: Arc<NodeRegistry>,
        ctx: &mut ExecutionContext,
    ) -> EngineResult<ExecutionResult> {
        let analysis = WorkflowAnalysis::of(&workflow);
        let (selected, rationale) = self.select(&analysis);
        debug!(workflow = %workflow.id, selected, %rationale, "strategy selected");

        ctx.emit(
            "strategy.selected",
            json!({
                "strategy": selected,
                "rationale": rationale,
                "analysis": {
                    "stateCount": analysis.state_count,
                    "transitionCount": analysis.transition_count,
                    "maxBranching": analysis.max_branching,
                    "parallelNodeCount": analysis.parallel_node_count,
                    "initialStateCount": analysis.initial_state_count,
                    "parallelizable": analysis.parallelizable,
                },
            }),
        )
        .await;

        if selected == self.parallel.name() {
            self.parallel.execute(workflow, registry, ctx).await
        } else {
            self.sequential.execute(workflow, registry, ctx).await
        }
    }
}
