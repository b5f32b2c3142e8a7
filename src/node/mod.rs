//! # Node Executors
//!
//! Each state kind is realised by a node executor with one operation:
//! `execute(context, input) -> NodeResult`. Executors are constructed by a
//! registry keyed on the state kind string, so new kinds can be plugged in
//! without touching the strategies that drive them.
//!
//! ## Built-in executors
//!
//! - [`task::TaskNode`]: ordered action list with guards, per-action retry
//!   policies and continue-on-error
//! - [`condition::ConditionNode`]: one-shot expression routing
//! - [`looping::LoopNode`]: while / for / foreach with iteration caps
//! - [`parallel::ParallelNode`]: bounded concurrent fan-out over child states
//!
//! `wait` states run through a single-action task wrapper, `end` states are a
//! no-op, and `subprocess` states execute their action list like a task with
//! the subprocess action dispatched to an externally registered handler.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::definition::{State, StateKind, Workflow};
use crate::execution::ExecutionContext;
use crate::variables::VariableDelta;
use crate::{EngineError, EngineResult};

pub mod condition;
pub mod looping;
pub mod parallel;
pub mod task;

pub use condition::ConditionNode;
pub use looping::LoopNode;
pub use parallel::ParallelNode;
pub use task::TaskNode;

/// What a node reports back to the strategy that drove it.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub success: bool,
    pub data: Value,
    /// Explicit routing decision, overriding transition selection.
    pub next_node_id: Option<String>,
    /// Variable writes to fold into the execution's store.
    pub variable_delta: VariableDelta,
    /// Executor-specific counters and flags.
    pub metadata: HashMap<String, Value>,
    pub error: Option<String>,
}

impl NodeResult {
    /// A successful result with payload data.
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            next_node_id: None,
            variable_delta: VariableDelta::new(),
            metadata: HashMap::new(),
            error: None,
        }
    }

    /// A failed result with an error message.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            next_node_id: None,
            variable_delta: VariableDelta::new(),
            metadata: HashMap::new(),
            error: Some(error.into()),
        }
    }

    /// Attach a routing decision.
    pub fn with_next(mut self, next_node_id: impl Into<String>) -> Self {
        self.next_node_id = Some(next_node_id.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Read a numeric metadata counter, defaulting to zero.
    pub fn meta_u64(&self, key: &str) -> u64 {
        self.metadata.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
    }
}

/// Cost estimate used by the adaptive strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeEstimate {
    pub expected_duration_ms: u64,
    pub parallelizable: bool,
}

/// The fixed contract every node executor implements.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// The id of the state this executor realises.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// The state kind.
    fn kind(&self) -> StateKind;

    /// Check the executor's configuration without running it.
    fn validate(&self) -> EngineResult<()>;

    /// Cost estimate for strategy selection.
    fn estimate(&self) -> NodeEstimate;

    /// Run the node against the execution context.
    async fn execute(&self, ctx: &mut ExecutionContext, input: Value) -> EngineResult<NodeResult>;
}

/// Everything a factory needs to build an executor for one state.
pub struct NodeSpec {
    pub state: State,
    pub workflow: Arc<Workflow>,
    pub registry: Arc<NodeRegistry>,
}

type NodeFactory = Box<dyn Fn(NodeSpec) -> EngineResult<Box<dyn NodeExecutor>> + Send + Sync>;

/// Registry constructing node executors by state kind.
pub struct NodeRegistry {
    factories: std::sync::RwLock<HashMap<&'static str, NodeFactory>>,
}

impl NodeRegistry {
    /// A registry pre-wired with the built-in executors.
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Self {
            factories: std::sync::RwLock::new(HashMap::new()),
        });

        registry.register(StateKind::Task, |spec| {
            Ok(Box::new(TaskNode::from_spec(spec)) as Box<dyn NodeExecutor>)
        });
        registry.register(StateKind::Subprocess, |spec| {
            Ok(Box::new(TaskNode::from_spec(spec)) as Box<dyn NodeExecutor>)
        });
        registry.register(StateKind::Wait, |spec| {
            Ok(Box::new(TaskNode::wait_from_spec(spec)) as Box<dyn NodeExecutor>)
        });
        registry.register(StateKind::Condition, |spec| {
            Ok(Box::new(ConditionNode::from_spec(spec)) as Box<dyn NodeExecutor>)
        });
        registry.register(StateKind::Loop, |spec| {
            Ok(Box::new(LoopNode::from_spec(spec)) as Box<dyn NodeExecutor>)
        });
        registry.register(StateKind::Parallel, |spec| {
            Ok(Box::new(ParallelNode::from_spec(spec)) as Box<dyn NodeExecutor>)
        });
        registry.register(StateKind::End, |spec| {
            Ok(Box::new(EndNode {
                id: spec.state.id,
                name: spec.state.name,
            }) as Box<dyn NodeExecutor>)
        });

        registry
    }

    /// Install a factory for a state kind, replacing any previous one.
    pub fn register<F>(&self, kind: StateKind, factory: F)
    where
        F: Fn(NodeSpec) -> EngineResult<Box<dyn NodeExecutor>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .expect("node registry lock poisoned")
            .insert(kind.as_str(), Box::new(factory));
    }

    /// Build the executor for a state.
    pub fn build(
        self: &Arc<Self>,
        state: &State,
        workflow: &Arc<Workflow>,
    ) -> EngineResult<Box<dyn NodeExecutor>> {
        let factories = self.factories.read().expect("node registry lock poisoned");
        let factory = factories.get(state.kind.as_str()).ok_or_else(|| {
            EngineError::Configuration(format!(
                "no node executor registered for state kind '{}'",
                state.kind.as_str()
            ))
        })?;
        factory(NodeSpec {
            state: state.clone(),
            workflow: workflow.clone(),
            registry: self.clone(),
        })
    }
}

/// Terminal no-op node for `end` states.
struct EndNode {
    id: String,
    name: String,
}

#[async_trait]
impl NodeExecutor for EndNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StateKind {
        StateKind::End
    }

    fn validate(&self) -> EngineResult<()> {
        Ok(())
    }

    fn estimate(&self) -> NodeEstimate {
        NodeEstimate::default()
    }

    async fn execute(&self, ctx: &mut ExecutionContext, _input: Value) -> EngineResult<NodeResult> {
        ctx.check_cancelled()?;
        Ok(NodeResult::ok(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{StateBuilder, WorkflowBuilder};
    use crate::event::EventBus;
    use crate::plugin::HandlerRegistry;
    use crate::services::ServiceLocator;
    use crate::variables::VariableStore;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn test_context(workflow_id: &str) -> ExecutionContext {
        let execution = crate::execution::Execution::new(workflow_id, json!({}), None);
        ExecutionContext::new(
            &execution,
            VariableStore::new(),
            Arc::new(EventBus::new()),
            Arc::new(HandlerRegistry::new()),
            Arc::new(ServiceLocator::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_registry_builds_every_builtin_kind() {
        let workflow = Arc::new(
            WorkflowBuilder::new("wf")
                .state(StateBuilder::task("t").initial().build())
                .state(StateBuilder::end("e").build())
                .build(),
        );
        let registry = NodeRegistry::new();

        for kind in [
            StateKind::Task,
            StateKind::Wait,
            StateKind::Condition,
            StateKind::Loop,
            StateKind::Parallel,
            StateKind::Subprocess,
            StateKind::End,
        ] {
            let state = StateBuilder::new("n", kind).build();
            let executor = registry.build(&state, &workflow).unwrap();
            assert_eq!(executor.kind(), kind);
            assert_eq!(executor.id(), "n");
        }
    }

    #[tokio::test]
    async fn test_end_node_is_a_no_op() {
        let workflow = Arc::new(
            WorkflowBuilder::new("wf")
                .state(StateBuilder::task("t").initial().build())
                .state(StateBuilder::end("e").build())
                .build(),
        );
        let registry = NodeRegistry::new();
        let executor = registry
            .build(workflow.state("e").unwrap(), &workflow)
            .unwrap();

        let mut ctx = test_context("wf");
        let result = executor.execute(&mut ctx, json!({})).await.unwrap();
        assert!(result.success);
        assert!(result.variable_delta.is_empty());
        assert!(result.next_node_id.is_none());
    }

    #[tokio::test]
    async fn test_custom_factory_registration_overrides() {
        let workflow = Arc::new(
            WorkflowBuilder::new("wf")
                .state(StateBuilder::task("t").initial().build())
                .state(StateBuilder::end("e").build())
                .build(),
        );
        let registry = NodeRegistry::new();
        registry.register(StateKind::End, |spec| {
            Ok(Box::new(EndNode {
                id: format!("custom-{}", spec.state.id),
                name: spec.state.name,
            }) as Box<dyn NodeExecutor>)
        });

        let executor = registry
            .build(workflow.state("e").unwrap(), &workflow)
            .unwrap();
        assert_eq!(executor.id(), "custom-e");
    }
}
