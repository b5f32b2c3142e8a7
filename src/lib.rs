//! # Railflow
//!
//! A self-healing workflow execution engine. Railflow loads declarative
//! workflow definitions (directed graphs of states connected by conditional
//! transitions), instantiates them as executions driven by input and events,
//! and walks each graph while enforcing concurrency limits, retry and timeout
//! policies, and failure-recovery semantics.
//!
//! ## Architecture
//!
//! - **Definitions** ([`definition`]): the immutable workflow model:
//!   states, transitions, variables, triggers, retry policies.
//! - **Expressions** ([`expr`]): a sandboxed evaluator for transition
//!   conditions, guards and loop iterators. No host-language escape hatch.
//! - **Node executors** ([`node`]): task, condition, loop and parallel
//!   executors behind one `execute(context, input) -> NodeResult` contract,
//!   constructed through a registry keyed on state kind.
//! - **Strategies** ([`strategy`]): sequential, parallel and adaptive graph
//!   walks, interchangeable per execution.
//! - **Engine** ([`engine`]): validation, admission control, context
//!   hydration, lifecycle events, plugin hosting, shutdown.
//! - **Events** ([`event`]): a typed pub/sub bus with priority ordering,
//!   prefix patterns, one-shot `wait_for`, and correlation ids.
//! - **Self-healing** ([`healing`]): circuit breakers, bulkheads, retries,
//!   health checks, graceful degradation and recovery rules.
//! - **Storage façade** ([`storage`]): the persistence surface the engine
//!   writes through; implementations live outside the crate.
//!
//! ## Example
//!
//! ```rust
//! use railflow::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let workflow = WorkflowBuilder::new("hello")
//!     .state(
//!         StateBuilder::task("greet")
//!             .initial()
//!             .action(ActionDef::wait("pause", 1))
//!             .build(),
//!     )
//!     .state(StateBuilder::end("done").build())
//!     .transition("greet", "done")
//!     .build();
//!
//! let engine = WorkflowEngine::new(EngineConfig::default());
//! let execution =
//!     tokio_test::block_on(engine.execute(Arc::new(workflow), json!({}), None)).unwrap();
//! assert_eq!(execution.status, ExecutionStatus::Completed);
//! ```

pub mod definition;
pub mod engine;
pub mod event;
pub mod execution;
pub mod expr;
pub mod healing;
pub mod node;
pub mod plugin;
pub mod services;
pub mod storage;
pub mod strategy;
pub mod variables;

// ============================================================================
// CORE RE-EXPORTS
// ============================================================================

pub use definition::{
    ActionDef, ActionKind, BackoffStrategy, RetryPolicy, State, StateBuilder, StateKind,
    Transition, Trigger, TriggerCondition, TriggerKind, VariableDef, VariableType, Workflow,
    WorkflowBuilder,
};
pub use engine::{EngineConfig, WorkflowEngine};
pub use event::{
    BusEvent, EmissionResult, EventBus, EventMetadata, SubscribeOptions, SubscriptionHandle,
};
pub use execution::{Execution, ExecutionContext, ExecutionEvent, ExecutionStatus};
pub use expr::{Evaluated, EvaluationError};
pub use healing::{
    CircuitBreakerConfig, CircuitState, HealthState, OrchestratorConfig, RecoveryAction,
    RecoveryRule, SelfHealingOrchestrator, ServiceLevel,
};
pub use node::{NodeEstimate, NodeExecutor, NodeRegistry, NodeResult};
pub use plugin::{HandlerRegistry, Plugin, PluginContext, PluginResult};
pub use services::ServiceLocator;
pub use storage::{MemoryStore, WorkflowStore};
pub use strategy::{
    AdaptiveStrategy, ExecutionResult, ExecutionStats, ExecutionStrategy, ParallelStrategy,
    SequentialStrategy, StateExecutionRecord,
};
pub use variables::{VariableDelta, VariableStore};

/// Commonly used external types
pub use serde_json::Value as JsonValue;

// ============================================================================
// ERROR HANDLING
// ============================================================================

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// The error kinds surfaced at the public boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// No workflow registered under the given id
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// No execution known under the given id
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// The operation is not valid for the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A plugin failed to initialise or execute
    #[error("plugin error: {0}")]
    Plugin(String),

    /// A workflow definition violated a structural invariant
    #[error("validation error: {0}")]
    Validation(String),

    /// An operation exceeded its time budget
    #[error("timeout: {0}")]
    Timeout(String),

    /// The caller is not allowed to perform the operation
    #[error("authorization error: {0}")]
    Authorization(String),

    /// An execution terminated abnormally
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The engine or a component is misconfigured
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A network dependency failed
    #[error("network error: {0}")]
    Network(String),

    /// The engine's concurrency cap is reached; the caller must back off
    #[error("capacity exceeded: at most {limit} concurrent executions")]
    CapacityExceeded { limit: usize },

    /// The named service's circuit breaker is open
    #[error("circuit open for service '{service}'")]
    CircuitOpen { service: String },

    /// The named bulkhead pool has no free slots
    #[error("bulkhead '{pool}' is full")]
    BulkheadFull { pool: String },

    /// An expression could not be parsed or evaluated
    #[error("evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),
}

impl EngineError {
    /// Stable kind tag, used by retry policies to classify errors.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::WorkflowNotFound(_) => "workflow_not_found",
            EngineError::ExecutionNotFound(_) => "execution_not_found",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::Plugin(_) => "plugin",
            EngineError::Validation(_) => "validation",
            EngineError::Timeout(_) => "timeout",
            EngineError::Authorization(_) => "authorization",
            EngineError::ExecutionFailed(_) => "execution_failed",
            EngineError::Configuration(_) => "configuration",
            EngineError::Network(_) => "network",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::CircuitOpen { .. } => "circuit_open",
            EngineError::BulkheadFull { .. } => "bulkhead_full",
            EngineError::Evaluation(_) => "evaluation",
        }
    }

    /// Whether the error is transient by default (timeouts and network
    /// failures). Plugins widen this set by tagging their results retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Timeout(_) | EngineError::Network(_))
    }
}

/// Convenient re-exports for common types and traits
pub mod prelude {
    pub use crate::definition::{
        ActionDef, ActionKind, BackoffStrategy, RetryPolicy, State, StateBuilder, StateKind,
        Transition, Trigger, TriggerKind, VariableType, Workflow, WorkflowBuilder,
    };
    pub use crate::engine::{EngineConfig, WorkflowEngine};
    pub use crate::event::{EventBus, EventMetadata, SubscribeOptions};
    pub use crate::execution::{Execution, ExecutionContext, ExecutionStatus};
    pub use crate::healing::{
        CircuitBreakerConfig, CircuitState, OrchestratorConfig, SelfHealingOrchestrator,
    };
    pub use crate::node::{NodeExecutor, NodeRegistry, NodeResult};
    pub use crate::plugin::{Plugin, PluginContext, PluginResult};
    pub use crate::services::ServiceLocator;
    pub use crate::storage::{MemoryStore, WorkflowStore};
    pub use crate::strategy::{
        AdaptiveStrategy, ExecutionResult, ExecutionStrategy, ParallelStrategy,
        SequentialStrategy,
    };
    pub use crate::variables::{VariableDelta, VariableStore};
    pub use crate::{EngineError, EngineResult};
}
