//! # Workflow Engine
//!
//! The engine validates workflows before first use, admits executions under a
//! process-wide concurrency cap, hydrates the execution context (declared
//! defaults overlaid with the input payload), invokes the configured
//! strategy, persists the final record through the storage façade, and emits
//! workflow lifecycle events.
//!
//! Admission is a semaphore, not a queue: when `max_concurrent_executions`
//! permits are taken, further starts fail immediately with
//! `CapacityExceeded`. Queueing is the caller's responsibility.
//!
//! The engine holds exactly one strategy at a time; it can be swapped between
//! executions with [`WorkflowEngine::set_strategy`]. On shutdown, plugin
//! cleanup hooks run (errors logged and swallowed), the event bus is drained,
//! and in-flight executions are cancelled with a `cancelled` terminal status.

use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::definition::Workflow;
use crate::event::EventBus;
use crate::execution::{Execution, ExecutionContext, ExecutionStatus};
use crate::node::NodeRegistry;
use crate::plugin::{HandlerRegistry, Plugin};
use crate::services::ServiceLocator;
use crate::storage::{MemoryStore, WorkflowStore};
use crate::strategy::{ExecutionStrategy, SequentialStrategy};
use crate::variables::VariableStore;
use crate::{EngineError, EngineResult};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on concurrently running executions.
    pub max_concurrent_executions: usize,
    /// Optional per-execution timeout.
    pub execution_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 100,
            execution_timeout_ms: None,
        }
    }
}

/// The execution kernel: lifecycle, admission, plugin hosting.
pub struct WorkflowEngine {
    config: EngineConfig,
    events: Arc<EventBus>,
    handlers: Arc<HandlerRegistry>,
    services: Arc<ServiceLocator>,
    registry: Arc<NodeRegistry>,
    store: Arc<dyn WorkflowStore>,
    strategy: std::sync::RwLock<Arc<dyn ExecutionStrategy>>,
    admission: Arc<Semaphore>,
    validated: DashMap<String, ()>,
    in_flight: DashMap<String, CancellationToken>,
    shut_down: AtomicBool,
}

impl WorkflowEngine {
    /// An engine with in-memory storage and the sequential strategy.
    pub fn new(config: EngineConfig) -> Self {
        let max = config.max_concurrent_executions.max(1);
        Self {
            config,
            events: Arc::new(EventBus::new()),
            handlers: Arc::new(HandlerRegistry::new()),
            services: Arc::new(ServiceLocator::new()),
            registry: NodeRegistry::new(),
            store: MemoryStore::shared(),
            strategy: std::sync::RwLock::new(Arc::new(SequentialStrategy::new())),
            admission: Arc::new(Semaphore::new(max)),
            validated: DashMap::new(),
            in_flight: DashMap::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Replace the storage façade.
    pub fn with_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = store;
        self
    }

    /// Replace the service locator.
    pub fn with_services(mut self, services: Arc<ServiceLocator>) -> Self {
        self.services = services;
        self
    }

    /// Replace the strategy at construction time.
    pub fn with_strategy(self, strategy: Arc<dyn ExecutionStrategy>) -> Self {
        self.set_strategy(strategy);
        self
    }

    /// Swap the strategy between executions.
    pub fn set_strategy(&self, strategy: Arc<dyn ExecutionStrategy>) {
        *self.strategy.write().expect("strategy lock poisoned") = strategy;
    }

    /// The shared event bus.
    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// The handler and plugin registry.
    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        self.handlers.clone()
    }

    /// The node executor registry.
    pub fn nodes(&self) -> Arc<NodeRegistry> {
        self.registry.clone()
    }

    /// Register a plugin by name, initialising it with its configuration.
    pub async fn register_plugin(&self, plugin: Arc<dyn Plugin>, config: Value) -> EngineResult<()> {
        self.handlers.register_plugin(plugin, config).await
    }

    /// Executions currently running.
    pub fn active_executions(&self) -> usize {
        self.config
            .max_concurrent_executions
            .max(1)
            .saturating_sub(self.admission.available_permits())
    }

    /// Whether [`WorkflowEngine::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Validate a workflow: structural invariants plus per-state executor
    /// configuration. Cached per workflow id.
    pub fn validate_workflow(&self, workflow: &Arc<Workflow>) -> EngineResult<()> {
        if self.validated.contains_key(&workflow.id) {
            return Ok(());
        }
        workflow.validate()?;
        for state in &workflow.states {
            let executor = self.registry.build(state, workflow)?;
            executor.validate()?;
        }
        self.validated.insert(workflow.id.clone(), ());
        Ok(())
    }

    /// Seed a variable store from declared defaults overlaid with the input
    /// payload.
    fn hydrate(workflow: &Workflow, input: &Value) -> VariableStore {
        let mut variables = VariableStore::new();
        for declaration in &workflow.variables {
            variables.declare(declaration.name.clone(), declaration.var_type);
            if let Some(default_value) = &declaration.default_value {
                variables.set(declaration.name.clone(), default_value.clone());
            }
        }
        match input {
            Value::Object(map) => {
                for (key, value) in map {
                    variables.set(key.clone(), value.clone());
                }
            }
            Value::Null => {}
            other => variables.set("input", other.clone()),
        }
        variables
    }

    /// Run one execution of the workflow to a terminal status.
    ///
    /// Fails fast with `CapacityExceeded` when the concurrency cap is
    /// reached. The returned execution record has already been persisted.
    pub async fn execute(
        &self,
        workflow: Arc<Workflow>,
        input: Value,
        user_id: Option<String>,
    ) -> EngineResult<Execution> {
        if self.is_shut_down() {
            return Err(EngineError::InvalidState(
                "engine has been shut down".to_string(),
            ));
        }
        self.validate_workflow(&workflow)?;

        // Admission control: reject, never queue.
        let permit = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                return Err(EngineError::CapacityExceeded {
                    limit: self.config.max_concurrent_executions,
                });
            }
        };

        let mut execution = Execution::new(workflow.id.clone(), input.clone(), user_id);
        let token = CancellationToken::new();
        self.in_flight.insert(execution.id.clone(), token.clone());

        let variables = Self::hydrate(&workflow, &input);
        let mut ctx = ExecutionContext::new(
            &execution,
            variables,
            self.events.clone(),
            self.handlers.clone(),
            self.services.clone(),
            token.clone(),
        );

        execution.mark_running();
        info!(workflow = %workflow.id, execution = %execution.id, "execution started");
        ctx.emit("workflow.started", json!({ "workflowId": workflow.id }))
            .await;

        let strategy = self.strategy.read().expect("strategy lock poisoned").clone();
        let outcome = match self.config.execution_timeout_ms {
            Some(timeout_ms) => {
                let run = strategy.execute(workflow.clone(), self.registry.clone(), &mut ctx);
                match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), run).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        token.cancel();
                        Err(EngineError::Timeout(format!(
                            "execution exceeded {}ms",
                            timeout_ms
                        )))
                    }
                }
            }
            None => {
                strategy
                    .execute(workflow.clone(), self.registry.clone(), &mut ctx)
                    .await
            }
        };

        match outcome {
            Ok(result) => {
                let error = match result.status {
                    ExecutionStatus::Failed => Some(
                        result
                            .first_error()
                            .unwrap_or("execution failed")
                            .to_string(),
                    ),
                    _ => None,
                };
                execution.current_state_id = result
                    .state_history
                    .last()
                    .map(|record| record.state_id.clone());
                execution.retry_count = result.execution_stats.retries as u32;
                execution.finish(result.status, result.output_data.clone(), error);

                let event_type = match result.status {
                    ExecutionStatus::Completed => "workflow.completed",
                    ExecutionStatus::Failed => "workflow.failed",
                    ExecutionStatus::Cancelled => "workflow.cancelled",
                    _ => "workflow.suspended",
                };
                ctx.emit(
                    event_type,
                    json!({
                        "workflowId": execution.workflow_id,
                        "status": result.status.as_str(),
                        "durationMs": result.execution_stats.duration_ms,
                    }),
                )
                .await;
            }
            Err(error) => {
                let status = if token.is_cancelled() {
                    ExecutionStatus::Cancelled
                } else {
                    ExecutionStatus::Failed
                };
                warn!(execution = %execution.id, %error, "execution aborted");
                execution.finish(status, Value::Null, Some(error.to_string()));
                let event_type = match status {
                    ExecutionStatus::Cancelled => "workflow.cancelled",
                    _ => "workflow.failed",
                };
                ctx.emit(
                    event_type,
                    json!({
                        "workflowId": execution.workflow_id,
                        "error": error.to_string(),
                    }),
                )
                .await;
            }
        }

        for event in ctx.take_log() {
            execution.record_event(event);
        }

        self.store.save_execution(&execution).await?;
        self.store
            .append_events(&execution.id, &execution.events)
            .await?;

        self.in_flight.remove(&execution.id);
        drop(permit);
        Ok(execution)
    }

    /// Cancel one in-flight execution.
    pub fn cancel(&self, execution_id: &str) -> EngineResult<()> {
        match self.in_flight.get(execution_id) {
            Some(entry) => {
                entry.value().cancel();
                Ok(())
            }
            None => Err(EngineError::ExecutionNotFound(execution_id.to_string())),
        }
    }

    /// Shut the engine down: cancel in-flight executions, run plugin cleanup
    /// hooks (errors logged and swallowed), drain the event bus.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("engine shutting down");
        for entry in self.in_flight.iter() {
            entry.value().cancel();
        }
        self.handlers.cleanup_all().await;
        self.events.drain();
    }
}
