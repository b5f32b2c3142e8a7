//! # Storage Façade
//!
//! Persistence of workflow definitions, executions and execution events lives
//! outside the engine; the core only consumes this façade. The engine writes
//! complete execution records and appends events, and assumes nothing beyond
//! a per-execution atomic write.
//!
//! [`MemoryStore`] is the default implementation used by tests and simple
//! embeddings.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::definition::Workflow;
use crate::execution::{Execution, ExecutionEvent};
use crate::{EngineError, EngineResult};

/// The persistence surface the engine writes through.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist a workflow definition.
    async fn save_workflow(&self, workflow: &Workflow) -> EngineResult<()>;

    /// Fetch a workflow definition by id.
    async fn load_workflow(&self, workflow_id: &str) -> EngineResult<Workflow>;

    /// Persist a complete execution record (atomic per execution).
    async fn save_execution(&self, execution: &Execution) -> EngineResult<()>;

    /// Fetch an execution by id.
    async fn load_execution(&self, execution_id: &str) -> EngineResult<Execution>;

    /// Append events to an execution's log.
    async fn append_events(&self, execution_id: &str, events: &[ExecutionEvent])
    -> EngineResult<()>;

    /// Events appended for an execution, in append order.
    async fn load_events(&self, execution_id: &str) -> EngineResult<Vec<ExecutionEvent>>;
}

/// In-memory store backed by concurrent maps.
#[derive(Default)]
pub struct MemoryStore {
    workflows: DashMap<String, Workflow>,
    executions: DashMap<String, Execution>,
    events: DashMap<String, Vec<ExecutionEvent>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for engine wiring.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored executions.
    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save_workflow(&self, workflow: &Workflow) -> EngineResult<()> {
        self.workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn load_workflow(&self, workflow_id: &str) -> EngineResult<Workflow> {
        self.workflows
            .get(workflow_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn save_execution(&self, execution: &Execution) -> EngineResult<()> {
        self.executions
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn load_execution(&self, execution_id: &str) -> EngineResult<Execution> {
        self.executions
            .get(execution_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn append_events(
        &self,
        execution_id: &str,
        events: &[ExecutionEvent],
    ) -> EngineResult<()> {
        self.events
            .entry(execution_id.to_string())
            .or_default()
            .extend_from_slice(events);
        Ok(())
    }

    async fn load_events(&self, execution_id: &str) -> EngineResult<Vec<ExecutionEvent>> {
        Ok(self
            .events
            .get(execution_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }
}
