//! # Executions
//!
//! An execution is a single traversal of a workflow: its own variable store,
//! an append-only event log, and a lifecycle status. The engine owns the
//! execution for the duration of one run and hands the final record to
//! storage on completion.
//!
//! [`ExecutionContext`] is the mutable working set threaded through
//! strategies and node executors: the variable store, the cancellation token,
//! the event bus and handler registry handles, and the log of execution
//! events. Parallel branches never share a context; they work on a
//! copy-on-branch snapshot created with [`ExecutionContext::branch`] and are
//! merged back on join.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::{EventBus, EventMetadata};
use crate::plugin::HandlerRegistry;
use crate::services::ServiceLocator;
use crate::variables::{VariableDelta, VariableStore};
use crate::{EngineError, EngineResult};

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Waiting,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Stable string form matching the public status set.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Waiting => "waiting",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// One entry of an execution's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub id: String,
    pub execution_id: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// A single run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_state_id: Option<String>,
    pub variables: VariableStore,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub events: Vec<ExecutionEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Create a pending execution for the given workflow.
    pub fn new(workflow_id: impl Into<String>, input: Value, user_id: Option<String>) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        Self {
            correlation_id: id.clone(),
            id,
            workflow_id: workflow_id.into(),
            user_id,
            status: ExecutionStatus::Pending,
            current_state_id: None,
            variables: VariableStore::new(),
            input,
            output: Value::Null,
            events: Vec::new(),
            error_message: None,
            retry_count: 0,
            parent_execution_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Append an event to the log.
    pub fn record_event(&mut self, event: ExecutionEvent) {
        self.events.push(event);
        self.updated_at = Utc::now();
    }

    /// Transition to running.
    pub fn mark_running(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Transition to a terminal status.
    pub fn finish(&mut self, status: ExecutionStatus, output: Value, error: Option<String>) {
        self.status = status;
        self.output = output;
        self.error_message = error;
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }
}

/// The mutable working set of one running execution (or one parallel branch
/// of it).
pub struct ExecutionContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: Option<String>,
    pub correlation_id: String,
    /// The branch-local variable store.
    pub variables: VariableStore,
    cancellation: CancellationToken,
    events: Arc<EventBus>,
    handlers: Arc<HandlerRegistry>,
    services: Arc<ServiceLocator>,
    /// Branch-local append-only event log.
    log: Vec<ExecutionEvent>,
}

impl ExecutionContext {
    /// Build the root context for an execution.
    pub fn new(
        execution: &Execution,
        variables: VariableStore,
        events: Arc<EventBus>,
        handlers: Arc<HandlerRegistry>,
        services: Arc<ServiceLocator>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            execution_id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            user_id: execution.user_id.clone(),
            correlation_id: execution.correlation_id.clone(),
            variables,
            cancellation,
            events,
            handlers,
            services,
            log: Vec::new(),
        }
    }

    /// The cancellation token for this branch.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The shared event bus.
    pub fn event_bus(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// The handler registry.
    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        self.handlers.clone()
    }

    /// The service locator.
    pub fn services(&self) -> Arc<ServiceLocator> {
        self.services.clone()
    }

    /// Fail fast when the execution has been cancelled.
    pub fn check_cancelled(&self) -> EngineResult<()> {
        if self.cancellation.is_cancelled() {
            Err(EngineError::ExecutionFailed(format!(
                "execution '{}' was cancelled",
                self.execution_id
            )))
        } else {
            Ok(())
        }
    }

    /// Copy-on-branch snapshot for a parallel child. The child gets its own
    /// variable store copy, an empty log, and a child cancellation token.
    pub fn branch(&self) -> ExecutionContext {
        self.branch_with(self.cancellation.child_token())
    }

    /// Copy-on-branch snapshot with an explicit cancellation token, used by
    /// fan-out nodes that cancel a whole sibling group at once.
    pub fn branch_with(&self, cancellation: CancellationToken) -> ExecutionContext {
        ExecutionContext {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow_id.clone(),
            user_id: self.user_id.clone(),
            correlation_id: self.correlation_id.clone(),
            variables: self.variables.clone(),
            cancellation,
            events: self.events.clone(),
            handlers: self.handlers.clone(),
            services: self.services.clone(),
            log: Vec::new(),
        }
    }

    /// Merge a joined branch back: apply its variable delta and adopt its
    /// event log entries in completion order.
    pub fn join(&mut self, delta: &VariableDelta, branch_log: Vec<ExecutionEvent>) {
        self.variables.apply(delta);
        self.log.extend(branch_log);
    }

    /// Emit a bus event correlated to this execution and mirror it into the
    /// execution's own event log.
    pub async fn emit(&mut self, event_type: &str, data: Value) {
        self.emit_scoped(event_type, data, None, None).await;
    }

    /// Emit with explicit state/action attribution.
    pub async fn emit_scoped(
        &mut self,
        event_type: &str,
        data: Value,
        state_id: Option<String>,
        action_id: Option<String>,
    ) {
        let emission = self
            .events
            .emit(
                event_type,
                data.clone(),
                EventMetadata::correlated(self.correlation_id.clone()),
            )
            .await;
        self.log.push(ExecutionEvent {
            id: emission.event_id,
            execution_id: self.execution_id.clone(),
            event_type: event_type.to_string(),
            state_id,
            action_id,
            data,
            correlation_id: self.correlation_id.clone(),
            causation_id: None,
            duration_ms: Some(emission.duration_ms),
            timestamp: Utc::now(),
        });
    }

    /// The branch's event log so far.
    pub fn log(&self) -> &[ExecutionEvent] {
        &self.log
    }

    /// Take ownership of the accumulated log.
    pub fn take_log(&mut self) -> Vec<ExecutionEvent> {
        std::mem::take(&mut self.log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> (Execution, ExecutionContext) {
        let execution = Execution::new("wf-1", json!({}), None);
        let ctx = ExecutionContext::new(
            &execution,
            VariableStore::new(),
            Arc::new(EventBus::new()),
            Arc::new(HandlerRegistry::new()),
            Arc::new(ServiceLocator::new()),
            CancellationToken::new(),
        );
        (execution, ctx)
    }

    #[test]
    fn test_status_terminality() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Waiting.is_terminal());
    }

    #[test]
    fn test_execution_lifecycle_fields() {
        let mut execution = Execution::new("wf-1", json!({"a": 1}), Some("user-9".to_string()));
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert!(execution.started_at.is_none());

        execution.mark_running();
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert!(execution.started_at.is_some());

        execution.finish(ExecutionStatus::Completed, json!({"done": true}), None);
        assert!(execution.completed_at.is_some());
        assert_eq!(execution.output, json!({"done": true}));
    }

    #[tokio::test]
    async fn test_emit_mirrors_into_log() {
        let (_execution, mut ctx) = context();
        ctx.emit("node.started", json!({"state": "s1"})).await;

        assert_eq!(ctx.log().len(), 1);
        let entry = &ctx.log()[0];
        assert_eq!(entry.event_type, "node.started");
        assert_eq!(entry.correlation_id, ctx.correlation_id);
    }

    #[tokio::test]
    async fn test_branch_isolation_and_join() {
        let (_execution, mut ctx) = context();
        ctx.variables.set("shared", json!(1));

        let mut branch = ctx.branch();
        branch.variables.set("shared", json!(2));
        branch.emit("branch.step", json!({})).await;

        // The parent is untouched until join.
        assert_eq!(ctx.variables.get("shared"), Some(&json!(1)));

        let mut delta = VariableDelta::new();
        delta.set("shared", json!(2));
        let log = branch.take_log();
        ctx.join(&delta, log);

        assert_eq!(ctx.variables.get("shared"), Some(&json!(2)));
        assert_eq!(ctx.log().len(), 1);
    }

    #[test]
    fn test_cancellation_check() {
        let (_execution, ctx) = context();
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancellation().cancel();
        assert!(ctx.check_cancelled().is_err());
    }

    #[test]
    fn test_branch_token_is_child_of_parent() {
        let (_execution, ctx) = context();
        let branch = ctx.branch();
        ctx.cancellation().cancel();
        // Cancelling the parent reaches every branch.
        assert!(branch.check_cancelled().is_err());
    }
}
