//! # Workflow Definitions
//!
//! The declarative workflow model: a directed graph of [`State`]s connected by
//! conditional [`Transition`]s, together with typed variable declarations and a
//! [`Trigger`] descriptor. Definitions are immutable once loaded; the engine
//! borrows them and never mutates.
//!
//! The serialized form follows the canonical camelCase document exchanged with
//! storage. Unknown fields are preserved on round-trip but ignored by the
//! engine (`#[serde(flatten)]` capture).
//!
//! ## Structural invariants
//!
//! [`Workflow::validate`] enforces:
//! - at least one state marked initial and at least one marked final
//! - state identifiers unique within the workflow
//! - every transition endpoint references a declared state
//! - variable names unique
//! - transition conditions, guards and action guards parse as expressions

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::Duration;

use crate::EngineError;
use crate::expr;

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub category: String,
    pub states: Vec<State>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub variables: Vec<VariableDef>,
    pub trigger: Trigger,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Unknown top-level fields, preserved but ignored.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Workflow {
    /// Deserialize a workflow from its canonical JSON document.
    pub fn from_json(document: &str) -> Result<Self, EngineError> {
        serde_json::from_str(document)
            .map_err(|e| EngineError::Validation(format!("invalid workflow document: {}", e)))
    }

    /// Serialize the workflow back to its canonical JSON document.
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Validation(format!("cannot serialize workflow: {}", e)))
    }

    /// Look up a state by id.
    pub fn state(&self, id: &str) -> Option<&State> {
        self.states.iter().find(|s| s.id == id)
    }

    /// All states marked initial, in definition order.
    pub fn initial_states(&self) -> Vec<&State> {
        self.states.iter().filter(|s| s.is_initial).collect()
    }

    /// Transitions leaving the given state, sorted by descending priority
    /// with definition order as the tie-break.
    pub fn transitions_from(&self, state_id: &str) -> Vec<&Transition> {
        let mut transitions: Vec<(usize, &Transition)> = self
            .transitions
            .iter()
            .enumerate()
            .filter(|(_, t)| t.from == state_id)
            .collect();
        transitions.sort_by(|(ia, a), (ib, b)| b.priority.cmp(&a.priority).then(ia.cmp(ib)));
        transitions.into_iter().map(|(_, t)| t).collect()
    }

    /// Whether the graph declares any parallelism: more than one initial
    /// state, or at least one parallel state.
    pub fn is_parallelizable(&self) -> bool {
        self.initial_states().len() > 1
            || self.states.iter().any(|s| s.kind == StateKind::Parallel)
    }

    /// Check the structural invariants of the definition.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.id.is_empty() {
            return Err(EngineError::Validation("workflow id is empty".to_string()));
        }
        if self.states.is_empty() {
            return Err(EngineError::Validation(format!(
                "workflow '{}' has no states",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for state in &self.states {
            if !seen.insert(state.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate state id '{}'",
                    state.id
                )));
            }
        }

        if !self.states.iter().any(|s| s.is_initial) {
            return Err(EngineError::Validation(format!(
                "workflow '{}' has no initial state",
                self.id
            )));
        }
        if !self.states.iter().any(|s| s.is_final) {
            return Err(EngineError::Validation(format!(
                "workflow '{}' has no final state",
                self.id
            )));
        }

        for transition in &self.transitions {
            if self.state(&transition.from).is_none() {
                return Err(EngineError::Validation(format!(
                    "transition '{}' references unknown source state '{}'",
                    transition.id, transition.from
                )));
            }
            if self.state(&transition.to).is_none() {
                return Err(EngineError::Validation(format!(
                    "transition '{}' references unknown target state '{}'",
                    transition.id, transition.to
                )));
            }
            for condition in [&transition.condition, &transition.guard]
                .into_iter()
                .flatten()
            {
                expr::parse(condition).map_err(|e| {
                    EngineError::Validation(format!(
                        "transition '{}' has an invalid expression: {}",
                        transition.id, e
                    ))
                })?;
            }
        }

        let mut names = HashSet::new();
        for variable in &self.variables {
            if !names.insert(variable.name.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate variable name '{}'",
                    variable.name
                )));
            }
        }

        for state in &self.states {
            for action in state.actions.iter().chain(state.compensation.iter()) {
                if let Some(guard) = &action.guard {
                    expr::parse(guard).map_err(|e| {
                        EngineError::Validation(format!(
                            "action '{}' in state '{}' has an invalid guard: {}",
                            action.id, state.id, e
                        ))
                    })?;
                }
            }
        }

        Ok(())
    }
}

/// The kind of a state, driving which node executor realises it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Task,
    Condition,
    Loop,
    Parallel,
    Wait,
    Subprocess,
    End,
}

impl StateKind {
    /// Stable string form, used as the node-registry key.
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Task => "task",
            StateKind::Condition => "condition",
            StateKind::Loop => "loop",
            StateKind::Parallel => "parallel",
            StateKind::Wait => "wait",
            StateKind::Subprocess => "subprocess",
            StateKind::End => "end",
        }
    }
}

/// A node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StateKind,
    #[serde(default)]
    pub is_initial: bool,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub compensation: Vec<ActionDef>,
    /// Kind-specific parameters (loop bounds, condition routes, parallel
    /// children, wait duration).
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl State {
    /// Convenience accessor for a string-valued config entry.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    /// Convenience accessor for an unsigned config entry.
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }

    /// Convenience accessor for a boolean config entry.
    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(|v| v.as_bool())
    }
}

/// The closed set of action kinds the dispatch table is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    PluginInvoke,
    Notification,
    Database,
    ApiCall,
    Wait,
    ConditionCheck,
    Parallel,
    Subprocess,
    UserTask,
    Timer,
    Script,
}

impl ActionKind {
    /// Stable string form, used as the handler-table key.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::PluginInvoke => "plugin_invoke",
            ActionKind::Notification => "notification",
            ActionKind::Database => "database",
            ActionKind::ApiCall => "api_call",
            ActionKind::Wait => "wait",
            ActionKind::ConditionCheck => "condition_check",
            ActionKind::Parallel => "parallel",
            ActionKind::Subprocess => "subprocess",
            ActionKind::UserTask => "user_task",
            ActionKind::Timer => "timer",
            ActionKind::Script => "script",
        }
    }
}

/// A single unit of work inside a state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Optional guard expression; the action is skipped when it is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
}

/// A directed edge between states.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    /// Transitions from the same source are evaluated in descending
    /// priority, ties broken by definition order.
    #[serde(default)]
    pub priority: i32,
}

/// Backoff strategies for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

/// Retry policy attached to states, actions, or orchestrated operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default = "RetryPolicy::default_backoff")]
    pub backoff: BackoffStrategy,
    #[serde(default = "RetryPolicy::default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "RetryPolicy::default_max_delay")]
    pub max_delay_ms: u64,
    /// Error kinds the policy applies to; empty means every error.
    #[serde(default)]
    pub retry_on: Vec<String>,
    #[serde(default = "RetryPolicy::default_enabled")]
    pub enabled: bool,
}

impl RetryPolicy {
    fn default_backoff() -> BackoffStrategy {
        BackoffStrategy::Exponential
    }

    fn default_initial_delay() -> u64 {
        1_000
    }

    fn default_max_delay() -> u64 {
        30_000
    }

    fn default_enabled() -> bool {
        true
    }

    /// A fixed-delay policy.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Fixed,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            retry_on: Vec::new(),
            enabled: true,
        }
    }

    /// An exponential-backoff policy.
    pub fn exponential(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Exponential,
            initial_delay_ms,
            max_delay_ms,
            retry_on: Vec::new(),
            enabled: true,
        }
    }

    /// Restrict the policy to the given error kinds.
    pub fn with_retry_on(mut self, kinds: Vec<String>) -> Self {
        self.retry_on = kinds;
        self
    }

    /// The delay before the given retry attempt (1-based), clamped by the
    /// maximum delay. Fixed keeps the initial delay, linear grows as
    /// `initial * attempt`, exponential as `initial * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.initial_delay_ms;
        let raw = match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(attempt as u64),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };
        Duration::from_millis(raw.min(self.max_delay_ms))
    }

    /// Whether an error tagged with the given kind is retriable under this
    /// policy.
    pub fn applies_to(&self, error_kind: &str) -> bool {
        self.enabled && (self.retry_on.is_empty() || self.retry_on.iter().any(|k| k == error_kind))
    }
}

/// Advisory type declared for a workflow variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

/// A declared workflow variable with an optional default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDef {
    pub name: String,
    #[serde(rename = "type", default = "VariableDef::default_type")]
    pub var_type: VariableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl VariableDef {
    fn default_type() -> VariableType {
        VariableType::Any
    }
}

/// What starts an execution of this workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Event,
    Schedule,
    Manual,
    Webhook,
    DatabaseChange,
    UserAction,
}

/// Trigger descriptor: event triggers carry an event name plus conditions
/// over the input payload, schedule triggers a cron expression with timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub conditions: Vec<TriggerCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Trigger {
    /// A manual trigger, the default for programmatic starts.
    pub fn manual() -> Self {
        Self {
            kind: TriggerKind::Manual,
            event: None,
            conditions: Vec::new(),
            schedule: None,
            timezone: None,
            extra: Map::new(),
        }
    }

    /// An event trigger on the given event name.
    pub fn event(name: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Event,
            event: Some(name.into()),
            ..Self::manual()
        }
    }
}

impl Trigger {
    /// Whether an incoming event with the given payload satisfies this
    /// trigger: the event name must match and every condition must hold.
    pub fn matches(&self, event: &str, payload: &Value) -> bool {
        if self.kind != TriggerKind::Event {
            return false;
        }
        if self.event.as_deref() != Some(event) {
            return false;
        }
        self.conditions.iter().all(|c| c.matches(payload))
    }
}

/// A single condition over the trigger's input payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerCondition {
    pub field: String,
    pub operator: String,
    pub value: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

impl TriggerCondition {
    /// Evaluate the condition against a payload field. Unknown operators
    /// never match.
    pub fn matches(&self, payload: &Value) -> bool {
        let actual = payload.get(&self.field);
        match self.operator.as_str() {
            "exists" => actual.is_some(),
            "eq" | "==" => actual == Some(&self.value),
            "ne" | "!=" => actual != Some(&self.value),
            "gt" | ">" => Self::compare(actual, &self.value, |o| o.is_gt()),
            "gte" | ">=" => Self::compare(actual, &self.value, |o| o.is_ge()),
            "lt" | "<" => Self::compare(actual, &self.value, |o| o.is_lt()),
            "lte" | "<=" => Self::compare(actual, &self.value, |o| o.is_le()),
            "contains" => match (actual, &self.value) {
                (Some(Value::String(hay)), Value::String(needle)) => hay.contains(needle),
                (Some(Value::Array(items)), needle) => items.contains(needle),
                _ => false,
            },
            _ => false,
        }
    }

    fn compare(
        actual: Option<&Value>,
        expected: &Value,
        check: impl Fn(std::cmp::Ordering) -> bool,
    ) -> bool {
        match (actual.and_then(Value::as_f64), expected.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).map(&check).unwrap_or(false),
            _ => false,
        }
    }
}

// ============================================================================
// BUILDERS
// ============================================================================

/// Fluent builder for workflow definitions, used heavily by tests.
pub struct WorkflowBuilder {
    workflow: Workflow,
}

impl WorkflowBuilder {
    /// Start a workflow with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            workflow: Workflow {
                id: id.into(),
                version: "1.0.0".to_string(),
                category: String::new(),
                states: Vec::new(),
                transitions: Vec::new(),
                variables: Vec::new(),
                trigger: Trigger::manual(),
                metadata: Map::new(),
                extra: Map::new(),
            },
        }
    }

    /// Set the version string.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.workflow.version = version.into();
        self
    }

    /// Set the category tag.
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.workflow.category = category.into();
        self
    }

    /// Set the trigger descriptor.
    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.workflow.trigger = trigger;
        self
    }

    /// Add a state.
    pub fn state(mut self, state: State) -> Self {
        self.workflow.states.push(state);
        self
    }

    /// Add an unconditional transition with default priority.
    pub fn transition(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.transition_with(from, to, None, 0)
    }

    /// Add a transition with a condition and priority.
    pub fn transition_with(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: Option<String>,
        priority: i32,
    ) -> Self {
        let from = from.into();
        let to = to.into();
        let id = format!("{}->{}", from, to);
        self.workflow.transitions.push(Transition {
            id,
            from,
            to,
            condition,
            guard: None,
            priority,
        });
        self
    }

    /// Declare a variable with a default value.
    pub fn variable(
        mut self,
        name: impl Into<String>,
        var_type: VariableType,
        default_value: Option<Value>,
    ) -> Self {
        self.workflow.variables.push(VariableDef {
            name: name.into(),
            var_type,
            default_value,
        });
        self
    }

    /// Finish building.
    pub fn build(self) -> Workflow {
        self.workflow
    }
}

/// Fluent builder for states.
pub struct StateBuilder {
    state: State,
}

impl StateBuilder {
    /// Start a state with the given id and kind.
    pub fn new(id: impl Into<String>, kind: StateKind) -> Self {
        let id = id.into();
        Self {
            state: State {
                name: id.clone(),
                id,
                kind,
                is_initial: false,
                is_final: false,
                actions: Vec::new(),
                timeout_ms: None,
                retry_policy: None,
                compensation: Vec::new(),
                config: Map::new(),
                extra: Map::new(),
            },
        }
    }

    /// Shorthand for a task state.
    pub fn task(id: impl Into<String>) -> Self {
        Self::new(id, StateKind::Task)
    }

    /// Shorthand for a final end state.
    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, StateKind::End).final_state()
    }

    /// Set the human-readable name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.state.name = name.into();
        self
    }

    /// Mark the state initial.
    pub fn initial(mut self) -> Self {
        self.state.is_initial = true;
        self
    }

    /// Mark the state final.
    pub fn final_state(mut self) -> Self {
        self.state.is_final = true;
        self
    }

    /// Append an action.
    pub fn action(mut self, action: ActionDef) -> Self {
        self.state.actions.push(action);
        self
    }

    /// Set the node-level timeout.
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.state.timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the node-level retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.state.retry_policy = Some(policy);
        self
    }

    /// Set a kind-specific config entry.
    pub fn config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state.config.insert(key.into(), value);
        self
    }

    /// Finish building.
    pub fn build(self) -> State {
        self.state
    }
}

impl ActionDef {
    /// A minimal action of the given kind.
    pub fn new(id: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            id: id.into(),
            kind,
            config: Map::new(),
            retry_policy: None,
            timeout_ms: None,
            guard: None,
        }
    }

    /// A wait action sleeping for the given duration.
    pub fn wait(id: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(id, ActionKind::Wait).with_config("durationMs", Value::from(duration_ms))
    }

    /// Set a config entry.
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Set the per-action retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Set the per-action timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the guard expression.
    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn linear_workflow() -> Workflow {
        WorkflowBuilder::new("wf-linear")
            .state(StateBuilder::task("s1").initial().build())
            .state(StateBuilder::task("s2").build())
            .state(StateBuilder::end("s3").build())
            .transition("s1", "s2")
            .transition("s2", "s3")
            .build()
    }

    #[test]
    fn test_validate_accepts_well_formed_workflow() {
        linear_workflow().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_initial_state() {
        let workflow = WorkflowBuilder::new("wf")
            .state(StateBuilder::task("a").build())
            .state(StateBuilder::end("b").build())
            .build();
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("no initial state"));
    }

    #[test]
    fn test_validate_rejects_missing_final_state() {
        let workflow = WorkflowBuilder::new("wf")
            .state(StateBuilder::task("a").initial().build())
            .build();
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_state_ids() {
        let workflow = WorkflowBuilder::new("wf")
            .state(StateBuilder::task("a").initial().build())
            .state(StateBuilder::task("a").build())
            .state(StateBuilder::end("b").build())
            .build();
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate state id"));
    }

    #[test]
    fn test_validate_rejects_dangling_transition() {
        let workflow = WorkflowBuilder::new("wf")
            .state(StateBuilder::task("a").initial().build())
            .state(StateBuilder::end("b").build())
            .transition("a", "ghost")
            .build();
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("unknown target state"));
    }

    #[test]
    fn test_validate_rejects_unparseable_condition() {
        let workflow = WorkflowBuilder::new("wf")
            .state(StateBuilder::task("a").initial().build())
            .state(StateBuilder::end("b").build())
            .transition_with("a", "b", Some("count >".to_string()), 0)
            .build();
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn test_transitions_sorted_by_priority_then_order() {
        let workflow = WorkflowBuilder::new("wf")
            .state(StateBuilder::task("a").initial().build())
            .state(StateBuilder::task("b").build())
            .state(StateBuilder::task("c").build())
            .state(StateBuilder::end("d").build())
            .transition_with("a", "b", None, 1)
            .transition_with("a", "c", None, 5)
            .transition_with("a", "d", None, 5)
            .build();

        let ordered: Vec<&str> = workflow
            .transitions_from("a")
            .iter()
            .map(|t| t.to.as_str())
            .collect();
        // Highest priority first, definition order breaks the tie.
        assert_eq!(ordered, vec!["c", "d", "b"]);
    }

    #[test]
    fn test_retry_delay_backoff() {
        let fixed = RetryPolicy::fixed(5, 100);
        assert_eq!(fixed.delay_for(1), Duration::from_millis(100));
        assert_eq!(fixed.delay_for(4), Duration::from_millis(100));

        let linear = RetryPolicy {
            max_attempts: 5,
            backoff: BackoffStrategy::Linear,
            initial_delay_ms: 100,
            max_delay_ms: 250,
            retry_on: Vec::new(),
            enabled: true,
        };
        assert_eq!(linear.delay_for(1), Duration::from_millis(100));
        assert_eq!(linear.delay_for(2), Duration::from_millis(200));
        // Clamped by max delay.
        assert_eq!(linear.delay_for(3), Duration::from_millis(250));

        let exponential = RetryPolicy::exponential(5, 100, 1_000);
        assert_eq!(exponential.delay_for(1), Duration::from_millis(100));
        assert_eq!(exponential.delay_for(2), Duration::from_millis(200));
        assert_eq!(exponential.delay_for(3), Duration::from_millis(400));
        assert_eq!(exponential.delay_for(5), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_policy_error_kind_filter() {
        let policy =
            RetryPolicy::fixed(3, 10).with_retry_on(vec!["network".to_string(), "timeout".to_string()]);
        assert!(policy.applies_to("network"));
        assert!(!policy.applies_to("validation"));

        let unfiltered = RetryPolicy::fixed(3, 10);
        assert!(unfiltered.applies_to("anything"));
    }

    #[test]
    fn test_trigger_matching() {
        let mut trigger = Trigger::event("order.created");
        trigger.conditions.push(TriggerCondition {
            field: "amount".to_string(),
            operator: "gte".to_string(),
            value: json!(100),
            value_type: Some("number".to_string()),
        });
        trigger.conditions.push(TriggerCondition {
            field: "region".to_string(),
            operator: "eq".to_string(),
            value: json!("eu"),
            value_type: None,
        });

        let payload = json!({"amount": 250, "region": "eu"});
        assert!(trigger.matches("order.created", &payload));
        assert!(!trigger.matches("order.deleted", &payload));
        assert!(!trigger.matches("order.created", &json!({"amount": 50, "region": "eu"})));
        assert!(!trigger.matches("order.created", &json!({"amount": 250})));

        // Manual triggers never match incoming events.
        assert!(!Trigger::manual().matches("order.created", &payload));

        let contains = TriggerCondition {
            field: "tags".to_string(),
            operator: "contains".to_string(),
            value: json!("priority"),
            value_type: None,
        };
        assert!(contains.matches(&json!({"tags": ["priority", "new"]})));
        assert!(!contains.matches(&json!({"tags": []})));
    }

    #[test]
    fn test_document_round_trip_preserves_unknown_fields() {
        let document = json!({
            "id": "wf-doc",
            "version": "2.1.0",
            "category": "demo",
            "states": [
                {"id": "start", "type": "task", "isInitial": true, "customHint": "kept"},
                {"id": "done", "type": "end", "isFinal": true}
            ],
            "transitions": [
                {"id": "t1", "from": "start", "to": "done", "priority": 1}
            ],
            "variables": [
                {"name": "count", "type": "number", "defaultValue": 0}
            ],
            "trigger": {"type": "event", "event": "order.created"},
            "metadata": {},
            "futureField": {"nested": true}
        })
        .to_string();

        let workflow = Workflow::from_json(&document).unwrap();
        workflow.validate().unwrap();
        assert_eq!(workflow.extra.get("futureField"), Some(&json!({"nested": true})));
        assert_eq!(
            workflow.states[0].extra.get("customHint"),
            Some(&json!("kept"))
        );

        let round_tripped = Workflow::from_json(&workflow.to_json().unwrap()).unwrap();
        assert_eq!(round_tripped.extra.get("futureField"), Some(&json!({"nested": true})));
        assert_eq!(round_tripped.trigger.kind, TriggerKind::Event);
    }
}
