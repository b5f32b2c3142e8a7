//! # Plugin System
//!
//! Action handlers are plugins: externally provided implementations registered
//! by name, initialised once with their configuration, and dispatched through
//! a handler table keyed on action kind. The same contract covers the built-in
//! minimal set (wait, condition-check, script placeholder) so the task
//! executor has a single dispatch path.
//!
//! Registration semantics:
//! - initialisation failure is a hard error and the plugin is not registered;
//! - registering a plugin under an existing name silently replaces it, which
//!   is what allows hot-reload;
//! - `cleanup` errors are logged and swallowed on shutdown.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::definition::ActionKind;
use crate::expr;
use crate::services::ServiceLocator;
use crate::variables::VariableStore;
use crate::{EngineError, EngineResult};

/// Everything a plugin sees about the invocation.
#[derive(Clone)]
pub struct PluginContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: Option<String>,
    /// The action's configuration plus any runtime input.
    pub input: Value,
    /// Read-only snapshot of the execution's variables.
    pub variables: VariableStore,
    /// External service surfaces.
    pub services: Arc<ServiceLocator>,
    /// Cancellation token; plugins must honour it at suspension points.
    pub cancellation: CancellationToken,
}

impl PluginContext {
    /// Convenience accessor for a config entry.
    pub fn input_field(&self, key: &str) -> Option<&Value> {
        self.input.get(key)
    }
}

/// The outcome a plugin reports back to the task executor.
#[derive(Debug, Clone, Default)]
pub struct PluginResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    /// Optional state override for the strategy.
    pub next_state: Option<String>,
    /// The execution should move to `waiting` rather than advance.
    pub should_wait: bool,
    /// The failure is transient and worth retrying.
    pub should_retry: bool,
    /// Variable writes to merge into the execution's store.
    pub variables: Option<HashMap<String, Value>>,
}

impl PluginResult {
    /// A successful result carrying data.
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Default::default()
        }
    }

    /// A failed result with an error message.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Mark the failure as transient.
    pub fn retriable(mut self) -> Self {
        self.should_retry = true;
        self
    }

    /// Attach variable writes.
    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = Some(variables);
        self
    }
}

/// The host contract for action handlers.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin name, used as the registration key.
    fn name(&self) -> &str;

    /// Called once at registration with the plugin's configuration.
    async fn initialize(&self, _config: &Value) -> EngineResult<()> {
        Ok(())
    }

    /// Execute one action invocation.
    async fn execute(&self, context: PluginContext) -> EngineResult<PluginResult>;

    /// Called on engine shutdown. Errors are logged and swallowed.
    async fn cleanup(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Registry of named plugins and the per-kind handler table.
pub struct HandlerRegistry {
    plugins: DashMap<String, Arc<dyn Plugin>>,
    handlers: DashMap<&'static str, Arc<dyn Plugin>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// A registry pre-wired with the built-in handlers.
    pub fn new() -> Self {
        let registry = Self {
            plugins: DashMap::new(),
            handlers: DashMap::new(),
        };
        registry
            .handlers
            .insert(ActionKind::Wait.as_str(), Arc::new(WaitHandler) as Arc<dyn Plugin>);
        registry.handlers.insert(
            ActionKind::Timer.as_str(),
            Arc::new(WaitHandler) as Arc<dyn Plugin>,
        );
        registry.handlers.insert(
            ActionKind::ConditionCheck.as_str(),
            Arc::new(ConditionCheckHandler) as Arc<dyn Plugin>,
        );
        registry.handlers.insert(
            ActionKind::Script.as_str(),
            Arc::new(ScriptHandler) as Arc<dyn Plugin>,
        );
        registry
    }

    /// Register a plugin by name, initialising it with `config`.
    ///
    /// Initialisation failure leaves the registry unchanged. Registering an
    /// existing name replaces the previous plugin silently.
    pub async fn register_plugin(
        &self,
        plugin: Arc<dyn Plugin>,
        config: Value,
    ) -> EngineResult<()> {
        let name = plugin.name().to_string();
        plugin
            .initialize(&config)
            .await
            .map_err(|e| EngineError::Plugin(format!("plugin '{}' failed to initialize: {}", name, e)))?;
        if self.plugins.insert(name.clone(), plugin).is_some() {
            debug!(plugin = %name, "plugin replaced");
        } else {
            debug!(plugin = %name, "plugin registered");
        }
        Ok(())
    }

    /// Install a handler for a whole action kind, replacing any previous one.
    pub fn register_handler(&self, kind: ActionKind, handler: Arc<dyn Plugin>) {
        self.handlers.insert(kind.as_str(), handler);
    }

    /// Look up a plugin by name.
    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).map(|entry| entry.value().clone())
    }

    /// Resolve the handler for an action.
    ///
    /// `plugin_invoke` actions dispatch to the named plugin from their config;
    /// every other kind goes through the handler table.
    pub fn resolve(
        &self,
        kind: ActionKind,
        config: &Map<String, Value>,
    ) -> EngineResult<Arc<dyn Plugin>> {
        if kind == ActionKind::PluginInvoke {
            let name = config
                .get("plugin")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    EngineError::Configuration(
                        "plugin_invoke action is missing the 'plugin' config entry".to_string(),
                    )
                })?;
            return self.plugin(name).ok_or_else(|| {
                EngineError::Plugin(format!("no plugin registered under '{}'", name))
            });
        }

        self.handlers
            .get(kind.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "no handler registered for action kind '{}'",
                    kind.as_str()
                ))
            })
    }

    /// Registered plugin names.
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|e| e.key().clone()).collect()
    }

    /// Invoke every plugin's cleanup hook, logging and swallowing errors.
    pub async fn cleanup_all(&self) {
        for entry in self.plugins.iter() {
            if let Err(e) = entry.value().cleanup().await {
                warn!(plugin = %entry.key(), error = %e, "plugin cleanup failed");
            }
        }
    }
}

// ============================================================================
// BUILT-IN HANDLERS
// ============================================================================

/// Sleeps for `durationMs`, honouring cancellation.
struct WaitHandler;

#[async_trait]
impl Plugin for WaitHandler {
    fn name(&self) -> &str {
        "builtin.wait"
    }

    async fn execute(&self, context: PluginContext) -> EngineResult<PluginResult> {
        let duration_ms = context
            .input_field("durationMs")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
                Ok(PluginResult::ok(Value::Null))
            }
            _ = context.cancellation.cancelled() => {
                Err(EngineError::ExecutionFailed("wait cancelled".to_string()))
            }
        }
    }
}

/// Evaluates `expression` against the variables and reports the boolean.
struct ConditionCheckHandler;

#[async_trait]
impl Plugin for ConditionCheckHandler {
    fn name(&self) -> &str {
        "builtin.condition_check"
    }

    async fn execute(&self, context: PluginContext) -> EngineResult<PluginResult> {
        let expression = context
            .input_field("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                EngineError::Configuration(
                    "condition_check action is missing the 'expression' config entry".to_string(),
                )
            })?;

        let result = expr::evaluate_bool(expression, &context.variables)?;
        let mut plugin_result = PluginResult::ok(serde_json::json!({ "result": result }));
        if let Some(output) = context.input_field("outputVariable").and_then(|v| v.as_str()) {
            plugin_result = plugin_result
                .with_variables(HashMap::from([(output.to_string(), Value::Bool(result))]));
        }
        Ok(plugin_result)
    }
}

/// Placeholder for script actions: records the script without running it.
/// Script execution belongs to an external plugin.
struct ScriptHandler;

#[async_trait]
impl Plugin for ScriptHandler {
    fn name(&self) -> &str {
        "builtin.script"
    }

    async fn execute(&self, context: PluginContext) -> EngineResult<PluginResult> {
        let script = context
            .input_field("script")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        debug!(
            execution = %context.execution_id,
            bytes = script.len(),
            "script action acknowledged without execution"
        );
        Ok(PluginResult::ok(serde_json::json!({
            "executed": false,
            "scriptBytes": script.len(),
        })))
    }
}
