//! Recovery actions: rules mapping an observed condition to a remedial
//! action.
//!
//! A rule fires when its condition tag has been observed `threshold` times
//! within its window. A cooldown gates all triggers of the same rule, and an
//! attempts counter retires a rule that has fired too many times until the
//! orchestrator is reset. Actions run asynchronously; their outcomes are
//! emitted as `recovery.*` events.

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::event::{EventBus, EventMetadata};

/// The remedial action a rule runs.
#[derive(Clone)]
pub enum RecoveryAction {
    /// Request a scale adjustment of the named target.
    Scale { target: String, amount: i32 },
    /// Request a restart of the named target.
    Restart { target: String },
    /// An arbitrary async thunk.
    Custom(Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>),
}

impl std::fmt::Debug for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryAction::Scale { target, amount } => {
                write!(f, "Scale({}, {})", target, amount)
            }
            RecoveryAction::Restart { target } => write!(f, "Restart({})", target),
            RecoveryAction::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// One recovery rule.
#[derive(Debug, Clone)]
pub struct RecoveryRule {
    pub id: String,
    /// Condition tag the rule watches, e.g. a service name.
    pub condition: String,
    /// Observations within the window needed to fire.
    pub threshold: u32,
    pub window: Duration,
    /// Minimum time between two firings of this rule.
    pub cooldown: Duration,
    /// Firings before the rule retires until reset.
    pub max_attempts: u32,
    pub action: RecoveryAction,
}

struct RuleState {
    rule: RecoveryRule,
    observations: Mutex<VecDeque<Instant>>,
    last_fired: Mutex<Option<Instant>>,
    attempts: Mutex<u32>,
}

/// Rule registry and trigger evaluator.
pub struct RecoveryManager {
    rules: DashMap<String, Arc<RuleState>>,
    bus: Arc<EventBus>,
}

impl RecoveryManager {
    /// A manager publishing outcomes to the given bus.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            rules: DashMap::new(),
            bus,
        }
    }

    /// Install a rule, replacing any rule with the same id.
    pub fn add_rule(&self, rule: RecoveryRule) {
        self.rules.insert(
            rule.id.clone(),
            Arc::new(RuleState {
                rule,
                observations: Mutex::new(VecDeque::new()),
                last_fired: Mutex::new(None),
                attempts: Mutex::new(0),
            }),
        );
    }

    /// Record one observation of a condition tag, firing any rule whose
    /// threshold is reached. Returns the ids of the rules that fired.
    pub async fn observe(&self, condition: &str) -> Vec<String> {
        let now = Instant::now();
        let mut fired = Vec::new();

        for entry in self.rules.iter() {
            let state = entry.value().clone();
            if state.rule.condition != condition {
                continue;
            }

            let should_fire = {
                let mut observations = state.observations.lock().expect("observations lock");
                observations.push_back(now);
                while let Some(front) = observations.front() {
                    if now.duration_since(*front) > state.rule.window {
                        observations.pop_front();
                    } else {
                        break;
                    }
                }
                if (observations.len() as u32) < state.rule.threshold {
                    false
                } else {
                    let attempts = *state.attempts.lock().expect("attempts lock");
                    if attempts >= state.rule.max_attempts {
                        false
                    } else {
                        let last = *state.last_fired.lock().expect("last_fired lock");
                        match last {
                            Some(t) if now.duration_since(t) < state.rule.cooldown => false,
                            _ => true,
                        }
                    }
                }
            };

            if !should_fire {
                continue;
            }

            {
                *state.last_fired.lock().expect("last_fired lock") = Some(now);
                let mut attempts = state.attempts.lock().expect("attempts lock");
                *attempts += 1;
                state.observations.lock().expect("observations lock").clear();
            }

            info!(rule = %state.rule.id, condition, "recovery rule triggered");
            fired.push(state.rule.id.clone());
            self.bus
                .emit(
                    "recovery.triggered",
                    json!({
                        "ruleId": state.rule.id,
                        "condition": condition,
                        "action": format!("{:?}", state.rule.action),
                        "triggeredAt": Utc::now(),
                    }),
                    EventMetadata::default(),
                )
                .await;

            // Actions run detached so a slow remedy never blocks observation.
            let bus = self.bus.clone();
            tokio::spawn(async move {
                let outcome = run_action(&state.rule.action).await;
                let (event_type, payload) = match outcome {
                    Ok(detail) => (
                        "recovery.completed",
                        json!({ "ruleId": state.rule.id, "detail": detail }),
                    ),
                    Err(error) => {
                        warn!(rule = %state.rule.id, error = %error, "recovery action failed");
                        (
                            "recovery.failed",
                            json!({ "ruleId": state.rule.id, "error": error }),
                        )
                    }
                };
                bus.emit(event_type, payload, EventMetadata::default()).await;
            });
        }

        fired
    }

    /// Firings of a rule so far.
    pub fn attempts(&self, rule_id: &str) -> u32 {
        self.rules
            .get(rule_id)
            .map(|state| *state.attempts.lock().expect("attempts lock"))
            .unwrap_or(0)
    }

    /// Clear observations, cooldowns and attempt counters on every rule.
    pub fn reset(&self) {
        for entry in self.rules.iter() {
            let state = entry.value();
            state.observations.lock().expect("observations lock").clear();
            *state.last_fired.lock().expect("last_fired lock") = None;
            *state.attempts.lock().expect("attempts lock") = 0;
        }
    }
}

async fn run_action(action: &RecoveryAction) -> Result<String, String> {
    match action {
        RecoveryAction::Scale { target, amount } => {
            Ok(format!("requested scale of '{}' by {}", target, amount))
        }
        RecoveryAction::Restart { target } => Ok(format!("requested restart of '{}'", target)),
        RecoveryAction::Custom(thunk) => thunk().await.map(|_| "custom action ran".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rule(id: &str, condition: &str, threshold: u32, cooldown_ms: u64, max_attempts: u32) -> RecoveryRule {
        RecoveryRule {
            id: id.to_string(),
            condition: condition.to_string(),
            threshold,
            window: Duration::from_secs(60),
            cooldown: Duration::from_millis(cooldown_ms),
            max_attempts,
            action: RecoveryAction::Restart {
                target: "worker".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_fires_at_threshold() {
        let manager = RecoveryManager::new(Arc::new(EventBus::new()));
        manager.add_rule(rule("r1", "db", 3, 0, 10));

        assert!(manager.observe("db").await.is_empty());
        assert!(manager.observe("db").await.is_empty());
        assert_eq!(manager.observe("db").await, vec!["r1".to_string()]);
        assert_eq!(manager.attempts("r1"), 1);
    }

    #[tokio::test]
    async fn test_unrelated_condition_does_not_fire() {
        let manager = RecoveryManager::new(Arc::new(EventBus::new()));
        manager.add_rule(rule("r1", "db", 1, 0, 10));
        assert!(manager.observe("network").await.is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_gates_repeat_firing() {
        let manager = RecoveryManager::new(Arc::new(EventBus::new()));
        manager.add_rule(rule("r1", "db", 1, 10_000, 10));

        assert_eq!(manager.observe("db").await.len(), 1);
        // Still cooling down.
        assert!(manager.observe("db").await.is_empty());
        assert_eq!(manager.attempts("r1"), 1);
    }

    #[tokio::test]
    async fn test_max_attempts_retires_the_rule() {
        let manager = RecoveryManager::new(Arc::new(EventBus::new()));
        manager.add_rule(rule("r1", "db", 1, 0, 2));

        assert_eq!(manager.observe("db").await.len(), 1);
        assert_eq!(manager.observe("db").await.len(), 1);
        // Retired.
        assert!(manager.observe("db").await.is_empty());

        manager.reset();
        assert_eq!(manager.observe("db").await.len(), 1);
    }

    #[tokio::test]
    async fn test_custom_action_runs_and_emits_outcome() {
        let bus = Arc::new(EventBus::new());
        let completions = Arc::new(AtomicU32::new(0));
        let counter = completions.clone();
        bus.subscribe(
            "recovery.completed",
            crate::event::SubscribeOptions::default(),
            move |_event| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            },
        );

        let ran = Arc::new(AtomicU32::new(0));
        let ran_inner = ran.clone();
        let manager = RecoveryManager::new(bus);
        manager.add_rule(RecoveryRule {
            id: "custom".to_string(),
            condition: "db".to_string(),
            threshold: 1,
            window: Duration::from_secs(60),
            cooldown: Duration::ZERO,
            max_attempts: 5,
            action: RecoveryAction::Custom(Arc::new(move || {
                let ran = ran_inner.clone();
                Box::pin(async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })),
        });

        manager.observe("db").await;
        // Give the detached action a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }
}
