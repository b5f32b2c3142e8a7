//! # Self-Healing Orchestrator
//!
//! Composes five resilience primitives around engine-mediated operations and
//! external dependencies:
//!
//! - [`breaker::CircuitBreakerRegistry`]: per-service CLOSED/OPEN/HALF_OPEN gates
//! - [`bulkhead::BulkheadRegistry`]: named bounded slot pools
//! - [`retry::retry_with_policy`]: generic backoff retries
//! - [`health::HealthMonitor`]: named checks with an aggregate status
//! - [`degradation::DegradationTracker`] + [`recovery::RecoveryManager`]:
//!   service-level hysteresis and rule-driven remediation
//!
//! [`SelfHealingOrchestrator::execute`] wraps one operation in the full
//! stack: breaker gate, optional bulkhead slot, optional retry policy, with
//! every outcome fed back into the breaker, the degradation tracker, and the
//! recovery rules. State for unrelated service keys never contends; all
//! counters reset on shutdown.

use std::future::Future;
use std::sync::Arc;

use crate::definition::RetryPolicy;
use crate::event::EventBus;
use crate::{EngineError, EngineResult};

pub mod breaker;
pub mod bulkhead;
pub mod degradation;
pub mod health;
pub mod recovery;
pub mod retry;

pub use breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use bulkhead::{BulkheadPermit, BulkheadRegistry};
pub use degradation::{DegradationConfig, DegradationTracker, ServiceLevel};
pub use health::{HealthCheckResult, HealthMonitor, HealthState};
pub use recovery::{RecoveryAction, RecoveryManager, RecoveryRule};
pub use retry::retry_with_policy;

/// Tuning for a fresh orchestrator.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub breaker: CircuitBreakerConfig,
    pub degradation: DegradationConfig,
    /// Slots per bulkhead pool unless configured individually.
    pub default_bulkhead_slots: usize,
    /// Retry policy applied by [`SelfHealingOrchestrator::execute`] when the
    /// caller marks the operation retriable.
    pub retry_policy: Option<RetryPolicy>,
}

/// The composed resilience layer.
pub struct SelfHealingOrchestrator {
    breakers: CircuitBreakerRegistry,
    bulkheads: BulkheadRegistry,
    health: Arc<HealthMonitor>,
    degradation: DegradationTracker,
    recovery: RecoveryManager,
    retry_policy: Option<RetryPolicy>,
}

impl SelfHealingOrchestrator {
    /// Build an orchestrator publishing to the given bus.
    pub fn new(config: OrchestratorConfig, bus: Arc<EventBus>) -> Self {
        let slots = if config.default_bulkhead_slots == 0 {
            10
        } else {
            config.default_bulkhead_slots
        };
        Self {
            breakers: CircuitBreakerRegistry::new(config.breaker),
            bulkheads: BulkheadRegistry::new(slots),
            health: Arc::new(HealthMonitor::new(bus.clone())),
            degradation: DegradationTracker::new(config.degradation),
            recovery: RecoveryManager::new(bus),
            retry_policy: config.retry_policy,
        }
    }

    /// The circuit breaker registry.
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// The bulkhead registry.
    pub fn bulkheads(&self) -> &BulkheadRegistry {
        &self.bulkheads
    }

    /// The health monitor.
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// The degradation tracker.
    pub fn degradation(&self) -> &DegradationTracker {
        &self.degradation
    }

    /// The recovery rule manager.
    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// Run an operation behind the named service's circuit breaker.
    pub async fn execute<T, F, Fut>(&self, service: &str, op: F) -> EngineResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        self.execute_inner(service, None, op).await
    }

    /// Run an operation behind the breaker and a bulkhead pool.
    pub async fn execute_in_pool<T, F, Fut>(
        &self,
        service: &str,
        pool: &str,
        op: F,
    ) -> EngineResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        self.execute_inner(service, Some(pool), op).await
    }

    async fn execute_inner<T, F, Fut>(
        &self,
        service: &str,
        pool: Option<&str>,
        mut op: F,
    ) -> EngineResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        self.breakers.allow(service)?;

        // Held for the whole operation; released unconditionally on drop.
        let _slot: Option<BulkheadPermit> = match pool {
            Some(pool) => Some(self.bulkheads.try_acquire(pool)?),
            None => None,
        };

        let outcome = match &self.retry_policy {
            Some(policy) => retry_with_policy(policy, None, &mut op).await,
            None => op(1).await,
        };

        match &outcome {
            Ok(_) => {
                self.breakers.record_success(service);
                self.degradation.observe(service, true);
            }
            Err(error) => {
                self.breakers.record_failure(service);
                self.degradation.observe(service, false);
                self.recovery.observe(service).await;
                tracing::debug!(service, error = %error, "protected operation failed");
            }
        }
        outcome
    }

    /// Reset every counter and stop background monitoring.
    pub fn shutdown(&self) {
        self.breakers.reset_all();
        self.degradation.reset_all();
        self.recovery.reset();
        self.health.stop();
    }
}
