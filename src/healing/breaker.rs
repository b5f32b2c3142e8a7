//! Circuit breakers, one state machine per logical service name.
//!
//! CLOSED permits calls and counts consecutive failures; at
//! `failure_threshold` the breaker trips to OPEN, which rejects immediately
//! until `reset_timeout` elapses. The first call after that runs as a
//! HALF_OPEN probe: success restores CLOSED and clears the counter, failure
//! reopens the breaker. Breakers for unrelated services never contend.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::{EngineError, EngineResult};

/// The three breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds for one breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED that trip the breaker.
    pub failure_threshold: u32,
    /// How long OPEN rejects before permitting a probe.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

struct BreakerInner {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerInner {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Keyed collection of independent circuit breakers.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Mutex<BreakerInner>>,
    default_config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// A registry whose breakers start from the given default config.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Override the config for one service, resetting its breaker.
    pub fn configure(&self, service: impl Into<String>, config: CircuitBreakerConfig) {
        self.breakers
            .insert(service.into(), Mutex::new(BreakerInner::new(config)));
    }

    fn with_breaker<R>(&self, service: &str, f: impl FnOnce(&mut BreakerInner) -> R) -> R {
        let entry = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(|| Mutex::new(BreakerInner::new(self.default_config.clone())));
        let mut inner = entry.lock().expect("breaker lock poisoned");
        f(&mut inner)
    }

    /// Gate a call: `Ok` admits it (possibly as the HALF_OPEN probe),
    /// `CircuitOpen` rejects it.
    pub fn allow(&self, service: &str) -> EngineResult<()> {
        self.with_breaker(service, |inner| match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= inner.config.reset_timeout {
                    debug!(service, "circuit breaker half-open, admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(EngineError::CircuitOpen {
                        service: service.to_string(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(EngineError::CircuitOpen {
                        service: service.to_string(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        })
    }

    /// Record a successful call.
    pub fn record_success(&self, service: &str) {
        self.with_breaker(service, |inner| {
            match inner.state {
                CircuitState::HalfOpen => {
                    debug!(service, "probe succeeded, circuit breaker closed");
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                }
                CircuitState::Closed | CircuitState::Open => {}
            }
            inner.consecutive_failures = 0;
            inner.probe_in_flight = false;
        });
    }

    /// Record a failed call.
    pub fn record_failure(&self, service: &str) {
        self.with_breaker(service, |inner| match inner.state {
            CircuitState::HalfOpen => {
                warn!(service, "probe failed, circuit breaker reopened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= inner.config.failure_threshold {
                    warn!(
                        service,
                        failures = inner.consecutive_failures,
                        "failure threshold reached, circuit breaker opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        });
    }

    /// The current state of a service's breaker.
    pub fn state(&self, service: &str) -> CircuitState {
        self.with_breaker(service, |inner| inner.state)
    }

    /// Reset every breaker to CLOSED with cleared counters.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            let mut inner = entry.value().lock().expect("breaker lock poisoned");
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.probe_in_flight = false;
        }
    }
}
