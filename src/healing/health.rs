//! Health monitoring: a registry of named checks with per-check intervals.
//!
//! Each check is an async thunk returning a state and message. The aggregate
//! status is the worst state among critical checks; transitions emit a
//! `health.status_changed` event on the bus.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::event::{EventBus, EventMetadata};

/// Health of one check or of the whole system. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of one check run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub state: HealthState,
    pub message: String,
    pub checked_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// The async thunk a check runs.
pub type HealthCheckFn =
    Arc<dyn Fn() -> BoxFuture<'static, (HealthState, String)> + Send + Sync>;

struct CheckEntry {
    critical: bool,
    interval: Duration,
    check: HealthCheckFn,
    last: Option<HealthCheckResult>,
    last_run: Option<Instant>,
}

/// Registry of named health checks with an aggregate status.
pub struct HealthMonitor {
    checks: DashMap<String, CheckEntry>,
    bus: Arc<EventBus>,
    aggregate: Mutex<HealthState>,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    /// A monitor publishing status changes to the given bus.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            checks: DashMap::new(),
            bus,
            aggregate: Mutex::new(HealthState::Healthy),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a named check. `critical` checks drive the aggregate status.
    pub fn register_check<F>(
        &self,
        name: impl Into<String>,
        critical: bool,
        interval: Duration,
        check: F,
    ) where
        F: Fn() -> BoxFuture<'static, (HealthState, String)> + Send + Sync + 'static,
    {
        self.checks.insert(
            name.into(),
            CheckEntry {
                critical,
                interval,
                check: Arc::new(check),
                last: None,
                last_run: None,
            },
        );
    }

    /// Run every check whose interval has elapsed (or that never ran).
    /// Returns the aggregate status afterwards.
    pub async fn run_due_checks(&self) -> HealthState {
        let now = Instant::now();
        let due: Vec<(String, HealthCheckFn)> = self
            .checks
            .iter()
            .filter(|entry| {
                entry
                    .last_run
                    .map(|t| now.duration_since(t) >= entry.interval)
                    .unwrap_or(true)
            })
            .map(|entry| (entry.key().clone(), entry.check.clone()))
            .collect();

        for (name, check) in due {
            let started = Instant::now();
            let (state, message) = check().await;
            let result = HealthCheckResult {
                state,
                message,
                checked_at: Utc::now(),
                duration_ms: started.elapsed().as_millis() as u64,
            };
            debug!(check = %name, state = ?result.state, "health check ran");
            if let Some(mut entry) = self.checks.get_mut(&name) {
                entry.last = Some(result);
                entry.last_run = Some(Instant::now());
            }
        }

        self.recompute_aggregate().await
    }

    async fn recompute_aggregate(&self) -> HealthState {
        let worst = self
            .checks
            .iter()
            .filter(|entry| entry.critical)
            .filter_map(|entry| entry.last.as_ref().map(|r| r.state))
            .max()
            .unwrap_or(HealthState::Healthy);

        let previous = {
            let mut aggregate = self.aggregate.lock().expect("health aggregate lock");
            let previous = *aggregate;
            *aggregate = worst;
            previous
        };

        if previous != worst {
            info!(from = ?previous, to = ?worst, "aggregate health changed");
            self.bus
                .emit(
                    "health.status_changed",
                    json!({ "from": previous, "to": worst }),
                    EventMetadata::default(),
                )
                .await;
        }
        worst
    }

    /// The current aggregate status.
    pub fn status(&self) -> HealthState {
        *self.aggregate.lock().expect("health aggregate lock")
    }

    /// The last result of one check.
    pub fn check_result(&self, name: &str) -> Option<HealthCheckResult> {
        self.checks.get(name).and_then(|entry| entry.last.clone())
    }

    /// Spawn the background loop driving due checks until shutdown.
    pub fn start(self: &Arc<Self>, tick: Duration) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.run_due_checks().await;
                    }
                    _ = monitor.shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Stop the background loop and clear recorded results.
    pub fn stop(&self) {
        self.shutdown.cancel();
        for mut entry in self.checks.iter_mut() {
            entry.last = None;
            entry.last_run = None;
        }
        *self.aggregate.lock().expect("health aggregate lock") = HealthState::Healthy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn static_check(state: HealthState) -> impl Fn() -> BoxFuture<'static, (HealthState, String)> {
        move || Box::pin(async move { (state, format!("{:?}", state)) })
    }

    #[tokio::test]
    async fn test_aggregate_is_worst_critical() {
        let bus = Arc::new(EventBus::new());
        let monitor = HealthMonitor::new(bus);
        monitor.register_check("db", true, Duration::ZERO, static_check(HealthState::Healthy));
        monitor.register_check(
            "queue",
            true,
            Duration::ZERO,
            static_check(HealthState::Degraded),
        );
        // Non-critical checks never drive the aggregate.
        monitor.register_check(
            "metrics",
            false,
            Duration::ZERO,
            static_check(HealthState::Unhealthy),
        );

        let status = monitor.run_due_checks().await;
        assert_eq!(status, HealthState::Degraded);
        assert_eq!(monitor.status(), HealthState::Degraded);
        assert_eq!(
            monitor.check_result("metrics").unwrap().state,
            HealthState::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_status_change_emits_event() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        bus.subscribe(
            "health.status_changed",
            crate::event::SubscribeOptions::default(),
            move |_event| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            },
        );

        let monitor = HealthMonitor::new(bus);
        monitor.register_check(
            "db",
            true,
            Duration::ZERO,
            static_check(HealthState::Unhealthy),
        );

        monitor.run_due_checks().await;
        // Second run: no change, no extra event.
        monitor.run_due_checks().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interval_gates_check_runs() {
        let bus = Arc::new(EventBus::new());
        let monitor = HealthMonitor::new(bus);
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        monitor.register_check("slow", true, Duration::from_secs(3_600), move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (HealthState::Healthy, "ok".to_string())
            })
        });

        monitor.run_due_checks().await;
        monitor.run_due_checks().await;
        // The hour-long interval has not elapsed between the two runs.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_clears_state() {
        let bus = Arc::new(EventBus::new());
        let monitor = HealthMonitor::new(bus);
        monitor.register_check(
            "db",
            true,
            Duration::ZERO,
            static_check(HealthState::Unhealthy),
        );
        monitor.run_due_checks().await;
        assert_eq!(monitor.status(), HealthState::Unhealthy);

        monitor.stop();
        assert_eq!(monitor.status(), HealthState::Healthy);
        assert!(monitor.check_result("db").is_none());
    }
}
