//! Graceful degradation: a per-service level tracker with hysteresis.
//!
//! `degradation_threshold` consecutive unhealthy observations drop a service
//! one tier; `recovery_threshold` consecutive healthy observations restore
//! one tier. Callers read the current level to short-circuit non-essential
//! work before it ever reaches a struggling dependency.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Service tiers from full capability down to offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLevel {
    Full,
    Reduced,
    Minimal,
    Offline,
}

impl ServiceLevel {
    fn degraded(self) -> ServiceLevel {
        match self {
            ServiceLevel::Full => ServiceLevel::Reduced,
            ServiceLevel::Reduced => ServiceLevel::Minimal,
            ServiceLevel::Minimal | ServiceLevel::Offline => ServiceLevel::Offline,
        }
    }

    fn restored(self) -> ServiceLevel {
        match self {
            ServiceLevel::Offline => ServiceLevel::Minimal,
            ServiceLevel::Minimal => ServiceLevel::Reduced,
            ServiceLevel::Reduced | ServiceLevel::Full => ServiceLevel::Full,
        }
    }
}

/// Hysteresis thresholds.
#[derive(Debug, Clone)]
pub struct DegradationConfig {
    /// Consecutive unhealthy observations before dropping a tier.
    pub degradation_threshold: u32,
    /// Consecutive healthy observations before restoring a tier.
    pub recovery_threshold: u32,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            degradation_threshold: 3,
            recovery_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LevelState {
    level: ServiceLevel,
    healthy_streak: u32,
    unhealthy_streak: u32,
}

impl Default for LevelState {
    fn default() -> Self {
        Self {
            level: ServiceLevel::Full,
            healthy_streak: 0,
            unhealthy_streak: 0,
        }
    }
}

/// Per-service degradation tracker.
pub struct DegradationTracker {
    services: DashMap<String, LevelState>,
    config: DegradationConfig,
}

impl Default for DegradationTracker {
    fn default() -> Self {
        Self::new(DegradationConfig::default())
    }
}

impl DegradationTracker {
    /// A tracker with the given hysteresis thresholds.
    pub fn new(config: DegradationConfig) -> Self {
        Self {
            services: DashMap::new(),
            config,
        }
    }

    /// Feed one observation. Returns `Some((from, to))` when the service
    /// changed tier.
    pub fn observe(&self, service: &str, healthy: bool) -> Option<(ServiceLevel, ServiceLevel)> {
        let mut entry = self.services.entry(service.to_string()).or_default();
        if healthy {
            entry.healthy_streak += 1;
            entry.unhealthy_streak = 0;
            if entry.healthy_streak >= self.config.recovery_threshold
                && entry.level != ServiceLevel::Full
            {
                let from = entry.level;
                entry.level = entry.level.restored();
                entry.healthy_streak = 0;
                info!(service, ?from, to = ?entry.level, "service level restored");
                return Some((from, entry.level));
            }
        } else {
            entry.unhealthy_streak += 1;
            entry.healthy_streak = 0;
            if entry.unhealthy_streak >= self.config.degradation_threshold
                && entry.level != ServiceLevel::Offline
            {
                let from = entry.level;
                entry.level = entry.level.degraded();
                entry.unhealthy_streak = 0;
                info!(service, ?from, to = ?entry.level, "service level degraded");
                return Some((from, entry.level));
            }
        }
        None
    }

    /// Current level of a service; unknown services are at full capability.
    pub fn level(&self, service: &str) -> ServiceLevel {
        self.services
            .get(service)
            .map(|entry| entry.level)
            .unwrap_or(ServiceLevel::Full)
    }

    /// Reset every service back to full with cleared streaks.
    pub fn reset_all(&self) {
        self.services.clear();
    }
}
