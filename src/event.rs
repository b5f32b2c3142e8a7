//! # Event System
//!
//! A typed publish/subscribe bus local to the engine process. Listeners are
//! notified in priority order, handler failures are captured in the emission
//! result without blocking other listeners, `once` subscriptions retire
//! themselves after their first successful invocation, and `node.*`-style
//! prefix patterns match whole event families.
//!
//! Every emission carries a correlation id (propagated from the emitting
//! execution) and an optional causation id, which is how request-scoped
//! observers attach to a single execution. Emissions are totally ordered by a
//! monotonic sequence number.
//!
//! The listener map is held behind a single mutex; emission snapshots the
//! matching listeners and releases the lock before invoking any handler, so
//! handlers may freely subscribe or emit without deadlocking the bus.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::EngineError;

/// An event as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// Unique event id.
    pub id: String,
    /// Monotonic sequence number; emissions are totally ordered by it.
    pub seq: u64,
    /// Dotted event type, e.g. `workflow.started`.
    pub event_type: String,
    /// Event payload.
    pub data: Value,
    /// Correlation id tying the event to an originating execution.
    pub correlation_id: Option<String>,
    /// Id of the event that caused this one, if any.
    pub causation_id: Option<String>,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Metadata attached to an emission.
#[derive(Debug, Clone, Default)]
pub struct EventMetadata {
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
}

impl EventMetadata {
    /// Metadata carrying only a correlation id.
    pub fn correlated(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            causation_id: None,
        }
    }

    /// Set the causation id.
    pub fn caused_by(mut self, event_id: impl Into<String>) -> Self {
        self.causation_id = Some(event_id.into());
        self
    }
}

/// Outcome of a single emission.
#[derive(Debug, Clone)]
pub struct EmissionResult {
    pub event_id: String,
    pub listeners_notified: usize,
    /// Handler failures, captured instead of propagated.
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: Uuid,
    pattern: String,
}

/// Handler invoked per matching emission. Failures are captured in the
/// emission result rather than propagated to the emitter.
pub type EventHandler =
    Arc<dyn Fn(BusEvent) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Predicate narrowing which events a subscription sees.
pub type EventFilter = Arc<dyn Fn(&BusEvent) -> bool + Send + Sync>;

/// Options for a subscription.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Higher priority listeners run first; ties break by subscription order.
    pub priority: i32,
    /// Auto-unsubscribe after the first successful invocation.
    pub once: bool,
    /// Optional event filter.
    pub filter: Option<EventFilter>,
}

impl SubscribeOptions {
    /// Options with the given priority.
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    /// One-shot subscription options.
    pub fn once() -> Self {
        Self {
            once: true,
            ..Default::default()
        }
    }

    /// Filter to a single correlation id.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        let wanted = correlation_id.into();
        self.filter = Some(Arc::new(move |event: &BusEvent| {
            event.correlation_id.as_deref() == Some(wanted.as_str())
        }));
        self
    }
}

struct Subscription {
    id: Uuid,
    order: u64,
    priority: i32,
    once: bool,
    filter: Option<EventFilter>,
    handler: EventHandler,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBusStats {
    pub emissions: u64,
    pub subscriptions: usize,
}

/// The process-local event bus.
pub struct EventBus {
    // Keyed by subscription pattern (exact type or `prefix.*`).
    listeners: Mutex<HashMap<String, Vec<Subscription>>>,
    seq: AtomicU64,
    sub_order: AtomicU64,
    emissions: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            sub_order: AtomicU64::new(0),
            emissions: AtomicU64::new(0),
        }
    }

    /// Subscribe a handler to an event type or `prefix.*` pattern.
    pub fn subscribe<F>(
        &self,
        pattern: impl Into<String>,
        options: SubscribeOptions,
        handler: F,
    ) -> SubscriptionHandle
    where
        F: Fn(BusEvent) -> BoxFuture<'static, Result<(), String>> + Send + Sync + 'static,
    {
        let pattern = pattern.into();
        let id = Uuid::new_v4();
        let subscription = Subscription {
            id,
            order: self.sub_order.fetch_add(1, Ordering::Relaxed),
            priority: options.priority,
            once: options.once,
            filter: options.filter,
            handler: Arc::new(handler),
        };

        let mut listeners = self.listeners.lock().expect("event bus lock poisoned");
        listeners.entry(pattern.clone()).or_default().push(subscription);

        SubscriptionHandle { id, pattern }
    }

    /// Remove a subscription. Unknown handles are ignored.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut listeners = self.listeners.lock().expect("event bus lock poisoned");
        if let Some(subs) = listeners.get_mut(&handle.pattern) {
            subs.retain(|s| s.id != handle.id);
            if subs.is_empty() {
                listeners.remove(&handle.pattern);
            }
        }
    }

    /// Emit an event, notifying matching listeners in priority order.
    pub async fn emit(
        &self,
        event_type: impl Into<String>,
        data: Value,
        metadata: EventMetadata,
    ) -> EmissionResult {
        let started = Instant::now();
        let event = BusEvent {
            id: Uuid::new_v4().to_string(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            event_type: event_type.into(),
            data,
            correlation_id: metadata.correlation_id,
            causation_id: metadata.causation_id,
            timestamp: Utc::now(),
        };
        self.emissions.fetch_add(1, Ordering::Relaxed);

        // Snapshot matching listeners, then release the lock before any
        // handler runs so handlers can touch the bus again.
        let mut matched: Vec<(String, Uuid, i32, u64, bool, Option<EventFilter>, EventHandler)> = {
            let listeners = self.listeners.lock().expect("event bus lock poisoned");
            listeners
                .iter()
                .filter(|(pattern, _)| pattern_matches(pattern, &event.event_type))
                .flat_map(|(pattern, subs)| {
                    subs.iter().map(|s| {
                        (
                            pattern.clone(),
                            s.id,
                            s.priority,
                            s.order,
                            s.once,
                            s.filter.clone(),
                            s.handler.clone(),
                        )
                    })
                })
                .collect()
        };
        matched.sort_by(|a, b| b.2.cmp(&a.2).then(a.3.cmp(&b.3)));

        let mut notified = 0;
        let mut errors = Vec::new();
        let mut retire = Vec::new();

        for (pattern, id, _, _, once, filter, handler) in matched {
            if let Some(filter) = &filter {
                if !filter(&event) {
                    continue;
                }
            }
            notified += 1;
            match handler(event.clone()).await {
                Ok(()) => {
                    if once {
                        retire.push(SubscriptionHandle { id, pattern });
                    }
                }
                Err(message) => errors.push(message),
            }
        }

        for handle in &retire {
            self.unsubscribe(handle);
        }

        EmissionResult {
            event_id: event.id,
            listeners_notified: notified,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Suspend until the next event of the given type arrives, returning its
    /// payload. Fails with a timeout error when none arrives in time.
    pub async fn wait_for(
        &self,
        event_type: impl Into<String>,
        timeout: Duration,
    ) -> Result<Value, EngineError> {
        let event_type = event_type.into();
        let (tx, rx) = oneshot::channel::<Value>();
        let sender = Arc::new(Mutex::new(Some(tx)));

        let handle = self.subscribe(event_type.clone(), SubscribeOptions::once(), move |event| {
            let sender = sender.clone();
            Box::pin(async move {
                if let Some(tx) = sender.lock().expect("wait_for sender lock").take() {
                    let _ = tx.send(event.data);
                }
                Ok(())
            })
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            // Either the timer fired or the bus dropped the sender.
            _ => {
                self.unsubscribe(&handle);
                Err(EngineError::Timeout(format!(
                    "no '{}' event within {:?}",
                    event_type, timeout
                )))
            }
        }
    }

    /// Observability counters.
    pub fn stats(&self) -> EventBusStats {
        let listeners = self.listeners.lock().expect("event bus lock poisoned");
        EventBusStats {
            emissions: self.emissions.load(Ordering::Relaxed),
            subscriptions: listeners.values().map(Vec::len).sum(),
        }
    }

    /// Drop every subscription. Used on engine shutdown.
    pub fn drain(&self) {
        let mut listeners = self.listeners.lock().expect("event bus lock poisoned");
        listeners.clear();
    }
}

fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == event_type || pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => event_type
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn recording_handler(log: Arc<Mutex<Vec<String>>>, tag: &str) -> impl Fn(BusEvent) -> BoxFuture<'static, Result<(), String>> {
        let tag = tag.to_string();
        move |_event| {
            let log = log.clone();
            let tag = tag.clone();
            Box::pin(async move {
                log.lock().unwrap().push(tag);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_emit_notifies_in_priority_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            "task.done",
            SubscribeOptions::priority(1),
            recording_handler(log.clone(), "low"),
        );
        bus.subscribe(
            "task.done",
            SubscribeOptions::priority(10),
            recording_handler(log.clone(), "high"),
        );
        bus.subscribe(
            "task.done",
            SubscribeOptions::priority(5),
            recording_handler(log.clone(), "mid"),
        );

        let result = bus.emit("task.done", json!({}), EventMetadata::default()).await;
        assert_eq!(result.listeners_notified, 3);
        assert!(result.errors.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_handler_errors_are_captured_not_propagated() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe("x", SubscribeOptions::priority(10), |_event| {
            Box::pin(async move { Err("boom".to_string()) })
        });
        bus.subscribe(
            "x",
            SubscribeOptions::priority(1),
            recording_handler(log.clone(), "ran"),
        );

        let result = bus.emit("x", json!({}), EventMetadata::default()).await;
        assert_eq!(result.errors, vec!["boom".to_string()]);
        // The failing listener did not block the next one.
        assert_eq!(*log.lock().unwrap(), vec!["ran"]);
    }

    #[tokio::test]
    async fn test_once_subscription_retires_after_success() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        bus.subscribe("tick", SubscribeOptions::once(), move |_event| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        bus.emit("tick", json!({}), EventMetadata::default()).await;
        bus.emit("tick", json!({}), EventMetadata::default()).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().subscriptions, 0);
    }

    #[tokio::test]
    async fn test_prefix_pattern_matching() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            "node.*",
            SubscribeOptions::default(),
            recording_handler(log.clone(), "node"),
        );

        bus.emit("node.started", json!({}), EventMetadata::default()).await;
        bus.emit("node.completed", json!({}), EventMetadata::default()).await;
        bus.emit("workflow.started", json!({}), EventMetadata::default()).await;
        // "nodex.started" must not match the "node." prefix.
        bus.emit("nodex.started", json!({}), EventMetadata::default()).await;

        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_correlation_filter() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            "step",
            SubscribeOptions::default().with_correlation("exec-1"),
            recording_handler(log.clone(), "seen"),
        );

        bus.emit("step", json!({}), EventMetadata::correlated("exec-2")).await;
        bus.emit("step", json!({}), EventMetadata::correlated("exec-1")).await;

        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_receives_data() {
        let bus = Arc::new(EventBus::new());
        let emitter = bus.clone();

        let waiter = tokio::spawn(async move {
            bus.wait_for("signal", Duration::from_secs(1)).await
        });
        // Give the waiter a moment to subscribe.
        tokio::time::sleep(Duration::from_millis(20)).await;
        emitter
            .emit("signal", json!({"ok": true}), EventMetadata::default())
            .await;

        let data = waiter.await.unwrap().unwrap();
        assert_eq!(data, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let bus = EventBus::new();
        let result = bus.wait_for("never", Duration::from_millis(20)).await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
        // The one-shot subscription cleaned itself up.
        assert_eq!(bus.stats().subscriptions, 0);
    }

    #[tokio::test]
    async fn test_monotonic_sequence() {
        let bus = EventBus::new();
        let a = bus.emit("a", json!({}), EventMetadata::default()).await;
        let b = bus.emit("b", json!({}), EventMetadata::default()).await;
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(bus.stats().emissions, 2);
    }
}
