//! # Service Locator
//!
//! External collaborators the engine consumes but never implements: database,
//! notifications, analytics, authentication, AI and cache. Only the shapes are
//! defined here; real implementations live outside the crate and are injected
//! at engine construction. No-op defaults keep tests and embedding simple.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::{EngineError, EngineResult};

/// Database access: queries and transactions.
#[async_trait]
pub trait DatabaseService: Send + Sync {
    async fn query(&self, statement: &str, params: Vec<Value>) -> EngineResult<Value>;
    async fn transaction(&self, statements: Vec<(String, Vec<Value>)>) -> EngineResult<Value>;
}

/// Outbound notification delivery.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send(&self, message: NotificationMessage) -> EngineResult<()>;
    async fn send_batch(&self, messages: Vec<NotificationMessage>) -> EngineResult<()> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }
}

/// A single outbound notification.
#[derive(Debug, Clone)]
pub struct NotificationMessage {
    pub channel: String,
    pub recipient: String,
    pub subject: String,
    pub message: String,
    pub priority: i32,
}

/// Analytics event tracking.
#[async_trait]
pub trait AnalyticsService: Send + Sync {
    async fn track(&self, event: &str, properties: Value) -> EngineResult<()>;
}

/// Authentication and authorization checks.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn validate_token(&self, token: &str) -> EngineResult<Value>;
    async fn fetch_user(&self, user_id: &str) -> EngineResult<Value>;
    async fn check_permission(&self, user_id: &str, permission: &str) -> EngineResult<bool>;
}

/// AI assistance surface.
#[async_trait]
pub trait AiService: Send + Sync {
    async fn generate_content(&self, prompt: &str, options: Value) -> EngineResult<Value>;
    async fn analyze_performance(&self, data: Value) -> EngineResult<Value>;
    async fn recommend_content(&self, context: Value) -> EngineResult<Value>;
}

/// Key-value cache surface.
#[async_trait]
pub trait CacheService: Send + Sync {
    async fn get(&self, key: &str) -> EngineResult<Option<Value>>;
    async fn set(&self, key: &str, value: Value, ttl_seconds: Option<u64>) -> EngineResult<()>;
    async fn delete(&self, key: &str) -> EngineResult<()>;
    async fn clear(&self) -> EngineResult<()>;
}

/// The locator handed to plugins and action handlers.
///
/// Services left unset resolve to no-op defaults, so handlers can call into
/// the locator unconditionally.
#[derive(Clone)]
pub struct ServiceLocator {
    database: Option<Arc<dyn DatabaseService>>,
    notification: Arc<dyn NotificationService>,
    analytics: Arc<dyn AnalyticsService>,
    auth: Option<Arc<dyn AuthService>>,
    ai: Option<Arc<dyn AiService>>,
    cache: Arc<dyn CacheService>,
}

impl Default for ServiceLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceLocator {
    /// A locator wired to no-op defaults.
    pub fn new() -> Self {
        Self {
            database: None,
            notification: Arc::new(NullNotificationService),
            analytics: Arc::new(NullAnalyticsService),
            auth: None,
            ai: None,
            cache: Arc::new(MemoryCacheService::default()),
        }
    }

    /// Install a database service.
    pub fn with_database(mut self, service: Arc<dyn DatabaseService>) -> Self {
        self.database = Some(service);
        self
    }

    /// Install a notification service.
    pub fn with_notification(mut self, service: Arc<dyn NotificationService>) -> Self {
        self.notification = service;
        self
    }

    /// Install an analytics service.
    pub fn with_analytics(mut self, service: Arc<dyn AnalyticsService>) -> Self {
        self.analytics = service;
        self
    }

    /// Install an auth service.
    pub fn with_auth(mut self, service: Arc<dyn AuthService>) -> Self {
        self.auth = Some(service);
        self
    }

    /// Install an AI service.
    pub fn with_ai(mut self, service: Arc<dyn AiService>) -> Self {
        self.ai = Some(service);
        self
    }

    /// Install a cache service.
    pub fn with_cache(mut self, service: Arc<dyn CacheService>) -> Self {
        self.cache = service;
        self
    }

    /// The database service, if one was installed.
    pub fn database(&self) -> EngineResult<Arc<dyn DatabaseService>> {
        self.database
            .clone()
            .ok_or_else(|| EngineError::Configuration("no database service installed".to_string()))
    }

    /// The notification service.
    pub fn notification(&self) -> Arc<dyn NotificationService> {
        self.notification.clone()
    }

    /// The analytics service.
    pub fn analytics(&self) -> Arc<dyn AnalyticsService> {
        self.analytics.clone()
    }

    /// The auth service, if one was installed.
    pub fn auth(&self) -> EngineResult<Arc<dyn AuthService>> {
        self.auth
            .clone()
            .ok_or_else(|| EngineError::Configuration("no auth service installed".to_string()))
    }

    /// The AI service, if one was installed.
    pub fn ai(&self) -> EngineResult<Arc<dyn AiService>> {
        self.ai
            .clone()
            .ok_or_else(|| EngineError::Configuration("no AI service installed".to_string()))
    }

    /// The cache service.
    pub fn cache(&self) -> Arc<dyn CacheService> {
        self.cache.clone()
    }
}

// ============================================================================
// DEFAULT IMPLEMENTATIONS
// ============================================================================

/// Discards every notification.
struct NullNotificationService;

#[async_trait]
impl NotificationService for NullNotificationService {
    async fn send(&self, message: NotificationMessage) -> EngineResult<()> {
        tracing::debug!(channel = %message.channel, recipient = %message.recipient, "notification discarded by null service");
        Ok(())
    }
}

/// Discards every analytics event.
struct NullAnalyticsService;

#[async_trait]
impl AnalyticsService for NullAnalyticsService {
    async fn track(&self, event: &str, _properties: Value) -> EngineResult<()> {
        tracing::debug!(event, "analytics event discarded by null service");
        Ok(())
    }
}

/// In-memory cache, suitable for tests and embedding.
#[derive(Default)]
pub struct MemoryCacheService {
    entries: Mutex<HashMap<String, Value>>,
}

#[async_trait]
impl CacheService for MemoryCacheService {
    async fn get(&self, key: &str) -> EngineResult<Option<Value>> {
        Ok(self.entries.lock().expect("cache lock").get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value, _ttl_seconds: Option<u64>) -> EngineResult<()> {
        self.entries
            .lock()
            .expect("cache lock")
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        self.entries.lock().expect("cache lock").remove(key);
        Ok(())
    }

    async fn clear(&self) -> EngineResult<()> {
        self.entries.lock().expect("cache lock").clear();
        Ok(())
    }
}
