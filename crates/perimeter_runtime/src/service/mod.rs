//! Service Lifecycle Management
//!
//! Services are long-running components that react to bus events. Device
//! sessions are not services (each owns its own connection task); services sit
//! beside them and turn session telemetry into platform-level events.
//!
//! # Lifecycle
//!
//! - `on_start`: called once before the service receives anything
//! - `on_event`: called for every bus event matching one of its subscriptions
//! - `on_tick`: called periodically if the spec sets a tick interval
//! - `on_stop`: called during shutdown, bounded by the spec's shutdown timeout

mod event;
mod handle;
mod manager;

pub use event::*;
pub use handle::*;
pub use manager::*;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Service Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur during service lifecycle
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Service initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Service already running: {0}")]
    AlreadyRunning(String),

    #[error("Service not running: {0}")]
    NotRunning(String),

    #[error("Event handling failed: {0}")]
    EventError(String),

    #[error("Shutdown timeout")]
    ShutdownTimeout,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

// ─────────────────────────────────────────────────────────────────────────────
// Service Specification
// ─────────────────────────────────────────────────────────────────────────────

/// Static description of a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique service identifier (e.g. "registry/presence")
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Optional tick interval for periodic on_tick calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_interval: Option<Duration>,

    /// Event patterns this service subscribes to (e.g. "device/connection", "device/*")
    #[serde(default)]
    pub subscriptions: Vec<String>,

    /// Whether a second service with the same id is rejected
    #[serde(default = "default_singleton")]
    pub singleton: bool,

    /// Upper bound on on_stop
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_singleton() -> bool {
    true
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            tick_interval: None,
            subscriptions: Vec::new(),
            singleton: default_singleton(),
            shutdown_timeout: default_shutdown_timeout(),
            description: None,
        }
    }
}

impl ServiceSpec {
    /// Create a new service spec with required fields
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    /// Add a single subscription pattern
    pub fn subscribe(mut self, pattern: impl Into<String>) -> Self {
        self.subscriptions.push(pattern.into());
        self
    }

    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Context
// ─────────────────────────────────────────────────────────────────────────────

/// Context passed to service lifecycle methods
pub struct ServiceContext {
    pub service_id: String,
    event_publisher: EventPublisher,
}

impl ServiceContext {
    pub fn new(service_id: String, event_publisher: EventPublisher) -> Self {
        Self {
            service_id,
            event_publisher,
        }
    }

    /// Publish an event on the bus
    pub fn publish(&self, event: Event) -> ServiceResult<()> {
        self.event_publisher.publish(event)
    }

    /// Create and publish an event sourced from this service
    pub fn emit(&self, event_type: impl Into<String>, data: serde_json::Value) -> ServiceResult<()> {
        self.publish(Event::new(event_type, &self.service_id, data))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A long-running component managed by the [`ServiceManager`]
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn spec(&self) -> ServiceSpec;

    /// Called when the service starts. An error here keeps the service from
    /// entering the running state.
    async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    /// Called when the service stops. The service is considered stopped even
    /// if this returns an error.
    async fn on_stop(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    async fn on_event(&mut self, _ctx: &ServiceContext, _event: Event) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
