//! Bus Events
//!
//! Events are how sessions, the registry, and the coordinator tell the rest of
//! the platform what happened. Every event is a type tag, a source, and a JSON
//! payload; consumers pick events out by type pattern.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::ServiceError;

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

/// An event carried on the shared bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event type (e.g. "device/connection", "device/registered")
    pub event_type: String,

    /// Device identity or service id that produced the event
    pub source: String,

    pub data: serde_json::Value,

    /// Unix milliseconds
    pub timestamp: u64,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            data,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Create an event with no payload
    pub fn now(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(event_type, source, serde_json::Value::Null)
    }

    /// Check if this event matches a subscription pattern
    ///
    /// - `"*"` matches everything
    /// - `"device/*"` matches `"device/connection"` but not `"device"`
    /// - anything else is an exact match
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }

        if let Some(prefix) = pattern.strip_suffix('*') {
            if prefix.ends_with('/') {
                return self.event_type.starts_with(prefix);
            }
        }

        self.event_type == pattern
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(|v| v.as_bool())
    }

    /// Deserialize the payload
    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Publisher
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable handle for publishing onto the bus
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<Event>,
}

impl EventPublisher {
    pub fn new(tx: broadcast::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Publish an event. Fails only when nobody is listening.
    pub fn publish(&self, event: Event) -> Result<(), ServiceError> {
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|_| ServiceError::ChannelClosed)
    }

    pub fn emit(
        &self,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), ServiceError> {
        self.publish(Event::new(event_type, source, data))
    }

    /// Tap the bus directly (external consumers and tests)
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
