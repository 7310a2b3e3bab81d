//! Device Registry
//!
//! The set of sessions is fixed at startup: one session per configured
//! device, never replaced. Reconnects happen inside a session, so a handle
//! taken from the registry stays valid for the life of the process.

mod presence;

pub use presence::*;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use perimeter_runtime::EventPublisher;

use crate::devices::{
    DeviceDescriptor, DeviceError, DeviceResult, DeviceSession, DeviceStatus, ReconnectPolicy,
    Transport,
};

pub struct Registry {
    sessions: BTreeMap<String, Arc<DeviceSession>>,
}

impl Registry {
    /// Build one session per descriptor. Sessions start disconnected.
    pub fn new(
        devices: impl IntoIterator<Item = DeviceDescriptor>,
        publisher: EventPublisher,
    ) -> DeviceResult<Self> {
        let mut sessions = BTreeMap::new();

        for descriptor in devices {
            if sessions.contains_key(&descriptor.identity) {
                return Err(DeviceError::InvalidArgument(format!(
                    "duplicate device identity: {}",
                    descriptor.identity
                )));
            }
            let identity = descriptor.identity.clone();
            sessions.insert(identity, DeviceSession::new(descriptor, publisher.clone()));
        }

        Ok(Self { sessions })
    }

    /// Start every session's lifecycle task
    pub fn start(&self, transport: Arc<dyn Transport>, policy: ReconnectPolicy) {
        info!(devices = self.sessions.len(), "Starting device sessions");
        for session in self.sessions.values() {
            session.start(Arc::clone(&transport), policy.clone());
        }
    }

    pub fn get(&self, identity: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.get(identity).cloned()
    }

    pub fn lookup(&self, identity: &str) -> DeviceResult<Arc<DeviceSession>> {
        self.get(identity)
            .ok_or_else(|| DeviceError::UnknownDevice(identity.to_string()))
    }

    /// Status of every device, ordered by identity
    pub fn list(&self) -> Vec<DeviceStatus> {
        self.sessions.values().map(|s| s.status()).collect()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Arc<DeviceSession>> {
        self.sessions.values()
    }

    pub fn online_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_online()).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Shut every session down
    pub async fn shutdown(&self) {
        info!(devices = self.sessions.len(), "Shutting down device sessions");
        futures::future::join_all(self.sessions.values().map(|s| s.shutdown())).await;
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("devices", &self.sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}
