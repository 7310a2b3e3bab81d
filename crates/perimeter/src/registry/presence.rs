//! Presence Service
//!
//! Announces devices to the rest of the platform. A device is registered the
//! first time its session comes online and re-registered whenever it reports
//! fresh capabilities afterwards.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use perimeter_runtime::service::ServiceResult;
use perimeter_runtime::{Event, Service, ServiceContext, ServiceSpec};

use super::Registry;
use crate::devices::{ConnectionState, DeviceStatus};

pub const PRESENCE_SERVICE_ID: &str = "registry/presence";

pub struct PresenceService {
    registry: Arc<Registry>,
    registered: HashSet<String>,
}

impl PresenceService {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            registered: HashSet::new(),
        }
    }

    fn announce(&mut self, ctx: &ServiceContext, status: &DeviceStatus) -> ServiceResult<()> {
        info!(device = %status.identity, class = %status.class, "Device registered");
        self.registered.insert(status.identity.clone());
        ctx.emit("device/registered", presence_payload(status))
    }
}

/// Payload of a `device/registered` event
pub fn presence_payload(status: &DeviceStatus) -> serde_json::Value {
    serde_json::json!({
        "identity": status.identity,
        "name": status.name,
        "class": status.class,
        "model": status.model,
        "location": status.location,
        "capabilities": status.capabilities,
        "position": status.position,
    })
}

#[async_trait]
impl Service for PresenceService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new(PRESENCE_SERVICE_ID, "Device Presence")
            .subscribe("device/connection")
            .subscribe("device/capabilities")
            .with_description("Publishes device/registered for sessions that come online")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        debug!(devices = self.registry.len(), "Presence service watching devices");
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_event(&mut self, ctx: &ServiceContext, event: Event) -> ServiceResult<()> {
        let Some(session) = self.registry.get(&event.source) else {
            return Ok(());
        };
        let first_time = !self.registered.contains(&event.source);

        match event.event_type.as_str() {
            "device/connection" => {
                let online = event.get_str("state") == Some(ConnectionState::Online.as_str());
                if online && first_time {
                    self.announce(ctx, &session.status())?;
                }
            }
            "device/capabilities" if !first_time => {
                self.announce(ctx, &session.status())?;
            }
            _ => {}
        }

        Ok(())
    }
}
