//! Project Configuration Types
//!
//! Defines the structure of project files on disk.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::devices::{DeviceClass, DeviceDescriptor, Location, ReconnectPolicy, geometry};

/// Project manifest (project.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectManifest {
    pub project: ProjectInfo,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

/// Session timing shared by every device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub handshake_timeout_ms: u64,
    pub outbound_queue: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 5000,
            max_reconnect_delay_ms: 5000,
            backoff_multiplier: 1.0,
            handshake_timeout_ms: 5000,
            outbound_queue: 256,
        }
    }
}

impl RuntimeConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(self.reconnect_delay_ms),
            max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            multiplier: self.backoff_multiplier,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            outbound_queue: self.outbound_queue,
        }
    }
}

/// Device configuration (devices/*.device.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device: DeviceInfo,
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub class: DeviceClass,
    pub model: Option<String>,
    #[serde(default = "default_max_zoom")]
    pub max_zoom: f64,
    /// Where the device is mounted
    pub location: Option<Location>,
}

fn default_max_zoom() -> f64 {
    geometry::DEFAULT_MAX_ZOOM
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// e.g. `ws://10.0.4.21:8080/api`
    pub endpoint: String,
}

impl DeviceConfig {
    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            identity: self.device.id.clone(),
            name: self.device.name.clone(),
            class: self.device.class,
            endpoint: self.connection.endpoint.clone(),
            model: self.device.model.clone(),
            max_zoom: self.device.max_zoom,
            location: self.device.location,
        }
    }
}

/// Loaded project
#[derive(Debug, Clone)]
pub struct Project {
    pub path: PathBuf,
    pub manifest: ProjectManifest,
    pub devices: BTreeMap<String, DeviceConfig>,
}

impl Project {
    pub fn id(&self) -> &str {
        &self.manifest.project.id
    }

    pub fn name(&self) -> &str {
        &self.manifest.project.name
    }

    pub fn get_device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.get(id)
    }

    pub fn descriptors(&self) -> Vec<DeviceDescriptor> {
        self.devices.values().map(DeviceConfig::descriptor).collect()
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.manifest.runtime.reconnect_policy()
    }
}
