//! Device Data Model
//!
//! Native pose, acoustic configuration, capabilities and the status snapshot
//! shared by every device session regardless of wire dialect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque configured identity of one physical device
pub type DeviceIdentity = String;

// ─────────────────────────────────────────────────────────────────────────────
// Device Class
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Camera,
    Acoustic,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Camera => "camera",
            DeviceClass::Acoustic => "acoustic",
        }
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a session's transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Online = 2,
    /// Retried like `Disconnected`, reported separately to operators
    Error = 3,
}

impl ConnectionState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Online,
            _ => Self::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Online => "online",
            ConnectionState::Error => "error",
        }
    }

    pub fn is_online(&self) -> bool {
        *self == ConnectionState::Online
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pose
// ─────────────────────────────────────────────────────────────────────────────

/// Native device pose in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// 0..=360, wraps
    #[serde(rename = "azimuth")]
    pub bearing: f64,
    /// -90..=90, clamped
    pub elevation: f64,
    pub zoom: f64,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            bearing: 0.0,
            elevation: 0.0,
            zoom: 1.0,
        }
    }
}

/// Where a device is mounted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

/// Uniform pose: pan/tilt in -1.0..=1.0, zoom >= 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPose {
    pub pan: f64,
    pub tilt: f64,
    #[serde(default = "default_zoom")]
    pub zoom: f64,
}

fn default_zoom() -> f64 {
    1.0
}

impl NormalizedPose {
    pub fn new(pan: f64, tilt: f64, zoom: f64) -> Self {
        Self { pan, tilt, zoom }
    }
}

/// Signed continuous-motion velocities
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    pub pan: f64,
    pub tilt: f64,
    pub zoom: f64,
}

/// Which axes a stop applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAxes {
    #[serde(rename = "stopPan")]
    pub pan: bool,
    #[serde(rename = "stopTilt")]
    pub tilt: bool,
    #[serde(rename = "stopZoom")]
    pub zoom: bool,
}

impl StopAxes {
    pub fn all() -> Self {
        Self {
            pan: true,
            tilt: true,
            zoom: true,
        }
    }
}

impl Default for StopAxes {
    fn default() -> Self {
        Self::all()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capabilities
// ─────────────────────────────────────────────────────────────────────────────

/// Capabilities reported by the device during the handshake.
///
/// Missing fields fall back to conservative defaults so a device that answers
/// with a partial record (or never answers) is still usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Maximum output level, dB SPL
    #[serde(rename = "maxSPL")]
    pub max_spl: f64,
    /// Horizontal beam width, degrees
    pub beam_width: f64,
    /// Vertical beam width, degrees
    pub vertical_beam: f64,
    /// Maximum effective range, metres
    pub max_range: f64,
    /// Supported emission frequencies, Hz (inclusive)
    pub frequency_range: (u32, u32),
    pub has_optical_dazzler: bool,
    pub supported_commands: Vec<String>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            model: None,
            max_spl: 120.0,
            beam_width: 30.0,
            vertical_beam: 30.0,
            max_range: 1000.0,
            frequency_range: (200, 8000),
            has_optical_dazzler: false,
            supported_commands: ["move", "stop", "preset", "status"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Acoustic Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Standby,
    Voice,
    Deterrent,
    Siren,
}

/// Operating state of an acoustic device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Output level, percent
    #[serde(rename = "volume")]
    pub level: u8,
    /// Emission frequency, Hz
    pub frequency: u32,
    /// Seconds; 0 runs until stopped
    pub duration: u32,
    pub mode: Mode,
    pub dazzler_enabled: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            level: 50,
            frequency: 1000,
            duration: 0,
            mode: Mode::Standby,
            dazzler_enabled: false,
        }
    }
}

impl Configuration {
    /// Merge overrides for an action into this configuration.
    ///
    /// Level is capped at 100, frequency is clamped into the device's
    /// supported range and the dazzler stays off unless the device has one.
    pub fn apply(
        &self,
        overrides: &ConfigurationOverrides,
        mode: Mode,
        capabilities: &Capabilities,
    ) -> Configuration {
        let (lo, hi) = capabilities.frequency_range;
        let (lo, hi) = (lo.min(hi), lo.max(hi));

        Configuration {
            level: overrides.level.unwrap_or(self.level).min(100),
            frequency: overrides.frequency.unwrap_or(self.frequency).clamp(lo, hi),
            duration: overrides.duration.unwrap_or(self.duration),
            mode,
            dazzler_enabled: capabilities.has_optical_dazzler
                && overrides.dazzler.unwrap_or(self.dazzler_enabled),
        }
    }
}

/// Per-action changes to the cached configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dazzler: Option<bool>,
}

impl ConfigurationOverrides {
    pub fn level(level: u8) -> Self {
        Self {
            level: Some(level),
            ..Default::default()
        }
    }
}

/// Device-class-specific action for an acoustic device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AcousticAction {
    Voice {
        message: String,
        #[serde(default)]
        overrides: ConfigurationOverrides,
    },
    Deterrent {
        #[serde(default)]
        overrides: ConfigurationOverrides,
    },
    Siren {
        #[serde(default)]
        overrides: ConfigurationOverrides,
    },
    Standby,
}

impl AcousticAction {
    pub fn name(&self) -> &'static str {
        match self {
            AcousticAction::Voice { .. } => "voice",
            AcousticAction::Deterrent { .. } => "deterrent",
            AcousticAction::Siren { .. } => "siren",
            AcousticAction::Standby => "standby",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Presets & Status
// ─────────────────────────────────────────────────────────────────────────────

/// Locally remembered preset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetEntry {
    pub name: String,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Configuration>,
}

/// Last error the device itself reported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFault {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of a device session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub identity: DeviceIdentity,
    pub name: String,
    pub class: DeviceClass,
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub state: ConnectionState,
    pub online: bool,
    pub capabilities: Capabilities,
    pub position: Position,
    pub normalized: NormalizedPose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Configuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fault: Option<DeviceFault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device {identity} is offline ({state})")]
    Offline {
        identity: DeviceIdentity,
        state: ConnectionState,
    },

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceIdentity),

    #[error("Device {identity} ({class}) does not support {action}")]
    UnsupportedAction {
        identity: DeviceIdentity,
        class: DeviceClass,
        action: &'static str,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,
}

pub type DeviceResult<T> = Result<T, DeviceError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
