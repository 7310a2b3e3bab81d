//! Wire Protocol
//!
//! Sessions speak in [`OutboundMessage`] and [`InboundMessage`]; a [`Codec`]
//! turns those into the text frames of one device dialect and back.
//!
//! Acoustic devices use a flat envelope, `{"type": .., "deviceId": .., ...}`,
//! with native degrees. Cameras are reached through the PTZ bridge of the
//! camera wrapper service, `{"type": "ptz", "camera_id": .., "action": ..}`,
//! which expects the uniform (normalized) pose.

use serde::{Deserialize, Serialize};

use super::geometry;
use super::types::{
    Capabilities, Configuration, DeviceClass, DeviceError, DeviceIdentity, DeviceResult,
    NormalizedPose, Position, StopAxes, Velocity,
};

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

/// Commands a session can put on the wire
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    GetCapabilities,
    MoveAbsolute {
        position: Position,
    },
    ContinuousMove {
        velocity: Velocity,
    },
    Stop(StopAxes),
    GotoPreset {
        #[serde(rename = "presetToken")]
        token: String,
    },
    SetPreset {
        #[serde(rename = "presetToken")]
        token: String,
        #[serde(rename = "presetName")]
        name: String,
        position: Position,
        #[serde(skip_serializing_if = "Option::is_none")]
        configuration: Option<Configuration>,
    },
    ActivateDeterrent {
        configuration: Configuration,
    },
    VoiceAnnouncement {
        message: String,
        configuration: Configuration,
    },
    ActivateSiren {
        configuration: Configuration,
    },
    EnterStandby,
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::GetCapabilities => "get_capabilities",
            OutboundMessage::MoveAbsolute { .. } => "move_absolute",
            OutboundMessage::ContinuousMove { .. } => "continuous_move",
            OutboundMessage::Stop(_) => "stop",
            OutboundMessage::GotoPreset { .. } => "goto_preset",
            OutboundMessage::SetPreset { .. } => "set_preset",
            OutboundMessage::ActivateDeterrent { .. } => "activate_deterrent",
            OutboundMessage::VoiceAnnouncement { .. } => "voice_announcement",
            OutboundMessage::ActivateSiren { .. } => "activate_siren",
            OutboundMessage::EnterStandby => "enter_standby",
        }
    }
}

/// Messages a device sends back, already in native units
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    CapabilitiesResponse {
        capabilities: Capabilities,
    },
    PositionUpdate {
        position: Position,
    },
    ConfigurationUpdate {
        configuration: Configuration,
    },
    StatusUpdate(serde_json::Map<String, serde_json::Value>),
    Error {
        #[serde(default)]
        error: serde_json::Value,
    },
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::CapabilitiesResponse { .. } => "capabilities_response",
            InboundMessage::PositionUpdate { .. } => "position_update",
            InboundMessage::ConfigurationUpdate { .. } => "configuration_update",
            InboundMessage::StatusUpdate(_) => "status_update",
            InboundMessage::Error { .. } => "error",
        }
    }
}

/// Text of a device-reported error, whatever shape the device used
pub fn error_text(error: &serde_json::Value) -> String {
    match error {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "unspecified device error".to_string(),
        serde_json::Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(String::from)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dialects
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Acoustic,
    Camera,
}

impl From<DeviceClass> for Dialect {
    fn from(class: DeviceClass) -> Self {
        match class {
            DeviceClass::Acoustic => Dialect::Acoustic,
            DeviceClass::Camera => Dialect::Camera,
        }
    }
}

#[derive(Serialize)]
struct AcousticEnvelope<'a> {
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    #[serde(flatten)]
    message: &'a OutboundMessage,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CameraFrame<'a> {
    GetCapabilities {
        camera_id: &'a str,
    },
    Ptz {
        camera_id: &'a str,
        #[serde(flatten)]
        command: PtzCommand<'a>,
    },
}

#[derive(Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum PtzCommand<'a> {
    Absolute {
        pan: f64,
        tilt: f64,
        zoom: f64,
    },
    Move {
        pan: f64,
        tilt: f64,
        zoom: f64,
    },
    Stop {
        pan: bool,
        tilt: bool,
        zoom: bool,
    },
    Preset {
        preset: &'a str,
    },
    SetPreset {
        preset: &'a str,
        name: &'a str,
        pan: f64,
        tilt: f64,
        zoom: f64,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CameraInbound {
    CapabilitiesResponse {
        capabilities: Capabilities,
    },
    PositionUpdate {
        position: NormalizedPose,
    },
    ConfigurationUpdate {
        configuration: Configuration,
    },
    #[serde(alias = "ptz_executed")]
    StatusUpdate(serde_json::Map<String, serde_json::Value>),
    Error {
        #[serde(default)]
        error: serde_json::Value,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec
// ─────────────────────────────────────────────────────────────────────────────

/// Frame encoder/decoder bound to one device
#[derive(Debug, Clone)]
pub struct Codec {
    dialect: Dialect,
    identity: DeviceIdentity,
    max_zoom: f64,
}

impl Codec {
    pub fn new(dialect: Dialect, identity: impl Into<DeviceIdentity>, max_zoom: f64) -> Self {
        Self {
            dialect,
            identity: identity.into(),
            max_zoom,
        }
    }

    pub fn encode(&self, message: &OutboundMessage) -> DeviceResult<String> {
        match self.dialect {
            Dialect::Acoustic => Ok(serde_json::to_string(&AcousticEnvelope {
                device_id: &self.identity,
                message,
            })?),
            Dialect::Camera => self.encode_camera(message),
        }
    }

    pub fn decode(&self, frame: &str) -> DeviceResult<InboundMessage> {
        match self.dialect {
            Dialect::Acoustic => Ok(serde_json::from_str(frame)?),
            Dialect::Camera => Ok(match serde_json::from_str::<CameraInbound>(frame)? {
                CameraInbound::CapabilitiesResponse { capabilities } => {
                    InboundMessage::CapabilitiesResponse { capabilities }
                }
                CameraInbound::PositionUpdate { position } => InboundMessage::PositionUpdate {
                    position: geometry::to_native(position, self.max_zoom),
                },
                CameraInbound::ConfigurationUpdate { configuration } => {
                    InboundMessage::ConfigurationUpdate { configuration }
                }
                CameraInbound::StatusUpdate(payload) => InboundMessage::StatusUpdate(payload),
                CameraInbound::Error { error } => InboundMessage::Error { error },
            }),
        }
    }

    fn encode_camera(&self, message: &OutboundMessage) -> DeviceResult<String> {
        let camera_id = self.identity.as_str();

        let command = match message {
            OutboundMessage::GetCapabilities => {
                return Ok(serde_json::to_string(&CameraFrame::GetCapabilities {
                    camera_id,
                })?);
            }
            OutboundMessage::MoveAbsolute { position } => {
                let pose = geometry::to_normalized(*position);
                PtzCommand::Absolute {
                    pan: pose.pan,
                    tilt: pose.tilt,
                    zoom: pose.zoom,
                }
            }
            OutboundMessage::ContinuousMove { velocity } => PtzCommand::Move {
                pan: velocity.pan,
                tilt: velocity.tilt,
                zoom: velocity.zoom,
            },
            OutboundMessage::Stop(axes) => PtzCommand::Stop {
                pan: axes.pan,
                tilt: axes.tilt,
                zoom: axes.zoom,
            },
            OutboundMessage::GotoPreset { token } => PtzCommand::Preset { preset: token },
            OutboundMessage::SetPreset {
                token,
                name,
                position,
                ..
            } => {
                let pose = geometry::to_normalized(*position);
                PtzCommand::SetPreset {
                    preset: token,
                    name,
                    pan: pose.pan,
                    tilt: pose.tilt,
                    zoom: pose.zoom,
                }
            }
            OutboundMessage::ActivateDeterrent { .. }
            | OutboundMessage::VoiceAnnouncement { .. }
            | OutboundMessage::ActivateSiren { .. }
            | OutboundMessage::EnterStandby => {
                return Err(DeviceError::UnsupportedAction {
                    identity: self.identity.clone(),
                    class: DeviceClass::Camera,
                    action: message.kind(),
                });
            }
        };

        Ok(serde_json::to_string(&CameraFrame::Ptz { camera_id, command })?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
