//! Response plans and their outcomes

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::devices::{AcousticAction, DeviceClass, DeviceIdentity, DeviceStatus, NormalizedPose};

/// Where the threat is, as seen from the site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatLocation {
    /// Degrees, 0..360
    pub bearing: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_m: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
}

impl ThreatLocation {
    pub fn at_bearing(bearing: f64) -> Self {
        Self {
            bearing,
            range_m: None,
            lat: None,
            lng: None,
        }
    }
}

/// What one device should do as part of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDirective {
    pub identity: DeviceIdentity,
    pub class: DeviceClass,
    /// Normalized pan/tilt/zoom
    pub target: NormalizedPose,
    /// Acoustic devices only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<AcousticAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePlan {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub threat: ThreatLocation,
    pub directives: Vec<AssetDirective>,
}

impl ResponsePlan {
    pub fn new(threat: ThreatLocation, directives: Vec<AssetDirective>) -> Self {
        Self {
            id: Uuid::new_v4(),
            threat,
            directives,
        }
    }
}

/// Result of one directive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetOutcome {
    pub identity: DeviceIdentity,
    pub success: bool,
    /// Session state after dispatch, when the device is known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeviceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AssetOutcome {
    pub fn succeeded(identity: DeviceIdentity, status: Option<DeviceStatus>) -> Self {
        Self {
            identity,
            success: true,
            status,
            error: None,
        }
    }

    pub fn failed(
        identity: DeviceIdentity,
        status: Option<DeviceStatus>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            success: false,
            status,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_from_queue_payload() {
        let plan: ResponsePlan = serde_json::from_str(
            r#"{
                "threat": {"bearing": 270.0, "range_m": 450.0},
                "directives": [
                    {"identity": "cam-01", "class": "camera", "target": {"pan": 0.5, "tilt": 0.0, "zoom": 2.0}},
                    {"identity": "lrad-01", "class": "acoustic", "target": {"pan": -0.25, "tilt": 0.1},
                     "action": {"action": "deterrent", "overrides": {"level": 90}}}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(plan.threat.range_m, Some(450.0));
        assert_eq!(plan.directives.len(), 2);
        assert_eq!(plan.directives[1].class, DeviceClass::Acoustic);
        assert_eq!(plan.directives[1].target.zoom, 1.0);
        assert!(matches!(
            plan.directives[1].action,
            Some(AcousticAction::Deterrent { .. })
        ));
    }
}
