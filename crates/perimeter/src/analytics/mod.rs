//! Analytics Bridge
//!
//! Turns raw device telemetry into platform events. Camera status frames that
//! carry an analytics notification topic are classified and republished as
//! `analytics/<kind>`; device-reported errors become `alerts/device-fault`.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use perimeter_runtime::service::ServiceResult;
use perimeter_runtime::{Event, Service, ServiceContext, ServiceSpec};

pub const ANALYTICS_SERVICE_ID: &str = "analytics/bridge";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsKind {
    Motion,
    LineCrossing,
    Intrusion,
    CameraAnalytics,
}

impl AnalyticsKind {
    /// Classify a notification topic such as
    /// `tns1:RuleEngine/CellMotionDetector/Motion`
    pub fn classify(topic: &str) -> Self {
        if topic.contains("MotionDetection") || topic.contains("MotionDetector") {
            AnalyticsKind::Motion
        } else if topic.contains("LineDetector") {
            AnalyticsKind::LineCrossing
        } else if topic.contains("FieldDetector") {
            AnalyticsKind::Intrusion
        } else {
            AnalyticsKind::CameraAnalytics
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsKind::Motion => "motion",
            AnalyticsKind::LineCrossing => "line_crossing",
            AnalyticsKind::Intrusion => "intrusion",
            AnalyticsKind::CameraAnalytics => "camera_analytics",
        }
    }
}

/// Pull the notification topic out of a status payload. Topics arrive either
/// as a plain string or as an XML-derived object with the text under `_`.
fn topic_of(status: &serde_json::Value) -> Option<&str> {
    let topic = status.get("topic")?;
    topic
        .as_str()
        .or_else(|| topic.get("_").and_then(|t| t.as_str()))
}

#[derive(Default)]
pub struct AnalyticsBridge {
    forwarded: u64,
}

impl AnalyticsBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn on_status(&mut self, ctx: &ServiceContext, event: &Event) -> ServiceResult<()> {
        let status = event.get("status").cloned().unwrap_or_default();
        let Some(topic) = topic_of(&status) else {
            debug!(device = %event.source, "Status update without analytics topic");
            return Ok(());
        };

        let kind = AnalyticsKind::classify(topic);
        debug!(device = %event.source, kind = kind.as_str(), topic, "Analytics event");
        self.forwarded += 1;

        ctx.emit(
            format!("analytics/{}", kind.as_str()),
            serde_json::json!({
                "camera_id": event.source,
                "type": kind,
                "timestamp": Utc::now().to_rfc3339(),
                "data": status,
            }),
        )
    }

    fn on_fault(&mut self, ctx: &ServiceContext, event: &Event) -> ServiceResult<()> {
        self.forwarded += 1;
        ctx.emit(
            "alerts/device-fault",
            serde_json::json!({
                "identity": event.source,
                "class": event.get("class"),
                "error": event.get_str("error"),
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
    }
}

#[async_trait]
impl Service for AnalyticsBridge {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new(ANALYTICS_SERVICE_ID, "Analytics Bridge")
            .subscribe("device/status")
            .subscribe("device/fault")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        info!(forwarded = self.forwarded, "Analytics bridge stopped");
        Ok(())
    }

    async fn on_event(&mut self, ctx: &ServiceContext, event: Event) -> ServiceResult<()> {
        match event.event_type.as_str() {
            "device/status" => self.on_status(ctx, &event),
            "device/fault" => self.on_fault(ctx, &event),
            _ => Ok(()),
        }
    }
}
