//! Response Coordinator
//!
//! Executes a [`ResponsePlan`] across many devices at once. Each directive is
//! dispatched on its own task; one slow or missing device never holds up the
//! rest, and the plan always yields one [`AssetOutcome`] per directive, in
//! directive order.

mod plan;

pub use plan::*;

use std::sync::Arc;

use tracing::{debug, info, warn};

use perimeter_runtime::EventPublisher;

use crate::devices::{
    AcousticAction, DeviceClass, DeviceError, DeviceIdentity, DeviceResult, NormalizedPose,
    geometry,
};
use crate::registry::Registry;

pub struct Coordinator {
    registry: Arc<Registry>,
    publisher: EventPublisher,
}

impl Coordinator {
    pub fn new(registry: Arc<Registry>, publisher: EventPublisher) -> Self {
        Self {
            registry,
            publisher,
        }
    }

    /// Dispatch every directive concurrently and wait until each has been
    /// enqueued (or rejected). Success means the commands reached the
    /// session's outbound queue, not that the device carried them out.
    pub async fn execute(&self, plan: ResponsePlan) -> Vec<AssetOutcome> {
        info!(
            plan_id = %plan.id,
            bearing = plan.threat.bearing,
            directives = plan.directives.len(),
            "Executing response plan"
        );

        let tasks: Vec<_> = plan
            .directives
            .iter()
            .cloned()
            .map(|directive| {
                let registry = Arc::clone(&self.registry);
                let identity = directive.identity.clone();
                let handle = tokio::spawn(async move { dispatch(&registry, &directive).await });
                (identity, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (identity, handle) in tasks {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => AssetOutcome::failed(identity, None, format!("dispatch task failed: {e}")),
            };
            if let Some(error) = &outcome.error {
                warn!(plan_id = %plan.id, device = %outcome.identity, error = %error, "Directive failed");
            }
            outcomes.push(outcome);
        }

        self.report(&plan, &outcomes);
        outcomes
    }

    /// Point one device at a pose and optionally trigger an acoustic action
    pub async fn activate(
        &self,
        identity: &str,
        pose: NormalizedPose,
        action: Option<AcousticAction>,
    ) -> AssetOutcome {
        let class = match self.registry.get(identity) {
            Some(session) => session.class(),
            None if action.is_some() => DeviceClass::Acoustic,
            None => DeviceClass::Camera,
        };

        let directive = AssetDirective {
            identity: identity.to_string(),
            class,
            target: pose,
            action,
        };
        let threat = ThreatLocation::at_bearing(geometry::to_native(pose, f64::MAX).bearing);

        self.execute(ResponsePlan::new(threat, vec![directive]))
            .await
            .pop()
            .unwrap_or_else(|| AssetOutcome::failed(identity.to_string(), None, "no outcome"))
    }

    /// Positioning-only plan for a group of devices
    pub async fn slew(
        &self,
        threat: ThreatLocation,
        targets: impl IntoIterator<Item = (DeviceIdentity, NormalizedPose)>,
    ) -> Vec<AssetOutcome> {
        let directives = targets
            .into_iter()
            .map(|(identity, target)| {
                let class = self
                    .registry
                    .get(&identity)
                    .map(|s| s.class())
                    .unwrap_or(DeviceClass::Camera);
                AssetDirective {
                    identity,
                    class,
                    target,
                    action: None,
                }
            })
            .collect();

        self.execute(ResponsePlan::new(threat, directives)).await
    }

    fn report(&self, plan: &ResponsePlan, outcomes: &[AssetOutcome]) {
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        let failed = outcomes.len() - succeeded;
        let count = |class: DeviceClass| plan.directives.iter().filter(|d| d.class == class).count();

        info!(plan_id = %plan.id, succeeded, failed, "Response plan executed");

        let _ = self.publisher.emit(
            "response/executed",
            "coordinator",
            serde_json::json!({
                "plan_id": plan.id,
                "threat": plan.threat,
                "succeeded": succeeded,
                "failed": failed,
                "cameras": count(DeviceClass::Camera),
                "acoustic": count(DeviceClass::Acoustic),
            }),
        );
    }
}

/// Run one directive against its session
async fn dispatch(registry: &Registry, directive: &AssetDirective) -> AssetOutcome {
    let identity = directive.identity.clone();

    let session = match registry.lookup(&identity) {
        Ok(session) => session,
        Err(e) => return AssetOutcome::failed(identity, None, e.to_string()),
    };

    let result: DeviceResult<()> = async {
        if session.class() != directive.class {
            return Err(DeviceError::InvalidArgument(format!(
                "directive targets a {} but {} is a {}",
                directive.class,
                identity,
                session.class()
            )));
        }

        let target = directive.target;
        session.absolute_move(target.pan, target.tilt, target.zoom).await?;
        if let Some(action) = &directive.action {
            session.perform(action).await?;
        }
        Ok(())
    }
    .await;

    let status = Some(session.status());
    match result {
        Ok(()) => {
            debug!(device = %identity, "Directive dispatched");
            AssetOutcome::succeeded(identity, status)
        }
        Err(e) => AssetOutcome::failed(identity, status, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::{MemoryTransport, SimulatedDevice, fast_policy, publisher};
    use crate::devices::{
        ConfigurationOverrides, DeviceDescriptor, DeviceSession, Mode, ReconnectPolicy, StopAxes,
    };
    use std::time::Duration;
    use perimeter_runtime::Event;
    use tokio::sync::{broadcast, mpsc};

    struct Fixture {
        registry: Arc<Registry>,
        coordinator: Coordinator,
        frames: Vec<mpsc::UnboundedReceiver<serde_json::Value>>,
        bus: broadcast::Receiver<Event>,
    }

    /// Two cameras and one acoustic device, all online
    async fn fixture() -> Fixture {
        let (publisher, bus) = publisher();
        let transport = Arc::new(MemoryTransport::new());

        let devices = vec![
            DeviceDescriptor::new("cam-01", DeviceClass::Camera, "mem://cam-01"),
            DeviceDescriptor::new("cam-02", DeviceClass::Camera, "mem://cam-02"),
            DeviceDescriptor::new("lrad-01", DeviceClass::Acoustic, "mem://lrad-01"),
        ];
        let frames = devices
            .iter()
            .map(|d| SimulatedDevice::spawn_responder(&transport, &d.endpoint, "Simulated"))
            .collect();

        let registry = Arc::new(Registry::new(devices, publisher.clone()).unwrap());
        registry.start(transport.clone(), fast_policy());
        let sessions: Vec<Arc<DeviceSession>> = registry.sessions().cloned().collect();
        SimulatedDevice::wait_all_online(&sessions).await;

        Fixture {
            coordinator: Coordinator::new(registry.clone(), publisher),
            registry,
            frames,
            bus,
        }
    }

    fn camera(identity: &str, pan: f64, tilt: f64, zoom: f64) -> AssetDirective {
        AssetDirective {
            identity: identity.to_string(),
            class: DeviceClass::Camera,
            target: NormalizedPose::new(pan, tilt, zoom),
            action: None,
        }
    }

    #[tokio::test]
    async fn test_three_device_response() {
        let mut fx = fixture().await;

        let plan = ResponsePlan::new(
            ThreatLocation::at_bearing(270.0),
            vec![
                camera("cam-01", 0.5, 0.0, 2.0),
                camera("cam-02", 0.5, 0.0, 2.0),
                AssetDirective {
                    identity: "lrad-01".to_string(),
                    class: DeviceClass::Acoustic,
                    target: NormalizedPose::new(-0.25, 0.1, 1.0),
                    action: Some(AcousticAction::Deterrent {
                        overrides: ConfigurationOverrides::level(90),
                    }),
                },
            ],
        );
        let plan_id = plan.id;

        let outcomes = fx.coordinator.execute(plan).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.success), "{outcomes:?}");
        assert_eq!(outcomes[0].identity, "cam-01");
        assert_eq!(outcomes[2].identity, "lrad-01");

        for id in ["cam-01", "cam-02"] {
            let position = fx.registry.get(id).unwrap().position();
            assert_eq!(position.bearing, 270.0);
            assert_eq!(position.elevation, 0.0);
            assert_eq!(position.zoom, 2.0);
        }

        let lrad = fx.registry.get("lrad-01").unwrap();
        assert_eq!(lrad.position().bearing, 135.0);
        assert!((lrad.position().elevation - 9.0).abs() < 1e-9);
        assert_eq!(lrad.configuration().mode, Mode::Deterrent);
        assert_eq!(lrad.configuration().level, 90);

        let status = outcomes[2].status.as_ref().unwrap();
        assert_eq!(status.configuration.unwrap().mode, Mode::Deterrent);

        // The acoustic device saw the move, then the deterrent
        let first = fx.frames[2].recv().await.unwrap();
        let second = fx.frames[2].recv().await.unwrap();
        assert_eq!(first["type"], "move_absolute");
        assert_eq!(second["type"], "activate_deterrent");
        assert_eq!(second["configuration"]["volume"], 90);

        let report = loop {
            let event = fx.bus.recv().await.unwrap();
            if event.event_type == "response/executed" {
                break event;
            }
        };
        assert_eq!(report.get_str("plan_id"), Some(plan_id.to_string().as_str()));
        assert_eq!(report.get_f64("succeeded"), Some(3.0));
        assert_eq!(report.get_f64("cameras"), Some(2.0));
        assert_eq!(report.get_f64("acoustic"), Some(1.0));

        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_device_fails_alone() {
        let fx = fixture().await;

        let outcomes = fx
            .coordinator
            .execute(ResponsePlan::new(
                ThreatLocation::at_bearing(90.0),
                vec![
                    camera("cam-01", 0.1, 0.0, 1.0),
                    camera("cam-99", 0.1, 0.0, 1.0),
                    camera("cam-02", 0.1, 0.0, 1.0),
                ],
            ))
            .await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert!(outcomes[1].error.as_deref().unwrap().contains("cam-99"));
        assert!(outcomes[1].status.is_none());
        assert!(outcomes[2].success);

        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_offline_device_fails_fast() {
        let fx = fixture().await;
        fx.registry.get("cam-02").unwrap().shutdown().await;

        let outcomes = fx
            .coordinator
            .slew(
                ThreatLocation::at_bearing(10.0),
                [
                    ("cam-01".to_string(), NormalizedPose::new(0.0, 0.0, 1.0)),
                    ("cam-02".to_string(), NormalizedPose::new(0.0, 0.0, 1.0)),
                ],
            )
            .await;

        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert!(outcomes[1].error.as_deref().unwrap().contains("offline"));

        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_device_does_not_hold_up_the_others() {
        let (publisher, _bus) = publisher();
        // One-frame links and a one-command queue so a device that stops
        // reading backs up into its session quickly
        let transport = Arc::new(MemoryTransport::with_frame_buffer(1));
        let policy = ReconnectPolicy {
            outbound_queue: 1,
            ..fast_policy()
        };

        let mut stalled = SimulatedDevice::listen(&transport, "mem://cam-01");
        let mut cam_frames = SimulatedDevice::spawn_responder(&transport, "mem://cam-02", "Simulated");
        let mut lrad_frames = SimulatedDevice::spawn_responder(&transport, "mem://lrad-01", "Simulated");

        let registry = Arc::new(
            Registry::new(
                [
                    DeviceDescriptor::new("cam-01", DeviceClass::Camera, "mem://cam-01"),
                    DeviceDescriptor::new("cam-02", DeviceClass::Camera, "mem://cam-02"),
                    DeviceDescriptor::new("lrad-01", DeviceClass::Acoustic, "mem://lrad-01"),
                ],
                publisher.clone(),
            )
            .unwrap(),
        );
        registry.start(transport.clone(), policy);

        let cam = registry.get("cam-01").unwrap();
        let mut link = stalled.handshake(&cam).await;
        let sessions: Vec<Arc<DeviceSession>> = registry.sessions().cloned().collect();
        SimulatedDevice::wait_all_online(&sessions).await;

        // Fill the link and the session queue until the next command waits
        let mut backed_up = false;
        for _ in 0..16 {
            let attempt = tokio::time::timeout(
                Duration::from_millis(50),
                cam.stop(StopAxes::all()),
            )
            .await;
            if attempt.is_err() {
                backed_up = true;
                break;
            }
        }
        assert!(backed_up, "cam-01 never backed up");

        let coordinator = Arc::new(Coordinator::new(registry.clone(), publisher));
        let plan = ResponsePlan::new(
            ThreatLocation::at_bearing(90.0),
            vec![
                camera("cam-01", -0.5, 0.0, 1.0),
                camera("cam-02", -0.5, 0.0, 1.0),
                AssetDirective {
                    identity: "lrad-01".to_string(),
                    class: DeviceClass::Acoustic,
                    target: NormalizedPose::new(-0.5, 0.0, 1.0),
                    action: None,
                },
            ],
        );
        let running = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.execute(plan).await }
        });

        // The stalled device is first in the plan, yet the others get their moves
        let wait = Duration::from_secs(2);
        let frame = tokio::time::timeout(wait, cam_frames.recv()).await.unwrap().unwrap();
        assert_eq!(frame["type"], "ptz");
        assert_eq!(frame["action"], "absolute");
        let frame = tokio::time::timeout(wait, lrad_frames.recv()).await.unwrap().unwrap();
        assert_eq!(frame["type"], "move_absolute");
        assert!(!running.is_finished());

        // Once the device reads again, the whole plan completes
        tokio::spawn(async move { while link.recv_json().await.is_some() {} });
        let outcomes = tokio::time::timeout(wait, running).await.unwrap().unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.success), "{outcomes:?}");
        assert_eq!(registry.get("cam-01").unwrap().position().bearing, 90.0);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_acoustic_action_on_camera_is_a_failed_outcome() {
        let fx = fixture().await;

        let outcome = fx
            .coordinator
            .activate(
                "cam-01",
                NormalizedPose::new(0.0, 0.0, 1.0),
                Some(AcousticAction::Siren {
                    overrides: ConfigurationOverrides::default(),
                }),
            )
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("does not support"));

        let outcome = fx
            .coordinator
            .activate(
                "lrad-01",
                NormalizedPose::new(0.0, 0.0, 1.0),
                Some(AcousticAction::Voice {
                    message: "You are approaching a restricted area".into(),
                    overrides: ConfigurationOverrides::default(),
                }),
            )
            .await;
        assert!(outcome.success);
        assert_eq!(
            fx.registry.get("lrad-01").unwrap().configuration().mode,
            Mode::Voice
        );

        fx.registry.shutdown().await;
    }
}
