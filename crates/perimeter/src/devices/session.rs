//! Device Session
//!
//! One session per physical device. The session owns the device's cached
//! state and a lifecycle task that keeps a connection open:
//!
//! ```text
//! Disconnected -> Connecting -> Online -> (Error | Disconnected) -> Connecting ...
//! ```
//!
//! On every connect the session requests capabilities and only goes Online
//! once they arrive or the handshake timeout passes. Uniform operations are
//! accepted only while Online; they enqueue one outbound message, update the
//! cache optimistically and return without waiting for the device.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use perimeter_runtime::EventPublisher;

use super::geometry;
use super::protocol::{Codec, InboundMessage, OutboundMessage, error_text};
use super::transport::{Connection, Transport};
use super::types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Descriptor & Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Static description of a device, taken from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub identity: DeviceIdentity,
    pub name: String,
    pub class: DeviceClass,
    pub endpoint: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_zoom")]
    pub max_zoom: f64,
    #[serde(default)]
    pub location: Option<Location>,
}

fn default_max_zoom() -> f64 {
    geometry::DEFAULT_MAX_ZOOM
}

impl DeviceDescriptor {
    pub fn new(
        identity: impl Into<DeviceIdentity>,
        class: DeviceClass,
        endpoint: impl Into<String>,
    ) -> Self {
        let identity = identity.into();
        Self {
            name: identity.clone(),
            identity,
            class,
            endpoint: endpoint.into(),
            model: None,
            max_zoom: default_max_zoom(),
            location: None,
        }
    }
}

/// Reconnect and handshake timing for a session
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_delay: Duration,
    /// 1.0 keeps the delay constant
    pub multiplier: f64,
    pub handshake_timeout: Duration,
    pub outbound_queue: usize,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            multiplier: 1.0,
            handshake_timeout: Duration::from_secs(5),
            outbound_queue: 256,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to use after `current`, capped at `max_delay`. Products that
    /// overflow a `Duration` saturate at the cap.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let cap = self.max_delay.max(self.delay);
        let multiplier = if self.multiplier >= 1.0 { self.multiplier } else { 1.0 };
        Duration::try_from_secs_f64(current.as_secs_f64() * multiplier)
            .map_or(cap, |next| next.min(cap))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

struct SessionState {
    capabilities: Capabilities,
    position: Position,
    configuration: Configuration,
    presets: HashMap<String, PresetEntry>,
    last_fault: Option<DeviceFault>,
    last_seen: Option<chrono::DateTime<Utc>>,
}

/// Why a connection attempt or an online period ended
enum Ended {
    /// Transport closed cleanly
    Closed,
    Failed(DeviceError),
}

pub struct DeviceSession {
    descriptor: DeviceDescriptor,
    codec: Codec,
    /// Mirror of [`ConnectionState`], written only by the lifecycle task
    state: AtomicU8,
    cache: RwLock<SessionState>,
    /// Present only while Online
    outbound: RwLock<Option<mpsc::Sender<OutboundMessage>>>,
    /// Held from computing a command until it is queued, so the cache and
    /// the wire see commands in the same order
    commands: tokio::sync::Mutex<()>,
    publisher: EventPublisher,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceSession {
    pub fn new(descriptor: DeviceDescriptor, publisher: EventPublisher) -> Arc<Self> {
        let codec = Codec::new(
            descriptor.class.into(),
            descriptor.identity.clone(),
            descriptor.max_zoom,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            descriptor,
            codec,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            cache: RwLock::new(SessionState {
                capabilities: Capabilities::default(),
                position: Position::default(),
                configuration: Configuration::default(),
                presets: HashMap::new(),
                last_fault: None,
                last_seen: None,
            }),
            outbound: RwLock::new(None),
            commands: tokio::sync::Mutex::new(()),
            publisher,
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    /// Spawn the lifecycle task. Calling it again while the task runs is a no-op.
    pub fn start(self: &Arc<Self>, transport: Arc<dyn Transport>, policy: ReconnectPolicy) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        self.shutdown_tx.send_replace(false);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let session = Arc::clone(self);
        *task = Some(tokio::spawn(session.run(transport, policy, shutdown_rx)));
    }

    /// Stop the lifecycle task and close the transport without reconnecting
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(device = %self.descriptor.identity, error = ?e, "Session task panicked");
            }
        }
        self.detach();
        self.set_state(ConnectionState::Disconnected);
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    pub fn identity(&self) -> &str {
        &self.descriptor.identity
    }

    pub fn class(&self) -> DeviceClass {
        self.descriptor.class
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.cache.read().capabilities.clone()
    }

    pub fn position(&self) -> Position {
        self.cache.read().position
    }

    pub fn configuration(&self) -> Configuration {
        self.cache.read().configuration
    }

    pub fn last_fault(&self) -> Option<DeviceFault> {
        self.cache.read().last_fault.clone()
    }

    pub fn presets(&self) -> HashMap<String, PresetEntry> {
        self.cache.read().presets.clone()
    }

    pub fn status(&self) -> DeviceStatus {
        let state = self.state();
        let cache = self.cache.read();
        let model = self
            .descriptor
            .model
            .clone()
            .or_else(|| cache.capabilities.model.clone());

        DeviceStatus {
            identity: self.descriptor.identity.clone(),
            name: self.descriptor.name.clone(),
            class: self.descriptor.class,
            model,
            location: self.descriptor.location,
            state,
            online: state.is_online(),
            capabilities: cache.capabilities.clone(),
            position: cache.position,
            normalized: geometry::to_normalized(cache.position),
            configuration: (self.descriptor.class == DeviceClass::Acoustic)
                .then_some(cache.configuration),
            last_fault: cache.last_fault.clone(),
            last_seen: cache.last_seen,
        }
    }

    // ── Uniform operations ─────────────────────────────────────────────────

    /// Move to a uniform pose; out-of-range values clamp
    pub async fn absolute_move(&self, pan: f64, tilt: f64, zoom: f64) -> DeviceResult<Position> {
        let pose = NormalizedPose::new(pan, tilt, zoom);
        if !geometry::is_finite(&pose) {
            return Err(DeviceError::InvalidArgument(format!(
                "non-finite pose {pan}/{tilt}/{zoom}"
            )));
        }

        let position = geometry::to_native(pose, self.descriptor.max_zoom);
        self.command(|cache| {
            cache.position = position;
            (OutboundMessage::MoveAbsolute { position }, position)
        })
        .await
    }

    /// Move relative to the cached native pose
    pub async fn relative_move(
        &self,
        delta_pan: f64,
        delta_tilt: f64,
        delta_zoom: f64,
    ) -> DeviceResult<Position> {
        let delta = NormalizedPose::new(delta_pan, delta_tilt, delta_zoom);
        if !geometry::is_finite(&delta) {
            return Err(DeviceError::InvalidArgument(format!(
                "non-finite delta {delta_pan}/{delta_tilt}/{delta_zoom}"
            )));
        }

        let max_zoom = self.descriptor.max_zoom;
        self.command(|cache| {
            let position = geometry::offset(cache.position, delta, max_zoom);
            cache.position = position;
            (OutboundMessage::MoveAbsolute { position }, position)
        })
        .await
    }

    /// Start continuous motion; the cache is left alone until the device reports
    pub async fn continuous_move(&self, pan: f64, tilt: f64, zoom: f64) -> DeviceResult<()> {
        let velocity = Velocity {
            pan: pan.clamp(-1.0, 1.0),
            tilt: tilt.clamp(-1.0, 1.0),
            zoom: zoom.clamp(-1.0, 1.0),
        };
        if !(velocity.pan.is_finite() && velocity.tilt.is_finite() && velocity.zoom.is_finite()) {
            return Err(DeviceError::InvalidArgument("non-finite velocity".into()));
        }

        self.command(|_| (OutboundMessage::ContinuousMove { velocity }, ()))
            .await
    }

    pub async fn stop(&self, axes: StopAxes) -> DeviceResult<()> {
        self.command(|_| (OutboundMessage::Stop(axes), ())).await
    }

    /// Recall a preset. Known tokens update the cache; unknown ones are still
    /// sent since the device may hold presets stored by an earlier process.
    pub async fn goto_preset(&self, token: &str) -> DeviceResult<()> {
        self.command(|cache| {
            if let Some(preset) = cache.presets.get(token).cloned() {
                cache.position = preset.position;
                if let Some(configuration) = preset.configuration {
                    cache.configuration = configuration;
                }
            }
            let message = OutboundMessage::GotoPreset {
                token: token.to_string(),
            };
            (message, ())
        })
        .await
    }

    /// Store the cached pose (and configuration, for acoustic devices) as a preset
    pub async fn set_preset(&self, token: &str, name: &str) -> DeviceResult<()> {
        let acoustic = self.descriptor.class == DeviceClass::Acoustic;
        self.command(|cache| {
            let position = cache.position;
            let configuration = acoustic.then_some(cache.configuration);
            cache.presets.insert(
                token.to_string(),
                PresetEntry {
                    name: name.to_string(),
                    position,
                    configuration,
                },
            );
            let message = OutboundMessage::SetPreset {
                token: token.to_string(),
                name: name.to_string(),
                position,
                configuration,
            };
            (message, ())
        })
        .await
    }

    // ── Acoustic actions ───────────────────────────────────────────────────

    pub async fn announce_voice(
        &self,
        message: &str,
        overrides: &ConfigurationOverrides,
    ) -> DeviceResult<()> {
        self.acoustic("voice_announcement", Mode::Voice, overrides, |configuration| {
            OutboundMessage::VoiceAnnouncement {
                message: message.to_string(),
                configuration,
            }
        })
        .await
    }

    pub async fn activate_deterrent(&self, overrides: &ConfigurationOverrides) -> DeviceResult<()> {
        self.acoustic("activate_deterrent", Mode::Deterrent, overrides, |configuration| {
            OutboundMessage::ActivateDeterrent { configuration }
        })
        .await
    }

    pub async fn activate_siren(&self, overrides: &ConfigurationOverrides) -> DeviceResult<()> {
        self.acoustic("activate_siren", Mode::Siren, overrides, |configuration| {
            OutboundMessage::ActivateSiren { configuration }
        })
        .await
    }

    pub async fn enter_standby(&self) -> DeviceResult<()> {
        self.acoustic(
            "enter_standby",
            Mode::Standby,
            &ConfigurationOverrides::default(),
            |_| OutboundMessage::EnterStandby,
        )
        .await
    }

    /// Run an [`AcousticAction`] against this session
    pub async fn perform(&self, action: &AcousticAction) -> DeviceResult<()> {
        match action {
            AcousticAction::Voice { message, overrides } => {
                self.announce_voice(message, overrides).await
            }
            AcousticAction::Deterrent { overrides } => self.activate_deterrent(overrides).await,
            AcousticAction::Siren { overrides } => self.activate_siren(overrides).await,
            AcousticAction::Standby => self.enter_standby().await,
        }
    }

    async fn acoustic(
        &self,
        action: &'static str,
        mode: Mode,
        overrides: &ConfigurationOverrides,
        build: impl FnOnce(Configuration) -> OutboundMessage,
    ) -> DeviceResult<()> {
        if self.descriptor.class != DeviceClass::Acoustic {
            return Err(DeviceError::UnsupportedAction {
                identity: self.descriptor.identity.clone(),
                class: self.descriptor.class,
                action,
            });
        }

        self.command(|cache| {
            let configuration = cache
                .configuration
                .apply(overrides, mode, &cache.capabilities);
            cache.configuration = configuration;
            (build(configuration), ())
        })
        .await
    }

    /// Queue one command for the wire. Fails without queueing unless Online.
    ///
    /// `step` builds the message from the cache and records its optimistic
    /// effect. It runs only once a queue slot is reserved, and the message
    /// is queued before any device report can be applied on top of it.
    async fn command<T>(
        &self,
        step: impl FnOnce(&mut SessionState) -> (OutboundMessage, T),
    ) -> DeviceResult<T> {
        let offline = |state: ConnectionState| DeviceError::Offline {
            identity: self.descriptor.identity.clone(),
            state,
        };

        let _ordered = self.commands.lock().await;

        let state = self.state();
        if !state.is_online() {
            return Err(offline(state));
        }

        let tx = self.outbound.read().clone();
        let Some(tx) = tx else {
            return Err(offline(self.state()));
        };

        let permit = tx.reserve().await.map_err(|_| offline(self.state()))?;
        let (message, output) = {
            let mut cache = self.cache.write();
            step(&mut cache)
        };

        debug!(device = %self.descriptor.identity, kind = message.kind(), "Dispatching command");
        permit.send(message);
        Ok(output)
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    async fn run(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut delay = policy.delay;

        while !*shutdown_rx.borrow() {
            self.set_state(ConnectionState::Connecting);

            let mut reached_online = false;
            let ended = tokio::select! {
                _ = shutdown_rx.changed() => break,
                ended = self.connect_and_serve(transport.as_ref(), &policy, &mut reached_online) => ended,
            };
            self.detach();

            if reached_online {
                delay = policy.delay;
            }

            match ended {
                Ended::Closed => {
                    info!(device = %self.descriptor.identity, "Connection closed");
                    self.set_state(ConnectionState::Disconnected);
                }
                Ended::Failed(e) => {
                    warn!(device = %self.descriptor.identity, error = %e, "Connection failed");
                    self.set_state(ConnectionState::Error);
                }
            }

            debug!(device = %self.descriptor.identity, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = policy.next_delay(delay);
        }

        self.detach();
        self.set_state(ConnectionState::Disconnected);
        debug!(device = %self.descriptor.identity, "Session task finished");
    }

    async fn connect_and_serve(
        &self,
        transport: &dyn Transport,
        policy: &ReconnectPolicy,
        reached_online: &mut bool,
    ) -> Ended {
        let Connection {
            outbound: wire,
            mut inbound,
        } = match transport.connect(&self.descriptor.endpoint).await {
            Ok(connection) => connection,
            Err(e) => return Ended::Failed(e),
        };

        // Handshake
        if let Err(e) = self.write_frame(&wire, &OutboundMessage::GetCapabilities).await {
            return Ended::Failed(e);
        }

        match tokio::time::timeout(policy.handshake_timeout, self.await_capabilities(&mut inbound))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(ended)) => return ended,
            Err(_) => {
                warn!(
                    device = %self.descriptor.identity,
                    "No capability response within handshake timeout, keeping current capabilities"
                );
            }
        }

        let (tx, mut rx) = mpsc::channel(policy.outbound_queue.max(1));
        *self.outbound.write() = Some(tx);
        self.set_state(ConnectionState::Online);
        *reached_online = true;

        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { return Ended::Closed };
                    match self.write_frame(&wire, &message).await {
                        Ok(()) => {}
                        Err(e @ DeviceError::Transport(_)) => return Ended::Failed(e),
                        Err(e) => {
                            warn!(device = %self.descriptor.identity, kind = message.kind(), error = %e, "Dropping unencodable command");
                        }
                    }
                }
                frame = inbound.recv() => {
                    match frame {
                        Some(frame) => {
                            self.handle_frame(&frame);
                        }
                        None => return Ended::Closed,
                    }
                }
            }
        }
    }

    /// Apply inbound frames until a capability response arrives
    async fn await_capabilities(&self, inbound: &mut mpsc::Receiver<String>) -> Result<(), Ended> {
        loop {
            let Some(frame) = inbound.recv().await else {
                return Err(Ended::Failed(DeviceError::Transport(
                    "connection closed during handshake".into(),
                )));
            };

            if let Some(InboundMessage::CapabilitiesResponse { .. }) = self.handle_frame(&frame) {
                return Ok(());
            }
        }
    }

    async fn write_frame(&self, wire: &mpsc::Sender<String>, message: &OutboundMessage) -> DeviceResult<()> {
        let frame = self.codec.encode(message)?;
        wire.send(frame)
            .await
            .map_err(|_| DeviceError::Transport("transport writer closed".into()))
    }

    fn handle_frame(&self, frame: &str) -> Option<InboundMessage> {
        match self.codec.decode(frame) {
            Ok(message) => {
                self.apply(message.clone());
                Some(message)
            }
            Err(e) => {
                debug!(device = %self.descriptor.identity, error = %e, "Ignoring unrecognized frame");
                None
            }
        }
    }

    /// Fold a device report into the cache and tell the bus about it
    fn apply(&self, message: InboundMessage) {
        let identity = &self.descriptor.identity;
        let now = Utc::now();
        self.cache.write().last_seen = Some(now);

        match message {
            InboundMessage::CapabilitiesResponse { capabilities } => {
                info!(device = %identity, model = ?capabilities.model, "Capabilities received");
                self.cache.write().capabilities = capabilities.clone();
                self.emit(
                    "device/capabilities",
                    serde_json::json!({
                        "identity": identity,
                        "class": self.descriptor.class,
                        "capabilities": capabilities,
                    }),
                );
            }
            InboundMessage::PositionUpdate { position } => {
                let position = geometry::normalize_reported(position, self.descriptor.max_zoom);
                self.cache.write().position = position;
                self.emit(
                    "device/position",
                    serde_json::json!({
                        "identity": identity,
                        "position": position,
                        "normalized": geometry::to_normalized(position),
                    }),
                );
            }
            InboundMessage::ConfigurationUpdate { configuration } => {
                self.cache.write().configuration = configuration;
                self.emit(
                    "device/configuration",
                    serde_json::json!({
                        "identity": identity,
                        "configuration": configuration,
                    }),
                );
            }
            InboundMessage::StatusUpdate(payload) => {
                debug!(device = %identity, "Status update");
                self.emit(
                    "device/status",
                    serde_json::json!({
                        "identity": identity,
                        "class": self.descriptor.class,
                        "status": payload,
                    }),
                );
            }
            InboundMessage::Error { error } => {
                let message = error_text(&error);
                warn!(device = %identity, error = %message, "Device reported error");
                self.cache.write().last_fault = Some(DeviceFault {
                    message: message.clone(),
                    at: now,
                });
                self.emit(
                    "device/fault",
                    serde_json::json!({
                        "identity": identity,
                        "class": self.descriptor.class,
                        "error": message,
                    }),
                );
            }
        }
    }

    fn detach(&self) {
        *self.outbound.write() = None;
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = ConnectionState::from_u8(self.state.swap(next as u8, Ordering::SeqCst));
        if previous == next {
            return;
        }

        info!(device = %self.descriptor.identity, from = %previous, to = %next, "Connection state changed");
        self.emit(
            "device/connection",
            serde_json::json!({
                "identity": self.descriptor.identity,
                "class": self.descriptor.class,
                "state": next,
                "previous": previous,
            }),
        );
    }

    fn emit(&self, event_type: &str, data: serde_json::Value) {
        // Nobody listening is fine
        let _ = self
            .publisher
            .emit(event_type, self.descriptor.identity.as_str(), data);
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("identity", &self.descriptor.identity)
            .field("class", &self.descriptor.class)
            .field("state", &self.state())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
