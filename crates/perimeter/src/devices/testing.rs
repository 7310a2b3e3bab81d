//! Simulated devices for session, registry and coordinator tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use perimeter_runtime::{Event, EventPublisher};

use super::session::{DeviceSession, ReconnectPolicy};
use super::transport::{Connection, Transport};
use super::types::{DeviceError, DeviceResult};

const WAIT: Duration = Duration::from_secs(2);
const FRAME_BUFFER: usize = 64;

/// Device side of an in-memory connection
#[derive(Debug)]
pub(crate) struct DeviceLink {
    /// Frames written by the session
    pub from_session: mpsc::Receiver<String>,
    /// Frames delivered to the session
    pub to_session: mpsc::Sender<String>,
}

impl DeviceLink {
    /// Next frame from the session, parsed as JSON
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let frame = self.from_session.recv().await?;
        serde_json::from_str(&frame).ok()
    }

    pub async fn send_json(&self, value: serde_json::Value) -> DeviceResult<()> {
        self.to_session
            .send(value.to_string())
            .await
            .map_err(|_| DeviceError::ChannelClosed)
    }
}

/// Transport that connects to in-process listeners. Endpoints without a
/// listener refuse the connection.
#[derive(Debug)]
pub(crate) struct MemoryTransport {
    listeners: DashMap<String, mpsc::UnboundedSender<DeviceLink>>,
    frame_buffer: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_frame_buffer(FRAME_BUFFER)
    }

    /// Links whose channels hold at most `frames` unread frames each way
    pub fn with_frame_buffer(frames: usize) -> Self {
        Self {
            listeners: DashMap::new(),
            frame_buffer: frames.max(1),
        }
    }

    /// Accept connections to `endpoint`; each connect yields one [`DeviceLink`]
    pub fn listen(&self, endpoint: impl Into<String>) -> mpsc::UnboundedReceiver<DeviceLink> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(endpoint.into(), tx);
        rx
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, endpoint: &str) -> DeviceResult<Connection> {
        let refused = || DeviceError::Transport(format!("{endpoint}: connection refused"));

        let listener = self.listeners.get(endpoint).map(|l| l.clone()).ok_or_else(refused)?;

        let (out_tx, out_rx) = mpsc::channel(self.frame_buffer);
        let (in_tx, in_rx) = mpsc::channel(self.frame_buffer);

        listener
            .send(DeviceLink {
                from_session: out_rx,
                to_session: in_tx,
            })
            .map_err(|_| refused())?;

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

pub(crate) fn publisher() -> (EventPublisher, broadcast::Receiver<Event>) {
    let (tx, rx) = broadcast::channel(256);
    (EventPublisher::new(tx), rx)
}

pub(crate) fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(20),
        multiplier: 1.0,
        handshake_timeout: Duration::from_millis(300),
        outbound_queue: 16,
    }
}

/// Device end of a memory transport endpoint, driven by the test
pub(crate) struct SimulatedDevice {
    listener: mpsc::UnboundedReceiver<DeviceLink>,
}

impl SimulatedDevice {
    pub fn listen(transport: &MemoryTransport, endpoint: &str) -> Self {
        Self {
            listener: transport.listen(endpoint),
        }
    }

    pub async fn accept(&mut self) -> DeviceLink {
        tokio::time::timeout(WAIT, self.listener.recv())
            .await
            .expect("session never connected")
            .expect("listener closed")
    }

    pub async fn answer_capabilities(link: &DeviceLink, model: &str) {
        link.send_json(json!({
            "type": "capabilities_response",
            "capabilities": {
                "model": model,
                "maxSPL": 162,
                "frequencyRange": [500, 5000],
                "hasOpticalDazzler": true
            }
        }))
        .await
        .expect("session dropped the link");
    }

    /// Accept the next connection and complete its handshake
    pub async fn handshake(&mut self, session: &DeviceSession) -> DeviceLink {
        let mut link = self.accept().await;
        let first = link.recv_json().await.expect("no handshake frame");
        assert_eq!(first["type"], "get_capabilities");
        Self::answer_capabilities(&link, "Simulated").await;
        Self::wait_online(session).await;
        link
    }

    pub async fn wait_online(session: &DeviceSession) {
        Self::wait_until(|| session.is_online()).await;
    }

    pub async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Serve `endpoint` in the background: answer every handshake and
    /// forward every other frame to the returned receiver
    pub fn spawn_responder(
        transport: &MemoryTransport,
        endpoint: &str,
        model: &str,
    ) -> mpsc::UnboundedReceiver<serde_json::Value> {
        let mut device = Self::listen(transport, endpoint);
        let model = model.to_string();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(mut link) = device.listener.recv().await {
                while let Some(frame) = link.recv_json().await {
                    if frame["type"] == "get_capabilities" {
                        Self::answer_capabilities(&link, &model).await;
                    } else if frames_tx.send(frame).is_err() {
                        return;
                    }
                }
            }
        });

        frames_rx
    }

    pub async fn wait_all_online(sessions: &[Arc<DeviceSession>]) {
        Self::wait_until(|| sessions.iter().all(|s| s.is_online())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_links_both_directions() {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen("mem://lrad-01");

        let mut conn = transport.connect("mem://lrad-01").await.unwrap();
        let mut link = listener.recv().await.unwrap();

        conn.outbound.send(r#"{"type":"get_capabilities"}"#.to_string()).await.unwrap();
        let frame = link.recv_json().await.unwrap();
        assert_eq!(frame["type"], "get_capabilities");

        link.send_json(json!({"type": "status_update"})).await.unwrap();
        assert!(conn.inbound.recv().await.unwrap().contains("status_update"));

        drop(link);
        assert!(conn.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_transport_refuses_unknown_endpoint() {
        let transport = MemoryTransport::new();
        let result = transport.connect("mem://nowhere").await;
        assert!(matches!(result, Err(DeviceError::Transport(_))));

        let listener = transport.listen("mem://cam-01");
        drop(listener);
        assert!(transport.connect("mem://cam-01").await.is_err());
    }
}
