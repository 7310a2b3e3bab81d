//! Device Transports
//!
//! A transport opens one text-frame connection to a device endpoint. The
//! session only sees a pair of channels, so any transport that can produce
//! them (WebSocket here, in-memory links in tests) is interchangeable.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::types::{DeviceError, DeviceResult};

const FRAME_BUFFER: usize = 64;

/// An open connection. `inbound` yielding `None` means the transport closed.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> DeviceResult<Connection>;
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, endpoint: &str) -> DeviceResult<Connection> {
        let (stream, _) = connect_async(endpoint)
            .await
            .map_err(|e| DeviceError::Transport(format!("{endpoint}: {e}")))?;

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(FRAME_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(FRAME_BUFFER);

        let endpoint_w = endpoint.to_string();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(frame)).await {
                    warn!(endpoint = %endpoint_w, error = %e, "WebSocket write failed");
                    break;
                }
            }
            let _ = write.close().await;
            debug!(endpoint = %endpoint_w, "WebSocket writer finished");
        });

        let endpoint_r = endpoint.to_string();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!(endpoint = %endpoint_r, "Dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(endpoint = %endpoint_r, error = %e, "WebSocket read failed");
                        break;
                    }
                };

                if in_tx.send(text).await.is_err() {
                    break;
                }
            }
            debug!(endpoint = %endpoint_r, "WebSocket reader finished");
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
