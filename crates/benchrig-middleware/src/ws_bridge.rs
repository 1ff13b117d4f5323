//! WebSocket bridge between UI clients and the [`LoopbackBroker`].
//!
//! This module provides [`WsBridge`], which:
//!
//! 1. **Pushes** every broker publication to each connected client as a
//!    `{"topic", "payload", "retain"}` JSON text frame. Retained messages are
//!    sent first, right after the handshake.
//!
//! 2. **Accepts** `{"topic", "payload"}` frames from clients and publishes
//!    them on the broker. A string payload is forwarded as raw text; any
//!    other JSON value is forwarded as its serialised form.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use benchrig_types::RigError;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::transport::{BusMessage, LoopbackBroker, QoS};

/// Pause after a failed `accept` (e.g. the process is out of descriptors).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One bridge frame in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsFrame {
    pub topic: String,
    pub payload: Value,
    #[serde(default)]
    pub retain: bool,
}

/// Serves the broker to WebSocket clients.
#[derive(Clone)]
pub struct WsBridge {
    broker: Arc<LoopbackBroker>,
}

impl WsBridge {
    pub fn new(broker: Arc<LoopbackBroker>) -> Self {
        Self { broker }
    }

    /// Bind `addr` and serve until the task is dropped.
    ///
    /// # Errors
    ///
    /// [`RigError::Channel`] if the listener cannot be bound.
    pub async fn run(self, addr: SocketAddr) -> Result<(), RigError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RigError::Channel(format!("ws bind error on {addr}: {e}")))?;
        info!(%addr, "websocket bridge listening");
        self.serve(listener).await;
        Ok(())
    }

    /// Accept clients on an already-bound listener.
    pub async fn serve(self, listener: TcpListener) {
        let listener = &listener;
        accept_loop(
            move || listener.accept(),
            |stream, peer| {
                let bridge = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = bridge.handle_client(stream, peer).await {
                        error!(peer = %peer, error = %e, "ws client error");
                    }
                });
            },
        )
        .await;
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), RigError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| RigError::Channel(format!("ws handshake from {peer}: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // Subscribe before replaying retained state so nothing published in
        // between is missed.
        let mut rx = self.broker.subscribe_all();
        for msg in self.broker.retained() {
            let frame = encode_frame(&msg)?;
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                return Ok(());
            }
        }
        debug!(peer = %peer, "ws client attached");

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(msg) => {
                            let frame = encode_frame(&msg)?;
                            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(peer = %peer, lagged_by = n, "ws client lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.handle_client_frame(text.as_str()) {
                                warn!(peer = %peer, error = %e, "ws frame rejected");
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        debug!(peer = %peer, "ws client detached");
        Ok(())
    }

    /// Publish a client frame on the broker.
    ///
    /// # Errors
    ///
    /// [`RigError::Validation`] when the text is not a `{"topic", "payload"}`
    /// object.
    pub fn handle_client_frame(&self, text: &str) -> Result<(), RigError> {
        let frame: WsFrame = serde_json::from_str(text)
            .map_err(|e| RigError::Validation(format!("bad ws frame: {e}")))?;
        let payload = match frame.payload {
            Value::String(s) => s.into_bytes(),
            other => other.to_string().into_bytes(),
        };
        self.broker.publish(BusMessage {
            topic: frame.topic,
            payload,
            qos: QoS::AtLeastOnce,
            retain: frame.retain,
        });
        Ok(())
    }
}

/// Render a broker message as a client frame. JSON payloads are embedded as
/// values; anything else as a string.
pub fn encode_frame(msg: &BusMessage) -> Result<String, RigError> {
    let payload = serde_json::from_slice(&msg.payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&msg.payload).into_owned()));
    let frame = WsFrame {
        topic: msg.topic.clone(),
        payload,
        retain: msg.retain,
    };
    serde_json::to_string(&frame).map_err(|e| RigError::Channel(e.to_string()))
}

async fn accept_loop<S, F, Fut>(mut accept: F, mut on_client: impl FnMut(S, SocketAddr))
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<(S, SocketAddr)>>,
{
    loop {
        match accept().await {
            Ok((stream, peer)) => on_client(stream, peer),
            Err(e) => {
                error!(error = %e, "ws accept error");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}
