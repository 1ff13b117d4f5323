//! Topic-keyed publish/subscribe [`MessageBus`] with automatic reconnect.
//!
//! The bus owns one [`Transport`] session. On every successful connection it
//! (re)subscribes all registered topics and publishes a retained
//! `{"status":"online"}` presence message on the status topic. A graceful
//! [`MessageBus::disconnect`] publishes a retained `{"status":"offline"}`
//! before closing.
//!
//! Inbound payloads are decoded as JSON when possible; otherwise the raw
//! text is handed through as [`Payload::Raw`]. Handlers run on the bus's
//! supervisor task and must not block.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use benchrig_types::{Presence, PresenceStatus, RigError};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{BusMessage, QoS, Transport};

/// A decoded inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    /// Not valid JSON; the payload as (lossy) UTF-8 text.
    Raw(String),
}

impl Payload {
    pub fn decode(bytes: &[u8]) -> Self {
        match serde_json::from_slice(bytes) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Raw(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}

/// Callback invoked for every message on a registered topic.
pub type Handler = Arc<dyn Fn(Payload) + Send + Sync>;

/// Delay schedule between reconnect attempts: doubles from `initial` up to
/// `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    client_id: String,
    status_topic: String,
    policy: ReconnectPolicy,
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
    connected: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Shared pub/sub client. Clones share one session.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl MessageBus {
    pub fn new(
        transport: Arc<dyn Transport>,
        client_id: impl Into<String>,
        status_topic: impl Into<String>,
    ) -> Self {
        let (connected, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                transport,
                client_id: client_id.into(),
                status_topic: status_topic.into(),
                policy: ReconnectPolicy::default(),
                handlers: RwLock::new(HashMap::new()),
                connected,
                shutdown,
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Replace the reconnect schedule. Only valid before [`connect`][Self::connect].
    pub fn with_policy(self, policy: ReconnectPolicy) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.policy = policy;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Watch connection state changes.
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Open the session, announce presence and start the receive/reconnect
    /// supervisor.
    ///
    /// # Errors
    ///
    /// [`RigError::Channel`] when the first connection attempt fails.
    pub async fn connect(&self) -> Result<(), RigError> {
        let stream = open_session(&self.inner).await?;
        self.inner.shutdown.send_replace(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(supervise(inner, stream));
        let previous = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Route every message on `topic` to `handler`. Subscribes immediately
    /// when connected; otherwise on the next connection.
    pub async fn register_handler(&self, topic: &str, handler: Handler) -> Result<(), RigError> {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        if self.is_connected() {
            self.inner.transport.subscribe(topic).await?;
        }
        debug!(topic, "handler registered");
        Ok(())
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RigError> {
        self.inner
            .transport
            .publish(BusMessage {
                topic: topic.to_string(),
                payload: payload.into(),
                qos,
                retain,
            })
            .await
    }

    /// Serialise `value` as JSON and publish it.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &T,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RigError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| RigError::Channel(e.to_string()))?;
        self.publish(topic, payload, qos, retain).await
    }

    /// Publish retained `offline` presence, stop the supervisor and close
    /// the session.
    pub async fn disconnect(&self) -> Result<(), RigError> {
        let presence = Presence {
            status: PresenceStatus::Offline,
        };
        let announced = self
            .publish_json(&self.inner.status_topic, &presence, QoS::AtLeastOnce, true)
            .await;
        if let Err(e) = &announced {
            warn!(error = %e, "could not publish offline presence");
        }
        self.inner.shutdown.send_replace(true);
        let handle = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.connected.send_replace(false);
        self.inner.transport.disconnect().await?;
        info!(client = %self.inner.client_id, "message bus disconnected");
        announced
    }
}

/// Connect, resubscribe every handler topic and announce `online`.
async fn open_session(inner: &Inner) -> Result<BoxStream<'static, BusMessage>, RigError> {
    let stream = inner.transport.connect(&inner.client_id).await?;
    let topics: Vec<String> = inner
        .handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect();
    for topic in &topics {
        inner.transport.subscribe(topic).await?;
    }
    let presence = serde_json::to_vec(&Presence {
        status: PresenceStatus::Online,
    })
    .map_err(|e| RigError::Channel(e.to_string()))?;
    inner
        .transport
        .publish(BusMessage {
            topic: inner.status_topic.clone(),
            payload: presence,
            qos: QoS::AtLeastOnce,
            retain: true,
        })
        .await?;
    inner.connected.send_replace(true);
    info!(client = %inner.client_id, topics = topics.len(), "message bus connected");
    Ok(stream)
}

fn dispatch(inner: &Inner, message: BusMessage) {
    let handlers: Vec<Handler> = inner
        .handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&message.topic)
        .cloned()
        .unwrap_or_default();
    if handlers.is_empty() {
        return;
    }
    let payload = Payload::decode(&message.payload);
    for handler in handlers {
        handler(payload.clone());
    }
}

/// Resolves once shutdown has been requested, including before the call.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn supervise(inner: Arc<Inner>, mut stream: BoxStream<'static, BusMessage>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(msg) => dispatch(&inner, msg),
                    None => break,
                },
                _ = stopped(&mut shutdown) => return,
            }
        }
        inner.connected.send_replace(false);
        warn!(client = %inner.client_id, "message bus connection lost, reconnecting");

        let mut delay = inner.policy.initial;
        stream = loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut shutdown) => return,
            }
            match open_session(&inner).await {
                Ok(stream) => break stream,
                Err(e) => {
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "reconnect failed");
                    delay = (delay * 2).min(inner.policy.max);
                }
            }
        };
    }
}
