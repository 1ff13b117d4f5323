//! Connection-level transport beneath the [`MessageBus`][crate::bus::MessageBus].
//!
//! A [`Transport`] is one client session against a broker: connect, subscribe
//! to exact topic names, publish, disconnect. The bus layers handler
//! dispatch, presence and reconnection on top.
//!
//! [`LoopbackBroker`] is an in-process broker built on a Tokio broadcast
//! channel. It keeps the last retained message per topic and can sever every
//! live session at once, which is how reconnect behaviour is exercised.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use benchrig_types::RigError;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

/// Default broadcast capacity of a [`LoopbackBroker`].
const DEFAULT_CAPACITY: usize = 1024;

/// Delivery guarantee requested for a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// One message as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

/// One client session against a pub/sub broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session. The returned stream yields messages on subscribed
    /// topics and ends when the connection drops.
    async fn connect(&self, client_id: &str) -> Result<BoxStream<'static, BusMessage>, RigError>;

    /// Subscribe the current session to `topic`. Any retained message on the
    /// topic is delivered right away.
    async fn subscribe(&self, topic: &str) -> Result<(), RigError>;

    async fn publish(&self, message: BusMessage) -> Result<(), RigError>;

    /// Close the current session. Closing twice is a no-op.
    async fn disconnect(&self) -> Result<(), RigError>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─────────────────────────────────────────────────────────────────────────────
// Loopback broker
// ─────────────────────────────────────────────────────────────────────────────

/// In-process broker shared by every [`LoopbackTransport`] and the
/// WebSocket bridge.
pub struct LoopbackBroker {
    tx: broadcast::Sender<BusMessage>,
    retained: Mutex<HashMap<String, BusMessage>>,
    epoch: watch::Sender<u64>,
}

impl LoopbackBroker {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity);
        let (epoch, _) = watch::channel(0);
        Arc::new(Self {
            tx,
            retained: Mutex::new(HashMap::new()),
            epoch,
        })
    }

    /// Fan `message` out to every session. A retained message replaces the
    /// topic's stored one; a retained empty payload clears it.
    pub fn publish(&self, message: BusMessage) {
        if message.retain {
            let mut retained = lock(&self.retained);
            if message.payload.is_empty() {
                retained.remove(&message.topic);
            } else {
                retained.insert(message.topic.clone(), message.clone());
            }
        }
        // No live receivers is a normal condition.
        let _ = self.tx.send(message);
    }

    /// Every publication, regardless of topic.
    pub fn subscribe_all(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    pub fn retained(&self) -> Vec<BusMessage> {
        let mut out: Vec<BusMessage> = lock(&self.retained).values().cloned().collect();
        out.sort_by(|a, b| a.topic.cmp(&b.topic));
        out
    }

    pub fn retained_on(&self, topic: &str) -> Option<BusMessage> {
        lock(&self.retained).get(topic).cloned()
    }

    /// Sever every live session, as a broker restart or network drop would.
    pub fn drop_connections(&self) {
        self.epoch.send_modify(|e| *e += 1);
        debug!(epoch = *self.epoch.borrow(), "loopback broker dropped all sessions");
    }

    fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loopback transport
// ─────────────────────────────────────────────────────────────────────────────

struct Session {
    client_id: String,
    epoch: u64,
    topics: Arc<Mutex<HashSet<String>>>,
    retained_tx: mpsc::UnboundedSender<BusMessage>,
}

/// A [`Transport`] session against a [`LoopbackBroker`].
pub struct LoopbackTransport {
    broker: Arc<LoopbackBroker>,
    session: Mutex<Option<Session>>,
}

impl LoopbackTransport {
    pub fn new(broker: Arc<LoopbackBroker>) -> Self {
        Self {
            broker,
            session: Mutex::new(None),
        }
    }

    fn live_session<R>(&self, f: impl FnOnce(&Session) -> R) -> Result<R, RigError> {
        let session = lock(&self.session);
        match session.as_ref() {
            Some(s) if s.epoch == self.broker.epoch() => Ok(f(s)),
            Some(s) => Err(RigError::Channel(format!(
                "session {} lost its connection",
                s.client_id
            ))),
            None => Err(RigError::Channel("not connected".into())),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, client_id: &str) -> Result<BoxStream<'static, BusMessage>, RigError> {
        let topics: Arc<Mutex<HashSet<String>>> = Arc::default();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<BusMessage>();
        let (retained_tx, mut retained_rx) = mpsc::unbounded_channel::<BusMessage>();
        let mut bus_rx = self.broker.subscribe_all();
        let mut epoch_rx = self.broker.epoch.subscribe();
        let epoch = *epoch_rx.borrow_and_update();

        let filter = Arc::clone(&topics);
        let id = client_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = bus_rx.recv() => match result {
                        Ok(msg) => {
                            if !lock(&filter).contains(&msg.topic) {
                                continue;
                            }
                            if out_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(client = %id, lagged_by = n, "loopback session lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    retained = retained_rx.recv() => match retained {
                        Some(msg) => {
                            if out_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = epoch_rx.changed() => break,
                }
            }
            debug!(client = %id, "loopback session closed");
        });

        *lock(&self.session) = Some(Session {
            client_id: client_id.to_string(),
            epoch,
            topics,
            retained_tx,
        });

        let stream = stream::unfold(out_rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });
        Ok(stream.boxed())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), RigError> {
        let retained = self.broker.retained_on(topic);
        self.live_session(|s| {
            lock(&s.topics).insert(topic.to_string());
            if let Some(msg) = retained {
                let _ = s.retained_tx.send(msg);
            }
        })
    }

    async fn publish(&self, message: BusMessage) -> Result<(), RigError> {
        self.live_session(|_| ())?;
        self.broker.publish(message);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RigError> {
        lock(&self.session).take();
        Ok(())
    }
}
