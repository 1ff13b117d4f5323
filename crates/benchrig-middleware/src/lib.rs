//! `benchrig-middleware` – message plumbing between the UI and the rig.
//!
//! Routes payloads between topic subscribers without caring about their
//! meaning.
//!
//! # Modules
//!
//! - [`transport`] – one client session against a broker, plus the
//!   in-process [`LoopbackBroker`].
//! - [`bus`] – the [`MessageBus`]: handler registry, presence and reconnect.
//! - [`ws_bridge`] – WebSocket endpoint that exposes the broker to UI clients.

pub mod bus;
pub mod transport;
pub mod ws_bridge;

pub use bus::{Handler, MessageBus, Payload, ReconnectPolicy};
pub use transport::{BusMessage, LoopbackBroker, LoopbackTransport, QoS, Transport};
pub use ws_bridge::WsBridge;
