//! `benchrig-runtime` – command dispatch and hardware sequencing.
//!
//! # Modules
//!
//! - [`sequence`] – [`SequenceEngine`]: burst series, pulse-train sweep,
//!   voltage sweep and the single configured burst, with the
//!   [`CancelToken`] checked between steps.
//! - [`router`] – [`CommandRouter`]: owns the active channel and the stored
//!   signal configuration and turns each command into hardware calls and a
//!   response envelope.
//! - [`worker`] – [`CommandDispatcher`] (decode and enqueue on the bus
//!   callback) and [`SequenceWorker`] (drains the bounded queue one job at a
//!   time).
//! - [`outbox`] – [`Outbox`]: every outbound publication, mirrored into the
//!   event journal.
//! - [`status`] – [`StatusPublisher`]: periodic temperature sampling.
//! - [`service`] – [`RigService`]: wires all of the above around one
//!   hardware facade and one message bus.
//! - [`telemetry`] – [`init_tracing`]: `tracing` subscriber with optional
//!   OTLP span export (`OTEL_EXPORTER_OTLP_ENDPOINT`).

pub mod outbox;
pub mod router;
pub mod sequence;
pub mod service;
pub mod status;
pub mod telemetry;
pub mod worker;

pub use outbox::Outbox;
pub use router::CommandRouter;
pub use sequence::{CancelGuard, CancelToken, SequenceEngine};
pub use service::{RigService, ServiceConfig};
pub use status::StatusPublisher;
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use worker::{CommandDispatcher, Job, SequenceWorker};
