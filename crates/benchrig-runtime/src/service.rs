//! Wiring of the running rig.
//!
//! [`RigService::start`] builds the router, sequence worker, reply and
//! progress forwarders and the [`StatusPublisher`] around one
//! [`HardwareFacade`] and one [`MessageBus`], registers the command handler
//! and connects. [`RigService::shutdown`] stops everything and leaves the
//! hardware safe.

use std::sync::Arc;
use std::time::Duration;

use benchrig_hal::{HardwareFacade, PotRails};
use benchrig_journal::EventSink;
use benchrig_middleware::MessageBus;
use benchrig_types::{ChannelState, ProgressEvent, RigError, RigStatus, StatusReport, Topics};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::outbox::Outbox;
use crate::router::CommandRouter;
use crate::sequence::{CancelToken, SequenceEngine};
use crate::status::StatusPublisher;
use crate::worker::{CommandDispatcher, SequenceWorker, forward_replies};

/// Runtime settings of the service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub topics: Topics,
    /// Jobs that may wait behind the running one before commands are
    /// answered `busy`.
    pub queue_capacity: usize,
    pub temperature_interval: Duration,
    pub rails: PotRails,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            topics: Topics::default(),
            queue_capacity: 4,
            temperature_interval: Duration::from_secs(5),
            rails: PotRails::default(),
        }
    }
}

pub struct RigService {
    hw: HardwareFacade,
    bus: MessageBus,
    cancel: CancelToken,
    worker: JoinHandle<()>,
    sampler: JoinHandle<()>,
    forwarders: Vec<JoinHandle<()>>,
}

impl RigService {
    /// Start every task and connect the bus.
    ///
    /// # Errors
    ///
    /// [`RigError::Channel`] when the bus cannot subscribe or connect.
    pub async fn start(
        config: ServiceConfig,
        hw: HardwareFacade,
        bus: MessageBus,
        journal: Arc<dyn EventSink>,
    ) -> Result<Self, RigError> {
        let outbox = Outbox::new(bus.clone(), config.topics.clone(), journal);
        let cancel = CancelToken::new();

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let engine = SequenceEngine::new(hw.clone(), config.rails).with_progress(progress_tx);
        let router = CommandRouter::new(hw.clone(), engine, cancel.clone());

        let (queue, jobs) = mpsc::channel(config.queue_capacity.max(1));
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let dispatcher = CommandDispatcher::new(queue, cancel.clone(), hw.clone(), reply_tx);

        let worker = tokio::spawn(SequenceWorker::new(router, jobs, outbox.clone()).run());
        let forwarders = vec![
            tokio::spawn(forward_replies(reply_rx, outbox.clone())),
            tokio::spawn(forward_progress(progress_rx, outbox.clone())),
        ];

        bus.register_handler(&config.topics.command, dispatcher.handler())
            .await?;
        bus.connect().await?;
        outbox
            .status(&StatusReport {
                channel: ChannelState::default(),
                status: RigStatus::Idle,
                sequence: None,
                timestamp: Utc::now(),
            })
            .await;

        let sampler =
            StatusPublisher::new(hw.clone(), outbox, config.temperature_interval).spawn();

        info!(
            client = bus.client_id(),
            command_topic = %config.topics.command,
            queue_capacity = config.queue_capacity,
            "rig service started"
        );
        Ok(Self {
            hw,
            bus,
            cancel,
            worker,
            sampler,
            forwarders,
        })
    }

    /// Cancel any sequence, switch every relay and the generator output off
    /// and publish `offline`. Hardware errors are logged, not returned.
    ///
    /// # Errors
    ///
    /// [`RigError::Channel`] when the offline presence could not be published.
    pub async fn shutdown(self) -> Result<(), RigError> {
        info!("rig service shutting down");
        self.cancel.cancel();
        self.worker.abort();
        self.sampler.abort();

        if let Err(e) = self.hw.all_off().await {
            warn!(error = %e, "relays could not be switched off");
        }
        if self.hw.generator_connected().await {
            if let Err(e) = self.hw.set_output(false).await {
                warn!(error = %e, "generator output could not be disabled");
            }
        }

        let result = self.bus.disconnect().await;
        for task in self.forwarders {
            task.abort();
        }
        result
    }
}

async fn forward_progress(mut rx: mpsc::UnboundedReceiver<ProgressEvent>, outbox: Outbox) {
    while let Some(event) = rx.recv().await {
        outbox.progress(&event).await;
    }
}
