//! Dispatch path and sequence worker.
//!
//! The bus handler only decodes and enqueues: [`CommandDispatcher`] turns a
//! payload into a [`Job`] and pushes it onto a bounded queue without
//! waiting. A single [`SequenceWorker`] task drains that queue one job at a
//! time through the [`CommandRouter`], so two sequences never interleave on
//! the hardware.
//!
//! Handled directly on the dispatch path:
//!
//! | Input                      | Outcome                                         |
//! |----------------------------|-------------------------------------------------|
//! | non-JSON or invalid command | immediate error reply                          |
//! | `cancel_sequence`          | cancel raised, immediate reply                  |
//! | `all_off`                  | cancel raised, relays switched off right away   |
//! | anything else, queue full  | immediate `busy` reply                          |
//!
//! A cancel also discards every job queued before it; the worker answers
//! those with a `cancelled` error instead of running them.

use std::sync::Arc;

use benchrig_hal::HardwareFacade;
use benchrig_middleware::{Handler, Payload};
use benchrig_types::{
    Command, CommandKind, ResponseEnvelope, RigError, RigStatus, SequenceKind, StatusReport,
};
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::outbox::Outbox;
use crate::router::{CommandRouter, reject};
use crate::sequence::{CancelGuard, CancelToken};

/// One decoded command waiting for the worker.
pub struct Job {
    pub command: Command,
    pub raw: Value,
    pub guard: CancelGuard,
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CommandDispatcher {
    queue: mpsc::Sender<Job>,
    capacity: usize,
    cancel: CancelToken,
    hw: HardwareFacade,
    replies: mpsc::UnboundedSender<ResponseEnvelope>,
}

impl CommandDispatcher {
    pub fn new(
        queue: mpsc::Sender<Job>,
        cancel: CancelToken,
        hw: HardwareFacade,
        replies: mpsc::UnboundedSender<ResponseEnvelope>,
    ) -> Self {
        Self {
            capacity: queue.max_capacity(),
            queue,
            cancel,
            hw,
            replies,
        }
    }

    /// Wrap the dispatcher as a bus handler.
    pub fn handler(&self) -> Handler {
        let dispatcher = self.clone();
        Arc::new(move |payload| dispatcher.dispatch(payload))
    }

    /// Route one inbound payload. Never blocks.
    pub fn dispatch(&self, payload: Payload) {
        let raw = match payload {
            Payload::Json(value) => value,
            Payload::Raw(text) => {
                let err = RigError::Validation("command payload is not valid JSON".into());
                self.reply(reject(&err, &Value::String(text)));
                return;
            }
        };
        let command = match Command::from_value(&raw) {
            Ok(command) => command,
            Err(e) => {
                self.reply(reject(&e, &raw));
                return;
            }
        };

        match command {
            Command::CancelSequence => {
                self.cancel.cancel();
                info!("sequence cancellation requested");
                self.reply(
                    ResponseEnvelope::success(CommandKind::CancelSequence, Map::new())
                        .with("cancelled", true),
                );
            }
            Command::AllOff => {
                self.cancel.cancel();
                let hw = self.hw.clone();
                let replies = self.replies.clone();
                tokio::spawn(async move {
                    let reply = match hw.all_off().await {
                        Ok(()) => {
                            info!("all relays off");
                            ResponseEnvelope::success(CommandKind::AllOff, Map::new())
                                .with("relays", "off")
                        }
                        Err(e) => reject(&e, &raw),
                    };
                    let _ = replies.send(reply);
                });
            }
            command => self.enqueue(command, raw),
        }
    }

    fn enqueue(&self, command: Command, raw: Value) {
        let kind = command.kind();
        let job = Job {
            command,
            raw,
            guard: self.cancel.guard(),
        };
        match self.queue.try_send(job) {
            Ok(()) => debug!(command = %kind, "job queued"),
            Err(TrySendError::Full(job)) => {
                let err = RigError::Busy(format!(
                    "{} job(s) already waiting behind the running sequence",
                    self.capacity
                ));
                self.reply(reject(&err, &job.raw));
            }
            Err(TrySendError::Closed(job)) => {
                let err = RigError::Channel("sequence worker has stopped".into());
                self.reply(reject(&err, &job.raw));
            }
        }
    }

    fn reply(&self, reply: ResponseEnvelope) {
        if self.replies.send(reply).is_err() {
            warn!("reply dropped: responder has stopped");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

pub struct SequenceWorker {
    router: CommandRouter,
    jobs: mpsc::Receiver<Job>,
    outbox: Outbox,
}

impl SequenceWorker {
    pub fn new(router: CommandRouter, jobs: mpsc::Receiver<Job>, outbox: Outbox) -> Self {
        Self {
            router,
            jobs,
            outbox,
        }
    }

    /// Drain the queue until every dispatcher is gone.
    pub async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            self.process(job).await;
        }
        debug!("sequence worker stopped");
    }

    async fn process(&mut self, mut job: Job) {
        if job.guard.is_cancelled() {
            let err = RigError::Cancelled {
                sequence: job
                    .command
                    .sequence()
                    .map_or(job.command.kind().as_str(), |s| s.as_str())
                    .to_string(),
                completed_steps: 0,
            };
            self.outbox.response(&reject(&err, &job.raw)).await;
            return;
        }

        let sequence = job.command.sequence();
        if sequence.is_some() {
            self.report(RigStatus::Running, sequence).await;
        }
        let reply = self
            .router
            .execute(job.command, &job.raw, &mut job.guard)
            .await;
        self.outbox.response(&reply).await;
        self.report(RigStatus::Idle, None).await;
    }

    async fn report(&self, status: RigStatus, sequence: Option<SequenceKind>) {
        self.outbox
            .status(&StatusReport {
                channel: self.router.channel(),
                status,
                sequence,
                timestamp: Utc::now(),
            })
            .await;
    }
}

/// Publish every reply the dispatch path produced.
pub async fn forward_replies(
    mut replies: mpsc::UnboundedReceiver<ResponseEnvelope>,
    outbox: Outbox,
) {
    while let Some(reply) = replies.recv().await {
        outbox.response(&reply).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchrig_hal::sim::{SimHandles, SimRig};
    use benchrig_types::ErrorKind;
    use serde_json::json;

    struct Harness {
        dispatcher: CommandDispatcher,
        jobs: mpsc::Receiver<Job>,
        replies: mpsc::UnboundedReceiver<ResponseEnvelope>,
        sim: SimHandles,
    }

    fn harness(capacity: usize) -> Harness {
        let (hw, sim) = SimRig::new().build();
        let (queue, jobs) = mpsc::channel(capacity);
        let (reply_tx, replies) = mpsc::unbounded_channel();
        Harness {
            dispatcher: CommandDispatcher::new(queue, CancelToken::new(), hw, reply_tx),
            jobs,
            replies,
            sim,
        }
    }

    fn send(h: &Harness, value: Value) {
        h.dispatcher.dispatch(Payload::Json(value));
    }

    #[tokio::test]
    async fn full_queue_answers_busy() {
        let mut h = harness(1);
        send(&h, json!({"type": "burst", "cycles": 5}));
        send(&h, json!({"type": "burst", "cycles": 3}));

        let reply = h.replies.recv().await.unwrap();
        assert_eq!(reply.error_kind(), Some(ErrorKind::Busy));
        assert_eq!(reply.command.unwrap()["cycles"], 3);
        assert!(h.jobs.try_recv().is_ok());
    }

    #[tokio::test]
    async fn invalid_commands_never_reach_the_queue() {
        let mut h = harness(4);
        send(&h, json!({"type": "frobnicate"}));
        h.dispatcher.dispatch(Payload::Raw("channel 3 please".into()));

        let first = h.replies.recv().await.unwrap();
        assert_eq!(first.error_kind(), Some(ErrorKind::UnknownCommand));
        let second = h.replies.recv().await.unwrap();
        assert_eq!(second.error_kind(), Some(ErrorKind::ValidationError));
        assert_eq!(second.command, Some(json!("channel 3 please")));
        assert!(h.jobs.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_marks_earlier_jobs_stale_only() {
        let mut h = harness(4);
        send(&h, json!({"type": "burst", "cycles": 5}));
        send(&h, json!({"type": "cancel_sequence"}));
        send(&h, json!({"type": "burst", "cycles": 2}));

        let reply = h.replies.recv().await.unwrap();
        assert_eq!(reply.response_type, "cancel_sequence_status");
        assert!(h.jobs.recv().await.unwrap().guard.is_cancelled());
        assert!(!h.jobs.recv().await.unwrap().guard.is_cancelled());
    }

    #[tokio::test]
    async fn all_off_bypasses_a_full_queue() {
        let mut h = harness(1);
        send(&h, json!({"type": "channel_select", "channel": 1}));
        send(&h, json!({"type": "all_off"}));

        let reply = h.replies.recv().await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.response_type, "all_off_status");
        assert!(h.sim.relay_writes() > 0);
        assert!(h.jobs.recv().await.unwrap().guard.is_cancelled());
    }
}
