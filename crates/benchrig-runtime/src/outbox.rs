//! Outbound side of the rig service.
//!
//! Every message the rig emits goes through [`Outbox`], which publishes it on
//! the right topic with the right retain flag and mirrors it into the event
//! journal. Publishing is best effort: a bus that is between reconnects
//! costs a warning, never the caller's work.
//!
//! | Method          | Topic         | Retained | Journal kind               |
//! |-----------------|---------------|----------|----------------------------|
//! | `response`      | response      | no       | `command`                  |
//! | `status`        | status        | yes      | –                          |
//! | `progress`      | progress      | no       | `sweep_step` / `trigger`   |
//! | `temperature`   | temperature   | no       | `temperature`              |

use std::sync::Arc;

use benchrig_journal::{EntryKind, EventSink, JournalEntry};
use benchrig_middleware::{MessageBus, QoS};
use benchrig_types::{
    ProgressEvent, ResponseEnvelope, SequenceKind, StatusReport, TemperatureSample, Topics,
};
use serde::Serialize;
use tracing::warn;

#[derive(Clone)]
pub struct Outbox {
    bus: MessageBus,
    topics: Topics,
    journal: Arc<dyn EventSink>,
}

impl Outbox {
    pub fn new(bus: MessageBus, topics: Topics, journal: Arc<dyn EventSink>) -> Self {
        Self {
            bus,
            topics,
            journal,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub async fn response(&self, reply: &ResponseEnvelope) {
        self.publish(&self.topics.response, reply, false).await;
        self.journal(EntryKind::Command, reply);
    }

    pub async fn status(&self, report: &StatusReport) {
        self.publish(&self.topics.status, report, true).await;
    }

    pub async fn progress(&self, event: &ProgressEvent) {
        self.publish(&self.topics.progress, event, false).await;
        let kind = match event.sequence {
            SequenceKind::VoltageSweep => EntryKind::SweepStep,
            _ => EntryKind::Trigger,
        };
        self.journal(kind, event);
    }

    pub async fn temperature(&self, sample: &TemperatureSample) {
        self.publish(&self.topics.temperature, sample, false).await;
        self.journal(EntryKind::Temperature, sample);
    }

    async fn publish<T: Serialize>(&self, topic: &str, body: &T, retain: bool) {
        if let Err(e) = self
            .bus
            .publish_json(topic, body, QoS::AtLeastOnce, retain)
            .await
        {
            warn!(topic, error = %e, "publish failed");
        }
    }

    fn journal<T: Serialize>(&self, kind: EntryKind, body: &T) {
        let recorded = JournalEntry::of(kind, body).and_then(|entry| self.journal.record(entry));
        if let Err(e) = recorded {
            warn!(%kind, error = %e, "journal write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchrig_journal::SqliteJournal;
    use benchrig_middleware::{BusMessage, LoopbackBroker, LoopbackTransport};
    use benchrig_types::{ChannelState, CommandKind, RigStatus, SweepRecorder};
    use chrono::Utc;
    use serde_json::{Map, Value};
    use tokio::sync::broadcast;

    async fn outbox() -> (Outbox, Arc<LoopbackBroker>, Arc<SqliteJournal>) {
        let broker = LoopbackBroker::new();
        let bus = MessageBus::new(
            Arc::new(LoopbackTransport::new(Arc::clone(&broker))),
            "rig-test",
            "/status",
        );
        bus.connect().await.unwrap();
        let journal = Arc::new(SqliteJournal::open_in_memory().unwrap());
        let outbox = Outbox::new(bus, Topics::default(), journal.clone());
        (outbox, broker, journal)
    }

    async fn next_on(rx: &mut broadcast::Receiver<BusMessage>, topic: &str) -> BusMessage {
        loop {
            let msg = rx.recv().await.unwrap();
            if msg.topic == topic {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn response_is_published_and_journalled() {
        let (outbox, broker, journal) = outbox().await;
        let mut rx = broker.subscribe_all();
        let reply = ResponseEnvelope::success(CommandKind::AllOff, Map::new());

        outbox.response(&reply).await;

        let msg = next_on(&mut rx, "/control_response").await;
        let body: Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(body["type"], "all_off_status");
        assert!(!msg.retain);
        assert_eq!(journal.count(Some(EntryKind::Command)).unwrap(), 1);
    }

    #[tokio::test]
    async fn status_is_retained() {
        let (outbox, broker, _journal) = outbox().await;
        outbox
            .status(&StatusReport {
                channel: ChannelState::default(),
                status: RigStatus::Running,
                sequence: Some(SequenceKind::BurstSeries),
                timestamp: Utc::now(),
            })
            .await;

        let retained = broker.retained_on("/status").unwrap();
        let body: Value = serde_json::from_slice(&retained.payload).unwrap();
        assert_eq!(body["status"], "running");
        assert_eq!(body["sequence"], "burst_series");
        assert_eq!(body["channel"], Value::Null);
    }

    #[tokio::test]
    async fn progress_journal_kind_follows_sequence() {
        let (outbox, _broker, journal) = outbox().await;
        let mut sweep = SweepRecorder::new(SequenceKind::VoltageSweep);
        let mut burst = SweepRecorder::new(SequenceKind::BurstSeries);

        outbox
            .progress(&ProgressEvent {
                sequence: SequenceKind::VoltageSweep,
                step: sweep.record(12, 0.25, 0.234).clone(),
            })
            .await;
        outbox
            .progress(&ProgressEvent {
                sequence: SequenceKind::BurstSeries,
                step: burst.record(5, 5.0, 5.0).clone(),
            })
            .await;

        assert_eq!(journal.count(Some(EntryKind::SweepStep)).unwrap(), 1);
        assert_eq!(journal.count(Some(EntryKind::Trigger)).unwrap(), 1);
    }

    #[tokio::test]
    async fn publish_failure_still_journals() {
        let (outbox, broker, journal) = outbox().await;
        broker.drop_connections();

        outbox
            .temperature(&TemperatureSample {
                timestamp: Utc::now(),
                temperature_k: 77.0,
            })
            .await;

        assert_eq!(journal.count(Some(EntryKind::Temperature)).unwrap(), 1);
    }
}
