//! Periodic temperature sampling.
//!
//! [`StatusPublisher`] reads the probe on a fixed tick and publishes each
//! reading. It takes the hardware lock only for the read itself, so a
//! running sequence delays a sample by at most one hardware call. A failed
//! read skips that tick.

use std::time::Duration;

use benchrig_hal::HardwareFacade;
use benchrig_types::TemperatureSample;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::outbox::Outbox;

/// Shortest accepted sampling period.
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

pub struct StatusPublisher {
    hw: HardwareFacade,
    outbox: Outbox,
    interval: Duration,
}

impl StatusPublisher {
    pub fn new(hw: HardwareFacade, outbox: Outbox, interval: Duration) -> Self {
        Self {
            hw,
            outbox,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.sample().await;
        }
    }

    /// Take and publish one reading.
    pub async fn sample(&self) -> Option<TemperatureSample> {
        match self.hw.read_temperature().await {
            Ok(temperature_k) => {
                let sample = TemperatureSample {
                    timestamp: Utc::now(),
                    temperature_k,
                };
                self.outbox.temperature(&sample).await;
                debug!(temperature_k, "temperature published");
                Some(sample)
            }
            Err(e) => {
                warn!(error = %e, "temperature read failed; skipping sample");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use benchrig_hal::sim::{SimHandles, SimRig};
    use benchrig_journal::{EntryKind, SqliteJournal};
    use benchrig_middleware::{BusMessage, LoopbackBroker, LoopbackTransport, MessageBus};
    use benchrig_types::Topics;
    use serde_json::Value;
    use tokio::sync::broadcast;

    async fn publisher(
        interval: Duration,
    ) -> (StatusPublisher, SimHandles, Arc<LoopbackBroker>, Arc<SqliteJournal>) {
        let (hw, sim) = SimRig::new().with_temperature(300.0).build();
        let broker = LoopbackBroker::new();
        let bus = MessageBus::new(
            Arc::new(LoopbackTransport::new(Arc::clone(&broker))),
            "rig-test",
            "/status",
        );
        bus.connect().await.unwrap();
        let journal = Arc::new(SqliteJournal::open_in_memory().unwrap());
        let outbox = Outbox::new(bus, Topics::default(), journal.clone());
        (StatusPublisher::new(hw, outbox, interval), sim, broker, journal)
    }

    fn temperatures(rx: &mut broadcast::Receiver<BusMessage>) -> Vec<f64> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if msg.topic == "/temperature" {
                let body: Value = serde_json::from_slice(&msg.payload).unwrap();
                out.push(body["temperature_k"].as_f64().unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn sample_publishes_and_journals_reading() {
        let (publisher, _sim, broker, journal) = publisher(Duration::from_secs(5)).await;
        let mut rx = broker.subscribe_all();

        let sample = publisher.sample().await.unwrap();

        assert_eq!(sample.temperature_k, 300.0);
        assert_eq!(temperatures(&mut rx), vec![300.0]);
        assert_eq!(journal.count(Some(EntryKind::Temperature)).unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_read_skips_the_tick() {
        let (publisher, sim, broker, journal) = publisher(Duration::from_secs(5)).await;
        let mut rx = broker.subscribe_all();
        sim.probe_fault.set();

        assert!(publisher.sample().await.is_none());
        assert!(temperatures(&mut rx).is_empty());
        assert_eq!(journal.count(None).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_at_the_configured_interval() {
        let (publisher, sim, broker, _journal) = publisher(Duration::from_secs(5)).await;
        let mut rx = broker.subscribe_all();
        let task = publisher.spawn();

        // First tick fires immediately, then one every five seconds.
        tokio::time::sleep(Duration::from_millis(10)).await;
        sim.set_temperature(310.0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        task.abort();

        assert_eq!(temperatures(&mut rx), vec![300.0, 310.0]);
    }
}
