//! [`HardwareFacade`] – the one handle the rest of the rig uses to reach the
//! instruments.
//!
//! All drivers sit behind a single `tokio::sync::Mutex`, which grants the
//! lock in FIFO order. Each facade method takes the lock for exactly one
//! driver transaction, so a temperature sample queued between two steps of a
//! sweep runs between those steps and never inside one.
//!
//! The facade does not retry. A driver failure surfaces as
//! [`RigError::Device`] and the caller decides what to do.

use std::sync::Arc;

use benchrig_types::{Channel, RigError, WiperCode};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::channel_switch::{ChannelSwitch, RelayPattern};
use crate::generator::{GeneratorConnector, PulseGenerator, TriggerSource, connect_first};
use crate::potentiometer::WiperPot;
use crate::probe::TemperatureProbe;

/// The driver set owned by a [`HardwareFacade`].
pub struct RigDevices {
    pub switch: ChannelSwitch,
    pub pot: Box<dyn WiperPot>,
    pub probe: Box<dyn TemperatureProbe>,
    pub connector: Box<dyn GeneratorConnector>,
    /// `None` until [`HardwareFacade::connect_generator`] succeeds.
    pub generator: Option<Box<dyn PulseGenerator>>,
}

impl RigDevices {
    fn generator(&mut self) -> Result<&mut Box<dyn PulseGenerator>, RigError> {
        self.generator
            .as_mut()
            .ok_or_else(|| RigError::device("generator", "not connected"))
    }
}

/// Cloneable, serialised access to the rig hardware.
#[derive(Clone)]
pub struct HardwareFacade {
    devices: Arc<Mutex<RigDevices>>,
}

impl HardwareFacade {
    pub fn new(devices: RigDevices) -> Self {
        Self {
            devices: Arc::new(Mutex::new(devices)),
        }
    }

    // ── Generator ───────────────────────────────────────────────────────────

    pub async fn apply_pulse(
        &self,
        frequency_hz: f64,
        width_s: f64,
        edge_s: f64,
    ) -> Result<(), RigError> {
        let mut dev = self.devices.lock().await;
        debug!(frequency_hz, width_s, edge_s, "apply pulse");
        dev.generator()?.apply_pulse(frequency_hz, width_s, edge_s)
    }

    pub async fn configure_square(&self, frequency_hz: f64) -> Result<(), RigError> {
        let mut dev = self.devices.lock().await;
        debug!(frequency_hz, "configure square");
        dev.generator()?.configure_square(frequency_hz)
    }

    pub async fn set_burst(
        &self,
        cycles: u32,
        source: TriggerSource,
        enabled: bool,
    ) -> Result<(), RigError> {
        let mut dev = self.devices.lock().await;
        debug!(cycles, %source, enabled, "set burst");
        dev.generator()?.set_burst(cycles, source, enabled)
    }

    pub async fn trigger(&self) -> Result<(), RigError> {
        let mut dev = self.devices.lock().await;
        dev.generator()?.trigger()
    }

    pub async fn set_output(&self, enabled: bool) -> Result<(), RigError> {
        let mut dev = self.devices.lock().await;
        debug!(enabled, "set output");
        dev.generator()?.set_output(enabled)
    }

    pub async fn reset_generator(&self) -> Result<(), RigError> {
        let mut dev = self.devices.lock().await;
        dev.generator()?.reset()
    }

    /// Open the first generator link that answers. Already connected is a
    /// no-op. Returns the driver id.
    pub async fn connect_generator(&self) -> Result<String, RigError> {
        let mut dev = self.devices.lock().await;
        if let Some(generator) = &dev.generator {
            return Ok(generator.id().to_string());
        }
        let generator = connect_first(dev.connector.as_mut())?;
        let id = generator.id().to_string();
        dev.generator = Some(generator);
        Ok(id)
    }

    /// Drop the generator link. Returns whether one was open.
    pub async fn disconnect_generator(&self) -> bool {
        let mut dev = self.devices.lock().await;
        match dev.generator.take() {
            Some(generator) => {
                info!(generator = generator.id(), "generator disconnected");
                true
            }
            None => false,
        }
    }

    pub async fn generator_connected(&self) -> bool {
        self.devices.lock().await.generator.is_some()
    }

    // ── Potentiometer ───────────────────────────────────────────────────────

    /// Apply a caller-supplied raw code.
    ///
    /// # Errors
    ///
    /// [`RigError::Range`] for codes outside `0..=255`; nothing is written.
    pub async fn set_wiper_code(&self, code: i64) -> Result<(), RigError> {
        let code = WiperCode::new(code)?;
        self.set_wiper(code).await
    }

    pub async fn set_wiper(&self, code: WiperCode) -> Result<(), RigError> {
        let mut dev = self.devices.lock().await;
        debug!(code = code.value(), "set wiper");
        dev.pot.set_code(code)
    }

    // ── Probe ───────────────────────────────────────────────────────────────

    pub async fn read_temperature(&self) -> Result<f64, RigError> {
        let mut dev = self.devices.lock().await;
        dev.probe.read_kelvin()
    }

    // ── Relays ──────────────────────────────────────────────────────────────

    pub async fn activate_channel(&self, channel: Channel) -> Result<RelayPattern, RigError> {
        let mut dev = self.devices.lock().await;
        dev.switch.activate_channel(channel)
    }

    pub async fn all_off(&self) -> Result<(), RigError> {
        let mut dev = self.devices.lock().await;
        dev.switch.all_off()
    }

    pub async fn relays_energised(&self) -> bool {
        self.devices.lock().await.switch.is_energised()
    }

    pub async fn relay_pattern(&self) -> RelayPattern {
        self.devices.lock().await.switch.pattern()
    }
}
