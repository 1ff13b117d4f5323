//! In-process simulated drivers for running the rig without a bench.
//!
//! Every simulated driver records each call, in order, into a shared
//! [`CallLog`] so tests can assert exact call sequences and counts. Each
//! driver also has a [`Fault`] switch that makes subsequent calls fail with
//! [`RigError::Device`].
//!
//! | Driver             | Records                                   |
//! |--------------------|-------------------------------------------|
//! | [`SimRelay`]       | [`LineWrite`] per `set_state`             |
//! | [`SimGenerator`]   | [`GeneratorCall`] with a tokio timestamp  |
//! | [`SimPot`]         | every [`WiperCode`] applied               |
//! | [`SimProbe`]       | nothing; returns a settable temperature   |
//!
//! # Example
//!
//! ```rust
//! use benchrig_hal::sim::SimRig;
//!
//! let (hw, sim) = SimRig::new().with_temperature(300.0).build();
//! # let _ = (hw, sim);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use benchrig_types::{RigError, WiperCode};
use tokio::time::Instant;

use crate::channel_switch::{ChannelSwitch, LINE_COUNT};
use crate::facade::{HardwareFacade, RigDevices};
use crate::generator::{GeneratorConnector, PulseGenerator, TriggerSource};
use crate::potentiometer::WiperPot;
use crate::probe::TemperatureProbe;
use crate::relay::Relay;

// ─────────────────────────────────────────────────────────────────────────────
// Shared recorders
// ─────────────────────────────────────────────────────────────────────────────

/// Append-only, cloneable call recorder.
pub struct CallLog<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for CallLog<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for CallLog<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<T: Clone> CallLog<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<T>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, entry: T) {
        self.entries().push(entry);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.entries().clone()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Failure-injection switch shared between a driver and its test handle.
#[derive(Clone, Default)]
pub struct Fault(Arc<AtomicBool>);

impl Fault {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self, component: &str) -> Result<(), RigError> {
        if self.is_set() {
            Err(RigError::device(component, "simulated fault"))
        } else {
            Ok(())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Relays
// ─────────────────────────────────────────────────────────────────────────────

/// One relay-line write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineWrite {
    pub line: usize,
    pub on: bool,
}

/// A simulated relay line.
pub struct SimRelay {
    id: String,
    line: usize,
    state: bool,
    writes: CallLog<LineWrite>,
    energise_fault: Fault,
}

impl Relay for SimRelay {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_state(&mut self, active: bool) -> Result<(), RigError> {
        if active {
            self.energise_fault.check(&self.id)?;
        }
        self.state = active;
        self.writes.push(LineWrite {
            line: self.line,
            on: active,
        });
        Ok(())
    }

    fn state(&self) -> bool {
        self.state
    }
}

/// Four simulated lines sharing one write log.
#[derive(Clone, Default)]
pub struct SimRelayBank {
    writes: CallLog<LineWrite>,
    faults: [Fault; LINE_COUNT],
}

impl SimRelayBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh drivers bound to this bank, in line order.
    pub fn lines(&self) -> [Box<dyn Relay>; LINE_COUNT] {
        std::array::from_fn(|line| {
            Box::new(SimRelay {
                id: format!("line{line}"),
                line,
                state: false,
                writes: self.writes.clone(),
                energise_fault: self.faults[line].clone(),
            }) as Box<dyn Relay>
        })
    }

    pub fn writes(&self) -> &CallLog<LineWrite> {
        &self.writes
    }

    /// Make every future attempt to energise `line` fail.
    pub fn fail_on_energise(&self, line: usize) {
        if let Some(fault) = self.faults.get(line) {
            fault.set();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generator
// ─────────────────────────────────────────────────────────────────────────────

/// One generator operation.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorOp {
    Reset,
    ApplyPulse {
        frequency_hz: f64,
        width_s: f64,
        edge_s: f64,
    },
    ConfigureSquare {
        frequency_hz: f64,
    },
    SetBurst {
        cycles: u32,
        source: TriggerSource,
        enabled: bool,
    },
    Trigger,
    SetOutput(bool),
}

/// A generator operation with the (tokio) time it was issued.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorCall {
    pub at: Instant,
    pub op: GeneratorOp,
}

/// A simulated pulse generator.
pub struct SimGenerator {
    id: String,
    calls: CallLog<GeneratorCall>,
    fault: Fault,
}

impl SimGenerator {
    fn record(&self, op: GeneratorOp) -> Result<(), RigError> {
        self.fault.check(&self.id)?;
        self.calls.push(GeneratorCall {
            at: Instant::now(),
            op,
        });
        Ok(())
    }
}

impl PulseGenerator for SimGenerator {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&mut self) -> Result<(), RigError> {
        self.record(GeneratorOp::Reset)
    }

    fn apply_pulse(
        &mut self,
        frequency_hz: f64,
        width_s: f64,
        edge_s: f64,
    ) -> Result<(), RigError> {
        self.record(GeneratorOp::ApplyPulse {
            frequency_hz,
            width_s,
            edge_s,
        })
    }

    fn configure_square(&mut self, frequency_hz: f64) -> Result<(), RigError> {
        self.record(GeneratorOp::ConfigureSquare { frequency_hz })
    }

    fn set_burst(
        &mut self,
        cycles: u32,
        source: TriggerSource,
        enabled: bool,
    ) -> Result<(), RigError> {
        self.record(GeneratorOp::SetBurst {
            cycles,
            source,
            enabled,
        })
    }

    fn trigger(&mut self) -> Result<(), RigError> {
        self.record(GeneratorOp::Trigger)
    }

    fn set_output(&mut self, enabled: bool) -> Result<(), RigError> {
        self.record(GeneratorOp::SetOutput(enabled))
    }
}

/// Hands out [`SimGenerator`]s that all record into the same log.
pub struct SimConnector {
    ports: Vec<String>,
    calls: CallLog<GeneratorCall>,
    generator_fault: Fault,
    open_fault: Fault,
    opened: CallLog<String>,
}

impl GeneratorConnector for SimConnector {
    fn candidates(&self) -> Vec<String> {
        self.ports.clone()
    }

    fn open(&mut self, port: &str) -> Result<Box<dyn PulseGenerator>, RigError> {
        self.open_fault.check(port)?;
        self.opened.push(port.to_string());
        Ok(Box::new(SimGenerator {
            id: port.to_string(),
            calls: self.calls.clone(),
            fault: self.generator_fault.clone(),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Potentiometer and probe
// ─────────────────────────────────────────────────────────────────────────────

/// A simulated digital potentiometer.
pub struct SimPot {
    id: String,
    codes: CallLog<WiperCode>,
    fault: Fault,
}

impl WiperPot for SimPot {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_code(&mut self, code: WiperCode) -> Result<(), RigError> {
        self.fault.check(&self.id)?;
        self.codes.push(code);
        Ok(())
    }
}

/// A simulated probe returning whatever temperature its handle last set.
pub struct SimProbe {
    id: String,
    kelvin: Arc<Mutex<f64>>,
    fault: Fault,
}

impl TemperatureProbe for SimProbe {
    fn id(&self) -> &str {
        &self.id
    }

    fn read_kelvin(&mut self) -> Result<f64, RigError> {
        self.fault.check(&self.id)?;
        Ok(*self.kelvin.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SimRig builder
// ─────────────────────────────────────────────────────────────────────────────

/// Test-side handles onto a simulated rig's recorders and fault switches.
#[derive(Clone)]
pub struct SimHandles {
    pub relays: SimRelayBank,
    pub generator_calls: CallLog<GeneratorCall>,
    pub generator_fault: Fault,
    pub connector_fault: Fault,
    pub wiper: CallLog<WiperCode>,
    pub pot_fault: Fault,
    pub probe_fault: Fault,
    opened: CallLog<String>,
    kelvin: Arc<Mutex<f64>>,
}

impl SimHandles {
    pub fn generator_ops(&self) -> Vec<GeneratorOp> {
        self.generator_calls
            .snapshot()
            .into_iter()
            .map(|c| c.op)
            .collect()
    }

    /// The armed burst count at each trigger, in trigger order.
    pub fn triggered_bursts(&self) -> Vec<u32> {
        let mut armed = 0;
        let mut out = Vec::new();
        for op in self.generator_ops() {
            match op {
                GeneratorOp::SetBurst { cycles, .. } => armed = cycles,
                GeneratorOp::Trigger => out.push(armed),
                _ => {}
            }
        }
        out
    }

    /// Issue times of every trigger.
    pub fn trigger_times(&self) -> Vec<Instant> {
        self.generator_calls
            .snapshot()
            .into_iter()
            .filter(|c| c.op == GeneratorOp::Trigger)
            .map(|c| c.at)
            .collect()
    }

    pub fn wiper_codes(&self) -> Vec<WiperCode> {
        self.wiper.snapshot()
    }

    pub fn relay_writes(&self) -> usize {
        self.relays.writes().len()
    }

    pub fn opened_ports(&self) -> Vec<String> {
        self.opened.snapshot()
    }

    pub fn set_temperature(&self, kelvin: f64) {
        *self.kelvin.lock().unwrap_or_else(PoisonError::into_inner) = kelvin;
    }
}

/// Builder for a [`HardwareFacade`] backed entirely by simulated drivers.
pub struct SimRig {
    ports: Vec<String>,
    kelvin: f64,
    connected: bool,
}

impl Default for SimRig {
    fn default() -> Self {
        Self {
            ports: vec!["sim0".to_string()],
            kelvin: 293.15,
            connected: true,
        }
    }
}

impl SimRig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Port names the simulated connector offers, in order.
    pub fn with_ports(mut self, ports: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ports = ports.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_temperature(mut self, kelvin: f64) -> Self {
        self.kelvin = kelvin;
        self
    }

    /// Start without an open generator link.
    pub fn disconnected(mut self) -> Self {
        self.connected = false;
        self
    }

    pub fn build(self) -> (HardwareFacade, SimHandles) {
        let generator_calls = CallLog::new();
        let generator_fault = Fault::default();
        let connector_fault = Fault::default();
        let opened = CallLog::new();

        let mut connector = SimConnector {
            ports: self.ports.clone(),
            calls: generator_calls.clone(),
            generator_fault: generator_fault.clone(),
            open_fault: connector_fault.clone(),
            opened: opened.clone(),
        };
        let generator = match (self.connected, connector.ports.first().cloned()) {
            (true, Some(port)) => connector.open(&port).ok(),
            _ => None,
        };
        opened.clear();

        self.assemble(
            Box::new(connector),
            generator,
            SimGeneratorHandles {
                calls: generator_calls,
                fault: generator_fault,
                connector_fault,
                opened,
            },
        )
    }

    /// Simulated relays, potentiometer and probe around a real generator
    /// connector. The generator starts disconnected; the generator fields of
    /// the returned handles stay empty.
    pub fn build_with_connector(
        self,
        connector: Box<dyn GeneratorConnector>,
    ) -> (HardwareFacade, SimHandles) {
        self.assemble(connector, None, SimGeneratorHandles::default())
    }

    fn assemble(
        self,
        connector: Box<dyn GeneratorConnector>,
        generator: Option<Box<dyn PulseGenerator>>,
        gen_handles: SimGeneratorHandles,
    ) -> (HardwareFacade, SimHandles) {
        let relays = SimRelayBank::new();
        let wiper = CallLog::new();
        let pot_fault = Fault::default();
        let probe_fault = Fault::default();
        let kelvin = Arc::new(Mutex::new(self.kelvin));

        let devices = RigDevices {
            switch: ChannelSwitch::new(relays.lines()),
            pot: Box::new(SimPot {
                id: "sim_pot".into(),
                codes: wiper.clone(),
                fault: pot_fault.clone(),
            }),
            probe: Box::new(SimProbe {
                id: "sim_probe".into(),
                kelvin: Arc::clone(&kelvin),
                fault: probe_fault.clone(),
            }),
            connector,
            generator,
        };

        let handles = SimHandles {
            relays,
            generator_calls: gen_handles.calls,
            generator_fault: gen_handles.fault,
            connector_fault: gen_handles.connector_fault,
            wiper,
            pot_fault,
            probe_fault,
            opened: gen_handles.opened,
            kelvin,
        };
        (HardwareFacade::new(devices), handles)
    }
}

#[derive(Default)]
struct SimGeneratorHandles {
    calls: CallLog<GeneratorCall>,
    fault: Fault,
    connector_fault: Fault,
    opened: CallLog<String>,
}
