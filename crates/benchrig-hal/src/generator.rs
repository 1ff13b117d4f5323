//! Pulse/waveform generator driver traits and the SCPI text driver.
//!
//! [`ScpiGenerator`] writes the instrument's line-oriented commands over any
//! [`Write`] link (a serial port in production, a `Vec<u8>` in tests). It
//! never reads replies; acknowledgement is best-effort, as with the bench
//! instrument's RS-232 interface.

use std::fmt;
use std::io::Write;

use benchrig_types::RigError;
use tracing::{info, trace, warn};

/// Where a burst takes its trigger from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Immediate,
    External,
    /// Software trigger (`*TRG`).
    Bus,
}

impl TriggerSource {
    pub fn as_scpi(&self) -> &'static str {
        match self {
            TriggerSource::Immediate => "IMM",
            TriggerSource::External => "EXT",
            TriggerSource::Bus => "BUS",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_scpi())
    }
}

/// A programmable pulse generator.
///
/// Every method maps onto one short instrument transaction and fails with
/// [`RigError::Device`] when the link rejects the write. Nothing is retried.
pub trait PulseGenerator: Send {
    fn id(&self) -> &str;

    /// Return the instrument to its power-on state and clear the error queue.
    fn reset(&mut self) -> Result<(), RigError>;

    /// Select the pulse function with the given period, width and edge time.
    fn apply_pulse(&mut self, frequency_hz: f64, width_s: f64, edge_s: f64)
    -> Result<(), RigError>;

    /// Select a square wave at `frequency_hz`.
    fn configure_square(&mut self, frequency_hz: f64) -> Result<(), RigError>;

    /// Arm triggered-burst mode with `cycles` per trigger.
    fn set_burst(
        &mut self,
        cycles: u32,
        source: TriggerSource,
        enabled: bool,
    ) -> Result<(), RigError>;

    /// Fire one software trigger.
    fn trigger(&mut self) -> Result<(), RigError>;

    fn set_output(&mut self, enabled: bool) -> Result<(), RigError>;
}

/// Opens generator links by port name.
pub trait GeneratorConnector: Send {
    /// Port names to try, in order.
    fn candidates(&self) -> Vec<String>;

    /// Open `port` and wrap it in a driver.
    fn open(&mut self, port: &str) -> Result<Box<dyn PulseGenerator>, RigError>;
}

/// Try every candidate port in order and return the first that opens.
///
/// # Errors
///
/// [`RigError::Device`] carrying the last failure, or naming the empty
/// candidate list.
pub fn connect_first(
    connector: &mut dyn GeneratorConnector,
) -> Result<Box<dyn PulseGenerator>, RigError> {
    let mut last_err = RigError::device("generator", "no candidate ports found");
    for port in connector.candidates() {
        match connector.open(&port) {
            Ok(generator) => {
                info!(port = %port, "generator connected");
                return Ok(generator);
            }
            Err(e) => {
                warn!(port = %port, error = %e, "generator port failed to open");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

// ─────────────────────────────────────────────────────────────────────────────
// SCPI text driver
// ─────────────────────────────────────────────────────────────────────────────

/// SCPI command writer over a byte link. Each command is one `\n`-terminated
/// line.
pub struct ScpiGenerator<L> {
    id: String,
    link: L,
}

impl<L: Write + Send> ScpiGenerator<L> {
    pub fn new(id: impl Into<String>, link: L) -> Self {
        Self {
            id: id.into(),
            link,
        }
    }

    pub fn into_inner(self) -> L {
        self.link
    }

    fn send(&mut self, line: &str) -> Result<(), RigError> {
        trace!(generator = %self.id, scpi = line, "tx");
        let id = &self.id;
        self.link
            .write_all(line.as_bytes())
            .and_then(|()| self.link.write_all(b"\n"))
            .and_then(|()| self.link.flush())
            .map_err(|e| RigError::device(id.as_str(), e))
    }
}

impl<L: Write + Send> PulseGenerator for ScpiGenerator<L> {
    fn id(&self) -> &str {
        &self.id
    }

    fn reset(&mut self) -> Result<(), RigError> {
        self.send("*RST")?;
        self.send("*CLS")
    }

    fn apply_pulse(
        &mut self,
        frequency_hz: f64,
        width_s: f64,
        edge_s: f64,
    ) -> Result<(), RigError> {
        let period = 1.0 / frequency_hz;
        self.send("FUNCTION PULSE")?;
        self.send(&format!("PULSE:PERIOD {period:E}"))?;
        self.send(&format!("PULSE:WIDTH {width_s:E}"))?;
        self.send(&format!("PULSE:TRANSITION {edge_s:E}"))
    }

    fn configure_square(&mut self, frequency_hz: f64) -> Result<(), RigError> {
        self.send("FUNCTION SQUARE")?;
        self.send(&format!("FREQUENCY {frequency_hz:E}"))
    }

    fn set_burst(
        &mut self,
        cycles: u32,
        source: TriggerSource,
        enabled: bool,
    ) -> Result<(), RigError> {
        self.send("BURST:MODE TRIG")?;
        self.send(&format!("BURST:NCYCLES {cycles}"))?;
        self.send("BURST:PHASE 0")?;
        self.send(&format!("TRIGGER:SOURCE {source}"))?;
        self.send(if enabled { "BURST:STATE ON" } else { "BURST:STATE OFF" })
    }

    fn trigger(&mut self) -> Result<(), RigError> {
        self.send("*TRG")
    }

    fn set_output(&mut self, enabled: bool) -> Result<(), RigError> {
        self.send(if enabled { "OUTPUT ON" } else { "OUTPUT OFF" })
    }
}
