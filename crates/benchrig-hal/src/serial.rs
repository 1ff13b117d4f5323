//! Serial-port generator links.
//!
//! [`SerialConnector`] offers the configured port first, then any extra
//! configured ports, then whatever USB serial adapters
//! `serialport::available_ports` reports (`ttyUSB*`, `ttyACM*`).

use std::time::Duration;

use benchrig_types::RigError;
use serialport::SerialPortInfo;
use tracing::{debug, warn};

use crate::generator::{GeneratorConnector, PulseGenerator, ScpiGenerator};

const USB_SERIAL_MARKERS: [&str; 2] = ["ttyUSB", "ttyACM"];

/// Opens SCPI generators over serial ports.
pub struct SerialConnector {
    preferred: Option<String>,
    extra: Vec<String>,
    scan: fn() -> Vec<String>,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialConnector {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            preferred: None,
            extra: Vec::new(),
            scan: discover_ports,
            baud_rate,
            timeout: Duration::from_millis(500),
        }
    }

    /// Port tried before anything else.
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.preferred = Some(port.into());
        self
    }

    /// Additional ports tried after the preferred one.
    pub fn with_scan_ports(mut self, ports: Vec<String>) -> Self {
        self.extra = ports;
        self
    }
}

/// USB serial adapters currently attached, sorted by name. Enumeration
/// failures yield an empty list.
pub fn discover_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => usb_serial_ports(ports),
        Err(e) => {
            warn!(error = %e, "serial port enumeration failed");
            Vec::new()
        }
    }
}

/// Keep the `ttyUSB*` / `ttyACM*` entries of `ports`, sorted by name.
pub fn usb_serial_ports(ports: impl IntoIterator<Item = SerialPortInfo>) -> Vec<String> {
    let mut found: Vec<String> = ports
        .into_iter()
        .map(|p| p.port_name)
        .filter(|name| USB_SERIAL_MARKERS.iter().any(|m| name.contains(m)))
        .collect();
    found.sort();
    found.dedup();
    found
}

impl GeneratorConnector for SerialConnector {
    fn candidates(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let discovered = (self.scan)();
        for port in self
            .preferred
            .iter()
            .chain(self.extra.iter())
            .chain(discovered.iter())
        {
            if !out.contains(port) {
                out.push(port.clone());
            }
        }
        debug!(candidates = ?out, "serial candidates");
        out
    }

    fn open(&mut self, port: &str) -> Result<Box<dyn PulseGenerator>, RigError> {
        let link = serialport::new(port, self.baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(|e| RigError::device(port, e))?;
        Ok(Box::new(ScpiGenerator::new(port, link)))
    }
}
