//! Digital potentiometer driver trait and transfer functions.
//!
//! The wiper divides the `vss..vdd` span into 256 taps. The two directions
//! of the transfer function use different denominators and are kept that
//! way to match the hardware's characterised response:
//!
//! - inverse (voltage → code): `round(255 × (v − vss) / (vdd − vss))`, clamped
//! - forward (code → voltage): `code / 256 × (vdd − vss) + vss`

use benchrig_types::{RigError, WiperCode};
use serde::{Deserialize, Serialize};

/// A digital potentiometer with an 8-bit wiper.
pub trait WiperPot: Send {
    fn id(&self) -> &str;

    /// Move the wiper to `code`.
    fn set_code(&mut self, code: WiperCode) -> Result<(), RigError>;
}

/// Supply rails of the potentiometer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PotRails {
    pub vdd: f64,
    pub vss: f64,
}

impl Default for PotRails {
    fn default() -> Self {
        Self { vdd: 5.0, vss: 0.0 }
    }
}

impl PotRails {
    pub fn span(&self) -> f64 {
        self.vdd - self.vss
    }

    /// Whether `volts` lies within the rails (inclusive).
    pub fn contains(&self, volts: f64) -> bool {
        (self.vss..=self.vdd).contains(&volts)
    }

    /// Reject a voltage outside the rails.
    ///
    /// # Errors
    ///
    /// [`RigError::Range`] naming the value and the rails.
    pub fn check(&self, volts: f64) -> Result<(), RigError> {
        if self.contains(volts) {
            Ok(())
        } else {
            Err(RigError::Range(format!(
                "{volts} V outside supply rails {}..{} V",
                self.vss, self.vdd
            )))
        }
    }

    /// Inverse transfer function, rounded and clamped into `0..=255`.
    pub fn code_for_voltage(&self, volts: f64) -> WiperCode {
        WiperCode::clamped(255.0 * (volts - self.vss) / self.span())
    }

    /// Forward transfer function: the voltage `code` theoretically produces.
    pub fn voltage_for_code(&self, code: WiperCode) -> f64 {
        f64::from(code.value()) / 256.0 * self.span() + self.vss
    }
}

/// `round(percent / 100 × 255)`, rejecting percents outside `0..=100`.
pub fn percent_to_code(percent: f64) -> Result<WiperCode, RigError> {
    WiperCode::from_percent(percent)
}
