//! `benchrig-types` – shared data model for the bench-rig controller.
//!
//! Everything that crosses a crate boundary lives here: the inbound
//! [`Command`] variants, the outbound [`ResponseEnvelope`], the physical
//! value newtypes ([`Channel`], [`WiperCode`]) that enforce range invariants
//! at construction, and the [`RigError`] taxonomy.

pub mod command;
pub mod error;
pub mod response;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use command::{Command, CommandKind, VoltageSweepRequest};
pub use error::{ErrorKind, RigError};
pub use response::{ErrorDetail, ResponseEnvelope};

/// Upper bound on a pulse edge (rise/fall) time, in seconds.
pub const MAX_EDGE_TIME_S: f64 = 1e-6;

// ─────────────────────────────────────────────────────────────────────────────
// Channel
// ─────────────────────────────────────────────────────────────────────────────

/// A logical output channel, always within `1..=8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Channel(u8);

impl Channel {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 8;

    /// Validate a raw channel number.
    ///
    /// # Errors
    ///
    /// [`RigError::InvalidChannel`] for anything outside `1..=8`. Values are
    /// never clamped.
    pub fn new(number: i64) -> Result<Self, RigError> {
        if (Self::MIN as i64..=Self::MAX as i64).contains(&number) {
            Ok(Self(number as u8))
        } else {
            Err(RigError::InvalidChannel(number))
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    /// Every channel in ascending order.
    pub fn all() -> impl Iterator<Item = Channel> {
        (Self::MIN..=Self::MAX).map(Channel)
    }
}

impl TryFrom<i64> for Channel {
    type Error = RigError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Channel::new(value)
    }
}

impl From<Channel> for u8 {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The currently selected channel, or none before the first selection.
///
/// Serialises as the channel number or `null`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelState(Option<Channel>);

impl ChannelState {
    pub fn active(&self) -> Option<Channel> {
        self.0
    }

    pub fn is(&self, channel: Channel) -> bool {
        self.0 == Some(channel)
    }

    /// Record a successful channel selection.
    pub fn select(&mut self, channel: Channel) {
        self.0 = Some(channel);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Potentiometer wiper code
// ─────────────────────────────────────────────────────────────────────────────

/// A digital potentiometer tap position in `0..=255`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct WiperCode(u8);

impl WiperCode {
    pub const MIN: WiperCode = WiperCode(0);
    pub const MAX: WiperCode = WiperCode(255);

    /// Validate a code supplied directly by a caller.
    ///
    /// # Errors
    ///
    /// [`RigError::Range`] when `code` is outside `0..=255`.
    pub fn new(code: i64) -> Result<Self, RigError> {
        u8::try_from(code)
            .map(WiperCode)
            .map_err(|_| RigError::Range(format!("wiper code {code} outside 0-255")))
    }

    /// Round a derived (fractional) code and clamp it into `0..=255`.
    pub fn clamped(raw: f64) -> Self {
        WiperCode(raw.round().clamp(0.0, 255.0) as u8)
    }

    /// `round(percent / 100 × 255)`.
    ///
    /// # Errors
    ///
    /// [`RigError::Range`] when `percent` is outside `0..=100`.
    pub fn from_percent(percent: f64) -> Result<Self, RigError> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(RigError::Range(format!(
                "percent {percent} outside 0-100"
            )));
        }
        Ok(Self::clamped(percent / 100.0 * 255.0))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for WiperCode {
    type Error = RigError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        WiperCode::new(value)
    }
}

impl From<WiperCode> for u8 {
    fn from(code: WiperCode) -> Self {
        code.0
    }
}

impl fmt::Display for WiperCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signal configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Current pulse parameters, replaced wholesale by a `signal_config` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    pub frequency_hz: f64,
    pub burst_count: u32,
    /// Percent of the period spent high, strictly within `(0, 100)`.
    pub duty_cycle: f64,
    pub amplitude_v: f64,
    /// Pause after each triggered block, in seconds.
    pub inter_block_delay_s: f64,
}

impl SignalConfig {
    /// Check every field against its physical limits.
    ///
    /// # Errors
    ///
    /// [`RigError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), RigError> {
        if !(self.frequency_hz.is_finite() && self.frequency_hz > 0.0) {
            return Err(RigError::Validation(format!(
                "frequency must be a positive number of Hz, got {}",
                self.frequency_hz
            )));
        }
        if self.burst_count == 0 {
            return Err(RigError::Validation("bursts must be at least 1".into()));
        }
        if !(self.duty_cycle > 0.0 && self.duty_cycle < 100.0) {
            return Err(RigError::Validation(format!(
                "duty_cycle must be within (0, 100), got {}",
                self.duty_cycle
            )));
        }
        if !(self.amplitude_v.is_finite() && self.amplitude_v > 0.0) {
            return Err(RigError::Validation(format!(
                "amplitude must be a positive number of volts, got {}",
                self.amplitude_v
            )));
        }
        if Duration::try_from_secs_f64(self.inter_block_delay_s).is_err() {
            return Err(RigError::Validation(format!(
                "inter_burst_wait must be a non-negative number of seconds, got {}",
                self.inter_block_delay_s
            )));
        }
        Ok(())
    }

    pub fn period_s(&self) -> f64 {
        1.0 / self.frequency_hz
    }

    /// `period × duty_cycle / 100`.
    pub fn pulse_width_s(&self) -> f64 {
        self.period_s() * self.duty_cycle / 100.0
    }

    /// Edge time kept inside the instrument's limits:
    /// `min(MAX_EDGE_TIME_S, 10% of width)`.
    pub fn edge_time_s(&self) -> f64 {
        edge_time_for_width(self.pulse_width_s())
    }

    pub fn inter_block_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.inter_block_delay_s).unwrap_or_default()
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 1000.0,
            burst_count: 10,
            duty_cycle: 50.0,
            amplitude_v: 3.0,
            inter_block_delay_s: 0.5,
        }
    }
}

/// `min(MAX_EDGE_TIME_S, 0.1 × width)`.
pub fn edge_time_for_width(width_s: f64) -> f64 {
    MAX_EDGE_TIME_S.min(0.1 * width_s)
}

// ─────────────────────────────────────────────────────────────────────────────
// Sweep records
// ─────────────────────────────────────────────────────────────────────────────

/// The time-extended procedures the sequence engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceKind {
    BurstSeries,
    PulseTrainSweep,
    VoltageSweep,
    ConfiguredBurst,
}

impl SequenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceKind::BurstSeries => "burst_series",
            SequenceKind::PulseTrainSweep => "pulse_train_sweep",
            SequenceKind::VoltageSweep => "voltage_sweep",
            SequenceKind::ConfiguredBurst => "configured_burst",
        }
    }
}

impl fmt::Display for SequenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a voltage or burst sweep.
///
/// For voltage sweeps `applied` is the wiper code, `target` the requested
/// voltage and `expected` the voltage the code theoretically produces. For
/// burst and pulse-train sweeps all three carry the cycle count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepStep {
    pub step: u32,
    pub applied: u32,
    pub target: f64,
    pub expected: f64,
    pub timestamp: DateTime<Utc>,
}

/// Append-only builder for the steps of one sweep invocation.
///
/// Step indices are assigned here, so they are strictly ascending by
/// construction.
#[derive(Debug)]
pub struct SweepRecorder {
    sequence: SequenceKind,
    steps: Vec<SweepStep>,
}

impl SweepRecorder {
    pub fn new(sequence: SequenceKind) -> Self {
        Self {
            sequence,
            steps: Vec::new(),
        }
    }

    /// Append the next step and return it.
    pub fn record(&mut self, applied: u32, target: f64, expected: f64) -> &SweepStep {
        let step = SweepStep {
            step: self.steps.len() as u32,
            applied,
            target,
            expected,
            timestamp: Utc::now(),
        };
        self.steps.push(step);
        &self.steps[self.steps.len() - 1]
    }

    pub fn sequence(&self) -> SequenceKind {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Freeze the record list. No further steps can be appended.
    pub fn finish(self) -> SweepResult {
        SweepResult {
            sequence: self.sequence,
            steps: self.steps.into_boxed_slice(),
        }
    }
}

/// The complete, immutable step list of a finished sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepResult {
    sequence: SequenceKind,
    steps: Box<[SweepStep]>,
}

impl SweepResult {
    pub fn sequence(&self) -> SequenceKind {
        self.sequence
    }

    pub fn steps(&self) -> &[SweepStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A step emitted by a running sequence, published while it is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub sequence: SequenceKind,
    pub step: SweepStep,
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound status payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Topic names used on the message bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topics {
    pub command: String,
    pub response: String,
    pub status: String,
    pub temperature: String,
    pub progress: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            command: "/ui_command".to_string(),
            response: "/control_response".to_string(),
            status: "/status".to_string(),
            temperature: "/temperature".to_string(),
            progress: "/sequence_progress".to_string(),
        }
    }
}

/// Whether the rig is idle or executing a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RigStatus {
    Idle,
    Running,
}

/// Operation status published on the status topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub channel: ChannelState,
    pub status: RigStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceKind>,
    pub timestamp: DateTime<Utc>,
}

/// Retained presence marker published on connect and graceful disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// One temperature probe reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSample {
    pub timestamp: DateTime<Utc>,
    pub temperature_k: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_accepts_one_through_eight() {
        for n in 1..=8 {
            assert_eq!(Channel::new(n).unwrap().number() as i64, n);
        }
        assert_eq!(Channel::all().count(), 8);
    }

    #[test]
    fn channel_rejects_out_of_range_without_clamping() {
        for n in [0, 9, -1, 255] {
            assert_eq!(Channel::new(n), Err(RigError::InvalidChannel(n)));
        }
    }

    #[test]
    fn channel_deserialization_validates() {
        let ok: Channel = serde_json::from_str("3").unwrap();
        assert_eq!(ok.number(), 3);
        assert!(serde_json::from_str::<Channel>("12").is_err());
    }

    #[test]
    fn channel_state_starts_empty_and_serializes_as_null() {
        let mut state = ChannelState::default();
        assert_eq!(state.active(), None);
        assert_eq!(serde_json::to_string(&state).unwrap(), "null");
        state.select(Channel::new(4).unwrap());
        assert_eq!(serde_json::to_string(&state).unwrap(), "4");
    }

    #[test]
    fn wiper_code_rejects_direct_out_of_range() {
        assert!(WiperCode::new(255).is_ok());
        assert!(matches!(WiperCode::new(256), Err(RigError::Range(_))));
        assert!(matches!(WiperCode::new(-1), Err(RigError::Range(_))));
    }

    #[test]
    fn wiper_code_clamps_derived_values() {
        assert_eq!(WiperCode::clamped(-12.4).value(), 0);
        assert_eq!(WiperCode::clamped(300.0).value(), 255);
        assert_eq!(WiperCode::clamped(127.5).value(), 128);
    }

    #[test]
    fn wiper_code_from_percent_rounds() {
        assert_eq!(WiperCode::from_percent(0.0).unwrap().value(), 0);
        assert_eq!(WiperCode::from_percent(50.0).unwrap().value(), 128);
        assert_eq!(WiperCode::from_percent(100.0).unwrap().value(), 255);
        assert!(matches!(
            WiperCode::from_percent(100.5),
            Err(RigError::Range(_))
        ));
    }

    #[test]
    fn signal_config_derives_width_and_edge() {
        let cfg = SignalConfig {
            frequency_hz: 10_000.0,
            duty_cycle: 20.0,
            ..SignalConfig::default()
        };
        assert!((cfg.pulse_width_s() - 20e-6).abs() < 1e-12);
        // 10% of 20 µs is 2 µs, above the 1 µs bound.
        assert!((cfg.edge_time_s() - 1e-6).abs() < 1e-15);

        let fast = SignalConfig {
            frequency_hz: 1_000_000.0,
            duty_cycle: 50.0,
            ..SignalConfig::default()
        };
        // 10% of 0.5 µs.
        assert!((fast.edge_time_s() - 50e-9).abs() < 1e-15);
    }

    #[test]
    fn signal_config_rejects_duty_cycle_outside_open_interval() {
        for duty in [0.0, 100.0, 150.0, -5.0] {
            let cfg = SignalConfig {
                duty_cycle: duty,
                ..SignalConfig::default()
            };
            assert!(matches!(cfg.validate(), Err(RigError::Validation(_))));
        }
        assert!(SignalConfig::default().validate().is_ok());
    }

    #[test]
    fn sweep_recorder_assigns_ascending_steps_then_freezes() {
        let mut rec = SweepRecorder::new(SequenceKind::BurstSeries);
        for cycles in (1..=3).rev() {
            rec.record(cycles, cycles as f64, cycles as f64);
        }
        let result = rec.finish();
        let indices: Vec<u32> = result.steps().iter().map(|s| s.step).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(result.sequence(), SequenceKind::BurstSeries);
    }

    #[test]
    fn status_report_omits_sequence_when_idle() {
        let report = StatusReport {
            channel: ChannelState::default(),
            status: RigStatus::Idle,
            sequence: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "idle");
        assert!(json["channel"].is_null());
        assert!(json.get("sequence").is_none());
    }
}
