//! Inbound command decoding.
//!
//! The UI sends a JSON object keyed by a `type` tag. [`Command::from_value`]
//! turns it into a closed [`Command`] variant with every field validated and
//! defaulted, so downstream code never sees a half-checked envelope.
//!
//! | `type`                        | fields (default)                                              |
//! |-------------------------------|---------------------------------------------------------------|
//! | `channel_select`              | `channel` (required), `percent` (50)                          |
//! | `potentiometer_set_percent`   | `percent` (50), `channel` (optional)                          |
//! | `burst`                       | `cycles` (required)                                           |
//! | `signal_config`               | `frequency`, `bursts`, `duty_cycle`, `amplitude`, `inter_burst_wait` |
//! | `pulse_train_sweep`           | `max_pulses` (20), `min_pulses` (1), `inter_train_wait` (0.1) |
//! | `potentiometer_voltage_sweep` | `start_v` (0), `end_v` (10), `sweep_steps` (256), `sweep_duration` (5) |
//! | others                        | none                                                          |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Channel, RigError, SequenceKind, SignalConfig, WiperCode};

/// Every command tag the router understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ChannelSelect,
    PotentiometerSetPercent,
    Burst,
    SignalConfig,
    ConnectGenerator,
    DisconnectGenerator,
    AllOff,
    TriggerBurst,
    PulseTrainSweep,
    PotentiometerVoltageSweep,
    CancelSequence,
}

impl CommandKind {
    pub const ALL: [CommandKind; 11] = [
        CommandKind::ChannelSelect,
        CommandKind::PotentiometerSetPercent,
        CommandKind::Burst,
        CommandKind::SignalConfig,
        CommandKind::ConnectGenerator,
        CommandKind::DisconnectGenerator,
        CommandKind::AllOff,
        CommandKind::TriggerBurst,
        CommandKind::PulseTrainSweep,
        CommandKind::PotentiometerVoltageSweep,
        CommandKind::CancelSequence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::ChannelSelect => "channel_select",
            CommandKind::PotentiometerSetPercent => "potentiometer_set_percent",
            CommandKind::Burst => "burst",
            CommandKind::SignalConfig => "signal_config",
            CommandKind::ConnectGenerator => "connect_generator",
            CommandKind::DisconnectGenerator => "disconnect_generator",
            CommandKind::AllOff => "all_off",
            CommandKind::TriggerBurst => "trigger_burst",
            CommandKind::PulseTrainSweep => "pulse_train_sweep",
            CommandKind::PotentiometerVoltageSweep => "potentiometer_voltage_sweep",
            CommandKind::CancelSequence => "cancel_sequence",
        }
    }

    /// Look up a wire tag. `None` for anything outside the fixed registry.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == tag)
    }

    /// The `type` field of a success response for this command.
    pub fn response_type(&self) -> String {
        format!("{}_status", self.as_str())
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a potentiometer voltage sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageSweepRequest {
    pub start_v: f64,
    pub end_v: f64,
    /// Number of intervals; the sweep visits `steps + 1` points.
    pub steps: u32,
    /// Dwell time at each point.
    pub step_duration: Duration,
}

/// A fully validated command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ChannelSelect {
        channel: Channel,
        percent: f64,
        code: WiperCode,
    },
    PotentiometerSetPercent {
        percent: f64,
        code: WiperCode,
        channel: Option<Channel>,
    },
    Burst {
        cycles: u32,
    },
    SignalConfig(SignalConfig),
    ConnectGenerator,
    DisconnectGenerator,
    AllOff,
    TriggerBurst,
    PulseTrainSweep {
        max_pulses: u32,
        min_pulses: u32,
        inter_train_wait: Duration,
    },
    PotentiometerVoltageSweep(VoltageSweepRequest),
    CancelSequence,
}

impl Command {
    /// Decode and validate a command envelope.
    ///
    /// # Errors
    ///
    /// - [`RigError::Validation`] when `type` is missing or not a string, or a
    ///   field has the wrong type or an impossible value.
    /// - [`RigError::UnknownCommand`] when `type` is not a registered tag.
    /// - [`RigError::InvalidChannel`] for a channel outside `1..=8`.
    /// - [`RigError::Range`] for a percent outside `0..=100`.
    pub fn from_value(value: &Value) -> Result<Self, RigError> {
        let obj = value
            .as_object()
            .ok_or_else(|| RigError::Validation("command must be a JSON object".into()))?;
        let tag = match obj.get("type") {
            None | Some(Value::Null) => {
                return Err(RigError::Validation("missing required field `type`".into()));
            }
            Some(Value::String(s)) => s.as_str(),
            Some(other) => {
                return Err(RigError::Validation(format!(
                    "field `type` must be a string, got {other}"
                )));
            }
        };
        let kind =
            CommandKind::from_tag(tag).ok_or_else(|| RigError::UnknownCommand(tag.to_string()))?;
        let f = Fields(obj);

        let cmd = match kind {
            CommandKind::ChannelSelect => {
                let channel = Channel::new(f.required_int("channel")?)?;
                let percent = f.number_or("percent", 50.0)?;
                Command::ChannelSelect {
                    channel,
                    percent,
                    code: WiperCode::from_percent(percent)?,
                }
            }
            CommandKind::PotentiometerSetPercent => {
                let percent = f.number_or("percent", 50.0)?;
                let channel = f.int("channel")?.map(Channel::new).transpose()?;
                Command::PotentiometerSetPercent {
                    percent,
                    code: WiperCode::from_percent(percent)?,
                    channel,
                }
            }
            CommandKind::Burst => Command::Burst {
                cycles: positive_count("cycles", f.required_int("cycles")?)?,
            },
            CommandKind::SignalConfig => {
                let defaults = SignalConfig::default();
                let config = SignalConfig {
                    frequency_hz: f.number_or("frequency", defaults.frequency_hz)?,
                    burst_count: positive_count(
                        "bursts",
                        f.int_or("bursts", defaults.burst_count as i64)?,
                    )?,
                    duty_cycle: f.number_or("duty_cycle", defaults.duty_cycle)?,
                    amplitude_v: f.number_or("amplitude", defaults.amplitude_v)?,
                    inter_block_delay_s: f
                        .number_or("inter_burst_wait", defaults.inter_block_delay_s)?,
                };
                config.validate()?;
                Command::SignalConfig(config)
            }
            CommandKind::ConnectGenerator => Command::ConnectGenerator,
            CommandKind::DisconnectGenerator => Command::DisconnectGenerator,
            CommandKind::AllOff => Command::AllOff,
            CommandKind::TriggerBurst => Command::TriggerBurst,
            CommandKind::PulseTrainSweep => {
                let max_pulses = positive_count("max_pulses", f.int_or("max_pulses", 20)?)?;
                let min_pulses = positive_count("min_pulses", f.int_or("min_pulses", 1)?)?;
                if min_pulses > max_pulses {
                    return Err(RigError::Validation(format!(
                        "min_pulses ({min_pulses}) exceeds max_pulses ({max_pulses})"
                    )));
                }
                Command::PulseTrainSweep {
                    max_pulses,
                    min_pulses,
                    inter_train_wait: f.seconds_or("inter_train_wait", 0.1)?,
                }
            }
            CommandKind::PotentiometerVoltageSweep => {
                Command::PotentiometerVoltageSweep(VoltageSweepRequest {
                    start_v: f.number_or("start_v", 0.0)?,
                    end_v: f.number_or("end_v", 10.0)?,
                    steps: positive_count("sweep_steps", f.int_or("sweep_steps", 256)?)?,
                    step_duration: f.seconds_or("sweep_duration", 5.0)?,
                })
            }
            CommandKind::CancelSequence => Command::CancelSequence,
        };
        Ok(cmd)
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::ChannelSelect { .. } => CommandKind::ChannelSelect,
            Command::PotentiometerSetPercent { .. } => CommandKind::PotentiometerSetPercent,
            Command::Burst { .. } => CommandKind::Burst,
            Command::SignalConfig(_) => CommandKind::SignalConfig,
            Command::ConnectGenerator => CommandKind::ConnectGenerator,
            Command::DisconnectGenerator => CommandKind::DisconnectGenerator,
            Command::AllOff => CommandKind::AllOff,
            Command::TriggerBurst => CommandKind::TriggerBurst,
            Command::PulseTrainSweep { .. } => CommandKind::PulseTrainSweep,
            Command::PotentiometerVoltageSweep(_) => CommandKind::PotentiometerVoltageSweep,
            Command::CancelSequence => CommandKind::CancelSequence,
        }
    }

    /// The long-running procedure this command starts, if any.
    pub fn sequence(&self) -> Option<SequenceKind> {
        match self {
            Command::Burst { .. } => Some(SequenceKind::BurstSeries),
            Command::TriggerBurst => Some(SequenceKind::ConfiguredBurst),
            Command::PulseTrainSweep { .. } => Some(SequenceKind::PulseTrainSweep),
            Command::PotentiometerVoltageSweep(_) => Some(SequenceKind::VoltageSweep),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Field access
// ─────────────────────────────────────────────────────────────────────────────

/// Typed accessors over the envelope's fields. `null` counts as absent.
struct Fields<'a>(&'a Map<String, Value>);

impl Fields<'_> {
    fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    fn number(&self, name: &str) -> Result<Option<f64>, RigError> {
        match self.get(name) {
            None => Ok(None),
            Some(v) => v.as_f64().map(Some).ok_or_else(|| {
                RigError::Validation(format!("field `{name}` must be a number, got {v}"))
            }),
        }
    }

    fn number_or(&self, name: &str, default: f64) -> Result<f64, RigError> {
        Ok(self.number(name)?.unwrap_or(default))
    }

    /// Integers may arrive as `3` or `3.0`; `3.5` is rejected.
    fn int(&self, name: &str) -> Result<Option<i64>, RigError> {
        let Some(v) = self.get(name) else {
            return Ok(None);
        };
        if let Some(i) = v.as_i64() {
            return Ok(Some(i));
        }
        match v.as_f64() {
            Some(x) if x.fract() == 0.0 && x.abs() < i64::MAX as f64 => Ok(Some(x as i64)),
            _ => Err(RigError::Validation(format!(
                "field `{name}` must be an integer, got {v}"
            ))),
        }
    }

    fn int_or(&self, name: &str, default: i64) -> Result<i64, RigError> {
        Ok(self.int(name)?.unwrap_or(default))
    }

    fn required_int(&self, name: &str) -> Result<i64, RigError> {
        self.int(name)?
            .ok_or_else(|| RigError::Validation(format!("missing required field `{name}`")))
    }

    fn seconds_or(&self, name: &str, default: f64) -> Result<Duration, RigError> {
        let secs = self.number_or(name, default)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            RigError::Validation(format!(
                "field `{name}` must be a non-negative number of seconds, got {secs}"
            ))
        })
    }
}

fn positive_count(name: &str, value: i64) -> Result<u32, RigError> {
    match u32::try_from(value) {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(RigError::Validation(format!(
            "field `{name}` must be a positive integer, got {value}"
        ))),
    }
}
