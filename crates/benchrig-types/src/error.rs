//! Error taxonomy shared by every benchrig crate.
//!
//! Each variant maps onto one [`ErrorKind`], which is the machine-readable
//! tag placed into error response envelopes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Global error type spanning command validation, physical range checks and
/// hardware transport failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RigError {
    #[error("Invalid channel {0}: expected 1-8")]
    InvalidChannel(i64),

    #[error("Out of range: {0}")]
    Range(String),

    #[error("Invalid command: {0}")]
    Validation(String),

    #[error("Device error on {component}: {details}")]
    Device { component: String, details: String },

    #[error("Unknown command type: {0}")]
    UnknownCommand(String),

    #[error("Rig busy: {0}")]
    Busy(String),

    #[error("Sequence {sequence} cancelled after {completed_steps} step(s)")]
    Cancelled {
        sequence: String,
        completed_steps: usize,
    },

    #[error("Message bus error: {0}")]
    Channel(String),
}

impl RigError {
    /// Shorthand for a [`RigError::Device`] raised by `component`.
    pub fn device(component: impl Into<String>, details: impl ToString) -> Self {
        RigError::Device {
            component: component.into(),
            details: details.to_string(),
        }
    }

    /// The machine-readable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RigError::InvalidChannel(_) => ErrorKind::InvalidChannel,
            RigError::Range(_) => ErrorKind::RangeError,
            RigError::Validation(_) => ErrorKind::ValidationError,
            RigError::Device { .. } => ErrorKind::DeviceError,
            RigError::UnknownCommand(_) => ErrorKind::UnknownCommand,
            RigError::Busy(_) => ErrorKind::Busy,
            RigError::Cancelled { .. } => ErrorKind::Cancelled,
            RigError::Channel(_) => ErrorKind::BusError,
        }
    }
}

/// Serialisable error tag carried by error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidChannel,
    RangeError,
    ValidationError,
    DeviceError,
    UnknownCommand,
    Busy,
    Cancelled,
    BusError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InvalidChannel).unwrap();
        assert_eq!(json, "\"invalid_channel\"");
        let json = serde_json::to_string(&ErrorKind::DeviceError).unwrap();
        assert_eq!(json, "\"device_error\"");
    }

    #[test]
    fn every_variant_maps_to_its_kind() {
        assert_eq!(RigError::InvalidChannel(9).kind(), ErrorKind::InvalidChannel);
        assert_eq!(RigError::Range("x".into()).kind(), ErrorKind::RangeError);
        assert_eq!(
            RigError::Validation("x".into()).kind(),
            ErrorKind::ValidationError
        );
        assert_eq!(RigError::device("generator", "eof").kind(), ErrorKind::DeviceError);
        assert_eq!(
            RigError::UnknownCommand("frobnicate".into()).kind(),
            ErrorKind::UnknownCommand
        );
        assert_eq!(RigError::Busy("queue".into()).kind(), ErrorKind::Busy);
        assert_eq!(RigError::Channel("closed".into()).kind(), ErrorKind::BusError);
    }

    #[test]
    fn display_names_the_offender() {
        let err = RigError::device("generator", "serial port closed");
        assert!(err.to_string().contains("generator"));
        assert!(err.to_string().contains("serial port closed"));

        let err = RigError::UnknownCommand("frobnicate".into());
        assert_eq!(err.to_string(), "Unknown command type: frobnicate");
    }
}
