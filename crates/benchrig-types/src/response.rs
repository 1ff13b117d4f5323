//! Outbound response envelopes published on the response topic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{CommandKind, ErrorKind, RigError};

/// Machine- and human-readable description of a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

/// A success or error reply to one command.
///
/// Success payload fields are flattened into the top level so the UI reads
/// e.g. `response.channel` directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub response_type: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// The offending command, echoed verbatim on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl ResponseEnvelope {
    pub fn success(kind: CommandKind, data: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            response_type: kind.response_type(),
            success: true,
            timestamp: Utc::now(),
            error: None,
            command: None,
            data,
        }
    }

    pub fn failure(err: &RigError, command: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            response_type: "error".to_string(),
            success: false,
            timestamp: Utc::now(),
            error: Some(ErrorDetail {
                kind: err.kind(),
                message: err.to_string(),
            }),
            command: Some(command),
            data: Map::new(),
        }
    }

    /// Add one payload field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_flattens_payload_fields() {
        let resp = ResponseEnvelope::success(CommandKind::ChannelSelect, Map::new())
            .with("channel", 3)
            .with("percent", 50.0);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "channel_select_status");
        assert_eq!(json["success"], true);
        assert_eq!(json["channel"], 3);
        assert!(json.get("error").is_none());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn failure_echoes_command_and_kind() {
        let raw = json!({"type": "frobnicate"});
        let resp = ResponseEnvelope::failure(&RigError::UnknownCommand("frobnicate".into()), raw.clone());
        assert!(!resp.success);
        assert_eq!(resp.error_kind(), Some(ErrorKind::UnknownCommand));

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["command"], raw);
        assert_eq!(json["error"]["kind"], "unknown_command");
        assert_eq!(json["error"]["message"], "Unknown command type: frobnicate");
    }

    #[test]
    fn envelope_ids_are_unique() {
        let a = ResponseEnvelope::success(CommandKind::AllOff, Map::new());
        let b = ResponseEnvelope::success(CommandKind::AllOff, Map::new());
        assert_ne!(a.id, b.id);
    }
}
