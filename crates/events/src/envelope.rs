//! Realtime wire messages.
//!
//! Outbound:
//! - first frame after open: `{ "type": "connect", "userId", "authToken", "timestamp" }`
//! - afterwards: `{ "type", "data", "timestamp" }`
//!
//! Inbound: any JSON object with a non-empty string `type`; `data` and
//! `timestamp` are optional.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Event type that receives every inbound event.
pub const WILDCARD: &str = "*";

/// Event type names the client knows about.
pub mod kinds {
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const RECONNECT: &str = "reconnect";
    pub const RECONNECT_FAILED: &str = "reconnect_failed";

    pub const AUTHENTICATED: &str = "authenticated";
    pub const CONNECT_SUCCESS: &str = "connect_success";
    pub const AUTH_ERROR: &str = "auth_error";
    pub const UNAUTHORIZED: &str = "unauthorized";

    pub const SHIPMENT_STATUS: &str = "shipment_status_update";
    pub const PICKUP_STATUS: &str = "pickup_status_update";
    pub const DELIVERY_STATUS: &str = "delivery_status_update";
    pub const NOTIFICATION: &str = "notification";

    /// Server acknowledgement that the identity in the connect frame was accepted.
    pub fn is_auth_success(kind: &str) -> bool {
        kind == AUTHENTICATED || kind == CONNECT_SUCCESS
    }

    pub fn is_auth_failure(kind: &str) -> bool {
        kind == AUTH_ERROR || kind == UNAUTHORIZED
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no type")]
    MissingType,
}

/// An event pushed by the server (or synthesized locally for lifecycle changes).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Some(Utc::now()),
        }
    }

    /// Parse a text frame.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let obj = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

        let event_type = obj
            .get("type")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .ok_or(EnvelopeError::MissingType)?
            .to_string();

        Ok(Self {
            event_type,
            data: obj.get("data").cloned().unwrap_or(Value::Null),
            timestamp: obj.get("timestamp").and_then(parse_timestamp),
        })
    }
}

/// Accept RFC 3339 strings and epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Identity frame sent immediately after the transport opens.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub user_id: String,
    pub auth_token: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl ConnectMessage {
    pub fn new(user_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            message_type: kinds::CONNECT,
            user_id: user_id.into(),
            auth_token: auth_token.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Application message pushed by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: Value,
    /// Epoch milliseconds at the time the caller issued the send.
    pub timestamp: i64,
}

impl OutboundMessage {
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_typed_frames() {
        let ev = InboundEvent::parse(
            r#"{"type":"shipment_status_update","data":{"id":"ship_1","status":"in_transit"},"timestamp":1700000000000}"#,
        )
        .unwrap();

        assert_eq!(ev.event_type, kinds::SHIPMENT_STATUS);
        assert_eq!(ev.data["status"], json!("in_transit"));
        assert_eq!(ev.timestamp.unwrap().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn rejects_frames_without_a_type() {
        assert_eq!(
            InboundEvent::parse(r#"{"data":1}"#).unwrap_err(),
            EnvelopeError::MissingType
        );
        assert_eq!(
            InboundEvent::parse(r#"{"type":""}"#).unwrap_err(),
            EnvelopeError::MissingType
        );
        assert_eq!(InboundEvent::parse("[1,2]").unwrap_err(), EnvelopeError::NotAnObject);
        assert!(matches!(
            InboundEvent::parse("not json").unwrap_err(),
            EnvelopeError::Malformed(_)
        ));
    }

    #[test]
    fn connect_frame_uses_camel_case_identity() {
        let frame: Value =
            serde_json::from_str(&ConnectMessage::new("u_1", "tok").to_json().unwrap()).unwrap();

        assert_eq!(frame["type"], json!("connect"));
        assert_eq!(frame["userId"], json!("u_1"));
        assert_eq!(frame["authToken"], json!("tok"));
        assert!(frame["timestamp"].is_i64());
    }

    #[test]
    fn outbound_frame_shape() {
        let frame: Value = serde_json::from_str(
            &OutboundMessage::new("typing", json!({"room": "r1"})).to_json().unwrap(),
        )
        .unwrap();

        assert_eq!(frame["type"], json!("typing"));
        assert_eq!(frame["data"], json!({"room": "r1"}));
        assert!(frame["timestamp"].is_i64());
    }
}
