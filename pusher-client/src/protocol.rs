//! Pusher Channels wire protocol: event names, envelope encoding/decoding.
//!
//! Every frame on the wire is a JSON object with an `event` name, an optional
//! `channel`, and a `data` field. Outbound `data` is double-encoded: the
//! payload is serialized to a JSON string which is then embedded as a string
//! value inside the envelope. Inbound frames undo that layer when possible.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Error, Result};

/// Protocol version sent in the connection URL query string.
pub const PROTOCOL_VERSION: u8 = 7;

/// Client identifier sent in the connection URL query string.
pub const CLIENT_ID: &str = "pusher-client-rs";

/// Synthetic channel name assigned to envelopes that arrive without one.
/// All `pusher:`-prefixed system events fall in this bucket.
pub const SYSTEM_CHANNEL: &str = "pusher:system";

/// Well-known `pusher:` event names.
pub mod events {
    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    pub const CONNECTION_FAILED: &str = "pusher:connection_failed";
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    pub const ERROR: &str = "pusher:error";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// On-the-wire shape of a frame.
#[derive(Debug, Serialize, Deserialize)]
struct RawEnvelope {
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// A decoded inbound frame, with the double-encoded `data` layer removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: String,
    /// Originating channel, or [`SYSTEM_CHANNEL`] when the frame had none.
    pub channel: String,
    pub data: Value,
}

impl Envelope {
    pub fn is_system(&self) -> bool {
        self.channel == SYSTEM_CHANNEL
    }
}

/// Encode an outbound frame. `data` is double-encoded per the protocol.
pub fn encode(event: &str, data: &Value, channel: Option<&str>) -> Result<String> {
    let raw = RawEnvelope {
        event: event.to_string(),
        channel: channel.map(str::to_string),
        data: Some(Value::String(serde_json::to_string(data)?)),
    };
    Ok(serde_json::to_string(&raw)?)
}

/// Encode a bare system frame with an empty `data` payload (pings, pongs).
pub fn encode_bare(event: &str) -> Result<String> {
    let raw = RawEnvelope {
        event: event.to_string(),
        channel: None,
        data: Some(Value::String(String::new())),
    };
    Ok(serde_json::to_string(&raw)?)
}

/// Decode an inbound frame.
///
/// Leniency rules: an absent or empty `data` becomes `Value::Null`; a string
/// `data` that fails the inner JSON parse, or a non-string `data`, is passed
/// through as-is.
pub fn decode(text: &str) -> Result<Envelope> {
    let raw: RawEnvelope =
        serde_json::from_str(text).map_err(|e| Error::MalformedMessage(e.to_string()))?;
    let data = match raw.data {
        None | Some(Value::Null) => Value::Null,
        Some(Value::String(s)) => {
            if s.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&s).unwrap_or(Value::String(s))
            }
        }
        Some(other) => other,
    };
    Ok(Envelope {
        event: raw.event,
        channel: raw.channel.unwrap_or_else(|| SYSTEM_CHANNEL.to_string()),
        data,
    })
}

// ---------------------------------------------------------------------------
// System events
// ---------------------------------------------------------------------------

/// The closed set of inbound `pusher:` system events this client handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    ConnectionEstablished,
    ConnectionFailed,
    Ping,
    Pong,
    Error,
}

impl SystemEvent {
    /// Map an event name to its handler. Returns `None` for names outside
    /// the closed set; callers log and drop those.
    pub fn parse(name: &str) -> Option<SystemEvent> {
        match name {
            events::CONNECTION_ESTABLISHED => Some(SystemEvent::ConnectionEstablished),
            events::CONNECTION_FAILED => Some(SystemEvent::ConnectionFailed),
            events::PING => Some(SystemEvent::Ping),
            events::PONG => Some(SystemEvent::Pong),
            events::ERROR => Some(SystemEvent::Error),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_double_encodes_data() {
        let out = encode("pusher:subscribe", &json!({"channel": "foo"}), None).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["event"], "pusher:subscribe");
        // data must be a string holding JSON, not a nested object
        let inner = v["data"].as_str().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(inner).unwrap(),
            json!({"channel": "foo"})
        );
        assert!(v.get("channel").is_none());
    }

    #[test]
    fn encode_includes_channel_when_present() {
        let out = encode("client-typing", &json!({"user": "u1"}), Some("private-chat")).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["channel"], "private-chat");
    }

    #[test]
    fn encode_bare_uses_empty_string_data() {
        let out = encode_bare("pusher:ping").unwrap();
        assert_eq!(out, r#"{"event":"pusher:ping","data":""}"#);
    }

    #[test]
    fn decode_inverts_encode() {
        let data = json!({"items": [1, 2], "note": "x"});
        let text = encode("order-created", &data, Some("private-orders")).unwrap();
        let env = decode(&text).unwrap();
        assert_eq!(env.event, "order-created");
        assert_eq!(env.channel, "private-orders");
        assert_eq!(env.data, data);
    }

    #[test]
    fn decode_unwraps_double_encoded_data() {
        let text = r#"{"event":"my-event","channel":"my-channel","data":"{\"k\":1}"}"#;
        let env = decode(text).unwrap();
        assert_eq!(env.event, "my-event");
        assert_eq!(env.channel, "my-channel");
        assert_eq!(env.data, json!({"k": 1}));
        assert!(!env.is_system());
    }

    #[test]
    fn decode_missing_channel_maps_to_system() {
        let text = r#"{"event":"pusher:pong","data":"{}"}"#;
        let env = decode(text).unwrap();
        assert_eq!(env.channel, SYSTEM_CHANNEL);
        assert!(env.is_system());
    }

    #[test]
    fn decode_absent_and_empty_data_become_null() {
        let env = decode(r#"{"event":"e"}"#).unwrap();
        assert_eq!(env.data, Value::Null);
        let env = decode(r#"{"event":"e","data":""}"#).unwrap();
        assert_eq!(env.data, Value::Null);
    }

    #[test]
    fn decode_non_json_string_data_passes_through() {
        let env = decode(r#"{"event":"e","data":"not json at all"}"#).unwrap();
        assert_eq!(env.data, json!("not json at all"));
    }

    #[test]
    fn decode_object_data_used_as_is() {
        let env = decode(r#"{"event":"e","data":{"already":"parsed"}}"#).unwrap();
        assert_eq!(env.data, json!({"already": "parsed"}));
    }

    #[test]
    fn decode_missing_event_is_malformed() {
        let err = decode(r#"{"data":"{}"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
    }

    #[test]
    fn decode_non_json_is_malformed() {
        assert!(decode("not json").is_err());
    }

    #[test]
    fn system_event_parse_covers_closed_set() {
        assert_eq!(
            SystemEvent::parse("pusher:connection_established"),
            Some(SystemEvent::ConnectionEstablished)
        );
        assert_eq!(SystemEvent::parse("pusher:ping"), Some(SystemEvent::Ping));
        assert_eq!(SystemEvent::parse("pusher:pong"), Some(SystemEvent::Pong));
        assert_eq!(SystemEvent::parse("pusher:error"), Some(SystemEvent::Error));
        assert_eq!(
            SystemEvent::parse("pusher:connection_failed"),
            Some(SystemEvent::ConnectionFailed)
        );
        // Unknown system events fall outside the closed set.
        assert_eq!(SystemEvent::parse("pusher:subscription_succeeded"), None);
    }
}
