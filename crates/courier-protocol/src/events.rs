//! Event types for the Courier protocol.
//!
//! Inbound frames arrive as JSON objects with a `type` discriminator and are
//! parsed into [`ClientEvent`]. Outbound frames are built as [`ServerEvent`]
//! and serialized once per fan-out. Routing fields the client failed to
//! supply decode as `None`; handlers treat a missing target as a silent no-op.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An inbound socket frame, after JSON parsing and classification.
///
/// Unrecognized `type` values and structurally invalid frames collapse into
/// [`ClientEvent::Unknown`], which carries the raw value so the router can
/// echo it back to the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Keepalive; answered with a `pong` to the sender only.
    Ping,

    /// Typing indicator for a direct conversation.
    Typing {
        #[serde(default)]
        receiver_id: Option<String>,
        #[serde(default)]
        is_typing: bool,
    },

    /// Read receipt for one or more messages.
    ReadReceipt {
        #[serde(default)]
        receiver_id: Option<String>,
        #[serde(default)]
        message_ids: Vec<String>,
        #[serde(default)]
        read_at: Option<Value>,
    },

    /// WebRTC call signaling pass-through (offer / answer / candidate).
    Signal {
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        call_id: Option<Value>,
        #[serde(default)]
        signal_type: Option<String>,
        #[serde(default)]
        payload: Option<Value>,
    },

    /// Listen-party sync relay, scoped to a room rather than a subject.
    Party {
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        action: Option<String>,
        #[serde(default)]
        timestamp: Option<Value>,
        #[serde(default)]
        position: Option<Value>,
        #[serde(default)]
        provider: Option<String>,
        #[serde(default)]
        track_id: Option<Value>,
    },

    /// Provisional new-message notification (message creation is REST-side).
    Message {
        #[serde(default)]
        receiver_id: Option<String>,
        #[serde(default)]
        message_id: Option<Value>,
        #[serde(default)]
        client_id: Option<Value>,
        #[serde(default)]
        delivered_at: Option<Value>,
    },

    /// Anything the router does not understand.
    Unknown {
        #[serde(default)]
        data: Value,
    },
}

impl ClientEvent {
    /// Parse a raw inbound frame.
    ///
    /// Malformed JSON and frames that do not match any known shape are
    /// classified as [`ClientEvent::Unknown`] rather than rejected, so a
    /// misbehaving client never errors the receive loop.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => {
                // A frame literally tagged `unknown` keeps the whole frame;
                // letting serde match the variant would collapse it to its
                // (usually absent) `data` field.
                if value.get("type").and_then(Value::as_str) == Some("unknown") {
                    return ClientEvent::Unknown { data: value };
                }
                match serde_json::from_value::<ClientEvent>(value.clone()) {
                    Ok(event) => event,
                    Err(_) => ClientEvent::Unknown { data: value },
                }
            }
            Err(_) => ClientEvent::Unknown {
                data: serde_json::json!({ "type": "unknown", "raw": raw }),
            },
        }
    }

    /// The rate-limit action key for this event kind.
    ///
    /// Each kind has its own independent budget; the key is combined with the
    /// subject id by the limiter (`rl:<subject>:<action>`).
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            ClientEvent::Ping => "ws:ping",
            ClientEvent::Typing { .. } => "ws:typing",
            ClientEvent::ReadReceipt { .. } => "ws:read",
            ClientEvent::Signal { .. } => "ws:signal",
            ClientEvent::Party { .. } => "ws:party",
            ClientEvent::Message { .. } => "ws:message_meta",
            ClientEvent::Unknown { .. } => "ws:recv",
        }
    }
}

/// An outbound frame delivered to every live connection of a subject.
///
/// The field set of each variant is fixed; all variants serialize with a
/// `type` tag so clients can dispatch without schema negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Reply to a client `ping`.
    Pong,

    /// Typing indicator relayed to the receiver.
    Typing { sender_id: String, is_typing: bool },

    /// Read receipt fan-out.
    MessagesRead {
        from: String,
        message_ids: Vec<String>,
        #[serde(default)]
        read_at: Option<Value>,
    },

    /// Call signaling payload (offer / answer / candidate, plus the
    /// lifecycle notifications emitted by the call service).
    Signal {
        from: String,
        #[serde(default)]
        call_id: Option<Value>,
        #[serde(default)]
        signal_type: Option<String>,
        #[serde(default)]
        payload: Option<Value>,
    },

    /// Listen-party state relayed on a room channel.
    Party {
        from: String,
        room_id: String,
        #[serde(default)]
        action: Option<String>,
        #[serde(default)]
        timestamp: Option<Value>,
        #[serde(default)]
        position: Option<Value>,
        #[serde(default)]
        provider: Option<String>,
        #[serde(default)]
        track_id: Option<Value>,
    },

    /// New-message notification for the receiver's devices.
    NewMessage {
        from: String,
        #[serde(default)]
        message_id: Option<Value>,
        #[serde(default)]
        client_id: Option<Value>,
        #[serde(default)]
        delivered_at: Option<Value>,
    },

    /// Echo of an unrecognized inbound frame, sent to the sender only.
    Echo { payload: Value },

    /// Raw wrapper for pub/sub payloads that failed to decode as a typed
    /// event. Forward compatibility: older servers relay frames published by
    /// newer ones instead of dropping them.
    Event { data: Value },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ping() {
        assert_eq!(ClientEvent::parse(r#"{"type":"ping"}"#), ClientEvent::Ping);
    }

    #[test]
    fn test_parse_typing() {
        let event = ClientEvent::parse(r#"{"type":"typing","receiver_id":"u2","is_typing":true}"#);
        assert_eq!(
            event,
            ClientEvent::Typing {
                receiver_id: Some("u2".to_string()),
                is_typing: true,
            }
        );
    }

    #[test]
    fn test_parse_missing_routing_field() {
        // A typing frame without receiver_id still parses; the router decides
        // to drop it.
        let event = ClientEvent::parse(r#"{"type":"typing","is_typing":false}"#);
        assert_eq!(
            event,
            ClientEvent::Typing {
                receiver_id: None,
                is_typing: false,
            }
        );
    }

    #[test]
    fn test_parse_unknown_type() {
        let event = ClientEvent::parse(r#"{"type":"teleport","x":1}"#);
        match event {
            ClientEvent::Unknown { data } => {
                assert_eq!(data["type"], "teleport");
                assert_eq!(data["x"], 1);
            }
            other => panic!("Expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_literal_unknown_tag_keeps_frame() {
        // `unknown` as the declared tag must not drop the frame's own fields.
        let event = ClientEvent::parse(r#"{"type":"unknown","x":1}"#);
        match event {
            ClientEvent::Unknown { data } => {
                assert_eq!(data["type"], "unknown");
                assert_eq!(data["x"], 1);
            }
            other => panic!("Expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_malformed_json() {
        let event = ClientEvent::parse("not json at all {{{");
        match event {
            ClientEvent::Unknown { data } => {
                assert_eq!(data["type"], "unknown");
                assert_eq!(data["raw"], "not json at all {{{");
            }
            other => panic!("Expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_action_keys() {
        assert_eq!(ClientEvent::Ping.action(), "ws:ping");
        assert_eq!(
            ClientEvent::Signal {
                to: None,
                call_id: None,
                signal_type: None,
                payload: None,
            }
            .action(),
            "ws:signal"
        );
    }

    #[test]
    fn test_server_event_tags() {
        let event = ServerEvent::MessagesRead {
            from: "u1".to_string(),
            message_ids: vec!["m1".to_string()],
            read_at: Some(json!("2026-01-01T00:00:00Z")),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "messages_read");
        assert_eq!(value["from"], "u1");
        assert_eq!(value["message_ids"][0], "m1");

        let pong = serde_json::to_value(ServerEvent::Pong).unwrap();
        assert_eq!(pong, json!({ "type": "pong" }));
    }
}
