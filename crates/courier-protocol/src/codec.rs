//! Codec for Courier events.
//!
//! The wire format is compact JSON (no insignificant whitespace), one frame
//! per WebSocket text message and per pub/sub payload. Encoding is strict;
//! decoding is lenient so a frame published by a newer peer degrades into a
//! raw `{type:"event",data:<raw>}` wrapper instead of being dropped.

use thiserror::Error;

use crate::events::ServerEvent;

/// Protocol errors that can occur during encoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Encode an outbound event as compact JSON.
///
/// The result is serialized exactly once per fan-out; callers clone the
/// string per connection.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(event: &ServerEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode a pub/sub payload into an outbound event.
///
/// Falls back to [`ServerEvent::Event`] wrapping the raw value (or raw
/// string, if the payload is not JSON at all) on any decode failure.
#[must_use]
pub fn decode_lenient(payload: &str) -> ServerEvent {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value) => match serde_json::from_value::<ServerEvent>(value.clone()) {
            Ok(event) => event,
            Err(_) => ServerEvent::Event { data: value },
        },
        Err(_) => ServerEvent::Event {
            data: serde_json::Value::String(payload.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_compact() {
        let event = ServerEvent::Typing {
            sender_id: "u1".to_string(),
            is_typing: true,
        };
        let encoded = encode(&event).unwrap();
        assert!(!encoded.contains(' '));
        assert!(encoded.contains(r#""type":"typing""#));
    }

    #[test]
    fn test_roundtrip_structural_equality() {
        // A handler-built event survives publish + decode unchanged.
        let events = vec![
            ServerEvent::Pong,
            ServerEvent::MessagesRead {
                from: "u1".to_string(),
                message_ids: vec!["m1".to_string(), "m2".to_string()],
                read_at: Some(json!("2026-02-03T04:05:06Z")),
            },
            ServerEvent::Signal {
                from: "u1".to_string(),
                call_id: Some(json!("c1")),
                signal_type: Some("offer".to_string()),
                payload: Some(json!({ "sdp": "v=0" })),
            },
            ServerEvent::NewMessage {
                from: "u1".to_string(),
                message_id: Some(json!("m9")),
                client_id: None,
                delivered_at: None,
            },
        ];

        for event in events {
            let encoded = encode(&event).unwrap();
            assert_eq!(decode_lenient(&encoded), event);
        }
    }

    #[test]
    fn test_decode_unknown_shape_wraps() {
        let decoded = decode_lenient(r#"{"type":"future_thing","n":7}"#);
        match decoded {
            ServerEvent::Event { data } => assert_eq!(data["n"], 7),
            other => panic!("Expected Event wrapper, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_non_json_wraps_raw() {
        let decoded = decode_lenient("plain text");
        assert_eq!(
            decoded,
            ServerEvent::Event {
                data: json!("plain text")
            }
        );
    }
}
