//! Bridge between the shared bus and in-process delivery.
//!
//! Each admitted connection gets one attachment: a subscription covering the
//! subject's channel set plus a forwarder task that turns every bus message
//! into local fan-out through the [`ConnectionRegistry`]. The forwarder is
//! aborted on disconnect, which drops the subscription and releases the
//! medium resource.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use courier_protocol::{channels, codec, ServerEvent};

use crate::bus::EventBus;
use crate::error::RelayError;
use crate::registry::ConnectionRegistry;

/// Connects bus subscriptions to registry fan-out.
pub struct PubSubBridge {
    bus: Arc<dyn EventBus>,
    registry: Arc<ConnectionRegistry>,
}

impl PubSubBridge {
    /// Create a bridge over a bus and the process-local registry.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { bus, registry }
    }

    /// Subscribe a subject's channel set and start forwarding.
    ///
    /// Returns the forwarder task handle; the caller aborts it when the
    /// connection closes. Delivery reuses the raw payload, so one bus message
    /// serializes exactly once regardless of device count.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established, in which
    /// case the connection must be refused.
    pub async fn attach(&self, subject: &str) -> Result<JoinHandle<()>, RelayError> {
        let patterns = channels::subject_patterns(subject);
        let mut subscription = self.bus.subscribe(&patterns).await?;
        debug!(subject = %subject, channels = patterns.len(), "Subject attached to bus");

        let registry = self.registry.clone();
        let subject = subject.to_string();
        Ok(tokio::spawn(async move {
            while let Some(msg) = subscription.recv().await {
                // Malformed payloads still reach the client, wrapped by the
                // lenient decoder; a publisher bug must not wedge delivery.
                let event = codec::decode_lenient(&msg.payload);
                let frame = match codec::encode(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(subject = %subject, channel = %msg.channel, error = %e, "Failed to re-encode bus message");
                        continue;
                    }
                };
                let delivered = registry.send_raw_to_subject(&subject, &frame);
                debug!(subject = %subject, channel = %msg.channel, delivered = delivered, "Bus message forwarded");
            }
            debug!(subject = %subject, "Bus subscription closed");
        }))
    }

    /// Publish an event on a channel, logging failures instead of raising.
    ///
    /// Event producers treat the bus as best-effort: local delivery has
    /// already happened by the time this runs.
    pub async fn publish_best_effort(&self, channel: &str, event: &ServerEvent) {
        let payload = match codec::encode(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Failed to encode event for publish");
                return;
            }
        };
        if let Err(e) = self.bus.publish(channel, &payload).await {
            warn!(channel = %channel, error = %e, "Event publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBus;
    use crate::registry::ConnectionHandle;

    #[tokio::test]
    async fn test_bus_message_reaches_local_connections() {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = PubSubBridge::new(bus.clone(), registry.clone());

        let (conn, mut rx) = ConnectionHandle::new();
        registry.add("u1", conn);
        let forwarder = bridge.attach("u1").await.unwrap();

        bus.publish(
            &channels::messages("u1"),
            r#"{"type":"typing","sender_id":"u2","is_typing":true}"#,
        )
        .await
        .unwrap();

        let frame = rx.recv().await.unwrap();
        let event = codec::decode_lenient(&frame);
        assert_eq!(
            event,
            ServerEvent::Typing {
                sender_id: "u2".to_string(),
                is_typing: true,
            }
        );
        forwarder.abort();
    }

    #[tokio::test]
    async fn test_malformed_payload_wrapped_not_dropped() {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = PubSubBridge::new(bus.clone(), registry.clone());

        let (conn, mut rx) = ConnectionHandle::new();
        registry.add("u1", conn);
        let forwarder = bridge.attach("u1").await.unwrap();

        bus.publish(&channels::notifications("u1"), "not json")
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["data"], "not json");
        forwarder.abort();
    }

    #[tokio::test]
    async fn test_other_subjects_channels_ignored() {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = PubSubBridge::new(bus.clone(), registry.clone());

        let (conn, mut rx) = ConnectionHandle::new();
        registry.add("u1", conn);
        let forwarder = bridge.attach("u1").await.unwrap();

        bus.publish(&channels::messages("u2"), r#"{"type":"pong"}"#)
            .await
            .unwrap();
        bus.publish(&channels::messages("u1"), r#"{"type":"pong"}"#)
            .await
            .unwrap();

        // Only the u1 publish arrives.
        assert_eq!(rx.recv().await.unwrap(), r#"{"type":"pong"}"#);
        assert!(rx.try_recv().is_err());
        forwarder.abort();
    }
}
