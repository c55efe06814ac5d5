//! Inbound event routing.
//!
//! One router instance serves every connection. `dispatch` runs inside the
//! socket task that received the frame: it charges the per-kind budget, then
//! delivers locally through the registry and publishes on the bus so peer
//! processes can deliver to devices they host. Frames with a missing routing
//! target are dropped silently, matching the tolerance of the parser.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use courier_protocol::{channels, ClientEvent, ServerEvent};

use crate::bridge::PubSubBridge;
use crate::error::RelayError;
use crate::limiter::{budgets, Budget, RateLimiter};
use crate::registry::ConnectionRegistry;

/// Routes parsed client events to their targets.
pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
    bridge: Arc<PubSubBridge>,
    limiter: RateLimiter,
}

impl EventRouter {
    /// Create a router over the registry, bridge, and limiter.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bridge: Arc<PubSubBridge>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            registry,
            bridge,
            limiter,
        }
    }

    /// Parse and route one raw inbound frame from `subject`, returning the
    /// action key of the routed event.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::RateLimited`] when the event kind's budget is
    /// exhausted; the caller logs and drops the frame without closing the
    /// connection.
    pub async fn dispatch(&self, subject: &str, raw: &str) -> Result<&'static str, RelayError> {
        let event = ClientEvent::parse(raw);
        let action = event.action();
        // Unknown frames carry no budget of their own; the socket-level
        // receive throttle covers them.
        if let Some(budget) = budget_for(&event) {
            self.limiter.allow(subject, action, budget).await?;
        }

        match event {
            ClientEvent::Ping => {
                self.registry.send_to_subject(subject, &ServerEvent::Pong);
            }

            ClientEvent::Typing {
                receiver_id,
                is_typing,
            } => {
                let Some(receiver) = non_empty(receiver_id) else {
                    debug!(subject = %subject, "Typing frame without receiver, dropped");
                    return Ok(action);
                };
                let out = ServerEvent::Typing {
                    sender_id: subject.to_string(),
                    is_typing,
                };
                self.registry.send_to_subject(&receiver, &out);
                self.bridge
                    .publish_best_effort(&channels::notifications(&receiver), &out)
                    .await;
            }

            ClientEvent::ReadReceipt {
                receiver_id,
                message_ids,
                read_at,
            } => {
                let Some(receiver) = non_empty(receiver_id) else {
                    debug!(subject = %subject, "Read receipt without receiver, dropped");
                    return Ok(action);
                };
                let out = ServerEvent::MessagesRead {
                    from: subject.to_string(),
                    message_ids,
                    read_at,
                };
                self.registry.send_to_subject(&receiver, &out);
                self.bridge
                    .publish_best_effort(&channels::read_receipts(&receiver), &out)
                    .await;
            }

            ClientEvent::Signal {
                to,
                call_id,
                signal_type,
                payload,
            } => {
                let Some(receiver) = non_empty(to) else {
                    debug!(subject = %subject, "Signal frame without target, dropped");
                    return Ok(action);
                };
                let out = ServerEvent::Signal {
                    from: subject.to_string(),
                    call_id,
                    signal_type,
                    payload,
                };
                self.registry.send_to_subject(&receiver, &out);
                self.bridge
                    .publish_best_effort(&channels::call(&receiver), &out)
                    .await;
            }

            ClientEvent::Party {
                room_id,
                action: party_action,
                timestamp,
                position,
                provider,
                track_id,
            } => {
                let Some(room) = non_empty(room_id) else {
                    debug!(subject = %subject, "Party frame without room, dropped");
                    return Ok(action);
                };
                let out = ServerEvent::Party {
                    from: subject.to_string(),
                    room_id: room.clone(),
                    action: party_action,
                    timestamp,
                    position,
                    provider,
                    track_id,
                };
                // Room membership lives on the bus side only; no direct
                // registry delivery because a room is not a subject.
                self.bridge
                    .publish_best_effort(&channels::room(&room), &out)
                    .await;
            }

            ClientEvent::Message {
                receiver_id,
                message_id,
                client_id,
                delivered_at,
            } => {
                let Some(receiver) = non_empty(receiver_id) else {
                    debug!(subject = %subject, "Message frame without receiver, dropped");
                    return Ok(action);
                };
                let out = ServerEvent::NewMessage {
                    from: subject.to_string(),
                    message_id,
                    client_id,
                    delivered_at,
                };
                self.registry.send_to_subject(&receiver, &out);
                self.bridge
                    .publish_best_effort(&channels::messages(&receiver), &out)
                    .await;
            }

            ClientEvent::Unknown { data } => {
                warn!(subject = %subject, "Unrecognized frame echoed back");
                self.registry.send_to_subject(
                    subject,
                    &ServerEvent::Echo {
                        payload: json!({ "unknown": data }),
                    },
                );
            }
        }

        Ok(action)
    }
}

fn budget_for(event: &ClientEvent) -> Option<Budget> {
    match event {
        ClientEvent::Ping => Some(budgets::PING),
        ClientEvent::Typing { .. } => Some(budgets::TYPING),
        ClientEvent::ReadReceipt { .. } => Some(budgets::READ_RECEIPT),
        ClientEvent::Signal { .. } => Some(budgets::SIGNAL),
        ClientEvent::Party { .. } => Some(budgets::PARTY),
        ClientEvent::Message { .. } => Some(budgets::MESSAGE),
        ClientEvent::Unknown { .. } => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
