//! Cross-process publish/subscribe medium.
//!
//! The relay never assumes both ends of a conversation live on the same
//! process: every outbound event that targets a subject is also published on
//! that subject's channels, and every admitted connection holds a
//! subscription covering them. [`EventBus`] is the seam; the server crate
//! provides a Redis implementation and [`crate::memory::MemoryBus`] backs
//! tests and single-process runs.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RelayError;

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// The concrete channel the message arrived on.
    pub channel: String,
    /// Raw payload as published.
    pub payload: String,
}

/// An active subscription.
///
/// Implementations pump received messages into the channel behind this
/// handle; dropping it tears the pump down and releases the underlying
/// subscription resource, on error paths included.
#[derive(Debug)]
pub struct BusSubscription {
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl BusSubscription {
    /// Wrap a receiver produced by a bus implementation.
    #[must_use]
    pub fn new(receiver: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self { receiver }
    }

    /// Receive the next message.
    ///
    /// Returns `None` once the subscription has been closed by the medium.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// Receive without waiting; `None` when no message is queued.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }
}

/// The shared publish/subscribe medium.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a payload on a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium rejects the publish. Event-producing
    /// code paths treat this as best-effort and only log the failure.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), RelayError>;

    /// Subscribe to a set of channel patterns.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established; at
    /// admission time this refuses the connection.
    async fn subscribe(&self, patterns: &[String]) -> Result<BusSubscription, RelayError>;
}

/// Glob-style pattern match as used by the medium's pattern subscriptions:
/// `*` matches any run of characters, all other characters match literally.
///
/// Subject subscriptions use literal channel names, but the medium contract
/// accepts patterns, so implementations share this semantic.
#[must_use]
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    fn matches(p: &[u8], c: &[u8]) -> bool {
        match (p.first(), c.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&p[1..], c) || (!c.is_empty() && matches(p, &c[1..]))
            }
            (Some(pc), Some(cc)) if pc == cc => matches(&p[1..], &c[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), channel.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches_literal() {
        assert!(pattern_matches("events:messages:u1", "events:messages:u1"));
        assert!(!pattern_matches("events:messages:u1", "events:messages:u2"));
    }

    #[test]
    fn test_pattern_matches_wildcard() {
        assert!(pattern_matches("events:*:u1", "events:messages:u1"));
        assert!(pattern_matches("events:*:u1", "events:read:u1"));
        assert!(!pattern_matches("events:*:u1", "events:read:u2"));
        assert!(pattern_matches("events:*", "events:anything:at:all"));
    }
}
