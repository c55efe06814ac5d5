//! In-process connection registry.
//!
//! Maps a subject (authenticated user id) to the set of its live socket
//! handles, one per device. The registry is the only memory shared between
//! per-connection tasks; all synchronization lives inside its map.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use courier_protocol::{codec, ServerEvent};

/// Monotonic source for connection ids within this process.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Generate the next connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// The sending half of one live socket.
///
/// The socket task owns the paired receiver and writes each frame to the
/// wire; everything else reaches the socket by cloning this handle through
/// the registry. A send fails only once the socket task has dropped its
/// receiver, which is exactly the "dead connection" signal the registry
/// prunes on.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver the socket task will drain.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::generate(),
                sender,
            },
            receiver,
        )
    }

    /// The connection's unique identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a pre-serialized frame for this connection.
    ///
    /// Returns `false` if the socket task is gone.
    pub fn send_raw(&self, frame: String) -> bool {
        self.sender.send(frame).is_ok()
    }
}

/// Registry of live connections, keyed by subject.
///
/// A subject's entry holds N >= 1 handles (N devices) and is pruned entirely
/// when it empties. Safe under concurrent add/remove/send from independent
/// socket tasks.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Vec<ConnectionHandle>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a subject.
    ///
    /// The protocol-level accept handshake (WebSocket upgrade and admission)
    /// has already happened by the time a handle exists.
    pub fn add(&self, subject: &str, conn: ConnectionHandle) {
        let mut entry = self.connections.entry(subject.to_string()).or_default();
        entry.push(conn);
        debug!(subject = %subject, devices = entry.len(), "Connection registered");
    }

    /// Remove a connection, pruning the subject's entry when it empties.
    pub fn remove(&self, subject: &str, id: &ConnectionId) {
        if let Some(mut entry) = self.connections.get_mut(subject) {
            entry.retain(|c| c.id() != id);
            let remaining = entry.len();
            drop(entry);
            if remaining == 0 {
                self.connections.remove_if(subject, |_, conns| conns.is_empty());
            }
            debug!(subject = %subject, remaining = remaining, "Connection removed");
        }
    }

    /// Deliver an event to every live connection of a subject.
    ///
    /// The event is serialized once; a connection whose send fails is pruned
    /// and logged without affecting delivery to its siblings. Returns the
    /// number of connections that accepted the frame.
    pub fn send_to_subject(&self, subject: &str, event: &ServerEvent) -> usize {
        let frame = match codec::encode(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(subject = %subject, error = %e, "Failed to encode outbound event");
                return 0;
            }
        };
        self.send_raw_to_subject(subject, &frame)
    }

    /// Deliver a pre-serialized frame to every live connection of a subject.
    pub fn send_raw_to_subject(&self, subject: &str, frame: &str) -> usize {
        let mut delivered = 0;
        let mut emptied = false;

        if let Some(mut entry) = self.connections.get_mut(subject) {
            entry.retain(|conn| {
                if conn.send_raw(frame.to_string()) {
                    delivered += 1;
                    true
                } else {
                    warn!(subject = %subject, connection = %conn.id(), "Dropping dead connection");
                    false
                }
            });
            emptied = entry.is_empty();
        }

        if emptied {
            self.connections.remove_if(subject, |_, conns| conns.is_empty());
        }

        delivered
    }

    /// Number of live connections for a subject.
    #[must_use]
    pub fn connection_count(&self, subject: &str) -> usize {
        self.connections.get(subject).map(|c| c.len()).unwrap_or(0)
    }

    /// Number of subjects with at least one live connection.
    #[must_use]
    pub fn subject_count(&self) -> usize {
        self.connections.len()
    }
}
