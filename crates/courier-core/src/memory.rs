//! In-memory backend implementations.
//!
//! These back the test suite and single-process deployments that run without
//! Redis or a durable database. Counter and snapshot expiry use the tokio
//! clock so paused-time tests can advance through windows.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::auth::RevocationStore;
use crate::bus::{pattern_matches, BusMessage, BusSubscription, EventBus};
use crate::calls::{CallRecord, CallSnapshot, CallStore, CallUpdate, SnapshotCache};
use crate::error::RelayError;
use crate::limiter::CounterStore;

#[derive(Debug)]
struct Counter {
    count: i64,
    expires_at: Option<Instant>,
}

/// Fixed-window counters held in process memory.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, Counter>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<i64, RelayError> {
        let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: None,
        });
        if let Some(expires_at) = entry.expires_at {
            if Instant::now() >= expires_at {
                entry.count = 0;
                entry.expires_at = None;
            }
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<(), RelayError> {
        if let Some(mut entry) = self.counters.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64, RelayError> {
        let Some(entry) = self.counters.get(key) else {
            return Ok(-2);
        };
        match entry.expires_at {
            Some(expires_at) => {
                let now = Instant::now();
                if now >= expires_at {
                    Ok(-2)
                } else {
                    Ok((expires_at - now).as_secs() as i64)
                }
            }
            None => Ok(-1),
        }
    }
}

/// Revoked token identifiers held in process memory.
#[derive(Debug, Default)]
pub struct MemoryRevocationStore {
    revoked: DashMap<String, ()>,
}

impl MemoryRevocationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a token identifier as revoked.
    pub fn revoke(&self, token_id: &str) {
        self.revoked.insert(token_id.to_string(), ());
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn is_revoked(&self, token_id: &str) -> Result<bool, RelayError> {
        Ok(self.revoked.contains_key(token_id))
    }
}

struct Subscriber {
    patterns: Vec<String>,
    sender: mpsc::UnboundedSender<BusMessage>,
}

/// Single-process event bus.
///
/// Publishes fan out synchronously to every subscriber whose pattern set
/// covers the channel; closed subscribers are pruned on the way.
#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MemoryBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), RelayError> {
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| RelayError::Store("bus lock poisoned".to_string()))?;
        subscribers.retain(|sub| {
            if !sub.patterns.iter().any(|p| pattern_matches(p, channel)) {
                return !sub.sender.is_closed();
            }
            sub.sender
                .send(BusMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .is_ok()
        });
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<BusSubscription, RelayError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| RelayError::Store("bus lock poisoned".to_string()))?;
        subscribers.push(Subscriber {
            patterns: patterns.to_vec(),
            sender,
        });
        Ok(BusSubscription::new(receiver))
    }
}

/// Durable call records held in process memory.
#[derive(Debug, Default)]
pub struct MemoryCallStore {
    records: DashMap<Uuid, CallRecord>,
}

impl MemoryCallStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite a record's start time. Test-only seam for ordering checks.
    pub fn update_call_started_at(&self, id: Uuid, started_at: chrono::DateTime<chrono::Utc>) {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.started_at = started_at;
        }
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn create_call(&self, record: &CallRecord) -> Result<(), RelayError> {
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_call(&self, id: Uuid) -> Result<Option<CallRecord>, RelayError> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn update_call(&self, id: Uuid, update: CallUpdate) -> Result<(), RelayError> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or(RelayError::NotFound("Call"))?;
        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(answered_at) = update.answered_at {
            record.answered_at = Some(answered_at);
        }
        if let Some(ended_at) = update.ended_at {
            record.ended_at = Some(ended_at);
        }
        if let Some(duration) = update.duration {
            record.duration = Some(duration);
        }
        Ok(())
    }

    async fn list_calls(&self, subject: &str, limit: usize) -> Result<Vec<CallRecord>, RelayError> {
        let mut calls: Vec<CallRecord> = self
            .records
            .iter()
            .filter(|r| r.caller_id == subject || r.receiver_id == subject)
            .map(|r| r.clone())
            .collect();
        calls.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        calls.truncate(limit);
        Ok(calls)
    }
}

#[derive(Debug)]
struct CachedSnapshot {
    snapshot: CallSnapshot,
    expires_at: Instant,
}

/// Ephemeral call snapshots held in process memory.
#[derive(Debug, Default)]
pub struct MemorySnapshotCache {
    snapshots: DashMap<String, CachedSnapshot>,
    indexes: DashMap<String, HashSet<String>>,
}

impl MemorySnapshotCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Call ids currently indexed for a subject.
    #[must_use]
    pub fn indexed_calls(&self, subject: &str) -> Vec<String> {
        self.indexes
            .get(subject)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotCache for MemorySnapshotCache {
    async fn put(
        &self,
        call_id: &str,
        snapshot: &CallSnapshot,
        ttl_secs: u64,
    ) -> Result<(), RelayError> {
        self.snapshots.insert(
            call_id.to_string(),
            CachedSnapshot {
                snapshot: snapshot.clone(),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallSnapshot>, RelayError> {
        let Some(cached) = self.snapshots.get(call_id) else {
            return Ok(None);
        };
        if Instant::now() >= cached.expires_at {
            drop(cached);
            self.snapshots.remove(call_id);
            return Ok(None);
        }
        Ok(Some(cached.snapshot.clone()))
    }

    async fn index(&self, subject: &str, call_id: &str, _ttl_secs: u64) -> Result<(), RelayError> {
        self.indexes
            .entry(subject.to_string())
            .or_default()
            .insert(call_id.to_string());
        Ok(())
    }
}
