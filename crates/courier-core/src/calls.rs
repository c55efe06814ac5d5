//! Call signaling state machine.
//!
//! A call moves `initiated -> answered -> ended`; `declined` is reserved as a
//! terminal state reachable from `initiated`. Every transition writes the
//! durable store first, then refreshes the ephemeral snapshot. The snapshot
//! is a read optimization bounded by TTL, never the source of truth, and a
//! failed refresh does not roll back the durable transition.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use courier_protocol::{channels, codec, ServerEvent};

use crate::bus::EventBus;
use crate::error::RelayError;
use crate::limiter::{budgets, RateLimiter};

/// Snapshot TTL after initiate.
const TTL_INITIATED_SECS: u64 = 3600;
/// Snapshot TTL after answer.
const TTL_ANSWERED_SECS: u64 = 1800;
/// Snapshot TTL after end; keeps a short history window for status reads.
const TTL_ENDED_SECS: u64 = 300;

/// How many records a history read returns.
const HISTORY_LIMIT: usize = 50;

/// Call media kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

/// Call lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Initiated,
    Answered,
    Ended,
    /// Reserved terminal state; no transition produces it yet.
    Declined,
}

/// The durable call record. Created on initiate, mutated only by answer and
/// end, never deleted by this subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: Uuid,
    pub caller_id: String,
    pub receiver_id: String,
    pub kind: CallKind,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds between answer and end; `None` until ended, zero if the call
    /// was never answered.
    pub duration: Option<i64>,
}

/// Field mask for a durable update. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct CallUpdate {
    pub status: Option<CallStatus>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
}

/// The cache-only mirror of a call record, plus the channel other processes
/// publish signaling on for this call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub call_id: String,
    pub status: CallStatus,
    pub caller_id: String,
    pub receiver_id: String,
    #[serde(rename = "call_type")]
    pub kind: CallKind,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    /// Routing hint: `events:call:<call_id>`.
    pub channel: String,
}

impl CallSnapshot {
    /// Build a snapshot from the durable record.
    #[must_use]
    pub fn from_record(record: &CallRecord) -> Self {
        let call_id = record.id.to_string();
        let channel = channels::call(&call_id);
        Self {
            call_id,
            status: record.status,
            caller_id: record.caller_id.clone(),
            receiver_id: record.receiver_id.clone(),
            kind: record.kind,
            started_at: record.started_at,
            answered_at: record.answered_at,
            ended_at: record.ended_at,
            duration: record.duration,
            channel,
        }
    }

    fn is_party(&self, subject: &str) -> bool {
        subject == self.caller_id || subject == self.receiver_id
    }
}

/// Durable storage for call records.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn create_call(&self, record: &CallRecord) -> Result<(), RelayError>;
    async fn get_call(&self, id: Uuid) -> Result<Option<CallRecord>, RelayError>;
    async fn update_call(&self, id: Uuid, update: CallUpdate) -> Result<(), RelayError>;
    /// Calls the subject participated in, newest first.
    async fn list_calls(&self, subject: &str, limit: usize) -> Result<Vec<CallRecord>, RelayError>;
}

/// Ephemeral snapshot cache keyed by call id.
#[async_trait]
pub trait SnapshotCache: Send + Sync {
    async fn put(&self, call_id: &str, snapshot: &CallSnapshot, ttl_secs: u64)
        -> Result<(), RelayError>;
    async fn get(&self, call_id: &str) -> Result<Option<CallSnapshot>, RelayError>;
    /// Record call membership under a subject's call-index set.
    async fn index(&self, subject: &str, call_id: &str, ttl_secs: u64) -> Result<(), RelayError>;
}

/// Owns the call state machine and its dual-write to durable storage and the
/// ephemeral cache. All rate budgets are per actor.
pub struct CallSignalingService {
    store: Arc<dyn CallStore>,
    cache: Arc<dyn SnapshotCache>,
    bus: Arc<dyn EventBus>,
    limiter: RateLimiter,
}

impl CallSignalingService {
    /// Create the service over its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn CallStore>,
        cache: Arc<dyn SnapshotCache>,
        bus: Arc<dyn EventBus>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            store,
            cache,
            bus,
            limiter,
        }
    }

    /// Initiate a call from `caller` to `receiver`.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited` or a durable-store fault.
    pub async fn initiate(
        &self,
        caller: &str,
        receiver: &str,
        kind: CallKind,
    ) -> Result<CallRecord, RelayError> {
        self.limiter
            .allow(caller, "calls:initiate", budgets::CALL_INITIATE)
            .await?;

        let record = CallRecord {
            id: Uuid::new_v4(),
            caller_id: caller.to_string(),
            receiver_id: receiver.to_string(),
            kind,
            status: CallStatus::Initiated,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            duration: None,
        };
        self.store.create_call(&record).await?;
        info!(call_id = %record.id, caller = %caller, receiver = %receiver, "Call initiated");

        let snapshot = CallSnapshot::from_record(&record);
        self.refresh_snapshot(&snapshot, TTL_INITIATED_SECS).await;
        self.index_participants(&snapshot, TTL_INITIATED_SECS).await;
        self.publish_transition(caller, receiver, &snapshot, "initiate")
            .await;

        Ok(record)
    }

    /// Answer a call. Only the receiver may answer, and only before the call
    /// has ended.
    ///
    /// # Errors
    ///
    /// `Forbidden` for a non-receiver actor, `Conflict` for an ended call,
    /// `NotFound`/`Unprocessable` for a missing or malformed id.
    pub async fn answer(&self, call_id: &str, actor: &str) -> Result<CallRecord, RelayError> {
        self.limiter
            .allow(actor, "calls:answer", budgets::CALL_ANSWER)
            .await?;

        let id = parse_call_id(call_id)?;
        let mut record = self
            .store
            .get_call(id)
            .await?
            .ok_or(RelayError::NotFound("Call"))?;

        if record.receiver_id != actor {
            return Err(RelayError::Forbidden("Only the receiver can answer the call"));
        }
        if record.status == CallStatus::Ended {
            return Err(RelayError::Conflict("Call already ended"));
        }

        let answered_at = Utc::now();
        self.store
            .update_call(
                id,
                CallUpdate {
                    status: Some(CallStatus::Answered),
                    answered_at: Some(answered_at),
                    ..CallUpdate::default()
                },
            )
            .await?;
        record.status = CallStatus::Answered;
        record.answered_at = Some(answered_at);
        info!(call_id = %call_id, actor = %actor, "Call answered");

        let snapshot = CallSnapshot::from_record(&record);
        self.refresh_snapshot(&snapshot, TTL_ANSWERED_SECS).await;
        let caller = record.caller_id.clone();
        self.publish_transition(actor, &caller, &snapshot, "answer")
            .await;

        Ok(record)
    }

    /// End a call. Either party may end; ending an already-ended call is a
    /// no-op that still succeeds and reports the stored duration.
    ///
    /// # Errors
    ///
    /// `Forbidden` when the actor is neither caller nor receiver.
    pub async fn end(&self, call_id: &str, actor: &str) -> Result<CallRecord, RelayError> {
        self.limiter
            .allow(actor, "calls:end", budgets::CALL_END)
            .await?;

        let id = parse_call_id(call_id)?;
        let mut record = self
            .store
            .get_call(id)
            .await?
            .ok_or(RelayError::NotFound("Call"))?;

        if actor != record.caller_id && actor != record.receiver_id {
            return Err(RelayError::Forbidden("Not authorized to end this call"));
        }

        if record.status != CallStatus::Ended {
            let ended_at = Utc::now();
            let duration = record
                .answered_at
                .map(|answered| (ended_at - answered).num_seconds())
                .unwrap_or(0);
            self.store
                .update_call(
                    id,
                    CallUpdate {
                        status: Some(CallStatus::Ended),
                        ended_at: Some(ended_at),
                        duration: Some(duration),
                        ..CallUpdate::default()
                    },
                )
                .await?;
            record.status = CallStatus::Ended;
            record.ended_at = Some(ended_at);
            record.duration = Some(duration);
            info!(call_id = %call_id, actor = %actor, duration = duration, "Call ended");
        }

        let snapshot = CallSnapshot::from_record(&record);
        self.refresh_snapshot(&snapshot, TTL_ENDED_SECS).await;
        let counterparty = if actor == record.caller_id {
            record.receiver_id.clone()
        } else {
            record.caller_id.clone()
        };
        self.publish_transition(actor, &counterparty, &snapshot, "end")
            .await;

        Ok(record)
    }

    /// Read current call state. Prefers the ephemeral snapshot; on a miss,
    /// reconstructs from the durable record.
    ///
    /// # Errors
    ///
    /// `Forbidden` unless the actor is caller or receiver, regardless of
    /// whether the snapshot exists.
    pub async fn status(&self, call_id: &str, actor: &str) -> Result<CallSnapshot, RelayError> {
        self.limiter
            .allow(actor, "calls:status", budgets::CALL_STATUS)
            .await?;

        let snapshot = match self.cache.get(call_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                let id = parse_call_id(call_id)?;
                let record = self
                    .store
                    .get_call(id)
                    .await?
                    .ok_or(RelayError::NotFound("Call"))?;
                CallSnapshot::from_record(&record)
            }
            Err(e) => {
                // Cache is best-effort on reads too; fall through to the
                // source of truth.
                warn!(call_id = %call_id, error = %e, "Snapshot read failed");
                let id = parse_call_id(call_id)?;
                let record = self
                    .store
                    .get_call(id)
                    .await?
                    .ok_or(RelayError::NotFound("Call"))?;
                CallSnapshot::from_record(&record)
            }
        };

        if !snapshot.is_party(actor) {
            return Err(RelayError::Forbidden("Not authorized to view this call"));
        }

        Ok(snapshot)
    }

    /// Recent call history for a subject, newest first.
    ///
    /// # Errors
    ///
    /// Returns a durable-store fault.
    pub async fn history(&self, subject: &str) -> Result<Vec<CallRecord>, RelayError> {
        self.store.list_calls(subject, HISTORY_LIMIT).await
    }

    /// Best-effort snapshot refresh; a failure never rolls back the durable
    /// transition.
    async fn refresh_snapshot(&self, snapshot: &CallSnapshot, ttl_secs: u64) {
        if let Err(e) = self.cache.put(&snapshot.call_id, snapshot, ttl_secs).await {
            warn!(call_id = %snapshot.call_id, error = %e, "Snapshot refresh failed");
        }
    }

    /// Best-effort membership indexing for both participants.
    async fn index_participants(&self, snapshot: &CallSnapshot, ttl_secs: u64) {
        for subject in [&snapshot.caller_id, &snapshot.receiver_id] {
            if let Err(e) = self.cache.index(subject, &snapshot.call_id, ttl_secs).await {
                warn!(subject = %subject, call_id = %snapshot.call_id, error = %e, "Call index update failed");
            }
        }
    }

    /// Best-effort signaling fan-out to the counterparty's call channel.
    async fn publish_transition(
        &self,
        actor: &str,
        counterparty: &str,
        snapshot: &CallSnapshot,
        transition: &str,
    ) {
        let event = ServerEvent::Signal {
            from: actor.to_string(),
            call_id: Some(serde_json::Value::String(snapshot.call_id.clone())),
            signal_type: Some(transition.to_string()),
            payload: serde_json::to_value(snapshot).ok(),
        };
        let payload = match codec::encode(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(call_id = %snapshot.call_id, error = %e, "Failed to encode call event");
                return;
            }
        };
        if let Err(e) = self
            .bus
            .publish(&channels::call(counterparty), &payload)
            .await
        {
            warn!(call_id = %snapshot.call_id, error = %e, "Call event publish failed");
        }
    }
}

fn parse_call_id(call_id: &str) -> Result<Uuid, RelayError> {
    Uuid::parse_str(call_id).map_err(|_| RelayError::Unprocessable("call_id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBus, MemoryCallStore, MemoryCounterStore, MemorySnapshotCache};
    use chrono::Duration;

    struct Harness {
        service: CallSignalingService,
        store: Arc<MemoryCallStore>,
        bus: Arc<MemoryBus>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryCallStore::new());
        let bus = Arc::new(MemoryBus::new());
        let service = CallSignalingService::new(
            store.clone(),
            Arc::new(MemorySnapshotCache::new()),
            bus.clone(),
            RateLimiter::new(Arc::new(MemoryCounterStore::new())),
        );
        Harness { service, store, bus }
    }

    #[tokio::test]
    async fn test_initiate_then_status() {
        let h = harness();
        let record = h.service.initiate("a", "b", CallKind::Voice).await.unwrap();

        let snapshot = h
            .service
            .status(&record.id.to_string(), "a")
            .await
            .unwrap();
        assert_eq!(snapshot.status, CallStatus::Initiated);
        assert_eq!(snapshot.duration, None);
        assert_eq!(snapshot.kind, CallKind::Voice);
        assert_eq!(snapshot.channel, format!("events:call:{}", record.id));
    }

    #[tokio::test]
    async fn test_answer_transitions_to_answered() {
        let h = harness();
        let record = h.service.initiate("a", "b", CallKind::Video).await.unwrap();
        let call_id = record.id.to_string();

        h.service.answer(&call_id, "b").await.unwrap();
        let snapshot = h.service.status(&call_id, "b").await.unwrap();
        assert_eq!(snapshot.status, CallStatus::Answered);
        assert!(snapshot.answered_at.is_some());
    }

    #[tokio::test]
    async fn test_answer_by_non_receiver_forbidden() {
        let h = harness();
        let record = h.service.initiate("a", "b", CallKind::Voice).await.unwrap();
        let call_id = record.id.to_string();

        for actor in ["a", "c"] {
            assert!(matches!(
                h.service.answer(&call_id, actor).await,
                Err(RelayError::Forbidden(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_answer_after_end_conflicts() {
        let h = harness();
        let record = h.service.initiate("a", "b", CallKind::Voice).await.unwrap();
        let call_id = record.id.to_string();

        h.service.end(&call_id, "a").await.unwrap();
        assert!(matches!(
            h.service.answer(&call_id, "b").await,
            Err(RelayError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_end_computes_duration_and_is_idempotent() {
        let h = harness();
        let record = h.service.initiate("a", "b", CallKind::Voice).await.unwrap();
        let call_id = record.id.to_string();
        h.service.answer(&call_id, "b").await.unwrap();

        // Backdate the answer by five seconds instead of sleeping.
        h.store
            .update_call(
                record.id,
                CallUpdate {
                    answered_at: Some(Utc::now() - Duration::seconds(5)),
                    ..CallUpdate::default()
                },
            )
            .await
            .unwrap();

        let ended = h.service.end(&call_id, "a").await.unwrap();
        let duration = ended.duration.unwrap();
        assert!((5..=6).contains(&duration), "duration was {duration}");

        // Second end is a no-op returning the same duration.
        let again = h.service.end(&call_id, "b").await.unwrap();
        assert_eq!(again.status, CallStatus::Ended);
        assert_eq!(again.duration, Some(duration));
    }

    #[tokio::test]
    async fn test_end_without_answer_has_zero_duration() {
        let h = harness();
        let record = h.service.initiate("a", "b", CallKind::Voice).await.unwrap();
        let ended = h.service.end(&record.id.to_string(), "b").await.unwrap();
        assert_eq!(ended.duration, Some(0));
    }

    #[tokio::test]
    async fn test_end_by_third_party_forbidden() {
        let h = harness();
        let record = h.service.initiate("a", "b", CallKind::Voice).await.unwrap();
        assert!(matches!(
            h.service.end(&record.id.to_string(), "c").await,
            Err(RelayError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_status_by_third_party_forbidden() {
        let h = harness();
        let record = h.service.initiate("a", "b", CallKind::Voice).await.unwrap();
        let call_id = record.id.to_string();

        // With the snapshot warm.
        assert!(matches!(
            h.service.status(&call_id, "c").await,
            Err(RelayError::Forbidden(_))
        ));

        // And on a cache miss, reconstructing from the durable record.
        let cold = CallSignalingService::new(
            h.store.clone(),
            Arc::new(MemorySnapshotCache::new()),
            h.bus.clone(),
            RateLimiter::new(Arc::new(MemoryCounterStore::new())),
        );
        assert!(matches!(
            cold.status(&call_id, "c").await,
            Err(RelayError::Forbidden(_))
        ));
        // A party still reads through the miss.
        assert_eq!(
            cold.status(&call_id, "a").await.unwrap().status,
            CallStatus::Initiated
        );
    }

    #[tokio::test]
    async fn test_malformed_call_id_unprocessable() {
        let h = harness();
        assert!(matches!(
            h.service.answer("not-a-uuid", "b").await,
            Err(RelayError::Unprocessable(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_call_not_found() {
        let h = harness();
        let missing = Uuid::new_v4().to_string();
        assert!(matches!(
            h.service.answer(&missing, "b").await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_initiate_publishes_signal_to_receiver() {
        let h = harness();
        let mut sub = h
            .bus
            .subscribe(&["events:call:b".to_string()])
            .await
            .unwrap();

        let record = h.service.initiate("a", "b", CallKind::Voice).await.unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.channel, "events:call:b");
        let event = courier_protocol::codec::decode_lenient(&msg.payload);
        match event {
            ServerEvent::Signal {
                from,
                call_id,
                signal_type,
                payload,
            } => {
                assert_eq!(from, "a");
                assert_eq!(call_id.unwrap(), record.id.to_string());
                assert_eq!(signal_type.as_deref(), Some("initiate"));
                assert_eq!(payload.unwrap()["status"], "initiated");
            }
            other => panic!("Expected Signal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let h = harness();
        let first = h.service.initiate("a", "b", CallKind::Voice).await.unwrap();
        // Push the first call into the past so ordering is deterministic.
        h.store
            .update_call_started_at(first.id, Utc::now() - Duration::seconds(60));
        let second = h.service.initiate("a", "c", CallKind::Video).await.unwrap();

        let history = h.service.history("a").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.id);
        assert_eq!(history[1].id, first.id);

        // b only participated in the first call.
        assert_eq!(h.service.history("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_initiate_rate_limited() {
        let h = harness();
        for _ in 0..10 {
            h.service.initiate("a", "b", CallKind::Voice).await.unwrap();
        }
        assert!(matches!(
            h.service.initiate("a", "b", CallKind::Voice).await,
            Err(RelayError::RateLimited { .. })
        ));
    }
}
