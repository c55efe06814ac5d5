//! Durable call storage on SQLite.
//!
//! The connection is serialized behind a mutex; call-record traffic is a few
//! writes per call lifecycle, far below the point where that becomes a
//! bottleneck. Timestamps are stored as RFC 3339 text in UTC.

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use courier_core::calls::{CallKind, CallRecord, CallStatus, CallStore, CallUpdate};
use courier_core::error::RelayError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS calls (
    id          TEXT PRIMARY KEY,
    caller_id   TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    call_type   TEXT NOT NULL,
    status      TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    answered_at TEXT,
    ended_at    TEXT,
    duration    INTEGER
);
CREATE INDEX IF NOT EXISTS idx_calls_caller ON calls (caller_id, started_at);
CREATE INDEX IF NOT EXISTS idx_calls_receiver ON calls (receiver_id, started_at);
";

fn store_err(e: rusqlite::Error) -> RelayError {
    RelayError::Store(e.to_string())
}

/// SQLite-backed [`CallStore`].
pub struct SqliteCallStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCallStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &str) -> Result<Self, RelayError> {
        let conn = Connection::open(path).map_err(store_err)?;
        Self::with_connection(conn)
    }

    /// Build a store over an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, RelayError> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, RelayError> {
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, RelayError> {
        self.conn
            .lock()
            .map_err(|_| RelayError::Store("database lock poisoned".to_string()))
    }
}

fn status_str(status: CallStatus) -> &'static str {
    match status {
        CallStatus::Initiated => "initiated",
        CallStatus::Answered => "answered",
        CallStatus::Ended => "ended",
        CallStatus::Declined => "declined",
    }
}

fn parse_status(s: &str) -> Result<CallStatus, rusqlite::Error> {
    match s {
        "initiated" => Ok(CallStatus::Initiated),
        "answered" => Ok(CallStatus::Answered),
        "ended" => Ok(CallStatus::Ended),
        "declined" => Ok(CallStatus::Declined),
        _ => Err(rusqlite::Error::InvalidQuery),
    }
}

fn kind_str(kind: CallKind) -> &'static str {
    match kind {
        CallKind::Voice => "voice",
        CallKind::Video => "video",
    }
}

fn parse_kind(s: &str) -> Result<CallKind, rusqlite::Error> {
    match s {
        "voice" => Ok(CallKind::Voice),
        "video" => Ok(CallKind::Video),
        _ => Err(rusqlite::Error::InvalidQuery),
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::<Utc>::from_str(s).map_err(|_| rusqlite::Error::InvalidQuery)
}

fn row_to_record(row: &Row<'_>) -> Result<CallRecord, rusqlite::Error> {
    let id: String = row.get(0)?;
    let status: String = row.get(4)?;
    let kind: String = row.get(3)?;
    let started_at: String = row.get(5)?;
    let answered_at: Option<String> = row.get(6)?;
    let ended_at: Option<String> = row.get(7)?;
    Ok(CallRecord {
        id: Uuid::parse_str(&id).map_err(|_| rusqlite::Error::InvalidQuery)?,
        caller_id: row.get(1)?,
        receiver_id: row.get(2)?,
        kind: parse_kind(&kind)?,
        status: parse_status(&status)?,
        started_at: parse_timestamp(&started_at)?,
        answered_at: answered_at.as_deref().map(parse_timestamp).transpose()?,
        ended_at: ended_at.as_deref().map(parse_timestamp).transpose()?,
        duration: row.get(8)?,
    })
}

#[async_trait]
impl CallStore for SqliteCallStore {
    async fn create_call(&self, record: &CallRecord) -> Result<(), RelayError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO calls (id, caller_id, receiver_id, call_type, status, started_at, answered_at, ended_at, duration)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id.to_string(),
                record.caller_id,
                record.receiver_id,
                kind_str(record.kind),
                status_str(record.status),
                record.started_at.to_rfc3339(),
                record.answered_at.map(|t| t.to_rfc3339()),
                record.ended_at.map(|t| t.to_rfc3339()),
                record.duration,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_call(&self, id: Uuid) -> Result<Option<CallRecord>, RelayError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, caller_id, receiver_id, call_type, status, started_at, answered_at, ended_at, duration
             FROM calls WHERE id = ?1",
            params![id.to_string()],
            row_to_record,
        )
        .optional()
        .map_err(store_err)
    }

    async fn update_call(&self, id: Uuid, update: CallUpdate) -> Result<(), RelayError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE calls SET
                     status      = COALESCE(?2, status),
                     answered_at = COALESCE(?3, answered_at),
                     ended_at    = COALESCE(?4, ended_at),
                     duration    = COALESCE(?5, duration)
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    update.status.map(status_str),
                    update.answered_at.map(|t| t.to_rfc3339()),
                    update.ended_at.map(|t| t.to_rfc3339()),
                    update.duration,
                ],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(RelayError::NotFound("Call"));
        }
        Ok(())
    }

    async fn list_calls(&self, subject: &str, limit: usize) -> Result<Vec<CallRecord>, RelayError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, caller_id, receiver_id, call_type, status, started_at, answered_at, ended_at, duration
                 FROM calls WHERE caller_id = ?1 OR receiver_id = ?1
                 ORDER BY started_at DESC LIMIT ?2",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![subject, limit as i64], row_to_record)
            .map_err(store_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(caller: &str, receiver: &str) -> CallRecord {
        CallRecord {
            id: Uuid::new_v4(),
            caller_id: caller.to_string(),
            receiver_id: receiver.to_string(),
            kind: CallKind::Voice,
            status: CallStatus::Initiated,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            duration: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = SqliteCallStore::open_in_memory().unwrap();
        let rec = record("a", "b");
        store.create_call(&rec).await.unwrap();

        let read = store.get_call(rec.id).await.unwrap().unwrap();
        assert_eq!(read.caller_id, "a");
        assert_eq!(read.status, CallStatus::Initiated);
        assert_eq!(read.duration, None);
        // Timestamp survives the round-trip to the second.
        assert_eq!(read.started_at.timestamp(), rec.started_at.timestamp());
    }

    #[tokio::test]
    async fn test_update_applies_only_set_fields() {
        let store = SqliteCallStore::open_in_memory().unwrap();
        let rec = record("a", "b");
        store.create_call(&rec).await.unwrap();

        let answered_at = Utc::now();
        store
            .update_call(
                rec.id,
                CallUpdate {
                    status: Some(CallStatus::Answered),
                    answered_at: Some(answered_at),
                    ..CallUpdate::default()
                },
            )
            .await
            .unwrap();

        let read = store.get_call(rec.id).await.unwrap().unwrap();
        assert_eq!(read.status, CallStatus::Answered);
        assert!(read.answered_at.is_some());
        assert!(read.ended_at.is_none());
    }

    #[tokio::test]
    async fn test_update_missing_call_not_found() {
        let store = SqliteCallStore::open_in_memory().unwrap();
        let result = store
            .update_call(
                Uuid::new_v4(),
                CallUpdate {
                    status: Some(CallStatus::Ended),
                    ..CallUpdate::default()
                },
            )
            .await;
        assert!(matches!(result, Err(RelayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_calls_newest_first_with_limit() {
        let store = SqliteCallStore::open_in_memory().unwrap();
        let now = Utc::now();
        for i in 0..5 {
            let mut rec = record("a", "b");
            rec.started_at = now - Duration::seconds(i);
            store.create_call(&rec).await.unwrap();
        }

        let calls = store.list_calls("a", 3).await.unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls.windows(2).all(|w| w[0].started_at >= w[1].started_at));

        // Receiver sees the same calls; a stranger sees none.
        assert_eq!(store.list_calls("b", 10).await.unwrap().len(), 5);
        assert!(store.list_calls("c", 10).await.unwrap().is_empty());
    }
}
