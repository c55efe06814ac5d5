//! Redis-backed implementations of the core backend traits.
//!
//! One Redis deployment serves four concerns: the cross-process pub/sub
//! medium, the rate-limit counters, the ephemeral call snapshot cache, and
//! the token revocation set. Commands run on cheap clones of a
//! [`ConnectionManager`], which reconnects on its own; pub/sub needs a
//! dedicated connection per subscription and gets one from the client.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use courier_core::auth::RevocationStore;
use courier_core::bus::{BusMessage, BusSubscription, EventBus};
use courier_core::calls::{CallSnapshot, SnapshotCache};
use courier_core::error::RelayError;
use courier_core::limiter::CounterStore;

/// Key of the set holding revoked token identifiers.
const REVOCATION_SET: &str = "jwt:blacklist";

fn store_err(e: redis::RedisError) -> RelayError {
    RelayError::Store(e.to_string())
}

/// Shared Redis handles for command traffic and pub/sub.
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisBackend {
    /// Connect and verify the deployment answers a PING.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Unavailable`] if Redis cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(url)
            .map_err(|e| {
                warn!(error = %e, "Invalid Redis URL");
                RelayError::Unavailable("redis")
            })?;
        let mut manager = ConnectionManager::new(client.clone()).await.map_err(|e| {
            warn!(error = %e, "Redis connection failed");
            RelayError::Unavailable("redis")
        })?;
        let _: String = redis::cmd("PING")
            .query_async(&mut manager)
            .await
            .map_err(|e| {
                warn!(error = %e, "Redis ping failed");
                RelayError::Unavailable("redis")
            })?;
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl CounterStore for RedisBackend {
    async fn increment(&self, key: &str) -> Result<i64, RelayError> {
        let mut conn = self.manager.clone();
        conn.incr(key, 1).await.map_err(store_err)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<(), RelayError> {
        let mut conn = self.manager.clone();
        conn.expire::<_, ()>(key, seconds as i64)
            .await
            .map_err(store_err)
    }

    async fn ttl(&self, key: &str) -> Result<i64, RelayError> {
        let mut conn = self.manager.clone();
        conn.ttl(key).await.map_err(store_err)
    }
}

#[async_trait]
impl RevocationStore for RedisBackend {
    async fn is_revoked(&self, token_id: &str) -> Result<bool, RelayError> {
        let mut conn = self.manager.clone();
        conn.sismember(REVOCATION_SET, token_id)
            .await
            .map_err(store_err)
    }
}

#[async_trait]
impl SnapshotCache for RedisBackend {
    async fn put(
        &self,
        call_id: &str,
        snapshot: &CallSnapshot,
        ttl_secs: u64,
    ) -> Result<(), RelayError> {
        let payload =
            serde_json::to_string(snapshot).map_err(|e| RelayError::Store(e.to_string()))?;
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(format!("call:{call_id}"), payload, ttl_secs)
            .await
            .map_err(store_err)
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallSnapshot>, RelayError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .get(format!("call:{call_id}"))
            .await
            .map_err(store_err)?;
        match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(snapshot) => Ok(Some(snapshot)),
                Err(e) => {
                    // A corrupt snapshot reads as a miss; the durable store
                    // remains authoritative.
                    warn!(call_id = %call_id, error = %e, "Discarding malformed call snapshot");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn index(&self, subject: &str, call_id: &str, ttl_secs: u64) -> Result<(), RelayError> {
        let key = format!("user:{subject}:calls");
        let mut conn = self.manager.clone();
        conn.sadd::<_, _, ()>(&key, call_id).await.map_err(store_err)?;
        conn.expire::<_, ()>(&key, ttl_secs as i64)
            .await
            .map_err(store_err)
    }
}

#[async_trait]
impl EventBus for RedisBackend {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), RelayError> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(store_err)
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<BusSubscription, RelayError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
            warn!(error = %e, "Redis pub/sub connection failed");
            RelayError::Unavailable("redis")
        })?;
        for pattern in patterns {
            pubsub.psubscribe(pattern).await.map_err(store_err)?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Non-string pub/sub payload dropped");
                        continue;
                    }
                };
                if tx.send(BusMessage { channel, payload }).is_err() {
                    // Subscription handle dropped; closing the pump drops the
                    // pub/sub connection and with it the subscriptions.
                    break;
                }
            }
            debug!("Pub/sub pump stopped");
        });

        Ok(BusSubscription::new(rx))
    }
}
