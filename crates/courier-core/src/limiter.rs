//! Per-subject, per-action rate limiting.
//!
//! Fixed-window counters backed by an external atomic counter store. The
//! first increment of a window sets its expiry; exceeding the limit raises
//! [`RelayError::RateLimited`] with the remaining window as a retry hint.
//!
//! The limiter fails open: if the counter store itself is unreachable the
//! action proceeds and the fault is only logged. Availability of the relay
//! outweighs abuse protection during infra outages.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::RelayError;

/// A fixed `(limit, window)` budget for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    /// Maximum allowed calls per window.
    pub limit: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl Budget {
    /// Create a budget.
    #[must_use]
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }
}

/// Per-action budgets for the socket protocol and the call lifecycle.
pub mod budgets {
    use super::Budget;

    pub const PING: Budget = Budget::new(30, 30);
    pub const TYPING: Budget = Budget::new(120, 60);
    pub const READ_RECEIPT: Budget = Budget::new(240, 60);
    pub const SIGNAL: Budget = Budget::new(240, 60);
    pub const PARTY: Budget = Budget::new(240, 60);
    pub const MESSAGE: Budget = Budget::new(240, 60);
    /// Generic throttle applied to every received frame.
    pub const RECEIVE: Budget = Budget::new(300, 60);

    pub const CALL_INITIATE: Budget = Budget::new(10, 30);
    pub const CALL_ANSWER: Budget = Budget::new(30, 60);
    pub const CALL_END: Budget = Budget::new(30, 60);
    pub const CALL_STATUS: Budget = Budget::new(60, 60);
}

/// External atomic counter store (Redis in production).
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment a counter, returning the new count.
    async fn increment(&self, key: &str) -> Result<i64, RelayError>;

    /// Set a counter's expiry, in seconds from now.
    async fn expire(&self, key: &str, seconds: u64) -> Result<(), RelayError>;

    /// Remaining time to live for a key, in seconds. Negative when the key
    /// has no expiry or does not exist.
    async fn ttl(&self, key: &str) -> Result<i64, RelayError>;
}

/// Fixed-window rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    /// Create a limiter over a counter store.
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Check and consume one unit of a subject's budget for an action.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::RateLimited`] once the count for the current
    /// window exceeds the budget's limit. Counter-store faults are logged
    /// and the action allowed.
    pub async fn allow(&self, subject: &str, action: &str, budget: Budget) -> Result<(), RelayError> {
        let key = format!("rl:{subject}:{action}");

        let count = match self.store.increment(&key).await {
            Ok(count) => count,
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limiter store error, failing open");
                return Ok(());
            }
        };

        if count == 1 {
            if let Err(e) = self.store.expire(&key, budget.window_secs).await {
                warn!(key = %key, error = %e, "Failed to set rate limit window");
            }
        }

        if count > i64::from(budget.limit) {
            let retry_after = match self.store.ttl(&key).await {
                Ok(ttl) if ttl > 0 => ttl as u64,
                _ => budget.window_secs,
            };
            return Err(RelayError::RateLimited { retry_after });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCounterStore;
    use std::time::Duration;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryCounterStore::new()))
    }

    #[tokio::test]
    async fn test_allows_up_to_limit() {
        let limiter = limiter();
        let budget = Budget::new(3, 60);

        for _ in 0..3 {
            limiter.allow("u1", "ws:ping", budget).await.unwrap();
        }
        match limiter.allow("u1", "ws:ping", budget).await {
            Err(RelayError::RateLimited { retry_after }) => {
                assert!(retry_after > 0 && retry_after <= 60);
            }
            other => panic!("Expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_budgets_are_independent() {
        let limiter = limiter();
        let budget = Budget::new(1, 60);

        limiter.allow("u1", "ws:ping", budget).await.unwrap();
        // Different action and different subject still have headroom.
        limiter.allow("u1", "ws:typing", budget).await.unwrap();
        limiter.allow("u2", "ws:ping", budget).await.unwrap();
        assert!(limiter.allow("u1", "ws:ping", budget).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_resets_count() {
        let limiter = limiter();
        let budget = Budget::new(2, 30);

        limiter.allow("u1", "ws:read", budget).await.unwrap();
        limiter.allow("u1", "ws:read", budget).await.unwrap();
        assert!(limiter.allow("u1", "ws:read", budget).await.is_err());

        tokio::time::advance(Duration::from_secs(31)).await;

        // Fresh window behaves as call #1.
        limiter.allow("u1", "ws:read", budget).await.unwrap();
        limiter.allow("u1", "ws:read", budget).await.unwrap();
        assert!(limiter.allow("u1", "ws:read", budget).await.is_err());
    }

    #[tokio::test]
    async fn test_fails_open_on_store_error() {
        struct BrokenStore;

        #[async_trait]
        impl CounterStore for BrokenStore {
            async fn increment(&self, _key: &str) -> Result<i64, RelayError> {
                Err(RelayError::Store("connection refused".to_string()))
            }
            async fn expire(&self, _key: &str, _seconds: u64) -> Result<(), RelayError> {
                Err(RelayError::Store("connection refused".to_string()))
            }
            async fn ttl(&self, _key: &str) -> Result<i64, RelayError> {
                Err(RelayError::Store("connection refused".to_string()))
            }
        }

        let limiter = RateLimiter::new(Arc::new(BrokenStore));
        limiter
            .allow("u1", "ws:ping", Budget::new(1, 30))
            .await
            .unwrap();
    }
}
