//! Error taxonomy for the relay.
//!
//! Admission-time faults terminate the connection attempt; per-event faults
//! are handled locally by dropping the offending event. Best-effort side
//! channels (publish, snapshot refresh) log their own failures and never
//! surface here.

use thiserror::Error;

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad, expired, wrong-purpose or revoked credential.
    #[error("Unauthorized")]
    Unauthorized,

    /// Per-subject action budget exceeded.
    #[error("Rate limit exceeded. Try again in {retry_after} seconds.")]
    RateLimited {
        /// Remaining window, in seconds.
        retry_after: u64,
    },

    /// Referenced call or entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Actor is not a party to the call or action.
    #[error("{0}")]
    Forbidden(&'static str),

    /// Invalid state transition.
    #[error("{0}")]
    Conflict(&'static str),

    /// Malformed identifier.
    #[error("Invalid {0}")]
    Unprocessable(&'static str),

    /// Required external dependency unreachable at admission time.
    #[error("{0} not available")]
    Unavailable(&'static str),

    /// Backing store failure on the primary (durable) path.
    #[error("Storage error: {0}")]
    Store(String),
}
