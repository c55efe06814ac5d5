//! # courier-core
//!
//! Connection registry, cross-process fan-out, rate limiting, admission
//! control and call signaling for the Courier realtime chat relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **ConnectionRegistry** - Per-process map of subject to live sockets
//! - **PubSubBridge** - Cross-process delivery over a pub/sub medium
//! - **RateLimiter** - Fixed-window per-subject, per-action budgets
//! - **TokenGate** - Credential verification and revocation checks
//! - **EventRouter** - Typed dispatch of inbound socket frames
//! - **CallSignalingService** - Call state machine with durable + cached state
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌─────────────┐    ┌──────────────────┐
//! │   Socket   │───▶│ EventRouter │───▶│ConnectionRegistry│
//! └────────────┘    └─────────────┘    └──────────────────┘
//!                          │                     ▲
//!                          ▼                     │
//!                   ┌─────────────┐      ┌──────────────┐
//!                   │  EventBus   │─────▶│ PubSubBridge │
//!                   └─────────────┘      └──────────────┘
//! ```
//!
//! External collaborators (the pub/sub medium, the rate-limit counter store,
//! the durable call store, the snapshot cache and the revocation set) are
//! trait objects injected by the server crate; in-memory implementations in
//! [`memory`] back the test suite and single-process deployments.

pub mod auth;
pub mod bridge;
pub mod bus;
pub mod calls;
pub mod error;
pub mod limiter;
pub mod memory;
pub mod registry;
pub mod router;

pub use auth::{Claims, RevocationStore, TokenGate};
pub use bridge::PubSubBridge;
pub use bus::{BusMessage, BusSubscription, EventBus};
pub use calls::{
    CallKind, CallRecord, CallSignalingService, CallSnapshot, CallStatus, CallStore, CallUpdate,
    SnapshotCache,
};
pub use error::RelayError;
pub use limiter::{Budget, CounterStore, RateLimiter};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use router::EventRouter;
