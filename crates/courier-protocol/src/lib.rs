//! # courier-protocol
//!
//! Wire protocol definitions for the Courier realtime chat relay.
//!
//! This crate defines the JSON event protocol spoken between clients and
//! servers, and the channel naming convention used on the cross-process
//! pub/sub medium:
//!
//! - **ClientEvent** - Inbound socket frames (ping, typing, read receipts,
//!   call signaling, party sync, message notifications)
//! - **ServerEvent** - Outbound frames pushed to a subject's devices
//! - **codec** - Compact JSON encoding with a lenient decode fallback
//! - **channels** - Bit-exact channel names (`events:<category>:<subject>`)
//!
//! Events are closed tagged unions discriminated by a `type` field, so an
//! unhandled kind is a compile error rather than a silently dropped dict key.

pub mod channels;
pub mod codec;
pub mod events;

pub use codec::ProtocolError;
pub use events::{ClientEvent, ServerEvent};
