//! Reliable, in-order, session-based message delivery over an unreliable
//! datagram network.
//!
//! The network underneath offers no guarantees at all: datagrams may be
//! lost, duplicated, reordered, or delayed arbitrarily, and peers may crash
//! and restart having forgotten everything that was not persisted. This
//! crate rebuilds, per peer pair and direction, the guarantees the layers
//! above rely on:
//!
//! - every payload handed to [`Endpoint::send`] is delivered to the peer's
//!   application **exactly once**, in submission order, or the channel keeps
//!   retrying until the peer is reachable again;
//! - a peer that lost its channel state is detected (expired session) and
//!   the channel re-established without losing or duplicating payloads.
//!
//! The endpoint is a pure state machine: it never touches a socket or a
//! clock. Inputs are `send`, `on_datagram`, and `on_timer`; each returns an
//! [`EndpointOutput`] of datagrams to transmit, payloads to deliver upward,
//! and timers to arm. The caller (the node orchestrator, ultimately the
//! simulation harness) owns all I/O.
//!
//! Session continuity is persisted through [`opaline_storage::Storage`]
//! before any frame that depends on it is sent. A storage failure here is
//! fatal to the node.

mod channel;
mod config;
mod endpoint;
mod error;

pub use channel::{SeqNum, SessionId};
pub use config::TransportConfig;
pub use endpoint::{Datagram, Delivery, Endpoint, EndpointOutput, TransportTimer};
pub use error::TransportError;

/// Storage table holding the per-peer channel table.
pub const CHANNEL_TABLE: &str = "transport/channels";
