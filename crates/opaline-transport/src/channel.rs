//! Per-peer channel state.
//!
//! A channel exists per peer pair and direction: the send side numbers and
//! retries outgoing payloads, the receive side enforces in-order,
//! exactly-once delivery. Sequence numbers are strictly increasing per
//! channel and occupy one numbering space across session changes: a new
//! session re-bases the sender on the receiver's reported last-delivered
//! number instead of starting over, so nothing is re-delivered and nothing
//! is skipped.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use opaline_types::NodeId;

// ============================================================================
// Channel Coordinates
// ============================================================================

/// Position of a data frame within a channel.
///
/// Zero is never carried by a data frame; it is the "nothing delivered yet"
/// acknowledgement baseline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SeqNum(u32);

impl SeqNum {
    /// The baseline before any delivery.
    pub const ZERO: Self = Self(0);

    /// Creates a sequence number.
    pub const fn new(seq: u32) -> Self {
        Self(seq)
    }

    /// Returns the raw number.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the next sequence number.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for SeqNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one incarnation of a peer's receive channel.
///
/// Allocated monotonically by the receiving side; a receiver that has lost
/// its state allocates a fresh identifier, which is how senders find out
/// their old session is gone.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SessionId(u32);

impl SessionId {
    /// Creates a session identifier.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

// ============================================================================
// Send Side
// ============================================================================

/// A payload waiting for a session.
///
/// `old_seq` is set when the payload already travelled under a previous
/// session: after the handshake reports the peer's last delivered number,
/// entries at or below it are discarded instead of re-delivered.
#[derive(Debug, Clone)]
pub(crate) struct PendingSend {
    pub old_seq: Option<SeqNum>,
    pub payload: Vec<u8>,
}

/// An in-flight data frame awaiting acknowledgement.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub payload: Vec<u8>,
    /// Retransmissions performed so far.
    pub retries: u32,
}

/// Send half of a channel to one peer.
#[derive(Debug, Clone, Default)]
pub(crate) struct SendChannel {
    /// Established session, if any.
    pub session: Option<SessionId>,
    /// True while a `SessionEstablish` is outstanding.
    pub handshake_inflight: bool,
    /// Last sequence number assigned.
    pub last_assigned: SeqNum,
    /// Unacknowledged frames by sequence number.
    pub in_flight: BTreeMap<SeqNum, InFlight>,
    /// Payloads queued until a session exists.
    pub pending: VecDeque<PendingSend>,
}

impl SendChannel {
    /// Tears the session down, preserving every possibly-undelivered
    /// payload at the front of the pending queue in sequence order.
    pub fn demote_to_pending(&mut self) {
        let mut requeued: VecDeque<PendingSend> = self
            .in_flight
            .iter()
            .map(|(seq, frame)| PendingSend {
                old_seq: Some(*seq),
                payload: frame.payload.clone(),
            })
            .collect();
        requeued.append(&mut self.pending);
        self.pending = requeued;
        self.in_flight.clear();
        self.session = None;
    }
}

// ============================================================================
// Receive Side
// ============================================================================

/// Receive half of a channel from one peer.
#[derive(Debug, Clone)]
pub(crate) struct RecvChannel {
    /// Session this receiver granted to the peer.
    pub session: SessionId,
    /// Highest sequence number delivered to the application.
    pub last_delivered: SeqNum,
    /// Frames received ahead of the next expected sequence number.
    pub buffered: BTreeMap<SeqNum, Vec<u8>>,
}

impl RecvChannel {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            last_delivered: SeqNum::ZERO,
            buffered: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Persisted Channel Table
// ============================================================================

/// One peer's persisted receive state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RecvRecord {
    pub peer: NodeId,
    pub session: SessionId,
    pub last_delivered: SeqNum,
}

/// Durable snapshot of session continuity state.
///
/// Full-rewrite file: replaced as a whole on every session allocation and
/// sequence advance. Only what a restarted node must not forget is here —
/// the receive side's granted sessions and delivery positions, and the
/// session allocation counter. Send-side state is deliberately absent: a
/// restarted sender re-handshakes, and the peer's reported last-delivered
/// number re-bases it exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ChannelTable {
    /// Next session identifier to allocate.
    pub next_session: u32,
    /// Receive channels by peer.
    pub recv: Vec<RecvRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_num_ordering_and_next() {
        assert!(SeqNum::ZERO < SeqNum::new(1));
        assert_eq!(SeqNum::new(4).next(), SeqNum::new(5));
    }

    #[test]
    fn demote_preserves_order_and_old_seqs() {
        let mut channel = SendChannel {
            session: Some(SessionId::new(3)),
            ..SendChannel::default()
        };
        channel.in_flight.insert(
            SeqNum::new(5),
            InFlight {
                payload: b"five".to_vec(),
                retries: 2,
            },
        );
        channel.in_flight.insert(
            SeqNum::new(4),
            InFlight {
                payload: b"four".to_vec(),
                retries: 0,
            },
        );
        channel.pending.push_back(PendingSend {
            old_seq: None,
            payload: b"queued".to_vec(),
        });

        channel.demote_to_pending();

        assert!(channel.session.is_none());
        assert!(channel.in_flight.is_empty());
        let seqs: Vec<_> = channel.pending.iter().map(|p| p.old_seq).collect();
        assert_eq!(
            seqs,
            vec![Some(SeqNum::new(4)), Some(SeqNum::new(5)), None],
            "in-flight frames come first, in sequence order, then queued"
        );
    }
}
