//! Consensus-layer numerics.

use serde::{Deserialize, Serialize};

use opaline_types::NodeId;

/// One decision slot in the global ordered sequence of chosen values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Instance(u32);

impl Instance {
    /// The first decision slot.
    pub const ZERO: Self = Self(0);

    /// Creates an instance number.
    pub const fn new(instance: u32) -> Self {
        Self(instance)
    }

    /// Returns the raw number.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the following instance.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// Per-instance tie-breaker between competing proposers.
///
/// Encoded `prepare_round << 8 | node_id`, so numbers minted by distinct
/// proposers never collide and raising the round always produces a number
/// strictly above everything seen. Zero means "no proposal".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ProposalNumber(u32);

impl ProposalNumber {
    /// The "no proposal yet" sentinel.
    pub const NONE: Self = Self(0);

    /// Reconstructs a proposal number from its wire encoding.
    pub const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the wire encoding.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// First proposal number a given proposer uses for a fresh instance.
    pub const fn initial(proposer: NodeId) -> Self {
        Self((1 << 8) | proposer.as_u8() as u32)
    }

    /// Smallest proposal number owned by `proposer` that is strictly
    /// greater than `self`.
    pub const fn next_above(self, proposer: NodeId) -> Self {
        Self(((self.0 >> 8) + 1) << 8 | proposer.as_u8() as u32)
    }

    /// The proposer that minted this number.
    pub const fn proposer(self) -> NodeId {
        NodeId::new((self.0 & 0xFF) as u8)
    }
}

impl std::fmt::Display for ProposalNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            write!(f, "p-none")
        } else {
            write!(f, "p{}.{}", self.0 >> 8, self.0 & 0xFF)
        }
    }
}

/// Per-node monotonic round counter, persisted across restarts.
///
/// Every new prepare round and every election bumps it; replies echo the
/// round they answer, so a reply from a superseded round is recognizably
/// stale and dropped rather than double-counted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RoundVersion(u32);

impl RoundVersion {
    /// Reconstructs a round from its wire encoding.
    pub const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the wire encoding.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the following round.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for RoundVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}
