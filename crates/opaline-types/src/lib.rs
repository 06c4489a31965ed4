//! Core type definitions shared across the Opaline crates.
//!
//! These are deliberately small: node identity, value identity, and the
//! quorum arithmetic every layer agrees on. Protocol-specific numerics
//! (instances, proposal numbers, sequence numbers) live with the layer that
//! owns them.

use serde::{Deserialize, Serialize};

// ============================================================================
// Node Identity
// ============================================================================

/// Identifies a node within a cluster.
///
/// Node IDs double as network addresses in the simulated network: the
/// harness routes a datagram to the node with the matching ID. IDs are
/// assigned by cluster configuration and never change for the lifetime of
/// the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(u8);

impl NodeId {
    /// Creates a node ID.
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// Returns the raw ID.
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns the ID as a usize (for indexing).
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

// ============================================================================
// Value Identity
// ============================================================================

/// Content identity of an opaque proposed value.
///
/// Derived by hashing the value bytes with BLAKE3, so identical bytes always
/// produce the identical ID. The consensus layer uses this to detect
/// idempotent re-proposals of the same value under a new proposal number and
/// to tally recovery responses without comparing full payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueId([u8; 32]);

impl ValueId {
    /// Computes the identity of a value.
    pub fn of(value: &[u8]) -> Self {
        Self(*blake3::hash(value).as_bytes())
    }

    /// Returns the raw hash bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 4 bytes are plenty for log lines.
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

// ============================================================================
// Quorum Arithmetic
// ============================================================================

/// Returns the majority quorum size for a cluster of `cluster_size` nodes.
///
/// More than half: 3 → 2, 5 → 3, 7 → 4.
///
/// # Panics
///
/// Panics if `cluster_size` is zero.
pub const fn quorum_size(cluster_size: usize) -> usize {
    assert!(cluster_size > 0, "cluster size must be positive");
    cluster_size / 2 + 1
}
