//! Cluster membership and protocol timeouts.

use opaline_types::{quorum_size, NodeId};

/// Fixed cluster membership, passed in at construction.
///
/// Every member runs all three roles (proposer, acceptor, learner).
/// Membership never changes for the lifetime of the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    members: Vec<NodeId>,
}

impl ClusterConfig {
    /// Creates a cluster configuration from its member list.
    ///
    /// # Panics
    ///
    /// Panics if `members` is empty or contains duplicates; membership is
    /// static operator input, not runtime data.
    pub fn new(mut members: Vec<NodeId>) -> Self {
        assert!(!members.is_empty(), "cluster must have at least one member");
        members.sort_unstable();
        let before = members.len();
        members.dedup();
        assert_eq!(before, members.len(), "duplicate cluster member");
        Self { members }
    }

    /// All members, ascending by ID.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Members other than `local`.
    pub fn peers(&self, local: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied().filter(move |m| *m != local)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True when the member list is empty. The constructor rejects that,
    /// so this only exists to pair with [`Self::len`].
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Majority quorum size for this cluster.
    pub fn quorum(&self) -> usize {
        quorum_size(self.members.len())
    }
}

/// Consensus-layer timeouts, in logical time units.
#[derive(Debug, Clone)]
pub struct PaxosConfig {
    /// Delay before an undecided prepare round is re-broadcast.
    pub prepare_timeout: u64,
    /// Delay before an undecided propose round is re-broadcast.
    pub propose_timeout: u64,
    /// Delay between recovery query re-broadcasts for unresolved gaps.
    pub recovery_timeout: u64,
    /// How long an election waits for a majority of replies before it is
    /// reported inconclusive.
    pub election_timeout: u64,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: 500,
            propose_timeout: 500,
            recovery_timeout: 400,
            election_timeout: 600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(n: u8) -> ClusterConfig {
        ClusterConfig::new((0..n).map(NodeId::new).collect())
    }

    #[test]
    fn quorum_matches_majority() {
        assert_eq!(cluster(3).quorum(), 2);
        assert_eq!(cluster(5).quorum(), 3);
    }

    #[test]
    fn len_reports_membership() {
        let config = cluster(3);
        assert_eq!(config.len(), 3);
        assert!(!config.is_empty());
    }

    #[test]
    fn peers_excludes_local() {
        let config = cluster(3);
        let peers: Vec<_> = config.peers(NodeId::new(1)).collect();
        assert_eq!(peers, vec![NodeId::new(0), NodeId::new(2)]);
    }

    #[test]
    #[should_panic(expected = "duplicate cluster member")]
    fn duplicate_members_rejected() {
        ClusterConfig::new(vec![NodeId::new(1), NodeId::new(1)]);
    }
}
