//! Lightweight leader election.
//!
//! An election is a single broadcast round: every member replies with a
//! self-nomination carrying the highest instance it knows to be chosen.
//! Once a majority of replies for the current round is in, the nominee
//! with the largest instance wins, larger node ID breaking ties. A round
//! that times out first is reported inconclusive and the caller decides
//! whether to retry.

use std::collections::HashMap;

use tracing::debug;

use opaline_types::NodeId;

use crate::types::{Instance, RoundVersion};

/// The outcome of an election round: a winner, or `None` when the round
/// timed out before a majority replied.
pub type ElectionOutcome = Option<NodeId>;

#[derive(Debug, Clone)]
struct ActiveRound {
    round: RoundVersion,
    /// Nomination per replying member: (highest chosen instance, nominee).
    replies: HashMap<NodeId, (Instance, NodeId)>,
}

/// Tracks at most one election round at a time.
#[derive(Debug, Clone)]
pub struct Election {
    quorum: usize,
    active: Option<ActiveRound>,
}

impl Election {
    /// Creates an idle election tracker.
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum,
            active: None,
        }
    }

    /// Opens a round. A round already in flight is superseded; its late
    /// replies carry the old round number and are dropped.
    pub fn start(&mut self, round: RoundVersion) {
        debug!(%round, "election started");
        self.active = Some(ActiveRound {
            round,
            replies: HashMap::new(),
        });
    }

    /// Tallies one reply; returns the outcome once a majority is in.
    pub fn on_reply(
        &mut self,
        from: NodeId,
        round: RoundVersion,
        highest: Instance,
    ) -> Option<ElectionOutcome> {
        let Some(active) = self.active.as_mut() else {
            return None;
        };
        if active.round != round {
            debug!(%from, %round, current = %active.round, "stale election reply");
            return None;
        }

        active.replies.insert(from, (highest, from));
        if active.replies.len() < self.quorum {
            return None;
        }

        // Largest known instance wins; larger ID breaks ties. (Instance,
        // NodeId) tuple order gives exactly that.
        let winner = active
            .replies
            .values()
            .max()
            .map(|(_, nominee)| *nominee);
        self.active = None;
        debug!(winner = ?winner, "election decided");
        Some(winner)
    }

    /// Handles the round timeout; returns `Some(None)` (inconclusive) if
    /// the round it was armed for is still open.
    pub fn on_timeout(&mut self, round: RoundVersion) -> Option<ElectionOutcome> {
        match &self.active {
            Some(active) if active.round == round => {
                debug!(%round, "election inconclusive");
                self.active = None;
                Some(None)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUND: RoundVersion = RoundVersion::from_u32(5);

    fn node(id: u8) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn majority_elects_the_largest_instance_nominee() {
        let mut election = Election::new(2);
        election.start(ROUND);

        assert!(election.on_reply(node(0), ROUND, Instance::new(3)).is_none());
        let outcome = election.on_reply(node(1), ROUND, Instance::new(9));
        assert_eq!(outcome, Some(Some(node(1))));
    }

    #[test]
    fn equal_instances_tie_break_by_larger_node_id() {
        let mut election = Election::new(3);
        election.start(ROUND);

        election.on_reply(node(0), ROUND, Instance::new(4));
        election.on_reply(node(2), ROUND, Instance::new(4));
        let outcome = election.on_reply(node(1), ROUND, Instance::new(4));
        assert_eq!(outcome, Some(Some(node(2))));
    }

    #[test]
    fn stale_round_replies_are_dropped() {
        let mut election = Election::new(2);
        election.start(ROUND);
        election.start(ROUND.next());

        assert!(election.on_reply(node(0), ROUND, Instance::new(9)).is_none());
        assert!(election
            .on_reply(node(0), ROUND.next(), Instance::new(1))
            .is_none());
        let outcome = election.on_reply(node(1), ROUND.next(), Instance::new(2));
        assert_eq!(outcome, Some(Some(node(1))));
    }

    #[test]
    fn timeout_before_majority_is_inconclusive() {
        let mut election = Election::new(3);
        election.start(ROUND);
        election.on_reply(node(0), ROUND, Instance::new(1));

        assert_eq!(election.on_timeout(ROUND), Some(None));
        // The round is closed; a late reply changes nothing.
        assert!(election.on_reply(node(1), ROUND, Instance::new(2)).is_none());
    }

    #[test]
    fn timeout_for_a_superseded_round_is_ignored() {
        let mut election = Election::new(2);
        election.start(ROUND);
        election.start(ROUND.next());

        assert!(election.on_timeout(ROUND).is_none());
        let outcome = election.on_reply(node(0), ROUND.next(), Instance::new(0));
        assert!(outcome.is_none());
    }

    #[test]
    fn duplicate_replies_count_once() {
        let mut election = Election::new(2);
        election.start(ROUND);

        assert!(election.on_reply(node(0), ROUND, Instance::new(3)).is_none());
        assert!(election.on_reply(node(0), ROUND, Instance::new(3)).is_none());
    }
}
