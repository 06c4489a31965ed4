//! The proposer: drives Paxos rounds for a stream of candidate values.
//!
//! One instance is actively driven at a time; further candidates queue.
//! Gap recovery runs per unresolved instance and always resolves: a
//! RecoveryChosen verdict settles a gap immediately, a majority agreeing
//! on one reported value short-circuits to a direct propose, and once no
//! value can mathematically still reach a majority the proposer forces a
//! full prepare/propose round seeded with the best-supported (or empty)
//! value. New application values wait until every known gap is resolved.
//!
//! Reject handling raises the proposal number strictly above the highest
//! rejecting promise and re-prepares; there is deliberately no randomized
//! backoff, so two proposers contending forever can livelock. Liveness
//! under contention is best-effort.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use opaline_storage::records::{decode_records, encode_record};
use opaline_storage::Storage;
use opaline_types::{NodeId, ValueId};

use crate::config::{ClusterConfig, PaxosConfig};
use crate::error::FatalError;
use crate::message::{AcceptedValue, ConsensusMessage, Outbound};
use crate::types::{Instance, ProposalNumber, RoundVersion};

/// Round counter, full-rewrite snapshot.
pub const ROUND_TABLE: &str = "paxos/round";

#[derive(Debug, Default, Serialize, Deserialize)]
struct RoundSnapshot {
    round: RoundVersion,
}

/// Timers the proposer asks the node to arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProposerTimer {
    /// Re-broadcast an unanswered prepare round.
    Prepare {
        instance: Instance,
        round: RoundVersion,
    },
    /// Re-broadcast an unanswered propose round.
    Propose {
        instance: Instance,
        round: RoundVersion,
    },
    /// Re-query acceptors for still-unresolved gaps.
    Recovery,
}

/// Messages and timers one proposer step produced.
#[derive(Debug, Default)]
pub struct ProposerOutput {
    pub outbound: Vec<Outbound>,
    pub timers: Vec<(ProposerTimer, u64)>,
}

impl ProposerOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, other: ProposerOutput) {
        self.outbound.extend(other.outbound);
        self.timers.extend(other.timers);
    }
}

#[derive(Debug, Clone)]
enum Phase {
    Idle,
    Preparing {
        instance: Instance,
        proposal: ProposalNumber,
        value: Vec<u8>,
        /// True while `value` is an application candidate from the queue
        /// (as opposed to a recovery seed); a displaced candidate is
        /// re-queued for a later instance.
        from_queue: bool,
        promises: HashMap<NodeId, Option<AcceptedValue>>,
    },
    Proposing {
        instance: Instance,
        proposal: ProposalNumber,
        value: Vec<u8>,
        from_queue: bool,
    },
}

/// How a recovered gap gets settled once its tally is conclusive.
#[derive(Debug, Clone)]
enum Resolution {
    /// A majority reported the same accepted value: propose it directly.
    Direct {
        proposal: ProposalNumber,
        value: Vec<u8>,
    },
    /// No value can still reach a majority: run a full prepare/propose
    /// seeded with the best-supported (possibly empty) value.
    Forced { value: Vec<u8> },
}

#[derive(Debug, Clone, Default)]
struct GapRecovery {
    /// Reply per acceptor: its accepted pair, or `None` for a reject.
    replies: HashMap<NodeId, Option<AcceptedValue>>,
    resolution: Option<Resolution>,
}

/// Drives prepare/propose rounds and gap recovery for one node.
#[derive(Debug, Clone)]
pub struct Proposer {
    local: NodeId,
    cluster: ClusterConfig,
    config: PaxosConfig,
    round: RoundVersion,
    phase: Phase,
    candidates: VecDeque<Vec<u8>>,
    recovering: BTreeMap<Instance, GapRecovery>,
}

impl Proposer {
    /// Creates a proposer with no history.
    pub fn new(local: NodeId, cluster: ClusterConfig, config: PaxosConfig) -> Self {
        Self {
            local,
            cluster,
            config,
            round: RoundVersion::default(),
            phase: Phase::Idle,
            candidates: VecDeque::new(),
            recovering: BTreeMap::new(),
        }
    }

    /// Rebuilds a proposer after restart.
    ///
    /// Only the round counter is durable; everything else is rebuilt via
    /// the recovery protocol, never trusted as previously in memory.
    pub fn restore<S: Storage>(
        local: NodeId,
        cluster: ClusterConfig,
        config: PaxosConfig,
        storage: &S,
    ) -> Result<Self, FatalError> {
        let mut proposer = Self::new(local, cluster, config);
        if let Some(bytes) = storage.read_all(ROUND_TABLE)? {
            let snapshot: RoundSnapshot = decode_records(&bytes)
                .map_err(|e| FatalError::CorruptState {
                    table: ROUND_TABLE.to_string(),
                    reason: e.to_string(),
                })?
                .into_iter()
                .next()
                .unwrap_or_default();
            proposer.round = snapshot.round;
        }
        Ok(proposer)
    }

    /// The current round; election requests share this counter.
    pub fn round(&self) -> RoundVersion {
        self.round
    }

    /// Bumps and persists the round counter.
    pub fn bump_round<S: Storage>(&mut self, storage: &mut S) -> Result<RoundVersion, FatalError> {
        let next = self.round.next();
        let bytes =
            encode_record(&RoundSnapshot { round: next }).map_err(|e| FatalError::CorruptState {
                table: ROUND_TABLE.to_string(),
                reason: e.to_string(),
            })?;
        storage.write_all(ROUND_TABLE, &bytes)?;
        self.round = next;
        Ok(next)
    }

    /// Queues an application value and starts driving it if nothing else
    /// is in flight.
    pub fn propose_value<S: Storage>(
        &mut self,
        storage: &mut S,
        value: Vec<u8>,
        frontier: Instance,
    ) -> Result<ProposerOutput, FatalError> {
        self.candidates.push_back(value);
        self.maybe_start(storage, frontier)
    }

    /// Opens recovery for every instance in `gaps`.
    pub fn start_recovery<S: Storage>(
        &mut self,
        storage: &mut S,
        gaps: Vec<Instance>,
    ) -> Result<ProposerOutput, FatalError> {
        let mut output = ProposerOutput::empty();
        if gaps.is_empty() {
            return Ok(output);
        }

        let round = self.bump_round(storage)?;
        for gap in gaps {
            debug!(instance = %gap, %round, "recovering gap");
            self.recovering.entry(gap).or_default();
            output
                .outbound
                .push(Outbound::Broadcast(ConsensusMessage::Recovery {
                    instance: gap,
                    round,
                }));
        }
        output
            .timers
            .push((ProposerTimer::Recovery, self.config.recovery_timeout));
        Ok(output)
    }

    /// Starts the next piece of work if the proposer is idle: first any
    /// gap whose recovery tally is conclusive, then (once no gaps remain)
    /// the next queued candidate at the chosen-log frontier.
    pub fn maybe_start<S: Storage>(
        &mut self,
        storage: &mut S,
        frontier: Instance,
    ) -> Result<ProposerOutput, FatalError> {
        if !matches!(self.phase, Phase::Idle) {
            return Ok(ProposerOutput::empty());
        }

        let resolved = self
            .recovering
            .iter()
            .find(|(_, gap)| gap.resolution.is_some())
            .map(|(instance, _)| *instance);
        if let Some(instance) = resolved {
            let gap = self.recovering.remove(&instance).unwrap_or_default();
            return match gap.resolution {
                Some(Resolution::Direct { proposal, value }) => {
                    debug!(%instance, %proposal, "gap has majority support, proposing directly");
                    self.phase = Phase::Proposing {
                        instance,
                        proposal,
                        value: value.clone(),
                        from_queue: false,
                    };
                    Ok(self.broadcast_propose(instance, proposal, value))
                }
                Some(Resolution::Forced { value }) => {
                    warn!(%instance, "no recoverable majority, forcing a fresh round");
                    self.start_prepare(storage, instance, ProposalNumber::NONE, value, false)
                }
                None => Ok(ProposerOutput::empty()),
            };
        }

        if self.recovering.is_empty() {
            if let Some(value) = self.candidates.pop_front() {
                return self.start_prepare(storage, frontier, ProposalNumber::NONE, value, true);
            }
        }
        Ok(ProposerOutput::empty())
    }

    /// Tallies a promise; on majority, moves to proposing, adopting the
    /// highest-numbered previously accepted value if any was reported.
    pub fn on_promise(
        &mut self,
        from: NodeId,
        instance: Instance,
        proposal: ProposalNumber,
        round: RoundVersion,
        accepted: Option<AcceptedValue>,
    ) -> ProposerOutput {
        if round != self.round {
            return ProposerOutput::empty();
        }
        let Phase::Preparing {
            instance: active,
            proposal: current,
            value,
            from_queue,
            promises,
        } = &mut self.phase
        else {
            return ProposerOutput::empty();
        };
        if *active != instance || *current != proposal {
            return ProposerOutput::empty();
        }

        promises.insert(from, accepted);
        if promises.len() < self.cluster.quorum() {
            return ProposerOutput::empty();
        }

        // Never invent a new value once any acceptor has accepted one:
        // adopt the highest-numbered reported value.
        let adopted = promises
            .values()
            .flatten()
            .max_by_key(|accepted| accepted.proposal)
            .cloned();
        let (value, from_queue) = match adopted {
            Some(accepted) if ValueId::of(&accepted.value) != ValueId::of(value) => {
                if *from_queue {
                    // Our candidate was displaced; try it again at a
                    // later instance.
                    self.candidates.push_front(value.clone());
                }
                debug!(%instance, adopted = %ValueId::of(&accepted.value), "adopting accepted value");
                (accepted.value, false)
            }
            _ => (std::mem::take(value), *from_queue),
        };

        self.phase = Phase::Proposing {
            instance,
            proposal,
            value: value.clone(),
            from_queue,
        };
        self.broadcast_propose(instance, proposal, value)
    }

    /// Handles a reject of the active round: raise the proposal number
    /// strictly above the rejecting promise and re-prepare.
    pub fn on_reject<S: Storage>(
        &mut self,
        storage: &mut S,
        instance: Instance,
        promised: ProposalNumber,
        round: RoundVersion,
    ) -> Result<ProposerOutput, FatalError> {
        if round != self.round {
            return Ok(ProposerOutput::empty());
        }
        let (active, proposal, value, from_queue) = match &self.phase {
            Phase::Preparing {
                instance,
                proposal,
                value,
                from_queue,
                ..
            }
            | Phase::Proposing {
                instance,
                proposal,
                value,
                from_queue,
            } => (*instance, *proposal, value.clone(), *from_queue),
            Phase::Idle => return Ok(ProposerOutput::empty()),
        };
        if active != instance {
            return Ok(ProposerOutput::empty());
        }

        let above = promised.max(proposal);
        debug!(%instance, %promised, "rejected, re-preparing above");
        self.start_prepare(storage, instance, above, value, from_queue)
    }

    /// Called when any instance becomes chosen, however it was learned.
    /// Clears recovery and, if the active round was for that instance,
    /// finishes it (re-queuing a displaced candidate).
    pub fn on_chosen(&mut self, instance: Instance, chosen: &[u8]) {
        self.recovering.remove(&instance);
        let (active, value, from_queue) = match &self.phase {
            Phase::Preparing {
                instance,
                value,
                from_queue,
                ..
            }
            | Phase::Proposing {
                instance,
                value,
                from_queue,
                ..
            } => (*instance, value.clone(), *from_queue),
            Phase::Idle => return,
        };
        if active != instance {
            return;
        }
        if from_queue && ValueId::of(chosen) != ValueId::of(&value) {
            self.candidates.push_front(value);
        }
        self.phase = Phase::Idle;
    }

    /// Tallies a recovery reply reporting an accepted value.
    pub fn on_recovery_accepted(
        &mut self,
        from: NodeId,
        instance: Instance,
        proposal: ProposalNumber,
        round: RoundVersion,
        value: Vec<u8>,
    ) {
        self.tally_recovery(from, instance, round, Some(AcceptedValue { proposal, value }));
    }

    /// Tallies a recovery reply reporting nothing known.
    pub fn on_recovery_reject(&mut self, from: NodeId, instance: Instance, round: RoundVersion) {
        self.tally_recovery(from, instance, round, None);
    }

    /// Handles a fired proposer timer. The condition the timer was armed
    /// for may have resolved already; re-check before acting.
    pub fn on_timer(&mut self, timer: ProposerTimer) -> ProposerOutput {
        let mut output = ProposerOutput::empty();
        match timer {
            ProposerTimer::Prepare { instance, round } => {
                if round != self.round {
                    return output;
                }
                if let Phase::Preparing {
                    instance: active,
                    proposal,
                    ..
                } = &self.phase
                {
                    if *active == instance {
                        output.outbound.push(Outbound::Broadcast(
                            ConsensusMessage::Prepare {
                                instance,
                                proposal: *proposal,
                                round,
                            },
                        ));
                        output.timers.push((timer, self.config.prepare_timeout));
                    }
                }
            }
            ProposerTimer::Propose { instance, round } => {
                if round != self.round {
                    return output;
                }
                if let Phase::Proposing {
                    instance: active,
                    proposal,
                    value,
                    ..
                } = &self.phase
                {
                    if *active == instance {
                        output.outbound.push(Outbound::Broadcast(
                            ConsensusMessage::Propose {
                                instance,
                                proposal: *proposal,
                                round,
                                value: value.clone(),
                            },
                        ));
                        output.timers.push((timer, self.config.propose_timeout));
                    }
                }
            }
            ProposerTimer::Recovery => {
                let unresolved: Vec<Instance> = self
                    .recovering
                    .iter()
                    .filter(|(_, gap)| gap.resolution.is_none())
                    .map(|(instance, _)| *instance)
                    .collect();
                if unresolved.is_empty() {
                    return output;
                }
                for instance in unresolved {
                    output
                        .outbound
                        .push(Outbound::Broadcast(ConsensusMessage::Recovery {
                            instance,
                            round: self.round,
                        }));
                }
                output
                    .timers
                    .push((ProposerTimer::Recovery, self.config.recovery_timeout));
            }
        }
        output
    }

    /// True when no gap recovery is outstanding.
    pub fn gaps_resolved(&self) -> bool {
        self.recovering.is_empty()
    }

    fn tally_recovery(
        &mut self,
        from: NodeId,
        instance: Instance,
        round: RoundVersion,
        reply: Option<AcceptedValue>,
    ) {
        if round != self.round {
            return;
        }
        let cluster_size = self.cluster.len();
        let quorum = self.cluster.quorum();
        let Some(gap) = self.recovering.get_mut(&instance) else {
            return;
        };
        if gap.resolution.is_some() {
            return;
        }
        gap.replies.insert(from, reply);

        // Support per reported value identity: (count, highest proposal,
        // value bytes).
        let mut support: HashMap<ValueId, (usize, ProposalNumber, Vec<u8>)> = HashMap::new();
        for accepted in gap.replies.values().flatten() {
            let entry = support
                .entry(ValueId::of(&accepted.value))
                .or_insert((0, accepted.proposal, accepted.value.clone()));
            entry.0 += 1;
            if accepted.proposal > entry.1 {
                entry.1 = accepted.proposal;
            }
        }
        let best = support.into_values().max_by_key(|(count, _, _)| *count);
        let outstanding = cluster_size - gap.replies.len();

        match best {
            Some((count, proposal, value)) if count >= quorum => {
                gap.resolution = Some(Resolution::Direct {
                    proposal: proposal.next_above(self.local),
                    value,
                });
            }
            Some((count, _, value)) if count + outstanding < quorum => {
                gap.resolution = Some(Resolution::Forced { value });
            }
            None if outstanding == 0 => {
                // Every acceptor replied and none has anything: the
                // instance was never proposed to a quorum. Close it with
                // an empty value so the sequence stays gap-free.
                gap.resolution = Some(Resolution::Forced { value: Vec::new() });
            }
            _ => {}
        }
    }

    fn start_prepare<S: Storage>(
        &mut self,
        storage: &mut S,
        instance: Instance,
        above: ProposalNumber,
        value: Vec<u8>,
        from_queue: bool,
    ) -> Result<ProposerOutput, FatalError> {
        let proposal = if above == ProposalNumber::NONE {
            ProposalNumber::initial(self.local)
        } else {
            above.next_above(self.local)
        };
        let round = self.bump_round(storage)?;
        debug!(%instance, %proposal, %round, "preparing");

        self.phase = Phase::Preparing {
            instance,
            proposal,
            value,
            from_queue,
            promises: HashMap::new(),
        };
        let mut output = ProposerOutput::empty();
        output
            .outbound
            .push(Outbound::Broadcast(ConsensusMessage::Prepare {
                instance,
                proposal,
                round,
            }));
        output.timers.push((
            ProposerTimer::Prepare { instance, round },
            self.config.prepare_timeout,
        ));
        Ok(output)
    }

    fn broadcast_propose(
        &self,
        instance: Instance,
        proposal: ProposalNumber,
        value: Vec<u8>,
    ) -> ProposerOutput {
        let mut output = ProposerOutput::empty();
        output
            .outbound
            .push(Outbound::Broadcast(ConsensusMessage::Propose {
                instance,
                proposal,
                round: self.round,
                value,
            }));
        output.timers.push((
            ProposerTimer::Propose {
                instance,
                round: self.round,
            },
            self.config.propose_timeout,
        ));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opaline_storage::MemoryStorage;

    fn node(id: u8) -> NodeId {
        NodeId::new(id)
    }

    fn cluster(n: u8) -> ClusterConfig {
        ClusterConfig::new((0..n).map(NodeId::new).collect())
    }

    fn proposer(n: u8) -> (Proposer, MemoryStorage) {
        (
            Proposer::new(node(0), cluster(n), PaxosConfig::default()),
            MemoryStorage::new(),
        )
    }

    /// Extracts the single broadcast message from an output.
    fn broadcast(output: &ProposerOutput) -> &ConsensusMessage {
        assert_eq!(output.outbound.len(), 1, "expected one broadcast");
        let Outbound::Broadcast(message) = &output.outbound[0] else {
            panic!("expected broadcast, got {:?}", output.outbound[0]);
        };
        message
    }

    #[test]
    fn candidate_runs_prepare_then_propose() {
        let (mut proposer, mut storage) = proposer(3);
        let out = proposer
            .propose_value(&mut storage, b"TXN42".to_vec(), Instance::ZERO)
            .expect("propose");
        let &ConsensusMessage::Prepare {
            instance,
            proposal,
            round,
        } = broadcast(&out)
        else {
            panic!("expected prepare");
        };
        assert_eq!(instance, Instance::ZERO);

        proposer.on_promise(node(1), instance, proposal, round, None);
        let out = proposer.on_promise(node(2), instance, proposal, round, None);
        let ConsensusMessage::Propose { value, .. } = broadcast(&out) else {
            panic!("expected propose after majority promise");
        };
        assert_eq!(value, b"TXN42");
    }

    #[test]
    fn previously_accepted_value_is_adopted_and_candidate_requeued() {
        let (mut proposer, mut storage) = proposer(3);
        let out = proposer
            .propose_value(&mut storage, b"TXN99".to_vec(), Instance::ZERO)
            .expect("propose");
        let &ConsensusMessage::Prepare {
            instance,
            proposal,
            round,
        } = broadcast(&out)
        else {
            panic!("expected prepare");
        };

        let accepted = AcceptedValue {
            proposal: ProposalNumber::initial(node(2)),
            value: b"TXN42".to_vec(),
        };
        proposer.on_promise(node(1), instance, proposal, round, Some(accepted));
        let out = proposer.on_promise(node(2), instance, proposal, round, None);
        let ConsensusMessage::Propose { value, .. } = broadcast(&out) else {
            panic!("expected propose");
        };
        assert_eq!(value, b"TXN42", "adopted, not invented");

        // Once TXN42 is chosen, the displaced candidate restarts at the
        // next instance.
        proposer.on_chosen(instance, b"TXN42");
        let out = proposer
            .maybe_start(&mut storage, instance.next())
            .expect("next");
        let &ConsensusMessage::Prepare { instance: next, .. } = broadcast(&out) else {
            panic!("expected prepare for requeued candidate");
        };
        assert_eq!(next, Instance::new(1));
    }

    #[test]
    fn reject_raises_the_proposal_number_strictly() {
        let (mut proposer, mut storage) = proposer(3);
        let out = proposer
            .propose_value(&mut storage, b"TXN42".to_vec(), Instance::ZERO)
            .expect("propose");
        let &ConsensusMessage::Prepare {
            instance, proposal, ..
        } = broadcast(&out)
        else {
            panic!("expected prepare");
        };

        let competing = ProposalNumber::from_u32(7 << 8 | 2);
        let out = proposer
            .on_reject(&mut storage, instance, competing, proposer.round())
            .expect("reject");
        let &ConsensusMessage::Prepare {
            proposal: raised, ..
        } = broadcast(&out)
        else {
            panic!("expected re-prepare");
        };
        assert!(raised > competing);
        assert!(raised > proposal);
        assert_eq!(raised.proposer(), node(0));
    }

    #[test]
    fn stale_round_replies_are_ignored() {
        let (mut proposer, mut storage) = proposer(3);
        let out = proposer
            .propose_value(&mut storage, b"TXN42".to_vec(), Instance::ZERO)
            .expect("propose");
        let &ConsensusMessage::Prepare {
            instance,
            proposal,
            round,
        } = broadcast(&out)
        else {
            panic!("expected prepare");
        };

        // A reject bumps the round; promises echoing the old round must
        // not complete the superseded tally.
        proposer
            .on_reject(&mut storage, instance, proposal, round)
            .expect("reject");
        proposer.on_promise(node(1), instance, proposal, round, None);
        let out = proposer.on_promise(node(2), instance, proposal, round, None);
        assert!(out.outbound.is_empty());
    }

    #[test]
    fn recovery_majority_agreement_proposes_directly() {
        let (mut proposer, mut storage) = proposer(3);
        let out = proposer
            .start_recovery(&mut storage, vec![Instance::new(4)])
            .expect("recover");
        assert!(matches!(
            broadcast(&out),
            ConsensusMessage::Recovery { .. }
        ));
        let round = proposer.round();

        let p = ProposalNumber::initial(node(1));
        proposer.on_recovery_accepted(node(1), Instance::new(4), p, round, b"TXN42".to_vec());
        proposer.on_recovery_accepted(node(2), Instance::new(4), p, round, b"TXN42".to_vec());

        let out = proposer
            .maybe_start(&mut storage, Instance::ZERO)
            .expect("resolve");
        let ConsensusMessage::Propose {
            proposal, value, ..
        } = broadcast(&out)
        else {
            panic!("expected direct propose");
        };
        assert_eq!(value, b"TXN42");
        assert!(*proposal > p, "direct proposal outranks the reports");
    }

    #[test]
    fn recovery_with_no_possible_majority_forces_a_round() {
        let (mut proposer, mut storage) = proposer(3);
        proposer
            .start_recovery(&mut storage, vec![Instance::new(4)])
            .expect("recover");
        let round = proposer.round();

        // One accepted report, two rejects: 1 + 0 outstanding < quorum 2.
        proposer.on_recovery_accepted(
            node(1),
            Instance::new(4),
            ProposalNumber::initial(node(1)),
            round,
            b"TXN42".to_vec(),
        );
        proposer.on_recovery_reject(node(0), Instance::new(4), round);
        proposer.on_recovery_reject(node(2), Instance::new(4), round);

        let out = proposer
            .maybe_start(&mut storage, Instance::ZERO)
            .expect("resolve");
        let ConsensusMessage::Prepare { instance, .. } = broadcast(&out) else {
            panic!("expected forced prepare");
        };
        assert_eq!(*instance, Instance::new(4));
    }

    #[test]
    fn recovery_with_nothing_anywhere_closes_the_gap_with_an_empty_value() {
        let (mut proposer, mut storage) = proposer(3);
        proposer
            .start_recovery(&mut storage, vec![Instance::new(2)])
            .expect("recover");
        let round = proposer.round();
        for id in 0..3 {
            proposer.on_recovery_reject(node(id), Instance::new(2), round);
        }

        let out = proposer
            .maybe_start(&mut storage, Instance::ZERO)
            .expect("resolve");
        let &ConsensusMessage::Prepare {
            instance,
            proposal,
            round,
        } = broadcast(&out)
        else {
            panic!("expected forced prepare");
        };
        proposer.on_promise(node(1), instance, proposal, round, None);
        let out = proposer.on_promise(node(2), instance, proposal, round, None);
        let ConsensusMessage::Propose { value, .. } = broadcast(&out) else {
            panic!("expected propose");
        };
        assert!(value.is_empty(), "gap closed with an empty value");
    }

    #[test]
    fn candidates_wait_until_all_gaps_are_resolved() {
        let (mut proposer, mut storage) = proposer(3);
        proposer
            .start_recovery(&mut storage, vec![Instance::new(1)])
            .expect("recover");

        let out = proposer
            .propose_value(&mut storage, b"TXN42".to_vec(), Instance::new(2))
            .expect("propose");
        assert!(out.outbound.is_empty(), "queued behind the open gap");

        proposer.on_chosen(Instance::new(1), b"other");
        assert!(proposer.gaps_resolved());
        let out = proposer
            .maybe_start(&mut storage, Instance::new(2))
            .expect("start");
        assert!(matches!(broadcast(&out), ConsensusMessage::Prepare { .. }));
    }

    #[test]
    fn prepare_timer_rebroadcasts_only_while_the_round_is_live() {
        let (mut proposer, mut storage) = proposer(3);
        let out = proposer
            .propose_value(&mut storage, b"TXN42".to_vec(), Instance::ZERO)
            .expect("propose");
        let &ConsensusMessage::Prepare {
            instance, round, ..
        } = broadcast(&out)
        else {
            panic!("expected prepare");
        };
        let timer = ProposerTimer::Prepare { instance, round };

        let out = proposer.on_timer(timer);
        assert!(matches!(broadcast(&out), ConsensusMessage::Prepare { .. }));

        proposer.on_chosen(instance, b"TXN42");
        let out = proposer.on_timer(timer);
        assert!(out.outbound.is_empty(), "decided instance stays quiet");
    }

    #[test]
    fn round_counter_survives_restart() {
        let (mut proposer, mut storage) = proposer(3);
        proposer
            .propose_value(&mut storage, b"TXN42".to_vec(), Instance::ZERO)
            .expect("propose");
        let round = proposer.round();

        let restored =
            Proposer::restore(node(0), cluster(3), PaxosConfig::default(), &storage)
                .expect("restore");
        assert_eq!(restored.round(), round);
    }
}
