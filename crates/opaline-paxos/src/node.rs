//! The node orchestrator.
//!
//! One `Node` owns every role a cluster member plays: the transport
//! endpoint, the acceptor, the learner, the proposer, and the election
//! tracker. `process` handles exactly one event per call and returns the
//! node plus everything the step produced; all I/O is in the returned
//! output, never performed here.
//!
//! Messages a handler addresses to the local node are routed through an
//! in-step work queue rather than the network, so a broadcast reaches the
//! local acceptor/learner in the same step it is sent.

use std::collections::VecDeque;

use tracing::{debug, warn};

use opaline_storage::Storage;
use opaline_types::NodeId;
use opaline_transport::{
    Datagram, Endpoint, EndpointOutput, TransportConfig, TransportTimer,
};
use opaline_wire::{CONSENSUS_HEADER, MAX_PAYLOAD};

use crate::acceptor::Acceptor;
use crate::config::{ClusterConfig, PaxosConfig};
use crate::election::{Election, ElectionOutcome};
use crate::error::FatalError;
use crate::learner::{Learner, LearnerOutput};
use crate::message::{ConsensusMessage, Outbound};
use crate::proposer::{Proposer, ProposerOutput, ProposerTimer};
use crate::types::{Instance, RoundVersion};

/// Largest application value accepted for proposal. Leaves headroom under
/// the transport payload limit for the promise/reject framing that wraps
/// a re-reported value.
pub const MAX_VALUE: usize = MAX_PAYLOAD - CONSENSUS_HEADER - 16;

/// Per-node configuration.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub transport: TransportConfig,
    pub paxos: PaxosConfig,
}

/// Everything a node can be asked to handle.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A raw datagram arrived from the network.
    Packet { from: NodeId, bytes: Vec<u8> },
    /// A previously armed timer fired.
    Timer(TimerKind),
    /// The application submits a value for the ordered sequence.
    ProposeValue(Vec<u8>),
    /// The application asks for a leader election round.
    RequestElection,
}

/// Every timer a node arms, fed back as a `NodeEvent::Timer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Transport(TransportTimer),
    Proposer(ProposerTimer),
    Election { round: RoundVersion },
}

/// Everything one node step produced.
#[derive(Debug, Default)]
pub struct NodeOutput {
    /// Datagrams to hand to the network.
    pub packets: Vec<Datagram>,
    /// Timers to arm, with logical delays.
    pub timers: Vec<(TimerKind, u64)>,
    /// Values that became contiguously chosen, ascending, exactly once.
    pub chosen: Vec<(Instance, Vec<u8>)>,
    /// Election verdict, if an election concluded this step. `Some(None)`
    /// means the round was inconclusive.
    pub elected: Option<ElectionOutcome>,
    /// Oversized values refused at submission, returned to the caller.
    pub rejected: Vec<Vec<u8>>,
}

/// One cluster member, all roles included.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    cluster: ClusterConfig,
    config: PaxosConfig,
    endpoint: Endpoint,
    acceptor: Acceptor,
    learner: Learner,
    proposer: Proposer,
    election: Election,
}

impl Node {
    /// Creates a node with no history.
    pub fn new(id: NodeId, cluster: ClusterConfig, config: NodeConfig) -> Self {
        let quorum = cluster.quorum();
        Self {
            id,
            endpoint: Endpoint::new(id, config.transport),
            acceptor: Acceptor::new(),
            learner: Learner::new(quorum),
            proposer: Proposer::new(id, cluster.clone(), config.paxos.clone()),
            election: Election::new(quorum),
            config: config.paxos,
            cluster,
        }
    }

    /// Rebuilds a node from its durable tables and starts gap recovery
    /// for every instance known to exist but not known chosen.
    pub fn restore<S: Storage>(
        id: NodeId,
        cluster: ClusterConfig,
        config: NodeConfig,
        storage: &mut S,
    ) -> Result<(Self, NodeOutput), FatalError> {
        let quorum = cluster.quorum();
        let mut node = Self {
            id,
            endpoint: Endpoint::restore(id, config.transport, storage)?,
            acceptor: Acceptor::restore(storage)?,
            learner: Learner::restore(storage, quorum)?,
            proposer: Proposer::restore(id, cluster.clone(), config.paxos.clone(), storage)?,
            election: Election::new(quorum),
            config: config.paxos,
            cluster,
        };

        let mut output = NodeOutput::default();
        let mut inbox = VecDeque::new();
        let gaps = match node.acceptor.highest_accepted() {
            Some(highest) => node.learner.gaps_up_to(highest),
            None => Vec::new(),
        };
        if !gaps.is_empty() {
            debug!(node = %id, gaps = gaps.len(), "restart gap recovery");
            let out = node.proposer.start_recovery(storage, gaps)?;
            node.dispatch_proposer(out, &mut output, &mut inbox)?;
            node.drain(storage, &mut inbox, &mut output)?;
        }
        Ok((node, output))
    }

    /// This node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Read access to the chosen log, for rehydration after restart.
    pub fn learner(&self) -> &Learner {
        &self.learner
    }

    /// Handles one event. Consumes the node and returns it with the
    /// step's output; a `FatalError` means the node must halt.
    pub fn process<S: Storage>(
        mut self,
        storage: &mut S,
        event: NodeEvent,
    ) -> Result<(Self, NodeOutput), FatalError> {
        let mut output = NodeOutput::default();
        let mut inbox = VecDeque::new();

        match event {
            NodeEvent::Packet { from, bytes } => {
                let endpoint_out = self.endpoint.on_datagram(storage, from, &bytes)?;
                for delivery in absorb(endpoint_out, &mut output) {
                    match ConsensusMessage::decode(&delivery.payload) {
                        Ok(message) => inbox.push_back((delivery.from, message)),
                        Err(e) => {
                            debug!(node = %self.id, from = %delivery.from, error = %e,
                                "dropping undecodable consensus payload");
                        }
                    }
                }
            }
            NodeEvent::Timer(TimerKind::Transport(timer)) => {
                absorb(self.endpoint.on_timer(timer), &mut output);
            }
            NodeEvent::Timer(TimerKind::Proposer(timer)) => {
                let out = self.proposer.on_timer(timer);
                self.redispatch_proposer(out, &mut output)?;
            }
            NodeEvent::Timer(TimerKind::Election { round }) => {
                if let Some(outcome) = self.election.on_timeout(round) {
                    output.elected = Some(outcome);
                }
            }
            NodeEvent::ProposeValue(value) => {
                if value.len() > MAX_VALUE {
                    warn!(node = %self.id, len = value.len(), max = MAX_VALUE,
                        "refusing oversized value");
                    output.rejected.push(value);
                } else {
                    let frontier = self.learner.frontier();
                    let out = self.proposer.propose_value(storage, value, frontier)?;
                    self.dispatch_proposer(out, &mut output, &mut inbox)?;
                }
            }
            NodeEvent::RequestElection => {
                let round = self.proposer.bump_round(storage)?;
                self.election.start(round);
                self.send_outbound(
                    Outbound::Broadcast(ConsensusMessage::Elect { round }),
                    &mut output,
                    &mut inbox,
                )?;
                output
                    .timers
                    .push((TimerKind::Election { round }, self.config.election_timeout));
            }
        }

        self.drain(storage, &mut inbox, &mut output)?;
        Ok((self, output))
    }

    fn drain<S: Storage>(
        &mut self,
        storage: &mut S,
        inbox: &mut VecDeque<(NodeId, ConsensusMessage)>,
        output: &mut NodeOutput,
    ) -> Result<(), FatalError> {
        while let Some((from, message)) = inbox.pop_front() {
            self.handle_message(storage, from, message, output, inbox)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn handle_message<S: Storage>(
        &mut self,
        storage: &mut S,
        from: NodeId,
        message: ConsensusMessage,
        output: &mut NodeOutput,
        inbox: &mut VecDeque<(NodeId, ConsensusMessage)>,
    ) -> Result<(), FatalError> {
        match message {
            ConsensusMessage::Prepare {
                instance,
                proposal,
                round,
            } => {
                let reply = self.acceptor.on_prepare(storage, instance, proposal, round)?;
                self.send_outbound(Outbound::To(from, reply), output, inbox)?;
            }
            ConsensusMessage::Propose {
                instance,
                proposal,
                round,
                value,
            } => {
                let reply = self
                    .acceptor
                    .on_propose(storage, instance, proposal, round, value)?;
                // An accept vote is learner evidence for the whole
                // cluster; a reject only concerns the proposer.
                let outbound = match reply {
                    accept @ ConsensusMessage::Accept { .. } => Outbound::Broadcast(accept),
                    reject => Outbound::To(from, reject),
                };
                self.send_outbound(outbound, output, inbox)?;
            }
            ConsensusMessage::Promise {
                instance,
                proposal,
                round,
                accepted,
            } => {
                let out = self
                    .proposer
                    .on_promise(from, instance, proposal, round, accepted);
                self.dispatch_proposer(out, output, inbox)?;
            }
            ConsensusMessage::Reject {
                instance,
                promised,
                round,
                ..
            } => {
                let out = self.proposer.on_reject(storage, instance, promised, round)?;
                self.dispatch_proposer(out, output, inbox)?;
            }
            ConsensusMessage::Accept {
                instance, value, ..
            } => {
                let out = self.learner.on_accept(storage, from, instance, value)?;
                self.apply_learner(storage, out, output, inbox)?;
            }
            ConsensusMessage::Learn { instance, value } => {
                let out = self.learner.on_learned(storage, instance, value)?;
                self.apply_learner(storage, out, output, inbox)?;
            }
            ConsensusMessage::Recovery { instance, round } => {
                let chosen = self.learner.chosen_value(instance).map(<[u8]>::to_vec);
                let reply = self.acceptor.on_recovery(instance, round, chosen.as_deref());
                self.send_outbound(Outbound::To(from, reply), output, inbox)?;
            }
            ConsensusMessage::RecoveryAccepted {
                instance,
                proposal,
                round,
                value,
            } => {
                self.proposer
                    .on_recovery_accepted(from, instance, proposal, round, value);
                let out = self
                    .proposer
                    .maybe_start(storage, self.learner.frontier())?;
                self.dispatch_proposer(out, output, inbox)?;
            }
            ConsensusMessage::RecoveryChosen { instance, value } => {
                let out = self.learner.on_learned(storage, instance, value)?;
                self.apply_learner(storage, out, output, inbox)?;
            }
            ConsensusMessage::RecoveryReject { instance, round } => {
                self.proposer.on_recovery_reject(from, instance, round);
                let out = self
                    .proposer
                    .maybe_start(storage, self.learner.frontier())?;
                self.dispatch_proposer(out, output, inbox)?;
            }
            ConsensusMessage::Elect { round } => {
                let highest = self.learner.highest_chosen().unwrap_or(Instance::ZERO);
                let reply = ConsensusMessage::ElectReply { round, highest };
                self.send_outbound(Outbound::To(from, reply), output, inbox)?;
            }
            ConsensusMessage::ElectReply { round, highest } => {
                if let Some(outcome) = self.election.on_reply(from, round, highest) {
                    output.elected = Some(outcome);
                }
            }
        }
        Ok(())
    }

    /// Applies a learner step: announce chosen values to peers, finish
    /// the proposer's round, surface deliveries, and start queued work.
    fn apply_learner<S: Storage>(
        &mut self,
        storage: &mut S,
        out: LearnerOutput,
        output: &mut NodeOutput,
        inbox: &mut VecDeque<(NodeId, ConsensusMessage)>,
    ) -> Result<(), FatalError> {
        if let Some((instance, value)) = out.announce {
            let bytes = ConsensusMessage::Learn { instance, value }.encode()?;
            for peer in self.cluster.peers(self.id).collect::<Vec<_>>() {
                let endpoint_out = self.endpoint.send(peer, bytes.clone())?;
                absorb(endpoint_out, output);
            }
        }

        let decided = out.newly_chosen.is_some();
        if let Some((instance, value)) = out.newly_chosen {
            self.proposer.on_chosen(instance, &value);
        }
        output.chosen.extend(out.delivered);

        if decided {
            // A decision above the frontier exposes holes this node may
            // never have driven itself (it may have slept through the
            // Learn broadcasts). Recover them now, not just at restart.
            if self.proposer.gaps_resolved() {
                if let Some(highest) = self.learner.highest_chosen() {
                    let gaps = self.learner.gaps_up_to(highest);
                    if !gaps.is_empty() {
                        debug!(node = %self.id, gaps = gaps.len(), "runtime gap recovery");
                        let out = self.proposer.start_recovery(storage, gaps)?;
                        self.dispatch_proposer(out, output, inbox)?;
                    }
                }
            }
            let next = self
                .proposer
                .maybe_start(storage, self.learner.frontier())?;
            self.dispatch_proposer(next, output, inbox)?;
        }
        Ok(())
    }

    fn dispatch_proposer(
        &mut self,
        out: ProposerOutput,
        output: &mut NodeOutput,
        inbox: &mut VecDeque<(NodeId, ConsensusMessage)>,
    ) -> Result<(), FatalError> {
        for (timer, delay) in out.timers {
            output.timers.push((TimerKind::Proposer(timer), delay));
        }
        for outbound in out.outbound {
            self.send_outbound(outbound, output, inbox)?;
        }
        Ok(())
    }

    /// Routes a timer-driven re-broadcast.
    ///
    /// Unlike a first transmission, a retry only covers peers whose
    /// channel has drained the previous copy: one still queued or unacked
    /// will get there without help, and resubmitting it every cycle grows
    /// the send queue without bound while a peer is unreachable. The local
    /// participant answered the original in the step that sent it, so it
    /// is skipped too.
    fn redispatch_proposer(
        &mut self,
        out: ProposerOutput,
        output: &mut NodeOutput,
    ) -> Result<(), FatalError> {
        for (timer, delay) in out.timers {
            output.timers.push((TimerKind::Proposer(timer), delay));
        }
        for outbound in out.outbound {
            let (targets, message) = match outbound {
                Outbound::Broadcast(message) => {
                    (self.cluster.peers(self.id).collect::<Vec<_>>(), message)
                }
                Outbound::To(target, message) => (vec![target], message),
            };
            let bytes = message.encode()?;
            for peer in targets {
                if peer == self.id || self.endpoint.is_draining(peer) {
                    continue;
                }
                let endpoint_out = self.endpoint.send(peer, bytes.clone())?;
                absorb(endpoint_out, output);
            }
        }
        Ok(())
    }

    /// Routes a message: peers get it through the transport, the local
    /// node gets it through the in-step work queue.
    fn send_outbound(
        &mut self,
        outbound: Outbound,
        output: &mut NodeOutput,
        inbox: &mut VecDeque<(NodeId, ConsensusMessage)>,
    ) -> Result<(), FatalError> {
        match outbound {
            Outbound::Broadcast(message) => {
                let bytes = message.encode()?;
                for peer in self.cluster.peers(self.id).collect::<Vec<_>>() {
                    let endpoint_out = self.endpoint.send(peer, bytes.clone())?;
                    absorb(endpoint_out, output);
                }
                inbox.push_back((self.id, message));
            }
            Outbound::To(target, message) => {
                if target == self.id {
                    inbox.push_back((self.id, message));
                } else {
                    let bytes = message.encode()?;
                    let endpoint_out = self.endpoint.send(target, bytes)?;
                    absorb(endpoint_out, output);
                }
            }
        }
        Ok(())
    }
}

/// Folds an endpoint step into the node output, returning the deliveries
/// for the caller to route.
fn absorb(
    endpoint_out: EndpointOutput,
    output: &mut NodeOutput,
) -> Vec<opaline_transport::Delivery> {
    output.packets.extend(endpoint_out.datagrams);
    for (timer, delay) in endpoint_out.timers {
        output.timers.push((TimerKind::Transport(timer), delay));
    }
    endpoint_out.deliveries
}
