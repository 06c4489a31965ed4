//! The discrete-event cluster simulation.
//!
//! One logical clock, one seeded RNG, one ordered event queue. Each step
//! pops the earliest pending event, hands it to the owning node, and
//! folds the node's output back into the queue with network faults
//! applied. Crashing a node discards its in-memory state and swallows
//! its queued events; its [`MemoryStorage`] survives for restart, which
//! is exactly the durability model the protocol is designed against.

use std::collections::{BTreeMap, HashSet};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use opaline_paxos::election::ElectionOutcome;
use opaline_paxos::{
    ClusterConfig, FatalError, Instance, Node, NodeEvent, NodeOutput, TimerKind,
};
use opaline_storage::MemoryStorage;
use opaline_types::NodeId;

use crate::config::SimConfig;

#[derive(Debug)]
enum Pending {
    Packet {
        from: NodeId,
        to: NodeId,
        bytes: Vec<u8>,
    },
    Timer {
        node: NodeId,
        /// Incarnation that armed the timer; a timer outlives a crash
        /// only on the queue, never into the next incarnation.
        incarnation: u32,
        kind: TimerKind,
    },
    Propose {
        node: NodeId,
        value: Vec<u8>,
    },
    Election {
        node: NodeId,
    },
}

struct SimNode {
    /// `None` while crashed or halted.
    node: Option<Node>,
    storage: MemoryStorage,
    incarnation: u32,
    delivered: Vec<(Instance, Vec<u8>)>,
    elections: Vec<ElectionOutcome>,
}

/// A simulated cluster plus its network and clock.
pub struct SimCluster {
    config: SimConfig,
    membership: ClusterConfig,
    rng: ChaCha8Rng,
    now: u64,
    seq: u64,
    queue: BTreeMap<(u64, u64), Pending>,
    nodes: Vec<SimNode>,
    /// Directed links currently dropping everything.
    blocked: HashSet<(NodeId, NodeId)>,
}

impl SimCluster {
    /// Builds a cluster of fresh nodes.
    pub fn new(config: SimConfig) -> Self {
        let members: Vec<NodeId> = (0..config.cluster_size).map(NodeId::new).collect();
        let membership = ClusterConfig::new(members.clone());
        let nodes = members
            .iter()
            .map(|id| SimNode {
                node: Some(Node::new(*id, membership.clone(), config.node.clone())),
                storage: MemoryStorage::new(),
                incarnation: 0,
                delivered: Vec::new(),
                elections: Vec::new(),
            })
            .collect();
        Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            membership,
            now: 0,
            seq: 0,
            queue: BTreeMap::new(),
            nodes,
            blocked: HashSet::new(),
        }
    }

    /// Current logical time.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Cluster member IDs.
    pub fn members(&self) -> Vec<NodeId> {
        self.membership.members().to_vec()
    }

    /// Schedules an application value submission at `node`.
    pub fn propose(&mut self, node: NodeId, value: &[u8]) {
        self.schedule(
            1,
            Pending::Propose {
                node,
                value: value.to_vec(),
            },
        );
    }

    /// Schedules an election request at `node`.
    pub fn request_election(&mut self, node: NodeId) {
        self.schedule(1, Pending::Election { node });
    }

    /// Crashes a node: in-memory state is gone, durable storage stays.
    pub fn crash(&mut self, node: NodeId) {
        debug!(%node, "crash");
        self.nodes[node.as_usize()].node = None;
    }

    /// Restarts a crashed node from its durable tables.
    pub fn restart(&mut self, id: NodeId) -> Result<(), FatalError> {
        debug!(node = %id, "restart");
        let index = id.as_usize();
        self.nodes[index].incarnation += 1;
        let (node, output) = Node::restore(
            id,
            self.membership.clone(),
            self.config.node.clone(),
            &mut self.nodes[index].storage,
        )?;
        self.nodes[index].node = Some(node);
        self.apply_output(id, output);
        Ok(())
    }

    /// True while the node is running.
    pub fn is_running(&self, node: NodeId) -> bool {
        self.nodes[node.as_usize()].node.is_some()
    }

    /// Cuts the link between two nodes, both directions.
    pub fn partition(&mut self, a: NodeId, b: NodeId) {
        self.blocked.insert((a, b));
        self.blocked.insert((b, a));
    }

    /// Cuts every link touching `node`.
    pub fn isolate(&mut self, node: NodeId) {
        for other in self.members() {
            if other != node {
                self.partition(node, other);
            }
        }
    }

    /// Restores every cut link.
    pub fn heal_all(&mut self) {
        self.blocked.clear();
    }

    /// Values delivered to the application at `node`, in delivery order.
    pub fn delivered(&self, node: NodeId) -> &[(Instance, Vec<u8>)] {
        &self.nodes[node.as_usize()].delivered
    }

    /// Election outcomes observed at `node`.
    pub fn elections(&self, node: NodeId) -> &[ElectionOutcome] {
        &self.nodes[node.as_usize()].elections
    }

    /// The chosen value `node` has durably recorded for `instance`, if
    /// the node is running and has one.
    pub fn chosen_value(&self, node: NodeId, instance: Instance) -> Option<Vec<u8>> {
        self.nodes[node.as_usize()]
            .node
            .as_ref()?
            .learner()
            .chosen_value(instance)
            .map(<[u8]>::to_vec)
    }

    /// Processes the earliest pending event. Returns false once the
    /// queue is empty.
    pub fn step(&mut self) -> Result<bool, FatalError> {
        let Some(((time, _), pending)) = self.queue.pop_first() else {
            return Ok(false);
        };
        self.now = time;

        match pending {
            Pending::Packet { from, to, bytes } => {
                self.deliver(to, NodeEvent::Packet { from, bytes })?;
            }
            Pending::Timer {
                node,
                incarnation,
                kind,
            } => {
                if self.nodes[node.as_usize()].incarnation == incarnation {
                    self.deliver(node, NodeEvent::Timer(kind))?;
                }
            }
            Pending::Propose { node, value } => {
                self.deliver(node, NodeEvent::ProposeValue(value))?;
            }
            Pending::Election { node } => {
                self.deliver(node, NodeEvent::RequestElection)?;
            }
        }
        Ok(true)
    }

    /// Runs up to `max_steps` events; stops early when the queue drains.
    pub fn run(&mut self, max_steps: usize) -> Result<(), FatalError> {
        for _ in 0..max_steps {
            if !self.step()? {
                return Ok(());
            }
        }
        Ok(())
    }

    fn deliver(&mut self, id: NodeId, event: NodeEvent) -> Result<(), FatalError> {
        let index = id.as_usize();
        let Some(node) = self.nodes[index].node.take() else {
            // Crashed: the event is lost, like everything else in its
            // memory.
            return Ok(());
        };
        let (node, output) = node.process(&mut self.nodes[index].storage, event)?;
        self.nodes[index].node = Some(node);
        self.apply_output(id, output);
        Ok(())
    }

    fn apply_output(&mut self, id: NodeId, output: NodeOutput) {
        let incarnation = self.nodes[id.as_usize()].incarnation;
        for (kind, delay) in output.timers {
            self.schedule(
                delay.max(1),
                Pending::Timer {
                    node: id,
                    incarnation,
                    kind,
                },
            );
        }
        for packet in output.packets {
            self.transmit(id, packet.to, packet.bytes);
        }
        let slot = &mut self.nodes[id.as_usize()];
        slot.delivered.extend(output.chosen);
        if let Some(outcome) = output.elected {
            slot.elections.push(outcome);
        }
    }

    fn transmit(&mut self, from: NodeId, to: NodeId, bytes: Vec<u8>) {
        if self.blocked.contains(&(from, to)) {
            return;
        }
        let network = self.config.network.clone();
        if network.loss > 0.0 && self.rng.gen_bool(network.loss) {
            debug!(%from, %to, "packet lost");
            return;
        }
        let copies = if network.duplicate > 0.0 && self.rng.gen_bool(network.duplicate) {
            2
        } else {
            1
        };
        for _ in 0..copies {
            let delay = self.rng.gen_range(network.min_delay..=network.max_delay);
            self.schedule(
                delay,
                Pending::Packet {
                    from,
                    to,
                    bytes: bytes.clone(),
                },
            );
        }
    }

    fn schedule(&mut self, delay: u64, pending: Pending) {
        self.seq += 1;
        self.queue.insert((self.now + delay, self.seq), pending);
    }
}
