//! Multi-instance Paxos over the session transport.
//!
//! A cluster of nodes agrees on a totally ordered, gap-free sequence of
//! opaque values. Each [`Node`] bundles the four protocol roles:
//!
//! - [`acceptor`]: durable promise/accept bookkeeping, where safety lives.
//! - [`learner`]: accept-evidence tallies and the durable chosen log.
//! - [`proposer`]: prepare/propose rounds, candidate queueing, and gap
//!   recovery after restart.
//! - [`election`]: a single-round leader election helper.
//!
//! Everything is a pure state machine: handlers take an event plus the
//! storage handle and return messages, timers, and chosen values for the
//! caller to act on. The driver (production or simulated) owns the
//! network and the clock.

pub mod acceptor;
pub mod config;
pub mod election;
pub mod error;
pub mod learner;
pub mod message;
pub mod node;
pub mod proposer;
pub mod types;

pub use config::{ClusterConfig, PaxosConfig};
pub use error::FatalError;
pub use message::{AcceptedValue, ConsensusMessage};
pub use node::{Node, NodeConfig, NodeEvent, NodeOutput, TimerKind, MAX_VALUE};
pub use types::{Instance, ProposalNumber, RoundVersion};
