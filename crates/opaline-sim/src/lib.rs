//! Deterministic discrete-event simulation of an Opaline cluster.
//!
//! Wraps a set of [`opaline_paxos::Node`]s in a single-threaded harness:
//! a logical clock, an ordered event queue, and a seeded RNG that decides
//! packet loss, duplication, and delivery delay. The same seed replays
//! the same run, byte for byte, which is what makes the protocol's
//! safety properties testable: any failing schedule is a number.
//!
//! Crash/restart keeps each node's [`opaline_storage::MemoryStorage`]
//! alive across incarnations, modelling a process restart with durable
//! files intact.

mod cluster;
mod config;

pub use cluster::SimCluster;
pub use config::{NetworkConfig, SimConfig};
