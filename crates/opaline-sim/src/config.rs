//! Simulation parameters.

use opaline_paxos::NodeConfig;

/// Fault model for the simulated network.
///
/// Every packet is independently subject to loss, duplication, and a
/// random delivery delay; differing delays are what reorder packets.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Probability a packet is dropped.
    pub loss: f64,
    /// Probability a packet is delivered twice.
    pub duplicate: f64,
    /// Minimum delivery delay, logical time units.
    pub min_delay: u64,
    /// Maximum delivery delay.
    pub max_delay: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            loss: 0.0,
            duplicate: 0.0,
            min_delay: 1,
            max_delay: 10,
        }
    }
}

impl NetworkConfig {
    /// A hostile network: a fifth of packets lost, a tenth duplicated,
    /// delays spread wide enough to reorder heavily.
    pub fn chaotic() -> Self {
        Self {
            loss: 0.2,
            duplicate: 0.1,
            min_delay: 1,
            max_delay: 60,
        }
    }
}

/// Full simulation configuration.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Seed for the single RNG every random decision draws from; equal
    /// seeds replay identical runs.
    pub seed: u64,
    /// Number of cluster members, IDs `0..cluster_size`.
    pub cluster_size: u8,
    pub network: NetworkConfig,
    pub node: NodeConfig,
}

impl SimConfig {
    /// A cluster on a benign network.
    pub fn new(seed: u64, cluster_size: u8) -> Self {
        Self {
            seed,
            cluster_size,
            network: NetworkConfig::default(),
            node: NodeConfig::default(),
        }
    }

    /// Same cluster on a [`NetworkConfig::chaotic`] network.
    pub fn chaotic(seed: u64, cluster_size: u8) -> Self {
        Self {
            network: NetworkConfig::chaotic(),
            ..Self::new(seed, cluster_size)
        }
    }
}
