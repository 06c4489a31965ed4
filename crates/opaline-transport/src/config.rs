//! Transport tuning knobs.

use opaline_wire::MAX_PAYLOAD;

/// Configuration for channel behavior and retry parameters.
///
/// All delays are in logical milliseconds, interpreted by whatever clock
/// drives the node (the simulation's event queue in tests).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest payload accepted by [`crate::Endpoint::send`].
    ///
    /// Larger payloads are rejected locally and never transmitted; the
    /// transport does not fragment.
    pub max_payload: usize,

    /// Delay before an unacknowledged data frame is retransmitted.
    pub retransmit_delay: u64,

    /// Retransmissions allowed per frame before the sender concludes the
    /// peer has lost its channel state and forces a fresh handshake.
    pub max_retries: u32,

    /// Delay before an unanswered session handshake is retried.
    ///
    /// Handshake retries are unbounded: a crashed peer may stay down for a
    /// long time and the channel must survive that.
    pub handshake_retry_delay: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD,
            retransmit_delay: 150,
            max_retries: 5,
            handshake_retry_delay: 200,
        }
    }
}
