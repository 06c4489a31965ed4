//! Faults that stop a node.
//!
//! Everything else in the protocol is recovered in place: transport faults
//! by session re-establishment, consensus rejects by raising the proposal
//! number, recovery stalemates by a forced round. What remains is damage to
//! the durable state the safety argument depends on, and the node halts
//! rather than continue with it.

use opaline_storage::StorageError;
use opaline_transport::TransportError;

use crate::message::CodecError;

/// A fault the node cannot recover from.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    /// A durable write failed; continuing could violate promises already
    /// implied to peers.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The transport layer hit a fatal fault (its own storage, or a payload
    /// the node itself framed too large).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A durable table could not be replayed at restart.
    #[error("corrupt durable state in {table}: {reason}")]
    CorruptState { table: String, reason: String },

    /// An outbound message could not be encoded.
    #[error("message encoding failed: {0}")]
    Encode(#[from] CodecError),
}
