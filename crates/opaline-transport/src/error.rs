//! Transport error types.

use opaline_storage::StorageError;

/// Error surfaced by the transport endpoint.
///
/// Everything recoverable (lost packets, duplicate packets, expired
/// sessions, retry exhaustion) is handled inside the endpoint and never
/// reaches the caller. What remains is either a caller mistake
/// ([`TransportError::PayloadTooLarge`]) or fatal
/// ([`TransportError::Storage`], [`TransportError::CorruptTable`]).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    /// The payload exceeds the configured maximum and was not sent.
    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The channel table could not be persisted. Fatal: the node must halt
    /// rather than continue with session state the peer may rely on.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The persisted channel table could not be read back at restart.
    #[error("channel table corrupt: {0}")]
    CorruptTable(String),
}
