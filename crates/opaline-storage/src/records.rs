//! Versioned binary record framing.
//!
//! Both append-only logs and full-rewrite snapshots store a flat run of
//! records, each framed as:
//!
//! ```text
//! version:1B | length:4B big-endian | postcard payload (length bytes)
//! ```
//!
//! The per-record version byte lets a future schema change replay old logs
//! without a separate migration file. Decoding is strict: a truncated tail
//! or unknown version is an error, never silently skipped, because these
//! files hold consensus safety state.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Current record schema version.
pub const RECORD_VERSION: u8 = 1;

/// Bytes of framing ahead of each payload.
const HEADER_LEN: usize = 5;

/// Error raised while framing or parsing records.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    /// The byte run ended in the middle of a record.
    #[error("truncated record at offset {offset}")]
    Truncated {
        /// Offset of the incomplete record.
        offset: usize,
    },

    /// A record carried a version this build does not understand.
    #[error("unsupported record version {version} at offset {offset}")]
    UnsupportedVersion {
        /// The version byte found.
        version: u8,
        /// Offset of the offending record.
        offset: usize,
    },

    /// The payload failed to decode.
    #[error("record payload decode failed at offset {offset}: {reason}")]
    Codec {
        /// Offset of the offending record.
        offset: usize,
        /// Decoder failure description.
        reason: String,
    },
}

/// Encodes one record, framed and versioned.
pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, RecordError> {
    let payload = postcard::to_allocvec(value).map_err(|e| RecordError::Codec {
        offset: 0,
        reason: e.to_string(),
    })?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(RECORD_VERSION);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decodes a full run of records.
pub fn decode_records<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>, RecordError> {
    let mut out = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        if bytes.len() - offset < HEADER_LEN {
            return Err(RecordError::Truncated { offset });
        }
        let version = bytes[offset];
        if version != RECORD_VERSION {
            return Err(RecordError::UnsupportedVersion { version, offset });
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[offset + 1..offset + HEADER_LEN]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        let start = offset + HEADER_LEN;
        let end = start.checked_add(len).ok_or(RecordError::Truncated { offset })?;
        if end > bytes.len() {
            return Err(RecordError::Truncated { offset });
        }

        let value = postcard::from_bytes(&bytes[start..end]).map_err(|e| RecordError::Codec {
            offset,
            reason: e.to_string(),
        })?;
        out.push(value);
        offset = end;
    }

    Ok(out)
}
