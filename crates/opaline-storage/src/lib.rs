//! Durable storage boundary for Opaline nodes.
//!
//! Every safety-critical table in the system (channel table, promise table,
//! accepted log, chosen log, round counter) is persisted through the
//! [`Storage`] trait before any message that depends on it is sent. The
//! trait is synchronous and fallible: a failed write is fatal to the owning
//! node, which must halt rather than continue with unpersisted state.
//!
//! Two file disciplines exist and are never mixed on one name:
//!
//! - **Append-only logs** (`append`): only ever grow; recovery replays them
//!   front to back. Used for the accepted and chosen logs.
//! - **Full-rewrite snapshots** (`write_all`): atomically replaced as a
//!   whole. Used for the channel table, promise table, and round counter.
//!
//! Record framing for both lives in [`records`].

mod memory;
pub mod records;

pub use memory::MemoryStorage;

/// Error raised by a storage backend.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StorageError {
    /// A write (or append, or delete) did not reach stable storage.
    #[error("storage write to `{name}` failed")]
    WriteFailed {
        /// Name of the table that could not be written.
        name: String,
    },

    /// A read returned bytes that cannot be interpreted.
    #[error("storage table `{name}` is corrupt: {reason}")]
    Corrupt {
        /// Name of the unreadable table.
        name: String,
        /// Human-readable decode failure.
        reason: String,
    },
}

/// Synchronous durable storage, keyed by flat table names.
///
/// Implementations must guarantee that once a call returns `Ok`, the data
/// survives a process crash and restart. The in-memory backend used by the
/// simulation models this by keeping the map alive across simulated node
/// restarts.
pub trait Storage {
    /// Reads the full contents of `name`, or `None` if it was never written.
    fn read_all(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replaces the full contents of `name`.
    fn write_all(&mut self, name: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Appends `bytes` to `name`, creating it if absent.
    fn append(&mut self, name: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Removes `name`. Removing an absent name is a no-op.
    fn delete(&mut self, name: &str) -> Result<(), StorageError>;
}
