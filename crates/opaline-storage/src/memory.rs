//! Deterministic in-memory storage backend.

use std::collections::HashMap;

use crate::{Storage, StorageError};

/// In-memory [`Storage`] backend for tests and simulation.
///
/// The simulation harness keeps the `MemoryStorage` alive across simulated
/// node crashes, so durable state survives while everything in the node
/// itself is lost. Write-failure injection lets tests exercise the fatal
/// storage path.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    tables: HashMap<String, Vec<u8>>,
    /// When true, every mutating call fails.
    fail_writes: bool,
}

impl MemoryStorage {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes all subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Returns the number of tables currently stored.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    fn check_writable(&self, name: &str) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::WriteFailed { name: name.into() });
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn read_all(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.tables.get(name).cloned())
    }

    fn write_all(&mut self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.check_writable(name)?;
        self.tables.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn append(&mut self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.check_writable(name)?;
        self.tables
            .entry(name.to_string())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    fn delete(&mut self, name: &str) -> Result<(), StorageError> {
        self.check_writable(name)?;
        self.tables.remove(name);
        Ok(())
    }
}
