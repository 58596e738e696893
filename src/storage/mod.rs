// Durable key-value storage for session state
// Backends: SQLite (survives restarts) and in-memory (process lifetime only)

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StorageError;

/// Minimal key-value contract the credential store persists through
///
/// Calls are synchronous and short; callers treat failures as non-fatal.
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if the key is absent
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Insert or replace a value
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a key; removing an absent key is not an error
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Remove several keys as one unit where the backend supports it
    fn remove_all(&self, keys: &[&str]) -> Result<(), StorageError> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }
}
