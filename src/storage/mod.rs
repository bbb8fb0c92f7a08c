//! Key/value persistence for subject configs and history
//!
//! Each subject is stored under a fixed set of keys
//! (`<subject>.config`, `<subject>.samples`, `<subject>.alerts`,
//! `<subject>.stats-cache`) holding JSON values.

pub mod backend;
pub mod snapshot;

pub use backend::{FileBackend, MemoryBackend};
pub use snapshot::{SnapshotManager, SubjectSnapshot, SCHEMA_VERSION};

/// Trait for persistence backends
pub trait PersistenceBackend: Send + Sync {
    /// Write a value, replacing any previous one
    fn write(&self, key: &str, data: &[u8]) -> Result<(), PersistenceError>;

    /// Read a value
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Delete a value; deleting a missing key is not an error
    fn delete(&self, key: &str) -> Result<(), PersistenceError>;

    /// List all keys
    fn list_keys(&self) -> Result<Vec<String>, PersistenceError>;

    /// Flush anything buffered
    fn sync(&self) -> Result<(), PersistenceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted data under '{key}': {reason}")]
    Corrupted { key: String, reason: String },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Unsupported snapshot schema version {0}")]
    UnsupportedSchema(u32),

    #[error("Persistence task failed: {0}")]
    Task(String),
}
