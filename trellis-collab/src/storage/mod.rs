//! Snapshot persistence for rooms.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  encode_full_state   ┌────────────────────────────┐
//! │ Room        │ ───────────────────► │ SnapshotStore              │
//! │ (in-memory) │ ◄─────────────────── │  MemoryStore  (tests)      │
//! └─────────────┘   load on open       │  DocumentStore (RocksDB)   │
//!                                      └────────────────────────────┘
//! ```
//!
//! Only whole-document snapshots are stored. Incremental deltas are never
//! persisted; the periodic tick overwrites the previous snapshot.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentStore, SnapshotMetadata, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    Database(String),
    /// Metadata could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Stored bytes could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    /// Snapshot blob failed to decompress
    #[error("Compression error: {0}")]
    Compression(String),
    /// Backend refused the operation (injected in tests, or a remote store being down)
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Persistence collaborator for room snapshots.
///
/// Calls are synchronous and expected to be short; the room never holds its
/// store lock while calling into storage.
pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot of `room_id`, or `None` if nothing was saved yet.
    fn load_snapshot(&self, room_id: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Overwrite the snapshot of `room_id`. `timestamp_ms` is the capture time.
    fn save_snapshot(&self, room_id: &str, snapshot: &[u8], timestamp_ms: u64) -> StorageResult<()>;
}
