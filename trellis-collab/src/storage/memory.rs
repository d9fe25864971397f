//! In-memory snapshot store.
//!
//! Used by tests and by servers started without a storage path. Failures can
//! be injected to exercise the room's retry behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use super::{SnapshotStore, StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredSnapshot {
    bytes: Vec<u8>,
    timestamp_ms: u64,
}

/// Thread-safe in-memory [`SnapshotStore`]. Data is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<String, StoredSnapshot>>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent load fail until cleared.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent save fail until cleared.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Timestamp passed with the latest save of `room_id`.
    pub fn saved_at(&self, room_id: &str) -> Option<u64> {
        self.snapshots
            .read()
            .ok()?
            .get(room_id)
            .map(|s| s.timestamp_ms)
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.snapshots
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl SnapshotStore for MemoryStore {
    fn load_snapshot(&self, room_id: &str) -> StorageResult<Option<Vec<u8>>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("load of {room_id} refused")));
        }
        let snapshots = self
            .snapshots
            .read()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(snapshots.get(room_id).map(|s| s.bytes.clone()))
    }

    fn save_snapshot(&self, room_id: &str, snapshot: &[u8], timestamp_ms: u64) -> StorageResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("save of {room_id} refused")));
        }
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        snapshots.insert(
            room_id.to_string(),
            StoredSnapshot {
                bytes: snapshot.to_vec(),
                timestamp_ms,
            },
        );
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
