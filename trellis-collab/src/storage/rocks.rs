//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots`: full document snapshots keyed by room id (LZ4 compressed)
//! - `metadata`: `SnapshotMetadata` per room (bincode)
//!
//! Snapshot and metadata are written in one atomic batch.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{SnapshotStore, StorageError, StorageResult};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every snapshot write (default: true; snapshots are infrequent)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("trellis_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored alongside each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub room_id: String,
    /// Number of snapshots written for this room
    pub version: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Timestamp of the first save (ms since epoch)
    pub created_at: u64,
    /// Timestamp of the latest save (ms since epoch)
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new(room_id: &str, timestamp_ms: u64) -> Self {
        Self {
            room_id: room_id.to_string(),
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: timestamp_ms,
            updated_at: timestamp_ms,
        }
    }

    fn encode(&self) -> StorageResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> StorageResult<Self> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed [`SnapshotStore`].
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode; callers serialize through rooms)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> StorageResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Blobs are already LZ4-compressed by us.
            CF_SNAPSHOTS => opts.set_compression_type(DBCompressionType::None),
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }

        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a full snapshot and return the updated metadata.
    pub fn put_snapshot(
        &self,
        room_id: &str,
        snapshot: &[u8],
        timestamp_ms: u64,
    ) -> StorageResult<SnapshotMetadata> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_metadata(room_id)?
            .unwrap_or_else(|| SnapshotMetadata::new(room_id, timestamp_ms));
        meta.version += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = timestamp_ms;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, room_id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, room_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Saved snapshot {room_id} v{} ({} → {} bytes)",
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    /// Load and decompress the snapshot of `room_id`.
    pub fn get_snapshot(&self, room_id: &str) -> StorageResult<Option<Vec<u8>>> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, room_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StorageError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, room_id: &str) -> StorageResult<Option<SnapshotMetadata>> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(cf, room_id.as_bytes())?
            .map(|bytes| SnapshotMetadata::decode(&bytes))
            .transpose()
    }

    /// Every room with a stored snapshot.
    pub fn list_rooms(&self) -> StorageResult<Vec<String>> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let room = String::from_utf8(key.to_vec())
                .map_err(|e| StorageError::Deserialization(e.to_string()))?;
            rooms.push(room);
        }
        Ok(rooms)
    }

    /// Remove the snapshot and metadata of `room_id`.
    pub fn delete_room(&self, room_id: &str) -> StorageResult<()> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_SNAPSHOTS)?, room_id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, room_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> StorageResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("Column family '{name}' not found")))
    }
}

impl SnapshotStore for DocumentStore {
    fn load_snapshot(&self, room_id: &str) -> StorageResult<Option<Vec<u8>>> {
        self.get_snapshot(room_id)
    }

    fn save_snapshot(&self, room_id: &str, snapshot: &[u8], timestamp_ms: u64) -> StorageResult<()> {
        self.put_snapshot(room_id, snapshot, timestamp_ms).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, DocumentStore) {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert!(store.list_rooms().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let data = b"diagram snapshot with enough repeated data data data data to compress".to_vec();

        let meta = store.put_snapshot("r1", &data, 1_000).unwrap();
        assert_eq!(meta.room_id, "r1");
        assert_eq!(meta.version, 1);
        assert_eq!(meta.snapshot_size, data.len() as u64);
        assert!(meta.compressed_size > 0);

        assert_eq!(store.get_snapshot("r1").unwrap(), Some(data));
    }

    #[test]
    fn test_snapshot_not_found() {
        let (_dir, store) = open_temp();
        assert!(store.get_snapshot("missing").unwrap().is_none());
        assert!(store.load_metadata("missing").unwrap().is_none());
    }

    #[test]
    fn test_metadata_tracks_versions() {
        let (_dir, store) = open_temp();
        store.put_snapshot("r1", b"one", 100).unwrap();
        store.put_snapshot("r1", b"two", 200).unwrap();

        let meta = store.load_metadata("r1").unwrap().unwrap();
        assert_eq!(meta.version, 2);
        assert_eq!(meta.created_at, 100);
        assert_eq!(meta.updated_at, 200);
        assert_eq!(store.get_snapshot("r1").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn test_rooms_isolated() {
        let (_dir, store) = open_temp();
        store.put_snapshot("a", b"alpha", 1).unwrap();
        store.put_snapshot("b", b"beta", 1).unwrap();

        assert_eq!(store.get_snapshot("a").unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(store.get_snapshot("b").unwrap(), Some(b"beta".to_vec()));

        let mut rooms = store.list_rooms().unwrap();
        rooms.sort();
        assert_eq!(rooms, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_delete_room() {
        let (_dir, store) = open_temp();
        store.put_snapshot("r1", b"data", 1).unwrap();
        store.delete_room("r1").unwrap();
        assert!(store.get_snapshot("r1").unwrap().is_none());
        assert!(store.list_rooms().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_snapshots() {
        let dir = TempDir::new().unwrap();
        {
            let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save_snapshot("r1", b"persisted", 5).unwrap();
            store.sync().unwrap();
        }
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.load_snapshot("r1").unwrap(), Some(b"persisted".to_vec()));
    }

    #[test]
    fn test_compression_ratio() {
        let (_dir, store) = open_temp();
        let data = vec![42u8; 64 * 1024];
        let meta = store.put_snapshot("big", &data, 1).unwrap();
        assert!(meta.compressed_size * 10 < meta.snapshot_size);
        assert_eq!(store.get_snapshot("big").unwrap().unwrap().len(), data.len());
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("trellis_data"));
        assert!(config.sync_writes);
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Compression("bad frame".into());
        assert_eq!(err.to_string(), "Compression error: bad frame");
    }
}
