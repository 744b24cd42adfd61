//! RocksDB-backed room document store.
//!
//! Column families:
//! - `documents` — Full Yrs document snapshots (LZ4 compressed), keyed by room name
//! - `updates`   — Incremental Yrs updates (LZ4 compressed), keyed by name + version
//! - `metadata`  — Room metadata (bincode: version, sizes, timestamps)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_UPDATES, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_sync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Store rooted at `path` with default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
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

/// Metadata stored alongside each room snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Room name
    pub name: String,
    /// Highest update version written
    pub version: u64,
    /// Incremental updates stored since the last compaction
    pub update_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(name: &str) -> Self {
        let now = unix_now();
        Self {
            name: name.to_string(),
            version: 0,
            update_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("Column family '{0}' not found")]
    MissingColumnFamily(&'static str),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Room name too long ({0} bytes)")]
    NameTooLong(usize),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(#[from] lz4_flex::block::DecompressError),
}

/// RocksDB-backed store of room documents.
///
/// Snapshots and incremental updates are LZ4 compressed; snapshot and
/// metadata writes go through one atomic batch.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the document store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                // many small writes, range-scanned per room
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a full document snapshot (LZ4 compressed).
    pub fn save_snapshot(&self, name: &str, snapshot: &[u8]) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self.metadata_or_new(name)?;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, name.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, name.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(meta)
    }

    /// Load a document snapshot (LZ4 decompressed).
    pub fn load_snapshot(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, name.as_bytes())? {
            Some(compressed) => Ok(lz4_flex::decompress_size_prepended(&compressed)?),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    /// Whether anything was ever stored for `name`.
    pub fn document_exists(&self, name: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, name.as_bytes())?.is_some())
    }

    // ─── Incremental updates ──────────────────────────────────────────

    /// Store one incremental update.
    ///
    /// Key format: `<name length:2 bytes BE><name><version:8 bytes BE>`.
    /// Returns the compressed size.
    pub fn store_update(&self, name: &str, version: u64, update: &[u8]) -> Result<u64, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(update);
        let key = update_key(name, version)?;

        let mut meta = self.metadata_or_new(name)?;
        meta.version = meta.version.max(version);
        meta.update_count += 1;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_updates, &key, &compressed);
        batch.put_cf(&cf_meta, name.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(compressed.len() as u64)
    }

    /// Updates for `name` with version `>= since`, in version order.
    pub fn load_updates_since(&self, name: &str, since: u64) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = update_prefix(name)?;
        let start = update_key(name, since)?;

        let mut updates = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            let Some(version) = version_of(&key, &prefix) else {
                break;
            };
            updates.push((version, lz4_flex::decompress_size_prepended(&value)?));
        }
        Ok(updates)
    }

    pub fn load_all_updates(&self, name: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        self.load_updates_since(name, 0)
    }

    /// Delete updates with version `<= up_to` (after a snapshot). Returns how
    /// many were removed.
    pub fn compact_updates(&self, name: &str, up_to: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let prefix = update_prefix(name)?;

        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            match version_of(&key, &prefix) {
                Some(version) if version <= up_to => {
                    batch.delete_cf(&cf, &key);
                    count += 1;
                }
                _ => break,
            }
        }

        if count > 0 {
            let mut meta = self.metadata_or_new(name)?;
            meta.update_count = meta.update_count.saturating_sub(count);
            batch.put_cf(&cf_meta, name.as_bytes(), meta.encode()?);
            self.write(batch)?;
        }
        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, name: &str) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, name.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    fn metadata_or_new(&self, name: &str) -> Result<DocumentMetadata, StoreError> {
        match self.load_metadata(name) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(DocumentMetadata::new(name)),
            Err(e) => Err(e),
        }
    }

    /// Names of all stored rooms.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }

    /// Delete a room's snapshot, updates and metadata.
    pub fn delete_document(&self, name: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let prefix = update_prefix(name)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, name.as_bytes());
        batch.delete_cf(&cf_meta, name.as_bytes());
        for item in self
            .db
            .iterator_cf(&cf_updates, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if version_of(&key, &prefix).is_none() {
                break;
            }
            batch.delete_cf(&cf_updates, &key);
        }
        self.write(batch)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        Ok(self.db.flush()?)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        Ok(self.db.write_opt(batch, &write_opts)?)
    }
}

/// Length-prefixed room name, so one name is never a prefix of another's keys.
fn update_prefix(name: &str) -> Result<Vec<u8>, StoreError> {
    let len = u16::try_from(name.len()).map_err(|_| StoreError::NameTooLong(name.len()))?;
    let mut key = Vec::with_capacity(2 + name.len() + 8);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    Ok(key)
}

fn update_key(name: &str, version: u64) -> Result<Vec<u8>, StoreError> {
    let mut key = update_prefix(name)?;
    key.extend_from_slice(&version.to_be_bytes());
    Ok(key)
}

/// Version encoded in `key`, or `None` if the key belongs to another room.
fn version_of(key: &[u8], prefix: &[u8]) -> Option<u64> {
    let rest = key.strip_prefix(prefix)?;
    let bytes: [u8; 8] = rest.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.list_documents().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let data = b"a room snapshot with enough repeated data data data to compress".to_vec();

        let meta = store.save_snapshot("room-1", &data).unwrap();
        assert_eq!(meta.name, "room-1");
        assert_eq!(meta.snapshot_size, data.len() as u64);
        assert!(meta.compressed_size > 0);

        assert_eq!(store.load_snapshot("room-1").unwrap(), data);
    }

    #[test]
    fn test_snapshot_not_found() {
        let (_dir, store) = open_temp();
        assert!(matches!(
            store.load_snapshot("missing"),
            Err(StoreError::NotFound(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_updates_in_version_order() {
        let (_dir, store) = open_temp();
        for v in 1..=10 {
            store
                .store_update("doc", v, format!("update_{v}").as_bytes())
                .unwrap();
        }

        let all = store.load_all_updates("doc").unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0], (1, b"update_1".to_vec()));
        assert_eq!(all[9], (10, b"update_10".to_vec()));

        let since5 = store.load_updates_since("doc", 5).unwrap();
        assert_eq!(since5.len(), 6);
        assert_eq!(since5[0].0, 5);
    }

    #[test]
    fn test_compact_updates() {
        let (_dir, store) = open_temp();
        for v in 1..=20 {
            store.store_update("doc", v, &[v as u8; 64]).unwrap();
        }

        assert_eq!(store.compact_updates("doc", 10).unwrap(), 10);
        let remaining = store.load_all_updates("doc").unwrap();
        assert_eq!(remaining.len(), 10);
        assert_eq!(remaining[0].0, 11);
        assert_eq!(store.load_metadata("doc").unwrap().update_count, 10);
    }

    #[test]
    fn test_prefix_names_are_isolated() {
        let (_dir, store) = open_temp();
        store.store_update("a", 1, b"a1").unwrap();
        store.store_update("ab", 1, b"ab1").unwrap();
        store.store_update("ab", 2, b"ab2").unwrap();

        assert_eq!(store.load_all_updates("a").unwrap(), vec![(1, b"a1".to_vec())]);
        assert_eq!(store.load_all_updates("ab").unwrap().len(), 2);

        store.delete_document("a").unwrap();
        assert!(store.load_all_updates("a").unwrap().is_empty());
        assert_eq!(store.load_all_updates("ab").unwrap().len(), 2);
    }

    #[test]
    fn test_list_and_delete_documents() {
        let (_dir, store) = open_temp();
        for name in ["one", "two", "three"] {
            store.save_snapshot(name, b"state").unwrap();
        }
        store.store_update("two", 1, b"u").unwrap();

        let mut listed = store.list_documents().unwrap();
        listed.sort();
        assert_eq!(listed, vec!["one", "three", "two"]);

        store.delete_document("two").unwrap();
        assert!(!store.document_exists("two").unwrap());
        assert!(store.load_snapshot("two").is_err());
        assert!(store.load_all_updates("two").unwrap().is_empty());
    }

    #[test]
    fn test_metadata_tracks_versions() {
        let (_dir, store) = open_temp();
        store.save_snapshot("doc", b"snapshot").unwrap();
        store.store_update("doc", 1, b"u1").unwrap();
        store.store_update("doc", 2, b"u2").unwrap();

        let meta = store.load_metadata("doc").unwrap();
        assert_eq!(meta.version, 2);
        assert_eq!(meta.update_count, 2);
        assert!(meta.created_at > 0);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        {
            let store = DocumentStore::open(config.clone()).unwrap();
            store.save_snapshot("doc", b"persisted").unwrap();
            store.sync().unwrap();
        }
        let store = DocumentStore::open(config).unwrap();
        assert_eq!(store.load_snapshot("doc").unwrap(), b"persisted");
    }

    #[test]
    fn test_compression_ratio() {
        let (_dir, store) = open_temp();
        let mut data = Vec::with_capacity(10_000);
        for i in 0..1000u16 {
            data.extend_from_slice(&[0u8; 6]);
            data.extend_from_slice(&i.to_le_bytes());
            data.extend_from_slice(b"tx");
        }

        let meta = store.save_snapshot("doc", &data).unwrap();
        let ratio = meta.snapshot_size as f64 / meta.compressed_size as f64;
        assert!(ratio > 2.0, "Compression ratio {ratio:.1}x too low");
    }

    #[test]
    fn test_name_too_long() {
        let (_dir, store) = open_temp();
        let name = "x".repeat(70_000);
        assert!(matches!(
            store.store_update(&name, 1, b"u"),
            Err(StoreError::NameTooLong(70_000))
        ));
    }
}
