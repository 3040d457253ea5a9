//! RocksDB-backed canvas store.
//!
//! Column families:
//! - `snapshots` — latest `CanvasSnapshot` per project (JSON, LZ4 compressed)
//! - `documents` — relay-side CRDT state per project (LZ4 compressed)
//!
//! Keys are the UTF-8 project id.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{CanvasSnapshot, ChangeFeed, SnapshotChange, SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_DOCUMENTS: &str = "documents";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_DOCUMENTS];

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
    /// Buffered change notifications per project
    pub feed_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tessera_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
            feed_capacity: 64,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            feed_capacity: 16,
        }
    }
}

/// Durable snapshots plus the relay's per-project CRDT state.
///
/// Clones share the database handle and the change feed.
#[derive(Clone)]
pub struct CanvasStore {
    db: Arc<DBWithThreadMode<SingleThreaded>>,
    config: StoreConfig,
    feed: Arc<ChangeFeed>,
}

impl CanvasStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened canvas store at {}", config.path.display());
        let feed = Arc::new(ChangeFeed::new(config.feed_capacity));
        Ok(Self {
            db: Arc::new(db),
            config,
            feed,
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed by us.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Store a snapshot, returning the one it replaced.
    pub fn put_snapshot(&self, snapshot: &CanvasSnapshot) -> Result<Option<CanvasSnapshot>, StoreError> {
        let previous = self.get_snapshot(&snapshot.project_id)?;
        let compressed = lz4_flex::compress_prepend_size(&snapshot.encode()?);
        self.put(CF_SNAPSHOTS, &snapshot.project_id, &compressed)?;
        Ok(previous)
    }

    pub fn get_snapshot(&self, project_id: &str) -> Result<Option<CanvasSnapshot>, StoreError> {
        match self.get(CF_SNAPSHOTS, project_id)? {
            Some(bytes) => Ok(Some(CanvasSnapshot::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ─── Relay document state ─────────────────────────────────────────

    /// Persist a project's full CRDT state (`encode_state_as_update_v1`).
    pub fn save_document_state(&self, project_id: &str, state: &[u8]) -> Result<usize, StoreError> {
        let compressed = lz4_flex::compress_prepend_size(state);
        let len = compressed.len();
        self.put(CF_DOCUMENTS, project_id, &compressed)?;
        log::debug!(
            "Persisted document state for {project_id} ({} -> {len} bytes)",
            state.len()
        );
        Ok(len)
    }

    pub fn load_document_state(&self, project_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.get(CF_DOCUMENTS, project_id)
    }

    /// Projects with persisted CRDT state.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut projects = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            match std::str::from_utf8(&key) {
                Ok(project) => projects.push(project.to_string()),
                Err(_) => log::warn!("Skipping non UTF-8 document key"),
            }
        }
        Ok(projects)
    }

    /// Remove both the snapshot and the CRDT state of a project, closing its
    /// change feed.
    pub fn delete_project(&self, project_id: &str) -> Result<(), StoreError> {
        let mut batch = rocksdb::WriteBatch::default();
        batch.delete_cf(&self.cf(CF_SNAPSHOTS)?, project_id.as_bytes());
        batch.delete_cf(&self.cf(CF_DOCUMENTS)?, project_id.as_bytes());
        self.db.write(batch)?;
        self.feed.close(project_id);
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn put(&self, cf_name: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(cf_name)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(&cf, key.as_bytes(), value, &write_opts)?;
        Ok(())
    }

    fn get(&self, cf_name: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Ok(None),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl SnapshotStore for CanvasStore {
    async fn write(&self, snapshot: CanvasSnapshot) -> Result<SnapshotChange, StoreError> {
        let store = self.clone();
        let change = blocking(move || {
            let previous = store.put_snapshot(&snapshot)?;
            Ok(SnapshotChange::new(snapshot, previous))
        })
        .await?;
        self.feed.publish(change.clone());
        Ok(change)
    }

    async fn read(&self, project_id: &str) -> Result<Option<CanvasSnapshot>, StoreError> {
        let store = self.clone();
        let project_id = project_id.to_string();
        blocking(move || store.get_snapshot(&project_id)).await
    }

    fn subscribe(&self, project_id: &str) -> broadcast::Receiver<SnapshotChange> {
        self.feed.subscribe(project_id)
    }
}

/// Run a RocksDB call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("store task failed: {e}")))?
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
