//! RocksDB-backed durable keyspace used by the store hub.
//!
//! Column families:
//! - `values`: plain values (bincode `StoredValue`, LZ4 compressed)
//! - `lists`:  list items, keyed by `<key>\0<seq:8 bytes BE>` (LZ4 compressed)
//! - `meta`:   per-list next sequence number (8 bytes BE)
//!
//! List items are written with a monotonically increasing sequence so a prefix
//! scan returns them in insertion order.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use board_core::now_millis;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::StoreError;

const CF_VALUES: &str = "values";
const CF_LISTS: &str = "lists";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_VALUES, CF_LISTS, CF_META];

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
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("board_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, for tests.
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

#[derive(Debug, Serialize, Deserialize)]
struct StoredValue {
    value: String,
    /// Milliseconds since the epoch; `None` never expires.
    expires_at: Option<u64>,
}

impl StoredValue {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(value)
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Durable keyspace: values with optional TTL plus ordered lists.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes list read-modify-write (sequence allocation).
    list_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
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

        log::info!("Opened store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            list_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_VALUES | CF_META => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_LISTS => {
                // Items are already LZ4 compressed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    // ─── Values ───────────────────────────────────────────────────────

    /// Read a value. Expired values read as absent and are removed lazily.
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        validate_key(key)?;
        let cf = self.cf(CF_VALUES)?;
        let Some(bytes) = self.db.get_cf(cf, key.as_bytes())? else {
            return Ok(None);
        };
        let stored = StoredValue::decode(&bytes)?;
        if stored.is_expired(now_millis()) {
            self.db.delete_cf(cf, key.as_bytes())?;
            return Ok(None);
        }
        Ok(Some(stored.value))
    }

    pub fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), StoreError> {
        validate_key(key)?;
        if self.list_len(key)? > 0 {
            return Err(StoreError::WrongType(key.to_string()));
        }
        let stored = StoredValue {
            value: value.to_string(),
            expires_at: ttl_ms.map(|ttl| now_millis() + ttl),
        };
        self.db
            .put_cf_opt(self.cf(CF_VALUES)?, key.as_bytes(), stored.encode()?, &self.write_opts())?;
        Ok(())
    }

    /// Remove a value or a whole list.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        let _guard = self.lock_lists()?;
        let cf_values = self.cf(CF_VALUES)?;
        let cf_lists = self.cf(CF_LISTS)?;
        let cf_meta = self.cf(CF_META)?;

        let existed = self.db.get_cf(cf_values, key.as_bytes())?.is_some()
            || self.first_item_key(key)?.is_some();

        let (start, end) = list_range(key);
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_values, key.as_bytes());
        batch.delete_cf(cf_meta, key.as_bytes());
        batch.delete_range_cf(cf_lists, &start, &end);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(existed)
    }

    // ─── Lists ────────────────────────────────────────────────────────

    pub fn push(&self, key: &str, item: &str) -> Result<usize, StoreError> {
        self.push_all(key, std::slice::from_ref(&item.to_string()))
    }

    /// Append items in order within one write batch. Returns the new length.
    pub fn push_all(&self, key: &str, items: &[String]) -> Result<usize, StoreError> {
        validate_key(key)?;
        if self.db.get_cf(self.cf(CF_VALUES)?, key.as_bytes())?.is_some() {
            return Err(StoreError::WrongType(key.to_string()));
        }

        let _guard = self.lock_lists()?;
        let cf_lists = self.cf(CF_LISTS)?;
        let cf_meta = self.cf(CF_META)?;

        let mut seq = self.next_seq(key)?;
        let mut batch = WriteBatch::default();
        for item in items {
            batch.put_cf(cf_lists, item_key(key, seq), lz4_flex::compress_prepend_size(item.as_bytes()));
            seq += 1;
        }
        batch.put_cf(cf_meta, key.as_bytes(), seq.to_be_bytes());
        self.db.write_opt(batch, &self.write_opts())?;

        self.list_len(key)
    }

    /// All items of a list in insertion order.
    pub fn get_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        validate_key(key)?;
        let cf = self.cf(CF_LISTS)?;
        let (start, end) = list_range(key);

        let mut items = Vec::new();
        for entry in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (item_key, value) = entry?;
            if item_key.as_ref() >= end.as_slice() {
                break;
            }
            let raw = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            let item =
                String::from_utf8(raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
            items.push(item);
        }
        Ok(items)
    }

    pub fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let cf = self.cf(CF_LISTS)?;
        let (start, end) = list_range(key);
        let mut count = 0;
        for entry in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (item_key, _) = entry?;
            if item_key.as_ref() >= end.as_slice() {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn lock_lists(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.list_lock
            .lock()
            .map_err(|_| StoreError::Database("list lock poisoned".into()))
    }

    fn next_seq(&self, key: &str) -> Result<u64, StoreError> {
        match self.db.get_cf(self.cf(CF_META)?, key.as_bytes())? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf))
            }
            _ => Ok(0),
        }
    }

    fn first_item_key(&self, key: &str) -> Result<Option<Box<[u8]>>, StoreError> {
        let cf = self.cf(CF_LISTS)?;
        let (start, end) = list_range(key);
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        match iter.next() {
            Some(entry) => {
                let (item_key, _) = entry?;
                Ok((item_key.as_ref() < end.as_slice()).then_some(item_key))
            }
            None => Ok(None),
        }
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.as_bytes().contains(&0) {
        return Err(StoreError::InvalidKey(key.escape_debug().to_string()));
    }
    Ok(())
}

/// `<key>\0<seq BE>`
fn item_key(key: &str, seq: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 9);
    out.extend_from_slice(key.as_bytes());
    out.push(0);
    out.extend_from_slice(&seq.to_be_bytes());
    out
}

/// Half-open key range covering every item of a list.
fn list_range(key: &str) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(key.len() + 1);
    start.extend_from_slice(key.as_bytes());
    let mut end = start.clone();
    start.push(0);
    end.push(1);
    (start, end)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_value_roundtrip() {
        let (_dir, store) = open_temp();
        assert_eq!(store.get("missing").unwrap(), None);
        store.set("k", "hello", None).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("hello"));
        assert!(store.delete("k").unwrap());
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let (_dir, store) = open_temp();
        store.set("k", "v", Some(1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_list_order_and_delete() {
        let (_dir, store) = open_temp();
        assert_eq!(store.push("board:a:actions", "1").unwrap(), 1);
        assert_eq!(
            store.push_all("board:a:actions", &["2".into(), "3".into()]).unwrap(),
            3
        );
        assert_eq!(store.get_all("board:a:actions").unwrap(), vec!["1", "2", "3"]);

        assert!(store.delete("board:a:actions").unwrap());
        assert!(store.get_all("board:a:actions").unwrap().is_empty());
        assert!(!store.delete("board:a:actions").unwrap());
    }

    #[test]
    fn test_lists_with_shared_prefix_are_isolated() {
        let (_dir, store) = open_temp();
        store.push("board:a", "x").unwrap();
        store.push("board:ab", "y").unwrap();
        assert_eq!(store.get_all("board:a").unwrap(), vec!["x"]);
        assert_eq!(store.get_all("board:ab").unwrap(), vec!["y"]);
    }

    #[test]
    fn test_wrong_type_and_invalid_key() {
        let (_dir, store) = open_temp();
        store.set("v", "1", None).unwrap();
        assert!(matches!(store.push("v", "x"), Err(StoreError::WrongType(_))));
        store.push("l", "x").unwrap();
        assert!(matches!(store.set("l", "1", None), Err(StoreError::WrongType(_))));
        assert!(matches!(store.get("bad\0key"), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.push("list", "a").unwrap();
            store.set("value", "b", None).unwrap();
            store.sync().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.get_all("list").unwrap(), vec!["a"]);
        assert_eq!(store.get("value").unwrap().as_deref(), Some("b"));
        store.push("list", "c").unwrap();
        assert_eq!(store.get_all("list").unwrap(), vec!["a", "c"]);
    }
}
