//! RocksDB-backed persistent item store.
//!
//! Column families:
//! - `items`: bincode-encoded `Item`, keyed by big-endian id
//! - `meta`: store counters (`next_id`)
//!
//! Each `commit` is one `WriteBatch`, so a crash never leaves half a
//! mutation on disk.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{ItemBatch, ItemStore, StoreError};
use crate::item::{Item, ItemId};

/// Column family names.
const CF_ITEMS: &str = "items";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_ITEMS, CF_META];

const NEXT_ID_KEY: &[u8] = b"next_id";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Enable fsync on every commit (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("basket_data"),
            block_cache_size: 32 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// RocksDB-backed item store.
pub struct RocksItemStore {
    /// RocksDB instance (single-threaded mode; writes are gated by the service)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksItemStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
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

        log::info!("Opened item store at {}", config.path.display());
        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_ITEMS => {
                // Point lookups by id plus full scans for list reads
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            CF_META => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of stored items (including hidden checked ones).
    pub fn item_count(&self) -> Result<usize, StoreError> {
        Ok(self.load_all()?.len())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn item_key(id: ItemId) -> [u8; 8] {
        id.to_be_bytes()
    }

    fn encode_item(item: &Item) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(item, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode_item(bytes: &[u8]) -> Result<Item, StoreError> {
        let (item, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(item)
    }

    fn read_next_id(&self) -> Result<ItemId, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, NEXT_ID_KEY)? {
            Some(bytes) => {
                let buf: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::DeserializationError("Invalid next_id counter".into())
                })?;
                Ok(u64::from_be_bytes(buf))
            }
            None => Ok(1),
        }
    }
}

impl ItemStore for RocksItemStore {
    fn load_all(&self) -> Result<Vec<Item>, StoreError> {
        let cf = self.cf(CF_ITEMS)?;
        let mut items = Vec::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = entry.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            items.push(Self::decode_item(&value)?);
        }
        Ok(items)
    }

    fn find(&self, id: ItemId) -> Result<Option<Item>, StoreError> {
        let cf = self.cf(CF_ITEMS)?;
        match self.db.get_cf(cf, Self::item_key(id))? {
            Some(bytes) => Ok(Some(Self::decode_item(&bytes)?)),
            None => Ok(None),
        }
    }

    fn next_id(&self) -> Result<ItemId, StoreError> {
        self.read_next_id()
    }

    fn commit(&self, batch: ItemBatch) -> Result<(), StoreError> {
        let cf_items = self.cf(CF_ITEMS)?;
        let cf_meta = self.cf(CF_META)?;

        let mut wb = WriteBatch::default();
        for id in &batch.deletes {
            wb.delete_cf(cf_items, Self::item_key(*id));
        }
        for item in &batch.puts {
            wb.put_cf(cf_items, Self::item_key(item.id), Self::encode_item(item)?);
        }
        if let Some(next) = batch.next_id {
            let next = next.max(self.read_next_id()?);
            wb.put_cf(cf_meta, NEXT_ID_KEY, next.to_be_bytes());
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(wb, &write_opts)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn open_temp() -> (tempfile::TempDir, RocksItemStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksItemStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open_close() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert_eq!(store.next_id().unwrap(), 1);
        assert_eq!(store.item_count().unwrap(), 0);
    }

    #[test]
    fn test_commit_put_find() {
        let (_dir, store) = open_temp();
        let mut milk = Item::new(1, "Milk", "1L", 1);
        milk.checked_at = Some(Utc::now());

        store
            .commit(ItemBatch::new().put(milk.clone()).advance_id(2))
            .unwrap();

        let found = store.find(1).unwrap().unwrap();
        assert_eq!(found.name, "Milk");
        assert_eq!(
            found.checked_at.map(|t| t.timestamp_millis()),
            milk.checked_at.map(|t| t.timestamp_millis())
        );
        assert_eq!(store.next_id().unwrap(), 2);
    }

    #[test]
    fn test_load_all_in_id_order() {
        let (_dir, store) = open_temp();
        let batch = ItemBatch::new()
            .put(Item::new(300, "C", "1", 3))
            .put(Item::new(2, "A", "1", 1))
            .put(Item::new(40, "B", "1", 2));
        store.commit(batch).unwrap();

        let ids: Vec<ItemId> = store.load_all().unwrap().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![2, 40, 300]);
    }

    #[test]
    fn test_delete_and_put_same_batch() {
        let (_dir, store) = open_temp();
        store
            .commit(ItemBatch::new().put(Item::new(1, "A", "1", 1)).put(Item::new(2, "B", "1", 2)))
            .unwrap();

        store
            .commit(ItemBatch::new().delete(1).put(Item::new(2, "B2", "3", 1)))
            .unwrap();

        assert!(store.find(1).unwrap().is_none());
        assert_eq!(store.find(2).unwrap().unwrap().name, "B2");
    }

    #[test]
    fn test_reopen_preserves_items_and_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksItemStore::open(StoreConfig::for_testing(&path)).unwrap();
            store
                .commit(ItemBatch::new().put(Item::new(1, "Milk", "1L", 1)).advance_id(2))
                .unwrap();
        }

        let store = RocksItemStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.find(1).unwrap().unwrap().quantity, "1L");
        assert_eq!(store.next_id().unwrap(), 2);
    }
}
