use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{de::DeserializeOwned, Serialize};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// Values are bincode. Block bodies are zstd-compressed on top and must be read
// back with the `_compressed` accessors.

pub const CF_NAMES: [&str; 16] = [
    "default",
    "meta",
    "mapping",
    "mapping_value",
    "mapping_history",
    "mapping_history_last_id",
    "cache",
    "cache_snapshot",
    "cache_meta",
    "block",
    "block_hash",
    "transaction",
    "transition",
    "program",
    "program_function",
    "dag_vertex",
];

pub struct Store {
    pub db: DB,
    path: String,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).context("Failed to serialize value")
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).context("Failed to deserialize value")
}

pub fn encode_compressed<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let raw = encode(value)?;
    zstd::encode_all(&raw[..], 3).context("Failed to compress value")
}

pub fn decode_compressed<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let raw = zstd::decode_all(bytes).context("Failed to decompress value")?;
    decode(&raw)
}

/// Read access shared by the committed store and a staged batch.
pub trait KvRead {
    fn read_raw(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// All entries of `cf` whose key starts with `prefix`, in key order.
    fn scan_raw(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>>
    where
        Self: Sized,
    {
        self.read_raw(cf, key)?
            .map(|v| decode(&v).with_context(|| format!("bad value for key {} in CF '{cf}'", hex::encode(key))))
            .transpose()
    }

    fn read_compressed<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>>
    where
        Self: Sized,
    {
        self.read_raw(cf, key)?.map(|v| decode_compressed(&v)).transpose()
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, T)>>
    where
        Self: Sized,
    {
        self.scan_raw(cf, prefix)?
            .into_iter()
            .map(|(k, v)| decode(&v).map(|t| (k, t)))
            .collect()
    }
}

impl Store {
    /// Perform database health check
    pub fn health_check(&self) -> Result<()> {
        let test_key = b"health_check";
        self.db.put(test_key, b"ok").with_context(|| "Database write test failed")?;
        let value = self.db.get(test_key).with_context(|| "Database read test failed")?;
        if value.as_deref() != Some(b"ok") {
            anyhow::bail!("Database read/write consistency check failed");
        }
        self.db.delete(test_key).with_context(|| "Database delete test failed")?;
        Ok(())
    }

    pub fn open(base_path: &str) -> Result<Self> {
        let db_path = base_path.to_string();

        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(64 * 1024 * 1024);
        cf_opts.set_max_write_buffer_number(2);
        cf_opts.set_target_file_size_base(64 * 1024 * 1024);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = CF_NAMES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_opts.clone()))
            .collect();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let wal_dir = format!("{db_path}/logs");
        std::fs::create_dir_all(&db_path).ok();
        std::fs::create_dir_all(&wal_dir).ok();
        db_opts.set_wal_dir(&wal_dir);

        db_opts.set_use_fsync(false);
        db_opts.set_bytes_per_sync(8 * 1024 * 1024);
        db_opts.set_wal_bytes_per_sync(8 * 1024 * 1024);
        db_opts.set_db_write_buffer_size(256 * 1024 * 1024);
        db_opts.set_max_background_jobs(4);
        db_opts.set_max_open_files(512);
        db_opts.set_wal_recovery_mode(rocksdb::DBRecoveryMode::TolerateCorruptedTailRecords);
        db_opts.set_keep_log_file_num(10);

        let db = DB::open_cf_descriptors(&db_opts, &db_path, cf_descriptors)
            .with_context(|| format!("Failed to open database at '{db_path}'"))?;

        let store = Store { db, path: db_path };
        store.health_check().with_context(|| "Database health check failed during initialization")?;
        tracing::info!("database opened at {}", store.path);
        Ok(store)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn handle(&self, cf: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(cf)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))
    }

    pub fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let data = bincode::serialize(value)
            .with_context(|| format!("Failed to serialize value for key '{key:?}' in CF '{cf}'"))?;
        let handle = self.handle(cf)?;
        self.db
            .put_cf_opt(handle, key, &data, &WriteOptions::default())
            .with_context(|| format!("Failed to PUT to database for key '{key:?}' in CF '{cf}'"))
    }

    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        KvRead::read(self, cf, key)
    }

    /// Fetch raw bytes without attempting to deserialize
    pub fn get_raw_bytes(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let handle = self.handle(cf)?;
        Ok(self.db.get_cf(handle, key)?.map(|v| v.to_vec()))
    }

    pub fn delete(&self, cf: &str, key: &[u8]) -> Result<()> {
        let handle = self.handle(cf)?;
        self.db.delete_cf(handle, key)
            .with_context(|| format!("Failed to DELETE key '{key:?}' in CF '{cf}'"))
    }

    /// Atomically applies a set of writes.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts).with_context(|| "Failed to write batch to database")
    }

    /// Walks `cf` from the last key backwards until `f` returns `false`.
    pub fn for_each_rev<F>(&self, cf: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let handle = self.handle(cf)?;
        for item in self.db.iterator_cf(handle, IteratorMode::End) {
            let (k, v) = item?;
            if !f(&k, &v)? {
                break;
            }
        }
        Ok(())
    }

    pub fn last_key(&self, cf: &str) -> Result<Option<Vec<u8>>> {
        let handle = self.handle(cf)?;
        match self.db.iterator_cf(handle, IteratorMode::End).next() {
            Some(item) => Ok(Some(item?.0.to_vec())),
            None => Ok(None),
        }
    }

    pub fn count(&self, cf: &str) -> Result<u64> {
        let handle = self.handle(cf)?;
        let mut n = 0u64;
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            item?;
            n += 1;
        }
        Ok(n)
    }

    /// Removes every key from every column family except `meta`.
    /// History ids keep counting from where they were.
    pub fn clear_all(&self) -> Result<()> {
        let mut batch = WriteBatch::default();
        for cf in CF_NAMES.iter().filter(|cf| **cf != "meta" && **cf != "default") {
            let handle = self.handle(cf)?;
            for item in self.db.iterator_cf(handle, IteratorMode::Start) {
                let (k, _) = item?;
                batch.delete_cf(handle, k);
            }
        }
        self.write_batch(batch)?;
        self.flush()
    }

    /// Force flush all memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().with_context(|| "Failed to flush database")?;
        if let Err(e) = self.db.flush_wal(true) {
            tracing::warn!("WAL flush failed (non-critical): {e}");
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.db.cancel_all_background_work(true);
        Ok(())
    }

    /// Gets statistics about the database
    pub fn get_stats(&self) -> Result<DatabaseStats> {
        Ok(DatabaseStats {
            block_count: self.count("block")?,
            transaction_count: self.count("transaction")?,
            mapping_count: self.count("mapping")?,
            mapping_value_count: self.count("mapping_value")?,
            history_count: self.count("mapping_history")?,
        })
    }
}

impl KvRead for Store {
    fn read_raw(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_raw_bytes(cf, key)
    }

    fn scan_raw(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let handle = self.handle(cf)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::From(prefix, Direction::Forward)) {
            let (k, v) = item?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub block_count: u64,
    pub transaction_count: u64,
    pub mapping_count: u64,
    pub mapping_value_count: u64,
    pub history_count: u64,
}

/// A pending `WriteBatch` that can be read back before it is committed.
pub struct StagedBatch<'a> {
    store: &'a Store,
    batch: WriteBatch,
    overlay: HashMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl<'a> StagedBatch<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store, batch: WriteBatch::default(), overlay: HashMap::new() }
    }

    pub fn store(&self) -> &'a Store {
        self.store
    }

    pub fn put_raw(&mut self, cf: &str, key: &[u8], value: Vec<u8>) -> Result<()> {
        let handle = self.store.handle(cf)?;
        self.batch.put_cf(handle, key, &value);
        self.overlay.entry(cf.to_string()).or_default().insert(key.to_vec(), Some(value));
        Ok(())
    }

    pub fn put<T: Serialize>(&mut self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let data = encode(value).with_context(|| format!("staging key {} in CF '{cf}'", hex::encode(key)))?;
        self.put_raw(cf, key, data)
    }

    pub fn put_compressed<T: Serialize>(&mut self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let data = encode_compressed(value)?;
        self.put_raw(cf, key, data)
    }

    pub fn delete(&mut self, cf: &str, key: &[u8]) -> Result<()> {
        let handle = self.store.handle(cf)?;
        self.batch.delete_cf(handle, key);
        self.overlay.entry(cf.to_string()).or_default().insert(key.to_vec(), None);
        Ok(())
    }

    /// Deletes every key of `cf` starting with `prefix`, staged writes included.
    pub fn delete_prefix(&mut self, cf: &str, prefix: &[u8]) -> Result<usize> {
        let keys: Vec<Vec<u8>> = self.scan_raw(cf, prefix)?.into_iter().map(|(k, _)| k).collect();
        for k in &keys {
            self.delete(cf, k)?;
        }
        Ok(keys.len())
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn commit(self) -> Result<()> {
        self.store.write_batch(self.batch)
    }
}

impl KvRead for StagedBatch<'_> {
    fn read_raw(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.overlay.get(cf).and_then(|m| m.get(key)) {
            return Ok(staged.clone());
        }
        self.store.get_raw_bytes(cf, key)
    }

    fn scan_raw(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self.store.scan_raw(cf, prefix)?.into_iter().collect();
        if let Some(staged) = self.overlay.get(cf) {
            for (k, v) in staged.range(prefix.to_vec()..).take_while(|(k, _)| k.starts_with(prefix)) {
                match v {
                    Some(v) => merged.insert(k.clone(), v.clone()),
                    None => merged.remove(k),
                };
            }
        }
        Ok(merged.into_iter().collect())
    }
}

pub fn open(cfg: &crate::config::Storage) -> Result<Arc<Store>> {
    let store = Store::open(&cfg.path).with_context(|| {
        format!("database failed to open at '{}' (is another instance running?)", cfg.path)
    })?;
    Ok(Arc::new(store))
}
