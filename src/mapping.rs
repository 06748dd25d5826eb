//! Versioned mapping state.
//!
//! Current values live in `mapping_value` (or, for reduced-tracking mappings,
//! only in `cache`). Every mutation caused by a transaction appends a record
//! to `mapping_history` that points back at the previous record of the same
//! key, so any key can be walked back in time and the whole table can be
//! rebuilt at an earlier height.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::crypto;
use crate::explorer::ExplorerMessage;
use crate::ledger::Field;
use crate::metrics;
use crate::storage::{KvRead, StagedBatch, Store};

pub const CF_MAPPING: &str = "mapping";
pub const CF_MAPPING_VALUE: &str = "mapping_value";
pub const CF_HISTORY: &str = "mapping_history";
pub const CF_HISTORY_LAST_ID: &str = "mapping_history_last_id";
pub const CF_CACHE: &str = "cache";
pub const CF_CACHE_SNAPSHOT: &str = "cache_snapshot";
pub const CF_CACHE_META: &str = "cache_meta";
pub const CF_META: &str = "meta";

pub const NEXT_HISTORY_ID_KEY: &[u8] = b"next_history_id";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub mapping_id: Field,
    pub program_id: String,
    pub mapping_name: String,
}

impl MappingRecord {
    pub fn cache_name(&self) -> String {
        cache_name(&self.program_id, &self.mapping_name)
    }
}

pub fn cache_name(program_id: &str, mapping_name: &str) -> String {
    format!("{program_id}:{mapping_name}")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingValue {
    pub mapping_id: Field,
    pub key_id: Field,
    pub value_id: Field,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingHistoryRecord {
    pub id: u64,
    pub mapping_id: Field,
    pub height: u32,
    pub key_id: Field,
    pub key: Vec<u8>,
    /// `None` records a removal.
    pub value: Option<Vec<u8>>,
    pub from_transaction: bool,
    pub previous_id: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key_id: Field,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub height: u32,
    /// `None` pins the snapshot.
    pub expires_at: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotKind {
    History,
    RollbackBackup,
}

impl SnapshotKind {
    fn as_str(self) -> &'static str {
        match self {
            SnapshotKind::History => "history",
            SnapshotKind::RollbackBackup => "rollback_backup",
        }
    }
}

pub fn snapshot_name(cache: &str, kind: SnapshotKind, height: u32) -> String {
    format!("{cache}:{}:{height}", kind.as_str())
}

/// Applied effect of a finalize step, in the form the store persists it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MappingOperation {
    InitializeMapping {
        mapping_id: Field,
        program_id: String,
        mapping_name: String,
    },
    UpdateKeyValue {
        program_id: String,
        mapping_name: String,
        value: MappingValue,
        height: u32,
        from_transaction: bool,
    },
    RemoveKeyValue {
        program_id: String,
        mapping_name: String,
        mapping_id: Field,
        key_id: Field,
        key: Vec<u8>,
        height: u32,
        from_transaction: bool,
    },
}

impl MappingOperation {
    pub fn mapping_id(&self) -> &Field {
        match self {
            MappingOperation::InitializeMapping { mapping_id, .. } => mapping_id,
            MappingOperation::UpdateKeyValue { value, .. } => &value.mapping_id,
            MappingOperation::RemoveKeyValue { mapping_id, .. } => mapping_id,
        }
    }
}

fn value_key(mapping_id: &Field, key_id: &Field) -> Vec<u8> {
    [mapping_id.as_slice(), key_id.as_slice()].concat()
}

fn prefix_of(name: &str) -> Vec<u8> {
    let mut p = name.as_bytes().to_vec();
    p.push(0);
    p
}

fn cache_key(name: &str, key_id: &[u8]) -> Vec<u8> {
    [prefix_of(name).as_slice(), key_id].concat()
}

/// Which mappings keep their current value only in the fast cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackingPolicy {
    reduced: Vec<(String, String)>,
}

impl TrackingPolicy {
    /// Parses `program/mapping` entries.
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut reduced = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.as_ref();
            let (program, mapping) = entry
                .split_once('/')
                .ok_or_else(|| anyhow!("reduced-tracking entry '{entry}' is not program/mapping"))?;
            reduced.push((program.to_string(), mapping.to_string()));
        }
        Ok(Self { reduced })
    }

    /// Every mapping fully tracked.
    pub fn full() -> Self {
        Self { reduced: Vec::new() }
    }

    pub fn is_reduced(&self, program_id: &str, mapping_name: &str) -> bool {
        self.reduced.iter().any(|(p, m)| p == program_id && m == mapping_name)
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.reduced.iter().map(|(p, m)| cache_name(p, m)).collect()
    }
}

impl Default for TrackingPolicy {
    fn default() -> Self {
        let reduced = ["committee", "bonded", "delegated"]
            .into_iter()
            .map(|m| (crate::program::CREDITS_PROGRAM_ID.to_string(), m.to_string()))
            .collect();
        Self { reduced }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RevertError {
    #[error("no cache backup at or below height {height}")]
    NoBackup { height: u32 },
    #[error("cache backup key {0} is missing")]
    BackupKeyMissing(String),
    #[error("cannot revert to height {target}: local tip is {latest}")]
    AboveTip { target: u32, latest: u32 },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevertSummary {
    pub height: u32,
    pub backup_height: Option<u32>,
    pub history_removed: u64,
    pub values_restored: u64,
    pub blocks_reverted: u32,
    /// Stored blocks re-applied on top of an older cache backup.
    pub blocks_replayed: u32,
}

/// Undoes the non-mapping side effects of blocks during a revert.
pub trait BlockReverter {
    /// Stages the removal of every block above `height` and returns how many
    /// blocks were reverted.
    fn revert_blocks_above(&self, batch: &mut StagedBatch<'_>, height: u32) -> Result<u32>;

    fn latest_height(&self) -> Result<Option<u32>>;
}

fn read_value<R: KvRead>(r: &R, policy: &TrackingPolicy, mapping_id: &Field, key_id: &Field) -> Result<Option<MappingValue>> {
    let Some(record) = r.read::<MappingRecord>(CF_MAPPING, mapping_id)? else {
        return Ok(None);
    };
    if policy.is_reduced(&record.program_id, &record.mapping_name) {
        let entry = r.read::<CacheEntry>(CF_CACHE, &cache_key(&record.cache_name(), key_id))?;
        Ok(entry.map(|e| MappingValue {
            mapping_id: *mapping_id,
            key_id: *key_id,
            value_id: crypto::value_id(key_id, &e.value),
            key: e.key,
            value: e.value,
        }))
    } else {
        r.read(CF_MAPPING_VALUE, &value_key(mapping_id, key_id))
    }
}

fn load_entries<R: KvRead>(r: &R, policy: &TrackingPolicy, program_id: &str, mapping_name: &str) -> Result<Vec<CacheEntry>> {
    if policy.is_reduced(program_id, mapping_name) {
        let prefix = prefix_of(&cache_name(program_id, mapping_name));
        return Ok(r.scan::<CacheEntry>(CF_CACHE, &prefix)?.into_iter().map(|(_, e)| e).collect());
    }
    let mapping_id = crypto::mapping_id(program_id, mapping_name);
    Ok(r.scan::<MappingValue>(CF_MAPPING_VALUE, &mapping_id)?
        .into_iter()
        .map(|(_, v)| CacheEntry { key_id: v.key_id, key: v.key, value: v.value })
        .collect())
}

fn load_next_history_id(db: &Store) -> Result<u64> {
    if let Some(next) = db.get::<u64>(CF_META, NEXT_HISTORY_ID_KEY)? {
        return Ok(next);
    }
    match db.last_key(CF_HISTORY)? {
        Some(k) if k.len() == 8 => {
            let mut id = [0u8; 8];
            id.copy_from_slice(&k);
            Ok(u64::from_be_bytes(id) + 1)
        }
        _ => Ok(1),
    }
}

fn snapshot_heights<R: KvRead>(r: &R, name: &str, kind: SnapshotKind) -> Result<Vec<(Vec<u8>, SnapshotMeta)>> {
    let prefix = format!("{name}:{}:", kind.as_str());
    r.scan::<SnapshotMeta>(CF_CACHE_META, prefix.as_bytes())
}

fn drop_snapshot(batch: &mut StagedBatch<'_>, snapshot: &[u8]) -> Result<()> {
    let mut prefix = snapshot.to_vec();
    prefix.push(0);
    batch.delete_prefix(CF_CACHE_SNAPSHOT, &prefix)?;
    batch.delete(CF_CACHE_META, snapshot)
}

/// Copies the live cache of `name` into `snapshot`, replacing what was there.
fn copy_cache(batch: &mut StagedBatch<'_>, name: &str, snapshot: &str, meta: SnapshotMeta) -> Result<usize> {
    let live = prefix_of(name);
    let target = prefix_of(snapshot);
    batch.delete_prefix(CF_CACHE_SNAPSHOT, &target)?;
    let entries = batch.scan_raw(CF_CACHE, &live)?;
    for (k, v) in &entries {
        batch.put_raw(CF_CACHE_SNAPSHOT, &[target.as_slice(), &k[live.len()..]].concat(), v.clone())?;
    }
    batch.put(CF_CACHE_META, snapshot.as_bytes(), &meta)?;
    Ok(entries.len())
}

pub struct MappingStore {
    db: Arc<Store>,
    policy: TrackingPolicy,
    writer: Mutex<()>,
    messages: Option<UnboundedSender<ExplorerMessage>>,
}

impl MappingStore {
    pub fn new(db: Arc<Store>, policy: TrackingPolicy) -> Self {
        Self { db, policy, writer: Mutex::new(()), messages: None }
    }

    /// Storage failures are also published here before being returned.
    pub fn with_messages(mut self, messages: UnboundedSender<ExplorerMessage>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn db(&self) -> &Arc<Store> {
        &self.db
    }

    pub fn policy(&self) -> &TrackingPolicy {
        &self.policy
    }

    fn report<T>(&self, result: Result<T>) -> Result<T> {
        if let (Err(e), Some(tx)) = (&result, &self.messages) {
            let _ = tx.send(ExplorerMessage::DatabaseError(format!("{e:#}")));
        }
        result
    }

    /// Opens a write transaction. Blocks while another one is open.
    pub fn begin(&self) -> Result<MappingTxn<'_>> {
        let guard = self.writer.lock().map_err(|_| anyhow!("mapping store writer lock poisoned"))?;
        let next_history_id = self.report(load_next_history_id(&self.db))?;
        Ok(MappingTxn {
            parent: self,
            _guard: guard,
            batch: StagedBatch::new(&self.db),
            next_history_id,
            history_written: 0,
        })
    }

    pub fn read(&self, mapping_id: &Field, key_id: &Field) -> Result<Option<MappingValue>> {
        read_value(&*self.db, &self.policy, mapping_id, key_id)
    }

    pub fn mapping(&self, mapping_id: &Field) -> Result<Option<MappingRecord>> {
        self.db.get(CF_MAPPING, mapping_id)
    }

    pub fn get_value(&self, program_id: &str, mapping_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mapping_id = crypto::mapping_id(program_id, mapping_name);
        let key_id = crypto::key_id(program_id, mapping_name, key);
        Ok(self.read(&mapping_id, &key_id)?.map(|v| v.value))
    }

    pub fn entries(&self, program_id: &str, mapping_name: &str) -> Result<Vec<CacheEntry>> {
        load_entries(&*self.db, &self.policy, program_id, mapping_name)
    }

    pub fn mapping_size(&self, program_id: &str, mapping_name: &str) -> Result<u64> {
        Ok(self.entries(program_id, mapping_name)?.len() as u64)
    }

    /// Up to `count` entries ordered by key id, starting after `cursor`.
    /// Returns the cursor for the next page when more entries remain.
    pub fn list_key_values(
        &self,
        program_id: &str,
        mapping_name: &str,
        count: usize,
        cursor: Option<Field>,
    ) -> Result<(Vec<CacheEntry>, Option<Field>)> {
        let mut rest: Vec<CacheEntry> = self
            .entries(program_id, mapping_name)?
            .into_iter()
            .filter(|e| cursor.map_or(true, |c| e.key_id > c))
            .collect();
        let more = rest.len() > count;
        rest.truncate(count);
        let next = if more { rest.last().map(|e| e.key_id) } else { None };
        Ok((rest, next))
    }

    pub fn history_record(&self, id: u64) -> Result<Option<MappingHistoryRecord>> {
        self.db.get(CF_HISTORY, &id.to_be_bytes())
    }

    /// History of one key, newest first, following `previous_id` links.
    pub fn history_chain(&self, key_id: &Field) -> Result<Vec<MappingHistoryRecord>> {
        let mut chain = Vec::new();
        let mut next = self.db.get::<u64>(CF_HISTORY_LAST_ID, key_id)?;
        while let Some(id) = next {
            let record = self
                .history_record(id)?
                .ok_or_else(|| anyhow!("history record {id} referenced but missing"))?;
            next = record.previous_id;
            chain.push(record);
        }
        Ok(chain)
    }

    /// Transaction-triggered history written by the block at `height`.
    pub fn history_at_height(&self, height: u32) -> Result<Vec<MappingHistoryRecord>> {
        let mut out = Vec::new();
        self.db.for_each_rev(CF_HISTORY, |_, v| {
            let record: MappingHistoryRecord = crate::storage::decode(v)?;
            if record.height > height {
                return Ok(true);
            }
            if record.height < height {
                return Ok(false);
            }
            if record.from_transaction {
                out.push(record);
            }
            Ok(true)
        })?;
        out.reverse();
        Ok(out)
    }

    /// Value `key_id` held before history record `history_id` was written.
    pub fn previous_value(&self, history_id: u64, key_id: &Field) -> Result<Option<Vec<u8>>> {
        Ok(self
            .history_chain(key_id)?
            .into_iter()
            .find(|r| r.id < history_id)
            .and_then(|r| r.value))
    }

    pub fn current_values(&self) -> Result<Vec<MappingValue>> {
        Ok(self.db.scan::<MappingValue>(CF_MAPPING_VALUE, &[])?.into_iter().map(|(_, v)| v).collect())
    }

    pub fn cache_entries(&self, name: &str) -> Result<Vec<CacheEntry>> {
        Ok(self.db.scan::<CacheEntry>(CF_CACHE, &prefix_of(name))?.into_iter().map(|(_, e)| e).collect())
    }

    pub fn snapshot_entries(&self, name: &str, kind: SnapshotKind, height: u32) -> Result<Vec<CacheEntry>> {
        let snapshot = snapshot_name(name, kind, height);
        Ok(self
            .db
            .scan::<CacheEntry>(CF_CACHE_SNAPSHOT, &prefix_of(&snapshot))?
            .into_iter()
            .map(|(_, e)| e)
            .collect())
    }

    pub fn snapshots(&self, name: &str, kind: SnapshotKind) -> Result<Vec<SnapshotMeta>> {
        let mut metas: Vec<SnapshotMeta> = snapshot_heights(&*self.db, name, kind)?.into_iter().map(|(_, m)| m).collect();
        metas.sort_by_key(|m| m.height);
        Ok(metas)
    }

    /// Newest `history` snapshot height shared by every reduced-tracking mapping.
    pub fn latest_backup_height(&self) -> Result<Option<u32>> {
        let Some(first) = self.policy.cache_names().into_iter().next() else {
            return Ok(None);
        };
        Ok(self.snapshots(&first, SnapshotKind::History)?.last().map(|m| m.height))
    }

    /// Rolls mapping state and block bookkeeping back to `height`.
    ///
    /// Preconditions are checked before anything is written; the whole revert
    /// is one atomic batch.
    pub fn revert_to_height(&self, height: u32, blocks: &dyn BlockReverter) -> Result<RevertSummary, RevertError> {
        let _guard = self
            .writer
            .lock()
            .map_err(|_| RevertError::Storage(anyhow!("mapping store writer lock poisoned")))?;
        let result = self.revert_locked(height, blocks);
        if let (Err(RevertError::Storage(e)), Some(tx)) = (&result, &self.messages) {
            let _ = tx.send(ExplorerMessage::DatabaseError(format!("{e:#}")));
        }
        result
    }

    pub fn revert_to_last_backup(&self, blocks: &dyn BlockReverter) -> Result<RevertSummary, RevertError> {
        let height = match self.latest_backup_height()? {
            Some(h) => h,
            None if self.policy.cache_names().is_empty() => blocks.latest_height()?.unwrap_or(0),
            None => return Err(RevertError::NoBackup { height: u32::MAX }),
        };
        self.revert_to_height(height, blocks)
    }

    /// Newest `history` snapshot at or below `height` that every
    /// reduced-tracking mapping has. `Ok(None)` when nothing is cache-mirrored.
    pub fn backup_height_at_or_below(&self, height: u32) -> Result<Option<u32>, RevertError> {
        let names = self.policy.cache_names();
        let Some(first) = names.first() else {
            return Ok(None);
        };
        let backup = snapshot_heights(&*self.db, first, SnapshotKind::History)?
            .into_iter()
            .map(|(_, m)| m.height)
            .filter(|b| *b <= height)
            .max()
            .ok_or(RevertError::NoBackup { height })?;
        for name in &names {
            let snapshot = snapshot_name(name, SnapshotKind::History, backup);
            if self.db.get_raw_bytes(CF_CACHE_META, snapshot.as_bytes())?.is_none() {
                return Err(RevertError::BackupKeyMissing(snapshot));
            }
        }
        Ok(Some(backup))
    }

    fn revert_locked(&self, height: u32, blocks: &dyn BlockReverter) -> Result<RevertSummary, RevertError> {
        if let Some(latest) = blocks.latest_height()? {
            if height > latest {
                return Err(RevertError::AboveTip { target: height, latest });
            }
        }
        let backup_height = self.backup_height_at_or_below(height)?;
        info!("reverting mapping state to height {height} (cache backup {backup_height:?})");

        let mut batch = StagedBatch::new(&self.db);

        // Ids grow with height, so everything above `height` is a suffix of the
        // history table. For each key touched there, the oldest removed record
        // points at the entry that becomes its head again.
        let mut touched: HashMap<Field, (Field, Option<u64>)> = HashMap::new();
        let mut history_removed = 0u64;
        let mut removed = Vec::new();
        self.db.for_each_rev(CF_HISTORY, |k, v| {
            let record: MappingHistoryRecord = crate::storage::decode(v)?;
            if record.height <= height {
                return Ok(false);
            }
            removed.push(k.to_vec());
            touched.insert(record.key_id, (record.mapping_id, record.previous_id));
            Ok(true)
        })?;
        for key in &removed {
            batch.delete(CF_HISTORY, key)?;
            history_removed += 1;
        }

        let mut mappings: HashMap<Field, Option<MappingRecord>> = HashMap::new();
        let mut values_restored = 0u64;
        for (key_id, (mapping_id, head)) in touched {
            let mapping = match mappings.get(&mapping_id) {
                Some(m) => m.clone(),
                None => {
                    let m: Option<MappingRecord> = self.db.get(CF_MAPPING, &mapping_id)?;
                    mappings.insert(mapping_id, m.clone());
                    m
                }
            };
            let reduced = matches!(&mapping, Some(m) if self.policy.is_reduced(&m.program_id, &m.mapping_name));
            let slot = value_key(&mapping_id, &key_id);

            let record = match head {
                Some(id) => {
                    batch.put(CF_HISTORY_LAST_ID, &key_id, &id)?;
                    let record: Option<MappingHistoryRecord> = self.db.get(CF_HISTORY, &id.to_be_bytes())?;
                    Some(record.ok_or_else(|| anyhow!("history record {id} missing"))?)
                }
                None => {
                    batch.delete(CF_HISTORY_LAST_ID, &key_id)?;
                    None
                }
            };
            if reduced {
                continue;
            }
            match record.and_then(|r| r.value.map(|value| (r.key, value))) {
                Some((key, value)) if mapping.is_some() => {
                    let restored = MappingValue {
                        mapping_id,
                        key_id,
                        value_id: crypto::value_id(&key_id, &value),
                        key,
                        value,
                    };
                    batch.put(CF_MAPPING_VALUE, &slot, &restored)?;
                    values_restored += 1;
                }
                Some(_) => {
                    debug!("history for unknown mapping {} skipped", hex::encode(mapping_id));
                    batch.delete(CF_MAPPING_VALUE, &slot)?;
                }
                None => batch.delete(CF_MAPPING_VALUE, &slot)?,
            }
        }

        let blocks_reverted = blocks.revert_blocks_above(&mut batch, height)?;

        if let Some(h) = backup_height {
            for name in self.policy.cache_names() {
                self.restore_cache(&mut batch, &name, h)?;
            }
        }

        batch.commit()?;
        metrics::REVERTS.inc();
        info!(
            "reverted to height {height}: {blocks_reverted} blocks, {history_removed} history records removed, {values_restored} values restored"
        );
        Ok(RevertSummary { height, backup_height, history_removed, values_restored, blocks_reverted, blocks_replayed: 0 })
    }

    fn restore_cache(&self, batch: &mut StagedBatch<'_>, name: &str, height: u32) -> Result<()> {
        let live = prefix_of(name);
        let snapshot = snapshot_name(name, SnapshotKind::History, height);
        let source = prefix_of(&snapshot);
        batch.delete_prefix(CF_CACHE, &live)?;
        for (k, v) in batch.scan_raw(CF_CACHE_SNAPSHOT, &source)? {
            batch.put_raw(CF_CACHE, &[live.as_slice(), &k[source.len()..]].concat(), v)?;
        }
        batch.put(CF_CACHE_META, snapshot.as_bytes(), &SnapshotMeta { height, expires_at: None })?;

        for (key, meta) in snapshot_heights(&*batch, name, SnapshotKind::History)? {
            if meta.height > height {
                drop_snapshot(batch, &key)?;
            }
        }
        for (key, _) in snapshot_heights(&*batch, name, SnapshotKind::RollbackBackup)? {
            drop_snapshot(batch, &key)?;
        }
        Ok(())
    }
}

/// Writes of one block, staged until [`MappingTxn::commit`].
pub struct MappingTxn<'a> {
    parent: &'a MappingStore,
    _guard: MutexGuard<'a, ()>,
    batch: StagedBatch<'a>,
    next_history_id: u64,
    history_written: u64,
}

impl<'a> MappingTxn<'a> {
    pub fn batch(&mut self) -> &mut StagedBatch<'a> {
        &mut self.batch
    }

    pub fn staged(&self) -> &StagedBatch<'a> {
        &self.batch
    }

    pub fn policy(&self) -> &TrackingPolicy {
        &self.parent.policy
    }

    pub fn read(&self, mapping_id: &Field, key_id: &Field) -> Result<Option<MappingValue>> {
        read_value(&self.batch, &self.parent.policy, mapping_id, key_id)
    }

    pub fn mapping(&self, mapping_id: &Field) -> Result<Option<MappingRecord>> {
        self.batch.read(CF_MAPPING, mapping_id)
    }

    pub fn entries(&self, program_id: &str, mapping_name: &str) -> Result<Vec<CacheEntry>> {
        load_entries(&self.batch, &self.parent.policy, program_id, mapping_name)
    }

    fn require_mapping(&self, mapping_id: &Field) -> Result<MappingRecord> {
        self.mapping(mapping_id)?
            .ok_or_else(|| anyhow!("mapping {} not found", hex::encode(mapping_id)))
    }

    pub fn initialize_mapping(&mut self, mapping_id: &Field, program_id: &str, mapping_name: &str) -> Result<()> {
        if self.mapping(mapping_id)?.is_some() {
            bail!("mapping {program_id}/{mapping_name} already exists");
        }
        let record = MappingRecord {
            mapping_id: *mapping_id,
            program_id: program_id.to_string(),
            mapping_name: mapping_name.to_string(),
        };
        self.batch.put(CF_MAPPING, mapping_id, &record)
    }

    /// Like [`initialize_mapping`](Self::initialize_mapping) but a no-op when
    /// the mapping is already registered. Returns whether it was created.
    pub fn initialize_builtin_mapping(&mut self, mapping_id: &Field, program_id: &str, mapping_name: &str) -> Result<bool> {
        if self.mapping(mapping_id)?.is_some() {
            return Ok(false);
        }
        self.initialize_mapping(mapping_id, program_id, mapping_name)?;
        Ok(true)
    }

    fn write_history(
        &mut self,
        mapping_id: &Field,
        key_id: &Field,
        key: &[u8],
        value: Option<&[u8]>,
        height: u32,
        from_transaction: bool,
    ) -> Result<u64> {
        let previous_id = self.batch.read::<u64>(CF_HISTORY_LAST_ID, key_id)?;
        let id = self.next_history_id;
        self.next_history_id += 1;
        let record = MappingHistoryRecord {
            id,
            mapping_id: *mapping_id,
            height,
            key_id: *key_id,
            key: key.to_vec(),
            value: value.map(<[u8]>::to_vec),
            from_transaction,
            previous_id,
        };
        self.batch.put(CF_HISTORY, &id.to_be_bytes(), &record)?;
        self.batch.put(CF_HISTORY_LAST_ID, key_id, &id)?;
        self.history_written += 1;
        Ok(id)
    }

    /// Sets the current value of a key. Returns the history id when a history
    /// record was written.
    pub fn upsert(&mut self, value: &MappingValue, height: u32, from_transaction: bool) -> Result<Option<u64>> {
        let record = self.require_mapping(&value.mapping_id)?;
        if self.parent.policy.is_reduced(&record.program_id, &record.mapping_name) {
            let entry = CacheEntry { key_id: value.key_id, key: value.key.clone(), value: value.value.clone() };
            self.batch.put(CF_CACHE, &cache_key(&record.cache_name(), &value.key_id), &entry)?;
            if !from_transaction {
                return Ok(None);
            }
        } else {
            self.batch.put(CF_MAPPING_VALUE, &value_key(&value.mapping_id, &value.key_id), value)?;
        }
        self.write_history(&value.mapping_id, &value.key_id, &value.key, Some(&value.value), height, from_transaction)
            .map(Some)
    }

    pub fn remove(&mut self, mapping_id: &Field, key_id: &Field, key: &[u8], height: u32, from_transaction: bool) -> Result<Option<u64>> {
        let record = self.require_mapping(mapping_id)?;
        if self.parent.policy.is_reduced(&record.program_id, &record.mapping_name) {
            self.batch.delete(CF_CACHE, &cache_key(&record.cache_name(), key_id))?;
            if !from_transaction {
                return Ok(None);
            }
        } else {
            self.batch.delete(CF_MAPPING_VALUE, &value_key(mapping_id, key_id))?;
        }
        self.write_history(mapping_id, key_id, key, None, height, from_transaction).map(Some)
    }

    pub fn apply(&mut self, op: &MappingOperation) -> Result<()> {
        match op {
            MappingOperation::InitializeMapping { mapping_id, program_id, mapping_name } => {
                self.initialize_mapping(mapping_id, program_id, mapping_name)
            }
            MappingOperation::UpdateKeyValue { value, height, from_transaction, .. } => {
                self.upsert(value, *height, *from_transaction).map(|_| ())
            }
            MappingOperation::RemoveKeyValue { mapping_id, key_id, key, height, from_transaction, .. } => {
                self.remove(mapping_id, key_id, key, *height, *from_transaction).map(|_| ())
            }
        }
    }

    /// Snapshots every reduced-tracking mapping as of `height` and prunes
    /// snapshots whose retention ran out.
    pub fn backup_cache(&mut self, height: u32, retention: u32) -> Result<()> {
        for name in self.parent.policy.cache_names() {
            let snapshot = snapshot_name(&name, SnapshotKind::History, height);
            let meta = SnapshotMeta { height, expires_at: Some(height.saturating_add(retention)) };
            let n = copy_cache(&mut self.batch, &name, &snapshot, meta)?;
            debug!("cache backup {snapshot}: {n} entries");
            for (key, meta) in snapshot_heights(&self.batch, &name, SnapshotKind::History)? {
                if matches!(meta.expires_at, Some(exp) if exp < height) {
                    drop_snapshot(&mut self.batch, &key)?;
                }
            }
        }
        Ok(())
    }

    /// Keeps a copy of the pre-block cache, replacing the previous one.
    pub fn rollback_backup(&mut self, height: u32) -> Result<()> {
        for name in self.parent.policy.cache_names() {
            for (key, _) in snapshot_heights(&self.batch, &name, SnapshotKind::RollbackBackup)? {
                drop_snapshot(&mut self.batch, &key)?;
            }
            let snapshot = snapshot_name(&name, SnapshotKind::RollbackBackup, height);
            copy_cache(&mut self.batch, &name, &snapshot, SnapshotMeta { height, expires_at: None })?;
        }
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        let MappingTxn { parent, _guard, mut batch, next_history_id, history_written } = self;
        let result = batch
            .put(CF_META, NEXT_HISTORY_ID_KEY, &next_history_id)
            .and_then(|_| batch.commit());
        if result.is_ok() {
            metrics::HISTORY_RECORDS.inc_by(history_written);
        }
        parent.report(result)
    }
}
