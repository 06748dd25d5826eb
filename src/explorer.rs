//! Chain controller.
//!
//! Owns the replay caches and the only write path into the mapping store.
//! Runs as a single actor: peers talk to it through a [`ChainHandle`], so
//! blocks are replayed strictly one after another.

use anyhow::anyhow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainTables, LATEST_HEIGHT_KEY};
use crate::config::{self, Config};
use crate::crypto;
use crate::finalize::{FinalizeError, FinalizeState, Finalizer, LookupError};
use crate::ledger::{Block, BlockHash, BlockHeader, Literal, Transaction};
use crate::mapping::{MappingStore, RevertError, RevertSummary, TrackingPolicy, CF_META};
use crate::metrics;
use crate::program::builtin_programs;
use crate::storage::Store;

pub const REVERT_FLAG: &str = "revert_flag";
pub const CLEAR_FLAG: &str = "clear_flag";

/// Out-of-band notifications for the operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExplorerMessage {
    NodeConnectError(String),
    NodeConnected,
    NodeDisconnected(String),
    DatabaseError(String),
    BlockAdded(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain controller is not running")]
    Closed,
    #[error(transparent)]
    Finalize(#[from] FinalizeError),
    #[error(transparent)]
    Revert(#[from] RevertError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ChainError {
    /// Replay disagreed with the network. Ingestion must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::Finalize(FinalizeError::Inconsistent { .. }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    Added,
    /// The block does not extend the local tip.
    Ignored,
}

pub enum ChainRequest {
    GetLatestHeight { reply: oneshot::Sender<Option<u32>> },
    GetBlockHashByHeight { height: u32, reply: oneshot::Sender<Result<Option<BlockHash>, ChainError>> },
    ProcessBlock { block: Box<Block>, reply: oneshot::Sender<Result<BlockOutcome, ChainError>> },
    ProcessUnconfirmedTransaction { transaction: Box<Transaction>, reply: oneshot::Sender<Result<(), ChainError>> },
    GetDevMode { reply: oneshot::Sender<bool> },
    RevertToHeight { height: Option<u32>, reply: oneshot::Sender<Result<RevertSummary, ChainError>> },
}

/// Cloneable client side of the chain controller.
#[derive(Clone)]
pub struct ChainHandle {
    tx: mpsc::Sender<ChainRequest>,
}

impl ChainHandle {
    pub fn new(tx: mpsc::Sender<ChainRequest>) -> Self {
        Self { tx }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ChainRequest) -> Result<T, ChainError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| ChainError::Closed)?;
        rx.await.map_err(|_| ChainError::Closed)
    }

    pub async fn latest_height(&self) -> Result<Option<u32>, ChainError> {
        self.call(|reply| ChainRequest::GetLatestHeight { reply }).await
    }

    pub async fn block_hash(&self, height: u32) -> Result<Option<BlockHash>, ChainError> {
        self.call(|reply| ChainRequest::GetBlockHashByHeight { height, reply }).await?
    }

    pub async fn process_block(&self, block: Block) -> Result<BlockOutcome, ChainError> {
        self.call(|reply| ChainRequest::ProcessBlock { block: Box::new(block), reply }).await?
    }

    pub async fn process_unconfirmed_transaction(&self, transaction: Transaction) -> Result<(), ChainError> {
        self.call(|reply| ChainRequest::ProcessUnconfirmedTransaction { transaction: Box::new(transaction), reply })
            .await?
    }

    pub async fn dev_mode(&self) -> Result<bool, ChainError> {
        self.call(|reply| ChainRequest::GetDevMode { reply }).await
    }

    pub async fn revert_to_height(&self, height: Option<u32>) -> Result<RevertSummary, ChainError> {
        self.call(|reply| ChainRequest::RevertToHeight { height, reply }).await?
    }
}

pub struct Explorer {
    store: Arc<MappingStore>,
    chain: ChainTables,
    finalizer: Finalizer,
    cfg: config::Explorer,
    dev_mode: bool,
    genesis: Block,
    latest: Option<(u32, BlockHash)>,
    messages: Option<mpsc::UnboundedSender<ExplorerMessage>>,
}

impl Explorer {
    pub fn open(db: Arc<Store>, cfg: &Config, messages: Option<mpsc::UnboundedSender<ExplorerMessage>>) -> anyhow::Result<Self> {
        Self::with_genesis(db, cfg, Block::genesis(cfg.node.dev_mode), messages)
    }

    pub fn with_genesis(
        db: Arc<Store>,
        cfg: &Config,
        genesis: Block,
        messages: Option<mpsc::UnboundedSender<ExplorerMessage>>,
    ) -> anyhow::Result<Self> {
        let policy = TrackingPolicy::new(&cfg.mappings.reduced_tracking)?;
        let mut store = MappingStore::new(db.clone(), policy);
        if let Some(tx) = &messages {
            store = store.with_messages(tx.clone());
        }
        let mut explorer = Self {
            store: Arc::new(store),
            chain: ChainTables::new(db),
            finalizer: Finalizer::new(),
            cfg: cfg.explorer.clone(),
            dev_mode: cfg.node.dev_mode,
            genesis,
            latest: None,
            messages,
        };
        explorer.reload_tip()?;
        Ok(explorer)
    }

    pub fn store(&self) -> &Arc<MappingStore> {
        &self.store
    }

    pub fn chain(&self) -> &ChainTables {
        &self.chain
    }

    pub fn dev_mode(&self) -> bool {
        self.dev_mode
    }

    pub fn genesis_header(&self) -> &BlockHeader {
        &self.genesis.header
    }

    pub fn latest_height(&self) -> Option<u32> {
        self.latest.map(|(h, _)| h)
    }

    fn publish(&self, message: ExplorerMessage) {
        if let Some(tx) = &self.messages {
            let _ = tx.send(message);
        }
    }

    fn reload_tip(&mut self) -> anyhow::Result<()> {
        self.latest = match self.chain.latest_height()? {
            Some(h) => {
                let hash = self.chain.block_hash(h)?.ok_or_else(|| anyhow!("hash of tip {h} missing"))?;
                metrics::LATEST_HEIGHT.set(h as i64);
                Some((h, hash))
            }
            None => None,
        };
        Ok(())
    }

    fn flag(&self, name: &str) -> PathBuf {
        Path::new(&self.cfg.flag_dir).join(name)
    }

    fn clear_database(&mut self) -> anyhow::Result<()> {
        let db = self.store.db();
        db.clear_all()?;
        db.delete(CF_META, LATEST_HEIGHT_KEY)?;
        self.finalizer.clear_caches();
        self.latest = None;
        Ok(())
    }

    /// Start-up checks, then seeds genesis into an empty store.
    pub fn startup(&mut self) -> Result<(), ChainError> {
        let clear_flag = self.flag(CLEAR_FLAG);
        if clear_flag.exists() {
            warn!("🧹 {} present, clearing the database", clear_flag.display());
            self.clear_database()?;
            std::fs::remove_file(&clear_flag).map_err(|e| anyhow!("removing {}: {e}", clear_flag.display()))?;
        }

        if let Some(stored) = self.chain.block_hash(0)? {
            let expected = self.genesis.hash();
            if stored != expected {
                if self.dev_mode {
                    warn!("stored genesis {stored} differs from dev genesis {expected}, clearing the database");
                    self.clear_database()?;
                } else {
                    return Err(anyhow!("stored genesis {stored} does not match network genesis {expected}").into());
                }
            }
        }

        if self.latest.is_none() {
            self.add_genesis()?;
        }

        let revert_flag = self.flag(REVERT_FLAG);
        if revert_flag.exists() {
            warn!("⏪ {} present, reverting to the last cache backup", revert_flag.display());
            let summary = self.store.revert_to_last_backup(&self.chain)?;
            self.after_revert(&summary)?;
            std::fs::remove_file(&revert_flag).map_err(|e| anyhow!("removing {}: {e}", revert_flag.display()))?;
        }
        Ok(())
    }

    fn add_genesis(&mut self) -> Result<(), ChainError> {
        let result = self.apply_genesis();
        if result.is_err() {
            self.finalizer.clear_caches();
        }
        result
    }

    fn apply_genesis(&mut self) -> Result<(), ChainError> {
        let block = self.genesis.clone();
        let mut txn = self.store.begin()?;
        for program in builtin_programs() {
            for mapping in &program.mappings {
                let id = crypto::mapping_id(&program.id, &mapping.name);
                txn.initialize_builtin_mapping(&id, &program.id, &mapping.name)?;
            }
            self.chain.save_builtin_program(txn.batch(), &program)?;
        }
        let operations = self.finalizer.finalize_ratifications(&txn, FinalizeState::from(&block), &block.ratifications)?;
        for op in &operations {
            txn.apply(op)?;
        }
        self.chain.save_block(txn.batch(), &block, &[])?;
        txn.backup_cache(0, self.cfg.backup_retention)?;
        txn.commit()?;
        self.latest = Some((0, block.hash()));
        metrics::LATEST_HEIGHT.set(0);
        info!("🌱 genesis {} stored", block.hash());
        self.publish(ExplorerMessage::BlockAdded(0));
        Ok(())
    }

    /// Replays and commits `block` if it extends the local tip.
    pub fn process_block(&mut self, block: &Block) -> Result<BlockOutcome, ChainError> {
        let Some((height, hash)) = self.latest else {
            return Err(anyhow!("chain has no genesis yet").into());
        };
        if block.height() != height + 1 || block.previous_hash() != hash {
            warn!(
                "ignoring block {} ({}): does not extend local tip {height} ({hash})",
                block.height(),
                block.hash()
            );
            return Ok(BlockOutcome::Ignored);
        }
        match self.apply_block(block) {
            Ok(()) => Ok(BlockOutcome::Added),
            Err(e) => {
                self.finalizer.clear_caches();
                Err(e)
            }
        }
    }

    fn apply_block(&mut self, block: &Block) -> Result<(), ChainError> {
        let height = block.height();
        let mut txn = self.store.begin()?;
        if self.cfg.rollback_backups {
            txn.rollback_backup(height - 1)?;
        }
        let replay = self.finalizer.finalize_block(&mut txn, block)?;
        self.chain.save_block(txn.batch(), block, &replay.reject_reasons)?;
        if self.cfg.backup_interval > 0 && height % self.cfg.backup_interval == 0 {
            txn.backup_cache(height, self.cfg.backup_retention)?;
        }
        txn.commit()?;
        self.finalizer.commit_programs();
        self.latest = Some((height, block.hash()));

        metrics::BLOCKS_PROCESSED.inc();
        metrics::LATEST_HEIGHT.set(height as i64);
        let rejected = replay.reject_reasons.iter().filter(|r| r.is_some()).count();
        info!(
            "📦 block {height} added: {} transactions ({rejected} rejected), {} mapping operations",
            block.transactions.len(),
            replay.operations_applied
        );
        self.publish(ExplorerMessage::BlockAdded(height));
        Ok(())
    }

    pub fn process_unconfirmed_transaction(&self, transaction: &Transaction) -> Result<(), ChainError> {
        if self.chain.save_unconfirmed_transaction(transaction)? {
            debug!("stored unconfirmed transaction {}", transaction.id());
        }
        Ok(())
    }

    fn after_revert(&mut self, summary: &RevertSummary) -> anyhow::Result<()> {
        self.finalizer.clear_caches();
        self.reload_tip()?;
        info!("⏪ reverted to height {} ({} blocks undone)", summary.height, summary.blocks_reverted);
        Ok(())
    }

    /// Reverts to `height`, or to the newest cache backup when `None`.
    ///
    /// Reduced-tracking caches only exist at backup heights. A target between
    /// two backups is reached by reverting to the older backup and re-applying
    /// the stored blocks above it.
    pub fn revert(&mut self, height: Option<u32>) -> Result<RevertSummary, ChainError> {
        let Some(target) = height else {
            let summary = self.store.revert_to_last_backup(&self.chain)?;
            self.after_revert(&summary)?;
            return Ok(summary);
        };
        if let Some(latest) = self.chain.latest_height()? {
            if target > latest {
                return Err(RevertError::AboveTip { target, latest }.into());
            }
        }
        let base = self.store.backup_height_at_or_below(target)?.unwrap_or(target);
        let mut replay = Vec::with_capacity((target - base) as usize);
        for h in base + 1..=target {
            replay.push(self.chain.block(h)?.ok_or_else(|| anyhow!("stored block {h} missing"))?);
        }

        let mut summary = self.store.revert_to_height(base, &self.chain)?;
        self.after_revert(&summary)?;
        for block in &replay {
            if self.process_block(block)? != BlockOutcome::Added {
                return Err(anyhow!("stored block {} does not extend height {base}", block.height()).into());
            }
        }
        let replayed = replay.len() as u32;
        if replayed > 0 {
            info!("⏩ replayed {replayed} stored blocks from cache backup {base} up to {target}");
        }
        summary.height = target;
        summary.blocks_reverted -= replayed;
        summary.blocks_replayed = replayed;
        Ok(summary)
    }

    /// Current value of `program/mapping[key]`.
    pub fn get_mapping_value(&mut self, program_id: &str, mapping_name: &str, key: &Literal) -> Result<Literal, LookupError> {
        self.finalizer.get_mapping_value(&*self.store, program_id, mapping_name, key)
    }

    pub fn spawn(self, mailbox: usize) -> (ChainHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(mailbox.max(1));
        let task = tokio::spawn(self.run(rx));
        (ChainHandle::new(tx), task)
    }

    /// Moves the controller onto the blocking pool for `f`, so rocksdb
    /// commits never stall the async workers. `None` when `f` panicked.
    async fn off_runtime<T: Send + 'static>(self, f: impl FnOnce(&mut Self) -> T + Send + 'static) -> Option<(Self, T)> {
        let joined = tokio::task::spawn_blocking(move || {
            let mut this = self;
            let out = f(&mut this);
            (this, out)
        })
        .await;
        match joined {
            Ok(pair) => Some(pair),
            Err(e) => {
                error!("chain controller task failed: {e}");
                None
            }
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<ChainRequest>) {
        while let Some(request) = rx.recv().await {
            match request {
                ChainRequest::GetLatestHeight { reply } => {
                    let _ = reply.send(self.latest_height());
                }
                ChainRequest::GetBlockHashByHeight { height, reply } => {
                    let _ = reply.send(self.chain.block_hash(height).map_err(ChainError::from));
                }
                ChainRequest::ProcessBlock { block, reply } => {
                    let height = block.height();
                    let Some((this, result)) = self.off_runtime(move |e| e.process_block(&block)).await else {
                        return;
                    };
                    self = this;
                    if let Err(e) = &result {
                        error!("block {height} failed: {e}");
                    }
                    let _ = reply.send(result);
                }
                ChainRequest::ProcessUnconfirmedTransaction { transaction, reply } => {
                    let _ = reply.send(self.process_unconfirmed_transaction(&transaction));
                }
                ChainRequest::GetDevMode { reply } => {
                    let _ = reply.send(self.dev_mode);
                }
                ChainRequest::RevertToHeight { height, reply } => {
                    let Some((this, result)) = self.off_runtime(move |e| e.revert(height)).await else {
                        return;
                    };
                    self = this;
                    let _ = reply.send(result);
                }
            }
        }
        debug!("chain controller stopped");
    }
}
