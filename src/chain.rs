//! Block, transaction, transition and program tables.
//!
//! Everything here is staged into the same batch as the block's mapping
//! writes so a block is either fully recorded or not at all.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::crypto;
use crate::ledger::{
    Address, Authority, Block, BlockHash, ConfirmedTransaction, DagVertex, Field, Transaction, TransactionId,
    TransactionKind, TransitionId,
};
use crate::mapping::{BlockReverter, CF_MAPPING, CF_META};
use crate::program::Program;
use crate::storage::{KvRead, StagedBatch, Store};

pub const CF_BLOCK: &str = "block";
pub const CF_BLOCK_HASH: &str = "block_hash";
pub const CF_TRANSACTION: &str = "transaction";
pub const CF_TRANSITION: &str = "transition";
pub const CF_PROGRAM: &str = "program";
pub const CF_PROGRAM_FUNCTION: &str = "program_function";
pub const CF_DAG_VERTEX: &str = "dag_vertex";

pub const LATEST_HEIGHT_KEY: &[u8] = b"latest_height";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub confirmed_height: Option<u32>,
    pub index: Option<u32>,
    /// Id the transaction was broadcast under, for rejected ones.
    pub original_id: Option<TransactionId>,
    pub reject_reason: Option<String>,
    pub body: Transaction,
    /// The transaction as broadcast, for rejected ones. Restored on revert.
    pub original_body: Option<Transaction>,
}

impl TransactionRecord {
    fn pending(transaction: Transaction) -> Self {
        Self {
            id: transaction.id(),
            kind: transaction.kind(),
            status: TransactionStatus::Pending,
            confirmed_height: None,
            index: None,
            original_id: None,
            reject_reason: None,
            body: transaction,
            original_body: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: TransitionId,
    pub program_id: String,
    pub function_name: String,
    pub transaction_id: Option<TransactionId>,
    pub confirmed_height: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProgram {
    pub program: Program,
    /// `None` for built-in programs.
    pub deploy_height: Option<u32>,
    pub owner: Option<Address>,
    pub transaction_id: Option<TransactionId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagVertexRecord {
    pub height: u32,
    pub vertex: DagVertex,
}

fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

fn hash_by_height_key(height: u32) -> Vec<u8> {
    [b"h".as_slice(), &height.to_be_bytes()].concat()
}

fn height_by_hash_key(hash: &BlockHash) -> Vec<u8> {
    [b"#".as_slice(), &hash.0].concat()
}

fn function_key(program_id: &str, function_name: &str) -> Vec<u8> {
    [program_id.as_bytes(), &[0], function_name.as_bytes()].concat()
}

/// Original transaction of a rejected confirmation, as it was broadcast.
fn original_transaction(confirmed: &ConfirmedTransaction) -> Option<Transaction> {
    match confirmed {
        ConfirmedTransaction::RejectedDeploy { transaction, rejected, .. } => {
            let fee = transaction.fee()?.clone();
            Some(Transaction::Deploy {
                id: rejected.original_id,
                owner: rejected.owner,
                deployment: rejected.deployment.clone(),
                fee,
            })
        }
        ConfirmedTransaction::RejectedExecute { rejected, .. } => Some(Transaction::Execute {
            id: rejected.original_id,
            execution: rejected.execution.clone(),
            fee: None,
        }),
        _ => None,
    }
}

#[derive(Clone)]
pub struct ChainTables {
    db: Arc<Store>,
}

impl ChainTables {
    pub fn new(db: Arc<Store>) -> Self {
        Self { db }
    }

    pub fn latest_height(&self) -> Result<Option<u32>> {
        self.db.get(CF_META, LATEST_HEIGHT_KEY)
    }

    pub fn block(&self, height: u32) -> Result<Option<Block>> {
        self.db.read_compressed(CF_BLOCK, &height_key(height))
    }

    pub fn block_hash(&self, height: u32) -> Result<Option<BlockHash>> {
        self.db.get(CF_BLOCK_HASH, &hash_by_height_key(height))
    }

    pub fn block_height(&self, hash: &BlockHash) -> Result<Option<u32>> {
        self.db.get(CF_BLOCK_HASH, &height_by_hash_key(hash))
    }

    pub fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>> {
        match self.block_height(hash)? {
            Some(h) => self.block(h),
            None => Ok(None),
        }
    }

    pub fn transaction(&self, id: &TransactionId) -> Result<Option<TransactionRecord>> {
        self.db.get(CF_TRANSACTION, &id.0)
    }

    pub fn transition(&self, id: &TransitionId) -> Result<Option<TransitionRecord>> {
        self.db.get(CF_TRANSITION, &id.0)
    }

    pub fn program(&self, program_id: &str) -> Result<Option<StoredProgram>> {
        self.db.get(CF_PROGRAM, program_id.as_bytes())
    }

    pub fn function_calls(&self, program_id: &str, function_name: &str) -> Result<u64> {
        Ok(self.db.get(CF_PROGRAM_FUNCTION, &function_key(program_id, function_name))?.unwrap_or(0))
    }

    pub fn dag_vertex(&self, id: &Field) -> Result<Option<DagVertexRecord>> {
        self.db.get(CF_DAG_VERTEX, id)
    }

    pub fn save_builtin_program(&self, batch: &mut StagedBatch<'_>, program: &Program) -> Result<()> {
        if batch.read_raw(CF_PROGRAM, program.id.as_bytes())?.is_some() {
            return Ok(());
        }
        let stored = StoredProgram { program: program.clone(), deploy_height: None, owner: None, transaction_id: None };
        batch.put(CF_PROGRAM, program.id.as_bytes(), &stored)
    }

    /// Records a transaction seen in the mempool. Known ones are left alone.
    pub fn save_unconfirmed_transaction(&self, transaction: &Transaction) -> Result<bool> {
        let id = transaction.id();
        if self.db.get_raw_bytes(CF_TRANSACTION, &id.0)?.is_some() {
            return Ok(false);
        }
        self.db.put(CF_TRANSACTION, &id.0, &TransactionRecord::pending(transaction.clone()))?;
        Ok(true)
    }

    /// Stages `block` and everything it confirms. `reject_reasons` holds one
    /// entry per confirmed transaction.
    pub fn save_block(&self, batch: &mut StagedBatch<'_>, block: &Block, reject_reasons: &[Option<String>]) -> Result<()> {
        let height = block.height();
        let hash = block.hash();

        for (i, confirmed) in block.transactions.iter().enumerate() {
            let transaction = confirmed.transaction();
            let id = transaction.id();
            let reason = reject_reasons.get(i).cloned().flatten();
            let original_id = confirmed.original_id();
            if let Some(original) = original_id {
                batch.delete(CF_TRANSACTION, &original.0)?;
            }
            let record = TransactionRecord {
                id,
                kind: transaction.kind(),
                status: if confirmed.is_rejected() { TransactionStatus::Rejected } else { TransactionStatus::Accepted },
                confirmed_height: Some(height),
                index: Some(confirmed.index()),
                original_id,
                reject_reason: reason,
                body: transaction.clone(),
                original_body: original_transaction(confirmed),
            };
            batch.put(CF_TRANSACTION, &id.0, &record)?;

            for transition in confirmed.transitions() {
                let record = TransitionRecord {
                    id: transition.id,
                    program_id: transition.program_id.clone(),
                    function_name: transition.function_name.clone(),
                    transaction_id: Some(id),
                    confirmed_height: Some(height),
                };
                batch.put(CF_TRANSITION, &transition.id.0, &record)?;
                let key = function_key(&transition.program_id, &transition.function_name);
                let calls: u64 = batch.read(CF_PROGRAM_FUNCTION, &key)?.unwrap_or(0);
                batch.put(CF_PROGRAM_FUNCTION, &key, &(calls + 1))?;
            }

            if let ConfirmedTransaction::AcceptedDeploy {
                transaction: Transaction::Deploy { owner, deployment, .. },
                ..
            } = confirmed
            {
                let stored = StoredProgram {
                    program: deployment.program.clone(),
                    deploy_height: Some(height),
                    owner: Some(*owner),
                    transaction_id: Some(id),
                };
                batch.put(CF_PROGRAM, deployment.program.id.as_bytes(), &stored)?;
            }
        }

        if let Authority::Quorum { vertices } = &block.authority {
            for vertex in vertices {
                batch.put(CF_DAG_VERTEX, &vertex.id, &DagVertexRecord { height, vertex: vertex.clone() })?;
            }
        }

        batch.put_compressed(CF_BLOCK, &height_key(height), block)?;
        batch.put(CF_BLOCK_HASH, &hash_by_height_key(height), &hash)?;
        batch.put(CF_BLOCK_HASH, &height_by_hash_key(&hash), &height)?;
        batch.put(CF_META, LATEST_HEIGHT_KEY, &height)?;
        Ok(())
    }

    fn revert_block(&self, batch: &mut StagedBatch<'_>, block: &Block) -> Result<()> {
        let height = block.height();
        for confirmed in &block.transactions {
            let id = confirmed.transaction().id();

            for transition in confirmed.transitions() {
                let key = function_key(&transition.program_id, &transition.function_name);
                let calls: u64 = batch.read(CF_PROGRAM_FUNCTION, &key)?.unwrap_or(0);
                if calls <= 1 {
                    batch.delete(CF_PROGRAM_FUNCTION, &key)?;
                } else {
                    batch.put(CF_PROGRAM_FUNCTION, &key, &(calls - 1))?;
                }
                if let Some(mut record) = batch.read::<TransitionRecord>(CF_TRANSITION, &transition.id.0)? {
                    record.transaction_id = None;
                    record.confirmed_height = None;
                    batch.put(CF_TRANSITION, &transition.id.0, &record)?;
                }
            }

            let record = batch.read::<TransactionRecord>(CF_TRANSACTION, &id.0)?;
            match record {
                Some(TransactionRecord { original_id: Some(original), original_body: Some(body), .. }) => {
                    batch.delete(CF_TRANSACTION, &id.0)?;
                    let mut pending = TransactionRecord::pending(body);
                    pending.id = original;
                    batch.put(CF_TRANSACTION, &original.0, &pending)?;
                }
                Some(mut record) => {
                    record.status = TransactionStatus::Pending;
                    record.confirmed_height = None;
                    record.index = None;
                    record.reject_reason = None;
                    batch.put(CF_TRANSACTION, &id.0, &record)?;
                }
                None => debug!("transaction {id} of block {height} has no record"),
            }

            if let ConfirmedTransaction::AcceptedDeploy {
                transaction: Transaction::Deploy { deployment, .. },
                ..
            } = confirmed
            {
                let program = &deployment.program;
                batch.delete(CF_PROGRAM, program.id.as_bytes())?;
                for mapping in &program.mappings {
                    batch.delete(CF_MAPPING, &crypto::mapping_id(&program.id, &mapping.name))?;
                }
            }
        }

        if let Authority::Quorum { vertices } = &block.authority {
            for vertex in vertices {
                batch.delete(CF_DAG_VERTEX, &vertex.id)?;
            }
        }

        batch.delete(CF_BLOCK, &height_key(height))?;
        batch.delete(CF_BLOCK_HASH, &hash_by_height_key(height))?;
        batch.delete(CF_BLOCK_HASH, &height_by_hash_key(&block.hash()))?;
        Ok(())
    }
}

impl BlockReverter for ChainTables {
    fn revert_blocks_above(&self, batch: &mut StagedBatch<'_>, height: u32) -> Result<u32> {
        let Some(latest) = batch.read::<u32>(CF_META, LATEST_HEIGHT_KEY)? else {
            return Ok(0);
        };
        let mut reverted = 0;
        for h in (height.saturating_add(1)..=latest).rev() {
            let block: Block = batch
                .read_compressed(CF_BLOCK, &height_key(h))?
                .ok_or_else(|| anyhow!("block {h} missing while reverting"))?;
            self.revert_block(batch, &block)?;
            reverted += 1;
        }
        if latest > height {
            batch.put(CF_META, LATEST_HEIGHT_KEY, &height)?;
        }
        Ok(reverted)
    }

    fn latest_height(&self) -> Result<Option<u32>> {
        ChainTables::latest_height(self)
    }
}
