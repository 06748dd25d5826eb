// Shared fixtures for the integration tests.
//
// `ChainFixture` builds blocks of credits.aleo transactions and computes the
// certified finalize operations from a plain balance model, independently of
// the command executor that replays them.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chainmirror::config::Config;
use chainmirror::crypto;
use chainmirror::explorer::Explorer;
use chainmirror::ledger::{
    Address, Argument, Authority, Block, BlockHeader, ConfirmedTransaction, DagVertex, Deployment, Execution, Fee,
    FinalizeOperation, Future, Literal, Output, Ratification, RejectedDeployment, RejectedExecution, Transaction,
    TransactionId, Transition, TransitionId,
};
use chainmirror::program::{Program, CREDITS_PROGRAM_ID};
use chainmirror::storage::Store;

pub fn address(n: u8) -> Address {
    [n; 32]
}

pub fn open_store(dir: &Path) -> Arc<Store> {
    let path = dir.join("db");
    Arc::new(Store::open(path.to_str().expect("utf-8 path")).expect("Failed to open store"))
}

/// Config with a cache backup after every block and flags kept in `dir`.
pub fn test_config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.storage.path = dir.join("db").to_string_lossy().into_owned();
    cfg.explorer.flag_dir = dir.to_string_lossy().into_owned();
    cfg.explorer.backup_interval = 1;
    cfg.explorer.backup_retention = 1000;
    cfg
}

pub fn open_explorer(dir: &Path, genesis: &Block) -> Explorer {
    let cfg = test_config(dir);
    let db = open_store(dir);
    let mut explorer = Explorer::with_genesis(db, &cfg, genesis.clone(), None).expect("Failed to open explorer");
    explorer.startup().expect("Failed to start explorer");
    explorer
}

pub fn update_op(program: &str, mapping: &str, key: &Literal, value: &Literal) -> FinalizeOperation {
    let key_id = crypto::key_id(program, mapping, &key.to_bytes());
    FinalizeOperation::UpdateKeyValue {
        mapping_id: crypto::mapping_id(program, mapping),
        key_id,
        value_id: crypto::value_id(&key_id, &value.to_bytes()),
    }
}

pub fn remove_op(program: &str, mapping: &str, key: &Literal) -> FinalizeOperation {
    FinalizeOperation::RemoveKeyValue {
        mapping_id: crypto::mapping_id(program, mapping),
        key_id: crypto::key_id(program, mapping, &key.to_bytes()),
    }
}

pub fn call(program: &str, function: &str, arguments: Vec<Argument>) -> Future {
    Future { program_id: program.into(), function_name: function.into(), arguments }
}

pub fn addr_arg(a: Address) -> Argument {
    Argument::Plaintext(Literal::Address(a))
}

pub fn u64_arg(v: u64) -> Argument {
    Argument::Plaintext(Literal::U64(v))
}

/// Credits state as the network would compute it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BalanceModel {
    pub account: BTreeMap<Address, u64>,
    pub bonded: BTreeMap<Address, u64>,
    pub committee: BTreeMap<Address, u64>,
    pub delegated: BTreeMap<Address, u64>,
}

impl BalanceModel {
    fn table(&mut self, mapping: &str) -> &mut BTreeMap<Address, u64> {
        match mapping {
            "account" => &mut self.account,
            "bonded" => &mut self.bonded,
            "committee" => &mut self.committee,
            "delegated" => &mut self.delegated,
            other => panic!("unknown credits mapping {other}"),
        }
    }

    fn set(&mut self, mapping: &str, who: Address, value: u64) -> FinalizeOperation {
        self.table(mapping).insert(who, value);
        update_op(CREDITS_PROGRAM_ID, mapping, &Literal::Address(who), &Literal::U64(value))
    }

    fn set_or_remove(&mut self, mapping: &str, who: Address, value: u64) -> FinalizeOperation {
        if value == 0 {
            self.table(mapping).remove(&who);
            remove_op(CREDITS_PROGRAM_ID, mapping, &Literal::Address(who))
        } else {
            self.set(mapping, who, value)
        }
    }

    fn get(&mut self, mapping: &str, who: Address) -> u64 {
        self.table(mapping).get(&who).copied().unwrap_or(0)
    }
}

pub struct ChainFixture {
    pub blocks: Vec<Block>,
    pub model: BalanceModel,
    counter: u64,
}

impl ChainFixture {
    pub fn new(balances: &[(Address, u64)]) -> Self {
        let genesis = Block::genesis_with(crypto::blake3_hash(b"fixture genesis"), balances.to_vec());
        let mut model = BalanceModel::default();
        for (who, amount) in balances {
            model.account.insert(*who, *amount);
        }
        Self { blocks: vec![genesis], model, counter: 0 }
    }

    pub fn genesis(&self) -> &Block {
        &self.blocks[0]
    }

    pub fn block(&self, height: u32) -> &Block {
        &self.blocks[height as usize]
    }

    pub fn tip(&self) -> &Block {
        self.blocks.last().expect("genesis is always present")
    }

    fn next_id(&mut self) -> [u8; 32] {
        self.counter += 1;
        crypto::blake3_hash(&self.counter.to_le_bytes())
    }

    fn transition(&mut self, future: Future) -> Transition {
        Transition {
            id: TransitionId(self.next_id()),
            program_id: future.program_id.clone(),
            function_name: future.function_name.clone(),
            outputs: vec![Output::Future(Some(future))],
        }
    }

    /// A public fee transition and the operations it certifies.
    pub fn fee(&mut self, payer: Address, amount: u64) -> (Fee, Vec<FinalizeOperation>) {
        let transition = self.transition(call(CREDITS_PROGRAM_ID, "fee_public", vec![addr_arg(payer), u64_arg(amount)]));
        let balance = self.model.get("account", payer);
        let op = self.model.set("account", payer, balance - amount);
        (Fee { transition }, vec![op])
    }

    fn execute(&mut self, future: Future, ops: Vec<FinalizeOperation>, payer: Address, fee: u64) -> ConfirmedTransaction {
        let root = self.transition(future);
        let (fee, fee_ops) = self.fee(payer, fee);
        let mut finalize = ops;
        finalize.extend(fee_ops);
        ConfirmedTransaction::AcceptedExecute {
            index: 0,
            transaction: Transaction::Execute {
                id: TransactionId(self.next_id()),
                execution: Execution { transitions: vec![root] },
                fee: Some(fee),
            },
            finalize,
        }
    }

    pub fn transfer(&mut self, from: Address, to: Address, amount: u64, fee: u64) -> ConfirmedTransaction {
        let from_balance = self.model.get("account", from);
        let mut ops = vec![self.model.set("account", from, from_balance - amount)];
        let to_balance = self.model.get("account", to);
        ops.push(self.model.set("account", to, to_balance + amount));
        let future = call(CREDITS_PROGRAM_ID, "transfer_public", vec![addr_arg(from), addr_arg(to), u64_arg(amount)]);
        self.execute(future, ops, from, fee)
    }

    pub fn bond(&mut self, staker: Address, validator: Address, amount: u64, fee: u64) -> ConfirmedTransaction {
        let mut ops = Vec::new();
        let v = self.model.get("account", staker);
        ops.push(self.model.set("account", staker, v - amount));
        let v = self.model.get("bonded", staker);
        ops.push(self.model.set("bonded", staker, v + amount));
        let v = self.model.get("committee", validator);
        ops.push(self.model.set("committee", validator, v + amount));
        let v = self.model.get("delegated", validator);
        ops.push(self.model.set("delegated", validator, v + amount));
        let future = call(CREDITS_PROGRAM_ID, "bond_public", vec![addr_arg(staker), addr_arg(validator), u64_arg(amount)]);
        self.execute(future, ops, staker, fee)
    }

    pub fn unbond(&mut self, staker: Address, validator: Address, amount: u64, fee: u64) -> ConfirmedTransaction {
        let mut ops = Vec::new();
        let v = self.model.get("bonded", staker);
        ops.push(self.model.set_or_remove("bonded", staker, v - amount));
        let v = self.model.get("committee", validator);
        ops.push(self.model.set_or_remove("committee", validator, v - amount));
        let v = self.model.get("delegated", validator);
        ops.push(self.model.set_or_remove("delegated", validator, v - amount));
        let v = self.model.get("account", staker);
        ops.push(self.model.set("account", staker, v + amount));
        let future =
            call(CREDITS_PROGRAM_ID, "unbond_public", vec![addr_arg(staker), addr_arg(validator), u64_arg(amount)]);
        self.execute(future, ops, staker, fee)
    }

    /// A transfer the network rejected; only its fee is certified.
    pub fn rejected_transfer(&mut self, from: Address, to: Address, amount: u64, fee: u64) -> ConfirmedTransaction {
        let future = call(CREDITS_PROGRAM_ID, "transfer_public", vec![addr_arg(from), addr_arg(to), u64_arg(amount)]);
        let root = self.transition(future);
        let (fee, finalize) = self.fee(from, fee);
        ConfirmedTransaction::RejectedExecute {
            index: 0,
            transaction: Transaction::Fee { id: TransactionId(self.next_id()), fee },
            rejected: RejectedExecution {
                original_id: TransactionId(self.next_id()),
                execution: Execution { transitions: vec![root] },
            },
            finalize,
        }
    }

    pub fn deploy(&mut self, owner: Address, program: Program, fee: u64) -> ConfirmedTransaction {
        let (fee, mut finalize) = self.fee(owner, fee);
        for mapping in &program.mappings {
            finalize.push(FinalizeOperation::InitializeMapping { mapping_id: crypto::mapping_id(&program.id, &mapping.name) });
        }
        ConfirmedTransaction::AcceptedDeploy {
            index: 0,
            transaction: Transaction::Deploy {
                id: TransactionId(self.next_id()),
                owner,
                deployment: Deployment { program },
                fee,
            },
            finalize,
        }
    }

    pub fn rejected_deploy(&mut self, owner: Address, program: Program, fee: u64) -> ConfirmedTransaction {
        let (fee, finalize) = self.fee(owner, fee);
        ConfirmedTransaction::RejectedDeploy {
            index: 0,
            transaction: Transaction::Fee { id: TransactionId(self.next_id()), fee },
            rejected: RejectedDeployment {
                original_id: TransactionId(self.next_id()),
                owner,
                deployment: Deployment { program },
            },
            finalize,
        }
    }

    /// Executes an arbitrary future whose certified operations are given by the caller.
    pub fn custom_execute(
        &mut self,
        future: Future,
        ops: Vec<FinalizeOperation>,
        payer: Address,
        fee: u64,
    ) -> ConfirmedTransaction {
        self.execute(future, ops, payer, fee)
    }

    /// Appends a block on top of the tip.
    pub fn push_block(&mut self, transactions: Vec<ConfirmedTransaction>) -> Block {
        self.push_block_with(transactions, Vec::new())
    }

    pub fn push_block_with(&mut self, transactions: Vec<ConfirmedTransaction>, ratifications: Vec<Ratification>) -> Block {
        let previous = self.tip().clone();
        for ratification in &ratifications {
            if let Ratification::StakingReward { staker, validator, amount } = ratification {
                let v = self.model.get("bonded", *staker);
                self.model.set("bonded", *staker, v + amount);
                let v = self.model.get("committee", *validator);
                self.model.set("committee", *validator, v + amount);
            }
        }
        let transactions = transactions
            .into_iter()
            .enumerate()
            .map(|(i, mut tx)| {
                match &mut tx {
                    ConfirmedTransaction::AcceptedDeploy { index, .. }
                    | ConfirmedTransaction::AcceptedExecute { index, .. }
                    | ConfirmedTransaction::RejectedDeploy { index, .. }
                    | ConfirmedTransaction::RejectedExecute { index, .. } => *index = i as u32,
                }
                tx
            })
            .collect();
        let height = previous.height() + 1;
        let block = Block {
            header: BlockHeader {
                previous_hash: previous.hash(),
                height,
                timestamp: previous.header.timestamp + 10,
                transactions_root: self.next_id(),
                network: 0,
            },
            authority: Authority::Quorum {
                vertices: vec![DagVertex { id: self.next_id(), round: height as u64 * 2, previous_ids: Vec::new() }],
            },
            transactions,
            ratifications,
        };
        self.blocks.push(block.clone());
        block
    }
}
