//! Ledger data as it arrives from the network.
//!
//! These are plain data carriers: nothing here verifies proofs or signatures.
//! Finalize effects certified by the network travel inside each
//! [`ConfirmedTransaction`] as a list of [`FinalizeOperation`]s.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::program::{Program, CREDITS_PROGRAM_ID};

pub type Field = [u8; 32];
pub type Address = [u8; 32];

macro_rules! id_type {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, hex::encode(&self.0[..8]))
            }
        }
    };
}

id_type!(BlockHash, "ab");
id_type!(TransactionId, "at");
id_type!(TransitionId, "au");

/// A plaintext value that can live in a mapping.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    Boolean(bool),
    U32(u32),
    U64(u64),
    U128(u128),
    Address(Address),
    Field(Field),
}

impl Literal {
    /// Canonical byte form. Content-addressed ids are computed over these bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(33);
        match self {
            Literal::Boolean(b) => {
                out.push(0);
                out.push(*b as u8);
            }
            Literal::U32(v) => {
                out.push(1);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Literal::U64(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Literal::U128(v) => {
                out.push(3);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Literal::Address(a) => {
                out.push(4);
                out.extend_from_slice(a);
            }
            Literal::Field(f) => {
                out.push(5);
                out.extend_from_slice(f);
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (tag, body) = bytes.split_first()?;
        Some(match (*tag, body.len()) {
            (0, 1) if body[0] <= 1 => Literal::Boolean(body[0] == 1),
            (1, 4) => Literal::U32(u32::from_le_bytes(body.try_into().ok()?)),
            (2, 8) => Literal::U64(u64::from_le_bytes(body.try_into().ok()?)),
            (3, 16) => Literal::U128(u128::from_le_bytes(body.try_into().ok()?)),
            (4, 32) => Literal::Address(body.try_into().ok()?),
            (5, 32) => Literal::Field(body.try_into().ok()?),
            _ => return None,
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Literal::Boolean(_) => "boolean",
            Literal::U32(_) => "u32",
            Literal::U64(_) => "u64",
            Literal::U128(_) => "u128",
            Literal::Address(_) => "address",
            Literal::Field(_) => "field",
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Boolean(b) => write!(f, "{b}"),
            Literal::U32(v) => write!(f, "{v}u32"),
            Literal::U64(v) => write!(f, "{v}u64"),
            Literal::U128(v) => write!(f, "{v}u128"),
            Literal::Address(a) => write!(f, "aleo1{}", hex::encode(a)),
            Literal::Field(v) => write!(f, "{}field", hex::encode(v)),
        }
    }
}

/// A call to a program's finalize function, produced by a transition and
/// possibly nested inside another future's arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Future {
    pub program_id: String,
    pub function_name: String,
    pub arguments: Vec<Argument>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Argument {
    Plaintext(Literal),
    Future(Future),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Output {
    Public(Literal),
    Record(Vec<u8>),
    /// `None` when the network omitted the future's body.
    Future(Option<Future>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    pub program_id: String,
    pub function_name: String,
    pub outputs: Vec<Output>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fee {
    pub transition: Transition,
}

impl Fee {
    pub fn is_public(&self) -> bool {
        self.transition.program_id == CREDITS_PROGRAM_ID && self.transition.function_name == "fee_public"
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub transitions: Vec<Transition>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub program: Program,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Deploy,
    Execute,
    Fee,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transaction {
    Deploy { id: TransactionId, owner: Address, deployment: Deployment, fee: Fee },
    Execute { id: TransactionId, execution: Execution, fee: Option<Fee> },
    Fee { id: TransactionId, fee: Fee },
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        match self {
            Transaction::Deploy { id, .. } | Transaction::Execute { id, .. } | Transaction::Fee { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> TransactionKind {
        match self {
            Transaction::Deploy { .. } => TransactionKind::Deploy,
            Transaction::Execute { .. } => TransactionKind::Execute,
            Transaction::Fee { .. } => TransactionKind::Fee,
        }
    }

    pub fn fee(&self) -> Option<&Fee> {
        match self {
            Transaction::Deploy { fee, .. } | Transaction::Fee { fee, .. } => Some(fee),
            Transaction::Execute { fee, .. } => fee.as_ref(),
        }
    }

    /// Every transition carried by the transaction, fee last.
    pub fn transitions(&self) -> Vec<&Transition> {
        let mut out: Vec<&Transition> = match self {
            Transaction::Execute { execution, .. } => execution.transitions.iter().collect(),
            _ => Vec::new(),
        };
        if let Some(fee) = self.fee() {
            out.push(&fee.transition);
        }
        out
    }
}

/// A certified finalize effect as recorded by the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalizeOperation {
    InitializeMapping { mapping_id: Field },
    UpdateKeyValue { mapping_id: Field, key_id: Field, value_id: Field },
    RemoveKeyValue { mapping_id: Field, key_id: Field },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedDeployment {
    pub original_id: TransactionId,
    pub owner: Address,
    pub deployment: Deployment,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedExecution {
    pub original_id: TransactionId,
    pub execution: Execution,
}

/// A transaction as confirmed in a block. The set of classes is closed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmedTransaction {
    AcceptedDeploy { index: u32, transaction: Transaction, finalize: Vec<FinalizeOperation> },
    AcceptedExecute { index: u32, transaction: Transaction, finalize: Vec<FinalizeOperation> },
    RejectedDeploy { index: u32, transaction: Transaction, rejected: RejectedDeployment, finalize: Vec<FinalizeOperation> },
    RejectedExecute { index: u32, transaction: Transaction, rejected: RejectedExecution, finalize: Vec<FinalizeOperation> },
}

impl ConfirmedTransaction {
    pub fn transaction(&self) -> &Transaction {
        match self {
            ConfirmedTransaction::AcceptedDeploy { transaction, .. }
            | ConfirmedTransaction::AcceptedExecute { transaction, .. }
            | ConfirmedTransaction::RejectedDeploy { transaction, .. }
            | ConfirmedTransaction::RejectedExecute { transaction, .. } => transaction,
        }
    }

    pub fn finalize(&self) -> &[FinalizeOperation] {
        match self {
            ConfirmedTransaction::AcceptedDeploy { finalize, .. }
            | ConfirmedTransaction::AcceptedExecute { finalize, .. }
            | ConfirmedTransaction::RejectedDeploy { finalize, .. }
            | ConfirmedTransaction::RejectedExecute { finalize, .. } => finalize,
        }
    }

    pub fn index(&self) -> u32 {
        match self {
            ConfirmedTransaction::AcceptedDeploy { index, .. }
            | ConfirmedTransaction::AcceptedExecute { index, .. }
            | ConfirmedTransaction::RejectedDeploy { index, .. }
            | ConfirmedTransaction::RejectedExecute { index, .. } => *index,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            ConfirmedTransaction::RejectedDeploy { .. } | ConfirmedTransaction::RejectedExecute { .. }
        )
    }

    pub fn original_id(&self) -> Option<TransactionId> {
        match self {
            ConfirmedTransaction::RejectedDeploy { rejected, .. } => Some(rejected.original_id),
            ConfirmedTransaction::RejectedExecute { rejected, .. } => Some(rejected.original_id),
            _ => None,
        }
    }

    /// Transitions that ran as part of the confirmation, including the ones of a
    /// rejected execution.
    pub fn transitions(&self) -> Vec<&Transition> {
        let mut out = self.transaction().transitions();
        if let ConfirmedTransaction::RejectedExecute { rejected, .. } = self {
            out.extend(rejected.execution.transitions.iter());
        }
        out
    }
}

/// Protocol bookkeeping applied after a block's transactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ratification {
    Genesis { balances: Vec<(Address, u64)> },
    StakingReward { staker: Address, validator: Address, amount: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagVertex {
    pub id: Field,
    pub round: u64,
    pub previous_ids: Vec<Field>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authority {
    Beacon { signature: Vec<u8> },
    Quorum { vertices: Vec<DagVertex> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub previous_hash: BlockHash,
    pub height: u32,
    pub timestamp: i64,
    pub transactions_root: Field,
    pub network: u16,
}

impl BlockHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 4 + 8 + 32 + 2);
        out.extend_from_slice(&self.previous_hash.0);
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.transactions_root);
        out.extend_from_slice(&self.network.to_le_bytes());
        out
    }

    pub fn hash(&self) -> BlockHash {
        BlockHash(crate::crypto::blake3_hash(&self.to_bytes()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub authority: Authority,
    pub transactions: Vec<ConfirmedTransaction>,
    pub ratifications: Vec<Ratification>,
}

pub const GENESIS_TIMESTAMP: i64 = 1_696_118_400;

impl Block {
    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn previous_hash(&self) -> BlockHash {
        self.header.previous_hash
    }

    /// The genesis block the node expects: network genesis, or the dev one.
    pub fn genesis(dev_mode: bool) -> Self {
        let tag: &[u8] = if dev_mode { b"genesis/dev" } else { b"genesis/network" };
        Self::genesis_with(crate::crypto::blake3_hash(tag), Vec::new())
    }

    /// A genesis block funding `balances` in `credits.aleo/account`.
    pub fn genesis_with(transactions_root: Field, balances: Vec<(Address, u64)>) -> Self {
        let ratifications = if balances.is_empty() {
            Vec::new()
        } else {
            vec![Ratification::Genesis { balances }]
        };
        Block {
            header: BlockHeader {
                previous_hash: BlockHash::default(),
                height: 0,
                timestamp: GENESIS_TIMESTAMP,
                transactions_root,
                network: 0,
            },
            authority: Authority::Beacon { signature: Vec::new() },
            transactions: Vec::new(),
            ratifications,
        }
    }
}
