//! Finalize replay.
//!
//! Each confirmed transaction's finalize logic is re-run against the local
//! mapping cache and the resulting operations are compared, one by one, with
//! the operations the network certified for that transaction. Only a block
//! whose every transaction matches is handed to the mapping store.

use std::collections::HashMap;

use anyhow::anyhow;
use tracing::{debug, error, warn};

use crate::chain::{StoredProgram, CF_PROGRAM};
use crate::crypto;
use crate::ledger::{
    Argument, Block, ConfirmedTransaction, Fee, Field, FinalizeOperation, Future, Literal, Output,
    Ratification, Transaction, TransactionId, TransitionId,
};
use crate::mapping::{CacheEntry, MappingOperation, MappingStore, MappingTxn, MappingValue};
use crate::metrics;
use crate::program::{is_builtin, Command, Operand, Program, ProgramCatalog, ProgramSource, CREDITS_PROGRAM_ID};
use crate::storage::KvRead;

pub const REJECTED_DEPLOY_REASON: &str = "(detailed reason not available)";
pub const UNKNOWN_REJECT_REASON: &str = "unknown reason";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinalizeState {
    pub block_height: u32,
    pub block_timestamp: i64,
}

impl From<&Block> for FinalizeState {
    fn from(block: &Block) -> Self {
        Self { block_height: block.height(), block_timestamp: block.header.timestamp }
    }
}

/// A finalize function failed. Rejected transactions record this as their reason.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecuteError {
    pub transition_id: TransitionId,
    pub instruction: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error("invalid transaction {transaction}: {reason}")]
    InvalidTransaction { transaction: TransactionId, reason: String },
    #[error("program {0} not found")]
    ProgramNotFound(String),
    #[error("replayed finalize of {transaction} disagrees with the certified operations: {detail}")]
    Inconsistent { transaction: TransactionId, detail: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl FinalizeError {
    fn invalid(transaction: TransactionId, reason: impl Into<String>) -> Self {
        FinalizeError::InvalidTransaction { transaction, reason: reason.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("program {0} not found")]
    ProgramNotFound(String),
    #[error("mapping {program}/{mapping} not found")]
    MappingNotFound { program: String, mapping: String },
    #[error("key {key} not found in {program}/{mapping}")]
    KeyNotFound { program: String, mapping: String, key: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Read access the replay needs: mapping contents and deployed programs.
pub trait FinalizeSource: ProgramSource {
    fn load_mapping(&self, program_id: &str, mapping_name: &str) -> anyhow::Result<Vec<CacheEntry>>;
}

impl ProgramSource for MappingTxn<'_> {
    fn load_program(&self, program_id: &str) -> anyhow::Result<Option<Program>> {
        Ok(self.staged().read::<StoredProgram>(CF_PROGRAM, program_id.as_bytes())?.map(|p| p.program))
    }
}

impl FinalizeSource for MappingTxn<'_> {
    fn load_mapping(&self, program_id: &str, mapping_name: &str) -> anyhow::Result<Vec<CacheEntry>> {
        self.entries(program_id, mapping_name)
    }
}

impl ProgramSource for MappingStore {
    fn load_program(&self, program_id: &str) -> anyhow::Result<Option<Program>> {
        Ok(self.db().get::<StoredProgram>(CF_PROGRAM, program_id.as_bytes())?.map(|p| p.program))
    }
}

impl FinalizeSource for MappingStore {
    fn load_mapping(&self, program_id: &str, mapping_name: &str) -> anyhow::Result<Vec<CacheEntry>> {
        self.entries(program_id, mapping_name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedValue {
    pub key: Literal,
    pub value: Literal,
}

/// Live cache: mapping id -> key id -> value. Write-through for replayed operations.
pub type MappingCache = HashMap<Field, HashMap<Field, CachedValue>>;

/// Isolated overlay for rejected executions. `None` marks a removed key.
pub type ScratchCache = HashMap<Field, HashMap<Field, Option<CachedValue>>>;

/// Everything a finalize function may touch while it runs.
pub struct ExecContext<'c> {
    pub state: FinalizeState,
    pub from_transaction: bool,
    cache: &'c mut MappingCache,
    scratch: Option<&'c mut ScratchCache>,
    programs: &'c mut ProgramCatalog,
    source: &'c dyn FinalizeSource,
}

impl<'c> ExecContext<'c> {
    pub fn new(
        cache: &'c mut MappingCache,
        programs: &'c mut ProgramCatalog,
        source: &'c dyn FinalizeSource,
        state: FinalizeState,
        scratch: Option<&'c mut ScratchCache>,
        from_transaction: bool,
    ) -> Self {
        Self { state, from_transaction, cache, scratch, programs, source }
    }

    fn ensure_loaded(&mut self, mapping_id: &Field, program_id: &str, mapping_name: &str) -> anyhow::Result<()> {
        if self.cache.contains_key(mapping_id) {
            return Ok(());
        }
        let mut values = HashMap::new();
        for entry in self.source.load_mapping(program_id, mapping_name)? {
            let key = Literal::from_bytes(&entry.key)
                .ok_or_else(|| anyhow!("undecodable key in {program_id}/{mapping_name}"))?;
            let value = Literal::from_bytes(&entry.value)
                .ok_or_else(|| anyhow!("undecodable value in {program_id}/{mapping_name}"))?;
            values.insert(entry.key_id, CachedValue { key, value });
        }
        debug!("loaded {} entries of {program_id}/{mapping_name} into the mapping cache", values.len());
        self.cache.insert(*mapping_id, values);
        Ok(())
    }

    pub fn read(&mut self, program_id: &str, mapping_name: &str, key: &Literal) -> anyhow::Result<Option<Literal>> {
        let mapping_id = crypto::mapping_id(program_id, mapping_name);
        let key_id = crypto::key_id(program_id, mapping_name, &key.to_bytes());
        if let Some(scratch) = self.scratch.as_deref() {
            if let Some(entry) = scratch.get(&mapping_id).and_then(|m| m.get(&key_id)) {
                return Ok(entry.as_ref().map(|c| c.value.clone()));
            }
        }
        self.ensure_loaded(&mapping_id, program_id, mapping_name)?;
        Ok(self.cache.get(&mapping_id).and_then(|m| m.get(&key_id)).map(|c| c.value.clone()))
    }

    pub fn write(&mut self, program_id: &str, mapping_name: &str, key: Literal, value: Literal) -> anyhow::Result<MappingOperation> {
        let mapping_id = crypto::mapping_id(program_id, mapping_name);
        let key_bytes = key.to_bytes();
        let value_bytes = value.to_bytes();
        let key_id = crypto::key_id(program_id, mapping_name, &key_bytes);
        let value_id = crypto::value_id(&key_id, &value_bytes);
        let cached = CachedValue { key, value };
        if let Some(scratch) = self.scratch.as_deref_mut() {
            scratch.entry(mapping_id).or_default().insert(key_id, Some(cached));
        } else {
            self.ensure_loaded(&mapping_id, program_id, mapping_name)?;
            self.cache.entry(mapping_id).or_default().insert(key_id, cached);
        }
        Ok(MappingOperation::UpdateKeyValue {
            program_id: program_id.to_string(),
            mapping_name: mapping_name.to_string(),
            value: MappingValue { mapping_id, key_id, value_id, key: key_bytes, value: value_bytes },
            height: self.state.block_height,
            from_transaction: self.from_transaction,
        })
    }

    pub fn remove(&mut self, program_id: &str, mapping_name: &str, key: &Literal) -> anyhow::Result<MappingOperation> {
        let mapping_id = crypto::mapping_id(program_id, mapping_name);
        let key_bytes = key.to_bytes();
        let key_id = crypto::key_id(program_id, mapping_name, &key_bytes);
        if let Some(scratch) = self.scratch.as_deref_mut() {
            scratch.entry(mapping_id).or_default().insert(key_id, None);
        } else {
            self.ensure_loaded(&mapping_id, program_id, mapping_name)?;
            if let Some(m) = self.cache.get_mut(&mapping_id) {
                m.remove(&key_id);
            }
        }
        Ok(MappingOperation::RemoveKeyValue {
            program_id: program_id.to_string(),
            mapping_name: mapping_name.to_string(),
            mapping_id,
            key_id,
            key: key_bytes,
            height: self.state.block_height,
            from_transaction: self.from_transaction,
        })
    }

    pub fn program(&mut self, program_id: &str) -> anyhow::Result<Option<Program>> {
        self.programs.get(program_id, self.source)
    }
}

/// Runs one finalize function. A real VM can be plugged in here.
pub trait FinalizeExecutor {
    fn execute(
        &self,
        ctx: &mut ExecContext<'_>,
        transition_id: TransitionId,
        program: &Program,
        function_name: &str,
        arguments: &[Argument],
    ) -> Result<Vec<MappingOperation>, FinalizeError>;
}

/// Interprets [`Command`] lists.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandExecutor;

#[derive(Clone, Debug)]
enum Register {
    Literal(Literal),
    Future(Future),
}

fn load<'r>(regs: &'r [Option<Register>], operand: &Operand, state: &FinalizeState) -> Result<std::borrow::Cow<'r, Register>, String> {
    use std::borrow::Cow;
    match operand {
        Operand::Register(r) => regs
            .get(*r)
            .and_then(Option::as_ref)
            .map(Cow::Borrowed)
            .ok_or_else(|| format!("register r{r} is not set")),
        Operand::Literal(l) => Ok(Cow::Owned(Register::Literal(l.clone()))),
        Operand::BlockHeight => Ok(Cow::Owned(Register::Literal(Literal::U32(state.block_height)))),
    }
}

fn literal(regs: &[Option<Register>], operand: &Operand, state: &FinalizeState) -> Result<Literal, String> {
    match load(regs, operand, state)?.into_owned() {
        Register::Literal(l) => Ok(l),
        Register::Future(_) => Err(format!("{operand} holds a future, expected a literal")),
    }
}

fn boolean(regs: &[Option<Register>], operand: &Operand, state: &FinalizeState) -> Result<bool, String> {
    match literal(regs, operand, state)? {
        Literal::Boolean(b) => Ok(b),
        other => Err(format!("{operand} is a {}, expected a boolean", other.type_name())),
    }
}

fn store(regs: &mut Vec<Option<Register>>, dest: usize, value: Register) {
    if regs.len() <= dest {
        regs.resize(dest + 1, None);
    }
    regs[dest] = Some(value);
}

fn add(a: &Literal, b: &Literal) -> Result<Literal, String> {
    let sum = match (a, b) {
        (Literal::U32(x), Literal::U32(y)) => x.checked_add(*y).map(Literal::U32),
        (Literal::U64(x), Literal::U64(y)) => x.checked_add(*y).map(Literal::U64),
        (Literal::U128(x), Literal::U128(y)) => x.checked_add(*y).map(Literal::U128),
        _ => return Err(format!("cannot add {} and {}", a.type_name(), b.type_name())),
    };
    sum.ok_or_else(|| "integer overflow".to_string())
}

fn sub(a: &Literal, b: &Literal) -> Result<Literal, String> {
    let diff = match (a, b) {
        (Literal::U32(x), Literal::U32(y)) => x.checked_sub(*y).map(Literal::U32),
        (Literal::U64(x), Literal::U64(y)) => x.checked_sub(*y).map(Literal::U64),
        (Literal::U128(x), Literal::U128(y)) => x.checked_sub(*y).map(Literal::U128),
        _ => return Err(format!("cannot subtract {} from {}", b.type_name(), a.type_name())),
    };
    diff.ok_or_else(|| "integer underflow".to_string())
}

impl FinalizeExecutor for CommandExecutor {
    fn execute(
        &self,
        ctx: &mut ExecContext<'_>,
        transition_id: TransitionId,
        program: &Program,
        function_name: &str,
        arguments: &[Argument],
    ) -> Result<Vec<MappingOperation>, FinalizeError> {
        let function = program.function(function_name).ok_or_else(|| ExecuteError {
            transition_id,
            instruction: String::new(),
            message: format!("function {}/{function_name} not found", program.id),
        })?;
        let Some(commands) = &function.finalize else {
            return Ok(Vec::new());
        };

        let mut regs: Vec<Option<Register>> = arguments
            .iter()
            .map(|a| {
                Some(match a {
                    Argument::Plaintext(l) => Register::Literal(l.clone()),
                    Argument::Future(f) => Register::Future(f.clone()),
                })
            })
            .collect();
        let mut operations = Vec::new();
        let state = ctx.state;
        let mut pc = 0;

        while pc < commands.len() {
            let command = &commands[pc];
            pc += 1;
            let fail = |message: String| ExecuteError { transition_id, instruction: command.to_string(), message };
            let declared = |mapping: &str| {
                program
                    .mapping(mapping)
                    .map(|_| ())
                    .ok_or_else(|| format!("mapping {}/{mapping} not found", program.id))
            };

            match command {
                Command::Get { mapping, key, dest } => {
                    declared(mapping).map_err(fail)?;
                    let key = literal(&regs, key, &state).map_err(fail)?;
                    let value = ctx
                        .read(&program.id, mapping, &key)?
                        .ok_or_else(|| fail(format!("key {key} not found in {}/{mapping}", program.id)))?;
                    store(&mut regs, *dest, Register::Literal(value));
                }
                Command::GetOrUse { mapping, key, default, dest } => {
                    declared(mapping).map_err(fail)?;
                    let key = literal(&regs, key, &state).map_err(fail)?;
                    let value = match ctx.read(&program.id, mapping, &key)? {
                        Some(v) => v,
                        None => literal(&regs, default, &state).map_err(fail)?,
                    };
                    store(&mut regs, *dest, Register::Literal(value));
                }
                Command::Contains { mapping, key, dest } => {
                    declared(mapping).map_err(fail)?;
                    let key = literal(&regs, key, &state).map_err(fail)?;
                    let found = ctx.read(&program.id, mapping, &key)?.is_some();
                    store(&mut regs, *dest, Register::Literal(Literal::Boolean(found)));
                }
                Command::Set { mapping, key, value } => {
                    declared(mapping).map_err(fail)?;
                    let key = literal(&regs, key, &state).map_err(fail)?;
                    let value = literal(&regs, value, &state).map_err(fail)?;
                    operations.push(ctx.write(&program.id, mapping, key, value)?);
                }
                Command::Remove { mapping, key } => {
                    declared(mapping).map_err(fail)?;
                    let key = literal(&regs, key, &state).map_err(fail)?;
                    operations.push(ctx.remove(&program.id, mapping, &key)?);
                }
                Command::Add { a, b, dest } => {
                    let a = literal(&regs, a, &state).map_err(fail)?;
                    let b = literal(&regs, b, &state).map_err(fail)?;
                    store(&mut regs, *dest, Register::Literal(add(&a, &b).map_err(fail)?));
                }
                Command::Sub { a, b, dest } => {
                    let a = literal(&regs, a, &state).map_err(fail)?;
                    let b = literal(&regs, b, &state).map_err(fail)?;
                    store(&mut regs, *dest, Register::Literal(sub(&a, &b).map_err(fail)?));
                }
                Command::IsEq { a, b, dest } | Command::IsNeq { a, b, dest } => {
                    let a = literal(&regs, a, &state).map_err(fail)?;
                    let b = literal(&regs, b, &state).map_err(fail)?;
                    let equal = a == b;
                    let result = if matches!(command, Command::IsEq { .. }) { equal } else { !equal };
                    store(&mut regs, *dest, Register::Literal(Literal::Boolean(result)));
                }
                Command::SkipIf { condition, count } => {
                    if boolean(&regs, condition, &state).map_err(fail)? {
                        pc += count;
                    }
                }
                Command::Assert { condition } => {
                    if !boolean(&regs, condition, &state).map_err(fail)? {
                        return Err(fail("assertion failed".to_string()).into());
                    }
                }
                Command::Await { future } => {
                    let future = match load(&regs, future, &state).map_err(fail)?.into_owned() {
                        Register::Future(f) => f,
                        Register::Literal(l) => return Err(fail(format!("cannot await a {}", l.type_name())).into()),
                    };
                    operations.extend(run_future(self, ctx, transition_id, &future)?);
                }
            }
        }
        Ok(operations)
    }
}

fn run_future<E: FinalizeExecutor + ?Sized>(
    executor: &E,
    ctx: &mut ExecContext<'_>,
    transition_id: TransitionId,
    future: &Future,
) -> Result<Vec<MappingOperation>, FinalizeError> {
    let program = ctx
        .program(&future.program_id)?
        .ok_or_else(|| FinalizeError::ProgramNotFound(future.program_id.clone()))?;
    executor.execute(ctx, transition_id, &program, &future.function_name, &future.arguments)
}

fn fee_future(transaction: TransactionId, fee: &Fee) -> Result<&Future, FinalizeError> {
    if !fee.is_public() {
        return Err(FinalizeError::invalid(transaction, "fee transition is not credits.aleo/fee_public"));
    }
    match fee.transition.outputs.first() {
        Some(Output::Future(Some(future))) => Ok(future),
        _ => Err(FinalizeError::invalid(transaction, "fee transition does not output a future")),
    }
}

/// Compares the certified operations of one transaction with the replayed ones.
pub fn check_consistency(
    transaction: TransactionId,
    expected: &[FinalizeOperation],
    actual: &[MappingOperation],
) -> Result<(), FinalizeError> {
    let mismatch = |detail: String| FinalizeError::Inconsistent { transaction, detail };
    if expected.len() != actual.len() {
        return Err(mismatch(format!(
            "expected {} operations, replay produced {}",
            expected.len(),
            actual.len()
        )));
    }
    for (i, (e, a)) in expected.iter().zip(actual).enumerate() {
        match (e, a) {
            (
                FinalizeOperation::InitializeMapping { mapping_id },
                MappingOperation::InitializeMapping { mapping_id: actual_id, .. },
            ) => {
                if mapping_id != actual_id {
                    return Err(mismatch(format!("operation #{i}: mapping id differs")));
                }
            }
            (
                FinalizeOperation::UpdateKeyValue { mapping_id, key_id, value_id },
                MappingOperation::UpdateKeyValue { value, .. },
            ) => {
                if *mapping_id != value.mapping_id {
                    return Err(mismatch(format!("operation #{i}: mapping id differs")));
                }
                if *key_id != value.key_id {
                    return Err(mismatch(format!("operation #{i}: key id differs")));
                }
                if *value_id != value.value_id {
                    return Err(mismatch(format!(
                        "operation #{i}: value id differs (expected {}, replayed {})",
                        hex::encode(value_id),
                        hex::encode(value.value_id)
                    )));
                }
            }
            (
                FinalizeOperation::RemoveKeyValue { mapping_id, key_id },
                MappingOperation::RemoveKeyValue { mapping_id: actual_mapping, key_id: actual_key, .. },
            ) => {
                if mapping_id != actual_mapping || key_id != actual_key {
                    return Err(mismatch(format!("operation #{i}: removed key differs")));
                }
            }
            (e, a) => {
                return Err(mismatch(format!(
                    "operation #{i}: expected {}, replay produced {}",
                    expected_kind(e),
                    actual_kind(a)
                )));
            }
        }
    }
    Ok(())
}

fn expected_kind(op: &FinalizeOperation) -> &'static str {
    match op {
        FinalizeOperation::InitializeMapping { .. } => "InitializeMapping",
        FinalizeOperation::UpdateKeyValue { .. } => "UpdateKeyValue",
        FinalizeOperation::RemoveKeyValue { .. } => "RemoveKeyValue",
    }
}

fn actual_kind(op: &MappingOperation) -> &'static str {
    match op {
        MappingOperation::InitializeMapping { .. } => "InitializeMapping",
        MappingOperation::UpdateKeyValue { .. } => "UpdateKeyValue",
        MappingOperation::RemoveKeyValue { .. } => "RemoveKeyValue",
    }
}

/// Result of replaying one confirmed transaction.
#[derive(Clone, Debug)]
pub struct TransactionReplay {
    pub expected: Vec<FinalizeOperation>,
    pub operations: Vec<MappingOperation>,
    pub reject_reason: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct BlockReplay {
    /// One entry per confirmed transaction, in block order.
    pub reject_reasons: Vec<Option<String>>,
    pub operations_applied: usize,
}

/// Owns the caches that survive between blocks.
pub struct Finalizer<E = CommandExecutor> {
    executor: E,
    pub cache: MappingCache,
    pub programs: ProgramCatalog,
}

impl Finalizer<CommandExecutor> {
    pub fn new() -> Self {
        Self::with_executor(CommandExecutor)
    }
}

impl Default for Finalizer<CommandExecutor> {
    fn default() -> Self {
        Self::new()
    }
}

fn as_u64(value: Option<Literal>) -> anyhow::Result<u64> {
    match value {
        None => Ok(0),
        Some(Literal::U64(v)) => Ok(v),
        Some(other) => Err(anyhow!("expected a u64 balance, found {}", other.type_name())),
    }
}

impl<E: FinalizeExecutor> Finalizer<E> {
    pub fn with_executor(executor: E) -> Self {
        Self { executor, cache: MappingCache::new(), programs: ProgramCatalog::new() }
    }

    /// Drops everything cached. The next access reloads from the store.
    pub fn clear_caches(&mut self) {
        self.cache.clear();
        self.programs.clear();
    }

    /// Makes programs deployed by the last committed block permanent.
    pub fn commit_programs(&mut self) {
        self.programs.commit_staged();
    }

    fn execute_public_fee(
        &mut self,
        source: &dyn FinalizeSource,
        state: FinalizeState,
        transaction: TransactionId,
        fee: &Fee,
        scratch: Option<&mut ScratchCache>,
    ) -> Result<Vec<MappingOperation>, FinalizeError> {
        let future = fee_future(transaction, fee)?;
        let mut ctx = ExecContext::new(&mut self.cache, &mut self.programs, source, state, scratch, true);
        run_future(&self.executor, &mut ctx, fee.transition.id, future)
    }

    fn finalize_deploy(
        &mut self,
        source: &dyn FinalizeSource,
        state: FinalizeState,
        confirmed: &ConfirmedTransaction,
    ) -> Result<TransactionReplay, FinalizeError> {
        let transaction = confirmed.transaction();
        let id = transaction.id();
        let fee = match transaction {
            Transaction::Deploy { fee, .. } | Transaction::Fee { fee, .. } => fee,
            Transaction::Execute { .. } => {
                return Err(FinalizeError::invalid(id, "deploy confirmation carries an execute transaction"))
            }
        };
        let mut operations = if fee.is_public() {
            self.execute_public_fee(source, state, id, fee, None)?
        } else {
            Vec::new()
        };

        let reject_reason = match confirmed {
            ConfirmedTransaction::AcceptedDeploy { transaction: Transaction::Deploy { deployment, .. }, .. } => {
                let program = &deployment.program;
                if is_builtin(&program.id) {
                    return Err(FinalizeError::invalid(id, format!("deployment overwrites built-in program {}", program.id)));
                }
                for mapping in &program.mappings {
                    operations.push(MappingOperation::InitializeMapping {
                        mapping_id: crypto::mapping_id(&program.id, &mapping.name),
                        program_id: program.id.clone(),
                        mapping_name: mapping.name.clone(),
                    });
                }
                self.programs.stage(program.clone());
                None
            }
            ConfirmedTransaction::RejectedDeploy { .. } => Some(REJECTED_DEPLOY_REASON.to_string()),
            _ => return Err(FinalizeError::invalid(id, "accepted deploy without a deployment")),
        };

        Ok(TransactionReplay { expected: confirmed.finalize().to_vec(), operations, reject_reason })
    }

    fn finalize_execute(
        &mut self,
        source: &dyn FinalizeSource,
        state: FinalizeState,
        confirmed: &ConfirmedTransaction,
    ) -> Result<TransactionReplay, FinalizeError> {
        let id = confirmed.transaction().id();
        let (execution, fee, accepted) = match confirmed {
            ConfirmedTransaction::AcceptedExecute { transaction: Transaction::Execute { execution, fee, .. }, .. } => {
                (execution, fee.as_ref(), true)
            }
            ConfirmedTransaction::RejectedExecute { transaction: Transaction::Fee { fee, .. }, rejected, .. } => {
                (&rejected.execution, Some(fee), false)
            }
            _ => return Err(FinalizeError::invalid(id, "execute confirmation has the wrong transaction type")),
        };

        let mut scratch = ScratchCache::new();
        let mut operations = Vec::new();
        let mut reject_reason = None;

        let root = execution
            .transitions
            .last()
            .ok_or_else(|| FinalizeError::invalid(id, "execution has no transitions"))?;
        if let Some(Output::Future(future)) = root.outputs.last() {
            let future = future
                .as_ref()
                .ok_or_else(|| FinalizeError::invalid(id, "root transition future is missing"))?;
            let result = {
                let scratch = if accepted { None } else { Some(&mut scratch) };
                let mut ctx = ExecContext::new(&mut self.cache, &mut self.programs, source, state, scratch, true);
                run_future(&self.executor, &mut ctx, root.id, future)
            };
            match result {
                Ok(ops) => operations.extend(ops),
                Err(FinalizeError::Execute(e)) if !accepted => {
                    let index = execution
                        .transitions
                        .iter()
                        .position(|t| t.id == e.transition_id)
                        .ok_or_else(|| FinalizeError::invalid(id, "failing transition is not part of the execution"))?;
                    reject_reason = Some(format!(
                        "execute error: {e}, at transition #{index}, instruction \"{}\"",
                        e.instruction
                    ));
                }
                Err(other) => return Err(other),
            }
        }

        if !accepted {
            // The rejected execution's own writes never reach the store.
            operations.clear();
            if reject_reason.is_none() {
                let reason = match fee {
                    Some(fee) if fee.is_public() => {
                        match self.execute_public_fee(source, state, id, fee, Some(&mut scratch)) {
                            Ok(_) => UNKNOWN_REJECT_REASON.to_string(),
                            Err(FinalizeError::Execute(e)) => {
                                format!("execute error: {e}, at fee transition, instruction \"{}\"", e.instruction)
                            }
                            Err(other) => return Err(other),
                        }
                    }
                    _ => UNKNOWN_REJECT_REASON.to_string(),
                };
                reject_reason = Some(reason);
            }
        }

        if let Some(fee) = fee.filter(|f| f.is_public()) {
            operations.extend(self.execute_public_fee(source, state, id, fee, None)?);
        }

        Ok(TransactionReplay { expected: confirmed.finalize().to_vec(), operations, reject_reason })
    }

    /// Replays one confirmed transaction against the live cache.
    pub fn finalize_transaction(
        &mut self,
        source: &dyn FinalizeSource,
        state: FinalizeState,
        confirmed: &ConfirmedTransaction,
    ) -> Result<TransactionReplay, FinalizeError> {
        match confirmed {
            ConfirmedTransaction::AcceptedDeploy { .. } | ConfirmedTransaction::RejectedDeploy { .. } => {
                self.finalize_deploy(source, state, confirmed)
            }
            ConfirmedTransaction::AcceptedExecute { .. } | ConfirmedTransaction::RejectedExecute { .. } => {
                self.finalize_execute(source, state, confirmed)
            }
        }
    }

    /// Applies ratifications. These have no certified counterpart.
    pub fn finalize_ratifications(
        &mut self,
        source: &dyn FinalizeSource,
        state: FinalizeState,
        ratifications: &[Ratification],
    ) -> Result<Vec<MappingOperation>, FinalizeError> {
        let mut ctx = ExecContext::new(&mut self.cache, &mut self.programs, source, state, None, false);
        let mut operations = Vec::new();
        for ratification in ratifications {
            match ratification {
                Ratification::Genesis { balances } => {
                    for (address, amount) in balances {
                        operations.push(ctx.write(
                            CREDITS_PROGRAM_ID,
                            "account",
                            Literal::Address(*address),
                            Literal::U64(*amount),
                        )?);
                    }
                }
                Ratification::StakingReward { staker, validator, amount } => {
                    for (mapping, address) in [("bonded", staker), ("committee", validator)] {
                        let key = Literal::Address(*address);
                        let current = as_u64(ctx.read(CREDITS_PROGRAM_ID, mapping, &key)?)?;
                        let updated = current
                            .checked_add(*amount)
                            .ok_or_else(|| anyhow!("staking reward overflows {mapping}"))?;
                        operations.push(ctx.write(CREDITS_PROGRAM_ID, mapping, key, Literal::U64(updated))?);
                    }
                }
            }
        }
        Ok(operations)
    }

    /// Replays every transaction of `block`, checks each against its certified
    /// operations and applies the result to `txn`. On any error the caches are
    /// dropped and nothing in `txn` should be committed.
    pub fn finalize_block(&mut self, txn: &mut MappingTxn<'_>, block: &Block) -> Result<BlockReplay, FinalizeError> {
        let result = self.finalize_block_inner(txn, block);
        if let Err(e) = &result {
            if matches!(e, FinalizeError::Inconsistent { .. }) {
                metrics::CONSISTENCY_FAILURES.inc();
            }
            error!("finalize of block {} failed: {e}", block.height());
            self.clear_caches();
        }
        result
    }

    fn finalize_block_inner(&mut self, txn: &mut MappingTxn<'_>, block: &Block) -> Result<BlockReplay, FinalizeError> {
        let state = FinalizeState::from(block);
        let mut replay = BlockReplay::default();
        for confirmed in &block.transactions {
            let result = self.finalize_transaction(&*txn, state, confirmed)?;
            if let Err(e) = check_consistency(confirmed.transaction().id(), &result.expected, &result.operations) {
                warn!("expected operations: {:?}", result.expected);
                warn!("replayed operations: {:?}", result.operations);
                return Err(e);
            }
            for op in &result.operations {
                txn.apply(op)?;
            }
            replay.operations_applied += result.operations.len();
            if result.reject_reason.is_some() {
                metrics::REJECTED_TRANSACTIONS.inc();
            }
            replay.reject_reasons.push(result.reject_reason);
        }
        let ratified = self.finalize_ratifications(&*txn, state, &block.ratifications)?;
        for op in &ratified {
            txn.apply(op)?;
        }
        replay.operations_applied += ratified.len();
        metrics::FINALIZE_OPERATIONS.inc_by(replay.operations_applied as u64);
        Ok(replay)
    }

    /// Current value of `mapping[key]`, through the cache.
    pub fn get_mapping_value(
        &mut self,
        source: &dyn FinalizeSource,
        program_id: &str,
        mapping_name: &str,
        key: &Literal,
    ) -> Result<Literal, LookupError> {
        let program = self
            .programs
            .get(program_id, source)?
            .ok_or_else(|| LookupError::ProgramNotFound(program_id.to_string()))?;
        if program.mapping(mapping_name).is_none() {
            return Err(LookupError::MappingNotFound { program: program_id.into(), mapping: mapping_name.into() });
        }
        let state = FinalizeState { block_height: 0, block_timestamp: 0 };
        let mut ctx = ExecContext::new(&mut self.cache, &mut self.programs, source, state, None, false);
        ctx.read(program_id, mapping_name, key)?.ok_or_else(|| LookupError::KeyNotFound {
            program: program_id.into(),
            mapping: mapping_name.into(),
            key: key.to_string(),
        })
    }

    /// Runs a finalize function against an isolated overlay and returns the
    /// operations it would produce. Writes stay in the overlay and nothing is
    /// persisted.
    pub fn preview(
        &mut self,
        source: &dyn FinalizeSource,
        state: FinalizeState,
        future: &Future,
    ) -> Result<Vec<MappingOperation>, FinalizeError> {
        let mut scratch = ScratchCache::new();
        let mut ctx = ExecContext::new(&mut self.cache, &mut self.programs, source, state, Some(&mut scratch), true);
        run_future(&self.executor, &mut ctx, TransitionId::default(), future)
    }
}
