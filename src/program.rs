//! Programs, their mappings and their finalize command lists.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::ledger::Literal;

pub const CREDITS_PROGRAM_ID: &str = "credits.aleo";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiteralType {
    Boolean,
    U32,
    U64,
    U128,
    Address,
    Field,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingDecl {
    pub name: String,
    pub key_type: LiteralType,
    pub value_type: LiteralType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Register(usize),
    Literal(Literal),
    BlockHeight,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(r) => write!(f, "r{r}"),
            Operand::Literal(l) => write!(f, "{l}"),
            Operand::BlockHeight => f.write_str("block.height"),
        }
    }
}

/// One finalize instruction. Inputs occupy the first registers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Get { mapping: String, key: Operand, dest: usize },
    GetOrUse { mapping: String, key: Operand, default: Operand, dest: usize },
    Contains { mapping: String, key: Operand, dest: usize },
    Set { mapping: String, key: Operand, value: Operand },
    Remove { mapping: String, key: Operand },
    Add { a: Operand, b: Operand, dest: usize },
    Sub { a: Operand, b: Operand, dest: usize },
    IsEq { a: Operand, b: Operand, dest: usize },
    IsNeq { a: Operand, b: Operand, dest: usize },
    /// Skips the next `count` commands when `condition` is true.
    SkipIf { condition: Operand, count: usize },
    Assert { condition: Operand },
    /// Runs the finalize of a future held in a register.
    Await { future: Operand },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Get { mapping, key, dest } => write!(f, "get {mapping}[{key}] into r{dest};"),
            Command::GetOrUse { mapping, key, default, dest } => {
                write!(f, "get.or_use {mapping}[{key}] {default} into r{dest};")
            }
            Command::Contains { mapping, key, dest } => write!(f, "contains {mapping}[{key}] into r{dest};"),
            Command::Set { mapping, key, value } => write!(f, "set {value} into {mapping}[{key}];"),
            Command::Remove { mapping, key } => write!(f, "remove {mapping}[{key}];"),
            Command::Add { a, b, dest } => write!(f, "add {a} {b} into r{dest};"),
            Command::Sub { a, b, dest } => write!(f, "sub {a} {b} into r{dest};"),
            Command::IsEq { a, b, dest } => write!(f, "is.eq {a} {b} into r{dest};"),
            Command::IsNeq { a, b, dest } => write!(f, "is.neq {a} {b} into r{dest};"),
            Command::SkipIf { condition, count } => write!(f, "skip.if {condition} {count};"),
            Command::Assert { condition } => write!(f, "assert.eq {condition} true;"),
            Command::Await { future } => write!(f, "await {future};"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub finalize: Option<Vec<Command>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub id: String,
    pub mappings: Vec<MappingDecl>,
    pub functions: Vec<Function>,
}

impl Program {
    pub fn mapping(&self, name: &str) -> Option<&MappingDecl> {
        self.mappings.iter().find(|m| m.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

fn reg(r: usize) -> Operand {
    Operand::Register(r)
}

fn zero() -> Operand {
    Operand::Literal(Literal::U64(0))
}

fn get(mapping: &str, key: usize, dest: usize) -> Command {
    Command::Get { mapping: mapping.into(), key: reg(key), dest }
}

fn get_or_zero(mapping: &str, key: usize, dest: usize) -> Command {
    Command::GetOrUse { mapping: mapping.into(), key: reg(key), default: zero(), dest }
}

fn set(mapping: &str, key: usize, value: usize) -> Command {
    Command::Set { mapping: mapping.into(), key: reg(key), value: reg(value) }
}

fn add(a: usize, b: usize, dest: usize) -> Command {
    Command::Add { a: reg(a), b: reg(b), dest }
}

fn sub(a: usize, b: usize, dest: usize) -> Command {
    Command::Sub { a: reg(a), b: reg(b), dest }
}

/// Sets `mapping[key] = value`, or removes the entry when `value` is zero.
fn set_or_remove(mapping: &str, key: usize, value: usize, scratch: usize) -> Vec<Command> {
    vec![
        Command::IsEq { a: reg(value), b: zero(), dest: scratch },
        Command::SkipIf { condition: reg(scratch), count: 1 },
        set(mapping, key, value),
        Command::IsNeq { a: reg(value), b: zero(), dest: scratch + 1 },
        Command::SkipIf { condition: reg(scratch + 1), count: 1 },
        Command::Remove { mapping: mapping.into(), key: reg(key) },
    ]
}

fn u64_mapping(name: &str) -> MappingDecl {
    MappingDecl { name: name.into(), key_type: LiteralType::Address, value_type: LiteralType::U64 }
}

/// The built-in credits program. Its mappings exist from genesis on.
pub fn credits_program() -> Program {
    // fee_public(payer, amount)
    let fee_public = vec![get("account", 0, 2), sub(2, 1, 3), set("account", 0, 3)];

    // transfer_public(from, to, amount)
    let transfer_public = vec![
        get("account", 0, 3),
        sub(3, 2, 4),
        set("account", 0, 4),
        get_or_zero("account", 1, 5),
        add(5, 2, 6),
        set("account", 1, 6),
    ];

    // bond_public(staker, validator, amount)
    let bond_public = vec![
        get("account", 0, 3),
        sub(3, 2, 4),
        set("account", 0, 4),
        get_or_zero("bonded", 0, 5),
        add(5, 2, 6),
        set("bonded", 0, 6),
        get_or_zero("committee", 1, 7),
        add(7, 2, 8),
        set("committee", 1, 8),
        get_or_zero("delegated", 1, 9),
        add(9, 2, 10),
        set("delegated", 1, 10),
    ];

    // unbond_public(staker, validator, amount)
    let mut unbond_public = vec![get("bonded", 0, 3), sub(3, 2, 4)];
    unbond_public.extend(set_or_remove("bonded", 0, 4, 5));
    unbond_public.extend([get("committee", 1, 7), sub(7, 2, 8)]);
    unbond_public.extend(set_or_remove("committee", 1, 8, 9));
    unbond_public.extend([get("delegated", 1, 11), sub(11, 2, 12)]);
    unbond_public.extend(set_or_remove("delegated", 1, 12, 13));
    unbond_public.extend([get_or_zero("account", 0, 15), add(15, 2, 16), set("account", 0, 16)]);

    Program {
        id: CREDITS_PROGRAM_ID.into(),
        mappings: ["account", "committee", "bonded", "delegated"].into_iter().map(u64_mapping).collect(),
        functions: vec![
            Function { name: "fee_public".into(), finalize: Some(fee_public) },
            Function { name: "fee_private".into(), finalize: None },
            Function { name: "transfer_public".into(), finalize: Some(transfer_public) },
            Function { name: "transfer_private".into(), finalize: None },
            Function { name: "bond_public".into(), finalize: Some(bond_public) },
            Function { name: "unbond_public".into(), finalize: Some(unbond_public) },
        ],
    }
}

pub fn builtin_programs() -> Vec<Program> {
    vec![credits_program()]
}

pub fn is_builtin(program_id: &str) -> bool {
    program_id == CREDITS_PROGRAM_ID
}

/// Where programs not yet cached are loaded from.
pub trait ProgramSource {
    fn load_program(&self, program_id: &str) -> anyhow::Result<Option<Program>>;
}

/// In-memory program cache owned by the replay engine.
///
/// Programs deployed by the block being replayed are staged until the block
/// commits so later transactions of the same block can call them.
#[derive(Debug, Default)]
pub struct ProgramCatalog {
    cache: HashMap<String, Program>,
    staged: HashMap<String, Program>,
}

impl ProgramCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<S: ProgramSource + ?Sized>(&mut self, program_id: &str, source: &S) -> anyhow::Result<Option<Program>> {
        if let Some(p) = self.staged.get(program_id).or_else(|| self.cache.get(program_id)) {
            return Ok(Some(p.clone()));
        }
        if is_builtin(program_id) {
            let builtin = builtin_programs().into_iter().find(|p| p.id == program_id);
            if let Some(p) = &builtin {
                self.cache.insert(p.id.clone(), p.clone());
            }
            return Ok(builtin);
        }
        let loaded = source.load_program(program_id)?;
        if let Some(p) = &loaded {
            self.cache.insert(p.id.clone(), p.clone());
        }
        Ok(loaded)
    }

    pub fn stage(&mut self, program: Program) {
        self.staged.insert(program.id.clone(), program);
    }

    pub fn commit_staged(&mut self) {
        self.cache.extend(self.staged.drain());
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.staged.clear();
    }
}
