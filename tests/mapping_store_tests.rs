// Mapping state store tests: history chains, reduced tracking, cache backups
// and reverting to an earlier height.

mod common;

use common::*;
use tempfile::TempDir;

use chainmirror::chain::{ChainTables, TransactionStatus};
use chainmirror::crypto;
use chainmirror::explorer::{BlockOutcome, ChainError, Explorer, CLEAR_FLAG, REVERT_FLAG};
use chainmirror::ledger::{Block, Literal, Ratification};
use chainmirror::mapping::{
    cache_name, CacheEntry, MappingStore, MappingValue, RevertError, SnapshotKind, TrackingPolicy,
};
use chainmirror::program::{Function, LiteralType, MappingDecl, Program, CREDITS_PROGRAM_ID};

fn value(program: &str, mapping: &str, key: &Literal, v: &Literal) -> MappingValue {
    let key_id = crypto::key_id(program, mapping, &key.to_bytes());
    MappingValue {
        mapping_id: crypto::mapping_id(program, mapping),
        key_id,
        value_id: crypto::value_id(&key_id, &v.to_bytes()),
        key: key.to_bytes(),
        value: v.to_bytes(),
    }
}

fn credits_store(dir: &TempDir) -> MappingStore {
    let store = MappingStore::new(open_store(dir.path()), TrackingPolicy::default());
    let mut txn = store.begin().expect("begin");
    for mapping in ["account", "bonded", "committee", "delegated"] {
        let id = crypto::mapping_id(CREDITS_PROGRAM_ID, mapping);
        txn.initialize_builtin_mapping(&id, CREDITS_PROGRAM_ID, mapping).expect("init");
    }
    txn.commit().expect("commit");
    store
}

type MappingState = (Vec<MappingValue>, Vec<Vec<CacheEntry>>);

fn mapping_state(explorer: &Explorer) -> MappingState {
    let store = explorer.store();
    let values = store.current_values().expect("values");
    let caches = store
        .policy()
        .cache_names()
        .iter()
        .map(|name| store.cache_entries(name).expect("cache"))
        .collect();
    (values, caches)
}

fn noop_program() -> Program {
    Program {
        id: "token.aleo".into(),
        mappings: vec![MappingDecl { name: "supply".into(), key_type: LiteralType::U32, value_type: LiteralType::U64 }],
        functions: vec![Function { name: "noop".into(), finalize: None }],
    }
}

#[tokio::test]
async fn test_history_chain() {
    println!("🧪 Testing history chain...");

    let dir = TempDir::new().expect("Failed to create temp directory");
    let store = credits_store(&dir);
    let key = Literal::Address(address(1));
    let key_id = crypto::key_id(CREDITS_PROGRAM_ID, "account", &key.to_bytes());

    for height in 1..=5u32 {
        let mut txn = store.begin().expect("begin");
        let v = value(CREDITS_PROGRAM_ID, "account", &key, &Literal::U64(height as u64 * 10));
        assert!(txn.upsert(&v, height, true).expect("upsert").is_some());
        txn.commit().expect("commit");
    }

    let chain = store.history_chain(&key_id).expect("chain");
    assert_eq!(chain.len(), 5);
    for pair in chain.windows(2) {
        assert!(pair[0].id > pair[1].id, "newest first");
        assert_eq!(pair[0].previous_id, Some(pair[1].id));
    }
    assert_eq!(chain.last().expect("oldest").previous_id, None);
    assert_eq!(chain.iter().map(|r| r.height).collect::<Vec<_>>(), vec![5, 4, 3, 2, 1]);
    assert_eq!(
        store.previous_value(chain[0].id, &key_id).expect("previous"),
        Some(Literal::U64(40).to_bytes())
    );
    assert_eq!(store.history_at_height(3).expect("at height").len(), 1);

    let mut txn = store.begin().expect("begin");
    let mapping_id = crypto::mapping_id(CREDITS_PROGRAM_ID, "account");
    txn.remove(&mapping_id, &key_id, &key.to_bytes(), 6, true).expect("remove");
    txn.commit().expect("commit");

    let chain = store.history_chain(&key_id).expect("chain");
    assert_eq!(chain.len(), 6);
    assert_eq!(chain[0].value, None, "removal is recorded");
    assert!(store.read(&mapping_id, &key_id).expect("read").is_none());

    println!("✅ History chain links every change");
}

#[tokio::test]
async fn test_reduced_tracking() {
    println!("🧪 Testing reduced tracking...");

    let dir = TempDir::new().expect("Failed to create temp directory");
    let store = credits_store(&dir);
    let key = Literal::Address(address(2));
    let key_id = crypto::key_id(CREDITS_PROGRAM_ID, "bonded", &key.to_bytes());

    let mut txn = store.begin().expect("begin");
    let v = value(CREDITS_PROGRAM_ID, "bonded", &key, &Literal::U64(10));
    assert_eq!(txn.upsert(&v, 1, false).expect("bookkeeping write"), None);
    assert_eq!(txn.read(&v.mapping_id, &key_id).expect("staged read"), Some(v.clone()));
    txn.commit().expect("commit");

    assert!(store.history_chain(&key_id).expect("chain").is_empty());
    assert_eq!(store.get_value(CREDITS_PROGRAM_ID, "bonded", &key.to_bytes()).expect("read"), Some(v.value.clone()));
    assert!(store.current_values().expect("values").is_empty(), "reduced mappings live only in the cache");

    let mut txn = store.begin().expect("begin");
    let v = value(CREDITS_PROGRAM_ID, "bonded", &key, &Literal::U64(25));
    assert!(txn.upsert(&v, 2, true).expect("transaction write").is_some());
    txn.commit().expect("commit");

    let chain = store.history_chain(&key_id).expect("chain");
    assert_eq!(chain.len(), 1);
    assert!(chain[0].from_transaction);
    assert_eq!(store.mapping_size(CREDITS_PROGRAM_ID, "bonded").expect("size"), 1);

    println!("✅ Reduced mappings skip bookkeeping history");
}

#[tokio::test]
async fn test_mapping_registration() {
    println!("🧪 Testing mapping registration...");

    let dir = TempDir::new().expect("Failed to create temp directory");
    let store = credits_store(&dir);
    let mut txn = store.begin().expect("begin");

    let account = crypto::mapping_id(CREDITS_PROGRAM_ID, "account");
    assert!(!txn.initialize_builtin_mapping(&account, CREDITS_PROGRAM_ID, "account").expect("builtin"));
    assert!(txn.initialize_mapping(&account, CREDITS_PROGRAM_ID, "account").is_err());

    let orphan = value("ghost.aleo", "m", &Literal::U32(1), &Literal::U32(2));
    assert!(txn.upsert(&orphan, 1, true).is_err(), "writes need a registered mapping");

    let supply = crypto::mapping_id("token.aleo", "supply");
    txn.initialize_mapping(&supply, "token.aleo", "supply").expect("new mapping");
    assert!(txn.mapping(&supply).expect("staged").is_some());
    txn.commit().expect("commit");
    assert_eq!(store.mapping(&supply).expect("read").expect("registered").program_id, "token.aleo");

    println!("✅ Mapping registration is guarded");
}

#[tokio::test]
async fn test_list_key_values_pages() {
    println!("🧪 Testing key-value paging...");

    let dir = TempDir::new().expect("Failed to create temp directory");
    let store = credits_store(&dir);
    let mut txn = store.begin().expect("begin");
    for n in 1..=5u8 {
        let v = value(CREDITS_PROGRAM_ID, "account", &Literal::Address(address(n)), &Literal::U64(n as u64));
        txn.upsert(&v, 1, true).expect("upsert");
    }
    txn.commit().expect("commit");

    let mut seen = Vec::new();
    let mut cursor = None;
    let mut pages = 0;
    loop {
        let (page, next) = store.list_key_values(CREDITS_PROGRAM_ID, "account", 2, cursor).expect("page");
        assert!(page.len() <= 2);
        seen.extend(page.into_iter().map(|e| e.key_id));
        pages += 1;
        match next {
            Some(c) => cursor = Some(c),
            None => break,
        }
    }
    assert_eq!(pages, 3);
    assert_eq!(seen.len(), 5);
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "pages are ordered by key id");

    println!("✅ Paging visits every key once");
}

#[tokio::test]
async fn test_revert_round_trip() {
    println!("🧪 Testing revert round trip...");

    let dir = TempDir::new().expect("Failed to create temp directory");
    let (a, b, c, v) = (address(1), address(2), address(3), address(9));
    let mut fx = ChainFixture::new(&[(a, 10_000), (b, 1_000)]);
    let mut explorer = open_explorer(dir.path(), fx.genesis());
    let mut states = vec![mapping_state(&explorer)];

    let t = vec![fx.transfer(a, b, 100, 1), fx.bond(a, v, 2_000, 1)];
    let b1 = fx.push_block(t);
    let t = vec![fx.transfer(b, c, 50, 1)];
    let b2 = fx.push_block(t);
    let t = vec![fx.transfer(a, c, 10, 1)];
    let b3 = fx.push_block_with(t, vec![Ratification::StakingReward { staker: a, validator: v, amount: 5 }]);
    let gossiped = fx.transfer(a, b, 20, 1);
    let rejected = fx.rejected_transfer(c, a, 10_000, 1);
    let b4 = fx.push_block(vec![rejected.clone(), gossiped.clone()]);
    let t = vec![fx.deploy(a, noop_program(), 5), fx.unbond(a, v, 100, 1)];
    let b5 = fx.push_block(t);

    for block in [&b1, &b2, &b3] {
        assert_eq!(explorer.process_block(block).expect("block"), BlockOutcome::Added);
        states.push(mapping_state(&explorer));
    }
    explorer.process_unconfirmed_transaction(gossiped.transaction()).expect("gossip");
    let pending = explorer.chain().transaction(&gossiped.transaction().id()).expect("read").expect("stored");
    assert_eq!(pending.status, TransactionStatus::Pending);
    for block in [&b4, &b5] {
        explorer.process_block(block).expect("block");
        states.push(mapping_state(&explorer));
    }
    assert!(!explorer.store().history_at_height(4).expect("history").is_empty());
    assert!(explorer.chain().program("token.aleo").expect("read").is_some());

    let summary = explorer.revert(Some(3)).expect("revert");
    assert_eq!(summary.blocks_reverted, 2);
    assert_eq!(summary.backup_height, Some(3));
    assert_eq!(explorer.latest_height(), Some(3));
    assert_eq!(mapping_state(&explorer), states[3]);
    assert!(explorer.store().history_at_height(4).expect("history").is_empty());

    let chain = explorer.chain();
    assert!(chain.block(4).expect("read").is_none());
    assert_eq!(chain.block_hash(3).expect("read"), Some(b3.hash()));
    assert!(chain.program("token.aleo").expect("read").is_none());
    assert!(explorer.store().mapping(&crypto::mapping_id("token.aleo", "supply")).expect("read").is_none());
    let restored = chain.transaction(&gossiped.transaction().id()).expect("read").expect("kept");
    assert_eq!(restored.status, TransactionStatus::Pending);
    assert_eq!(restored.confirmed_height, None);
    let original = rejected.original_id().expect("original id");
    assert!(chain.transaction(&rejected.transaction().id()).expect("read").is_none());
    let original = chain.transaction(&original).expect("read").expect("original restored");
    assert_eq!(original.status, TransactionStatus::Pending);

    let bonded = cache_name(CREDITS_PROGRAM_ID, "bonded");
    let heights: Vec<u32> = explorer
        .store()
        .snapshots(&bonded, SnapshotKind::History)
        .expect("snapshots")
        .iter()
        .map(|m| m.height)
        .collect();
    assert_eq!(heights, vec![0, 1, 2, 3]);

    // Re-ingesting the same blocks lands on the same state.
    for block in [&b4, &b5] {
        assert_eq!(explorer.process_block(block).expect("re-ingest"), BlockOutcome::Added);
    }
    assert_eq!(mapping_state(&explorer), states[5]);
    assert_eq!(explorer.latest_height(), Some(5));
    let balance = explorer
        .get_mapping_value(CREDITS_PROGRAM_ID, "account", &Literal::Address(a))
        .expect("balance");
    assert_eq!(balance, Literal::U64(fx.model.account[&a]));

    println!("✅ Revert and re-ingest converge");
}

#[tokio::test]
async fn test_revert_between_backups() {
    println!("🧪 Testing revert to a height between cache backups...");

    let dir = TempDir::new().expect("Failed to create temp directory");
    let (a, b, c, v) = (address(1), address(2), address(3), address(9));
    let mut fx = ChainFixture::new(&[(a, 10_000), (b, 1_000)]);
    let mut cfg = test_config(dir.path());
    cfg.explorer.backup_interval = 3;
    let mut explorer = Explorer::with_genesis(open_store(dir.path()), &cfg, fx.genesis().clone(), None).expect("open");
    explorer.startup().expect("startup");
    let mut states = vec![mapping_state(&explorer)];

    let t = vec![fx.bond(a, v, 2_000, 1)];
    let b1 = fx.push_block(t);
    let t = vec![fx.transfer(a, c, 10, 1)];
    let b2 = fx.push_block(t);
    let t = vec![fx.transfer(b, a, 5, 1)];
    let b3 = fx.push_block(t);
    let t = vec![fx.unbond(a, v, 100, 1)];
    let b4 = fx.push_block_with(t, vec![Ratification::StakingReward { staker: a, validator: v, amount: 7 }]);
    let t = vec![fx.bond(b, v, 200, 1)];
    let b5 = fx.push_block(t);
    let t = vec![fx.unbond(b, v, 50, 1)];
    let b6 = fx.push_block(t);

    for block in [&b1, &b2, &b3, &b4, &b5] {
        assert_eq!(explorer.process_block(block).expect("block"), BlockOutcome::Added);
        states.push(mapping_state(&explorer));
    }
    let committee = cache_name(CREDITS_PROGRAM_ID, "committee");
    let heights: Vec<u32> = explorer
        .store()
        .snapshots(&committee, SnapshotKind::History)
        .expect("snapshots")
        .iter()
        .map(|m| m.height)
        .collect();
    assert_eq!(heights, vec![0, 3]);
    assert_ne!(states[4], states[3], "block 4 changes the reduced caches");

    let summary = explorer.revert(Some(4)).expect("revert");
    assert_eq!(summary.height, 4);
    assert_eq!(summary.backup_height, Some(3), "newest backup at or below the target");
    assert_eq!(summary.blocks_reverted, 1);
    assert_eq!(summary.blocks_replayed, 1);
    assert_eq!(explorer.latest_height(), Some(4));
    assert_eq!(explorer.chain().block_hash(4).expect("read"), Some(b4.hash()));
    assert_eq!(mapping_state(&explorer), states[4], "caches carry block 4's unbond and reward");
    let stake = explorer
        .get_mapping_value(CREDITS_PROGRAM_ID, "committee", &Literal::Address(v))
        .expect("committee");
    assert_eq!(stake, Literal::U64(2_000 - 100 + 7));

    // Bond and unbond replay against the restored caches without diverging.
    assert_eq!(explorer.process_block(&b5).expect("re-ingest"), BlockOutcome::Added);
    assert_eq!(mapping_state(&explorer), states[5]);
    assert_eq!(explorer.process_block(&b6).expect("new block"), BlockOutcome::Added);
    assert_eq!(explorer.latest_height(), Some(6));
    let stake = explorer
        .get_mapping_value(CREDITS_PROGRAM_ID, "committee", &Literal::Address(v))
        .expect("committee");
    assert_eq!(stake, Literal::U64(fx.model.committee[&v]));
    let bonded = explorer
        .get_mapping_value(CREDITS_PROGRAM_ID, "bonded", &Literal::Address(b))
        .expect("bonded");
    assert_eq!(bonded, Literal::U64(150));

    println!("✅ Reverts between backups land on the requested height");
}

#[tokio::test]
async fn test_revert_preconditions() {
    println!("🧪 Testing revert preconditions...");

    let dir = TempDir::new().expect("Failed to create temp directory");
    let mut fx = ChainFixture::new(&[(address(1), 1_000)]);
    let mut explorer = open_explorer(dir.path(), fx.genesis());
    let t = vec![fx.transfer(address(1), address(2), 1, 1)];
    explorer.process_block(&fx.push_block(t)).expect("block");

    let err = explorer.revert(Some(10)).expect_err("above tip");
    assert!(matches!(err, ChainError::Revert(RevertError::AboveTip { target: 10, latest: 1 })));
    assert_eq!(explorer.latest_height(), Some(1));

    let summary = explorer.revert(Some(1)).expect("revert to tip is a no-op");
    assert_eq!(summary.blocks_reverted, 0);
    assert_eq!(summary.history_removed, 0);

    println!("✅ Reverts above the tip are refused");
}

#[tokio::test]
async fn test_revert_without_backup() {
    println!("🧪 Testing revert without backups...");

    let dir = TempDir::new().expect("Failed to create temp directory");
    let store = credits_store(&dir);
    let chain = ChainTables::new(store.db().clone());

    let mut txn = store.begin().expect("begin");
    let v = value(CREDITS_PROGRAM_ID, "account", &Literal::Address(address(1)), &Literal::U64(5));
    txn.upsert(&v, 0, true).expect("upsert");
    txn.commit().expect("commit");

    assert!(matches!(store.revert_to_height(0, &chain), Err(RevertError::NoBackup { height: 0 })));
    assert!(matches!(store.revert_to_last_backup(&chain), Err(RevertError::NoBackup { .. })));
    assert_eq!(store.current_values().expect("values"), vec![v], "failed revert changes nothing");

    let full = MappingStore::new(store.db().clone(), TrackingPolicy::full());
    drop(store);
    let summary = full.revert_to_last_backup(&chain).expect("fully tracked stores need no backup");
    assert_eq!(summary.backup_height, None);

    println!("✅ Missing backups abort the revert");
}

#[tokio::test]
async fn test_revert_flag_on_startup() {
    println!("🧪 Testing revert flag...");

    let dir = TempDir::new().expect("Failed to create temp directory");
    let mut fx = ChainFixture::new(&[(address(1), 1_000)]);
    let mut cfg = test_config(dir.path());
    cfg.explorer.backup_interval = 2;
    {
        let mut explorer = Explorer::with_genesis(open_store(dir.path()), &cfg, fx.genesis().clone(), None)
            .expect("open");
        explorer.startup().expect("startup");
        for _ in 0..3 {
            let t = vec![fx.transfer(address(1), address(2), 1, 1)];
            explorer.process_block(&fx.push_block(t)).expect("block");
        }
        assert_eq!(explorer.latest_height(), Some(3));
    }

    let flag = dir.path().join(REVERT_FLAG);
    std::fs::write(&flag, b"").expect("write flag");
    let mut explorer = Explorer::with_genesis(open_store(dir.path()), &cfg, fx.genesis().clone(), None).expect("open");
    explorer.startup().expect("startup");

    assert_eq!(explorer.latest_height(), Some(2), "reverted to the newest backup");
    assert!(!flag.exists(), "flag is consumed");
    assert_eq!(explorer.process_block(fx.block(3)).expect("re-ingest"), BlockOutcome::Added);

    println!("✅ Revert flag rolls back to the last backup");
}

#[tokio::test]
async fn test_clear_flag_keeps_history_ids() {
    println!("🧪 Testing clear flag...");

    let dir = TempDir::new().expect("Failed to create temp directory");
    let fx = ChainFixture::new(&[(address(1), 1_000)]);
    let key_id = crypto::key_id(CREDITS_PROGRAM_ID, "account", &Literal::Address(address(1)).to_bytes());

    let first_id = {
        let explorer = open_explorer(dir.path(), fx.genesis());
        let chain = explorer.store().history_chain(&key_id).expect("chain");
        chain[0].id
    };

    std::fs::write(dir.path().join(CLEAR_FLAG), b"").expect("write flag");
    let explorer = open_explorer(dir.path(), fx.genesis());
    assert_eq!(explorer.latest_height(), Some(0));
    let chain = explorer.store().history_chain(&key_id).expect("chain");
    assert_eq!(chain.len(), 1, "old history is gone");
    assert!(chain[0].id > first_id, "history ids are never reused");
    assert!(!dir.path().join(CLEAR_FLAG).exists());

    println!("✅ Clear flag rebuilds from genesis");
}

#[tokio::test]
async fn test_genesis_mismatch() {
    println!("🧪 Testing genesis mismatch...");

    let dir = TempDir::new().expect("Failed to create temp directory");
    let ours = ChainFixture::new(&[(address(1), 1_000)]);
    drop(open_explorer(dir.path(), ours.genesis()));

    let other = Block::genesis_with(crypto::blake3_hash(b"other"), vec![(address(5), 5)]);
    let mut cfg = test_config(dir.path());
    {
        let mut explorer = Explorer::with_genesis(open_store(dir.path()), &cfg, other.clone(), None).expect("open");
        assert!(explorer.startup().is_err(), "foreign genesis outside dev mode");
    }

    cfg.node.dev_mode = true;
    let mut explorer = Explorer::with_genesis(open_store(dir.path()), &cfg, other.clone(), None).expect("open");
    explorer.startup().expect("dev mode starts over");
    assert_eq!(explorer.chain().block_hash(0).expect("read"), Some(other.hash()));
    let funded = explorer
        .get_mapping_value(CREDITS_PROGRAM_ID, "account", &Literal::Address(address(5)))
        .expect("new genesis balance");
    assert_eq!(funded, Literal::U64(5));

    println!("✅ Genesis mismatches are handled per mode");
}
