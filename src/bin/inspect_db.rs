use chainmirror::chain::ChainTables;
use chainmirror::mapping::{MappingStore, SnapshotKind, TrackingPolicy};
use chainmirror::{config, storage};

fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let cfg = config::load(&path).unwrap_or_default();
    println!("🔍 Inspecting chainmirror database at '{}'...", cfg.storage.path);

    let db = storage::open(&cfg.storage)?;
    let chain = ChainTables::new(db.clone());
    let mappings = MappingStore::new(db.clone(), TrackingPolicy::new(&cfg.mappings.reduced_tracking)?);

    match chain.latest_height()? {
        Some(h) => {
            println!("📊 Latest block: #{h}");
            if let Some(hash) = chain.block_hash(h)? {
                println!("   Hash: {hash}");
            }
            if let Some(block) = chain.block(h)? {
                println!("   Transactions: {}", block.transactions.len());
                println!("   Timestamp: {}", block.header.timestamp);
            }
        }
        None => println!("❌ No blocks found in database"),
    }

    let stats = db.get_stats()?;
    println!("\n📈 Summary:");
    println!("   Blocks: {}", stats.block_count);
    println!("   Transactions: {}", stats.transaction_count);
    println!("   Mappings: {}", stats.mapping_count);
    println!("   Mapping values: {}", stats.mapping_value_count);
    println!("   History records: {}", stats.history_count);

    println!("\n🗂️  Cache backups:");
    for name in mappings.policy().cache_names() {
        let heights: Vec<String> = mappings
            .snapshots(&name, SnapshotKind::History)?
            .iter()
            .map(|m| match m.expires_at {
                Some(exp) => format!("{} (expires {exp})", m.height),
                None => format!("{} (pinned)", m.height),
            })
            .collect();
        println!("   {name}: {} entries live, backups at [{}]", mappings.cache_entries(&name)?.len(), heights.join(", "));
    }
    match mappings.latest_backup_height()? {
        Some(h) => println!("   Newest complete backup: {h}"),
        None => println!("   ⚠️  No cache backup available; revert_flag would fail"),
    }

    Ok(())
}
