// End-to-end sync: a scripted peer feeds frames through `drive` into a live
// chain controller backed by RocksDB.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tempfile::TempDir;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use chainmirror::crypto::NodeKey;
use chainmirror::explorer::BlockOutcome;
use chainmirror::ledger::{ConfirmedTransaction, FinalizeOperation};
use chainmirror::node::drive;
use chainmirror::peer::{PeerError, PeerSession, SyncSettings};
use chainmirror::protocol::{
    write_frame, BlockLocators, BlockRequest, BlockResponse, ChallengeRequest, ChallengeResponse, Message, NodeType,
    Ping, Pong, PROTOCOL_VERSION,
};

fn peer_ping(fx: &ChainFixture) -> Message {
    let (recents, checkpoints) = BlockLocators::heights(fx.tip().height());
    let locators = BlockLocators {
        recents: recents.into_iter().map(|h| (h, fx.block(h).hash())).collect(),
        checkpoints: checkpoints.into_iter().map(|h| (h, fx.block(h).hash())).collect(),
    };
    Message::Ping(Ping { version: PROTOCOL_VERSION, node_type: NodeType::Validator, block_locators: Some(locators) })
}

async fn next(out: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(10), out.recv())
        .await
        .expect("session went quiet")
        .expect("session closed")
}

async fn handshake(peer: &mut DuplexStream, out: &mut mpsc::UnboundedReceiver<Message>, fx: &ChainFixture) {
    assert!(matches!(next(out).await, Message::ChallengeRequest(_)));
    let response = ChallengeResponse {
        genesis_header: fx.genesis().header.clone(),
        restrictions_id: [0u8; 32],
        public_key: Vec::new(),
        signature: Vec::new(),
        nonce: 11,
    };
    write_frame(peer, &Message::ChallengeResponse(response)).await.expect("write");
    let request = ChallengeRequest {
        version: PROTOCOL_VERSION,
        listener_port: 4133,
        node_type: NodeType::Validator,
        address: [3u8; 32],
        nonce: 5,
    };
    write_frame(peer, &Message::ChallengeRequest(request)).await.expect("write");
    assert!(matches!(next(out).await, Message::ChallengeResponse(_)));
    assert!(matches!(next(out).await, Message::Ping(_)));
}

fn settings() -> SyncSettings {
    SyncSettings { batch_size: 2, ping_interval: Duration::from_secs(3600), ..SyncSettings::default() }
}

#[tokio::test]
async fn test_sync_from_scripted_peer() {
    println!("🧪 Testing end-to-end sync...");

    let dir = TempDir::new().expect("Failed to create temp directory");
    let mut fx = ChainFixture::new(&[(address(1), 1_000)]);
    for n in 2..=4u8 {
        let t = vec![fx.transfer(address(1), address(n), 10, 1)];
        fx.push_block(t);
    }

    let explorer = open_explorer(dir.path(), fx.genesis());
    let (chain, controller) = explorer.spawn(8);
    let (tx, mut out) = mpsc::unbounded_channel();
    let mut session = PeerSession::new(chain.clone(), tx, settings(), Arc::new(NodeKey::generate()));
    let (mut peer, mut reader) = tokio::io::duplex(1 << 20);
    let driver = tokio::spawn(async move { drive(&mut session, &mut reader).await });

    handshake(&mut peer, &mut out, &fx).await;

    write_frame(&mut peer, &peer_ping(&fx)).await.expect("write");
    assert_eq!(next(&mut out).await, Message::Pong(Pong { is_fork: Some(false) }));
    let first = BlockRequest { start_height: 1, end_height: 3 };
    assert_eq!(next(&mut out).await, Message::BlockRequest(first));

    let blocks = vec![fx.block(1).clone(), fx.block(2).clone()];
    write_frame(&mut peer, &Message::BlockResponse(BlockResponse { request: first, blocks })).await.expect("write");
    let second = BlockRequest { start_height: 3, end_height: 4 };
    assert_eq!(next(&mut out).await, Message::BlockRequest(second));

    let blocks = vec![fx.block(3).clone()];
    write_frame(&mut peer, &Message::BlockResponse(BlockResponse { request: second, blocks })).await.expect("write");

    // A ping is answered only after the previous frame was fully handled.
    write_frame(&mut peer, &peer_ping(&fx)).await.expect("write");
    assert_eq!(next(&mut out).await, Message::Pong(Pong { is_fork: Some(false) }));
    assert_eq!(chain.latest_height().await.expect("height"), Some(3));
    assert_eq!(chain.block_hash(3).await.expect("hash"), Some(fx.block(3).hash()));

    drop(peer);
    let result = driver.await.expect("driver task");
    let err = result.expect_err("stream closed");
    assert!(!err.is_fatal(), "a closed stream only triggers a reconnect");

    drop(chain);
    controller.await.expect("controller stops once every handle is gone");

    println!("✅ Blocks flow from the wire into the store");
}

#[tokio::test]
async fn test_inconsistent_block_halts_session() {
    println!("🧪 Testing fatal replay error over the wire...");

    let dir = TempDir::new().expect("Failed to create temp directory");
    let mut fx = ChainFixture::new(&[(address(1), 1_000)]);
    let t = vec![fx.transfer(address(1), address(2), 10, 1)];
    fx.push_block(t);

    let mut bad = fx.block(1).clone();
    if let ConfirmedTransaction::AcceptedExecute { finalize, .. } = &mut bad.transactions[0] {
        finalize.push(FinalizeOperation::RemoveKeyValue { mapping_id: [0u8; 32], key_id: [0u8; 32] });
    }

    let explorer = open_explorer(dir.path(), fx.genesis());
    let (chain, _controller) = explorer.spawn(8);
    let (tx, mut out) = mpsc::unbounded_channel();
    let mut session = PeerSession::new(chain.clone(), tx, settings(), Arc::new(NodeKey::generate()));
    let (mut peer, mut reader) = tokio::io::duplex(1 << 20);
    let driver = tokio::spawn(async move { drive(&mut session, &mut reader).await });

    handshake(&mut peer, &mut out, &fx).await;
    write_frame(&mut peer, &peer_ping(&fx)).await.expect("write");
    assert!(matches!(next(&mut out).await, Message::Pong(_)));
    let request = BlockRequest { start_height: 1, end_height: 2 };
    assert_eq!(next(&mut out).await, Message::BlockRequest(request));
    write_frame(&mut peer, &Message::BlockResponse(BlockResponse { request, blocks: vec![bad] }))
        .await
        .expect("write");

    let err = driver.await.expect("driver task").expect_err("replay must fail");
    assert!(matches!(err, PeerError::Chain(_)));
    assert!(err.is_fatal());
    assert_eq!(chain.latest_height().await.expect("height"), Some(0));

    assert_eq!(chain.block_hash(1).await.expect("hash"), None);

    println!("✅ Consistency failures stop ingestion");
}

#[tokio::test]
async fn test_controller_keeps_serving_after_errors() {
    println!("🧪 Testing chain controller across failures and reverts...");

    let dir = TempDir::new().expect("Failed to create temp directory");
    let mut fx = ChainFixture::new(&[(address(1), 1_000)]);
    for n in 2..=3u8 {
        let t = vec![fx.transfer(address(1), address(n), 10, 1)];
        fx.push_block(t);
    }
    let mut bad = fx.block(1).clone();
    if let ConfirmedTransaction::AcceptedExecute { finalize, .. } = &mut bad.transactions[0] {
        finalize.push(FinalizeOperation::RemoveKeyValue { mapping_id: [0u8; 32], key_id: [0u8; 32] });
    }

    let explorer = open_explorer(dir.path(), fx.genesis());
    let (chain, controller) = explorer.spawn(8);

    let err = chain.process_block(bad).await.expect_err("replay must fail");
    assert!(err.is_fatal());
    assert_eq!(chain.latest_height().await.expect("height"), Some(0), "controller still answers");

    for h in 1..=2 {
        let outcome = chain.process_block(fx.block(h).clone()).await.expect("block");
        assert_eq!(outcome, BlockOutcome::Added);
    }
    let summary = chain.revert_to_height(Some(1)).await.expect("revert");
    assert_eq!(summary.height, 1);
    assert_eq!(summary.blocks_reverted, 1);
    assert_eq!(chain.latest_height().await.expect("height"), Some(1));
    assert_eq!(chain.process_block(fx.block(2).clone()).await.expect("re-ingest"), BlockOutcome::Added);
    assert_eq!(chain.block_hash(2).await.expect("hash"), Some(fx.block(2).hash()));

    drop(chain);
    controller.await.expect("controller stops once every handle is gone");

    println!("✅ Block application runs off the async workers and the controller survives");
}
