//! One peer connection's handshake and block sync state machine.
//!
//! The session never touches the socket. Incoming messages are fed to
//! [`PeerSession::handle_message`] one at a time and replies are pushed onto
//! an outbound channel drained by the connection's writer task.

use anyhow::Context;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::{self, NodeKey};
use crate::explorer::{ChainError, ChainHandle};
use crate::ledger::{Address, Block, BlockHash, Field};
use crate::metrics;
use crate::protocol::{
    BlockLocators, BlockRequest, ChallengeRequest, ChallengeResponse, CodecError, Message, NodeType, Ping, Pong,
    CHECKPOINT_INTERVAL, MIN_PEER_VERSION, NUM_RECENTS, PROTOCOL_VERSION, RECENT_INTERVAL,
};

/// Handshake progress. Both sides send a challenge request; ours is answered
/// first, then we answer the peer's.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    ChallengeSent,
    AwaitingChallenge,
    Established,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("protocol violation: {0}")]
    Violation(String),
    #[error("invalid block locator: {0}")]
    InvalidLocators(String),
    #[error("peer is on a fork at height {height}")]
    Fork { height: u32 },
    #[error("peer thinks we are on a fork")]
    ForkedLocally,
    #[error("peer is outdated (version {0})")]
    Outdated(u32),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("outbound channel closed")]
    Closed,
    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl PeerError {
    /// Errors that must stop the node instead of triggering a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PeerError::Chain(e) if e.is_fatal())
    }
}

/// Identifier of the network's program restrictions list. Sent verbatim.
pub fn restrictions_id() -> Field {
    crypto::blake3_hash(b"restrictions/none")
}

#[derive(Clone, Debug)]
pub struct PeerConnection {
    pub handshake_state: HandshakeState,
    pub nonce: u64,
    pub peer_block_height: u32,
    pub is_fork: bool,
    pub block_locators: Option<BlockLocators>,
    pub pending_requests: BTreeSet<u32>,
    pub request_deadline: Option<Instant>,
    pub is_syncing: bool,
}

impl PeerConnection {
    pub fn new() -> Self {
        Self {
            handshake_state: HandshakeState::Idle,
            nonce: rand::thread_rng().gen(),
            peer_block_height: 0,
            is_fork: false,
            block_locators: None,
            pending_requests: BTreeSet::new(),
            request_deadline: None,
            is_syncing: false,
        }
    }

    fn deadline_elapsed(&self, now: Instant) -> bool {
        matches!(self.request_deadline, Some(d) if d <= now)
    }

    fn clear_requests(&mut self) {
        self.pending_requests.clear();
        self.request_deadline = None;
        self.is_syncing = false;
    }
}

impl Default for PeerConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct SyncSettings {
    /// Heights asked for in a fresh request.
    pub batch_size: u32,
    /// Heights asked for when re-requesting outstanding ones.
    pub retry_batch_size: u32,
    pub request_timeout: Duration,
    pub ping_interval: Duration,
    pub listener_port: u16,
    pub address: Address,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 1,
            retry_batch_size: 1,
            request_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(3),
            listener_port: 14133,
            address: [0u8; 32],
        }
    }
}

impl SyncSettings {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let bytes = hex::decode(cfg.node.address.trim()).context("node.address is not hex")?;
        let address: Address = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("node.address must be 32 bytes"))?;
        Ok(Self {
            batch_size: cfg.sync.batch_size.max(1),
            retry_batch_size: cfg.sync.retry_batch_size.max(1),
            request_timeout: Duration::from_secs(cfg.sync.request_timeout_secs),
            ping_interval: Duration::from_secs(cfg.node.ping_interval_secs.max(1)),
            listener_port: cfg.node.listener_port,
            address,
        })
    }
}

/// Checks the shape of a peer's locators.
pub fn validate_locators(locators: &BlockLocators) -> Result<(), PeerError> {
    let invalid = |m: &str| PeerError::InvalidLocators(m.to_string());

    let recents = &locators.recents;
    if recents.is_empty() {
        return Err(invalid("recents is empty"));
    }
    if recents.len() > NUM_RECENTS {
        return Err(invalid("recents is too long"));
    }
    let mut previous = 0u32;
    for (i, height) in recents.keys().enumerate() {
        if i == 0 && recents.len() < NUM_RECENTS && *height != 0 {
            return Err(invalid("first height must be 0"));
        }
        if i > 0 && Some(*height) != previous.checked_add(RECENT_INTERVAL) {
            return Err(invalid("recent heights must be in sequence"));
        }
        previous = *height;
    }

    let checkpoints = &locators.checkpoints;
    if checkpoints.is_empty() {
        return Err(invalid("checkpoints is empty"));
    }
    let mut previous = 0u32;
    for (i, height) in checkpoints.keys().enumerate() {
        if i == 0 && *height != 0 {
            return Err(invalid("first height must be 0"));
        }
        if i > 0 && Some(*height) != previous.checked_add(CHECKPOINT_INTERVAL) {
            return Err(invalid("checkpoint heights must be in sequence"));
        }
        previous = *height;
    }
    Ok(())
}

/// Height and peer hash used to compare chains.
pub fn common_ancestor(locators: &BlockLocators, local_height: u32) -> Result<(u32, BlockHash), PeerError> {
    if let Some(hash) = locators.recents.get(&local_height) {
        return Ok((local_height, *hash));
    }
    let checkpoint = local_height / CHECKPOINT_INTERVAL;
    if let Some(hash) = locators.checkpoints.get(&checkpoint) {
        return Ok((checkpoint, *hash));
    }
    locators
        .checkpoints
        .get(&0)
        .map(|hash| (0, *hash))
        .ok_or_else(|| PeerError::InvalidLocators("no checkpoint at height 0".into()))
}

/// Locators describing the local chain.
pub async fn build_locators(chain: &ChainHandle) -> Result<BlockLocators, ChainError> {
    let latest = chain.latest_height().await?.unwrap_or(0);
    let (recents, checkpoints) = BlockLocators::heights(latest);
    let mut locators = BlockLocators::default();
    for h in recents {
        if let Some(hash) = chain.block_hash(h).await? {
            locators.recents.insert(h, hash);
        }
    }
    for h in checkpoints {
        if let Some(hash) = chain.block_hash(h).await? {
            locators.checkpoints.insert(h, hash);
        }
    }
    Ok(locators)
}

async fn ping_message(chain: &ChainHandle) -> Result<Message, ChainError> {
    Ok(Message::Ping(Ping {
        version: PROTOCOL_VERSION,
        node_type: NodeType::Client,
        block_locators: Some(build_locators(chain).await?),
    }))
}

pub struct PeerSession {
    pub conn: PeerConnection,
    chain: ChainHandle,
    outbound: UnboundedSender<Message>,
    settings: SyncSettings,
    key: Arc<NodeKey>,
    ping_task: Option<JoinHandle<()>>,
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
    }
}

impl PeerSession {
    pub fn new(chain: ChainHandle, outbound: UnboundedSender<Message>, settings: SyncSettings, key: Arc<NodeKey>) -> Self {
        Self { conn: PeerConnection::new(), chain, outbound, settings, key, ping_task: None }
    }

    fn send(&self, message: Message) -> Result<(), PeerError> {
        debug!("sending {}", message.name());
        self.outbound.send(message).map_err(|_| PeerError::Closed)
    }

    fn require_established(&self, kind: &str) -> Result<(), PeerError> {
        if self.conn.handshake_state != HandshakeState::Established {
            return Err(PeerError::Violation(format!("{kind} before the handshake is done")));
        }
        Ok(())
    }

    /// Opens the handshake with our challenge request.
    pub fn start(&mut self) -> Result<(), PeerError> {
        if self.conn.handshake_state != HandshakeState::Idle {
            return Err(PeerError::Violation("session already started".into()));
        }
        self.send(Message::ChallengeRequest(ChallengeRequest {
            version: PROTOCOL_VERSION,
            listener_port: self.settings.listener_port,
            node_type: NodeType::Client,
            address: self.settings.address,
            nonce: self.conn.nonce,
        }))?;
        self.conn.handshake_state = HandshakeState::ChallengeSent;
        Ok(())
    }

    pub async fn handle_message(&mut self, message: Message) -> Result<(), PeerError> {
        match message {
            Message::BlockRequest(request) => {
                self.require_established("BlockRequest")?;
                debug!("not serving blocks {}..{}", request.start_height, request.end_height);
            }
            Message::BlockResponse(response) => {
                self.require_established("BlockResponse")?;
                self.on_blocks(response.blocks).await?;
            }
            Message::ChallengeRequest(request) => self.on_challenge_request(request).await?,
            Message::ChallengeResponse(_) => {
                if self.conn.handshake_state != HandshakeState::ChallengeSent {
                    return Err(PeerError::Violation("incorrect handshake state for ChallengeResponse".into()));
                }
                self.conn.handshake_state = HandshakeState::AwaitingChallenge;
            }
            Message::Ping(ping) => {
                self.require_established("Ping")?;
                self.on_ping(ping).await?;
            }
            Message::Pong(pong) => {
                self.require_established("Pong")?;
                if pong.is_fork == Some(true) {
                    return Err(PeerError::ForkedLocally);
                }
            }
            Message::UnconfirmedTransaction(gossip) => {
                self.require_established("UnconfirmedTransaction")?;
                if let Err(e) = self.chain.process_unconfirmed_transaction(gossip.transaction).await {
                    warn!("failed to process unconfirmed transaction {}: {e}", gossip.transaction_id);
                }
            }
            Message::Disconnect(disconnect) => {
                info!("peer sent disconnect: {:?}", disconnect.reason);
            }
        }
        Ok(())
    }

    async fn on_challenge_request(&mut self, request: ChallengeRequest) -> Result<(), PeerError> {
        if self.conn.handshake_state != HandshakeState::AwaitingChallenge {
            return Err(PeerError::Violation("incorrect handshake state for ChallengeRequest".into()));
        }
        if request.version < MIN_PEER_VERSION {
            return Err(PeerError::Outdated(request.version));
        }
        let dev_mode = self.chain.dev_mode().await?;
        let response_nonce: u64 = rand::thread_rng().gen();
        let response = ChallengeResponse {
            genesis_header: Block::genesis(dev_mode).header,
            restrictions_id: restrictions_id(),
            public_key: self.key.public_key_bytes(),
            signature: self.key.sign_challenge(request.nonce, response_nonce),
            nonce: response_nonce,
        };
        self.conn.handshake_state = HandshakeState::Established;
        self.send(Message::ChallengeResponse(response))?;
        info!("🤝 handshake complete");
        self.send(ping_message(&self.chain).await?)?;
        self.start_ping_task();
        Ok(())
    }

    fn start_ping_task(&mut self) {
        let chain = self.chain.clone();
        let outbound = self.outbound.clone();
        let period = self.settings.ping_interval;
        self.ping_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match ping_message(&chain).await {
                    Ok(ping) => {
                        if outbound.send(ping).is_err() {
                            break;
                        }
                    }
                    Err(ChainError::Closed) => break,
                    Err(e) => debug!("skipping ping: {e}"),
                }
            }
        }));
    }

    async fn on_ping(&mut self, ping: Ping) -> Result<(), PeerError> {
        let is_fork = match ping.block_locators {
            None => None,
            Some(locators) => {
                validate_locators(&locators)?;
                let latest = self.chain.latest_height().await?.unwrap_or(0);
                let (height, remote_hash) = common_ancestor(&locators, latest)?;
                let local_hash = self.chain.block_hash(height).await?;
                if local_hash != Some(remote_hash) && !self.chain.dev_mode().await? {
                    self.conn.is_fork = true;
                    return Err(PeerError::Fork { height });
                }
                self.conn.block_locators = Some(locators);
                self.conn.is_fork = false;
                Some(false)
            }
        };
        self.send(Message::Pong(Pong { is_fork }))?;
        if !self.conn.is_syncing || self.conn.deadline_elapsed(Instant::now()) {
            self.sync().await?;
        }
        Ok(())
    }

    async fn on_blocks(&mut self, blocks: Vec<Block>) -> Result<(), PeerError> {
        for block in blocks {
            let height = block.height();
            if self.conn.pending_requests.remove(&height) {
                self.chain.process_block(block).await?;
            } else {
                debug!("dropping unrequested block {height}");
            }
        }
        if self.conn.pending_requests.is_empty() {
            self.conn.clear_requests();
            self.conn.is_fork = false;
        }
        self.sync().await
    }

    /// One sync step. Safe to call at any time.
    pub async fn sync(&mut self) -> Result<(), PeerError> {
        let now = Instant::now();
        if self.conn.deadline_elapsed(now) {
            warn!(
                "block request timed out with {} heights outstanding, retrying",
                self.conn.pending_requests.len()
            );
            self.conn.clear_requests();
        }
        let Some(peer_height) = self.conn.block_locators.as_ref().and_then(BlockLocators::latest_height) else {
            return Ok(());
        };
        self.conn.peer_block_height = peer_height;
        metrics::PEER_HEIGHT.set(peer_height as i64);

        if self.conn.is_syncing {
            let (Some(&first), Some(&last)) =
                (self.conn.pending_requests.first(), self.conn.pending_requests.last())
            else {
                self.conn.clear_requests();
                return Ok(());
            };
            let end = last.saturating_add(1).min(first.saturating_add(self.settings.retry_batch_size));
            self.conn.request_deadline = Some(now + self.settings.request_timeout);
            return self.send(Message::BlockRequest(BlockRequest { start_height: first, end_height: end }));
        }

        let latest = self.chain.latest_height().await?.unwrap_or(0);
        if latest >= peer_height {
            return Ok(());
        }
        // Heights come from the peer; u32::MAX itself is never requestable.
        let start = latest + 1;
        let end = peer_height.saturating_add(1).min(start.saturating_add(self.settings.batch_size));
        if end <= start {
            return Ok(());
        }
        info!("🔄 synchronizing blocks {start}..{end} (peer at {peer_height})");
        self.conn.is_syncing = true;
        self.conn.pending_requests.extend(start..end);
        self.conn.request_deadline = Some(now + self.settings.request_timeout);
        self.send(Message::BlockRequest(BlockRequest { start_height: start, end_height: end }))
    }
}
