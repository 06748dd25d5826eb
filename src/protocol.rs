//! Peer wire messages and their framing.
//!
//! A frame is a little-endian `u32` length, then a little-endian `u16`
//! message tag, then the `bincode` body of that message. The length covers
//! the tag and the body.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ledger::{Address, Block, BlockHash, BlockHeader, Field, Transaction, TransactionId};

pub const PROTOCOL_VERSION: u32 = 17;
pub const MIN_PEER_VERSION: u32 = 17;

pub const NUM_RECENTS: usize = 100;
pub const RECENT_INTERVAL: u32 = 1;
pub const CHECKPOINT_INTERVAL: u32 = 10_000;

/// Frames above this size are rejected before the body is read.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Insufficient data for frame")]
    InsufficientData,
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Frame too short to carry a message tag")]
    MissingTag,
    #[error("Unknown message tag {0}")]
    UnknownTag(u16),
    #[error("Invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: bincode::Error,
    },
    #[error("Could not encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: bincode::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Client,
    Prover,
    Validator,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    ExceededForkRange,
    InvalidChallengeResponse,
    InvalidForkDepth,
    NoReasonGiven,
    ProtocolViolation,
    OutdatedClientVersion,
    PeerHasDisconnected,
    PeerRefresh,
    ShuttingDown,
    SyncComplete,
    TooManyFailures,
    TooManyPeers,
    YouNeedToSyncFirst,
    YourPortIsClosed(u16),
}

/// Recent and checkpoint block hashes a peer advertises.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocators {
    pub recents: BTreeMap<u32, BlockHash>,
    pub checkpoints: BTreeMap<u32, BlockHash>,
}

impl BlockLocators {
    /// Heights a node at `latest_height` advertises: the last `NUM_RECENTS`
    /// heights ending at the tip, and every `CHECKPOINT_INTERVAL`-th height.
    pub fn heights(latest_height: u32) -> (Vec<u32>, Vec<u32>) {
        let span = (NUM_RECENTS as u32 - 1) * RECENT_INTERVAL;
        let first = latest_height.saturating_sub(span);
        let recents = (first..=latest_height).step_by(RECENT_INTERVAL as usize).collect();
        let checkpoints = (0..=latest_height).step_by(CHECKPOINT_INTERVAL as usize).collect();
        (recents, checkpoints)
    }

    pub fn latest_height(&self) -> Option<u32> {
        self.recents.keys().next_back().copied()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub version: u32,
    pub listener_port: u16,
    pub node_type: NodeType,
    pub address: Address,
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub genesis_header: BlockHeader,
    pub restrictions_id: Field,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub version: u32,
    pub node_type: NodeType,
    pub block_locators: Option<BlockLocators>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub is_fork: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    pub start_height: u32,
    pub end_height: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResponse {
    pub request: BlockRequest,
    pub blocks: Vec<Block>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnconfirmedTransaction {
    pub transaction_id: TransactionId,
    pub transaction: Transaction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    pub reason: DisconnectReason,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    BlockRequest(BlockRequest),
    BlockResponse(BlockResponse),
    ChallengeRequest(ChallengeRequest),
    ChallengeResponse(ChallengeResponse),
    Disconnect(Disconnect),
    Ping(Ping),
    Pong(Pong),
    UnconfirmedTransaction(UnconfirmedTransaction),
}

fn encode_body<T: Serialize>(kind: &'static str, body: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(body).map_err(|source| CodecError::Encode { kind, source })
}

fn decode_body<T: DeserializeOwned>(kind: &'static str, body: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(body).map_err(|source| CodecError::InvalidPayload { kind, source })
}

impl Message {
    pub fn tag(&self) -> u16 {
        match self {
            Message::BlockRequest(_) => 0,
            Message::BlockResponse(_) => 1,
            Message::ChallengeRequest(_) => 2,
            Message::ChallengeResponse(_) => 3,
            Message::Disconnect(_) => 4,
            Message::Ping(_) => 5,
            Message::Pong(_) => 6,
            Message::UnconfirmedTransaction(_) => 7,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::BlockRequest(_) => "BlockRequest",
            Message::BlockResponse(_) => "BlockResponse",
            Message::ChallengeRequest(_) => "ChallengeRequest",
            Message::ChallengeResponse(_) => "ChallengeResponse",
            Message::Disconnect(_) => "Disconnect",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::UnconfirmedTransaction(_) => "UnconfirmedTransaction",
        }
    }

    /// Tag followed by body, without the length prefix.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let kind = self.name();
        let body = match self {
            Message::BlockRequest(m) => encode_body(kind, m)?,
            Message::BlockResponse(m) => encode_body(kind, m)?,
            Message::ChallengeRequest(m) => encode_body(kind, m)?,
            Message::ChallengeResponse(m) => encode_body(kind, m)?,
            Message::Disconnect(m) => encode_body(kind, m)?,
            Message::Ping(m) => encode_body(kind, m)?,
            Message::Pong(m) => encode_body(kind, m)?,
            Message::UnconfirmedTransaction(m) => encode_body(kind, m)?,
        };
        let mut out = Vec::with_capacity(2 + body.len());
        out.extend_from_slice(&self.tag().to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 2 {
            return Err(CodecError::MissingTag);
        }
        let tag = u16::from_le_bytes([data[0], data[1]]);
        let body = &data[2..];
        Ok(match tag {
            0 => Message::BlockRequest(decode_body("BlockRequest", body)?),
            1 => Message::BlockResponse(decode_body("BlockResponse", body)?),
            2 => Message::ChallengeRequest(decode_body("ChallengeRequest", body)?),
            3 => Message::ChallengeResponse(decode_body("ChallengeResponse", body)?),
            4 => Message::Disconnect(decode_body("Disconnect", body)?),
            5 => Message::Ping(decode_body("Ping", body)?),
            6 => Message::Pong(decode_body("Pong", body)?),
            7 => Message::UnconfirmedTransaction(decode_body("UnconfirmedTransaction", body)?),
            other => return Err(CodecError::UnknownTag(other)),
        })
    }
}

/// Serialize a message into a length-prefixed wire frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let payload = msg.to_bytes()?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge { size: payload.len(), max: MAX_FRAME_SIZE });
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one message from the front of `data`.
/// Returns the message and the number of bytes consumed.
pub fn decode_frame(data: &[u8]) -> Result<(Message, usize), CodecError> {
    if data.len() < 4 {
        return Err(CodecError::InsufficientData);
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge { size: len, max: MAX_FRAME_SIZE });
    }
    if data.len() < 4 + len {
        return Err(CodecError::InsufficientData);
    }
    let msg = Message::from_bytes(&data[4..4 + len])?;
    Ok((msg, 4 + len))
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, CodecError> {
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge { size: len, max: MAX_FRAME_SIZE });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Message::from_bytes(&payload)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<(), CodecError> {
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
