//! P2P protocol messages
//!
//! One JSON envelope per line: `{"type": u8, "payload": <base64 JSON>}`.
//! The payload encoding mirrors a byte slice marshalled to JSON.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::identity::Handshake;
use super::PeerError;
use crate::consensus::Block;
use crate::crypto::Hash;

/// Largest accepted line (64 MiB)
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Wire type codes
pub mod msg_type {
    pub const HANDSHAKE: u8 = 0;
    pub const PING: u8 = 1;
    pub const PONG: u8 = 2;
    pub const NEW_BLOCK: u8 = 3;
    pub const GET_BLOCK: u8 = 4;
    pub const BLOCK_DATA: u8 = 5;
    pub const GET_STATUS: u8 = 6;
    pub const STATUS: u8 = 7;
    pub const GOSSIP_PEERS: u8 = 8;
    pub const REQUEST_BLOCKS: u8 = 9;
    pub const BLOCKS_BATCH: u8 = 10;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: u8,
    #[serde(default)]
    payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlockPayload {
    pub height: u64,
    pub hash: Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockPayload {
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDataPayload {
    pub height: u64,
    pub block: Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub height: u64,
    pub hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipPeersPayload {
    pub addrs: Vec<String>,
    pub seen_at: i64,
    pub net_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBlocksPayload {
    pub from_height: u64,
    pub max_blocks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocksBatchPayload {
    pub from_height: u64,
    pub count: u32,
    pub blocks: Vec<Block>,
    pub tip_height: u64,
    pub eof: bool,
}

impl BlocksBatchPayload {
    /// Empty, non-final batch: the server is at its concurrency limit
    pub fn busy(from_height: u64, tip_height: u64) -> Self {
        Self {
            from_height,
            count: 0,
            blocks: Vec::new(),
            tip_height,
            eof: false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.count == 0 && !self.eof
    }
}

/// P2P messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    Ping(PingPayload),
    Pong(PingPayload),
    NewBlock(NewBlockPayload),
    GetBlock(GetBlockPayload),
    BlockData(BlockDataPayload),
    GetStatus,
    Status(StatusPayload),
    GossipPeers(GossipPeersPayload),
    RequestBlocks(RequestBlocksPayload),
    BlocksBatch(BlocksBatchPayload),
}

fn pack<T: Serialize>(msg_type: u8, body: &T) -> Result<Envelope, PeerError> {
    Ok(Envelope {
        msg_type,
        payload: STANDARD.encode(serde_json::to_vec(body)?),
    })
}

fn unpack<T: DeserializeOwned>(payload: &[u8]) -> Result<T, PeerError> {
    serde_json::from_slice(payload).map_err(|e| PeerError::Protocol(format!("bad payload: {}", e)))
}

impl Message {
    pub fn type_code(&self) -> u8 {
        use msg_type::*;
        match self {
            Message::Handshake(_) => HANDSHAKE,
            Message::Ping(_) => PING,
            Message::Pong(_) => PONG,
            Message::NewBlock(_) => NEW_BLOCK,
            Message::GetBlock(_) => GET_BLOCK,
            Message::BlockData(_) => BLOCK_DATA,
            Message::GetStatus => GET_STATUS,
            Message::Status(_) => STATUS,
            Message::GossipPeers(_) => GOSSIP_PEERS,
            Message::RequestBlocks(_) => REQUEST_BLOCKS,
            Message::BlocksBatch(_) => BLOCKS_BATCH,
        }
    }

    /// Command name for logs
    pub fn command(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::NewBlock(_) => "new_block",
            Message::GetBlock(_) => "get_block",
            Message::BlockData(_) => "block_data",
            Message::GetStatus => "get_status",
            Message::Status(_) => "status",
            Message::GossipPeers(_) => "gossip_peers",
            Message::RequestBlocks(_) => "request_blocks",
            Message::BlocksBatch(_) => "blocks_batch",
        }
    }

    /// Encode as one newline-terminated line
    pub fn encode(&self) -> Result<Vec<u8>, PeerError> {
        let code = self.type_code();
        let envelope = match self {
            Message::Handshake(p) => pack(code, p)?,
            Message::Ping(p) | Message::Pong(p) => pack(code, p)?,
            Message::NewBlock(p) => pack(code, p)?,
            Message::GetBlock(p) => pack(code, p)?,
            Message::BlockData(p) => pack(code, p)?,
            Message::GetStatus => Envelope {
                msg_type: code,
                payload: String::new(),
            },
            Message::Status(p) => pack(code, p)?,
            Message::GossipPeers(p) => pack(code, p)?,
            Message::RequestBlocks(p) => pack(code, p)?,
            Message::BlocksBatch(p) => pack(code, p)?,
        };
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Decode one line (trailing newline optional)
    pub fn decode(line: &[u8]) -> Result<Self, PeerError> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let envelope: Envelope = serde_json::from_slice(line)
            .map_err(|e| PeerError::Protocol(format!("bad envelope: {}", e)))?;
        let payload = STANDARD
            .decode(envelope.payload.as_bytes())
            .map_err(|e| PeerError::Protocol(format!("bad payload encoding: {}", e)))?;

        use msg_type::*;
        let msg = match envelope.msg_type {
            HANDSHAKE => Message::Handshake(unpack(&payload)?),
            PING => Message::Ping(unpack(&payload)?),
            PONG => Message::Pong(unpack(&payload)?),
            NEW_BLOCK => Message::NewBlock(unpack(&payload)?),
            GET_BLOCK => Message::GetBlock(unpack(&payload)?),
            BLOCK_DATA => Message::BlockData(unpack(&payload)?),
            GET_STATUS => Message::GetStatus,
            STATUS => Message::Status(unpack(&payload)?),
            GOSSIP_PEERS => Message::GossipPeers(unpack(&payload)?),
            REQUEST_BLOCKS => Message::RequestBlocks(unpack(&payload)?),
            BLOCKS_BATCH => Message::BlocksBatch(unpack(&payload)?),
            other => return Err(PeerError::Protocol(format!("unknown message type {}", other))),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_framing() {
        let msg = Message::NewBlock(NewBlockPayload { height: 7, hash: Hash([3; 32]) });
        let line = msg.encode().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);

        let envelope: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(envelope["type"], 3);
        assert!(envelope["payload"].is_string());
        assert_eq!(Message::decode(&line).unwrap(), msg);
    }

    #[test]
    fn test_get_status_has_empty_payload() {
        let line = Message::GetStatus.encode().unwrap();
        assert_eq!(Message::decode(&line).unwrap(), Message::GetStatus);
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let line = br#"{"type":42,"payload":""}"#;
        assert!(matches!(Message::decode(line), Err(PeerError::Protocol(_))));
        assert!(matches!(Message::decode(b"not json"), Err(PeerError::Protocol(_))));
    }

    #[test]
    fn test_busy_batch() {
        let batch = BlocksBatchPayload::busy(10, 20);
        assert!(batch.is_busy());
        let done = BlocksBatchPayload { eof: true, ..BlocksBatchPayload::busy(21, 20) };
        assert!(!done.is_busy());
    }
}
