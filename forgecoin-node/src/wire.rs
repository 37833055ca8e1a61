//! Wire protocol: length-prefixed JSON frames.
//!
//! Every frame is a 4-byte big-endian length followed by a UTF-8 JSON
//! object `{"kind": ..., "payload": ..., "origin_id": ...}`. The digest
//! of `(kind, payload)` keys the duplicate-suppression set, so its
//! serialization must be byte-stable across nodes; both sides compute it
//! from the decoded message, never from raw socket bytes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use forgecoin_core::types::{Block, Transaction};

/// Upper bound on a single frame body; larger frames are a protocol error.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Message body, adjacently tagged to match the wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum Payload {
    /// Handshake; exchanged on connect in both directions, never gossiped.
    #[serde(rename = "HELLO")]
    Hello { peer_id: String, listen_port: u16 },
    #[serde(rename = "NEW_TX")]
    NewTx { tx: Transaction },
    #[serde(rename = "NEW_BLOCK")]
    NewBlock { block: Block },
    #[serde(rename = "GET_CHAIN")]
    GetChain { from_index: u64 },
    #[serde(rename = "CHAIN_RESPONSE")]
    ChainResponse { blocks: Vec<Block> },
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Hello { .. } => "HELLO",
            Payload::NewTx { .. } => "NEW_TX",
            Payload::NewBlock { .. } => "NEW_BLOCK",
            Payload::GetChain { .. } => "GET_CHAIN",
            Payload::ChainResponse { .. } => "CHAIN_RESPONSE",
        }
    }

    /// Digest keying the seen-set: SHA-256 over the tagged serialization,
    /// which covers both the kind and the payload.
    pub fn digest(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(body.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// A decoded frame: the message plus the id of the node that originated it.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub payload: Payload,
    pub origin_id: String,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    Oversize(usize),
    #[error("frame is not a JSON object")]
    NotAnObject,
}

/// Serializes a frame body (without the length prefix).
pub fn encode(frame: &Frame) -> Result<Vec<u8>, WireError> {
    let mut value = serde_json::to_value(&frame.payload)?;
    let object = value.as_object_mut().ok_or(WireError::NotAnObject)?;
    object.insert(
        "origin_id".to_string(),
        serde_json::Value::String(frame.origin_id.clone()),
    );
    Ok(serde_json::to_vec(&value)?)
}

/// Parses a frame body (without the length prefix).
pub fn decode(bytes: &[u8]) -> Result<Frame, WireError> {
    let mut value: serde_json::Value = serde_json::from_slice(bytes)?;
    let object = value.as_object_mut().ok_or(WireError::NotAnObject)?;
    let origin_id = match object.remove("origin_id") {
        Some(serde_json::Value::String(id)) => id,
        _ => String::new(),
    };
    let payload: Payload = serde_json::from_value(value)?;
    Ok(Frame { payload, origin_id })
}

/// Reads one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, WireError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(WireError::Oversize(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode(&body)
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), WireError> {
    let body = encode(frame)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(WireError::Oversize(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
