//! Peer message wire format
//!
//! Messages exchanged between distribution tasks:
//! - Hello: identifies the sender right after a connection opens
//! - ResourceExists: a peer holds (or has just created) a resource
//! - ResourceInvalidated: a resource was deleted and must be dropped
//! - ChunkRequest/Response: ask a peer for one chunk
//! - JobPayload: a serialized distribution job (key/value fields)

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::network::wire;

/// Message type byte for wire format
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMessageType {
    Hello = 0x01,
    ResourceExists = 0x02,
    ResourceInvalidated = 0x03,
    ChunkRequest = 0x04,
    ChunkResponse = 0x05,
    JobPayload = 0x06,
}

impl TryFrom<u8> for PeerMessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PeerMessageType::Hello),
            0x02 => Ok(PeerMessageType::ResourceExists),
            0x03 => Ok(PeerMessageType::ResourceInvalidated),
            0x04 => Ok(PeerMessageType::ChunkRequest),
            0x05 => Ok(PeerMessageType::ChunkResponse),
            0x06 => Ok(PeerMessageType::JobPayload),
            _ => Err(()),
        }
    }
}

/// First message on every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub peer_id: String,
}

/// A peer announces a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceExists {
    pub uri: String,
    /// Number of chunks, when the sender knows it
    pub chunk_count: Option<u32>,
}

/// A peer deleted a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInvalidated {
    pub uri: String,
}

/// Ask for one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub uri: String,
    pub index: u32,
}

/// Answer to a [`ChunkRequest`]; `data` is `None` when the peer lacks it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub uri: String,
    pub index: u32,
    #[serde(with = "serde_bytes")]
    pub data: Option<Vec<u8>>,
}

/// One key/value pair of a job payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobField {
    pub key: String,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

/// Serialized distribution job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Job kind name, resolved by the receiver
    pub kind: String,
    pub fields: Vec<JobField>,
}

impl JobPayload {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.fields.push(JobField {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// First value stored under `key`
    pub fn field(&self, key: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|f| f.key == key)
            .map(|f| f.value.as_slice())
    }
}

/// Message between distribution tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Hello(Hello),
    ResourceExists(ResourceExists),
    ResourceInvalidated(ResourceInvalidated),
    ChunkRequest(ChunkRequest),
    ChunkResponse(ChunkResponse),
    JobPayload(JobPayload),
}

impl PeerMessage {
    pub fn message_type(&self) -> PeerMessageType {
        match self {
            PeerMessage::Hello(_) => PeerMessageType::Hello,
            PeerMessage::ResourceExists(_) => PeerMessageType::ResourceExists,
            PeerMessage::ResourceInvalidated(_) => PeerMessageType::ResourceInvalidated,
            PeerMessage::ChunkRequest(_) => PeerMessageType::ChunkRequest,
            PeerMessage::ChunkResponse(_) => PeerMessageType::ChunkResponse,
            PeerMessage::JobPayload(_) => PeerMessageType::JobPayload,
        }
    }

    /// Encode message for transmission using shared wire framing
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let payload = match self {
            PeerMessage::Hello(msg) => postcard::to_allocvec(msg),
            PeerMessage::ResourceExists(msg) => postcard::to_allocvec(msg),
            PeerMessage::ResourceInvalidated(msg) => postcard::to_allocvec(msg),
            PeerMessage::ChunkRequest(msg) => postcard::to_allocvec(msg),
            PeerMessage::ChunkResponse(msg) => postcard::to_allocvec(msg),
            PeerMessage::JobPayload(msg) => postcard::to_allocvec(msg),
        }
        .map_err(|e| CodecError::InvalidPayload(e.to_string()))?;

        wire::encode_frame(self.message_type() as u8, &payload).map_err(CodecError::from)
    }

    /// Decode message from one complete frame
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let frame = wire::decode_frame_exact(bytes)?;
        Self::decode_payload(frame.msg_type, frame.payload)
    }

    fn decode_payload(msg_type_byte: u8, payload: &[u8]) -> Result<Self, CodecError> {
        let msg_type = PeerMessageType::try_from(msg_type_byte)
            .map_err(|_| CodecError::UnknownType(msg_type_byte))?;

        match msg_type {
            PeerMessageType::Hello => Ok(PeerMessage::Hello(decode_structured_payload(payload)?)),
            PeerMessageType::ResourceExists => Ok(PeerMessage::ResourceExists(
                decode_structured_payload(payload)?,
            )),
            PeerMessageType::ResourceInvalidated => Ok(PeerMessage::ResourceInvalidated(
                decode_structured_payload(payload)?,
            )),
            PeerMessageType::ChunkRequest => Ok(PeerMessage::ChunkRequest(
                decode_structured_payload(payload)?,
            )),
            PeerMessageType::ChunkResponse => Ok(PeerMessage::ChunkResponse(
                decode_structured_payload(payload)?,
            )),
            PeerMessageType::JobPayload => Ok(PeerMessage::JobPayload(
                decode_structured_payload(payload)?,
            )),
        }
    }
}

fn decode_structured_payload<T>(payload: &[u8]) -> Result<T, CodecError>
where
    T: DeserializeOwned,
{
    let (msg, rest) = postcard::take_from_bytes::<T>(payload)
        .map_err(|e| CodecError::InvalidPayload(e.to_string()))?;
    if !rest.is_empty() {
        return Err(CodecError::InvalidPayload(format!(
            "trailing payload bytes: {}",
            rest.len()
        )));
    }
    Ok(msg)
}

/// Error encoding or decoding a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Framing error
    Frame(wire::FrameError),
    /// Unknown message type
    UnknownType(u8),
    /// Invalid payload
    InvalidPayload(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Frame(e) => write!(f, "framing error: {}", e),
            CodecError::UnknownType(t) => write!(f, "unknown message type: 0x{:02x}", t),
            CodecError::InvalidPayload(e) => write!(f, "invalid payload: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<wire::FrameError> for CodecError {
    fn from(e: wire::FrameError) -> Self {
        CodecError::Frame(e)
    }
}
