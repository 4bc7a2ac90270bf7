//! Binary wire protocol for channel-multiplexed CRDT synchronization.
//!
//! Wire format (bincode-encoded, serde mode, standard config):
//! ```text
//! Envelope::Frame ┌───────────────┬──────────┬──────────────────────────┐
//!                 │ channel       │ sender   │ message                  │
//!                 │ "room/file"   │ 16 bytes │ tagged union (see below) │
//!                 └───────────────┴──────────┴──────────────────────────┘
//! Envelope::Ping / Envelope::Pong: heartbeat, no payload
//! ```
//!
//! One WebSocket carries every channel a client has open. The relay
//! overwrites `sender` with the site id of the connection a frame arrived
//! on, so a peer can never speak for another one.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use codesync_core::{Operation, SiteId, StateVector};

use crate::presence::{AwarenessMessage, CursorColor};

/// Longest accepted channel key, in bytes.
pub const MAX_KEY_LEN: usize = 256;

/// Namespace for deriving stable document ids from channel keys.
const DOC_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_9d2e_4b7a_4c1f_9e3d_2a5b_8c7d_0e1f);

// ───────────────────────────────────────────────────────────────────
// Channel keys
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("{0} id is empty")]
    Empty(&'static str),
    #[error("{part} id contains invalid character {ch:?}")]
    InvalidChar { part: &'static str, ch: char },
    #[error("channel key must have the form room/file")]
    MissingSeparator,
    #[error("channel key is {0} bytes, limit is {max}", max = MAX_KEY_LEN)]
    TooLong(usize),
}

/// Identifies one `(room, file)` synchronization channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn new(room: &str, file: &str) -> Result<Self, KeyError> {
        validate_part("room", room)?;
        validate_part("file", file)?;
        let key = format!("{room}/{file}");
        if key.len() > MAX_KEY_LEN {
            return Err(KeyError::TooLong(key.len()));
        }
        Ok(Self(key))
    }

    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let (room, file) = raw.split_once('/').ok_or(KeyError::MissingSeparator)?;
        Self::new(room, file)
    }

    pub fn room(&self) -> &str {
        self.split().0
    }

    pub fn file(&self) -> &str {
        self.split().1
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable 16-byte id for storage keys.
    pub fn doc_id(&self) -> Uuid {
        Uuid::new_v5(&DOC_NAMESPACE, self.0.as_bytes())
    }

    fn split(&self) -> (&str, &str) {
        // Validated at construction.
        self.0.split_once('/').unwrap_or((&self.0, ""))
    }
}

fn validate_part(part: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::Empty(part));
    }
    if let Some(ch) = value
        .chars()
        .find(|c| *c == '/' || c.is_whitespace() || c.is_control())
    {
        return Err(KeyError::InvalidChar { part, ch });
    }
    Ok(())
}

impl TryFrom<String> for ChannelKey {
    type Error = KeyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<ChannelKey> for String {
    fn from(key: ChannelKey) -> Self {
        key.0
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Peers and messages
// ───────────────────────────────────────────────────────────────────

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub site: SiteId,
    pub name: String,
    pub color: CursorColor,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_site(SiteId::random(), name)
    }

    /// Create with an explicit site id. The color is derived from it.
    pub fn with_site(site: SiteId, name: impl Into<String>) -> Self {
        Self {
            site,
            name: name.into(),
            color: CursorColor::from_uuid(site.as_uuid()),
        }
    }
}

/// Per-channel message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    /// Client subscribes to a channel and states what it already has.
    Join {
        peer: PeerInfo,
        state_vector: StateVector,
    },
    /// Client unsubscribes from a channel.
    Leave,
    /// One CRDT operation.
    Op(Operation),
    /// Ask for every operation missing from `state_vector`.
    SyncRequest { state_vector: StateVector },
    /// Catch-up answer to `Join` or `SyncRequest`.
    SyncResponse {
        ops: Vec<Operation>,
        state_vector: StateVector,
        peers: Vec<PeerInfo>,
    },
    Presence(AwarenessMessage),
    PeerJoined(PeerInfo),
    PeerLeft(SiteId),
    /// Non-fatal condition, e.g. a failed save.
    Warning(String),
    /// The channel was refused or failed for this connection only.
    Error(String),
}

impl Message {
    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join { .. } => "join",
            Message::Leave => "leave",
            Message::Op(_) => "op",
            Message::SyncRequest { .. } => "sync-request",
            Message::SyncResponse { .. } => "sync-response",
            Message::Presence(_) => "presence",
            Message::PeerJoined(_) => "peer-joined",
            Message::PeerLeft(_) => "peer-left",
            Message::Warning(_) => "warning",
            Message::Error(_) => "error",
        }
    }
}

/// A message addressed to one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub channel: ChannelKey,
    pub sender: SiteId,
    pub message: Message,
}

impl Frame {
    pub fn new(channel: ChannelKey, sender: SiteId, message: Message) -> Self {
        Self {
            channel,
            sender,
            message,
        }
    }

    pub fn join(channel: ChannelKey, peer: PeerInfo, state_vector: StateVector) -> Self {
        let sender = peer.site;
        Self::new(channel, sender, Message::Join { peer, state_vector })
    }

    pub fn op(channel: ChannelKey, op: Operation) -> Self {
        let sender = op.site();
        Self::new(channel, sender, Message::Op(op))
    }

    /// Whether this frame carries a CRDT operation (and must survive
    /// disconnects).
    pub fn is_op(&self) -> bool {
        matches!(self.message, Message::Op(_))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Envelope::Frame(self.clone()).encode()
    }
}

/// Top-level unit on the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Envelope {
    Frame(Frame),
    Ping,
    Pong,
}

impl Envelope {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format. Rejects invalid channel keys.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (env, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(env)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
