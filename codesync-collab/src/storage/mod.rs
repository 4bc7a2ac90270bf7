//! Persistence adapters for the relay.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   ops / snapshots  ┌──────────────────┐
//! │ RelayServer │ ─────────────────► │ StateStore       │  CRDT history
//! │ (per room)  │                    │ memory | RocksDB │
//! └──────┬──────┘                    └──────────────────┘
//!        │ converged text
//!        ▼
//! ┌──────────────────────┐
//! │ FileContentService   │  plain file content, as other services see it
//! │ memory | JSON files  │
//! └──────────────────────┘
//! ```
//!
//! History values are bincode-encoded and LZ4-compressed.

use std::time::Duration;

use uuid::Uuid;

use codesync_core::Operation;

pub mod content;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

pub use content::{FileContent, FileContentService, FsContentStore, MemoryContentStore};
pub use memory::MemoryStateStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksStateStore, StoreConfig};

/// Durable CRDT history per channel, keyed by `ChannelKey::doc_id`.
///
/// A document's history is a snapshot (an operation list) followed by
/// operations appended since.
pub trait StateStore: Send + Sync {
    /// Replace the stored history with `ops` and drop appended operations.
    fn save_snapshot(&self, doc_id: Uuid, ops: &[Operation]) -> Result<(), StoreError>;

    /// Full history in application order, `None` for unknown documents.
    fn load(&self, doc_id: Uuid) -> Result<Option<Vec<Operation>>, StoreError>;

    fn append_op(&self, doc_id: Uuid, op: &Operation) -> Result<(), StoreError>;

    /// Fold appended operations into the snapshot. Returns how many were
    /// folded.
    fn compact(&self, doc_id: Uuid) -> Result<u64, StoreError>;
}

/// When the relay writes converged text to the file content service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistPolicy {
    /// After every applied operation.
    EveryChange,
    /// Once edits have been quiet for the given duration.
    Debounced(Duration),
    /// Only when the last peer leaves.
    OnClose,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        PersistPolicy::Debounced(Duration::from_secs(2))
    }
}

impl std::str::FromStr for PersistPolicy {
    type Err = String;

    /// `every-change`, `on-close`, or a debounce in milliseconds.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "every-change" => Ok(PersistPolicy::EveryChange),
            "on-close" => Ok(PersistPolicy::OnClose),
            other => other
                .parse::<u64>()
                .map(|ms| PersistPolicy::Debounced(Duration::from_millis(ms)))
                .map_err(|_| format!("invalid persist policy: {other}")),
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend error
    DatabaseError(String),
    /// Document not found
    NotFound(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}

/// bincode + LZ4 block compression.
pub(crate) fn encode_compressed<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

pub(crate) fn decode_compressed<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}
