//! # codesync-collab: Channel-multiplexed collaboration over WebSockets
//!
//! Moves CRDT operations and presence between editors through a relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SessionMux  │ ◄────────────────► │ RelayServer │
//! │ RelayClient │  Frame{channel,..} │ (central)   │
//! └──────┬──────┘                    └──────┬──────┘
//!        │ per channel                      │ per channel
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌─────────────┐
//! │ Document    │                    │ Document    │
//! │ Awareness   │                    │ (authority) │
//! └─────────────┘                    └──────┬──────┘
//!                                           │
//!                                   ┌───────┴────────┐
//!                                   │ BroadcastGroup │
//!                                   │ StateStore     │
//!                                   │ FileContent    │
//!                                   └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded `Envelope`/`Frame`)
//! - [`broadcast`]: Per-channel fan-out with backpressure
//! - [`server`]: WebSocket relay
//! - [`client`]: WebSocket transport with reconnect and offline queue
//! - [`presence`]: Awareness: cursors, selections, who is here
//! - [`session`]: Channel multiplexer and editor panes
//! - [`storage`]: History and file content persistence

pub mod protocol;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod presence;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use protocol::{ChannelKey, Envelope, Frame, KeyError, Message, PeerInfo, ProtocolError};
pub use broadcast::{BroadcastGroup, BroadcastStats, Relayed};
pub use presence::{
    Awareness, AwarenessChange, AwarenessMessage, CursorColor, PresenceRecord, ResolvedCursor,
    Selection,
};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use client::{
    Backoff, BackoffConfig, ClientConfig, ConnectionState, FrameSender, OfflineQueue, RelayClient,
    TransportEvent,
};
pub use session::{
    ChannelHandle, ChannelSender, Pane, SessionConfig, SessionError, SessionEvent, SessionMux,
};
pub use storage::{
    FileContent, FileContentService, FsContentStore, MemoryContentStore, MemoryStateStore,
    PersistPolicy, StateStore, StoreError,
};
#[cfg(feature = "rocksdb")]
pub use storage::{RocksStateStore, StoreConfig};
