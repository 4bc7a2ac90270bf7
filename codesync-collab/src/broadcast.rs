//! Per-channel fan-out to every subscriber except the sender.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames; a peer that falls further behind loses the oldest ones. The
//! relay then pushes it a full `SyncResponse` (see `server`).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};

use codesync_core::SiteId;

use crate::protocol::{Frame, PeerInfo, ProtocolError};

/// An encoded frame together with the connection that caused it.
///
/// Receivers compare `sender` against their own site to skip echoes.
#[derive(Debug, Clone)]
pub struct Relayed {
    pub sender: SiteId,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters kept outside the peer lock so sends never wait on it.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// The subscribers of one channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Relayed>,

    /// Joined peers, keyed by the connection's site.
    peers: RwLock<HashMap<SiteId, PeerInfo>>,

    capacity: usize,

    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a group buffering up to `capacity` frames per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Register a peer and hand back its receiver.
    ///
    /// The receiver only sees frames broadcast after this call.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Relayed> {
        let mut peers = self.peers.write().await;
        peers.insert(info.site, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, site: &SiteId) -> Option<PeerInfo> {
        self.peers.write().await.remove(site)
    }

    /// Encode `frame` once and fan it out. Returns the number of receivers.
    pub fn broadcast(&self, sender: SiteId, frame: &Frame) -> Result<usize, ProtocolError> {
        let encoded = frame.encode()?;
        Ok(self.broadcast_raw(sender, Arc::new(encoded)))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, sender: SiteId, bytes: Arc<Vec<u8>>) -> usize {
        // No receivers is not an error: the room may be emptying.
        let count = self.sender.send(Relayed { sender, bytes }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lagged(&self, skipped: u64) {
        self.stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, site: &SiteId) -> bool {
        self.peers.read().await.contains_key(site)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
