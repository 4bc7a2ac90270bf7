//! WebSocket relay with channel-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── room "r/a.rs" ── Document ── BroadcastGroup
//!            ├── one socket ───┤                      │
//! Client B ──┘   per client    └── room "r/b.rs" ── Document ── BroadcastGroup
//!                                                     │
//!                                  ┌──────────────────┼──────────────────┐
//!                                  ▼                  ▼                  ▼
//!                             StateStore     FileContentService     other peers
//!                           (op history)     (converged text)
//! ```
//!
//! Each channel room maintains:
//! - an authoritative `Document` replica
//! - a `BroadcastGroup` for fan-out to joined peers
//! - the latest presence message of every peer, replayed to newcomers
//! - a persistence task when the policy is debounced
//!
//! The relay never trusts `Frame::sender`: every frame it forwards is
//! stamped with the site of the connection it arrived on, and operations
//! must carry that same site.
//!
//! Lock order: channel gate, then `rooms`, then a room's own locks.
//! `stats` is only taken with none of those held, and storage I/O never
//! runs under `rooms`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use codesync_core::{ApplyOutcome, Document, Operation, SiteId, StateVector};

use crate::broadcast::{BroadcastGroup, Relayed};
use crate::presence::AwarenessMessage;
use crate::protocol::{ChannelKey, Envelope, Frame, Message, PeerInfo};
use crate::storage::content::language_for;
use crate::storage::{FileContent, FileContentService, PersistPolicy, StateStore, StoreError};

/// Appended operations after which a room folds its history.
const COMPACT_EVERY: u64 = 512;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per channel
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per channel
    pub broadcast_capacity: usize,
    /// A connection silent for this long is dropped
    pub heartbeat_timeout_secs: u64,
    /// When converged text is written to the file content service
    pub persist_policy: PersistPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_timeout_secs: 30,
            persist_policy: PersistPolicy::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_ops: u64,
    pub persisted_snapshots: u64,
    pub content_saves: u64,
    pub save_failures: u64,
}

/// One channel: replica + fan-out + presence cache.
struct ChannelRoom {
    key: ChannelKey,
    doc: RwLock<Document>,
    broadcast: BroadcastGroup,
    /// Latest presence message per peer.
    presence: RwLock<HashMap<SiteId, AwarenessMessage>>,
    /// Language reported by the content service, written back on save.
    language: Option<String>,
    /// Wakes the debounced persister.
    dirty: Notify,
    persister: Mutex<Option<JoinHandle<()>>>,
    appended: AtomicU64,
}

impl ChannelRoom {
    fn new(key: ChannelKey, doc: Document, language: Option<String>, capacity: usize) -> Self {
        Self {
            key,
            doc: RwLock::new(doc),
            broadcast: BroadcastGroup::new(capacity),
            presence: RwLock::new(HashMap::new()),
            language,
            dirty: Notify::new(),
            persister: Mutex::new(None),
            appended: AtomicU64::new(0),
        }
    }

    /// Catch-up answer for a peer that has seen `remote`.
    async fn sync_response(&self, remote: &StateVector, exclude: SiteId) -> Frame {
        let (ops, state_vector) = {
            let doc = self.doc.read().await;
            (doc.ops_since(remote), doc.state_vector().clone())
        };
        let peers = self
            .broadcast
            .peers()
            .await
            .into_iter()
            .filter(|p| p.site != exclude)
            .collect();
        Frame::new(
            self.key.clone(),
            SiteId::ROOT,
            Message::SyncResponse {
                ops,
                state_vector,
                peers,
            },
        )
    }
}

type Rooms = Arc<RwLock<HashMap<ChannelKey, Arc<ChannelRoom>>>>;

/// One lock per channel key, held while its room is opened or closed so a
/// reopen never reads storage the closing room is still writing.
#[derive(Default)]
struct ChannelGates {
    gates: std::sync::Mutex<HashMap<ChannelKey, Weak<Mutex<()>>>>,
}

impl ChannelGates {
    fn gate(&self, key: &ChannelKey) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(gate) = gates.get(key).and_then(Weak::upgrade) {
            return gate;
        }
        gates.retain(|_, gate| gate.strong_count() > 0);
        let gate = Arc::new(Mutex::new(()));
        gates.insert(key.clone(), Arc::downgrade(&gate));
        gate
    }
}

/// Everything a connection task needs, cloned once per connection.
#[derive(Clone)]
struct RelayContext {
    config: ServerConfig,
    rooms: Rooms,
    gates: Arc<ChannelGates>,
    stats: Arc<RwLock<ServerStats>>,
    state_store: Option<Arc<dyn StateStore>>,
    content_store: Option<Arc<dyn FileContentService>>,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    /// Channel rooms: key → (Document + BroadcastGroup)
    rooms: Rooms,
    gates: Arc<ChannelGates>,
    stats: Arc<RwLock<ServerStats>>,
    state_store: Option<Arc<dyn StateStore>>,
    content_store: Option<Arc<dyn FileContentService>>,
}

impl RelayServer {
    /// Create a relay without persistence.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            gates: Arc::new(ChannelGates::default()),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            state_store: None,
            content_store: None,
        }
    }

    /// Create a relay with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Persist CRDT history to `store`.
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Seed new channels from, and save converged text to, `store`.
    pub fn with_content_store(mut self, store: Arc<dyn FileContentService>) -> Self {
        self.content_store = Some(store);
        self
    }

    fn context(&self) -> RelayContext {
        RelayContext {
            config: self.config.clone(),
            rooms: self.rooms.clone(),
            gates: self.gates.clone(),
            stats: self.stats.clone(),
            state_store: self.state_store.clone(),
            content_store: self.content_store.clone(),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Relay listening on {} (persist: {:?})",
            self.config.bind_addr,
            self.config.persist_policy
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.context();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Current text of an open channel.
    pub async fn document_text(&self, key: &ChannelKey) -> Option<String> {
        let room = self.rooms.read().await.get(key).cloned()?;
        let text = room.doc.read().await.text();
        Some(text)
    }
}

// ───────────────────────────────────────────────────────────────────
// Connections
// ───────────────────────────────────────────────────────────────────

struct JoinedChannel {
    room: Arc<ChannelRoom>,
    forward: JoinHandle<()>,
}

/// Per-socket state.
struct Connection {
    addr: SocketAddr,
    /// Fixed by the first `Join`.
    site: Option<SiteId>,
    channels: HashMap<ChannelKey, JoinedChannel>,
    out: mpsc::UnboundedSender<Arc<Vec<u8>>>,
}

impl Connection {
    fn send(&self, frame: &Frame) {
        match frame.encode() {
            Ok(bytes) => {
                let _ = self.out.send(Arc::new(bytes));
            }
            Err(e) => log::error!("Failed to encode {} for {}: {e}", frame.message.kind(), self.addr),
        }
    }

    fn send_error(&self, channel: &ChannelKey, reason: impl Into<String>) {
        self.send(&Frame::new(channel.clone(), SiteId::ROOT, Message::Error(reason.into())));
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: RelayContext,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Arc<Vec<u8>>>();
    let mut conn = Connection {
        addr,
        site: None,
        channels: HashMap::new(),
        out: out_tx,
    };
    let timeout = Duration::from_secs(ctx.config.heartbeat_timeout_secs.max(1));
    let mut deadline = tokio::time::Instant::now() + timeout;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                log::info!("Heartbeat timeout for {addr}");
                break;
            }

            // Incoming WebSocket message
            msg = ws_receiver.next() => {
                deadline = tokio::time::Instant::now() + timeout;
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        {
                            let mut s = ctx.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        match Envelope::decode(&data) {
                            Ok(Envelope::Frame(frame)) => handle_frame(&ctx, &mut conn, frame).await,
                            Ok(Envelope::Ping) => {
                                if let Ok(pong) = Envelope::Pong.encode() {
                                    let _ = conn.out.send(Arc::new(pong));
                                }
                            }
                            Ok(Envelope::Pong) => {}
                            Err(e) => log::warn!("Dropping malformed frame from {addr}: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = ws_sender.send(WsMessage::Pong(data)).await {
                            log::warn!("Failed to answer ping from {addr}: {e}");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            // Outgoing frames for this connection
            Some(bytes) = out_rx.recv() => {
                if let Err(e) = ws_sender.send(WsMessage::Binary(bytes.to_vec().into())).await {
                    log::warn!("Failed to write to {addr}: {e}");
                    break;
                }
            }
        }
    }

    close_connection(&ctx, &mut conn).await;
    Ok(())
}

/// Leave every channel a closed connection joined.
async fn close_connection(ctx: &RelayContext, conn: &mut Connection) {
    let channels: Vec<(ChannelKey, JoinedChannel)> = conn.channels.drain().collect();
    if let Some(site) = conn.site {
        for (key, joined) in channels {
            leave_channel(ctx, site, &key, joined).await;
        }
    }

    let rooms = ctx.rooms.read().await.len();
    let mut s = ctx.stats.write().await;
    s.active_connections = s.active_connections.saturating_sub(1);
    s.active_rooms = rooms;
}

async fn handle_frame(ctx: &RelayContext, conn: &mut Connection, frame: Frame) {
    let Frame { channel, message, .. } = frame;
    log::trace!("{} from {} on {channel}", message.kind(), conn.addr);

    if let Message::Join { peer, state_vector } = message {
        join_channel(ctx, conn, channel, peer, state_vector).await;
        return;
    }

    let (Some(site), Some(room)) = (conn.site, conn.channels.get(&channel).map(|j| j.room.clone())) else {
        log::debug!("{} for unjoined channel {channel} from {}", message.kind(), conn.addr);
        conn.send_error(&channel, "channel not joined");
        return;
    };

    match message {
        Message::Leave => {
            if let Some(joined) = conn.channels.remove(&channel) {
                leave_channel(ctx, site, &channel, joined).await;
            }
        }
        Message::Op(op) => apply_op(ctx, &room, site, op).await,
        Message::SyncRequest { state_vector } => {
            conn.send(&room.sync_response(&state_vector, site).await);
        }
        Message::Presence(msg) => {
            {
                let mut cache = room.presence.write().await;
                match &msg {
                    AwarenessMessage::Update { .. } => {
                        cache.insert(site, msg.clone());
                    }
                    AwarenessMessage::Remove => {
                        cache.remove(&site);
                    }
                }
            }
            let frame = Frame::new(channel, site, Message::Presence(msg));
            if let Err(e) = room.broadcast.broadcast(site, &frame) {
                log::warn!("Failed to relay presence: {e}");
            }
        }
        other => {
            log::debug!("Ignoring server-bound {} from {}", other.kind(), conn.addr);
        }
    }
}

async fn join_channel(
    ctx: &RelayContext,
    conn: &mut Connection,
    key: ChannelKey,
    peer: PeerInfo,
    state_vector: StateVector,
) {
    let site = *conn.site.get_or_insert(peer.site);
    let peer = PeerInfo { site, ..peer };

    if let Some(joined) = conn.channels.get(&key) {
        // Already joined: treat as a resync.
        conn.send(&joined.room.sync_response(&state_vector, site).await);
        return;
    }

    let (room, rx) = loop {
        let existing = ctx.rooms.read().await.get(&key).cloned();
        let room = match existing {
            Some(room) => room,
            None => open_channel(ctx, &key).await,
        };

        // Registration and the emptiness check in `leave_channel` both run
        // under the rooms write lock. A room closed in between is retried.
        let mut rooms = ctx.rooms.write().await;
        if !rooms.get(&key).is_some_and(|current| Arc::ptr_eq(current, &room)) {
            continue;
        }

        if room.broadcast.peer_count().await >= ctx.config.max_peers_per_room {
            drop(rooms);
            log::warn!("Channel {key} is full, refusing {}", peer.name);
            conn.send_error(&key, "room is full");
            return;
        }

        let rx = room.broadcast.add_peer(peer.clone()).await;
        let count = rooms.len();
        drop(rooms);
        ctx.stats.write().await.active_rooms = count;
        break (room, rx);
    };

    log::info!("{} ({site}) joined {key}", peer.name);

    conn.send(&room.sync_response(&state_vector, site).await);

    // Replay presence of everyone already here
    for (other, msg) in room.presence.read().await.iter() {
        conn.send(&Frame::new(key.clone(), *other, Message::Presence(msg.clone())));
    }

    let joined = Frame::new(key.clone(), site, Message::PeerJoined(peer));
    if let Err(e) = room.broadcast.broadcast(site, &joined) {
        log::warn!("Failed to announce join on {key}: {e}");
    }

    let forward = tokio::spawn(forward_channel(room.clone(), rx, site, conn.out.clone()));
    conn.channels.insert(key, JoinedChannel { room, forward });
}

/// Open the room for `key`, or return the one another joiner opened
/// while this one waited at the gate.
async fn open_channel(ctx: &RelayContext, key: &ChannelKey) -> Arc<ChannelRoom> {
    let gate = ctx.gates.gate(key);
    let _opening = gate.lock().await;

    let existing = ctx.rooms.read().await.get(key).cloned();
    if let Some(room) = existing {
        return room;
    }

    let room = Arc::new(open_room(ctx, key).await);
    if let PersistPolicy::Debounced(delay) = ctx.config.persist_policy {
        if ctx.content_store.is_some() {
            let handle = tokio::spawn(debounced_persister(ctx.clone(), room.clone(), delay));
            *room.persister.lock().await = Some(handle);
        }
    }
    ctx.rooms.write().await.insert(key.clone(), room.clone());
    log::info!("Opened channel {key}");
    room
}

/// Pump one channel's broadcasts into a connection's outbound queue.
async fn forward_channel(
    room: Arc<ChannelRoom>,
    mut rx: broadcast::Receiver<Relayed>,
    site: SiteId,
    out: mpsc::UnboundedSender<Arc<Vec<u8>>>,
) {
    loop {
        match rx.recv().await {
            Ok(relayed) => {
                // Don't echo back to sender
                if relayed.sender == site {
                    continue;
                }
                if out.send(relayed.bytes).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Peer {site} lagged by {n} frames on {}", room.key);
                room.broadcast.record_lagged(n);
                // Skipped ops are lost for this peer; resend everything and
                // let idempotence discard what it already has.
                let frame = room.sync_response(&StateVector::new(), site).await;
                match frame.encode() {
                    Ok(bytes) => {
                        if out.send(Arc::new(bytes)).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!("Failed to encode catch-up for {site}: {e}"),
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn leave_channel(ctx: &RelayContext, site: SiteId, key: &ChannelKey, joined: JoinedChannel) {
    joined.forward.abort();
    let room = joined.room;

    if let Some(peer) = room.broadcast.remove_peer(&site).await {
        log::info!("{} ({site}) left {key}", peer.name);
    }
    room.presence.write().await.remove(&site);

    let left = Frame::new(key.clone(), site, Message::PeerLeft(site));
    if let Err(e) = room.broadcast.broadcast(site, &left) {
        log::warn!("Failed to announce leave on {key}: {e}");
    }

    // Remove an empty room, then persist it with only the gate held
    let gate = ctx.gates.gate(key);
    let _closing = gate.lock().await;
    let count = {
        let mut rooms = ctx.rooms.write().await;
        let Some(current) = rooms.get(key).cloned() else {
            return;
        };
        if !Arc::ptr_eq(&current, &room) || current.broadcast.peer_count().await > 0 {
            return;
        }
        rooms.remove(key);
        rooms.len()
    };

    if let Some(handle) = room.persister.lock().await.take() {
        handle.abort();
    }
    close_room(ctx, &room).await;

    ctx.stats.write().await.active_rooms = count;
    log::info!("Channel {key} closed (empty)");
}

// ───────────────────────────────────────────────────────────────────
// Persistence
// ───────────────────────────────────────────────────────────────────

/// Run a blocking store call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::IoError(e.to_string()))?
}

fn guess_language(key: &ChannelKey) -> Option<String> {
    language_for(key.file()).map(str::to_string)
}

/// Build a room's replica: state store, then file content seed, then empty.
async fn open_room(ctx: &RelayContext, key: &ChannelKey) -> ChannelRoom {
    let doc_id = key.doc_id();
    let capacity = ctx.config.broadcast_capacity;

    if let Some(store) = ctx.state_store.clone() {
        match blocking(move || store.load(doc_id)).await {
            Ok(Some(ops)) => {
                log::info!("Restored {} ops for {key}", ops.len());
                let doc = Document::from_operations(SiteId::ROOT, ops);
                return ChannelRoom::new(key.clone(), doc, guess_language(key), capacity);
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to load history for {key}: {e}"),
        }
    }

    let mut language = guess_language(key);
    let mut doc = None;
    if let Some(store) = ctx.content_store.clone() {
        let k = key.clone();
        match blocking(move || store.get_file_content(&k)).await {
            Ok(Some(content)) => {
                log::info!("Seeded {key} from file content ({} bytes)", content.content.len());
                language = content.language.or(language);
                doc = Some(Document::seeded(&content.content));
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to read file content for {key}: {e}"),
        }
    }
    let doc = doc.unwrap_or_else(|| Document::new(SiteId::ROOT));

    // Later ops reference the seed, so history must start with it.
    if let Some(store) = ctx.state_store.clone() {
        if !doc.history().is_empty() {
            let ops = doc.history().to_vec();
            if let Err(e) = blocking(move || store.save_snapshot(doc_id, &ops)).await {
                log::warn!("Failed to store seed for {key}: {e}");
            }
        }
    }

    ChannelRoom::new(key.clone(), doc, language, capacity)
}

async fn apply_op(ctx: &RelayContext, room: &Arc<ChannelRoom>, site: SiteId, op: Operation) {
    if op.site() != site {
        log::warn!("Dropping op {:?} on {} from {site}: foreign site", op.id, room.key);
        return;
    }

    let outcome = room.doc.write().await.apply_remote(op.clone());
    match outcome {
        ApplyOutcome::Duplicate => {
            log::trace!("Duplicate op {:?} on {}", op.id, room.key);
            return;
        }
        ApplyOutcome::Rejected(e) => {
            log::warn!("Dropping op on {} from {site}: {e}", room.key);
            return;
        }
        ApplyOutcome::Applied(_) | ApplyOutcome::Deferred => {}
    }

    let frame = Frame::new(room.key.clone(), site, Message::Op(op.clone()));
    if let Err(e) = room.broadcast.broadcast(site, &frame) {
        log::error!("Failed to relay op on {}: {e}", room.key);
    }

    if let Some(store) = ctx.state_store.clone() {
        let doc_id = room.key.doc_id();
        let result = blocking(move || {
            store.append_op(doc_id, &op)?;
            Ok(())
        })
        .await;
        match result {
            Ok(()) => {
                ctx.stats.write().await.persisted_ops += 1;
                if room.appended.fetch_add(1, Ordering::Relaxed) + 1 >= COMPACT_EVERY {
                    room.appended.store(0, Ordering::Relaxed);
                    if let Some(store) = ctx.state_store.clone() {
                        match blocking(move || store.compact(doc_id)).await {
                            Ok(n) => log::debug!("Compacted {n} ops for {}", room.key),
                            Err(e) => log::warn!("Failed to compact {}: {e}", room.key),
                        }
                    }
                }
            }
            Err(e) => report_save_failure(ctx, room, &e).await,
        }
    }

    match ctx.config.persist_policy {
        PersistPolicy::EveryChange => save_content(ctx, room).await,
        PersistPolicy::Debounced(_) => room.dirty.notify_one(),
        PersistPolicy::OnClose => {}
    }
}

/// Save once edits have been quiet for `delay`.
async fn debounced_persister(ctx: RelayContext, room: Arc<ChannelRoom>, delay: Duration) {
    loop {
        room.dirty.notified().await;
        while tokio::time::timeout(delay, room.dirty.notified()).await.is_ok() {}
        save_content(&ctx, &room).await;
    }
}

async fn save_content(ctx: &RelayContext, room: &ChannelRoom) {
    let Some(store) = ctx.content_store.clone() else {
        return;
    };
    let content = FileContent {
        content: room.doc.read().await.text(),
        language: room.language.clone(),
    };
    let key = room.key.clone();
    match blocking(move || store.save_file_content(&key, &content)).await {
        Ok(()) => {
            log::debug!("Saved content of {}", room.key);
            ctx.stats.write().await.content_saves += 1;
        }
        Err(e) => report_save_failure(ctx, room, &e).await,
    }
}

/// Log, count and tell the room. Collaboration carries on.
async fn report_save_failure(ctx: &RelayContext, room: &ChannelRoom, err: &StoreError) {
    log::warn!("Save failed for {}: {err}", room.key);
    ctx.stats.write().await.save_failures += 1;
    let warning = Frame::new(
        room.key.clone(),
        SiteId::ROOT,
        Message::Warning(format!("changes may not be saved: {err}")),
    );
    if let Err(e) = room.broadcast.broadcast(SiteId::ROOT, &warning) {
        log::error!("Failed to send save warning: {e}");
    }
}

/// Final snapshot and content save for a room with no peers left.
async fn close_room(ctx: &RelayContext, room: &ChannelRoom) {
    if let Some(store) = ctx.state_store.clone() {
        let ops = room.doc.read().await.ops_since(&StateVector::new());
        let doc_id = room.key.doc_id();
        match blocking(move || store.save_snapshot(doc_id, &ops)).await {
            Ok(()) => {
                ctx.stats.write().await.persisted_snapshots += 1;
                log::info!("Persisted snapshot for {} (room closing)", room.key);
            }
            Err(e) => log::error!("Failed to persist snapshot for {}: {e}", room.key),
        }
    }
    save_content(ctx, room).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryContentStore, MemoryStateStore};
    use codesync_core::TextDelta;

    fn key() -> ChannelKey {
        ChannelKey::new("room", "main.rs").unwrap()
    }

    /// Memory store whose snapshots take a while, like a slow disk.
    #[derive(Default)]
    struct SlowStore {
        inner: MemoryStateStore,
    }

    impl StateStore for SlowStore {
        fn save_snapshot(&self, doc_id: uuid::Uuid, ops: &[Operation]) -> Result<(), StoreError> {
            std::thread::sleep(Duration::from_millis(400));
            self.inner.save_snapshot(doc_id, ops)
        }

        fn load(&self, doc_id: uuid::Uuid) -> Result<Option<Vec<Operation>>, StoreError> {
            self.inner.load(doc_id)
        }

        fn append_op(&self, doc_id: uuid::Uuid, op: &Operation) -> Result<(), StoreError> {
            self.inner.append_op(doc_id, op)
        }

        fn compact(&self, doc_id: uuid::Uuid) -> Result<u64, StoreError> {
            self.inner.compact(doc_id)
        }
    }

    fn connection() -> (Connection, mpsc::UnboundedReceiver<Arc<Vec<u8>>>) {
        let (out, rx) = mpsc::unbounded_channel();
        let conn = Connection {
            addr: "127.0.0.1:1".parse().unwrap(),
            site: None,
            channels: HashMap::new(),
            out,
        };
        (conn, rx)
    }

    fn context(
        state: Option<Arc<dyn StateStore>>,
        content: Option<Arc<dyn FileContentService>>,
    ) -> RelayContext {
        let mut server = RelayServer::with_defaults();
        server.state_store = state;
        server.content_store = content;
        server.context()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_timeout_secs, 30);
        assert_eq!(config.persist_policy, PersistPolicy::Debounced(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.save_failures, 0);
        assert_eq!(server.room_count().await, 0);
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_open_room_empty() {
        let ctx = context(None, None);
        let room = open_room(&ctx, &key()).await;
        assert!(room.doc.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_open_room_seeds_from_content() {
        let content = Arc::new(MemoryContentStore::new());
        content.insert(key(), FileContent::new("fn main() {}"));
        let state = Arc::new(MemoryStateStore::new());
        let ctx = context(Some(state.clone()), Some(content));

        let room = open_room(&ctx, &key()).await;
        assert_eq!(room.doc.read().await.text(), "fn main() {}");

        // The seed went to the state store as well
        let stored = state.load(key().doc_id()).unwrap().unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_open_room_prefers_state_store() {
        let mut editor = Document::new(SiteId::random());
        let op = editor.apply_local(&TextDelta::insert(0, "from history")).unwrap().unwrap();

        let state = Arc::new(MemoryStateStore::new());
        state.append_op(key().doc_id(), &op).unwrap();
        let content = Arc::new(MemoryContentStore::new());
        content.insert(key(), FileContent::new("stale file"));

        let ctx = context(Some(state), Some(content));
        let room = open_room(&ctx, &key()).await;
        assert_eq!(room.doc.read().await.text(), "from history");
    }

    #[tokio::test]
    async fn test_apply_op_persists_and_skips_duplicates() {
        let state = Arc::new(MemoryStateStore::new());
        let content = Arc::new(MemoryContentStore::new());
        let mut ctx = context(Some(state.clone()), Some(content.clone()));
        ctx.config.persist_policy = PersistPolicy::EveryChange;

        let room = Arc::new(open_room(&ctx, &key()).await);
        let mut editor = Document::new(SiteId::random());
        let op = editor.apply_local(&TextDelta::insert(0, "hi")).unwrap().unwrap();

        apply_op(&ctx, &room, editor.site(), op.clone()).await;
        apply_op(&ctx, &room, editor.site(), op).await;

        assert_eq!(state.appended_len(key().doc_id()), 1);
        let saved = content.get_file_content(&key()).unwrap().unwrap();
        assert_eq!(saved.content, "hi");
        assert_eq!(saved.language.as_deref(), Some("rust"));
        assert_eq!(ctx.stats.read().await.content_saves, 1);
    }

    #[tokio::test]
    async fn test_close_room_snapshots() {
        let state = Arc::new(MemoryStateStore::new());
        let ctx = context(Some(state.clone()), None);
        let room = open_room(&ctx, &key()).await;

        let mut editor = Document::new(SiteId::random());
        for (i, ch) in "abc".chars().enumerate() {
            let op = editor.apply_local(&TextDelta::insert(i, ch.to_string())).unwrap().unwrap();
            room.doc.write().await.apply_remote(op);
        }

        close_room(&ctx, &room).await;
        let ops = state.load(key().doc_id()).unwrap().unwrap();
        assert_eq!(Document::from_operations(SiteId::random(), ops).text(), "abc");
        assert_eq!(state.appended_len(key().doc_id()), 0);
        assert_eq!(ctx.stats.read().await.persisted_snapshots, 1);
    }

    #[tokio::test]
    async fn test_slow_room_close_does_not_block_other_connections() {
        let ctx = context(Some(Arc::new(SlowStore::default())), None);

        let (mut bob, _bob_rx) = connection();
        join_channel(&ctx, &mut bob, key(), PeerInfo::new("Bob"), StateVector::new()).await;
        assert_eq!(ctx.rooms.read().await.len(), 1);

        let closing = {
            let ctx = ctx.clone();
            tokio::spawn(async move { close_connection(&ctx, &mut bob).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A connection with no channels goes away while the snapshot is written
        let (mut idle, _idle_rx) = connection();
        tokio::time::timeout(Duration::from_secs(5), close_connection(&ctx, &mut idle))
            .await
            .expect("idle connection closed while a room was persisting");
        tokio::time::timeout(Duration::from_secs(5), closing)
            .await
            .expect("room close finished")
            .unwrap();

        assert!(ctx.rooms.try_write().is_ok());
        assert!(ctx.stats.try_write().is_ok());
        assert_eq!(ctx.rooms.read().await.len(), 0);
        let stats = ctx.stats.read().await;
        assert_eq!(stats.persisted_snapshots, 1);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_rejoin_during_close_sees_persisted_history() {
        let ctx = context(Some(Arc::new(SlowStore::default())), None);

        let bob_peer = PeerInfo::new("Bob");
        let (mut bob, _bob_rx) = connection();
        join_channel(&ctx, &mut bob, key(), bob_peer.clone(), StateVector::new()).await;
        let room = bob.channels[&key()].room.clone();
        let mut editor = Document::new(bob_peer.site);
        let op = editor.apply_local(&TextDelta::insert(0, "kept")).unwrap().unwrap();
        apply_op(&ctx, &room, bob_peer.site, op).await;
        drop(room);

        let closing = {
            let ctx = ctx.clone();
            tokio::spawn(async move { close_connection(&ctx, &mut bob).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (mut carol, mut carol_rx) = connection();
        tokio::time::timeout(
            Duration::from_secs(5),
            join_channel(&ctx, &mut carol, key(), PeerInfo::new("Carol"), StateVector::new()),
        )
        .await
        .expect("join finished");
        closing.await.unwrap();

        let bytes = carol_rx.recv().await.unwrap();
        match Envelope::decode(&bytes).unwrap() {
            Envelope::Frame(Frame {
                message: Message::SyncResponse { ops, .. },
                ..
            }) => {
                assert_eq!(Document::from_operations(SiteId::random(), ops).text(), "kept");
            }
            other => panic!("expected sync response, got {other:?}"),
        }
        assert_eq!(ctx.rooms.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ops_under_another_site_are_dropped() {
        let state = Arc::new(MemoryStateStore::new());
        let ctx = context(Some(state.clone()), None);
        let room = Arc::new(open_room(&ctx, &key()).await);
        let mut rx = room.broadcast.add_peer(PeerInfo::new("watcher")).await;

        let mallory = SiteId::random();
        let mut victim = Document::new(SiteId::random());
        let forged = victim.apply_local(&TextDelta::insert(0, "forged")).unwrap().unwrap();
        apply_op(&ctx, &room, mallory, forged).await;

        assert!(room.doc.read().await.is_empty());
        assert_eq!(state.appended_len(key().doc_id()), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_out_of_range_clock_is_dropped() {
        let state = Arc::new(MemoryStateStore::new());
        let ctx = context(Some(state.clone()), None);
        let room = Arc::new(open_room(&ctx, &key()).await);
        let mut rx = room.broadcast.add_peer(PeerInfo::new("watcher")).await;

        let site = SiteId::random();
        let hostile = Operation {
            id: codesync_core::ElementId::new(u64::MAX, site),
            kind: codesync_core::OpKind::Insert {
                origin: None,
                text: "ab".into(),
            },
        };
        apply_op(&ctx, &room, site, hostile).await;

        assert!(room.doc.read().await.is_empty());
        assert_eq!(room.doc.read().await.state_vector().get(&site), 0);
        assert_eq!(state.appended_len(key().doc_id()), 0);
        assert!(rx.try_recv().is_err());

        // The room still takes well-formed edits from that site.
        let mut editor = Document::new(site);
        let op = editor.apply_local(&TextDelta::insert(0, "ok")).unwrap().unwrap();
        apply_op(&ctx, &room, site, op).await;
        assert_eq!(room.doc.read().await.text(), "ok");
    }

    #[tokio::test]
    async fn test_lagging_peer_gets_full_sync_response() {
        let mut ctx = context(None, None);
        ctx.config.broadcast_capacity = 2;
        let room = Arc::new(open_room(&ctx, &key()).await);
        let watcher = PeerInfo::new("watcher");
        let rx = room.broadcast.add_peer(watcher.clone()).await;

        let mut editor = Document::new(SiteId::random());
        for i in 0..5 {
            let op = editor.apply_local(&TextDelta::insert(i, "x")).unwrap().unwrap();
            apply_op(&ctx, &room, editor.site(), op).await;
        }

        let (out, mut out_rx) = mpsc::unbounded_channel();
        let forward = tokio::spawn(forward_channel(room.clone(), rx, watcher.site, out));
        let bytes = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        forward.abort();

        match Envelope::decode(&bytes).unwrap() {
            Envelope::Frame(Frame {
                message: Message::SyncResponse { ops, .. },
                ..
            }) => assert_eq!(ops.len(), 5),
            other => panic!("expected sync response, got {other:?}"),
        }
        assert_eq!(room.broadcast.stats().await.messages_dropped, 3);
    }

    #[tokio::test]
    async fn test_sync_response_excludes_requester() {
        let ctx = context(None, None);
        let room = open_room(&ctx, &key()).await;
        let me = PeerInfo::new("me");
        let other = PeerInfo::new("other");
        let _a = room.broadcast.add_peer(me.clone()).await;
        let _b = room.broadcast.add_peer(other.clone()).await;

        let frame = room.sync_response(&StateVector::new(), me.site).await;
        match frame.message {
            Message::SyncResponse { peers, ops, .. } => {
                assert_eq!(peers, vec![other]);
                assert!(ops.is_empty());
            }
            other => panic!("expected sync response, got {other:?}"),
        }
    }
}
