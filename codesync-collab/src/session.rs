//! Session multiplexer: every channel a client has open, over one relay
//! connection.
//!
//! ```text
//!  Pane(main.rs) ──┐                          ┌── Document + Awareness (room/main.rs)
//!  Pane(main.rs) ──┼── SessionMux ── frames ──┤
//!  Pane(lib.rs)  ──┘        │                 └── Document + Awareness (room/lib.rs)
//!                           ▼
//!                      RelayClient (one socket)
//! ```
//!
//! Two panes on the same file share one `Document`. A channel stays open
//! while any `ChannelHandle` or `Pane` for it is alive; once the last one
//! is dropped it lingers for `grace_period` and is then torn down.
//!
//! After every (re)connect each channel resynchronizes: `Join` with the
//! local state vector, apply the `SyncResponse`, replay queued offline ops
//! and send any own op the relay still lacks.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

use codesync_core::{
    ApplyOutcome, Binding, Document, EditorWidget, Operation, OperationSink, SharedDocument,
};

use crate::client::{ConnectionState, FrameSender, RelayClient, TransportEvent};
use crate::presence::{
    Awareness, AwarenessMessage, PresenceRecord, ResolvedCursor, Selection, CURSOR_INTERVAL,
};
use crate::protocol::{ChannelKey, Frame, KeyError, Message, PeerInfo};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid channel key: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("channel {0} is not open")]
    UnknownChannel(ChannelKey),
}

/// What the application hears about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connection(ConnectionState),
    /// The channel caught up with the relay.
    Synced(ChannelKey),
    /// Non-fatal relay condition, e.g. a failed save.
    Warning { key: ChannelKey, message: String },
    /// The relay refused or failed this channel.
    ChannelError { key: ChannelKey, message: String },
    PresenceChanged(ChannelKey),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a channel without handles stays open.
    pub grace_period: Duration,
    /// Remote presence not refreshed for this long is dropped.
    pub presence_timeout: Duration,
    /// Local presence is re-sent at least this often while synced. Keep
    /// it well below `presence_timeout`.
    pub presence_heartbeat: Duration,
    /// Minimum spacing of cursor broadcasts.
    pub cursor_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            presence_timeout: Duration::from_secs(30),
            presence_heartbeat: Duration::from_secs(10),
            cursor_interval: CURSOR_INTERVAL,
        }
    }
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ───────────────────────────────────────────────────────────────────
// Leases
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct LeaseState {
    count: usize,
    idle_since: Option<Instant>,
}

/// Keeps a channel open while alive.
struct Lease(Arc<Mutex<LeaseState>>);

impl Lease {
    fn acquire(state: &Arc<Mutex<LeaseState>>) -> Self {
        let mut s = lock(state);
        s.count += 1;
        s.idle_since = None;
        Lease(state.clone())
    }
}

impl Clone for Lease {
    fn clone(&self) -> Self {
        Lease::acquire(&self.0)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut s = lock(&self.0);
        s.count = s.count.saturating_sub(1);
        if s.count == 0 {
            s.idle_since = Some(Instant::now());
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Handles
// ───────────────────────────────────────────────────────────────────

/// Sends a channel's local operations. Used as the binding's sink.
///
/// Until the channel has resynchronized, operations go to the offline
/// queue so they reach the relay after the `Join`.
#[derive(Clone)]
pub struct ChannelSender {
    key: ChannelKey,
    sender: FrameSender,
    synced: Arc<AtomicBool>,
}

impl ChannelSender {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }
}

impl OperationSink for ChannelSender {
    fn send(&self, op: Operation) {
        let frame = Frame::op(self.key.clone(), op);
        if self.synced.load(Ordering::SeqCst) {
            self.sender.send(frame);
        } else if !self.sender.queue_offline(frame) {
            log::warn!("Offline queue full for {}, op will be recovered on resync", self.key);
        }
    }
}

/// Access to one open channel. Holding it keeps the channel open.
#[derive(Clone)]
pub struct ChannelHandle {
    key: ChannelKey,
    doc: SharedDocument,
    awareness: Arc<Mutex<Awareness>>,
    sender: ChannelSender,
    _lease: Lease,
}

impl ChannelHandle {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn document(&self) -> &SharedDocument {
        &self.doc
    }

    pub fn text(&self) -> String {
        lock(&self.doc).text()
    }

    /// The sink for local operations of this channel.
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn is_synced(&self) -> bool {
        self.sender.synced.load(Ordering::SeqCst)
    }

    /// Remote cursors resolved against the current text.
    pub fn cursors(&self) -> Vec<ResolvedCursor> {
        let doc = lock(&self.doc);
        lock(&self.awareness).cursors(&doc)
    }

    pub fn awareness(&self) -> &Arc<Mutex<Awareness>> {
        &self.awareness
    }
}

/// An editor pane bound to a channel.
pub struct Pane<W: EditorWidget + 'static> {
    binding: Binding<W>,
    handle: ChannelHandle,
}

impl<W: EditorWidget + 'static> Pane<W> {
    pub fn binding(&self) -> &Binding<W> {
        &self.binding
    }

    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    pub fn key(&self) -> &ChannelKey {
        &self.handle.key
    }
}

// ───────────────────────────────────────────────────────────────────
// Multiplexer
// ───────────────────────────────────────────────────────────────────

struct ChannelEntry {
    doc: SharedDocument,
    awareness: Arc<Mutex<Awareness>>,
    leases: Arc<Mutex<LeaseState>>,
    synced: Arc<AtomicBool>,
}

/// All channels of one client session.
pub struct SessionMux {
    local: PeerInfo,
    client: RelayClient,
    sender: FrameSender,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    config: SessionConfig,
    channels: HashMap<ChannelKey, ChannelEntry>,
}

impl SessionMux {
    pub fn new(local: PeerInfo, mut client: RelayClient, config: SessionConfig) -> Self {
        let events = client.take_event_rx();
        if events.is_none() {
            log::warn!("Transport events already taken; call handle_event yourself");
        }
        let sender = client.sender();
        Self {
            local,
            client,
            sender,
            events,
            config,
            channels: HashMap::new(),
        }
    }

    pub fn local(&self) -> &PeerInfo {
        &self.local
    }

    pub fn client(&self) -> &RelayClient {
        &self.client
    }

    /// Connect, or reconnect after [`SessionMux::disconnect`].
    pub fn start(&mut self) {
        self.client.start();
    }

    /// Work offline. Edits keep applying locally and queue.
    pub fn disconnect(&mut self) {
        self.client.disconnect();
    }

    pub fn channel_keys(&self) -> Vec<ChannelKey> {
        self.channels.keys().cloned().collect()
    }

    pub fn is_open(&self, key: &ChannelKey) -> bool {
        self.channels.contains_key(key)
    }

    /// Open `(room, file)` or return another handle to it.
    pub fn get_or_create_channel(&mut self, room: &str, file: &str) -> Result<ChannelHandle, SessionError> {
        let key = ChannelKey::new(room, file)?;

        if !self.channels.contains_key(&key) {
            let entry = ChannelEntry {
                doc: Arc::new(Mutex::new(Document::new(self.local.site))),
                awareness: Arc::new(Mutex::new(Awareness::with_interval(
                    &self.local,
                    self.config.cursor_interval,
                ))),
                leases: Arc::new(Mutex::new(LeaseState::default())),
                synced: Arc::new(AtomicBool::new(false)),
            };
            log::info!("Opened channel {key}");
            if self.client.is_connected() {
                self.join(&key, &entry);
            }
            self.channels.insert(key.clone(), entry);
        }

        self.handle(&key)
    }

    /// Open a channel and bind `widget` to its document.
    pub fn open_pane<W: EditorWidget + 'static>(
        &mut self,
        room: &str,
        file: &str,
        widget: Arc<Mutex<W>>,
    ) -> Result<Pane<W>, SessionError> {
        let handle = self.get_or_create_channel(room, file)?;
        let sink: Arc<dyn OperationSink> = Arc::new(handle.sender());
        let binding = Binding::bind(handle.doc.clone(), widget, sink);
        Ok(Pane { binding, handle })
    }

    /// Another handle to an open channel.
    pub fn handle(&self, key: &ChannelKey) -> Result<ChannelHandle, SessionError> {
        let entry = self
            .channels
            .get(key)
            .ok_or_else(|| SessionError::UnknownChannel(key.clone()))?;
        Ok(ChannelHandle {
            key: key.clone(),
            doc: entry.doc.clone(),
            awareness: entry.awareness.clone(),
            sender: ChannelSender {
                key: key.clone(),
                sender: self.sender.clone(),
                synced: entry.synced.clone(),
            },
            _lease: Lease::acquire(&entry.leases),
        })
    }

    /// Publish the local presence record on `key`.
    pub fn set_presence(&mut self, key: &ChannelKey, record: PresenceRecord) -> Result<(), SessionError> {
        let entry = self
            .channels
            .get(key)
            .ok_or_else(|| SessionError::UnknownChannel(key.clone()))?;
        let msg = lock(&entry.awareness).set_local(record);
        self.send_presence(key, msg);
        Ok(())
    }

    /// Move the local caret on `key`. Throttled.
    pub fn set_cursor(
        &mut self,
        key: &ChannelKey,
        cursor: Option<usize>,
        selection: Option<Range<usize>>,
    ) -> Result<(), SessionError> {
        let entry = self
            .channels
            .get(key)
            .ok_or_else(|| SessionError::UnknownChannel(key.clone()))?;
        let (cursor, selection) = {
            let doc = lock(&entry.doc);
            (
                cursor.map(|i| doc.anchor_at(i)),
                selection.map(|r| Selection {
                    anchor: doc.anchor_at(r.start),
                    head: doc.anchor_at(r.end),
                }),
            )
        };
        let msg = lock(&entry.awareness).update_cursor(cursor, selection);
        if let Some(msg) = msg {
            self.send_presence(key, msg);
        }
        Ok(())
    }

    /// Wait for the next transport event and process it.
    ///
    /// Returns `None` once the transport is gone.
    pub async fn next_event(&mut self) -> Option<Vec<SessionEvent>> {
        let event = self.events.as_mut()?.recv().await?;
        Some(self.handle_event(event))
    }

    /// Route one transport event.
    pub fn handle_event(&mut self, event: TransportEvent) -> Vec<SessionEvent> {
        match event {
            TransportEvent::Connected => {
                let keys: Vec<ChannelKey> = self.channels.keys().cloned().collect();
                for key in keys {
                    if let Some(entry) = self.channels.get(&key) {
                        entry.synced.store(false, Ordering::SeqCst);
                        self.join(&key, entry);
                    }
                }
                vec![SessionEvent::Connection(ConnectionState::Connected)]
            }
            TransportEvent::Disconnected => {
                let mut events = vec![SessionEvent::Connection(self.client.state())];
                for (key, entry) in &self.channels {
                    entry.synced.store(false, Ordering::SeqCst);
                    let mut awareness = lock(&entry.awareness);
                    if awareness.peer_count() > 0 {
                        awareness.mark_all_stale();
                        events.push(SessionEvent::PresenceChanged(key.clone()));
                    }
                }
                events
            }
            TransportEvent::Frame(frame) => self.handle_frame(frame),
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Vec<SessionEvent> {
        let Frame { channel, sender, message } = frame;
        let Some(entry) = self.channels.get(&channel) else {
            log::debug!("{} for closed channel {channel}", message.kind());
            return Vec::new();
        };
        log::trace!("{} from {sender} on {channel}", message.kind());

        match message {
            Message::SyncResponse { ops, state_vector, peers } => {
                let local = self.local.site;
                let missing = {
                    let mut doc = lock(&entry.doc);
                    for op in ops {
                        doc.apply_remote(op);
                    }
                    doc.ops_since(&state_vector)
                };

                // Own ops the relay lacks, queued or lost in flight, go out
                // oldest first: the relay's state vector is a per-site
                // maximum and must never skip a clock.
                let queued = self.client.drain_offline(&channel);
                let queued_len = queued.len();
                let mut outgoing: Vec<Operation> = missing
                    .into_iter()
                    .filter(|op| op.site() == local)
                    .collect();
                let mut seen: HashSet<_> = outgoing.iter().map(|op| op.id).collect();
                for frame in queued {
                    if let Message::Op(op) = frame.message {
                        if !state_vector.covers(&op.id) && seen.insert(op.id) {
                            outgoing.push(op);
                        }
                    }
                }
                outgoing.sort_by_key(|op| op.id.clock);
                let resent = outgoing.len();
                for op in outgoing {
                    self.sender.send(Frame::op(channel.clone(), op));
                }
                entry.synced.store(true, Ordering::SeqCst);
                log::info!("Synced {channel} (sent {resent}, {queued_len} were queued)");

                let mut events = vec![SessionEvent::Synced(channel.clone())];
                let presence = {
                    let mut awareness = lock(&entry.awareness);
                    let sites: Vec<_> = peers.iter().map(|p| p.site).collect();
                    let mut changed = !awareness.retain_peers(&sites).is_empty();
                    for peer in &peers {
                        changed |= awareness.apply_remote(peer.site, &introduce(peer)).is_some();
                    }
                    if changed {
                        events.push(SessionEvent::PresenceChanged(channel.clone()));
                    }
                    awareness.force_broadcast()
                };
                self.send_presence(&channel, presence);
                events
            }
            Message::Op(op) => {
                let outcome = lock(&entry.doc).apply_remote(op);
                if let ApplyOutcome::Deferred = outcome {
                    log::debug!("Deferred op on {channel}");
                }
                Vec::new()
            }
            Message::Presence(msg) => {
                let change = lock(&entry.awareness).apply_remote(sender, &msg);
                change
                    .map(|_| vec![SessionEvent::PresenceChanged(channel)])
                    .unwrap_or_default()
            }
            Message::PeerJoined(peer) => {
                let change = lock(&entry.awareness).apply_remote(peer.site, &introduce(&peer));
                change
                    .map(|_| vec![SessionEvent::PresenceChanged(channel)])
                    .unwrap_or_default()
            }
            Message::PeerLeft(site) => {
                if lock(&entry.awareness).peer_left(site) {
                    vec![SessionEvent::PresenceChanged(channel)]
                } else {
                    Vec::new()
                }
            }
            Message::Warning(message) => {
                log::warn!("Relay warning on {channel}: {message}");
                vec![SessionEvent::Warning { key: channel, message }]
            }
            Message::Error(message) => {
                log::warn!("Relay error on {channel}: {message}");
                entry.synced.store(false, Ordering::SeqCst);
                vec![SessionEvent::ChannelError { key: channel, message }]
            }
            other => {
                log::debug!("Ignoring relay-bound {} on {channel}", other.kind());
                Vec::new()
            }
        }
    }

    /// Periodic housekeeping: idle channels, presence heartbeats and
    /// silent peers. Call more often than `presence_heartbeat`.
    pub fn tick(&mut self, now: Instant) -> Vec<SessionEvent> {
        self.evict_idle(now);
        let mut events = Vec::new();
        let mut heartbeats = Vec::new();
        for (key, entry) in &self.channels {
            let mut awareness = lock(&entry.awareness);
            if entry.synced.load(Ordering::SeqCst) {
                if let Some(msg) = awareness.heartbeat(now, self.config.presence_heartbeat) {
                    heartbeats.push((key.clone(), msg));
                }
            }
            let gone = awareness.evict_idle(now, self.config.presence_timeout);
            if !gone.is_empty() {
                events.push(SessionEvent::PresenceChanged(key.clone()));
            }
        }
        for (key, msg) in heartbeats {
            self.send_presence(&key, msg);
        }
        events
    }

    /// Close channels that have had no handles for `grace_period`.
    /// Returns the closed keys.
    pub fn evict_idle(&mut self, now: Instant) -> Vec<ChannelKey> {
        let grace = self.config.grace_period;
        let idle: Vec<ChannelKey> = self
            .channels
            .iter()
            .filter(|(_, entry)| {
                let leases = lock(&entry.leases);
                leases.count == 0
                    && leases
                        .idle_since
                        .is_some_and(|since| now.saturating_duration_since(since) >= grace)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &idle {
            self.channels.remove(key);
            self.sender.send(Frame::new(key.clone(), self.local.site, Message::Leave));
            // Queued ops of a closed channel have nowhere to go.
            let dropped = self.client.drain_offline(key).len();
            if dropped > 0 {
                log::warn!("Closed {key} with {dropped} unsent ops");
            } else {
                log::info!("Closed idle channel {key}");
            }
        }
        idle
    }

    fn join(&self, key: &ChannelKey, entry: &ChannelEntry) {
        let state_vector = lock(&entry.doc).state_vector().clone();
        log::debug!("Joining {key}");
        self.sender.send(Frame::join(key.clone(), self.local.clone(), state_vector));
    }

    fn send_presence(&self, key: &ChannelKey, msg: AwarenessMessage) {
        self.sender
            .send(Frame::new(key.clone(), self.local.site, Message::Presence(msg)));
    }
}

/// Placeholder presence for a peer known only from its `PeerInfo`.
/// Clock 0 loses to anything the peer publishes itself.
fn introduce(peer: &PeerInfo) -> AwarenessMessage {
    AwarenessMessage::Update {
        clock: 0,
        record: PresenceRecord::from(peer),
    }
}
