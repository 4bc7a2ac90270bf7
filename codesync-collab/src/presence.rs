//! Awareness: who is in a file, and where their cursors are.
//!
//! Presence is ephemeral. It is never persisted, and it is keyed per
//! channel, so a cursor in `room/a.rs` never shows up in `room/b.rs`.
//!
//! ## Architecture
//!
//! ```text
//! Local caret move
//!       │
//!       ▼
//! Awareness::update_cursor()        (rate-limited: 30fps)
//!       │
//!       ▼
//! AwarenessMessage::Update { clock, record }
//!       │
//!       ▼   (relay, sender stamped by the server)
//! Remote Awareness::apply_remote()  (last-write-wins per peer)
//!       │
//!       ▼
//! Awareness::cursors(&Document)     (anchors → visible indices)
//! ```
//!
//! Cursor positions travel as CRDT [`Anchor`]s, so they keep pointing at
//! the same character while other people type in front of them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use std::time::{Duration, Instant};
use uuid::Uuid;

use codesync_core::{Anchor, Document, Observers, SiteId, Subscription};

use crate::protocol::PeerInfo;

/// Minimum interval between throttled cursor broadcasts (30fps).
pub const CURSOR_INTERVAL: Duration = Duration::from_millis(33);

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Generate a stable, visually distinct color from a UUID.
    ///
    /// Uses HSL color space with high saturation for vivid cursors.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// `#rrggbb`, for editors that take CSS colors.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// A selection between two anchors. `head` is where the caret is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Anchor,
    pub head: Anchor,
}

/// What one peer publishes about itself in a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub name: String,
    pub color: CursorColor,
    pub cursor: Option<Anchor>,
    pub selection: Option<Selection>,
}

impl PresenceRecord {
    pub fn new(name: impl Into<String>, color: CursorColor) -> Self {
        Self {
            name: name.into(),
            color,
            cursor: None,
            selection: None,
        }
    }
}

impl From<&PeerInfo> for PresenceRecord {
    fn from(peer: &PeerInfo) -> Self {
        Self::new(peer.name.clone(), peer.color)
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire protocol messages
// ───────────────────────────────────────────────────────────────────

/// Carried in `Message::Presence`. The peer it is about is the frame's
/// (server-stamped) sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessMessage {
    /// Full current record. `clock` increases with every update a peer
    /// sends; older clocks are ignored.
    Update { clock: u64, record: PresenceRecord },
    /// Clean leave.
    Remove,
}

/// Change notifications from [`Awareness::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessChange {
    Joined(SiteId),
    Updated(SiteId),
    Left(SiteId),
    /// Connection lost; the record is kept but may be outdated.
    Stale(SiteId),
}

/// A remote peer's tracked state.
#[derive(Debug, Clone)]
pub struct PeerPresence {
    pub record: PresenceRecord,
    clock: u64,
    last_seen: Instant,
    pub stale: bool,
}

impl PeerPresence {
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

/// A remote cursor resolved against the current document, ready to draw.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCursor {
    pub site: SiteId,
    pub name: String,
    pub color: CursorColor,
    pub position: Option<usize>,
    pub selection: Option<Range<usize>>,
    pub stale: bool,
}

// ───────────────────────────────────────────────────────────────────
// Awareness tracker
// ───────────────────────────────────────────────────────────────────

/// Presence state of one channel.
pub struct Awareness {
    local_site: SiteId,
    local: PresenceRecord,
    /// Clock of the last local message.
    clock: u64,
    peers: HashMap<SiteId, PeerPresence>,
    last_broadcast: Option<Instant>,
    cursor_interval: Duration,
    observers: Observers<AwarenessChange>,
}

impl Awareness {
    pub fn new(local: &PeerInfo) -> Self {
        Self::with_interval(local, CURSOR_INTERVAL)
    }

    /// Create with a custom cursor broadcast interval.
    pub fn with_interval(local: &PeerInfo, interval: Duration) -> Self {
        Self {
            local_site: local.site,
            local: PresenceRecord::from(local),
            clock: 0,
            peers: HashMap::new(),
            last_broadcast: None,
            cursor_interval: interval,
            observers: Observers::new(),
        }
    }

    pub fn local_site(&self) -> SiteId {
        self.local_site
    }

    pub fn local(&self) -> &PresenceRecord {
        &self.local
    }

    /// Replace the local record. Always broadcast immediately.
    pub fn set_local(&mut self, record: PresenceRecord) -> AwarenessMessage {
        self.local = record;
        self.force_broadcast()
    }

    /// Move the local caret. Returns `None` when throttled; the position
    /// is still recorded and goes out with the next broadcast.
    pub fn update_cursor(
        &mut self,
        cursor: Option<Anchor>,
        selection: Option<Selection>,
    ) -> Option<AwarenessMessage> {
        self.local.cursor = cursor;
        self.local.selection = selection;

        if let Some(last) = self.last_broadcast {
            if last.elapsed() < self.cursor_interval {
                return None;
            }
        }
        Some(self.force_broadcast())
    }

    /// The current local record, regardless of rate limiting.
    pub fn force_broadcast(&mut self) -> AwarenessMessage {
        self.clock += 1;
        self.last_broadcast = Some(Instant::now());
        AwarenessMessage::Update {
            clock: self.clock,
            record: self.local.clone(),
        }
    }

    /// Re-send the current record when nothing went out for `interval`,
    /// so peers keep this site alive past their idle timeout.
    pub fn heartbeat(&mut self, now: Instant, interval: Duration) -> Option<AwarenessMessage> {
        if let Some(last) = self.last_broadcast {
            if now.saturating_duration_since(last) < interval {
                return None;
            }
        }
        let msg = self.force_broadcast();
        self.last_broadcast = self.last_broadcast.max(Some(now));
        Some(msg)
    }

    /// Apply a message about `sender`. Returns the resulting change, if any.
    pub fn apply_remote(&mut self, sender: SiteId, msg: &AwarenessMessage) -> Option<AwarenessChange> {
        if sender == self.local_site {
            return None;
        }

        let change = match msg {
            AwarenessMessage::Update { clock, record } => match self.peers.get_mut(&sender) {
                Some(peer) if peer.clock >= *clock => {
                    // Older or replayed; still proves the peer is alive.
                    peer.last_seen = Instant::now();
                    return None;
                }
                Some(peer) if !peer.stale && peer.record == *record => {
                    // Heartbeat: nothing to redraw.
                    peer.clock = *clock;
                    peer.last_seen = Instant::now();
                    return None;
                }
                Some(peer) => {
                    peer.record = record.clone();
                    peer.clock = *clock;
                    peer.last_seen = Instant::now();
                    peer.stale = false;
                    AwarenessChange::Updated(sender)
                }
                None => {
                    self.peers.insert(
                        sender,
                        PeerPresence {
                            record: record.clone(),
                            clock: *clock,
                            last_seen: Instant::now(),
                            stale: false,
                        },
                    );
                    AwarenessChange::Joined(sender)
                }
            },
            AwarenessMessage::Remove => {
                self.peers.remove(&sender)?;
                AwarenessChange::Left(sender)
            }
        };

        self.observers.emit(&change);
        Some(change)
    }

    /// Drop a peer the relay reported gone.
    pub fn peer_left(&mut self, site: SiteId) -> bool {
        if self.peers.remove(&site).is_some() {
            self.observers.emit(&AwarenessChange::Left(site));
            true
        } else {
            false
        }
    }

    /// Keep only the listed peers (authoritative list after a resync).
    pub fn retain_peers(&mut self, present: &[SiteId]) -> Vec<SiteId> {
        let gone: Vec<SiteId> = self
            .peers
            .keys()
            .filter(|site| !present.contains(site))
            .copied()
            .collect();
        for site in &gone {
            self.peer_left(*site);
        }
        gone
    }

    /// Flag every remote record as outdated (transport lost).
    pub fn mark_all_stale(&mut self) {
        let mut changed = Vec::new();
        for (site, peer) in self.peers.iter_mut() {
            if !peer.stale {
                peer.stale = true;
                changed.push(*site);
            }
        }
        for site in changed {
            self.observers.emit(&AwarenessChange::Stale(site));
        }
    }

    /// Remove peers not heard from within `timeout` as of `now`.
    pub fn evict_idle(&mut self, now: Instant, timeout: Duration) -> Vec<SiteId> {
        let idle: Vec<SiteId> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|(site, _)| *site)
            .collect();
        for site in &idle {
            log::debug!("presence of {site} timed out");
            self.peer_left(*site);
        }
        idle
    }

    pub fn states(&self) -> impl Iterator<Item = (&SiteId, &PeerPresence)> {
        self.peers.iter()
    }

    pub fn peer(&self, site: &SiteId) -> Option<&PeerPresence> {
        self.peers.get(site)
    }

    /// Number of remote peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Remote cursors with anchors resolved against `doc`, sorted by site.
    pub fn cursors(&self, doc: &Document) -> Vec<ResolvedCursor> {
        let mut cursors: Vec<ResolvedCursor> = self
            .peers
            .iter()
            .map(|(site, peer)| ResolvedCursor {
                site: *site,
                name: peer.record.name.clone(),
                color: peer.record.color,
                position: peer.record.cursor.map(|a| doc.resolve_anchor(&a)),
                selection: peer.record.selection.map(|s| {
                    let a = doc.resolve_anchor(&s.anchor);
                    let b = doc.resolve_anchor(&s.head);
                    a.min(b)..a.max(b)
                }),
                stale: peer.stale,
            })
            .collect();
        cursors.sort_by_key(|c| c.site);
        cursors
    }

    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(&AwarenessChange) + Send + 'static,
    {
        self.observers.subscribe(listener)
    }
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("local_site", &self.local_site)
            .field("clock", &self.clock)
            .field("peers", &self.peers.len())
            .finish()
    }
}

// ===================================================================
// Tests
// ===================================================================
