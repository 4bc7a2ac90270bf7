//! Replicated text document: an RGA (Replicated Growable Array).
//!
//! ## Model
//!
//! ```text
//!  elements:  [h:(1,A)] [e:(2,A)] [x:(3,B)†] [y:(4,A)] ...
//!                 ▲                    ▲
//!                 │                    └── tombstone (kept so anchors resolve)
//!                 └── ElementId = (lamport clock, site)
//! ```
//!
//! Every character carries a globally unique [`ElementId`]. An insert names
//! the element it goes after (its *origin*); concurrent inserts after the
//! same origin are ordered by descending `ElementId`, which every replica
//! computes identically. Deletes only set a tombstone flag, so position
//! references never dangle.
//!
//! Operations whose origin or delete targets have not arrived yet are
//! buffered and retried whenever new elements integrate. Nothing is dropped.
//!
//! Reference: Roh et al., "Replicated abstract data types" (2011)

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::delta::TextDelta;
use crate::observe::{Observers, Subscription};

/// Highest clock a received operation may reach. The headroom above it
/// keeps local clock increments from wrapping.
pub const MAX_CLOCK: u64 = u64::MAX >> 1;

// ───────────────────────────────────────────────────────────────────
// Identifiers
// ───────────────────────────────────────────────────────────────────

/// Identifier of one replica (editor session) in a document's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiteId(pub Uuid);

impl SiteId {
    /// Reserved site for content seeded from the file store.
    pub const ROOT: SiteId = SiteId(Uuid::nil());

    pub fn random() -> Self {
        SiteId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is enough for logs.
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// Identity of a single character. Ordered by `(clock, site)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId {
    pub clock: u64,
    pub site: SiteId,
}

impl ElementId {
    pub fn new(clock: u64, site: SiteId) -> Self {
        Self { clock, site }
    }

    fn offset(self, n: u64) -> Self {
        Self {
            clock: self.clock + n,
            site: self.site,
        }
    }
}

/// Highest operation clock received from each site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<SiteId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, site: &SiteId) -> u64 {
        self.0.get(site).copied().unwrap_or(0)
    }

    /// Record that everything from `site` up to `clock` has been received.
    pub fn observe(&mut self, site: SiteId, clock: u64) {
        let entry = self.0.entry(site).or_insert(0);
        if clock > *entry {
            *entry = clock;
        }
    }

    /// Whether an operation with this id is already covered.
    pub fn covers(&self, id: &ElementId) -> bool {
        id.clock <= self.get(&id.site)
    }

    pub fn sites(&self) -> impl Iterator<Item = (&SiteId, &u64)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Operations
// ───────────────────────────────────────────────────────────────────

/// An immutable, uniquely identified edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: ElementId,
    pub kind: OpKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Characters of `text` get ids `id.clock + i`; the first goes after
    /// `origin` (document start when `None`), the rest follow in order.
    Insert {
        origin: Option<ElementId>,
        text: String,
    },
    /// Tombstone each target.
    Delete { targets: Vec<ElementId> },
}

impl Operation {
    /// Last Lamport clock value consumed by this operation.
    pub fn last_clock(&self) -> u64 {
        self.checked_last_clock().unwrap_or(u64::MAX)
    }

    fn checked_last_clock(&self) -> Option<u64> {
        match &self.kind {
            OpKind::Insert { text, .. } => {
                let extra = (text.chars().count() as u64).saturating_sub(1);
                self.id.clock.checked_add(extra)
            }
            OpKind::Delete { .. } => Some(self.id.clock),
        }
    }

    /// Check the clock range of an operation received from elsewhere.
    /// Clocks start at 1 and stay within [`MAX_CLOCK`].
    pub fn validate(&self) -> Result<(), CrdtError> {
        match self.checked_last_clock() {
            Some(last) if self.id.clock > 0 && last <= MAX_CLOCK => Ok(()),
            _ => Err(CrdtError::ClockOutOfRange {
                clock: self.id.clock,
                site: self.id.site,
            }),
        }
    }

    pub fn site(&self) -> SiteId {
        self.id.site
    }

    /// Element ids this operation needs before it can be applied.
    fn dependencies(&self) -> Vec<ElementId> {
        match &self.kind {
            OpKind::Insert { origin, .. } => origin.iter().copied().collect(),
            OpKind::Delete { targets } => targets.clone(),
        }
    }
}

/// Result of [`Document::apply_remote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied; the deltas describe the visible change (including any
    /// buffered operations this one released).
    Applied(Vec<TextDelta>),
    /// Already received; nothing changed.
    Duplicate,
    /// Waiting for causal dependencies; buffered.
    Deferred,
    /// Malformed; nothing changed.
    Rejected(CrdtError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrdtError {
    #[error("position {index} out of bounds (document length {len})")]
    OutOfBounds { index: usize, len: usize },
    #[error("operation clock {clock} from {site} is out of range")]
    ClockOutOfRange { clock: u64, site: SiteId },
}

/// A position that follows concurrent edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anchor {
    /// Before the first character.
    Start,
    /// Immediately after the given element.
    After(ElementId),
}

/// Point-in-time view of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub text: String,
    pub state_vector: StateVector,
}

// ───────────────────────────────────────────────────────────────────
// Document
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Element {
    id: ElementId,
    ch: char,
    deleted: bool,
}

/// One replicated text buffer.
pub struct Document {
    site: SiteId,
    /// Lamport clock: highest clock seen or generated.
    clock: u64,
    elements: Vec<Element>,
    /// Ids of every integrated element (tombstones included).
    known: HashSet<ElementId>,
    /// Ids of every received operation, applied or buffered.
    received: HashSet<ElementId>,
    state_vector: StateVector,
    /// Operations in application order.
    history: Vec<Operation>,
    pending: Vec<Operation>,
    visible_len: usize,
    observers: Observers<[TextDelta]>,
}

impl Document {
    /// Create an empty document owned by `site`.
    pub fn new(site: SiteId) -> Self {
        Self {
            site,
            clock: 0,
            elements: Vec::new(),
            known: HashSet::new(),
            received: HashSet::new(),
            state_vector: StateVector::new(),
            history: Vec::new(),
            pending: Vec::new(),
            visible_len: 0,
            observers: Observers::new(),
        }
    }

    /// Create a document whose initial content is attributed to
    /// [`SiteId::ROOT`]. Seeding the same text always yields the same ids.
    pub fn seeded(text: &str) -> Self {
        let mut doc = Self::new(SiteId::ROOT);
        if !text.is_empty() {
            let op = doc.generate_insert(None, text);
            doc.integrate(&op);
        }
        doc
    }

    /// Rebuild a replica for `site` from a persisted operation history.
    pub fn from_operations(site: SiteId, ops: impl IntoIterator<Item = Operation>) -> Self {
        let mut doc = Self::new(site);
        for op in ops {
            doc.apply_remote(op);
        }
        doc
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    /// Visible text.
    pub fn text(&self) -> String {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.ch)
            .collect()
    }

    /// Visible length in chars.
    pub fn len(&self) -> usize {
        self.visible_len
    }

    pub fn is_empty(&self) -> bool {
        self.visible_len == 0
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            text: self.text(),
            state_vector: self.state_vector.clone(),
        }
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Operations in the order they were applied.
    pub fn history(&self) -> &[Operation] {
        &self.history
    }

    /// Number of operations waiting for dependencies.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Operations received here that `remote` has not seen, in an order
    /// that satisfies causal dependencies (buffered ones last).
    pub fn ops_since(&self, remote: &StateVector) -> Vec<Operation> {
        self.history
            .iter()
            .chain(self.pending.iter())
            .filter(|op| !remote.covers(&op.id))
            .cloned()
            .collect()
    }

    /// Subscribe to visible changes caused by remote operations and by
    /// other views announced through [`Document::notify`].
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(&[TextDelta]) + Send + 'static,
    {
        self.observers.subscribe(listener)
    }

    /// Announce deltas of a local edit so other views of this document
    /// follow it.
    pub fn notify(&self, deltas: &[TextDelta]) {
        if !deltas.is_empty() {
            self.observers.emit(deltas);
        }
    }

    // ─── Local edits ──────────────────────────────────────────────

    /// Apply an editor delta made on this replica and return the operation
    /// to broadcast. `Ok(None)` for no-op deltas.
    pub fn apply_local(&mut self, delta: &TextDelta) -> Result<Option<Operation>, CrdtError> {
        match delta {
            TextDelta::Insert { index, text } => {
                if *index > self.visible_len {
                    return Err(CrdtError::OutOfBounds {
                        index: *index,
                        len: self.visible_len,
                    });
                }
                if text.is_empty() {
                    return Ok(None);
                }
                let origin = if *index == 0 {
                    None
                } else {
                    self.visible_position(index - 1).map(|pos| self.elements[pos].id)
                };
                Ok(Some(self.insert_after(origin, text)))
            }
            TextDelta::Delete { index, len } => {
                let end = index + len;
                if end > self.visible_len {
                    return Err(CrdtError::OutOfBounds {
                        index: end,
                        len: self.visible_len,
                    });
                }
                if *len == 0 {
                    return Ok(None);
                }
                let targets = self.element_ids(*index..end);
                Ok(self.delete_elements(&targets))
            }
        }
    }

    /// Insert `text` immediately after `origin` as a local operation.
    pub fn insert_after(&mut self, origin: Option<ElementId>, text: &str) -> Operation {
        let op = self.generate_insert(origin, text);
        self.integrate(&op);
        log::trace!("local insert {:?} ({} chars)", op.id, text.chars().count());
        op
    }

    /// Tombstone `targets` as a local operation. Returns `None` when every
    /// target is unknown or already deleted.
    pub fn delete_elements(&mut self, targets: &[ElementId]) -> Option<Operation> {
        let live = self.visible_ids(targets);
        if live.is_empty() {
            return None;
        }
        self.clock += 1;
        let op = Operation {
            id: ElementId::new(self.clock, self.site),
            kind: OpKind::Delete { targets: live },
        };
        self.integrate(&op);
        log::trace!("local delete {:?}", op.id);
        Some(op)
    }

    fn generate_insert(&mut self, origin: Option<ElementId>, text: &str) -> Operation {
        let id = ElementId::new(self.clock + 1, self.site);
        self.clock += text.chars().count() as u64;
        Operation {
            id,
            kind: OpKind::Insert {
                origin,
                text: text.to_string(),
            },
        }
    }

    // ─── Remote operations ────────────────────────────────────────

    /// Apply an operation from another replica.
    ///
    /// Listeners registered with [`Document::subscribe`] receive the
    /// resulting deltas before this returns.
    pub fn apply_remote(&mut self, op: Operation) -> ApplyOutcome {
        if let Err(e) = op.validate() {
            log::warn!("rejecting {:?}: {e}", op.id);
            return ApplyOutcome::Rejected(e);
        }
        if self.received.contains(&op.id) {
            return ApplyOutcome::Duplicate;
        }
        self.received.insert(op.id);
        self.state_vector.observe(op.id.site, op.last_clock());
        self.clock = self.clock.max(op.last_clock());

        if !self.is_ready(&op) {
            log::debug!("deferring {:?}: dependencies not yet received", op.id);
            self.pending.push(op);
            return ApplyOutcome::Deferred;
        }

        let mut deltas = self.integrate(&op);
        deltas.extend(self.drain_pending());

        if !deltas.is_empty() {
            self.observers.emit(&deltas);
        }
        ApplyOutcome::Applied(deltas)
    }

    fn is_ready(&self, op: &Operation) -> bool {
        op.dependencies().iter().all(|id| self.known.contains(id))
    }

    /// Apply buffered operations until no more become ready.
    fn drain_pending(&mut self) -> Vec<TextDelta> {
        let mut deltas = Vec::new();
        loop {
            let Some(idx) = self.pending.iter().position(|op| self.is_ready(op)) else {
                break;
            };
            let op = self.pending.remove(idx);
            log::debug!("releasing deferred {:?}", op.id);
            deltas.extend(self.integrate(&op));
        }
        deltas
    }

    /// Integrate a ready operation and return its visible deltas.
    fn integrate(&mut self, op: &Operation) -> Vec<TextDelta> {
        self.received.insert(op.id);
        self.state_vector.observe(op.id.site, op.last_clock());
        self.clock = self.clock.max(op.last_clock());

        let deltas = match &op.kind {
            OpKind::Insert { origin, text } => self.integrate_insert(op.id, *origin, text),
            OpKind::Delete { targets } => self.integrate_delete(targets),
        };
        self.history.push(op.clone());
        deltas
    }

    fn integrate_insert(
        &mut self,
        first: ElementId,
        origin: Option<ElementId>,
        text: &str,
    ) -> Vec<TextDelta> {
        // Slot right after the origin, and the visible index there.
        let (mut pos, mut visible) = match origin {
            None => (0, 0),
            Some(origin) => match self.locate(&origin) {
                Some((p, v)) => (p + 1, v + usize::from(!self.elements[p].deleted)),
                // Unreachable for ready operations.
                None => (0, 0),
            },
        };

        let mut deltas: Vec<TextDelta> = Vec::new();
        for (i, ch) in text.chars().enumerate() {
            let id = first.offset(i as u64);

            // Skip concurrent inserts that win the tie-break, along with
            // everything inserted after them (always a higher id).
            while let Some(e) = self.elements.get(pos) {
                if e.id < id {
                    break;
                }
                if !e.deleted {
                    visible += 1;
                }
                pos += 1;
            }

            self.elements.insert(pos, Element { id, ch, deleted: false });
            self.known.insert(id);
            self.visible_len += 1;

            match deltas.last_mut() {
                Some(TextDelta::Insert { index, text }) if *index + text.chars().count() == visible => {
                    text.push(ch);
                }
                _ => deltas.push(TextDelta::insert(visible, ch.to_string())),
            }

            pos += 1;
            visible += 1;
        }
        deltas
    }

    fn integrate_delete(&mut self, targets: &[ElementId]) -> Vec<TextDelta> {
        let wanted: HashSet<&ElementId> = targets.iter().collect();
        let mut deltas: Vec<TextDelta> = Vec::new();
        let mut visible = 0;

        for e in self.elements.iter_mut() {
            if e.deleted {
                continue;
            }
            if wanted.contains(&e.id) {
                e.deleted = true;
                self.visible_len -= 1;
                match deltas.last_mut() {
                    Some(TextDelta::Delete { index, len }) if *index == visible => *len += 1,
                    _ => deltas.push(TextDelta::delete(visible, 1)),
                }
            } else {
                visible += 1;
            }
        }
        deltas
    }

    // ─── Positions ────────────────────────────────────────────────

    /// Element slot and visible index of `id`.
    fn locate(&self, id: &ElementId) -> Option<(usize, usize)> {
        let mut visible = 0;
        for (pos, e) in self.elements.iter().enumerate() {
            if e.id == *id {
                return Some((pos, visible));
            }
            if !e.deleted {
                visible += 1;
            }
        }
        None
    }

    /// Slot of the `index`-th visible element.
    fn visible_position(&self, index: usize) -> Option<usize> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.deleted)
            .nth(index)
            .map(|(pos, _)| pos)
    }

    /// Ids of the visible elements in `range`.
    pub fn element_ids(&self, range: Range<usize>) -> Vec<ElementId> {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .skip(range.start)
            .take(range.end.saturating_sub(range.start))
            .map(|e| e.id)
            .collect()
    }

    /// Characters of the given elements, tombstones included, in document order.
    pub fn chars_of(&self, ids: &[ElementId]) -> Vec<(ElementId, char)> {
        let wanted: HashSet<&ElementId> = ids.iter().collect();
        self.elements
            .iter()
            .filter(|e| wanted.contains(&e.id))
            .map(|e| (e.id, e.ch))
            .collect()
    }

    /// Visible ids among `ids`.
    pub fn visible_ids(&self, ids: &[ElementId]) -> Vec<ElementId> {
        let wanted: HashSet<&ElementId> = ids.iter().collect();
        self.elements
            .iter()
            .filter(|e| !e.deleted && wanted.contains(&e.id))
            .map(|e| e.id)
            .collect()
    }

    /// Anchor for the caret position before visible index `index`.
    pub fn anchor_at(&self, index: usize) -> Anchor {
        if index == 0 {
            return Anchor::Start;
        }
        let clamped = index.min(self.visible_len);
        match self.visible_position(clamped - 1) {
            Some(pos) => Anchor::After(self.elements[pos].id),
            None => Anchor::Start,
        }
    }

    /// Current visible index of an anchor. A deleted anchor element
    /// resolves to the position after its nearest surviving left
    /// neighbour; an unknown one to the document start.
    pub fn resolve_anchor(&self, anchor: &Anchor) -> usize {
        match anchor {
            Anchor::Start => 0,
            Anchor::After(id) => match self.locate(id) {
                Some((pos, visible)) => visible + usize::from(!self.elements[pos].deleted),
                None => 0,
            },
        }
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("site", &self.site)
            .field("clock", &self.clock)
            .field("len", &self.visible_len)
            .field("elements", &self.elements.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

// ===================================================================
// Tests
// ===================================================================
