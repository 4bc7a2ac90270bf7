//! Local undo/redo on top of the CRDT.
//!
//! Only operations made on this replica are recorded, so undo never reverts
//! a collaborator's edit. Undoing an insert tombstones the inserted
//! elements; undoing a delete re-inserts the removed characters as fresh
//! elements right after the first removed one.

use crate::crdt::{Document, ElementId, OpKind, Operation};

const DEFAULT_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Inserted(Vec<ElementId>),
    Deleted(Vec<(ElementId, char)>),
}

#[derive(Debug)]
pub struct UndoManager {
    undo: Vec<Entry>,
    redo: Vec<Entry>,
    depth: usize,
}

impl UndoManager {
    pub fn new() -> Self {
        Self::with_depth(DEFAULT_DEPTH)
    }

    pub fn with_depth(depth: usize) -> Self {
        Self {
            undo: Vec::new(),
            redo: Vec::new(),
            depth: depth.max(1),
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Record a local operation already applied to `doc`.
    pub fn record(&mut self, doc: &Document, op: &Operation) {
        self.redo.clear();
        match &op.kind {
            OpKind::Insert { origin, text } => {
                let ids: Vec<ElementId> = (0..text.chars().count() as u64)
                    .map(|i| ElementId::new(op.id.clock + i, op.id.site))
                    .collect();
                // Continuous typing collapses into one step.
                if let (Some(Entry::Inserted(prev)), Some(origin)) = (self.undo.last_mut(), origin) {
                    if prev.last() == Some(origin) {
                        prev.extend(ids);
                        return;
                    }
                }
                self.push(Entry::Inserted(ids));
            }
            OpKind::Delete { targets } => {
                self.push(Entry::Deleted(doc.chars_of(targets)));
            }
        }
    }

    /// Revert the most recent local step. Returns the operations to send.
    pub fn undo(&mut self, doc: &mut Document) -> Vec<Operation> {
        let Some(entry) = self.undo.pop() else {
            return Vec::new();
        };
        let (ops, inverse) = revert(doc, entry);
        if let Some(inverse) = inverse {
            self.redo.push(inverse);
        }
        ops
    }

    /// Re-apply the most recently undone step.
    pub fn redo(&mut self, doc: &mut Document) -> Vec<Operation> {
        let Some(entry) = self.redo.pop() else {
            return Vec::new();
        };
        let (ops, inverse) = revert(doc, entry);
        if let Some(inverse) = inverse {
            self.undo.push(inverse);
        }
        ops
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    fn push(&mut self, entry: Entry) {
        if self.undo.len() == self.depth {
            self.undo.remove(0);
        }
        self.undo.push(entry);
    }
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply the inverse of `entry` and return the produced operations along
/// with the entry that reverts them again.
fn revert(doc: &mut Document, entry: Entry) -> (Vec<Operation>, Option<Entry>) {
    match entry {
        Entry::Inserted(ids) => match doc.delete_elements(&ids) {
            Some(op) => {
                let removed = match &op.kind {
                    OpKind::Delete { targets } => doc.chars_of(targets),
                    OpKind::Insert { .. } => Vec::new(),
                };
                (vec![op], Some(Entry::Deleted(removed)))
            }
            // Someone else already removed all of it.
            None => (Vec::new(), None),
        },
        Entry::Deleted(chars) => {
            let Some((first, _)) = chars.first().copied() else {
                return (Vec::new(), None);
            };
            let text: String = chars.iter().map(|(_, ch)| *ch).collect();
            let op = doc.insert_after(Some(first), &text);
            let ids = (0..chars.len() as u64)
                .map(|i| ElementId::new(op.id.clock + i, op.id.site))
                .collect();
            (vec![op], Some(Entry::Inserted(ids)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::SiteId;
    use crate::delta::TextDelta;
    use uuid::Uuid;

    fn edit(doc: &mut Document, undo: &mut UndoManager, delta: TextDelta) -> Operation {
        let op = doc.apply_local(&delta).unwrap().unwrap();
        undo.record(doc, &op);
        op
    }

    #[test]
    fn test_undo_redo_insert() {
        let mut doc = Document::new(SiteId(Uuid::from_u128(1)));
        let mut undo = UndoManager::new();

        edit(&mut doc, &mut undo, TextDelta::insert(0, "hello"));
        assert_eq!(undo.undo(&mut doc).len(), 1);
        assert_eq!(doc.text(), "");

        undo.redo(&mut doc);
        assert_eq!(doc.text(), "hello");
    }

    #[test]
    fn test_typing_is_coalesced() {
        let mut doc = Document::new(SiteId(Uuid::from_u128(1)));
        let mut undo = UndoManager::new();
        for (i, ch) in "abc".chars().enumerate() {
            edit(&mut doc, &mut undo, TextDelta::insert(i, ch.to_string()));
        }
        undo.undo(&mut doc);
        assert_eq!(doc.text(), "");
        assert!(!undo.can_undo());
    }

    #[test]
    fn test_undo_delete_restores_in_place() {
        let mut doc = Document::new(SiteId(Uuid::from_u128(1)));
        let mut undo = UndoManager::new();
        edit(&mut doc, &mut undo, TextDelta::insert(0, "let x = 1;"));
        edit(&mut doc, &mut undo, TextDelta::delete(4, 1));
        assert_eq!(doc.text(), "let  = 1;");

        undo.undo(&mut doc);
        assert_eq!(doc.text(), "let x = 1;");
        undo.redo(&mut doc);
        assert_eq!(doc.text(), "let  = 1;");
    }

    #[test]
    fn test_undo_skips_remote_edits() {
        let mut a = Document::new(SiteId(Uuid::from_u128(1)));
        let mut b = Document::new(SiteId(Uuid::from_u128(2)));
        let mut undo = UndoManager::new();

        let op = edit(&mut a, &mut undo, TextDelta::insert(0, "mine"));
        b.apply_remote(op);
        let theirs = b.apply_local(&TextDelta::insert(4, "+theirs")).unwrap().unwrap();
        a.apply_remote(theirs);

        let ops = undo.undo(&mut a);
        assert_eq!(a.text(), "+theirs");
        for op in ops {
            b.apply_remote(op);
        }
        assert_eq!(b.text(), "+theirs");
    }

    #[test]
    fn test_depth_limit() {
        let mut doc = Document::new(SiteId(Uuid::from_u128(1)));
        let mut undo = UndoManager::with_depth(2);
        edit(&mut doc, &mut undo, TextDelta::insert(0, "a"));
        edit(&mut doc, &mut undo, TextDelta::insert(0, "b"));
        edit(&mut doc, &mut undo, TextDelta::insert(0, "c"));

        undo.undo(&mut doc);
        undo.undo(&mut doc);
        assert!(undo.undo(&mut doc).is_empty());
        assert_eq!(doc.text(), "a");
    }
}
