//! In-process state store. Default for the relay and for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use codesync_core::Operation;

use super::{StateStore, StoreError};

#[derive(Default)]
struct Entry {
    snapshot: Vec<Operation>,
    appended: Vec<Operation>,
}

#[derive(Default)]
pub struct MemoryStateStore {
    docs: Mutex<HashMap<Uuid, Entry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations appended since the last snapshot.
    pub fn appended_len(&self, doc_id: Uuid) -> usize {
        self.lock()
            .get(&doc_id)
            .map_or(0, |entry| entry.appended.len())
    }

    pub fn document_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStore for MemoryStateStore {
    fn save_snapshot(&self, doc_id: Uuid, ops: &[Operation]) -> Result<(), StoreError> {
        self.lock().insert(
            doc_id,
            Entry {
                snapshot: ops.to_vec(),
                appended: Vec::new(),
            },
        );
        Ok(())
    }

    fn load(&self, doc_id: Uuid) -> Result<Option<Vec<Operation>>, StoreError> {
        Ok(self.lock().get(&doc_id).map(|entry| {
            entry
                .snapshot
                .iter()
                .chain(entry.appended.iter())
                .cloned()
                .collect()
        }))
    }

    fn append_op(&self, doc_id: Uuid, op: &Operation) -> Result<(), StoreError> {
        self.lock().entry(doc_id).or_default().appended.push(op.clone());
        Ok(())
    }

    fn compact(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        let mut docs = self.lock();
        let entry = docs.get_mut(&doc_id).ok_or(StoreError::NotFound(doc_id))?;
        let folded = entry.appended.len() as u64;
        let appended = std::mem::take(&mut entry.appended);
        entry.snapshot.extend(appended);
        Ok(folded)
    }
}
