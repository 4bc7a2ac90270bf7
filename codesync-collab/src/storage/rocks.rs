//! RocksDB-backed state store.
//!
//! Column families:
//! - `documents`: snapshot history per document (bincode + LZ4)
//! - `deltas`: operations appended since the snapshot, keyed by `doc_id:seq`
//! - `metadata`: per-document counters (bincode)
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use uuid::Uuid;

use codesync_core::Operation;

use super::{decode_compressed, encode_compressed, StateStore, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_DELTAS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("codesync_state"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DocumentMetadata {
    /// Sequence number for the next appended operation.
    next_seq: u64,
    delta_count: u64,
    snapshot_ops: u64,
    updated_at: u64,
}

impl DocumentMetadata {
    fn touch(&mut self) {
        self.updated_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

pub struct RocksStateStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes metadata read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl RocksStateStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("state store opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4-compressed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        if name == CF_DELTAS {
            // Many small writes, prefix-scanned by doc_id
            opts.set_max_write_buffer_number(4);
            opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
        } else {
            opts.set_max_write_buffer_number(2);
            opts.optimize_for_point_lookup(config.block_cache_size as u64);
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// All documents with stored history.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }

    fn load_metadata(&self, doc_id: Uuid) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Appended operations in sequence order, with their keys.
    fn load_deltas(&self, doc_id: Uuid) -> Result<Vec<(Vec<u8>, Operation)>, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let start_key = Self::delta_key(doc_id, 0);

        let mut deltas = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            // Stop once past this document's prefix
            if key.len() != 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            deltas.push((key.to_vec(), decode_compressed(&value)?));
        }
        Ok(deltas)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// doc_id (16 bytes) + sequence (8 bytes big-endian).
    fn delta_key(doc_id: Uuid, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot_batch(
        &self,
        doc_id: Uuid,
        ops: &[Operation],
        meta: &mut DocumentMetadata,
    ) -> Result<WriteBatch, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        meta.snapshot_ops = ops.len() as u64;
        meta.delta_count = 0;
        meta.touch();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, doc_id.as_bytes(), encode_compressed(ops)?);
        for (key, _) in self.load_deltas(doc_id)? {
            batch.delete_cf(&cf_deltas, &key);
        }
        batch.put_cf(&cf_meta, doc_id.as_bytes(), meta.encode()?);
        Ok(batch)
    }
}

impl StateStore for RocksStateStore {
    fn save_snapshot(&self, doc_id: Uuid, ops: &[Operation]) -> Result<(), StoreError> {
        let _guard = self.lock();
        let mut meta = self.load_metadata(doc_id)?.unwrap_or_default();
        let batch = self.snapshot_batch(doc_id, ops, &mut meta)?;
        self.write(batch)
    }

    fn load(&self, doc_id: Uuid) -> Result<Option<Vec<Operation>>, StoreError> {
        if self.load_metadata(doc_id)?.is_none() {
            return Ok(None);
        }
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut ops: Vec<Operation> = match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => decode_compressed(&bytes)?,
            None => Vec::new(),
        };
        ops.extend(self.load_deltas(doc_id)?.into_iter().map(|(_, op)| op));
        Ok(Some(ops))
    }

    fn append_op(&self, doc_id: Uuid, op: &Operation) -> Result<(), StoreError> {
        let _guard = self.lock();
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.load_metadata(doc_id)?.unwrap_or_default();
        let key = Self::delta_key(doc_id, meta.next_seq);
        meta.next_seq += 1;
        meta.delta_count += 1;
        meta.touch();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_deltas, &key, encode_compressed(op)?);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.write(batch)
    }

    fn compact(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        let _guard = self.lock();
        let mut meta = self.load_metadata(doc_id)?.ok_or(StoreError::NotFound(doc_id))?;
        let folded = meta.delta_count;
        if folded == 0 {
            return Ok(0);
        }

        let cf = self.cf(CF_DOCUMENTS)?;
        let mut ops: Vec<Operation> = match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => decode_compressed(&bytes)?,
            None => Vec::new(),
        };
        ops.extend(self.load_deltas(doc_id)?.into_iter().map(|(_, op)| op));

        let batch = self.snapshot_batch(doc_id, &ops, &mut meta)?;
        self.write(batch)?;
        log::debug!("compacted {folded} operations of {doc_id}");
        Ok(folded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codesync_core::{Document, SiteId, TextDelta};

    fn open(dir: &tempfile::TempDir) -> RocksStateStore {
        RocksStateStore::open(StoreConfig::for_testing(dir.path())).unwrap()
    }

    fn typed(doc: &mut Document, text: &str) -> Operation {
        let len = doc.len();
        doc.apply_local(&TextDelta::insert(len, text)).unwrap().unwrap()
    }

    #[test]
    fn test_store_open_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.path().exists());
        assert!(store.list_documents().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert_eq!(store.load(Uuid::new_v4()).unwrap(), None);
        assert!(matches!(store.compact(Uuid::new_v4()), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_append_and_load_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let doc_id = Uuid::new_v4();
        let mut doc = Document::new(SiteId::random());

        for word in ["fn ", "main", "() {}"] {
            store.append_op(doc_id, &typed(&mut doc, word)).unwrap();
        }

        let ops = store.load(doc_id).unwrap().unwrap();
        assert_eq!(ops, doc.history());
        let restored = Document::from_operations(SiteId::random(), ops);
        assert_eq!(restored.text(), "fn main() {}");
    }

    #[test]
    fn test_snapshot_then_compact() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let doc_id = Uuid::new_v4();
        let mut doc = Document::new(SiteId::random());

        typed(&mut doc, "base");
        store.save_snapshot(doc_id, doc.history()).unwrap();

        store.append_op(doc_id, &typed(&mut doc, " one")).unwrap();
        store.append_op(doc_id, &typed(&mut doc, " two")).unwrap();

        assert_eq!(store.compact(doc_id).unwrap(), 2);
        assert_eq!(store.compact(doc_id).unwrap(), 0);

        let restored = Document::from_operations(SiteId::random(), store.load(doc_id).unwrap().unwrap());
        assert_eq!(restored.text(), "base one two");
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let doc_id = Uuid::new_v4();
        let mut doc = Document::new(SiteId::random());
        {
            let store = open(&dir);
            store.append_op(doc_id, &typed(&mut doc, "durable")).unwrap();
            store.sync().unwrap();
        }
        let store = open(&dir);
        assert_eq!(store.list_documents().unwrap(), vec![doc_id]);
        assert_eq!(store.load(doc_id).unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_documents_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut doc_a = Document::new(SiteId::random());
        let mut doc_b = Document::new(SiteId::random());

        store.append_op(a, &typed(&mut doc_a, "a")).unwrap();
        store.append_op(b, &typed(&mut doc_b, "b")).unwrap();
        store.append_op(a, &typed(&mut doc_a, "a")).unwrap();

        assert_eq!(store.load(a).unwrap().unwrap().len(), 2);
        assert_eq!(store.load(b).unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
