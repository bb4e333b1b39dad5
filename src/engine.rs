//! # Engine
//!
//! The embedding surface: collections of documents over the transactional
//! page store. Every operation runs inside its own transaction; mutating
//! operations open a write snapshot (taking the collection lock), readers
//! sample a `read_version` and never block writers.
//!
//! ```ignore
//! let engine = Engine::open(EngineOptions::new("app.db"))?;
//! let mut doc = BsonDocument::new();
//! doc.insert("_id", 1i32);
//! doc.insert("name", "alice");
//! engine.insert("users", doc)?;
//!
//! let found = engine.find_by_id("users", &BsonValue::Int32(1))?;
//! engine.close()?;
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::bson::{BsonDocument, BsonValue};
use crate::collation::Collation;
use crate::config::{EngineOptions, PAGE_ID_NONE, PAGE_SIZE};
use crate::data::DataService;
use crate::index::{IndexService, Order};
use crate::locks::LockService;
use crate::storage::{
    page_position, BasePage, DiskService, EnginePragmas, FileStreamFactory, HeaderPage,
    MemoryStreamFactory, PageType, StreamFactory, TypedPage, WalIndex, HEADER_PAGE_ID,
};
use crate::transaction::{LockMode, Snapshot, Transaction, TransactionMonitor};
use crate::{Error, Result};

pub struct Engine {
    disk: Arc<DiskService>,
    wal: Arc<WalIndex>,
    header: Arc<Mutex<HeaderPage>>,
    locks: Arc<LockService>,
    monitor: Arc<TransactionMonitor>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Opens or creates a database. A fresh file gets its header page
    /// written synchronously; an existing file goes through log recovery
    /// before the first transaction can start.
    pub fn open(options: EngineOptions) -> Result<Self> {
        let factory: Box<dyn StreamFactory> = match &options.path {
            Some(path) => Box::new(FileStreamFactory::new(path, options.read_only)),
            None => Box::new(MemoryStreamFactory::new()),
        };

        let disk = Arc::new(DiskService::new(factory, options.password.is_some())?);
        let wal = Arc::new(WalIndex::new());

        let header = if disk.is_new() {
            let buffer = disk.new_page()?;
            let mut header =
                HeaderPage::new(BasePage::new(buffer, HEADER_PAGE_ID, PageType::Header));
            header.pragmas.timeout = options.timeout.as_secs() as u32;

            // pre-allocation: pages after the header are written as a
            // chained free list, so the region survives recovery and feeds
            // the allocator before the file grows
            let preallocated =
                (options.initial_size / PAGE_SIZE as u64).saturating_sub(1) as u32;
            if preallocated > 0 {
                Self::preallocate_empty_pages(&disk, preallocated)?;
                header.last_page_id = preallocated;
                header.free_empty_page_list = 1;
            }

            header.update_buffer()?;
            disk.write_direct(&[(0, header.base().buffer().bytes().as_slice())])?;
            disk.recover(header.last_page_id, &wal)?;
            header
        } else {
            let buffer = disk.read_page(0, true)?;
            let stale = match BasePage::load(Arc::clone(&buffer)).and_then(HeaderPage::load) {
                Ok(header) => header,
                Err(error) => {
                    disk.discard_page(buffer);
                    return Err(error);
                }
            };

            disk.recover(stale.last_page_id, &wal)?;

            // a commit may have left a newer header in the log
            match wal.get_page_index(HEADER_PAGE_ID, wal.current_read_version()) {
                Some(position) => {
                    let newer = disk.read_page(position, true)?;
                    let loaded = BasePage::load(Arc::clone(&newer)).and_then(|mut base| {
                        base.transaction_id = 0;
                        base.is_confirmed = false;
                        HeaderPage::load(base)
                    });
                    let stale_buffer = Arc::clone(stale.base().buffer());
                    drop(stale);
                    match loaded {
                        Ok(header) => {
                            disk.discard_page(stale_buffer);
                            disk.ensure_data_region(header.last_page_id);
                            header
                        }
                        Err(error) => {
                            disk.discard_page(newer);
                            disk.discard_page(stale_buffer);
                            return Err(error);
                        }
                    }
                }
                None => stale,
            }
        };

        let locks = Arc::new(LockService::new(Duration::from_secs(
            header.pragmas.timeout as u64,
        )));

        Ok(Self {
            disk,
            wal,
            header: Arc::new(Mutex::new(header)),
            locks,
            monitor: Arc::new(TransactionMonitor::new()),
        })
    }

    /// Writes pages `1..=count` of a fresh file as empty pages chained
    /// through `next_page_id`, ready to serve as the initial free list.
    fn preallocate_empty_pages(disk: &DiskService, count: u32) -> Result<()> {
        const CHUNK: usize = 256;

        let scratch = disk.new_page()?;
        let mut chunk: Vec<(u64, Vec<u8>)> = Vec::with_capacity(CHUNK);

        for page_id in 1..=count {
            let mut page = BasePage::new(Arc::clone(&scratch), page_id, PageType::Empty);
            page.next_page_id = if page_id < count {
                page_id + 1
            } else {
                PAGE_ID_NONE
            };
            page.update_buffer();
            chunk.push((page_position(page_id), scratch.bytes().to_vec()));

            if chunk.len() == CHUNK || page_id == count {
                let refs: Vec<(u64, &[u8])> = chunk
                    .iter()
                    .map(|(position, bytes)| (*position, bytes.as_slice()))
                    .collect();
                disk.write_direct(&refs)?;
                chunk.clear();
            }
        }

        disk.discard_page(scratch);
        Ok(())
    }

    fn begin(&self) -> Result<Transaction> {
        self.disk.check_writer()?;
        Transaction::new(
            Arc::clone(&self.disk),
            Arc::clone(&self.wal),
            Arc::clone(&self.header),
            Arc::clone(&self.locks),
            Arc::clone(&self.monitor),
        )
    }

    fn collation(&self) -> Collation {
        self.header.lock().pragmas.collation.clone()
    }

    // -------------------------------------------------------------------------
    // collections
    // -------------------------------------------------------------------------

    pub fn collections(&self) -> Vec<String> {
        let header = self.header.lock();
        let mut names: Vec<String> = header.collections().map(|(n, _)| n.to_string()).collect();
        names.sort();
        names
    }

    pub fn create_collection(&self, name: &str) -> Result<()> {
        let collation = self.collation();
        let mut txn = self.begin()?;
        {
            let snapshot = txn.create_snapshot(LockMode::Write, name)?;
            if snapshot.collection_page_id().is_some() {
                return Err(Error::AlreadyExists(name.to_string()));
            }
            Self::initialize_collection(snapshot, collation)?;
        }
        txn.commit()?;
        self.try_auto_checkpoint()
    }

    pub fn drop_collection(&self, name: &str) -> Result<bool> {
        let collation = self.collation();
        let mut txn = self.begin()?;
        {
            let snapshot = txn.create_snapshot(LockMode::Write, name)?;
            if snapshot.collection_page_id().is_none() {
                return Ok(false);
            }
            IndexService::new(snapshot, collation).drop_collection()?;
        }
        txn.commit()?;
        self.try_auto_checkpoint()?;
        Ok(true)
    }

    fn initialize_collection(snapshot: &mut Snapshot, collation: Collation) -> Result<()> {
        snapshot.create_collection_page()?;
        IndexService::new(snapshot, collation).create_index("_id", "$._id", true)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // indexes
    // -------------------------------------------------------------------------

    /// Creates a secondary index and back-fills it from existing documents.
    /// Returns false when an index of that name already exists.
    pub fn ensure_index(
        &self,
        collection: &str,
        name: &str,
        expr: &str,
        unique: bool,
    ) -> Result<bool> {
        let collation = self.collation();
        let mut txn = self.begin()?;
        {
            let snapshot = txn.create_snapshot(LockMode::Write, collection)?;
            if snapshot.collection_page_id().is_none() {
                Self::initialize_collection(snapshot, collation.clone())?;
            }
            if snapshot
                .collection_page()?
                .get_collection_index(name)
                .is_some()
            {
                return Ok(false);
            }

            let mut indexes = IndexService::new(snapshot, collation);
            indexes.create_index(name, expr, unique)?;

            // back-fill from the primary key
            let pk = indexes
                .snapshot()
                .collection_page()?
                .pk_index()
                .clone();
            let existing = indexes.find_all(&pk, Order::Ascending)?;
            for pk_node in existing {
                let document = {
                    let mut data = DataService::new(indexes.snapshot());
                    BsonDocument::decode(&data.read(pk_node.data_block)?)?
                };
                let Some(key) = eval_path(&document, expr) else {
                    continue;
                };

                // append to the document's node chain
                let mut last = pk_node.position;
                loop {
                    let node = indexes.get_node(last)?;
                    if node.next_node.is_empty() {
                        break;
                    }
                    last = node.next_node;
                }
                indexes.add(name, &key, pk_node.data_block, Some(last))?;
            }
        }
        txn.commit()?;
        self.try_auto_checkpoint()?;
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // documents
    // -------------------------------------------------------------------------

    /// Inserts one document, auto-creating the collection and generating an
    /// ObjectId `_id` when the document has none. Returns the id.
    pub fn insert(&self, collection: &str, mut document: BsonDocument) -> Result<BsonValue> {
        let collation = self.collation();
        let mut txn = self.begin()?;
        {
            let snapshot = txn.create_snapshot(LockMode::Write, collection)?;
            if snapshot.collection_page_id().is_none() {
                Self::initialize_collection(snapshot, collation.clone())?;
            }

            let id = match document.get("_id") {
                Some(id) if id.is_null() || id.is_min_or_max() => {
                    return Err(Error::InvalidIndexKey(format!(
                        "`_id` cannot hold {id:?}"
                    )));
                }
                Some(id) => id.clone(),
                None => {
                    let id = BsonValue::ObjectId(new_object_id());
                    document.insert("_id", id.clone());
                    id
                }
            };

            let bytes = document.try_encode()?;
            let data_block = DataService::new(snapshot).insert(&bytes)?;

            let secondary: Vec<(String, String)> = snapshot
                .collection_page()?
                .indexes()
                .filter(|i| i.slot != 0)
                .map(|i| (i.name.clone(), i.expr.clone()))
                .collect();

            let mut indexes = IndexService::new(snapshot, collation.clone());
            let pk_node = indexes.add("_id", &id, data_block, None)?;
            let mut last = pk_node.position;
            for (index_name, expr) in secondary {
                if let Some(key) = eval_path(&document, &expr) {
                    let node = indexes.add(&index_name, &key, data_block, Some(last))?;
                    last = node.position;
                }
            }

            txn.commit()?;
            self.try_auto_checkpoint()?;
            Ok(id)
        }
    }

    /// Deletes one document by id. Returns false when it does not exist.
    pub fn delete(&self, collection: &str, id: &BsonValue) -> Result<bool> {
        let collation = self.collation();
        let mut txn = self.begin()?;
        let deleted = {
            let snapshot = txn.create_snapshot(LockMode::Write, collection)?;
            if snapshot.collection_page_id().is_none() {
                return Ok(false);
            }

            let pk = snapshot.collection_page()?.pk_index().clone();
            let mut indexes = IndexService::new(snapshot, collation);
            match indexes.find(&pk, id, false, Order::Ascending)? {
                Some(node) => {
                    indexes.delete_all(node.position)?;
                    DataService::new(indexes.snapshot()).delete(node.data_block)?;
                    true
                }
                None => false,
            }
        };

        if deleted {
            txn.commit()?;
            self.try_auto_checkpoint()?;
        }
        Ok(deleted)
    }

    /// Point lookup through the primary key.
    pub fn find_by_id(&self, collection: &str, id: &BsonValue) -> Result<Option<BsonDocument>> {
        let collation = self.collation();
        let mut txn = self.begin()?;
        let snapshot = txn.create_snapshot(LockMode::Read, collection)?;
        if snapshot.collection_page_id().is_none() {
            return Ok(None);
        }

        let pk = snapshot.collection_page()?.pk_index().clone();
        let mut indexes = IndexService::new(snapshot, collation);
        let Some(node) = indexes.find(&pk, id, false, Order::Ascending)? else {
            return Ok(None);
        };

        let bytes = DataService::new(indexes.snapshot()).read(node.data_block)?;
        Ok(Some(BsonDocument::decode(&bytes)?))
    }

    /// Full scan in primary-key order.
    pub fn find_all(&self, collection: &str) -> Result<Vec<BsonDocument>> {
        let collation = self.collation();
        let mut txn = self.begin()?;
        let snapshot = txn.create_snapshot(LockMode::Read, collection)?;
        if snapshot.collection_page_id().is_none() {
            return Ok(Vec::new());
        }

        let pk = snapshot.collection_page()?.pk_index().clone();
        let mut indexes = IndexService::new(snapshot, collation);
        let nodes = indexes.find_all(&pk, Order::Ascending)?;

        let mut documents = Vec::with_capacity(nodes.len());
        for node in nodes {
            let bytes = DataService::new(indexes.snapshot()).read(node.data_block)?;
            documents.push(BsonDocument::decode(&bytes)?);
        }
        Ok(documents)
    }

    /// Live documents in a collection (0 when the collection is absent).
    pub fn count(&self, collection: &str) -> Result<u64> {
        let mut txn = self.begin()?;
        let snapshot = txn.create_snapshot(LockMode::Read, collection)?;
        if snapshot.collection_page_id().is_none() {
            return Ok(0);
        }
        Ok(snapshot.collection_page()?.pk_index().key_count)
    }

    // -------------------------------------------------------------------------
    // pragmas
    // -------------------------------------------------------------------------

    pub fn pragmas(&self) -> EnginePragmas {
        self.header.lock().pragmas.clone()
    }

    pub fn user_version(&self) -> u32 {
        self.header.lock().pragmas.user_version
    }

    pub fn set_user_version(&self, value: u32) -> Result<()> {
        self.commit_pragmas(|pragmas| pragmas.user_version = value)
    }

    /// Log pages before an automatic checkpoint; 0 disables.
    pub fn set_checkpoint_size(&self, pages: u32) -> Result<()> {
        self.commit_pragmas(|pragmas| pragmas.checkpoint = pages)
    }

    pub fn set_limit_size(&self, bytes: u64) -> Result<()> {
        self.commit_pragmas(|pragmas| pragmas.limit_size = bytes)
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.commit_pragmas(|pragmas| pragmas.timeout = timeout.as_secs() as u32)?;
        self.locks.set_timeout(timeout);
        Ok(())
    }

    pub fn set_utc_date(&self, value: bool) -> Result<()> {
        self.commit_pragmas(|pragmas| pragmas.utc_date = value)
    }

    /// Persists a pragma change as a single confirmed header page.
    fn commit_pragmas(&self, apply: impl FnOnce(&mut EnginePragmas)) -> Result<()> {
        self.disk.check_writer()?;
        let _shared = self.locks.enter_transaction()?;
        let transaction_id = self.monitor.next_transaction_id();

        // the header stays locked through the publish so a concurrent
        // commit cannot interleave an older header copy at a newer version
        let mut header = self.header.lock();
        apply(&mut header.pragmas);

        header.base_mut().transaction_id = transaction_id;
        header.base_mut().is_confirmed = true;
        header.update_buffer()?;

        let copy = self.disk.new_page()?;
        copy.write_bytes()
            .copy_from_slice(header.base().buffer().bytes());

        header.base_mut().transaction_id = 0;
        header.base_mut().is_confirmed = false;

        let positions = self.disk.write_async(vec![copy])?;
        self.disk.wait_writer()?;
        self.wal
            .confirm_transaction(transaction_id, &[(HEADER_PAGE_ID, positions[0])]);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // introspection
    // -------------------------------------------------------------------------

    /// Highest allocated page id; the data region ends at
    /// `(last_page_id + 1) * PAGE_SIZE`.
    pub fn last_page_id(&self) -> u32 {
        self.header.lock().last_page_id
    }

    /// Pages currently in the log region.
    pub fn log_pages(&self) -> u32 {
        self.disk.log_length_pages()
    }

    // -------------------------------------------------------------------------
    // checkpoint / close
    // -------------------------------------------------------------------------

    /// Copies every committed log page to its home position and truncates
    /// the log. Takes the exclusive database lock.
    pub fn checkpoint(&self) -> Result<()> {
        self.disk.check_writer()?;
        let _exclusive = self.locks.enter_exclusive()?;

        self.disk.wait_writer()?;
        let entries = self.wal.checkpoint_entries(self.wal.current_read_version());
        if !entries.is_empty() {
            self.disk.checkpoint_copy(&entries)?;
        }
        self.wal.clear();
        self.disk.reset_log_position(true)
    }

    fn try_auto_checkpoint(&self) -> Result<()> {
        let threshold = self.header.lock().pragmas.checkpoint;
        if threshold == 0 || self.disk.log_length_pages() < threshold {
            return Ok(());
        }
        match self.checkpoint() {
            // a busy database postpones the checkpoint to a later commit
            Err(Error::LockTimeout { .. }) => Ok(()),
            other => other,
        }
    }

    /// Flushes, checkpoints and releases the engine. Errors other than a
    /// latched writer failure are returned; the file stays consistent
    /// either way.
    pub fn close(self) -> Result<()> {
        self.disk.wait_writer()?;
        self.checkpoint()
    }
}

fn new_object_id() -> [u8; 12] {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let random: [u8; 8] = rand::random();

    let mut oid = [0u8; 12];
    oid[..4].copy_from_slice(&seconds.to_be_bytes());
    oid[4..].copy_from_slice(&random);
    oid
}

/// Evaluates a top-level `$.field` path against a document. Anything more
/// expressive belongs to the query layer, which is out of scope here.
fn eval_path(document: &BsonDocument, expr: &str) -> Option<BsonValue> {
    let field = expr.strip_prefix("$.")?;
    document.get(field).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_engine() -> Engine {
        Engine::open(EngineOptions::in_memory()).unwrap()
    }

    fn doc(id: i32, name: &str) -> BsonDocument {
        let mut doc = BsonDocument::new();
        doc.insert("_id", id);
        doc.insert("name", name);
        doc
    }

    #[test]
    fn insert_and_find_round_trip() {
        let engine = memory_engine();
        engine.insert("users", doc(1, "alice")).unwrap();

        let found = engine.find_by_id("users", &BsonValue::Int32(1)).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&BsonValue::String("alice".into())));
        assert_eq!(engine.count("users").unwrap(), 1);
    }

    #[test]
    fn missing_id_gets_an_object_id() {
        let engine = memory_engine();
        let mut document = BsonDocument::new();
        document.insert("name", "anonymous");

        let id = engine.insert("users", document).unwrap();
        assert!(matches!(id, BsonValue::ObjectId(_)));
        assert!(engine.find_by_id("users", &id).unwrap().is_some());
    }

    #[test]
    fn duplicate_primary_key_is_rejected() {
        let engine = memory_engine();
        engine.insert("users", doc(1, "alice")).unwrap();

        let err = engine.insert("users", doc(1, "bob")).unwrap_err();
        assert!(matches!(err, Error::IndexDuplicateKey { .. }));
        assert_eq!(engine.count("users").unwrap(), 1);
    }

    #[test]
    fn unique_secondary_index_is_enforced() {
        let engine = memory_engine();
        engine.ensure_index("users", "byName", "$.name", true).unwrap();

        engine.insert("users", doc(1, "x")).unwrap();
        let err = engine.insert("users", doc(2, "x")).unwrap_err();

        assert!(matches!(err, Error::IndexDuplicateKey { .. }));
        assert_eq!(engine.count("users").unwrap(), 1);
        // the failed insert left no document behind
        assert!(engine.find_by_id("users", &BsonValue::Int32(2)).unwrap().is_none());
    }

    #[test]
    fn ensure_index_back_fills_existing_documents() {
        let engine = memory_engine();
        engine.insert("users", doc(1, "a")).unwrap();
        engine.insert("users", doc(2, "b")).unwrap();

        assert!(engine.ensure_index("users", "byName", "$.name", true).unwrap());
        assert!(!engine.ensure_index("users", "byName", "$.name", true).unwrap());

        // uniqueness now guards against the back-filled keys
        let err = engine.insert("users", doc(3, "a")).unwrap_err();
        assert!(matches!(err, Error::IndexDuplicateKey { .. }));
    }

    #[test]
    fn delete_removes_document_and_nodes() {
        let engine = memory_engine();
        engine.ensure_index("users", "byName", "$.name", false).unwrap();
        engine.insert("users", doc(1, "a")).unwrap();
        engine.insert("users", doc(2, "b")).unwrap();

        assert!(engine.delete("users", &BsonValue::Int32(1)).unwrap());
        assert!(!engine.delete("users", &BsonValue::Int32(1)).unwrap());

        assert_eq!(engine.count("users").unwrap(), 1);
        let all = engine.find_all("users").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get("_id"), Some(&BsonValue::Int32(2)));
    }

    #[test]
    fn collections_are_catalogued() {
        let engine = memory_engine();
        engine.create_collection("b").unwrap();
        engine.create_collection("a").unwrap();

        assert_eq!(engine.collections(), vec!["a", "b"]);
        assert!(matches!(
            engine.create_collection("a"),
            Err(Error::AlreadyExists(_))
        ));

        assert!(engine.drop_collection("a").unwrap());
        assert!(!engine.drop_collection("a").unwrap());
        assert_eq!(engine.collections(), vec!["b"]);
    }

    #[test]
    fn find_all_returns_documents_in_pk_order() {
        let engine = memory_engine();
        for id in [5, 1, 3, 2, 4] {
            engine.insert("n", doc(id, "x")).unwrap();
        }

        let ids: Vec<i32> = engine
            .find_all("n")
            .unwrap()
            .iter()
            .map(|d| match d.get("_id") {
                Some(BsonValue::Int32(v)) => *v,
                other => panic!("unexpected id {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn pragma_changes_survive_in_header() {
        let engine = memory_engine();
        engine.set_user_version(7).unwrap();
        engine.set_checkpoint_size(100).unwrap();

        assert_eq!(engine.user_version(), 7);
        assert_eq!(engine.pragmas().checkpoint, 100);
    }

    #[test]
    fn checkpoint_truncates_the_log() {
        let engine = memory_engine();
        for id in 0..50 {
            engine.insert("c", doc(id, "payload")).unwrap();
        }
        assert!(engine.disk.log_length_pages() > 0);

        engine.checkpoint().unwrap();
        assert_eq!(engine.disk.log_length_pages(), 0);

        // reads are identical after the log collapsed
        assert_eq!(engine.count("c").unwrap(), 50);
        let found = engine.find_by_id("c", &BsonValue::Int32(25)).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&BsonValue::String("payload".into())));
    }

    #[test]
    fn initial_size_seeds_the_free_list() {
        let engine =
            Engine::open(EngineOptions::in_memory().initial_size(16 * PAGE_SIZE as u64)).unwrap();
        assert_eq!(engine.last_page_id(), 15);

        // allocations pop the pre-allocated pages instead of growing the file
        engine.insert("c", doc(1, "a")).unwrap();
        assert_eq!(engine.last_page_id(), 15);
        assert_eq!(engine.count("c").unwrap(), 1);
    }

    #[test]
    fn documents_larger_than_a_page_round_trip() {
        let engine = memory_engine();
        let mut document = BsonDocument::new();
        document.insert("_id", 1i32);
        document.insert("blob", BsonValue::Binary(vec![0x5A; 30_000]));

        engine.insert("big", document.clone()).unwrap();
        let found = engine.find_by_id("big", &BsonValue::Int32(1)).unwrap().unwrap();
        assert_eq!(found, document);
    }
}
