//! # Transaction
//!
//! One writer-or-reader unit of work. A transaction holds the shared
//! database lock for its lifetime, opens one snapshot per touched
//! collection and finishes with commit or rollback.
//!
//! ## Commit
//!
//! 1. Under the header mutex: fold rollback-returned pages onto the free
//!    list, splice this transaction's deleted-page chain, apply collection
//!    catalog changes.
//! 2. Drain every snapshot's dirty pages, stamped with the transaction id.
//! 3. Pick the confirm carrier: the header page when it changed, otherwise
//!    the last dirty page of the batch.
//! 4. `write_async` the batch, `wait` for the durability barrier, then
//!    publish all positions to the WAL index in one atomic step.
//!
//! ## Rollback
//!
//! No log writes: freshly allocated pages are parked with the monitor (the
//! next commit folds them onto the durable free list), local page buffers
//! are discarded, locks release on drop. Unconfirmed log pages the
//! transaction may already have written stay invisible and are discarded by
//! the next crash recovery.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::storage::TypedPage;

use super::monitor::TransactionMonitor;
use super::pages::TransactionPages;
use super::snapshot::{LockMode, Snapshot};
use crate::config::PAGE_ID_NONE;
use crate::locks::{LockService, SharedLock};
use crate::storage::{
    BasePage, DiskService, HeaderPage, PageBuffer, PageType, WalIndex, HEADER_PAGE_ID,
};
use crate::Result;

pub struct Transaction {
    transaction_id: u32,
    snapshots: HashMap<String, Snapshot>,
    trans_pages: Arc<Mutex<TransactionPages>>,
    disk: Arc<DiskService>,
    wal: Arc<WalIndex>,
    header: Arc<Mutex<HeaderPage>>,
    locks: Arc<LockService>,
    monitor: Arc<TransactionMonitor>,
    _db_lock: SharedLock,
    finished: bool,
}

impl Transaction {
    pub fn new(
        disk: Arc<DiskService>,
        wal: Arc<WalIndex>,
        header: Arc<Mutex<HeaderPage>>,
        locks: Arc<LockService>,
        monitor: Arc<TransactionMonitor>,
    ) -> Result<Self> {
        let db_lock = locks.enter_transaction()?;
        Ok(Self {
            transaction_id: monitor.next_transaction_id(),
            snapshots: HashMap::new(),
            trans_pages: Arc::new(Mutex::new(TransactionPages::new())),
            disk,
            wal,
            header,
            locks,
            monitor,
            _db_lock: db_lock,
            finished: false,
        })
    }

    pub fn transaction_id(&self) -> u32 {
        self.transaction_id
    }

    /// Opens (or reuses) the snapshot for `collection`. Asking for write
    /// mode over an existing read snapshot recreates it under the
    /// collection lock.
    pub fn create_snapshot(&mut self, mode: LockMode, collection: &str) -> Result<&mut Snapshot> {
        let needs_new = match self.snapshots.get(collection) {
            Some(snapshot) => mode == LockMode::Write && snapshot.mode() == LockMode::Read,
            None => true,
        };

        if needs_new {
            self.snapshots.remove(collection);

            let collection_lock = match mode {
                LockMode::Write => Some(self.locks.enter_collection(collection)?),
                LockMode::Read => None,
            };

            let snapshot = Snapshot::new(
                mode,
                collection,
                self.wal.current_read_version(),
                self.transaction_id,
                Arc::clone(&self.disk),
                Arc::clone(&self.wal),
                Arc::clone(&self.header),
                Arc::clone(&self.trans_pages),
                collection_lock,
            );
            self.snapshots.insert(collection.to_string(), snapshot);
        }

        Ok(self
            .snapshots
            .get_mut(collection)
            .expect("inserted or present"))
    }

    /// Commits every snapshot atomically. See the module docs for the
    /// exact ordering.
    pub fn commit(mut self) -> Result<()> {
        self.disk.check_writer()?;

        let mut batch: Vec<(u32, Arc<PageBuffer>)> = Vec::new();

        {
            let mut header = self.header.lock();

            // pages given back by earlier rollbacks become durable empties
            let returned = self.monitor.take_returned_pages();
            for page_id in &returned {
                let buffer = self.disk.new_page()?;
                let mut base = BasePage::new(Arc::clone(&buffer), *page_id, PageType::Empty);
                base.next_page_id = header.free_empty_page_list;
                base.transaction_id = self.transaction_id;
                base.update_buffer();
                header.free_empty_page_list = *page_id;
                batch.push((*page_id, buffer));
            }

            let (deleted_pages, first_deleted, last_deleted) = {
                let trans = self.trans_pages.lock();
                (
                    trans.deleted_pages,
                    trans.first_deleted_page_id,
                    trans.last_deleted_page_id,
                )
            };

            // splice the private deleted chain onto the global free list
            if deleted_pages > 0 {
                debug_assert_ne!(first_deleted, PAGE_ID_NONE);
                let old_head = header.free_empty_page_list;
                if old_head != PAGE_ID_NONE {
                    let patched = self
                        .snapshots
                        .values_mut()
                        .any(|s| s.try_set_next_page_id(last_deleted, old_head));
                    debug_assert!(patched, "deleted tail must be a local page");
                }
                header.free_empty_page_list = first_deleted;
            }

            // catalog changes
            let (new_collections, deleted_collections) = {
                let mut trans = self.trans_pages.lock();
                (
                    std::mem::take(&mut trans.new_collections),
                    std::mem::take(&mut trans.deleted_collections),
                )
            };
            for (name, page_id) in &new_collections {
                header.insert_collection(name, *page_id)?;
            }
            for name in &deleted_collections {
                header.delete_collection(name)?;
            }

            for snapshot in self.snapshots.values_mut() {
                batch.extend(snapshot.take_dirty_pages()?);
            }

            let header_changed = !returned.is_empty()
                || deleted_pages > 0
                || !new_collections.is_empty()
                || !deleted_collections.is_empty()
                || !self.trans_pages.lock().new_pages.is_empty();

            if header_changed {
                header.base_mut().transaction_id = self.transaction_id;
                header.base_mut().is_confirmed = true;
                header.update_buffer()?;

                let copy = self.disk.new_page()?;
                copy.write_bytes()
                    .copy_from_slice(header.base().buffer().bytes());
                batch.push((HEADER_PAGE_ID, copy));

                // keep the live header clean for the next transaction
                header.base_mut().transaction_id = 0;
                header.base_mut().is_confirmed = false;
            } else if let Some((_, last)) = batch.last() {
                // confirm flag lives at byte 26 of the page header
                last.write_bytes()[26] = 1;
            }

            // the header stays locked through the publish: two commits may
            // both carry a header copy, and their WAL versions must follow
            // the order the copies were serialised in
            if !batch.is_empty() {
                let page_ids: SmallVec<[u32; 16]> = batch.iter().map(|(id, _)| *id).collect();
                let buffers: Vec<Arc<PageBuffer>> =
                    batch.into_iter().map(|(_, buffer)| buffer).collect();

                let positions = self.disk.write_async(buffers)?;
                self.disk.wait_writer()?;

                let pairs: Vec<(u32, u64)> = page_ids
                    .iter()
                    .copied()
                    .zip(positions.iter().copied())
                    .collect();
                self.wal.confirm_transaction(self.transaction_id, &pairs);
            }
        }

        self.finished = true;
        self.snapshots.clear();
        Ok(())
    }

    /// Abandons the transaction. Newly allocated pages are parked with the
    /// monitor; nothing is written.
    pub fn rollback(mut self) {
        self.rollback_internal();
    }

    fn rollback_internal(&mut self) {
        if self.finished {
            return;
        }
        let new_pages = std::mem::take(&mut self.trans_pages.lock().new_pages);
        if !new_pages.is_empty() {
            self.monitor.return_pages(new_pages);
        }
        self.snapshots.clear();
        self.finished = true;
    }

}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.rollback_internal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DataPage, MemoryStreamFactory, TypedPage};

    struct Env {
        disk: Arc<DiskService>,
        wal: Arc<WalIndex>,
        header: Arc<Mutex<HeaderPage>>,
        locks: Arc<LockService>,
        monitor: Arc<TransactionMonitor>,
    }

    fn env() -> Env {
        let disk =
            Arc::new(DiskService::new(Box::new(MemoryStreamFactory::new()), false).unwrap());
        let wal = Arc::new(WalIndex::new());
        disk.recover(0, &wal).unwrap();

        let buffer = disk.new_page().unwrap();
        let header = HeaderPage::new(BasePage::new(buffer, HEADER_PAGE_ID, PageType::Header));

        Env {
            disk,
            wal,
            header: Arc::new(Mutex::new(header)),
            locks: Arc::new(LockService::new(std::time::Duration::from_millis(100))),
            monitor: Arc::new(TransactionMonitor::new()),
        }
    }

    fn begin(env: &Env) -> Transaction {
        Transaction::new(
            Arc::clone(&env.disk),
            Arc::clone(&env.wal),
            Arc::clone(&env.header),
            Arc::clone(&env.locks),
            Arc::clone(&env.monitor),
        )
        .unwrap()
    }

    #[test]
    fn commit_publishes_pages_atomically() {
        let env = env();
        let mut txn = begin(&env);

        {
            let snapshot = txn.create_snapshot(LockMode::Write, "c").unwrap();
            snapshot.create_collection_page().unwrap();
            let page = snapshot.new_page::<DataPage>().unwrap();
            page.insert_block(b"payload").unwrap();
        }

        let before = env.wal.current_read_version();
        txn.commit().unwrap();
        let after = env.wal.current_read_version();

        assert_eq!(after, before + 1);
        // collection page, data page and the header confirm page are indexed
        assert!(env.wal.get_page_index(1, after).is_some());
        assert!(env.wal.get_page_index(2, after).is_some());
        assert!(env.wal.get_page_index(HEADER_PAGE_ID, after).is_some());
        assert_eq!(
            env.header.lock().get_collection_page_id("c"),
            Some(1)
        );
    }

    #[test]
    fn snapshot_reader_keeps_pre_commit_world() {
        let env = env();

        // writer commits one page
        let mut txn = begin(&env);
        {
            let snapshot = txn.create_snapshot(LockMode::Write, "c").unwrap();
            snapshot.create_collection_page().unwrap();
        }
        let sampled_before = env.wal.current_read_version();
        txn.commit().unwrap();

        // a reader that sampled before the publish resolves nothing
        assert_eq!(env.wal.get_page_index(1, sampled_before), None);
        assert!(env
            .wal
            .get_page_index(1, env.wal.current_read_version())
            .is_some());
    }

    #[test]
    fn rollback_parks_new_pages_for_next_commit() {
        let env = env();

        let mut txn = begin(&env);
        {
            let snapshot = txn.create_snapshot(LockMode::Write, "c").unwrap();
            snapshot.new_page::<DataPage>().unwrap();
            snapshot.new_page::<DataPage>().unwrap();
        }
        txn.rollback();

        assert_eq!(env.wal.current_read_version(), 0, "rollback writes nothing");

        // the next commit folds pages 1 and 2 onto the free list
        let mut txn = begin(&env);
        {
            let snapshot = txn.create_snapshot(LockMode::Write, "c").unwrap();
            snapshot.create_collection_page().unwrap();
        }
        txn.commit().unwrap();

        let header = env.header.lock();
        assert_ne!(header.free_empty_page_list, PAGE_ID_NONE);
        assert!(header.free_empty_page_list <= 2);
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let env = env();
        {
            let mut txn = begin(&env);
            let snapshot = txn.create_snapshot(LockMode::Write, "c").unwrap();
            snapshot.new_page::<DataPage>().unwrap();
        }
        assert_eq!(env.monitor.take_returned_pages(), vec![1]);
    }

    #[test]
    fn free_list_reuse_after_delete_commit() {
        let env = env();

        // allocate and delete a page in one committed transaction
        let mut txn = begin(&env);
        {
            let snapshot = txn.create_snapshot(LockMode::Write, "c").unwrap();
            snapshot.create_collection_page().unwrap();
            let page_id = {
                let page = snapshot.new_page::<DataPage>().unwrap();
                page.base().page_id
            };
            snapshot.delete_page(page_id).unwrap();
        }
        txn.commit().unwrap();

        let freed = env.header.lock().free_empty_page_list;
        assert_ne!(freed, PAGE_ID_NONE);

        // the next allocation pops that page instead of growing the file
        let last_before = env.header.lock().last_page_id;
        let mut txn = begin(&env);
        let reused = {
            let snapshot = txn.create_snapshot(LockMode::Write, "c2").unwrap();
            let page = snapshot.new_page::<DataPage>().unwrap();
            page.base().page_id
        };
        txn.commit().unwrap();

        assert_eq!(reused, freed);
        assert_eq!(env.header.lock().last_page_id, last_before);
    }
}
