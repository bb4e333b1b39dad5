//! # Snapshot
//!
//! Transactional view of one collection at a fixed `read_version`. Every
//! page the snapshot touches is materialised into a local map and stays
//! there until commit drains the dirty ones or drop releases the rest.
//!
//! ## Page resolution order
//!
//! ```text
//! 1. local page map                  (kept until commit or drop)
//! 2. WAL index at read_version       (committed log versions)
//! 3. data file at the home position
//! ```
//!
//! Pages read through the WAL get their `transaction_id`/`is_confirmed`
//! header fields zeroed in memory, so a re-log of the same page cannot
//! carry a stale confirmation.
//!
//! ## Allocation
//!
//! `new_page` pops the header's global free list or extends `last_page_id`
//! (bounded by the `LIMIT_SIZE` pragma), serialised by the header mutex.
//! Deleted pages go onto the transaction's private chain and only reach the
//! global free list at commit.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::pages::TransactionPages;
use crate::config::{FREE_PAGE_SLOTS, PAGE_ID_NONE, PAGE_SIZE, SLOT_INDEX_NONE};
use crate::locks::CollectionLock;
use crate::storage::{
    page_position, BasePage, CollectionPage, DataPage, DiskService, HeaderPage, Page, PageType,
    PageView, TypedPage, WalIndex, HEADER_PAGE_ID,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

pub struct Snapshot {
    mode: LockMode,
    collection_name: String,
    collection_page_id: Option<u32>,
    read_version: u32,
    transaction_id: u32,
    disk: Arc<DiskService>,
    wal: Arc<WalIndex>,
    header: Arc<Mutex<HeaderPage>>,
    trans_pages: Arc<Mutex<TransactionPages>>,
    local_pages: HashMap<u32, Page>,
    _collection_lock: Option<CollectionLock>,
}

impl Snapshot {
    /// Opens a snapshot over `collection_name`. Write mode carries the
    /// collection lock; the read version is sampled by the caller before
    /// any page is resolved.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: LockMode,
        collection_name: &str,
        read_version: u32,
        transaction_id: u32,
        disk: Arc<DiskService>,
        wal: Arc<WalIndex>,
        header: Arc<Mutex<HeaderPage>>,
        trans_pages: Arc<Mutex<TransactionPages>>,
        collection_lock: Option<CollectionLock>,
    ) -> Self {
        let collection_page_id = trans_pages
            .lock()
            .new_collection_page(collection_name)
            .or_else(|| header.lock().get_collection_page_id(collection_name));

        Self {
            mode,
            collection_name: collection_name.to_string(),
            collection_page_id,
            read_version,
            transaction_id,
            disk,
            wal,
            header,
            trans_pages,
            local_pages: HashMap::new(),
            _collection_lock: collection_lock,
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn read_version(&self) -> u32 {
        self.read_version
    }

    pub fn collection_page_id(&self) -> Option<u32> {
        self.collection_page_id
    }

    pub fn pages_in_use(&self) -> usize {
        self.local_pages.len()
    }

    // -------------------------------------------------------------------------
    // page materialisation
    // -------------------------------------------------------------------------

    /// Resolves `page_id` through the snapshot's resolution order and
    /// projects it as `T`, failing with `Corruption` on a type mismatch.
    pub fn get_page<T: PageView>(&mut self, page_id: u32) -> Result<&mut T> {
        self.fetch_page(page_id)?;
        let page = self
            .local_pages
            .get_mut(&page_id)
            .expect("fetch_page populated the map");

        let tag = page.base().page_type;
        T::project(page).ok_or_else(|| {
            Error::corruption(
                page_position(page_id),
                format!("expected {:?} page, found {tag:?}", T::PAGE_TYPE),
            )
        })
    }

    fn fetch_page(&mut self, page_id: u32) -> Result<()> {
        if self.local_pages.contains_key(&page_id) {
            return Ok(());
        }

        let (position, from_log) = self.resolve_position(page_id);
        let writable = self.mode == LockMode::Write;
        let buffer = self.disk.read_page(position, writable)?;

        let mut base = match BasePage::load(Arc::clone(&buffer)) {
            Ok(base) => base,
            Err(error) => {
                if writable {
                    self.disk.discard_page(buffer);
                } else {
                    self.disk.release_page(&buffer);
                }
                return Err(error);
            }
        };

        if base.page_id != page_id {
            let found = base.page_id;
            drop(base);
            if writable {
                self.disk.discard_page(buffer);
            } else {
                self.disk.release_page(&buffer);
            }
            return Err(Error::corruption(
                position,
                format!("expected page {page_id}, found {found}"),
            ));
        }

        if from_log {
            // log copies carry the writing transaction's stamp; it must not
            // leak into this transaction's own writes
            base.transaction_id = 0;
            base.is_confirmed = false;
        }

        let page = match Page::load(base) {
            Ok(page) => page,
            Err(error) => {
                if writable {
                    self.disk.discard_page(buffer);
                } else {
                    self.disk.release_page(&buffer);
                }
                return Err(error);
            }
        };

        self.local_pages.insert(page_id, page);
        self.trans_pages.lock().transaction_size += 1;
        Ok(())
    }

    fn resolve_position(&self, page_id: u32) -> (u64, bool) {
        if let Some(position) = self.wal.get_page_index(page_id, self.read_version) {
            return (position, true);
        }
        (page_position(page_id), false)
    }

    /// The collection page of this snapshot's collection.
    pub fn collection_page(&mut self) -> Result<&mut CollectionPage> {
        let page_id = self
            .collection_page_id
            .ok_or_else(|| Error::NotFound(self.collection_name.clone()))?;
        self.get_page::<CollectionPage>(page_id)
    }

    // -------------------------------------------------------------------------
    // allocation
    // -------------------------------------------------------------------------

    /// Creates a typed page, reusing the global free list when possible and
    /// extending the file otherwise.
    pub fn new_page<T: PageView>(&mut self) -> Result<&mut T> {
        debug_assert!(self.mode == LockMode::Write, "allocation in a read snapshot");

        let col_id = self.collection_page_id.unwrap_or(0);
        let (page_id, base) = {
            let mut header = self.header.lock();

            if header.free_empty_page_list != PAGE_ID_NONE {
                let page_id = header.free_empty_page_list;
                // the live free list is newer than this snapshot's read
                // version; the freed page must be read at the version that
                // freed it, which nobody else can reference any more
                let position = self
                    .wal
                    .get_page_index(page_id, self.wal.current_read_version())
                    .unwrap_or_else(|| page_position(page_id));
                let buffer = self.disk.read_page(position, true)?;
                let free_page = BasePage::load(Arc::clone(&buffer))?;

                if free_page.page_type != PageType::Empty {
                    self.disk.discard_page(buffer);
                    return Err(Error::corruption(
                        position,
                        format!("free list points at a {:?} page", free_page.page_type),
                    ));
                }

                header.free_empty_page_list = free_page.next_page_id;
                header.base_mut().set_dirty();

                (page_id, BasePage::new(buffer, page_id, T::PAGE_TYPE))
            } else {
                let page_id = header.last_page_id + 1;
                let limit = header.pragmas.limit_size;
                if page_position(page_id) + PAGE_SIZE as u64 > limit {
                    return Err(Error::DataSizeExceeded { limit });
                }

                header.last_page_id = page_id;
                header.base_mut().set_dirty();
                self.disk.ensure_data_region(page_id);

                let buffer = self.disk.new_page()?;
                (page_id, BasePage::new(buffer, page_id, T::PAGE_TYPE))
            }
        };

        let mut base = base;
        base.col_id = col_id;
        base.set_dirty();

        {
            let mut trans = self.trans_pages.lock();
            trans.new_pages.push(page_id);
            trans.transaction_size += 1;
        }

        self.local_pages.insert(page_id, T::new(base).wrap());
        let page = self.local_pages.get_mut(&page_id).expect("just inserted");
        Ok(T::project(page).expect("freshly wrapped variant"))
    }

    /// Registers a freshly created collection page for `name`. The header
    /// learns about it at commit.
    pub fn create_collection_page(&mut self) -> Result<u32> {
        debug_assert!(self.collection_page_id.is_none());

        let page_id = {
            let page = self.new_page::<CollectionPage>()?;
            page.base().page_id
        };
        // the collection page is its own owner
        self.get_page::<CollectionPage>(page_id)?.base_mut().col_id = page_id;

        self.collection_page_id = Some(page_id);
        self.trans_pages
            .lock()
            .new_collections
            .push((self.collection_name.clone(), page_id));
        Ok(page_id)
    }

    /// Queues this snapshot's collection for removal from the header at
    /// commit. The caller has already chained the collection's pages onto
    /// the deleted list.
    pub fn schedule_drop_collection(&mut self) {
        let mut trans = self.trans_pages.lock();
        if let Some(at) = trans
            .new_collections
            .iter()
            .position(|(n, _)| n == &self.collection_name)
        {
            // created and dropped inside one transaction: the header never
            // needs to hear about it
            trans.new_collections.remove(at);
        } else {
            trans.deleted_collections.push(self.collection_name.clone());
        }
        drop(trans);
        self.collection_page_id = None;
    }

    /// Empties a page and appends it to the transaction's private deleted
    /// chain.
    pub fn delete_page(&mut self, page_id: u32) -> Result<()> {
        self.fetch_page(page_id)?;

        let previous_tail = {
            let trans = self.trans_pages.lock();
            trans.last_deleted_page_id
        };

        let page = self
            .local_pages
            .remove(&page_id)
            .expect("fetched before delete");
        let mut base = page.into_base();

        // strip the page down to an empty chain node
        loop {
            let index = match base.used_indexes().next() {
                Some(index) => index,
                None => break,
            };
            base.remove(index)?;
        }
        base.page_type = PageType::Empty;
        base.col_id = 0;
        base.page_list_slot = SLOT_INDEX_NONE;
        base.prev_page_id = previous_tail;
        base.next_page_id = PAGE_ID_NONE;
        base.set_dirty();

        self.local_pages
            .insert(page_id, crate::storage::EmptyPage::new(base).wrap());

        {
            let mut trans = self.trans_pages.lock();
            if trans.first_deleted_page_id == PAGE_ID_NONE {
                trans.first_deleted_page_id = page_id;
            }
            trans.last_deleted_page_id = page_id;
            trans.deleted_pages += 1;
        }

        if previous_tail != PAGE_ID_NONE {
            let tail = self.get_page::<crate::storage::EmptyPage>(previous_tail)?;
            tail.base_mut().next_page_id = page_id;
            tail.base_mut().set_dirty();
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // free-space slots (data pages)
    // -------------------------------------------------------------------------

    /// Bucket a data page with `free_bytes` remaining belongs to.
    pub fn free_index_slot(free_bytes: usize) -> u8 {
        FREE_PAGE_SLOTS
            .iter()
            .position(|&threshold| free_bytes >= threshold)
            .expect("slot table ends at 0") as u8
    }

    /// Slot to start searching for `length` bytes, or `None` when only a
    /// fresh page can guarantee the fit.
    fn minimum_index_slot(length: usize) -> Option<u8> {
        match Self::free_index_slot(length) {
            0 => None,
            slot => Some(slot - 1),
        }
    }

    /// Returns a data page guaranteed to fit `length` body bytes: walks the
    /// free-space lists from the tightest guaranteeing slot toward slot 0,
    /// then falls back to a fresh page.
    pub fn get_free_data_page(&mut self, length: usize) -> Result<u32> {
        let start_slot = Self::minimum_index_slot(length);

        if let Some(start) = start_slot {
            let lists = self.collection_page()?.free_data_page_list;
            for slot in (0..=start).rev() {
                let head = lists[slot as usize];
                if head != PAGE_ID_NONE {
                    return Ok(head);
                }
            }
        }

        let page_id = {
            let page = self.new_page::<DataPage>()?;
            page.base().page_id
        };
        Ok(page_id)
    }

    /// Re-buckets a data page after its free count changed; empty pages are
    /// unlinked and deleted.
    pub fn add_or_remove_free_data_list(&mut self, page_id: u32) -> Result<()> {
        let (items_count, free_bytes, current_slot) = {
            let page = self.get_page::<DataPage>(page_id)?;
            let base = page.base();
            (base.items_count, base.free_bytes(), base.page_list_slot)
        };

        if items_count == 0 {
            if current_slot != SLOT_INDEX_NONE {
                self.remove_from_data_list(page_id, current_slot)?;
            }
            return self.delete_page(page_id);
        }

        let new_slot = Self::free_index_slot(free_bytes);
        if new_slot == current_slot {
            return Ok(());
        }

        if current_slot != SLOT_INDEX_NONE {
            self.remove_from_data_list(page_id, current_slot)?;
        }
        self.add_to_data_list(page_id, new_slot)
    }

    fn add_to_data_list(&mut self, page_id: u32, slot: u8) -> Result<()> {
        let old_head = {
            let collection = self.collection_page()?;
            let old_head = collection.free_data_page_list[slot as usize];
            collection.free_data_page_list[slot as usize] = page_id;
            collection.base_mut().set_dirty();
            old_head
        };

        {
            let page = self.get_page::<DataPage>(page_id)?;
            let base = page.base_mut();
            base.prev_page_id = PAGE_ID_NONE;
            base.next_page_id = old_head;
            base.page_list_slot = slot;
            base.set_dirty();
        }

        if old_head != PAGE_ID_NONE {
            let head = self.get_page::<DataPage>(old_head)?;
            head.base_mut().prev_page_id = page_id;
            head.base_mut().set_dirty();
        }
        Ok(())
    }

    fn remove_from_data_list(&mut self, page_id: u32, slot: u8) -> Result<()> {
        let (prev, next) = {
            let page = self.get_page::<DataPage>(page_id)?;
            let base = page.base_mut();
            let links = (base.prev_page_id, base.next_page_id);
            base.prev_page_id = PAGE_ID_NONE;
            base.next_page_id = PAGE_ID_NONE;
            base.page_list_slot = SLOT_INDEX_NONE;
            base.set_dirty();
            links
        };

        if prev != PAGE_ID_NONE {
            let page = self.get_page::<DataPage>(prev)?;
            page.base_mut().next_page_id = next;
            page.base_mut().set_dirty();
        } else {
            let collection = self.collection_page()?;
            debug_assert_eq!(collection.free_data_page_list[slot as usize], page_id);
            collection.free_data_page_list[slot as usize] = next;
            collection.base_mut().set_dirty();
        }

        if next != PAGE_ID_NONE {
            let page = self.get_page::<DataPage>(next)?;
            page.base_mut().prev_page_id = prev;
            page.base_mut().set_dirty();
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // commit support
    // -------------------------------------------------------------------------

    /// Patches a local page's forward link, for the commit-time splice of
    /// the deleted chain onto the global free list. Returns false when the
    /// page is not local to this snapshot.
    pub fn try_set_next_page_id(&mut self, page_id: u32, next: u32) -> bool {
        match self.local_pages.get_mut(&page_id) {
            Some(page) => {
                page.base_mut().next_page_id = next;
                page.base_mut().set_dirty();
                true
            }
            None => false,
        }
    }

    /// Drains this snapshot's dirty pages for the commit batch: stamps the
    /// transaction id, serialises each page and hands its writable buffer
    /// over. The header page is never local, so it is never drained here.
    pub fn take_dirty_pages(&mut self) -> Result<Vec<(u32, Arc<crate::storage::PageBuffer>)>> {
        let mut batch = Vec::new();
        let transaction_id = self.transaction_id;

        let dirty_ids: Vec<u32> = self
            .local_pages
            .iter()
            .filter(|(_, page)| page.base().is_dirty())
            .map(|(&id, _)| id)
            .collect();

        for page_id in dirty_ids {
            debug_assert_ne!(page_id, HEADER_PAGE_ID);
            let mut page = self.local_pages.remove(&page_id).expect("listed above");
            page.base_mut().transaction_id = transaction_id;
            page.base_mut().is_confirmed = false;
            page.update_buffer()?;
            batch.push((page_id, Arc::clone(page.base().buffer())));
        }
        Ok(batch)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        for (_, page) in self.local_pages.drain() {
            let buffer = Arc::clone(page.base().buffer());
            drop(page);
            if buffer.is_writable() {
                self.disk.discard_page(buffer);
            } else {
                self.disk.release_page(&buffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{IndexPage, MemoryStreamFactory};

    fn test_env() -> (Arc<DiskService>, Arc<WalIndex>, Arc<Mutex<HeaderPage>>) {
        let disk = Arc::new(
            DiskService::new(Box::new(MemoryStreamFactory::new()), false).unwrap(),
        );
        let wal = Arc::new(WalIndex::new());
        disk.recover(0, &wal).unwrap();

        let buffer = disk.new_page().unwrap();
        let header = HeaderPage::new(BasePage::new(buffer, HEADER_PAGE_ID, PageType::Header));
        (disk, wal, Arc::new(Mutex::new(header)))
    }

    fn write_snapshot(
        name: &str,
        disk: &Arc<DiskService>,
        wal: &Arc<WalIndex>,
        header: &Arc<Mutex<HeaderPage>>,
    ) -> Snapshot {
        Snapshot::new(
            LockMode::Write,
            name,
            wal.current_read_version(),
            1,
            Arc::clone(disk),
            Arc::clone(wal),
            Arc::clone(header),
            Arc::new(Mutex::new(TransactionPages::new())),
            None,
        )
    }

    #[test]
    fn new_page_extends_last_page_id() {
        let (disk, wal, header) = test_env();
        let mut snapshot = write_snapshot("c", &disk, &wal, &header);

        let first = snapshot.new_page::<DataPage>().unwrap().base().page_id;
        let second = snapshot.new_page::<IndexPage>().unwrap().base().page_id;

        assert_eq!((first, second), (1, 2));
        assert_eq!(header.lock().last_page_id, 2);
    }

    #[test]
    fn new_page_respects_limit_size() {
        let (disk, wal, header) = test_env();
        header.lock().pragmas.limit_size = 2 * PAGE_SIZE as u64;
        let mut snapshot = write_snapshot("c", &disk, &wal, &header);

        snapshot.new_page::<DataPage>().unwrap();
        assert!(matches!(
            snapshot.new_page::<DataPage>().err(),
            Some(Error::DataSizeExceeded { .. })
        ));
    }

    #[test]
    fn get_page_checks_the_type_tag() {
        let (disk, wal, header) = test_env();
        let mut snapshot = write_snapshot("c", &disk, &wal, &header);

        let page_id = snapshot.new_page::<DataPage>().unwrap().base().page_id;
        assert!(matches!(
            snapshot.get_page::<IndexPage>(page_id).err(),
            Some(Error::Corruption { .. })
        ));
    }

    #[test]
    fn deleted_pages_form_a_private_chain() {
        let (disk, wal, header) = test_env();
        let trans_pages = Arc::new(Mutex::new(TransactionPages::new()));
        let mut snapshot = Snapshot::new(
            LockMode::Write,
            "c",
            0,
            1,
            Arc::clone(&disk),
            Arc::clone(&wal),
            Arc::clone(&header),
            Arc::clone(&trans_pages),
            None,
        );

        let a = snapshot.new_page::<DataPage>().unwrap().base().page_id;
        let b = snapshot.new_page::<DataPage>().unwrap().base().page_id;
        snapshot.delete_page(a).unwrap();
        snapshot.delete_page(b).unwrap();

        let trans = trans_pages.lock();
        assert_eq!(trans.first_deleted_page_id, a);
        assert_eq!(trans.last_deleted_page_id, b);
        assert_eq!(trans.deleted_pages, 2);
        drop(trans);

        let first = snapshot.get_page::<crate::storage::EmptyPage>(a).unwrap();
        assert_eq!(first.base().next_page_id, b);
        assert_eq!(first.base().page_type, PageType::Empty);
    }

    #[test]
    fn free_slot_table_matches_thresholds() {
        assert_eq!(Snapshot::free_index_slot(8000), 0);
        assert_eq!(Snapshot::free_index_slot(1000), 0);
        assert_eq!(Snapshot::free_index_slot(999), 1);
        assert_eq!(Snapshot::free_index_slot(600), 1);
        assert_eq!(Snapshot::free_index_slot(300), 2);
        assert_eq!(Snapshot::free_index_slot(100), 3);
        assert_eq!(Snapshot::free_index_slot(89), 4);
        assert_eq!(Snapshot::free_index_slot(0), 4);

        assert_eq!(Snapshot::minimum_index_slot(2000), None);
        assert_eq!(Snapshot::minimum_index_slot(700), Some(0));
        assert_eq!(Snapshot::minimum_index_slot(300), Some(1));
        assert_eq!(Snapshot::minimum_index_slot(10), Some(3));
    }

    #[test]
    fn data_list_membership_follows_free_bytes() {
        let (disk, wal, header) = test_env();
        let mut snapshot = write_snapshot("c", &disk, &wal, &header);
        snapshot.create_collection_page().unwrap();

        let page_id = snapshot.get_free_data_page(100).unwrap();
        {
            let page = snapshot.get_page::<DataPage>(page_id).unwrap();
            page.insert_block(&[1u8; 100]).unwrap();
        }
        snapshot.add_or_remove_free_data_list(page_id).unwrap();

        {
            let slot = snapshot.get_page::<DataPage>(page_id).unwrap().base().page_list_slot;
            assert_eq!(slot, 0, "nearly empty page sits in slot 0");
            let collection = snapshot.collection_page().unwrap();
            assert_eq!(collection.free_data_page_list[0], page_id);
        }

        // fill the page below the slot-0 threshold; it must migrate
        loop {
            let free = {
                let page = snapshot.get_page::<DataPage>(page_id).unwrap();
                page.base().free_bytes()
            };
            if free < 1000 {
                break;
            }
            let page = snapshot.get_page::<DataPage>(page_id).unwrap();
            page.insert_block(&[2u8; 500]).unwrap();
        }
        snapshot.add_or_remove_free_data_list(page_id).unwrap();

        let slot = snapshot.get_page::<DataPage>(page_id).unwrap().base().page_list_slot;
        assert!(slot >= 1, "page with little space left moved out of slot 0");
        let collection = snapshot.collection_page().unwrap();
        assert_eq!(collection.free_data_page_list[slot as usize], page_id);
        assert_eq!(collection.free_data_page_list[0], PAGE_ID_NONE);
    }

    #[test]
    fn emptied_data_page_is_deleted() {
        let (disk, wal, header) = test_env();
        let trans_pages = Arc::new(Mutex::new(TransactionPages::new()));
        let mut snapshot = Snapshot::new(
            LockMode::Write,
            "c",
            0,
            1,
            Arc::clone(&disk),
            Arc::clone(&wal),
            Arc::clone(&header),
            Arc::clone(&trans_pages),
            None,
        );
        snapshot.create_collection_page().unwrap();

        let page_id = snapshot.get_free_data_page(50).unwrap();
        let block = {
            let page = snapshot.get_page::<DataPage>(page_id).unwrap();
            page.insert_block(&[9u8; 50]).unwrap()
        };
        snapshot.add_or_remove_free_data_list(page_id).unwrap();

        {
            let page = snapshot.get_page::<DataPage>(page_id).unwrap();
            page.delete_block(block.index).unwrap();
        }
        snapshot.add_or_remove_free_data_list(page_id).unwrap();

        assert_eq!(trans_pages.lock().deleted_pages, 1);
        let collection = snapshot.collection_page().unwrap();
        assert!(collection.free_data_page_list.iter().all(|&l| l == PAGE_ID_NONE));
    }
}
