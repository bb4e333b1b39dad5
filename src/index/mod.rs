//! # Index Service
//!
//! Skip lists over page-addressed nodes. Every index of a collection is a
//! doubly linked list per level between two sentinel nodes (`MinValue`
//! head, `MaxValue` tail), strictly ordered by key under the collection's
//! collation:
//!
//! ```text
//! level 2:  head ──────────────▶ n3 ─────────────▶ tail
//! level 1:  head ─────▶ n1 ────▶ n3 ─────────────▶ tail
//! level 0:  head ─▶ n0 ▶ n1 ▶ n2 ▶ n3 ▶ n4 ──────▶ tail
//! ```
//!
//! Node levels come from [`IndexService::flip`]: the smallest zero bit of a
//! uniform random draw, which yields the geometric distribution a skip
//! list wants. All link mutations go through the snapshot's page cache;
//! nodes carry only `PageAddress` handles, never references.

use std::cmp::Ordering;

use hashbrown::HashSet;
use smallvec::{smallvec, SmallVec};

use crate::bson::BsonValue;
use crate::collation::Collation;
use crate::config::{
    INDEX_RESERVED_BYTES, MAX_INDEX_KEY_LENGTH, MAX_LEVEL_LENGTH, PAGE_ID_NONE, SLOT_INDEX_NONE,
};
use crate::storage::{CollectionIndex, IndexNode, IndexPage, PageAddress, TypedPage};
use crate::transaction::Snapshot;
use crate::{Error, Result};

/// Iteration / sibling direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

pub struct IndexService<'a> {
    snapshot: &'a mut Snapshot,
    collation: Collation,
}

impl<'a> IndexService<'a> {
    pub fn new(snapshot: &'a mut Snapshot, collation: Collation) -> Self {
        Self {
            snapshot,
            collation,
        }
    }

    pub fn snapshot(&mut self) -> &mut Snapshot {
        self.snapshot
    }

    /// Smallest `k` such that bit `k` of a uniform random u32 is zero,
    /// plus one; capped at [`MAX_LEVEL_LENGTH`]. P(level = n) = 2^-n.
    pub fn flip() -> u8 {
        let random: u32 = rand::random();
        ((random.trailing_ones() as u8) + 1).min(MAX_LEVEL_LENGTH)
    }

    // -------------------------------------------------------------------------
    // index lifecycle
    // -------------------------------------------------------------------------

    /// Registers an index and builds its sentinel pair.
    pub fn create_index(&mut self, name: &str, expr: &str, unique: bool) -> Result<CollectionIndex> {
        let slot = {
            let collection = self.snapshot.collection_page()?;
            collection.insert_collection_index(name, expr, unique)?.slot
        };

        let head = self.insert_raw_node(
            slot,
            MAX_LEVEL_LENGTH,
            &BsonValue::MinValue,
            PageAddress::EMPTY,
        )?;
        let tail = self.insert_raw_node(
            slot,
            MAX_LEVEL_LENGTH,
            &BsonValue::MaxValue,
            PageAddress::EMPTY,
        )?;

        for level in 0..MAX_LEVEL_LENGTH {
            self.set_next(head, level, tail)?;
            self.set_prev(tail, level, head)?;
        }

        let collection = self.snapshot.collection_page()?;
        let index = collection
            .get_index_by_slot_mut(slot)
            .expect("slot registered above");
        index.head = head;
        index.tail = tail;
        Ok(index.clone())
    }

    /// Drops the whole collection: every index page, every data page, the
    /// catalog page, and the header entry at commit.
    pub fn drop_collection(&mut self) -> Result<()> {
        let collection_page_id = {
            let collection = self.snapshot.collection_page()?;
            collection.base().page_id
        };

        // index pages: reachable through every index's level-0 chain
        let mut index_pages: HashSet<u32> = HashSet::new();
        let heads: Vec<PageAddress> = {
            let collection = self.snapshot.collection_page()?;
            collection.indexes().map(|i| i.head).collect()
        };
        for head in heads {
            let mut current = head;
            while !current.is_empty() {
                index_pages.insert(current.page_id);
                current = self.get_node(current)?.next[0];
            }
        }

        // data pages: every data page sits in exactly one free-space slot
        let mut data_pages: Vec<u32> = Vec::new();
        let lists = self.snapshot.collection_page()?.free_data_page_list;
        for mut head in lists {
            while head != PAGE_ID_NONE {
                data_pages.push(head);
                let page = self.snapshot.get_page::<crate::storage::DataPage>(head)?;
                head = page.base().next_page_id;
            }
        }

        for page_id in index_pages {
            self.snapshot.delete_page(page_id)?;
        }
        for page_id in data_pages {
            self.snapshot.delete_page(page_id)?;
        }
        self.snapshot.delete_page(collection_page_id)?;
        self.snapshot.schedule_drop_collection();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // node insertion
    // -------------------------------------------------------------------------

    /// Inserts `key` into `index_name`, linking the per-document chain
    /// through `last`. Fails with `IndexDuplicateKey` on a unique index
    /// that already holds the key.
    pub fn add(
        &mut self,
        index_name: &str,
        key: &BsonValue,
        data_block: PageAddress,
        last: Option<PageAddress>,
    ) -> Result<IndexNode> {
        if key.is_min_or_max() {
            return Err(Error::InvalidIndexKey(
                "MinValue/MaxValue keys are reserved for sentinels".into(),
            ));
        }
        if key.key_length() > MAX_INDEX_KEY_LENGTH {
            return Err(Error::InvalidIndexKey(format!(
                "key of {} bytes exceeds the {MAX_INDEX_KEY_LENGTH}-byte limit",
                key.key_length()
            )));
        }

        let index = self
            .snapshot
            .collection_page()?
            .get_collection_index(index_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(index_name.to_string()))?;

        let levels = Self::flip();
        if levels > index.max_level {
            let collection = self.snapshot.collection_page()?;
            collection
                .get_index_by_slot_mut(index.slot)
                .expect("index exists")
                .max_level = levels;
        }
        let walk_levels = index.max_level.max(levels);

        // descend from the head, remembering the rightmost node with a
        // smaller key at every level we will link into
        let mut path: SmallVec<[PageAddress; 8]> = smallvec![index.head; levels as usize];
        let mut current_addr = index.head;
        let mut current = self.get_node(current_addr)?;

        for level in (0..walk_levels).rev() {
            loop {
                let next_addr = current.next[level as usize];
                let next = self.get_node(next_addr)?;

                match next.key.compare(key, &self.collation) {
                    Ordering::Less => {
                        current_addr = next_addr;
                        current = next;
                    }
                    Ordering::Equal if index.unique => {
                        return Err(Error::IndexDuplicateKey {
                            index: index.name.clone(),
                        });
                    }
                    _ => break,
                }
            }
            if level < levels {
                path[level as usize] = current_addr;
            }
        }

        let node_addr = self.insert_raw_node(index.slot, levels, key, data_block)?;

        for level in 0..levels {
            let left = path[level as usize];
            let right = self.get_node(left)?.next[level as usize];

            self.set_prev(node_addr, level, left)?;
            self.set_next(node_addr, level, right)?;
            self.set_next(left, level, node_addr)?;
            self.set_prev(right, level, node_addr)?;
        }

        if let Some(last) = last {
            self.set_next_node(last, node_addr)?;
        }

        {
            let collection = self.snapshot.collection_page()?;
            collection
                .get_index_by_slot_mut(index.slot)
                .expect("index exists")
                .key_count += 1;
        }

        self.get_node(node_addr)
    }

    // -------------------------------------------------------------------------
    // node deletion
    // -------------------------------------------------------------------------

    /// Unlinks and deletes one node, returning its decoded form (the
    /// caller follows `next_node` to reach the document's other nodes).
    pub fn delete_single(&mut self, node_addr: PageAddress) -> Result<IndexNode> {
        let node = self.get_node(node_addr)?;

        for level in 0..node.levels {
            let prev = node.prev[level as usize];
            let next = node.next[level as usize];
            if !prev.is_empty() {
                self.set_next(prev, level, next)?;
            }
            if !next.is_empty() {
                self.set_prev(next, level, prev)?;
            }
        }

        self.snapshot
            .get_page::<IndexPage>(node_addr.page_id)?
            .delete_node(node_addr.index)?;

        {
            let collection = self.snapshot.collection_page()?;
            let index = collection
                .get_index_by_slot_mut(node.slot)
                .expect("node belongs to a live index");
            index.key_count = index.key_count.saturating_sub(1);
        }

        self.update_free_index_list(node_addr.page_id, node.slot)?;
        Ok(node)
    }

    /// Deletes every index node of one document, starting from its
    /// primary-key node.
    pub fn delete_all(&mut self, pk_node: PageAddress) -> Result<()> {
        let mut current = pk_node;
        while !current.is_empty() {
            let node = self.delete_single(current)?;
            current = node.next_node;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // lookup
    // -------------------------------------------------------------------------

    /// Exact lookup; on a miss with `sibling`, the adjacent node in
    /// `order`, or `None` at the ends of the list.
    pub fn find(
        &mut self,
        index: &CollectionIndex,
        key: &BsonValue,
        sibling: bool,
        order: Order,
    ) -> Result<Option<IndexNode>> {
        let mut current_addr = index.head;
        let mut current = self.get_node(current_addr)?;

        for level in (0..index.max_level).rev() {
            loop {
                let next_addr = current.next[level as usize];
                let next = self.get_node(next_addr)?;
                if next.key.compare(key, &self.collation) == Ordering::Less {
                    current_addr = next_addr;
                    current = next;
                } else {
                    break;
                }
            }
        }

        let candidate_addr = current.next[0];
        let candidate = self.get_node(candidate_addr)?;

        if candidate.key.compare(key, &self.collation) == Ordering::Equal {
            return Ok(Some(candidate));
        }
        if !sibling {
            return Ok(None);
        }

        match order {
            Order::Ascending => {
                // the candidate is the first node above the key
                if candidate.key == BsonValue::MaxValue {
                    Ok(None)
                } else {
                    Ok(Some(candidate))
                }
            }
            Order::Descending => {
                if current_addr == index.head {
                    Ok(None)
                } else {
                    Ok(Some(current))
                }
            }
        }
    }

    /// Every non-sentinel node, in key order.
    pub fn find_all(&mut self, index: &CollectionIndex, order: Order) -> Result<Vec<IndexNode>> {
        let mut nodes = Vec::new();
        let (start, end) = match order {
            Order::Ascending => (index.head, index.tail),
            Order::Descending => (index.tail, index.head),
        };

        let mut current = self.get_node(start)?;
        loop {
            let next_addr = match order {
                Order::Ascending => current.next[0],
                Order::Descending => current.prev[0],
            };
            if next_addr == end || next_addr.is_empty() {
                break;
            }
            let node = self.get_node(next_addr)?;
            current = node.clone();
            nodes.push(node);
        }
        Ok(nodes)
    }

    pub fn get_node(&mut self, addr: PageAddress) -> Result<IndexNode> {
        self.snapshot
            .get_page::<IndexPage>(addr.page_id)?
            .get_node(addr.index)
    }

    // -------------------------------------------------------------------------
    // page plumbing
    // -------------------------------------------------------------------------

    fn insert_raw_node(
        &mut self,
        slot: u8,
        levels: u8,
        key: &BsonValue,
        data_block: PageAddress,
    ) -> Result<PageAddress> {
        let page_id = self.get_free_index_page(slot)?;
        let addr = {
            let page = self.snapshot.get_page::<IndexPage>(page_id)?;
            page.insert_node(slot, levels, key, data_block)?.position
        };
        self.update_free_index_list(page_id, slot)?;
        Ok(addr)
    }

    /// A page guaranteed to fit any node: the index's free-list head, or a
    /// fresh page.
    fn get_free_index_page(&mut self, slot: u8) -> Result<u32> {
        let head = {
            let collection = self.snapshot.collection_page()?;
            collection
                .get_index_by_slot(slot)
                .expect("caller registered the index")
                .free_index_page_list
        };

        if head != PAGE_ID_NONE {
            return Ok(head);
        }
        let page = self.snapshot.new_page::<IndexPage>()?;
        Ok(page.base().page_id)
    }

    /// Re-evaluates a page's free-list membership after node churn. Pages
    /// with room for the largest node stay listed; emptied pages die.
    fn update_free_index_list(&mut self, page_id: u32, slot: u8) -> Result<()> {
        let (items_count, free_bytes, listed_slot) = {
            let page = self.snapshot.get_page::<IndexPage>(page_id)?;
            let base = page.base();
            (base.items_count, base.free_bytes(), base.page_list_slot)
        };

        if items_count == 0 {
            if listed_slot != SLOT_INDEX_NONE {
                self.remove_from_index_list(page_id, listed_slot)?;
            }
            return self.snapshot.delete_page(page_id);
        }

        let belongs = free_bytes >= INDEX_RESERVED_BYTES;
        match (belongs, listed_slot) {
            (true, SLOT_INDEX_NONE) => self.add_to_index_list(page_id, slot),
            (false, listed) if listed != SLOT_INDEX_NONE => {
                self.remove_from_index_list(page_id, listed)
            }
            _ => Ok(()),
        }
    }

    fn add_to_index_list(&mut self, page_id: u32, slot: u8) -> Result<()> {
        let old_head = {
            let collection = self.snapshot.collection_page()?;
            let index = collection
                .get_index_by_slot_mut(slot)
                .expect("index exists");
            let old_head = index.free_index_page_list;
            index.free_index_page_list = page_id;
            old_head
        };

        {
            let page = self.snapshot.get_page::<IndexPage>(page_id)?;
            let base = page.base_mut();
            base.prev_page_id = PAGE_ID_NONE;
            base.next_page_id = old_head;
            base.page_list_slot = slot;
            base.set_dirty();
        }

        if old_head != PAGE_ID_NONE {
            let page = self.snapshot.get_page::<IndexPage>(old_head)?;
            page.base_mut().prev_page_id = page_id;
            page.base_mut().set_dirty();
        }
        Ok(())
    }

    fn remove_from_index_list(&mut self, page_id: u32, slot: u8) -> Result<()> {
        let (prev, next) = {
            let page = self.snapshot.get_page::<IndexPage>(page_id)?;
            let base = page.base_mut();
            let links = (base.prev_page_id, base.next_page_id);
            base.prev_page_id = PAGE_ID_NONE;
            base.next_page_id = PAGE_ID_NONE;
            base.page_list_slot = SLOT_INDEX_NONE;
            base.set_dirty();
            links
        };

        if prev != PAGE_ID_NONE {
            let page = self.snapshot.get_page::<IndexPage>(prev)?;
            page.base_mut().next_page_id = next;
            page.base_mut().set_dirty();
        } else {
            let collection = self.snapshot.collection_page()?;
            let index = collection
                .get_index_by_slot_mut(slot)
                .expect("index exists");
            debug_assert_eq!(index.free_index_page_list, page_id);
            index.free_index_page_list = next;
        }

        if next != PAGE_ID_NONE {
            let page = self.snapshot.get_page::<IndexPage>(next)?;
            page.base_mut().prev_page_id = prev;
            page.base_mut().set_dirty();
        }
        Ok(())
    }

    fn set_prev(&mut self, addr: PageAddress, level: u8, value: PageAddress) -> Result<()> {
        self.snapshot
            .get_page::<IndexPage>(addr.page_id)?
            .set_prev(addr.index, level, value)
    }

    fn set_next(&mut self, addr: PageAddress, level: u8, value: PageAddress) -> Result<()> {
        self.snapshot
            .get_page::<IndexPage>(addr.page_id)?
            .set_next(addr.index, level, value)
    }

    fn set_next_node(&mut self, addr: PageAddress, value: PageAddress) -> Result<()> {
        self.snapshot
            .get_page::<IndexPage>(addr.page_id)?
            .set_next_node(addr.index, value)
    }
}
