//! # Index Page
//!
//! Stores skip-list nodes as slotted segments. Nodes are variable-length:
//!
//! ```text
//! Offset            Size  Field
//! ----------------  ----  ---------------------------------------------
//! 0                 1     slot        (catalog slot of the owning index)
//! 1                 1     levels      (1..=32 forward pointers)
//! 2                 5     data_block  (PageAddress of the document)
//! 7                 5     next_node   (per-document index-node chain)
//! 12                10×L  prev/next   (PageAddress pair per level)
//! 12 + 10×L         ...   key         (inline compact encoding)
//! ```
//!
//! Mutations patch the serialized node in place; the deserialized
//! [`IndexNode`] is a plain value whose links are refreshed by the caller
//! after each splice.

use smallvec::SmallVec;

use super::page::{BasePage, PageAddress, PageType, TypedPage};
use crate::bson::BsonValue;
use crate::config::MAX_LEVEL_LENGTH;
use crate::{Error, Result};

const P_SLOT: usize = 0;
const P_LEVELS: usize = 1;
const P_DATA_BLOCK: usize = 2;
const P_NEXT_NODE: usize = 7;
const P_PREV_NEXT: usize = 12;

fn key_offset(levels: u8) -> usize {
    P_PREV_NEXT + levels as usize * PageAddress::SERIALIZED_SIZE * 2
}

fn prev_offset(level: u8) -> usize {
    P_PREV_NEXT + level as usize * PageAddress::SERIALIZED_SIZE * 2
}

fn next_offset(level: u8) -> usize {
    prev_offset(level) + PageAddress::SERIALIZED_SIZE
}

/// Deserialized skip-list node. `prev`/`next` hold one address per level;
/// ownership of the bytes stays with the page, nodes carry only handles.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexNode {
    pub position: PageAddress,
    /// Catalog slot of the index this node belongs to.
    pub slot: u8,
    pub levels: u8,
    pub data_block: PageAddress,
    /// Single-linked chain of all index nodes of one document.
    pub next_node: PageAddress,
    pub prev: SmallVec<[PageAddress; 4]>,
    pub next: SmallVec<[PageAddress; 4]>,
    pub key: BsonValue,
}

impl IndexNode {
    /// Serialized size for a node of `levels` levels carrying `key`.
    pub fn bytes_length(levels: u8, key: &BsonValue) -> usize {
        key_offset(levels) + key.key_length()
    }
}

pub struct IndexPage {
    base: BasePage,
}

impl TypedPage for IndexPage {
    const PAGE_TYPE: PageType = PageType::Index;

    fn new(base: BasePage) -> Self {
        Self { base }
    }

    fn load(base: BasePage) -> Result<Self> {
        Ok(Self { base })
    }

    fn base(&self) -> &BasePage {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BasePage {
        &mut self.base
    }

    fn into_base(self) -> BasePage {
        self.base
    }
}

impl IndexPage {
    /// Writes a fresh node with empty links.
    pub fn insert_node(
        &mut self,
        slot: u8,
        levels: u8,
        key: &BsonValue,
        data_block: PageAddress,
    ) -> Result<IndexNode> {
        debug_assert!((1..=MAX_LEVEL_LENGTH).contains(&levels));

        let length = IndexNode::bytes_length(levels, key);
        let index = self.base.insert(length as u16)?;

        let mut key_bytes = Vec::with_capacity(key.key_length());
        key.write_key(&mut key_bytes)?;

        let segment = self.base.segment_mut(index)?;
        segment[P_SLOT] = slot;
        segment[P_LEVELS] = levels;
        data_block.write_to(&mut segment[P_DATA_BLOCK..P_NEXT_NODE]);
        PageAddress::EMPTY.write_to(&mut segment[P_NEXT_NODE..P_PREV_NEXT]);
        for level in 0..levels {
            let p = prev_offset(level);
            let n = next_offset(level);
            PageAddress::EMPTY.write_to(&mut segment[p..p + 5]);
            PageAddress::EMPTY.write_to(&mut segment[n..n + 5]);
        }
        let at = key_offset(levels);
        segment[at..at + key_bytes.len()].copy_from_slice(&key_bytes);

        self.get_node(index)
    }

    /// Deserializes the node at `index`.
    pub fn get_node(&self, index: u8) -> Result<IndexNode> {
        let page_id = self.base.page_id;
        let position = self.base.buffer().position();
        let segment = self.base.segment(index)?;

        let levels = segment[P_LEVELS];
        if levels == 0 || levels > MAX_LEVEL_LENGTH {
            return Err(Error::corruption(
                position,
                format!("index node level {levels} out of range"),
            ));
        }
        if segment.len() < key_offset(levels) + 1 {
            return Err(Error::corruption(position, "index node segment too short"));
        }

        let mut prev = SmallVec::with_capacity(levels as usize);
        let mut next = SmallVec::with_capacity(levels as usize);
        for level in 0..levels {
            let p = prev_offset(level);
            let n = next_offset(level);
            prev.push(PageAddress::read_from(&segment[p..p + 5]));
            next.push(PageAddress::read_from(&segment[n..n + 5]));
        }

        let (key, _) = BsonValue::read_key(&segment[key_offset(levels)..])?;

        Ok(IndexNode {
            position: PageAddress::new(page_id, index),
            slot: segment[P_SLOT],
            levels,
            data_block: PageAddress::read_from(&segment[P_DATA_BLOCK..P_NEXT_NODE]),
            next_node: PageAddress::read_from(&segment[P_NEXT_NODE..P_PREV_NEXT]),
            prev,
            next,
            key,
        })
    }

    pub fn set_prev(&mut self, index: u8, level: u8, addr: PageAddress) -> Result<()> {
        let segment = self.base.segment_mut(index)?;
        let p = prev_offset(level);
        addr.write_to(&mut segment[p..p + 5]);
        Ok(())
    }

    pub fn set_next(&mut self, index: u8, level: u8, addr: PageAddress) -> Result<()> {
        let segment = self.base.segment_mut(index)?;
        let n = next_offset(level);
        addr.write_to(&mut segment[n..n + 5]);
        Ok(())
    }

    pub fn set_next_node(&mut self, index: u8, addr: PageAddress) -> Result<()> {
        let segment = self.base.segment_mut(index)?;
        addr.write_to(&mut segment[P_NEXT_NODE..P_PREV_NEXT]);
        Ok(())
    }

    pub fn delete_node(&mut self, index: u8) -> Result<()> {
        self.base.remove(index)
    }
}
