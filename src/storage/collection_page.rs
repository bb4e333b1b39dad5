//! # Collection Page
//!
//! One page per collection, holding the index catalog and the free-space
//! lists for the collection's data pages.
//!
//! ## Body layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ------------------------------------------------------
//! 32      20    free_data_page_list[5]  (head page ids, MAX = none)
//! 96      ...   index catalog: u8 count, then serialized CollectionIndex
//!               entries back to back
//! ```
//!
//! The five free-data lists partition this collection's data pages by
//! remaining free bytes (see `FREE_PAGE_SLOTS`). Index `0` is always the
//! primary-key index over `$._id`.

use super::page::{BasePage, PageAddress, PageType, TypedPage};
use crate::config::{MAX_INDEX_COUNT, MAX_LEVEL_LENGTH, PAGE_ID_NONE, PAGE_SIZE};
use crate::{Error, Result};

const P_FREE_DATA_PAGE_LIST: usize = 32;
const P_INDEXES: usize = 96;

/// Metadata of one index of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionIndex {
    /// Index name, unique within the collection.
    pub name: String,
    /// Key expression; only top-level `$.field` paths are supported.
    pub expr: String,
    pub unique: bool,
    /// Catalog slot, stamped into every node of this index.
    pub slot: u8,
    /// Head sentinel node (key = MinValue).
    pub head: PageAddress,
    /// Tail sentinel node (key = MaxValue).
    pub tail: PageAddress,
    /// Head of the linked list of index pages with node space left.
    pub free_index_page_list: u32,
    /// Highest level any node of this index currently has.
    pub max_level: u8,
    pub reserved: u8,
    /// Live (non-sentinel) nodes.
    pub key_count: u64,
}

impl CollectionIndex {
    pub fn new(slot: u8, name: &str, expr: &str, unique: bool) -> Self {
        Self {
            name: name.to_string(),
            expr: expr.to_string(),
            unique,
            slot,
            head: PageAddress::EMPTY,
            tail: PageAddress::EMPTY,
            free_index_page_list: PAGE_ID_NONE,
            max_level: 1,
            reserved: 0,
            key_count: 0,
        }
    }

    fn serialized_len(&self) -> usize {
        1 + 1 + 1 + 1 + 5 + 5 + 4 + 1 + 8 + 1 + self.name.len() + 1 + self.expr.len()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.slot);
        out.push(self.unique as u8);
        out.push(self.max_level);
        out.push(self.reserved);
        let mut addr = [0u8; PageAddress::SERIALIZED_SIZE];
        self.head.write_to(&mut addr);
        out.extend_from_slice(&addr);
        self.tail.write_to(&mut addr);
        out.extend_from_slice(&addr);
        out.extend_from_slice(&self.free_index_page_list.to_le_bytes());
        out.push(0); // reserved tail byte kept for layout stability
        out.extend_from_slice(&self.key_count.to_le_bytes());
        out.push(self.name.len() as u8);
        out.extend_from_slice(self.name.as_bytes());
        out.push(self.expr.len() as u8);
        out.extend_from_slice(self.expr.as_bytes());
    }

    fn read_from(data: &[u8], position: u64) -> Result<(Self, usize)> {
        let corrupt = |message: &str| Error::corruption(position, message.to_string());

        if data.len() < 27 {
            return Err(corrupt("truncated index entry"));
        }
        let slot = data[0];
        let unique = data[1] != 0;
        let max_level = data[2];
        if max_level == 0 || max_level > MAX_LEVEL_LENGTH {
            return Err(corrupt("index max_level out of range"));
        }
        let reserved = data[3];
        let head = PageAddress::read_from(&data[4..9]);
        let tail = PageAddress::read_from(&data[9..14]);
        let free_index_page_list = u32::from_le_bytes(data[14..18].try_into().unwrap());
        let key_count = u64::from_le_bytes(data[19..27].try_into().unwrap());

        let mut pos = 27;
        let name_len = *data.get(pos).ok_or_else(|| corrupt("truncated name"))? as usize;
        pos += 1;
        let name = data
            .get(pos..pos + name_len)
            .ok_or_else(|| corrupt("truncated name"))?;
        let name = std::str::from_utf8(name)
            .map_err(|_| corrupt("index name is not utf-8"))?
            .to_string();
        pos += name_len;
        let expr_len = *data.get(pos).ok_or_else(|| corrupt("truncated expr"))? as usize;
        pos += 1;
        let expr = data
            .get(pos..pos + expr_len)
            .ok_or_else(|| corrupt("truncated expr"))?;
        let expr = std::str::from_utf8(expr)
            .map_err(|_| corrupt("index expr is not utf-8"))?
            .to_string();
        pos += expr_len;

        Ok((
            Self {
                name,
                expr,
                unique,
                slot,
                head,
                tail,
                free_index_page_list,
                max_level,
                reserved,
                key_count,
            },
            pos,
        ))
    }
}

/// Catalog page of one collection.
pub struct CollectionPage {
    base: BasePage,
    /// Free-space lists partitioning data pages by remaining free bytes.
    pub free_data_page_list: [u32; 5],
    indexes: Vec<CollectionIndex>,
}

impl TypedPage for CollectionPage {
    const PAGE_TYPE: PageType = PageType::Collection;

    fn new(base: BasePage) -> Self {
        Self {
            base,
            free_data_page_list: [PAGE_ID_NONE; 5],
            indexes: Vec::new(),
        }
    }

    fn load(base: BasePage) -> Result<Self> {
        let position = base.buffer().position();
        let bytes = base.buffer().bytes();

        let mut free_data_page_list = [PAGE_ID_NONE; 5];
        for (i, list) in free_data_page_list.iter_mut().enumerate() {
            let at = P_FREE_DATA_PAGE_LIST + i * 4;
            *list = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        }

        let count = bytes[P_INDEXES] as usize;
        let mut indexes = Vec::with_capacity(count);
        let mut pos = P_INDEXES + 1;
        for _ in 0..count {
            let (index, used) = CollectionIndex::read_from(&bytes[pos..], position)?;
            indexes.push(index);
            pos += used;
        }

        Ok(Self {
            base,
            free_data_page_list,
            indexes,
        })
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

impl CollectionPage {
    /// The primary-key index (`$._id`), always at slot 0.
    pub fn pk_index(&self) -> &CollectionIndex {
        &self.indexes[0]
    }

    pub fn get_collection_index(&self, name: &str) -> Option<&CollectionIndex> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn get_collection_index_mut(&mut self, name: &str) -> Option<&mut CollectionIndex> {
        self.base.set_dirty();
        self.indexes.iter_mut().find(|i| i.name == name)
    }

    pub fn get_index_by_slot(&self, slot: u8) -> Option<&CollectionIndex> {
        self.indexes.iter().find(|i| i.slot == slot)
    }

    pub fn get_index_by_slot_mut(&mut self, slot: u8) -> Option<&mut CollectionIndex> {
        self.base.set_dirty();
        self.indexes.iter_mut().find(|i| i.slot == slot)
    }

    pub fn indexes(&self) -> impl Iterator<Item = &CollectionIndex> {
        self.indexes.iter()
    }

    /// Registers a new index, allocating the next catalog slot.
    pub fn insert_collection_index(
        &mut self,
        name: &str,
        expr: &str,
        unique: bool,
    ) -> Result<&mut CollectionIndex> {
        if self.get_collection_index(name).is_some() {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        if self.indexes.len() >= MAX_INDEX_COUNT {
            return Err(Error::InvalidIndexKey(format!(
                "collection is limited to {MAX_INDEX_COUNT} indexes"
            )));
        }
        if name.len() > u8::MAX as usize || expr.len() > u8::MAX as usize {
            return Err(Error::InvalidIndexKey(
                "index name/expression longer than 255 bytes".into(),
            ));
        }

        let slot = self.indexes.iter().map(|i| i.slot + 1).max().unwrap_or(0);
        let index = CollectionIndex::new(slot, name, expr, unique);

        let used: usize = self.indexes.iter().map(|i| i.serialized_len()).sum();
        if P_INDEXES + 1 + used + index.serialized_len() > PAGE_SIZE {
            return Err(Error::DataSizeExceeded {
                limit: (PAGE_SIZE - P_INDEXES) as u64,
            });
        }

        self.indexes.push(index);
        self.base.set_dirty();
        Ok(self.indexes.last_mut().expect("just pushed"))
    }

    pub fn remove_collection_index(&mut self, name: &str) -> Result<CollectionIndex> {
        let at = self
            .indexes
            .iter()
            .position(|i| i.name == name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        self.base.set_dirty();
        Ok(self.indexes.remove(at))
    }

    /// Serialises lists and catalog back into the buffer.
    pub fn update_buffer(&mut self) -> Result<()> {
        let mut catalog = Vec::with_capacity(256);
        catalog.push(self.indexes.len() as u8);
        for index in &self.indexes {
            index.write_to(&mut catalog);
        }
        if P_INDEXES + catalog.len() > PAGE_SIZE {
            return Err(Error::DataSizeExceeded {
                limit: (PAGE_SIZE - P_INDEXES) as u64,
            });
        }

        let bytes = self.base.buffer().write_bytes();
        for (i, list) in self.free_data_page_list.iter().enumerate() {
            let at = P_FREE_DATA_PAGE_LIST + i * 4;
            bytes[at..at + 4].copy_from_slice(&list.to_le_bytes());
        }
        bytes[P_INDEXES..P_INDEXES + catalog.len()].copy_from_slice(&catalog);

        self.base.update_buffer();
        Ok(())
    }
}
