//! # Page Codec and Slotted Layout
//!
//! Every 8KB page begins with a 32-byte header followed by a slotted body.
//! Variable-length segments grow upward from the header; a table of 4-byte
//! slot entries grows downward from the end of the page.
//!
//! ## Page Header Layout (32 bytes)
//!
//! ```text
//! Offset  Size  Field               Description
//! ------  ----  ------------------  ----------------------------------------
//! 0       4     page_id             Page number (home position / PAGE_SIZE)
//! 4       1     page_type           Empty, Header, Collection, Data, Index
//! 5       4     prev_page_id        Backward link in the page's list
//! 9       4     next_page_id        Forward link in the page's list
//! 13      2     items_count         Live segments in this page
//! 15      2     used_bytes          Bytes used by live segments
//! 17      2     fragmented_bytes    Dead bytes between live segments
//! 19      2     next_free_position  Where the next segment would start
//! 21      1     highest_index       Highest live slot index (0xFF = none)
//! 22      4     transaction_id      Writing transaction (log copies only)
//! 26      1     is_confirmed        Commit confirmation marker
//! 27      4     col_id              Owning collection page id
//! 31      1     page_list_slot      Free-space slot membership (0xFF = none)
//! ```
//!
//! ## Slot Table
//!
//! Slot `i` lives at `PAGE_SIZE - (i + 1) * 4` and holds
//! `(offset: u16, length: u16)`. A zeroed entry is an empty slot. Segments
//! are addressed from outside the page as [`PageAddress`] = `(page_id,
//! slot index)`; slot byte `0xFF` is the empty address.
//!
//! ## Fragmentation
//!
//! Removing a segment that is not the last one leaves a hole counted by
//! `fragmented_bytes`. When a new segment does not fit the continuous free
//! region but does fit the total free bytes, the body is defragmented in
//! place before insertion.

use std::fmt;
use std::sync::Arc;

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::buffer::PageBuffer;
use crate::config::{
    MAX_PAGE_ITEMS, PAGE_FREE_SIZE, PAGE_HEADER_SIZE, PAGE_ID_NONE, PAGE_SIZE, PAGE_SLOT_SIZE,
    SLOT_INDEX_NONE,
};
use crate::{Error, Result};

/// On-disk page kind tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Empty = 0,
    Header = 1,
    Collection = 2,
    Data = 3,
    Index = 4,
}

impl PageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PageType::Empty),
            1 => Some(PageType::Header),
            2 => Some(PageType::Collection),
            3 => Some(PageType::Data),
            4 => Some(PageType::Index),
            _ => None,
        }
    }
}

/// Address of a segment inside a page: `(page_id, slot index)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageAddress {
    pub page_id: u32,
    pub index: u8,
}

impl PageAddress {
    pub const SERIALIZED_SIZE: usize = 5;
    pub const EMPTY: PageAddress = PageAddress {
        page_id: PAGE_ID_NONE,
        index: SLOT_INDEX_NONE,
    };

    pub fn new(page_id: u32, index: u8) -> Self {
        Self { page_id, index }
    }

    pub fn is_empty(&self) -> bool {
        self.page_id == PAGE_ID_NONE && self.index == SLOT_INDEX_NONE
    }

    pub fn write_to(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.page_id.to_le_bytes());
        out[4] = self.index;
    }

    pub fn read_from(data: &[u8]) -> Self {
        Self {
            page_id: u32::from_le_bytes(data[..4].try_into().expect("5-byte address")),
            index: data[4],
        }
    }
}

macro_rules! fmt_page_address {
    () => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if self.is_empty() {
                write!(f, "(empty)")
            } else {
                write!(f, "{:04}:{:02}", self.page_id, self.index)
            }
        }
    };
}

impl fmt::Debug for PageAddress {
    fmt_page_address!();
}

impl fmt::Display for PageAddress {
    fmt_page_address!();
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PageHeader {
    page_id: U32,
    page_type: u8,
    prev_page_id: U32,
    next_page_id: U32,
    items_count: U16,
    used_bytes: U16,
    fragmented_bytes: U16,
    next_free_position: U16,
    highest_index: u8,
    transaction_id: U32,
    is_confirmed: u8,
    col_id: U32,
    page_list_slot: u8,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    crate::zerocopy_accessors! {
        page_id: u32,
        page_type: u8,
        prev_page_id: u32,
        next_page_id: u32,
        items_count: u16,
        used_bytes: u16,
        fragmented_bytes: u16,
        next_free_position: u16,
        highest_index: u8,
        transaction_id: u32,
        is_confirmed: u8,
        col_id: u32,
        page_list_slot: u8,
    }
}

/// Typed projection over a [`BasePage`]; implemented by the header,
/// collection, data, index and empty page views.
pub trait TypedPage: Sized {
    const PAGE_TYPE: PageType;

    /// Wraps a freshly initialised base page of the matching type.
    fn new(base: BasePage) -> Self;

    /// Parses a loaded base page; fails with `Corruption` on a tag or
    /// payload mismatch.
    fn load(base: BasePage) -> Result<Self>;

    fn base(&self) -> &BasePage;
    fn base_mut(&mut self) -> &mut BasePage;

    /// Unwraps the typed view back into its base page.
    fn into_base(self) -> BasePage;
}

/// A page materialised from a buffer: cached header fields plus the slotted
/// body codec. Header fields are parsed once at load and serialised back by
/// [`BasePage::update_buffer`] before the page goes to disk.
pub struct BasePage {
    buffer: Arc<PageBuffer>,
    pub page_id: u32,
    pub page_type: PageType,
    pub prev_page_id: u32,
    pub next_page_id: u32,
    pub items_count: u16,
    pub used_bytes: u16,
    pub fragmented_bytes: u16,
    pub next_free_position: u16,
    pub highest_index: u8,
    pub transaction_id: u32,
    pub is_confirmed: bool,
    pub col_id: u32,
    pub page_list_slot: u8,
    dirty: bool,
}

impl BasePage {
    /// Initialises a fresh page over a writable, zeroed buffer.
    pub fn new(buffer: Arc<PageBuffer>, page_id: u32, page_type: PageType) -> Self {
        debug_assert!(buffer.is_writable(), "new pages need a writable buffer");
        buffer.clear();

        Self {
            buffer,
            page_id,
            page_type,
            prev_page_id: PAGE_ID_NONE,
            next_page_id: PAGE_ID_NONE,
            items_count: 0,
            used_bytes: 0,
            fragmented_bytes: 0,
            next_free_position: PAGE_HEADER_SIZE as u16,
            highest_index: SLOT_INDEX_NONE,
            transaction_id: 0,
            is_confirmed: false,
            col_id: 0,
            page_list_slot: SLOT_INDEX_NONE,
            dirty: true,
        }
    }

    /// Parses a page from a shared or writable buffer.
    pub fn load(buffer: Arc<PageBuffer>) -> Result<Self> {
        let position = buffer.position();
        let header = PageHeader::ref_from_bytes(&buffer.bytes()[..PAGE_HEADER_SIZE])
            .map_err(|e| Error::corruption(position, format!("bad page header: {e:?}")))?;

        let page_type = PageType::from_byte(header.page_type()).ok_or_else(|| {
            Error::corruption(
                position,
                format!("invalid page type 0x{:02x}", header.page_type()),
            )
        })?;

        let next_free = header.next_free_position();
        if (next_free as usize) < PAGE_HEADER_SIZE || (next_free as usize) > PAGE_SIZE {
            return Err(Error::corruption(
                position,
                format!("next_free_position {next_free} out of bounds"),
            ));
        }
        if header.used_bytes() as usize > PAGE_FREE_SIZE {
            return Err(Error::corruption(
                position,
                format!("used_bytes {} out of bounds", header.used_bytes()),
            ));
        }

        let page = Self {
            page_id: header.page_id(),
            page_type,
            prev_page_id: header.prev_page_id(),
            next_page_id: header.next_page_id(),
            items_count: header.items_count(),
            used_bytes: header.used_bytes(),
            fragmented_bytes: header.fragmented_bytes(),
            next_free_position: next_free,
            highest_index: header.highest_index(),
            transaction_id: header.transaction_id(),
            is_confirmed: header.is_confirmed() != 0,
            col_id: header.col_id(),
            page_list_slot: header.page_list_slot(),
            dirty: false,
            buffer,
        };
        Ok(page)
    }

    pub fn buffer(&self) -> &Arc<PageBuffer> {
        &self.buffer
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    /// Serialises the cached header fields back into the buffer and returns
    /// it, ready for the disk writer.
    pub fn update_buffer(&mut self) -> &Arc<PageBuffer> {
        debug_assert!(self.buffer.is_writable(), "update_buffer on shared buffer");

        let bytes = self.buffer.write_bytes();
        let header =
            PageHeader::mut_from_bytes(&mut bytes[..PAGE_HEADER_SIZE]).expect("sized header");
        header.set_page_id(self.page_id);
        header.set_page_type(self.page_type as u8);
        header.set_prev_page_id(self.prev_page_id);
        header.set_next_page_id(self.next_page_id);
        header.set_items_count(self.items_count);
        header.set_used_bytes(self.used_bytes);
        header.set_fragmented_bytes(self.fragmented_bytes);
        header.set_next_free_position(self.next_free_position);
        header.set_highest_index(self.highest_index);
        header.set_transaction_id(self.transaction_id);
        header.set_is_confirmed(self.is_confirmed as u8);
        header.set_col_id(self.col_id);
        header.set_page_list_slot(self.page_list_slot);

        &self.buffer
    }

    // -------------------------------------------------------------------------
    // slot table
    // -------------------------------------------------------------------------

    fn slot_entry(&self, index: u8) -> (u16, u16) {
        let at = PAGE_SIZE - (index as usize + 1) * PAGE_SLOT_SIZE;
        let bytes = self.buffer.bytes();
        let offset = u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let length = u16::from_le_bytes([bytes[at + 2], bytes[at + 3]]);
        (offset, length)
    }

    fn set_slot_entry(&self, index: u8, offset: u16, length: u16) {
        let at = PAGE_SIZE - (index as usize + 1) * PAGE_SLOT_SIZE;
        let bytes = self.buffer.write_bytes();
        bytes[at..at + 2].copy_from_slice(&offset.to_le_bytes());
        bytes[at + 2..at + 4].copy_from_slice(&length.to_le_bytes());
    }

    fn slot_is_used(&self, index: u8) -> bool {
        self.highest_index != SLOT_INDEX_NONE
            && index <= self.highest_index
            && self.slot_entry(index) != (0, 0)
    }

    /// Bytes still available for one more segment, accounting for the slot
    /// table growing downward.
    pub fn free_bytes(&self) -> usize {
        if self.items_count as usize >= MAX_PAGE_ITEMS {
            return 0;
        }
        PAGE_FREE_SIZE - self.used_bytes as usize - self.footer_size()
    }

    fn footer_size(&self) -> usize {
        if self.highest_index == SLOT_INDEX_NONE {
            0
        } else {
            (self.highest_index as usize + 1) * PAGE_SLOT_SIZE
        }
    }

    /// Live slot indexes, ascending.
    pub fn used_indexes(&self) -> impl Iterator<Item = u8> + '_ {
        let upper = match self.highest_index {
            SLOT_INDEX_NONE => 0u16,
            h => h as u16 + 1,
        };
        (0..upper)
            .map(|i| i as u8)
            .filter(move |&i| self.slot_is_used(i))
    }

    // -------------------------------------------------------------------------
    // segments
    // -------------------------------------------------------------------------

    /// Read access to the segment at `index`.
    pub fn segment(&self, index: u8) -> Result<&[u8]> {
        if !self.slot_is_used(index) {
            return Err(Error::corruption(
                self.buffer.position(),
                format!("segment {index} not present in page {}", self.page_id),
            ));
        }
        let (offset, length) = self.slot_entry(index);
        Ok(&self.buffer.bytes()[offset as usize..(offset + length) as usize])
    }

    /// Write access to the segment at `index`; requires a writable buffer.
    pub fn segment_mut(&mut self, index: u8) -> Result<&mut [u8]> {
        if !self.slot_is_used(index) {
            return Err(Error::corruption(
                self.buffer.position(),
                format!("segment {index} not present in page {}", self.page_id),
            ));
        }
        let (offset, length) = self.slot_entry(index);
        self.dirty = true;
        Ok(&mut self.buffer.write_bytes()[offset as usize..(offset + length) as usize])
    }

    /// Allocates a segment of `length` bytes, returning its slot index.
    pub fn insert(&mut self, length: u16) -> Result<u8> {
        let index = self.next_free_index();
        self.insert_at(index, length)?;
        Ok(index)
    }

    fn next_free_index(&self) -> u8 {
        if self.highest_index == SLOT_INDEX_NONE {
            return 0;
        }
        for i in 0..=self.highest_index {
            if !self.slot_is_used(i) {
                return i;
            }
        }
        self.highest_index + 1
    }

    fn insert_at(&mut self, index: u8, length: u16) -> Result<u8> {
        debug_assert!(length > 0, "zero-length segment");
        debug_assert!(!self.slot_is_used(index), "slot {index} already used");

        let new_highest = match self.highest_index {
            SLOT_INDEX_NONE => index,
            h => h.max(index),
        };
        let footer = (new_highest as usize + 1) * PAGE_SLOT_SIZE;
        let total_free = PAGE_FREE_SIZE
            .saturating_sub(self.used_bytes as usize)
            .saturating_sub(footer);

        if (length as usize) > total_free || self.items_count as usize >= MAX_PAGE_ITEMS {
            return Err(Error::corruption(
                self.buffer.position(),
                format!(
                    "no space for {length} bytes in page {} (free {total_free})",
                    self.page_id
                ),
            ));
        }

        // compact if the continuous region cannot hold the segment
        if self.next_free_position as usize + length as usize > PAGE_SIZE - footer {
            self.defragment();
        }

        let offset = self.next_free_position;
        self.set_slot_entry(index, offset, length);
        self.next_free_position += length;
        self.used_bytes += length;
        self.items_count += 1;
        self.highest_index = new_highest;
        self.dirty = true;
        Ok(index)
    }

    /// Removes the segment at `index`.
    pub fn remove(&mut self, index: u8) -> Result<()> {
        if !self.slot_is_used(index) {
            return Err(Error::corruption(
                self.buffer.position(),
                format!("remove of absent segment {index} in page {}", self.page_id),
            ));
        }
        let (offset, length) = self.slot_entry(index);

        self.set_slot_entry(index, 0, 0);
        self.items_count -= 1;
        self.used_bytes -= length;

        if offset + length == self.next_free_position {
            self.next_free_position = offset;
        } else {
            self.fragmented_bytes += length;
        }

        if index == self.highest_index {
            self.highest_index = self
                .used_indexes()
                .last()
                .unwrap_or(SLOT_INDEX_NONE);
        }

        if self.items_count == 0 {
            self.highest_index = SLOT_INDEX_NONE;
            self.next_free_position = PAGE_HEADER_SIZE as u16;
            self.fragmented_bytes = 0;
            debug_assert_eq!(self.used_bytes, 0);
        }

        self.dirty = true;
        Ok(())
    }

    /// Resizes the segment at `index`, preserving its slot. Content is not
    /// preserved; callers rewrite the whole segment afterwards.
    pub fn update(&mut self, index: u8, length: u16) -> Result<()> {
        let (_, old) = self.slot_entry(index);
        if old == length {
            self.dirty = true;
            return Ok(());
        }
        self.remove(index)?;
        self.insert_at(index, length)?;
        Ok(())
    }

    /// Compacts live segments toward the page start, erasing fragmentation.
    fn defragment(&mut self) {
        let mut entries: Vec<(u8, u16, u16)> = self
            .used_indexes()
            .map(|i| {
                let (offset, length) = self.slot_entry(i);
                (i, offset, length)
            })
            .collect();
        entries.sort_by_key(|&(_, offset, _)| offset);

        // plan the moves first so the byte copies and the slot-table writes
        // never hold overlapping mutable borrows of the buffer
        let mut position = PAGE_HEADER_SIZE as u16;
        let mut moves: Vec<(u8, u16, u16, u16)> = Vec::with_capacity(entries.len());
        for (index, offset, length) in entries {
            if offset != position {
                moves.push((index, offset, position, length));
            }
            position += length;
        }

        {
            let bytes = self.buffer.write_bytes();
            for &(_, from, to, length) in &moves {
                bytes.copy_within(from as usize..(from + length) as usize, to as usize);
            }
        }
        for &(index, _, to, length) in &moves {
            self.set_slot_entry(index, to, length);
        }

        self.next_free_position = position;
        self.fragmented_bytes = 0;
        self.dirty = true;
    }
}

impl fmt::Debug for BasePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasePage")
            .field("page_id", &self.page_id)
            .field("page_type", &self.page_type)
            .field("items_count", &self.items_count)
            .field("used_bytes", &self.used_bytes)
            .field("free_bytes", &self.free_bytes())
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// An `Empty` page: a trimmed page waiting on the free list.
pub struct EmptyPage {
    base: BasePage,
}

impl TypedPage for EmptyPage {
    const PAGE_TYPE: PageType = PageType::Empty;

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

#[cfg(test)]
mod tests {
    use super::*;

    fn writable_buffer() -> Arc<PageBuffer> {
        let buf = Arc::new(PageBuffer::new());
        buf.mark_writable();
        buf
    }

    fn new_page(page_id: u32) -> BasePage {
        BasePage::new(writable_buffer(), page_id, PageType::Data)
    }

    #[test]
    fn header_round_trips_through_buffer() {
        let mut page = new_page(42);
        page.next_page_id = 43;
        page.col_id = 7;
        page.transaction_id = 99;
        page.is_confirmed = true;
        let buffer = Arc::clone(page.update_buffer());

        let loaded = BasePage::load(buffer).unwrap();
        assert_eq!(loaded.page_id, 42);
        assert_eq!(loaded.page_type, PageType::Data);
        assert_eq!(loaded.next_page_id, 43);
        assert_eq!(loaded.col_id, 7);
        assert_eq!(loaded.transaction_id, 99);
        assert!(loaded.is_confirmed);
    }

    #[test]
    fn header_layout_matches_wire_offsets() {
        let mut page = new_page(0x0102_0304);
        page.page_type = PageType::Index;
        page.transaction_id = 0x0A0B_0C0D;
        page.is_confirmed = true;
        page.page_list_slot = 3;
        let buffer = Arc::clone(page.update_buffer());

        let bytes = buffer.bytes();
        assert_eq!(&bytes[0..4], &0x0102_0304u32.to_le_bytes());
        assert_eq!(bytes[4], PageType::Index as u8);
        assert_eq!(&bytes[22..26], &0x0A0B_0C0Du32.to_le_bytes());
        assert_eq!(bytes[26], 1);
        assert_eq!(bytes[31], 3);
    }

    #[test]
    fn invalid_page_type_is_corruption() {
        let buf = writable_buffer();
        buf.write_bytes()[4] = 0x77;
        let err = BasePage::load(buf).unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
    }

    #[test]
    fn insert_and_read_segments() {
        let mut page = new_page(1);

        let a = page.insert(10).unwrap();
        let b = page.insert(20).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(page.items_count, 2);
        assert_eq!(page.used_bytes, 30);

        page.segment_mut(a).unwrap().fill(0xAA);
        page.segment_mut(b).unwrap().fill(0xBB);

        assert!(page.segment(a).unwrap().iter().all(|&b| b == 0xAA));
        assert_eq!(page.segment(b).unwrap().len(), 20);
    }

    #[test]
    fn remove_last_segment_reclaims_continuous_space() {
        let mut page = new_page(1);
        let _a = page.insert(10).unwrap();
        let b = page.insert(20).unwrap();
        let before = page.next_free_position;

        page.remove(b).unwrap();
        assert_eq!(page.next_free_position, before - 20);
        assert_eq!(page.fragmented_bytes, 0);
    }

    #[test]
    fn remove_middle_segment_fragments() {
        let mut page = new_page(1);
        let a = page.insert(10).unwrap();
        let _b = page.insert(20).unwrap();

        page.remove(a).unwrap();
        assert_eq!(page.fragmented_bytes, 10);
        assert_eq!(page.items_count, 1);
    }

    #[test]
    fn freed_slot_is_reused_first() {
        let mut page = new_page(1);
        let a = page.insert(8).unwrap();
        let _b = page.insert(8).unwrap();
        page.remove(a).unwrap();

        let c = page.insert(8).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn defragment_makes_room_for_large_segment() {
        let mut page = new_page(1);

        // fill with removable chunks, punch holes, then ask for a segment
        // larger than any continuous region
        let mut indexes = Vec::new();
        for _ in 0..8 {
            indexes.push(page.insert(900).unwrap());
        }
        for &i in indexes.iter().step_by(2) {
            page.remove(i).unwrap();
        }
        assert!(page.fragmented_bytes > 0);

        let free = page.free_bytes();
        assert!(free >= 3000);
        let big = page.insert(3000).unwrap();
        assert_eq!(page.segment(big).unwrap().len(), 3000);
        assert_eq!(page.fragmented_bytes, 0);
    }

    #[test]
    fn update_resizes_in_place_keeping_the_slot() {
        let mut page = new_page(1);
        let a = page.insert(40).unwrap();
        let b = page.insert(40).unwrap();

        page.update(a, 100).unwrap();
        assert_eq!(page.segment(a).unwrap().len(), 100);
        assert_eq!(page.segment(b).unwrap().len(), 40);
        assert_eq!(page.items_count, 2);

        // shrinking also keeps the slot index stable
        page.update(a, 10).unwrap();
        assert_eq!(page.segment(a).unwrap().len(), 10);
    }

    #[test]
    fn insert_refuses_when_full() {
        let mut page = new_page(1);
        while page.free_bytes() >= 1004 {
            page.insert(1000).unwrap();
        }
        assert!(page.insert(2000).is_err());
    }

    #[test]
    fn empty_page_resets_layout_counters() {
        let mut page = new_page(1);
        let a = page.insert(100).unwrap();
        let b = page.insert(100).unwrap();
        page.remove(a).unwrap();
        page.remove(b).unwrap();

        assert_eq!(page.items_count, 0);
        assert_eq!(page.used_bytes, 0);
        assert_eq!(page.fragmented_bytes, 0);
        assert_eq!(page.next_free_position as usize, PAGE_HEADER_SIZE);
        assert_eq!(page.highest_index, SLOT_INDEX_NONE);
    }

    #[test]
    fn page_address_serialization() {
        let addr = PageAddress::new(0xCAFE, 7);
        let mut buf = [0u8; PageAddress::SERIALIZED_SIZE];
        addr.write_to(&mut buf);
        assert_eq!(PageAddress::read_from(&buf), addr);
        assert!(PageAddress::EMPTY.is_empty());
    }
}
