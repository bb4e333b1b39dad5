//! # Storage Layer
//!
//! Turns a byte-addressable stream into a transactional page store. The
//! layering, bottom to top:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  DiskService (read/write/checkpoint)         │
//! ├───────────────┬──────────────┬───────────────┤
//! │  MemoryCache  │  WalIndex    │ DiskWriterQueue│
//! ├───────────────┴──────────────┴───────────────┤
//! │  typed pages (header/collection/data/index)  │
//! ├──────────────────────────────────────────────┤
//! │  BasePage slotted codec over PageBuffer      │
//! ├──────────────────────────────────────────────┤
//! │  Stream (positional I/O + durability barrier)│
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## File layout
//!
//! ```text
//! offset 0                      : page 0 = header page
//! offset N × PAGE_SIZE          : data pages (N = 1 .. last_page_id)
//! offset (last_page_id+1) × PS… : log region, truncated at checkpoint
//! ```
//!
//! Every page has one home position `page_id * PAGE_SIZE`; the log region
//! stores additional versions of pages at positions >= `log_start_position`.
//! A page appended to the log carries the writing transaction id and stays
//! invisible to readers until a page of the same transaction with the
//! confirmed flag is durable.
//!
//! ## Buffer visibility
//!
//! `PageBuffer`s move between three states tracked by an atomic share
//! counter: free (0, pooled), readable (> 0, indexed by position) and
//! writable (the -1 sentinel, exclusively owned). The one-way transition
//! writable → readable happens only inside `MemoryCache::move_to_readable`.

mod buffer;
mod cache;
mod collection_page;
mod data_page;
mod disk;
mod header_page;
mod index_page;
mod page;
mod queue;
mod stream;
mod wal_index;

pub use buffer::{PageBuffer, BUFFER_WRITABLE, POSITION_NONE};
pub use cache::MemoryCache;
pub use collection_page::{CollectionIndex, CollectionPage};
pub use data_page::{DataBlock, DataPage};
pub use disk::DiskService;
pub use header_page::{EnginePragmas, HeaderPage, ENCRYPTION_NONE, HEADER_PAGE_ID};
pub use index_page::{IndexNode, IndexPage};
pub use page::{BasePage, EmptyPage, PageAddress, PageType, TypedPage};
pub use queue::DiskWriterQueue;
pub use stream::{
    FileStreamFactory, MemoryStreamFactory, PooledStream, Stream, StreamFactory, StreamPool,
};
pub use wal_index::WalIndex;

pub use crate::config::constants::{
    DATA_BLOCK_HEADER_SIZE, MAX_DATA_BYTES_PER_PAGE, PAGE_HEADER_SIZE, PAGE_ID_NONE, PAGE_SIZE,
    PAGE_SLOT_SIZE, SLOT_INDEX_NONE,
};

/// Home file position of a page.
#[inline]
pub fn page_position(page_id: u32) -> u64 {
    page_id as u64 * PAGE_SIZE as u64
}

/// Tagged variant over every page kind. Operations dispatch on the tag;
/// [`PageView::project`] is the type-checked projection that fails with
/// `Corruption` when the tag does not match the caller's expectation.
pub enum Page {
    Empty(EmptyPage),
    Header(HeaderPage),
    Collection(CollectionPage),
    Data(DataPage),
    Index(IndexPage),
}

impl Page {
    /// Wraps a loaded base page according to its type tag.
    pub fn load(base: BasePage) -> crate::Result<Page> {
        Ok(match base.page_type {
            PageType::Empty => Page::Empty(EmptyPage::load(base)?),
            PageType::Header => Page::Header(HeaderPage::load(base)?),
            PageType::Collection => Page::Collection(CollectionPage::load(base)?),
            PageType::Data => Page::Data(DataPage::load(base)?),
            PageType::Index => Page::Index(IndexPage::load(base)?),
        })
    }

    pub fn base(&self) -> &BasePage {
        match self {
            Page::Empty(p) => p.base(),
            Page::Header(p) => p.base(),
            Page::Collection(p) => p.base(),
            Page::Data(p) => p.base(),
            Page::Index(p) => p.base(),
        }
    }

    pub fn base_mut(&mut self) -> &mut BasePage {
        match self {
            Page::Empty(p) => p.base_mut(),
            Page::Header(p) => p.base_mut(),
            Page::Collection(p) => p.base_mut(),
            Page::Data(p) => p.base_mut(),
            Page::Index(p) => p.base_mut(),
        }
    }

    /// Serialises parsed state back into the page buffer before a write.
    pub fn update_buffer(&mut self) -> crate::Result<()> {
        match self {
            Page::Header(p) => p.update_buffer(),
            Page::Collection(p) => p.update_buffer(),
            Page::Empty(p) => {
                p.base_mut().update_buffer();
                Ok(())
            }
            Page::Data(p) => {
                p.base_mut().update_buffer();
                Ok(())
            }
            Page::Index(p) => {
                p.base_mut().update_buffer();
                Ok(())
            }
        }
    }

    /// Unwraps the base page, dropping the typed view.
    pub fn into_base(self) -> BasePage {
        match self {
            Page::Empty(p) => p.into_base(),
            Page::Header(p) => p.into_base(),
            Page::Collection(p) => p.into_base(),
            Page::Data(p) => p.into_base(),
            Page::Index(p) => p.into_base(),
        }
    }
}

/// Typed projection in and out of the [`Page`] variant.
pub trait PageView: TypedPage {
    fn wrap(self) -> Page;
    fn project(page: &mut Page) -> Option<&mut Self>;
}

macro_rules! impl_page_view {
    ($ty:ident, $variant:ident) => {
        impl PageView for $ty {
            fn wrap(self) -> Page {
                Page::$variant(self)
            }

            fn project(page: &mut Page) -> Option<&mut Self> {
                match page {
                    Page::$variant(p) => Some(p),
                    _ => None,
                }
            }
        }
    };
}

impl_page_view!(EmptyPage, Empty);
impl_page_view!(HeaderPage, Header);
impl_page_view!(CollectionPage, Collection);
impl_page_view!(DataPage, Data);
impl_page_view!(IndexPage, Index);
