//! # Engine Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (8192 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (32 bytes, fixed layout)
//!       │
//!       ├─> PAGE_SLOT_SIZE (4 bytes per footer slot entry)
//!       │
//!       └─> MAX_DATA_BYTES_PER_PAGE (derived: one maximal data block)
//!
//! CACHE_SEGMENT_SIZE (1000 buffers)
//!       │
//!       └─> MAX_CACHE_SEGMENTS
//!             Beyond this many segments the cache evicts unreferenced
//!             readable buffers instead of allocating.
//!
//! FREE_PAGE_SLOTS ([1000, 600, 250, 90, 0])
//!       │
//!       └─> Buckets data pages by remaining free bytes. Slot 0 holds the
//!           emptiest pages; slot 4 holds nearly-full pages. Allocation
//!           starts at the largest slot index whose threshold still
//!           guarantees the requested length.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `FREE_PAGE_SLOTS` thresholds are strictly decreasing and end at 0.
//! 2. `MAX_INDEX_KEY_LENGTH` + the largest node header fits a single page
//!    segment.
//! 3. `MAX_LEVEL_LENGTH` fits the `u8` level field of an index node.

/// Size of each database page in bytes. This is the fundamental unit of
/// I/O, caching, and the log.
pub const PAGE_SIZE: usize = 8192;

/// Size of the fixed page header at the start of every page.
pub const PAGE_HEADER_SIZE: usize = 32;

/// Size of one footer slot entry: `(offset: u16, length: u16)`.
pub const PAGE_SLOT_SIZE: usize = 4;

/// Usable body bytes between the header and an empty footer.
pub const PAGE_FREE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Upper bound on live slot entries in a single page.
pub const MAX_PAGE_ITEMS: usize = 255;

/// Serialized size of a data block header (`length: u16` + next address).
pub const DATA_BLOCK_HEADER_SIZE: usize = 7;

/// Largest single data block payload a page can carry: full body minus one
/// footer slot entry and the data block header.
pub const MAX_DATA_BYTES_PER_PAGE: usize =
    PAGE_FREE_SIZE - PAGE_SLOT_SIZE - DATA_BLOCK_HEADER_SIZE;

/// Sentinel for "no page" in linked page lists.
pub const PAGE_ID_NONE: u32 = u32::MAX;

/// Sentinel for an empty slot byte inside a `PageAddress`.
pub const SLOT_INDEX_NONE: u8 = u8::MAX;

const _: () = assert!(PAGE_HEADER_SIZE == 32, "page header layout is fixed");

// ============================================================================
// FREE-SPACE SLOT TABLE
// ============================================================================

/// Minimum free bytes a data page must keep to belong to each slot.
/// Strictly decreasing; the final 0 catches nearly-full pages.
pub const FREE_PAGE_SLOTS: [usize; 5] = [1000, 600, 250, 90, 0];

const _: () = assert!(
    FREE_PAGE_SLOTS[0] > FREE_PAGE_SLOTS[1]
        && FREE_PAGE_SLOTS[1] > FREE_PAGE_SLOTS[2]
        && FREE_PAGE_SLOTS[2] > FREE_PAGE_SLOTS[3]
        && FREE_PAGE_SLOTS[3] > FREE_PAGE_SLOTS[4]
        && FREE_PAGE_SLOTS[4] == 0,
    "free-space slots must be strictly decreasing and end at 0"
);

// ============================================================================
// INDEX / SKIP LIST
// ============================================================================

/// Maximum number of forward pointers an index node may carry.
pub const MAX_LEVEL_LENGTH: u8 = 32;

/// Maximum serialized length of an index key in bytes.
pub const MAX_INDEX_KEY_LENGTH: usize = 1024;

/// Maximum number of indexes per collection (the index slot is a u8).
pub const MAX_INDEX_COUNT: usize = 255;

/// Free bytes an index page must keep to stay on a free-index-page list.
/// Covers the largest possible node (32 levels + a maximal key) plus its
/// slot entry.
pub const INDEX_RESERVED_BYTES: usize = 1400;

// ============================================================================
// MEMORY CACHE
// ============================================================================

/// Number of page buffers allocated per cache segment.
pub const CACHE_SEGMENT_SIZE: usize = 1000;

/// Segment ceiling; past this the cache evicts instead of growing.
pub const MAX_CACHE_SEGMENTS: usize = 10;

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// Pages a single transaction may hold before callers should split work.
/// Counted by `TransactionPages::transaction_size`.
pub const MAX_TRANSACTION_SIZE: u32 = 100_000;

/// Default lock-wait timeout in seconds (`TIMEOUT` pragma).
pub const DEFAULT_TIMEOUT: u64 = 60;

/// Default log pages before an automatic checkpoint (`CHECKPOINT` pragma).
/// 0 disables automatic checkpoints.
pub const DEFAULT_CHECKPOINT_SIZE: u32 = 1000;

/// Collections map payload budget inside the header page.
pub const HEADER_COLLECTIONS_SIZE: usize = 8000;
