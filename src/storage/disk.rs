//! # Disk Service
//!
//! Composes the stream pool, memory cache and disk writer queue, and owns
//! the log-region positions:
//!
//! ```text
//! log_start_position   first byte of the log region, fixed at open to
//!                      (last_page_id + 1) * PAGE_SIZE
//! log_end_position     bump-allocated by write_async, one fetch_add per page
//! data_region_end      grows as the allocator extends last_page_id; log
//!                      offsets that collide with it are skipped
//! ```
//!
//! ## Crash recovery
//!
//! [`DiskService::recover`] scans the log region page by page, groups pages
//! by transaction id and publishes to the WAL index only the transactions
//! whose confirm page was reached by the scan. The log end is truncated to
//! the last confirmed page; unconfirmed tails and corrupt pages simply
//! vanish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;

use super::buffer::PageBuffer;
use super::cache::MemoryCache;
use super::header_page::ENCRYPTION_NONE;
use super::page::PageType;
use super::queue::DiskWriterQueue;
use super::stream::{StreamFactory, StreamPool};
use super::wal_index::WalIndex;
use super::{page_position, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::{Error, Result};

pub struct DiskService {
    pool: StreamPool,
    cache: Arc<MemoryCache>,
    queue: DiskWriterQueue,
    log_start_position: AtomicU64,
    log_end_position: AtomicU64,
    data_region_end: AtomicU64,
    is_new: bool,
}

impl DiskService {
    /// Opens (or creates) the data file. A zero-length stream means a brand
    /// new database; otherwise the first byte is checked for the encryption
    /// marker before any page is parsed.
    pub fn new(factory: Box<dyn StreamFactory>, password_supplied: bool) -> Result<Self> {
        let pool = StreamPool::new(factory)?;

        let length = pool.writer().lock().length()?;
        let is_new = length == 0;

        if !is_new {
            let mut marker = [0u8; 1];
            pool.writer().lock().read_exact_at(0, &mut marker)?;
            if marker[0] != ENCRYPTION_NONE {
                // the cipher lives in an external stream wrapper; without it
                // the file cannot be opened at all
                return Err(if password_supplied {
                    Error::WrongPassword
                } else {
                    Error::EncryptionRequired
                });
            }
        }

        let queue = DiskWriterQueue::new(Arc::clone(pool.writer()));

        Ok(Self {
            pool,
            cache: Arc::new(MemoryCache::new()),
            queue,
            log_start_position: AtomicU64::new(0),
            log_end_position: AtomicU64::new(0),
            data_region_end: AtomicU64::new(0),
            is_new,
        })
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    pub fn log_start_position(&self) -> u64 {
        self.log_start_position.load(Ordering::Acquire)
    }

    pub fn log_end_position(&self) -> u64 {
        self.log_end_position.load(Ordering::Acquire)
    }

    /// Log length in pages, for the auto-checkpoint trigger.
    pub fn log_length_pages(&self) -> u32 {
        ((self.log_end_position() - self.log_start_position()) / PAGE_SIZE as u64) as u32
    }

    /// Marks everything up to `last_page_id`'s home position as data
    /// territory; log offsets never land inside it.
    pub fn ensure_data_region(&self, last_page_id: u32) {
        let end = page_position(last_page_id) + PAGE_SIZE as u64;
        self.data_region_end.fetch_max(end, Ordering::AcqRel);
    }

    /// Re-raises any latched background-write failure.
    pub fn check_writer(&self) -> Result<()> {
        self.queue.check()
    }

    /// Blocks until every enqueued page is durable.
    pub fn wait_writer(&self) -> Result<()> {
        self.queue.wait()
    }

    // -------------------------------------------------------------------------
    // page reads
    // -------------------------------------------------------------------------

    /// Reads the page at `position` into the cache; `writable` chooses the
    /// buffer state handed back.
    pub fn read_page(&self, position: u64, writable: bool) -> Result<Arc<PageBuffer>> {
        debug_assert_eq!(position % PAGE_SIZE as u64, 0, "unaligned page read");

        let factory = |position: u64, buf: &mut [u8]| -> Result<()> {
            let mut reader = self.pool.rent_reader()?;
            reader.get().read_exact_at(position, buf)
        };

        if writable {
            self.cache.get_writable_page(position, factory)
        } else {
            self.cache.get_readable_page(position, factory)
        }
    }

    /// Fresh zeroed writable buffer with no assigned position.
    pub fn new_page(&self) -> Result<Arc<PageBuffer>> {
        self.cache.new_page()
    }

    pub fn release_page(&self, buffer: &Arc<PageBuffer>) {
        self.cache.release_page(buffer);
    }

    pub fn discard_page(&self, buffer: Arc<PageBuffer>) {
        self.cache.discard_page(buffer);
    }

    // -------------------------------------------------------------------------
    // log writes
    // -------------------------------------------------------------------------

    /// Appends `buffers` to the log asynchronously. Each buffer gets an
    /// atomically assigned log position (skipping positions the data region
    /// has since claimed), becomes readable, and is handed to the writer
    /// queue. Returns the assigned positions, in order.
    pub fn write_async(&self, buffers: Vec<Arc<PageBuffer>>) -> Result<Vec<u64>> {
        self.queue.check()?;

        let mut positions = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            debug_assert!(buffer.is_writable(), "write_async takes writable buffers");

            let position = loop {
                let candidate = self
                    .log_end_position
                    .fetch_add(PAGE_SIZE as u64, Ordering::AcqRel);
                if candidate >= self.data_region_end.load(Ordering::Acquire) {
                    break candidate;
                }
                // the data region swallowed this offset; leave a hole and
                // take the next one
            };

            buffer.set_position(position);
            self.cache.move_to_readable(&buffer);
            self.queue.enqueue(buffer)?;
            positions.push(position);
        }
        Ok(positions)
    }

    /// Synchronous positioned writes with a durability barrier, used by the
    /// checkpoint and by header bootstrap.
    pub fn write_direct(&self, pages: &[(u64, &[u8])]) -> Result<()> {
        let mut writer = self.pool.writer().lock();
        for (position, bytes) in pages {
            debug_assert_eq!(bytes.len(), PAGE_SIZE);
            writer.write_all_at(*position, bytes)?;
        }
        writer.flush_to_disk()
    }

    /// Copies confirmed log pages to their home positions (checkpoint
    /// body). Pages are buffered first so a home position that overlaps a
    /// not-yet-copied log page cannot clobber it.
    pub fn checkpoint_copy(&self, entries: &[(u32, u64)]) -> Result<()> {
        let mut pages: Vec<(u64, Box<[u8]>)> = Vec::with_capacity(entries.len());
        {
            let mut reader = self.pool.rent_reader()?;
            for &(page_id, log_position) in entries {
                let mut bytes = vec![0u8; PAGE_SIZE].into_boxed_slice();
                reader.get().read_exact_at(log_position, &mut bytes)?;
                pages.push((page_position(page_id), bytes));
            }
        }

        let refs: Vec<(u64, &[u8])> = pages
            .iter()
            .map(|(position, bytes)| (*position, bytes.as_ref()))
            .collect();
        self.write_direct(&refs)
    }

    /// Collapses the log region to empty at the current data-region end,
    /// optionally truncating the file. Dropped cache entries ensure stale
    /// log positions cannot be re-read.
    pub fn reset_log_position(&self, crop: bool) -> Result<()> {
        let position = self.data_region_end.load(Ordering::Acquire);
        self.log_start_position.store(position, Ordering::Release);
        self.log_end_position.store(position, Ordering::Release);
        self.cache.clear_readable();

        if crop {
            self.pool.writer().lock().set_length(position)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // crash recovery
    // -------------------------------------------------------------------------

    /// Initialises the log positions for `last_page_id` and replays the log
    /// region into `wal`. Returns the number of confirmed transactions.
    pub fn recover(&self, last_page_id: u32, wal: &WalIndex) -> Result<usize> {
        let log_start = page_position(last_page_id) + PAGE_SIZE as u64;
        self.data_region_end.store(log_start, Ordering::Release);
        self.log_start_position.store(log_start, Ordering::Release);

        let length = self.pool.writer().lock().length()?;
        let mut reader = self.pool.rent_reader()?;

        let mut transactions: HashMap<u32, Vec<(u32, u64)>> = HashMap::new();
        let mut confirmed_order: Vec<u32> = Vec::new();
        let mut last_confirmed_end = log_start;

        let mut position = log_start;
        while position + PAGE_SIZE as u64 <= length {
            let mut header = [0u8; PAGE_HEADER_SIZE];
            reader.get().read_exact_at(position, &mut header)?;

            let page_id = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let transaction_id = u32::from_le_bytes(header[22..26].try_into().unwrap());
            let is_confirmed = header[26] != 0;

            if PageType::from_byte(header[4]).is_none() {
                // corrupt page: the healthy log ends at the previous
                // confirmed boundary
                break;
            }

            // holes left by skipped log offsets carry transaction id 0
            if transaction_id != 0 {
                transactions
                    .entry(transaction_id)
                    .or_default()
                    .push((page_id, position));

                if is_confirmed {
                    confirmed_order.push(transaction_id);
                    last_confirmed_end = position + PAGE_SIZE as u64;
                }
            }

            position += PAGE_SIZE as u64;
        }

        for transaction_id in &confirmed_order {
            if let Some(pages) = transactions.remove(transaction_id) {
                wal.confirm_transaction(*transaction_id, &pages);
            }
        }

        self.log_end_position
            .store(last_confirmed_end, Ordering::Release);

        // crop unconfirmed pages so later appends cannot resurrect them
        if length > last_confirmed_end {
            self.pool.writer().lock().set_length(last_confirmed_end)?;
        }

        Ok(confirmed_order.len())
    }

    /// Stops the background writer. Called once on engine close.
    pub fn shutdown(&mut self) {
        self.queue.shutdown();
    }
}
