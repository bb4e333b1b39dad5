//! # Memory Cache
//!
//! Multi-segment pool of [`PageBuffer`]s indexed by file position. Buffers
//! move between three visibility states:
//!
//! - **free**: pooled, `ShareCounter == 0`, not indexed
//! - **readable**: indexed by position, one share per concurrent reader
//! - **writable**: exclusively owned by one transaction, never indexed
//!
//! ## Growth and eviction
//!
//! Storage is a sequence of pre-allocated segments. When the free pool runs
//! dry a new segment is added, up to a configured ceiling; past it the cache
//! reclaims unreferenced readable entries in timestamp order. The timestamp
//! is a monotonic tick, bumped on every acquisition.
//!
//! ## Writable copies
//!
//! `get_writable_page` never shares bytes with readers: if a readable buffer
//! exists at the position, its content is snapshotted into a fresh buffer
//! under a momentary reader share. The reverse transition happens only in
//! [`MemoryCache::move_to_readable`], leaving the single share the caller
//! (the disk writer queue) then releases.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use super::buffer::{PageBuffer, POSITION_NONE};
use crate::config::{CACHE_SEGMENT_SIZE, MAX_CACHE_SEGMENTS};
use crate::Result;

pub struct MemoryCache {
    free: Mutex<Vec<Arc<PageBuffer>>>,
    readable: RwLock<HashMap<u64, Arc<PageBuffer>>>,
    segments: AtomicUsize,
    tick: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        let cache = Self {
            free: Mutex::new(Vec::with_capacity(CACHE_SEGMENT_SIZE)),
            readable: RwLock::new(HashMap::new()),
            segments: AtomicUsize::new(0),
            tick: AtomicU64::new(1),
        };
        cache.add_segment();
        cache
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the readable buffer at `position`, reading it through
    /// `factory` on a miss. The returned buffer carries one extra share the
    /// caller must release.
    pub fn get_readable_page<F>(&self, position: u64, factory: F) -> Result<Arc<PageBuffer>>
    where
        F: FnOnce(u64, &mut [u8]) -> Result<()>,
    {
        if let Some(buffer) = self.try_get_shared(position) {
            return Ok(buffer);
        }

        let buffer = self.get_free_buffer()?;
        buffer.mark_writable();
        buffer.set_position(position);
        if let Err(error) = factory(position, buffer.write_bytes()) {
            buffer.reset_free();
            self.return_free(buffer);
            return Err(error);
        }

        // publish; lose the race gracefully if another reader loaded it first
        let mut readable = self.readable.write();
        if let Some(existing) = readable.get(&position) {
            if existing.try_share() {
                existing.set_timestamp(self.next_tick());
                let existing = Arc::clone(existing);
                drop(readable);
                buffer.reset_free();
                self.return_free(buffer);
                return Ok(existing);
            }
        }
        buffer.publish_readable();
        buffer.set_timestamp(self.next_tick());
        readable.insert(position, Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Returns a writable copy of the page at `position`. The buffer is
    /// exclusively owned and never visible to readers.
    pub fn get_writable_page<F>(&self, position: u64, factory: F) -> Result<Arc<PageBuffer>>
    where
        F: FnOnce(u64, &mut [u8]) -> Result<()>,
    {
        let buffer = self.get_free_buffer()?;
        buffer.mark_writable();
        buffer.set_position(position);

        let snapshotted = {
            let readable = self.readable.read();
            match readable.get(&position) {
                Some(existing) if existing.try_share() => {
                    buffer.write_bytes().copy_from_slice(existing.bytes());
                    existing.release_share();
                    true
                }
                _ => false,
            }
        };

        if !snapshotted {
            if let Err(error) = factory(position, buffer.write_bytes()) {
                buffer.reset_free();
                self.return_free(buffer);
                return Err(error);
            }
        }
        Ok(buffer)
    }

    /// Returns a zeroed writable buffer with no assigned position.
    pub fn new_page(&self) -> Result<Arc<PageBuffer>> {
        let buffer = self.get_free_buffer()?;
        buffer.mark_writable();
        buffer.clear();
        buffer.set_position(POSITION_NONE);
        Ok(buffer)
    }

    /// One-way transition writable → readable. Preconditions: the buffer is
    /// writable and its position is assigned. Postcondition: the buffer is
    /// indexed and carries exactly one share, held by the caller.
    pub fn move_to_readable(&self, buffer: &Arc<PageBuffer>) {
        debug_assert!(buffer.is_writable(), "move_to_readable needs a writable buffer");
        debug_assert!(
            buffer.position() != POSITION_NONE,
            "move_to_readable needs an assigned position"
        );

        buffer.publish_readable();
        buffer.set_timestamp(self.next_tick());

        let mut readable = self.readable.write();
        if let Some(previous) = readable.insert(buffer.position(), Arc::clone(buffer)) {
            // a previous version at this position can only be reclaimed once
            // its readers are gone; unreferenced ones return to the pool now
            if previous.share_counter() == 0 {
                previous.reset_free();
                drop(readable);
                self.return_free(previous);
            }
        }
    }

    /// Returns a writable buffer to the free pool without publishing it.
    pub fn discard_page(&self, buffer: Arc<PageBuffer>) {
        debug_assert!(buffer.is_writable(), "discard_page needs a writable buffer");
        buffer.reset_free();
        self.return_free(buffer);
    }

    /// Releases a reader share previously obtained from this cache.
    pub fn release_page(&self, buffer: &Arc<PageBuffer>) {
        buffer.release_share();
    }

    /// Number of buffers currently in the readable index.
    pub fn readable_count(&self) -> usize {
        self.readable.read().len()
    }

    /// Number of pooled free buffers.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Drops every unreferenced readable entry, returning buffers to the
    /// pool. Used by checkpoint after the log is truncated, so stale log
    /// positions cannot be re-read.
    pub fn clear_readable(&self) -> usize {
        let mut readable = self.readable.write();
        let positions: Vec<u64> = readable
            .iter()
            .filter(|(_, b)| b.share_counter() == 0)
            .map(|(p, _)| *p)
            .collect();

        let mut reclaimed = Vec::with_capacity(positions.len());
        for position in &positions {
            if let Some(buffer) = readable.remove(position) {
                buffer.reset_free();
                reclaimed.push(buffer);
            }
        }
        drop(readable);

        let count = reclaimed.len();
        let mut free = self.free.lock();
        free.extend(reclaimed);
        count
    }

    fn try_get_shared(&self, position: u64) -> Option<Arc<PageBuffer>> {
        let readable = self.readable.read();
        let buffer = readable.get(&position)?;
        if buffer.try_share() {
            buffer.set_timestamp(self.next_tick());
            Some(Arc::clone(buffer))
        } else {
            None
        }
    }

    fn get_free_buffer(&self) -> Result<Arc<PageBuffer>> {
        loop {
            if let Some(buffer) = self.free.lock().pop() {
                return Ok(buffer);
            }

            if self.segments.load(Ordering::Acquire) < MAX_CACHE_SEGMENTS {
                self.add_segment();
                continue;
            }

            if self.evict_oldest() == 0 {
                // every buffer is pinned; extend past the ceiling rather
                // than deadlock the caller
                self.add_segment();
            }
        }
    }

    fn add_segment(&self) {
        let mut free = self.free.lock();
        // re-check under the lock so concurrent growers add one segment total
        if free.is_empty() {
            for _ in 0..CACHE_SEGMENT_SIZE {
                free.push(Arc::new(PageBuffer::new()));
            }
            self.segments.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Removes unreferenced readable entries, oldest tick first. Returns how
    /// many buffers went back to the pool.
    fn evict_oldest(&self) -> usize {
        let mut readable = self.readable.write();

        let mut candidates: Vec<(u64, u64)> = readable
            .iter()
            .filter(|(_, b)| b.share_counter() == 0)
            .map(|(p, b)| (b.timestamp(), *p))
            .collect();
        candidates.sort_unstable();
        candidates.truncate(CACHE_SEGMENT_SIZE);

        let mut reclaimed = Vec::with_capacity(candidates.len());
        for (_, position) in candidates {
            if let Some(buffer) = readable.get(&position) {
                if buffer.share_counter() == 0 {
                    let buffer = readable.remove(&position).expect("checked entry");
                    buffer.reset_free();
                    reclaimed.push(buffer);
                }
            }
        }
        drop(readable);

        let count = reclaimed.len();
        if count > 0 {
            self.free.lock().extend(reclaimed);
        }
        count
    }

    fn return_free(&self, buffer: Arc<PageBuffer>) {
        debug_assert_eq!(buffer.share_counter(), 0);
        self.free.lock().push(buffer);
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}
