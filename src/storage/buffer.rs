//! # Page Buffer
//!
//! A page-aligned byte region with a share counter that tracks visibility:
//!
//! ```text
//! ShareCounter == 0                 free      (pooled, not indexed)
//! ShareCounter >  0                 readable  (n concurrent readers)
//! ShareCounter == BUFFER_WRITABLE   writable  (exactly one owner)
//! ```
//!
//! The writable sentinel is an invariant no reader may observe: the cache
//! never hands out a writable buffer for a position it already indexed, and
//! the only way back to the readable state is the one-way transition inside
//! `MemoryCache::move_to_readable`.
//!
//! ## Safety model
//!
//! The bytes live in an `UnsafeCell` so a writable owner can mutate through
//! a shared `Arc`. The counter protocol replaces the borrow checker here:
//! `write_bytes` may only be called while the counter holds the writable
//! sentinel, and exactly one owner may hold a writable buffer.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crate::config::PAGE_SIZE;

/// Share-counter sentinel marking exclusive writable ownership.
pub const BUFFER_WRITABLE: i32 = -1;

/// Position of a buffer not yet assigned to a file location.
pub const POSITION_NONE: u64 = u64::MAX;

pub struct PageBuffer {
    data: UnsafeCell<Box<[u8; PAGE_SIZE]>>,
    position: AtomicU64,
    share_counter: AtomicI32,
    timestamp: AtomicU64,
}

// SAFETY: all shared mutation goes through the share-counter protocol
// documented on the module; the UnsafeCell is only written while the
// counter holds BUFFER_WRITABLE, which guarantees a single owner.
unsafe impl Send for PageBuffer {}
unsafe impl Sync for PageBuffer {}

impl PageBuffer {
    pub fn new() -> Self {
        Self {
            data: UnsafeCell::new(Box::new([0u8; PAGE_SIZE])),
            position: AtomicU64::new(POSITION_NONE),
            share_counter: AtomicI32::new(0),
            timestamp: AtomicU64::new(0),
        }
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Relaxed)
    }

    pub fn set_timestamp(&self, tick: u64) {
        self.timestamp.store(tick, Ordering::Relaxed);
    }

    pub fn share_counter(&self) -> i32 {
        self.share_counter.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        self.share_counter() == BUFFER_WRITABLE
    }

    /// Claims a reader share. Returns false if the buffer is writable or
    /// was reclaimed (counter no longer reachable from the readable state).
    pub fn try_share(&self) -> bool {
        let mut current = self.share_counter.load(Ordering::Acquire);
        loop {
            if current < 0 {
                return false;
            }
            match self.share_counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Releases one reader share.
    pub fn release_share(&self) {
        let prev = self.share_counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release_share on unshared buffer");
    }

    /// Transitions free → writable. Only the cache calls this, while the
    /// buffer is outside the readable index.
    pub(super) fn mark_writable(&self) {
        let prev = self
            .share_counter
            .compare_exchange(0, BUFFER_WRITABLE, Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(prev.is_ok(), "mark_writable on shared buffer");
    }

    /// Transitions writable → readable with one share held by the caller.
    pub(super) fn publish_readable(&self) {
        debug_assert!(self.is_writable(), "publish_readable on non-writable buffer");
        self.share_counter.store(1, Ordering::Release);
    }

    /// Transitions writable → free (discard without publishing).
    pub(super) fn reset_free(&self) {
        self.position.store(POSITION_NONE, Ordering::Release);
        self.share_counter.store(0, Ordering::Release);
    }

    /// Read access to the page bytes.
    ///
    /// The caller must hold a reader share or own the buffer writable;
    /// both states pin the content.
    pub fn bytes(&self) -> &[u8; PAGE_SIZE] {
        debug_assert!(
            self.share_counter() != 0,
            "bytes() on unpinned buffer"
        );
        // SAFETY: a held share (or writable ownership) prevents any state
        // transition that would hand the bytes to another writer.
        unsafe { &*self.data.get() }
    }

    /// Write access to the page bytes.
    ///
    /// Requires writable ownership; the counter sentinel guarantees no
    /// concurrent reader or writer can observe the bytes.
    #[allow(clippy::mut_from_ref)]
    pub fn write_bytes(&self) -> &mut [u8; PAGE_SIZE] {
        debug_assert!(self.is_writable(), "write_bytes() on non-writable buffer");
        // SAFETY: BUFFER_WRITABLE means exactly one owner; see module docs.
        unsafe { &mut *self.data.get() }
    }

    /// Zeroes the content. Requires writable ownership.
    pub fn clear(&self) {
        self.write_bytes().fill(0);
    }
}

impl Default for PageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer")
            .field("position", &self.position())
            .field("share_counter", &self.share_counter())
            .field("timestamp", &self.timestamp())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_buffer_is_free_and_unassigned() {
        let buf = PageBuffer::new();
        assert_eq!(buf.share_counter(), 0);
        assert_eq!(buf.position(), POSITION_NONE);
    }

    #[test]
    fn share_and_release_count_readers() {
        let buf = PageBuffer::new();
        assert!(buf.try_share());
        assert!(buf.try_share());
        assert_eq!(buf.share_counter(), 2);

        buf.release_share();
        buf.release_share();
        assert_eq!(buf.share_counter(), 0);
    }

    #[test]
    fn writable_buffer_refuses_readers() {
        let buf = PageBuffer::new();
        buf.mark_writable();
        assert!(buf.is_writable());
        assert!(!buf.try_share());
    }

    #[test]
    fn publish_readable_leaves_one_share() {
        let buf = PageBuffer::new();
        buf.mark_writable();
        buf.write_bytes()[0] = 0xAA;
        buf.set_position(8192);

        buf.publish_readable();
        assert_eq!(buf.share_counter(), 1);
        assert_eq!(buf.bytes()[0], 0xAA);
    }

    #[test]
    fn reset_free_clears_position() {
        let buf = PageBuffer::new();
        buf.mark_writable();
        buf.set_position(8192);
        buf.reset_free();
        assert_eq!(buf.share_counter(), 0);
        assert_eq!(buf.position(), POSITION_NONE);
    }
}
