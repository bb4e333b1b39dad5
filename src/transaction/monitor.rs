//! # Transaction Monitor
//!
//! Allocates transaction ids and keeps the engine-wide pool of pages handed
//! back by rollbacks.
//!
//! A rolled-back transaction returns its freshly allocated pages without
//! writing anything: the ids are parked here and the next committing
//! transaction folds them onto the durable free list as empty pages. Until
//! then they are invisible to allocation, which keeps the on-disk free
//! chain consistent with what the header actually references.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

pub struct TransactionMonitor {
    last_transaction_id: AtomicU32,
    returned_pages: Mutex<Vec<u32>>,
}

impl TransactionMonitor {
    pub fn new() -> Self {
        Self {
            last_transaction_id: AtomicU32::new(0),
            returned_pages: Mutex::new(Vec::new()),
        }
    }

    /// Monotonic, never zero (zero marks log holes).
    pub fn next_transaction_id(&self) -> u32 {
        self.last_transaction_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Parks pages a rollback gave back.
    pub fn return_pages(&self, pages: impl IntoIterator<Item = u32>) {
        self.returned_pages.lock().extend(pages);
    }

    /// Drains the parked pages into the calling commit.
    pub fn take_returned_pages(&self) -> Vec<u32> {
        std::mem::take(&mut *self.returned_pages.lock())
    }
}

impl Default for TransactionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_ids_start_at_one() {
        let monitor = TransactionMonitor::new();
        assert_eq!(monitor.next_transaction_id(), 1);
        assert_eq!(monitor.next_transaction_id(), 2);
    }

    #[test]
    fn returned_pages_drain_once() {
        let monitor = TransactionMonitor::new();
        monitor.return_pages([4, 5]);
        monitor.return_pages([9]);

        assert_eq!(monitor.take_returned_pages(), vec![4, 5, 9]);
        assert!(monitor.take_returned_pages().is_empty());
    }
}
