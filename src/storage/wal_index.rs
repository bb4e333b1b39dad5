//! # WAL Index
//!
//! In-memory index over the log region: `(page id, version) → log position`
//! plus the monotonic `current_read_version` snapshot counter.
//!
//! ## Publish protocol
//!
//! A commit calls [`WalIndex::confirm_transaction`] once its pages and the
//! confirm page are durable. All of the transaction's positions are
//! registered at `current_read_version + 1` while holding the index write
//! lock, and only then is `current_read_version` advanced. A reader that
//! sampled the counter before the bump resolves none of the new entries; a
//! reader that samples after sees all of them. There is no intermediate
//! state.
//!
//! ## Reads
//!
//! [`WalIndex::get_page_index`] returns the greatest-versioned entry with
//! `version <= read_version`, or `None` when the caller must fall back to
//! the page's home position in the data region.

use std::sync::atomic::{AtomicU32, Ordering};

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};

pub struct WalIndex {
    /// page id → (version, log position), ascending by version.
    index: RwLock<HashMap<u32, Vec<(u32, u64)>>>,
    current_read_version: AtomicU32,
    confirmed_transactions: Mutex<HashSet<u32>>,
}

impl WalIndex {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(HashMap::new()),
            current_read_version: AtomicU32::new(0),
            confirmed_transactions: Mutex::new(HashSet::new()),
        }
    }

    /// Version a new snapshot should read at.
    pub fn current_read_version(&self) -> u32 {
        self.current_read_version.load(Ordering::Acquire)
    }

    /// True when `transaction_id` has a durable confirm page.
    pub fn is_confirmed(&self, transaction_id: u32) -> bool {
        self.confirmed_transactions.lock().contains(&transaction_id)
    }

    /// Greatest-versioned log position for `page_id` visible at
    /// `read_version`, or `None` (read the data file).
    pub fn get_page_index(&self, page_id: u32, read_version: u32) -> Option<u64> {
        if read_version == 0 {
            return None;
        }
        let index = self.index.read();
        let versions = index.get(&page_id)?;
        versions
            .iter()
            .rev()
            .find(|(version, _)| *version <= read_version)
            .map(|(_, position)| *position)
    }

    /// Publishes all positions of a confirmed transaction atomically and
    /// advances the read version.
    pub fn confirm_transaction(&self, transaction_id: u32, positions: &[(u32, u64)]) -> u32 {
        let mut index = self.index.write();
        let version = self.current_read_version.load(Ordering::Acquire) + 1;

        for &(page_id, position) in positions {
            let versions = index.entry(page_id).or_default();
            debug_assert!(versions.last().map_or(true, |&(v, _)| v < version));
            versions.push((version, position));
        }
        self.confirmed_transactions.lock().insert(transaction_id);

        // readers sampling before this store keep the pre-commit world
        self.current_read_version.store(version, Ordering::Release);
        version
    }

    /// Newest confirmed position per page with `version <= up_to`, for the
    /// checkpoint copy loop. Ascending by log position.
    pub fn checkpoint_entries(&self, up_to: u32) -> Vec<(u32, u64)> {
        let index = self.index.read();
        let mut entries: Vec<(u32, u64)> = index
            .iter()
            .filter_map(|(&page_id, versions)| {
                versions
                    .iter()
                    .rev()
                    .find(|(version, _)| *version <= up_to)
                    .map(|&(_, position)| (page_id, position))
            })
            .collect();
        entries.sort_unstable_by_key(|&(_, position)| position);
        entries
    }

    /// Number of live log entries (all versions).
    pub fn entries_count(&self) -> usize {
        self.index.read().values().map(Vec::len).sum()
    }

    /// Empties the index after a checkpoint truncated the log. Runs under
    /// the exclusive database lock, so no reader holds an older version.
    pub fn clear(&self) {
        let mut index = self.index.write();
        index.clear();
        self.confirmed_transactions.lock().clear();
        self.current_read_version.store(0, Ordering::Release);
    }
}

impl Default for WalIndex {
    fn default() -> Self {
        Self::new()
    }
}
