//! # Lock Service
//!
//! Two lock tiers with a strict ordering rule: the database-wide
//! transaction lock is always taken before any collection lock, and a
//! transaction that needs several collection locks acquires them in
//! lexicographic name order. Every acquisition honors the configured
//! timeout and fails with `LockTimeout` instead of deadlocking.
//!
//! - **Transaction lock**: shared for ordinary transactions, exclusive for
//!   checkpoint and other structural operations that must quiesce readers.
//! - **Collection locks**: one mutex per collection name, taken by write
//!   mode snapshots so a single writer serialises each collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{
    ArcMutexGuard, ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawMutex, RawRwLock, RwLock,
};

use crate::{Error, Result};

pub type SharedLock = ArcRwLockReadGuard<RawRwLock, ()>;
pub type ExclusiveLock = ArcRwLockWriteGuard<RawRwLock, ()>;
pub type CollectionLock = ArcMutexGuard<RawMutex, ()>;

pub struct LockService {
    transaction: Arc<RwLock<()>>,
    collections: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    timeout_millis: AtomicU64,
}

impl LockService {
    pub fn new(timeout: Duration) -> Self {
        Self {
            transaction: Arc::new(RwLock::new(())),
            collections: Mutex::new(HashMap::new()),
            timeout_millis: AtomicU64::new(timeout.as_millis() as u64),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis.load(Ordering::Relaxed))
    }

    /// Applied when the `TIMEOUT` pragma changes.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_millis
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Shared database lock, held for the lifetime of a transaction.
    pub fn enter_transaction(&self) -> Result<SharedLock> {
        let timeout = self.timeout();
        self.transaction
            .try_read_arc_for(timeout)
            .ok_or(Error::LockTimeout {
                lock: "transaction",
                timeout,
            })
    }

    /// Exclusive database lock for checkpoint and structural operations.
    /// Blocks new transactions and waits out the running ones.
    pub fn enter_exclusive(&self) -> Result<ExclusiveLock> {
        let timeout = self.timeout();
        self.transaction
            .try_write_arc_for(timeout)
            .ok_or(Error::LockTimeout {
                lock: "exclusive",
                timeout,
            })
    }

    /// Per-collection writer lock. The caller must already hold the shared
    /// transaction lock.
    pub fn enter_collection(&self, name: &str) -> Result<CollectionLock> {
        let mutex = {
            let mut collections = self.collections.lock();
            Arc::clone(
                collections
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };

        let timeout = self.timeout();
        mutex.try_lock_arc_for(timeout).ok_or(Error::LockTimeout {
            lock: "collection",
            timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> LockService {
        LockService::new(Duration::from_millis(50))
    }

    #[test]
    fn shared_locks_coexist() {
        let locks = service();
        let a = locks.enter_transaction().unwrap();
        let b = locks.enter_transaction().unwrap();
        drop(a);
        drop(b);
    }

    #[test]
    fn exclusive_waits_for_readers_then_times_out() {
        let locks = service();
        let _reader = locks.enter_transaction().unwrap();

        let err = locks.enter_exclusive().unwrap_err();
        assert!(matches!(err, Error::LockTimeout { lock: "exclusive", .. }));
    }

    #[test]
    fn collection_lock_is_mutual_exclusion() {
        let locks = service();
        let held = locks.enter_collection("users").unwrap();

        match locks.enter_collection("users") {
            Err(err) => assert!(matches!(err, Error::LockTimeout { lock: "collection", .. })),
            Ok(_) => panic!("expected LockTimeout"),
        }

        drop(held);
        locks.enter_collection("users").unwrap();
    }

    #[test]
    fn different_collections_do_not_contend() {
        let locks = service();
        let _a = locks.enter_collection("a").unwrap();
        let _b = locks.enter_collection("b").unwrap();
    }

    #[test]
    fn timeout_is_configurable() {
        let locks = service();
        locks.set_timeout(Duration::from_millis(5));
        assert_eq!(locks.timeout(), Duration::from_millis(5));
    }
}
