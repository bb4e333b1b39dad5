//! # Transaction Layer
//!
//! Snapshot/transaction state machine over the storage services.
//!
//! ```text
//! Transaction ──┬── Snapshot("users")   per-collection view + local pages
//!               ├── Snapshot("orders")
//!               └── TransactionPages    shared dirty/new/deleted bookkeeping
//! ```
//!
//! A transaction holds the shared database lock; each write snapshot holds
//! its collection lock. Commit stamps dirty pages with the transaction id,
//! appends them to the log through the disk writer queue and publishes the
//! batch to the WAL index once the confirm page is durable. Readers keep
//! the `read_version` they sampled at snapshot creation, so a published
//! commit is visible to new snapshots only.

mod monitor;
mod pages;
mod snapshot;
#[allow(clippy::module_inception)]
mod transaction;

pub use monitor::TransactionMonitor;
pub use pages::TransactionPages;
pub use snapshot::{LockMode, Snapshot};
pub use transaction::Transaction;
