//! Error taxonomy for the storage engine.
//!
//! Every fallible operation returns [`Result`] carrying a tagged [`Error`].
//! Transactional errors (`LockTimeout`, `IndexDuplicateKey`, ...) roll back
//! the offending transaction and surface to the caller; `Io` errors raised
//! while the disk writer queue drains are latched and re-raised on every
//! subsequent mutation until the engine is reopened.

use thiserror::Error;

/// Result type alias using the engine [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all engine operations.
#[derive(Debug, Error)]
pub enum Error {
    // -------------------------------------------------------------------------
    // I/O
    // -------------------------------------------------------------------------
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A previous background-write failure; the engine is read-only until
    /// it is reopened.
    #[error("disk writer failed, engine is read-only until restart: {0}")]
    DiskWriterFailed(String),

    // -------------------------------------------------------------------------
    // File format
    // -------------------------------------------------------------------------
    #[error("invalid database file: {0}")]
    InvalidDatabase(String),

    #[error("page corruption at {position}: {message}")]
    Corruption { position: u64, message: String },

    #[error("datafile is encrypted, password required")]
    EncryptionRequired,

    #[error("wrong password")]
    WrongPassword,

    // -------------------------------------------------------------------------
    // Limits
    // -------------------------------------------------------------------------
    #[error("size limit of {limit} bytes exceeded")]
    DataSizeExceeded { limit: u64 },

    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------
    #[error("{lock} lock not acquired within {timeout:?}")]
    LockTimeout {
        lock: &'static str,
        timeout: std::time::Duration,
    },

    // -------------------------------------------------------------------------
    // Indexes
    // -------------------------------------------------------------------------
    #[error("invalid index key: {0}")]
    InvalidIndexKey(String),

    #[error("duplicate key in unique index `{index}`")]
    IndexDuplicateKey { index: String },

    // -------------------------------------------------------------------------
    // Catalog
    // -------------------------------------------------------------------------
    #[error("`{0}` already exists")]
    AlreadyExists(String),

    #[error("`{0}` not found")]
    NotFound(String),

    // -------------------------------------------------------------------------
    // Documents
    // -------------------------------------------------------------------------
    #[error("invalid bson: {0}")]
    InvalidBson(String),
}

impl Error {
    /// Corruption error with the file position that failed to decode.
    pub fn corruption(position: u64, message: impl Into<String>) -> Self {
        Error::Corruption {
            position,
            message: message.into(),
        }
    }

    /// True when the error must abort the whole engine, not just the
    /// current transaction.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::DiskWriterFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_fatal() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(err.is_fatal());
    }

    #[test]
    fn duplicate_key_is_transactional() {
        let err = Error::IndexDuplicateKey {
            index: "byName".into(),
        };
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("byName"));
    }

    #[test]
    fn corruption_carries_position() {
        let err = Error::corruption(8192, "bad page type");
        assert!(err.to_string().contains("8192"));
    }
}
