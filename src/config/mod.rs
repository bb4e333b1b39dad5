//! # Engine Configuration
//!
//! Centralizes configuration for the engine. Numeric constants live in
//! [`constants`] with their interdependencies documented and enforced through
//! compile-time assertions; runtime options are carried by [`EngineOptions`].

pub mod constants;
pub use constants::*;

use std::path::PathBuf;
use std::time::Duration;

/// Runtime options for opening an engine instance.
///
/// ```ignore
/// let engine = Engine::open(EngineOptions::new("app.db"))?;
/// let mem = Engine::open(EngineOptions::in_memory())?;
/// ```
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Data file path; `None` means an in-memory database.
    pub path: Option<PathBuf>,
    /// Password for encrypted files. The engine itself only detects the
    /// encryption marker; decryption is provided by an external stream.
    pub password: Option<String>,
    /// Lock-wait timeout applied until the header pragmas are loaded.
    pub timeout: Duration,
    /// Pre-allocated initial data file size in bytes, rounded down to
    /// whole pages (0 = just the header). The pages beyond the header are
    /// written as empty pages chained onto the free list, so early
    /// allocations reuse them instead of growing the file.
    pub initial_size: u64,
    /// Open in read-only mode.
    pub read_only: bool,
}

impl EngineOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::in_memory()
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            password: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT),
            initial_size: 0,
            read_only: false,
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn initial_size(mut self, bytes: u64) -> Self {
        self.initial_size = bytes;
        self
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::in_memory()
    }
}
