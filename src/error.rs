//! Error types for nvstore
//!
//! Defines a unified error type that can represent failures from all
//! components: the persistent memory pool, the storage engines, the undo
//! log, and the workload harness.

use std::fmt;
use std::io;

/// Unified error type for nvstore operations
#[derive(Debug)]
pub enum NvStoreError {
    /// I/O error (file operations, mapping)
    Io(io::Error),
    /// The persistent memory pool could not be created or opened
    PoolOpen(String),
    /// The pool is out of space
    Alloc(String),
    /// Insert of a key that is already present
    DuplicateKey(u32),
    /// Update/remove of a key that is not present
    NotFound(u32),
    /// Undo log I/O failure (fatal to the engine)
    Log(String),
    /// Invalid configuration
    Config(String),
    /// Generic internal error
    Internal(String),
}

impl NvStoreError {
    /// Logical per-operation errors are reported to the caller and counted
    /// by the workload driver; they never abort the run.
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            NvStoreError::DuplicateKey(_) | NvStoreError::NotFound(_)
        )
    }

    /// Process exit code for this error when it reaches `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            NvStoreError::PoolOpen(_) => 2,
            NvStoreError::Alloc(_) => 3,
            NvStoreError::Log(_) => 4,
            NvStoreError::Config(_) => 5,
            _ => 1,
        }
    }
}

impl fmt::Display for NvStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvStoreError::Io(e) => write!(f, "{}", e),
            NvStoreError::PoolOpen(msg) => write!(f, "pool open failed: {}", msg),
            NvStoreError::Alloc(msg) => write!(f, "pool allocation failed: {}", msg),
            NvStoreError::DuplicateKey(key) => write!(f, "duplicate key {}", key),
            NvStoreError::NotFound(key) => write!(f, "key {} not found", key),
            NvStoreError::Log(msg) => write!(f, "undo log failure: {}", msg),
            NvStoreError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            NvStoreError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for NvStoreError {}

impl From<io::Error> for NvStoreError {
    fn from(e: io::Error) -> Self {
        NvStoreError::Io(e)
    }
}

impl From<serde_json::Error> for NvStoreError {
    fn from(e: serde_json::Error) -> Self {
        NvStoreError::Config(e.to_string())
    }
}

/// Result type alias for nvstore operations
pub type Result<T> = std::result::Result<T, NvStoreError>;
