//! Storage engines
//!
//! nvstore compares storage engine designs that differ in how they balance
//! in-memory updates against durable writes on byte-addressable NVM:
//! - **Wal**: in-place updates on NVM with an undo log
//! - **Lsm**: double-buffered volatile memtables merged into an NVM table

pub mod lsm;
pub mod wal;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pmem::PmemPool;
use crate::types::Txn;
use crate::Config;

pub use lsm::LsmEngine;
pub use wal::WalEngine;

/// Engine type selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineType {
    /// In-place NVM store with undo logging and periodic group commit.
    Wal,
    /// Two-generation volatile memtables drained into an NVM-resident
    /// table by a background merger.
    Lsm,
}

impl Default for EngineType {
    fn default() -> Self {
        EngineType::Wal
    }
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineType::Wal => write!(f, "WAL"),
            EngineType::Lsm => write!(f, "LSM"),
        }
    }
}

impl EngineType {
    /// Get a human-readable description of the engine
    pub fn description(&self) -> &'static str {
        match self {
            EngineType::Wal => "in-place NVM updates with undo logging",
            EngineType::Lsm => "double-buffered memtables merged into an NVM table",
        }
    }

    /// Parse engine type from string name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "WAL" => Some(EngineType::Wal),
            "LSM" => Some(EngineType::Lsm),
            _ => None,
        }
    }
}

/// The operation surface shared by every engine.
///
/// Engines are internally locked: all operations take `&self` and may be
/// called from any worker thread. Logical failures (`DuplicateKey`,
/// `NotFound`) are returned to the caller; the workload driver counts them
/// without aborting.
pub trait KvEngine: Send + Sync {
    fn engine_type(&self) -> EngineType;

    /// Install a new key. Fails with `DuplicateKey` if present.
    fn insert(&self, txn: &Txn) -> Result<()>;

    /// Return the value for a key, or `None` if absent.
    fn read(&self, txn: &Txn) -> Result<Option<Bytes>>;

    /// Replace the value of a key.
    fn update(&self, txn: &Txn) -> Result<()>;

    /// Remove a key. Fails with `NotFound` if no generation holds it.
    fn remove(&self, txn: &Txn) -> Result<()>;

    /// Durably flush queued undo-log entries now.
    fn flush_log(&self) -> Result<()>;

    /// Start background workers (group commit; for LSM also the merger).
    fn start_workers(&self);

    /// Stop background workers and issue the final log flush.
    fn shutdown(&self) -> Result<()>;
}

/// Construct the engine selected by the config for one partition.
pub fn build_engine(
    config: &Config,
    pool: Arc<PmemPool>,
    pid: usize,
    failed: Arc<AtomicBool>,
) -> Result<Box<dyn KvEngine>> {
    match config.engine {
        EngineType::Wal => Ok(Box::new(WalEngine::new(config, pool, pid, failed)?)),
        EngineType::Lsm => Ok(Box::new(LsmEngine::new(config, pool, pid, failed)?)),
    }
}

/// Per-partition file name under `fs_path`: partition 0 owns the bare
/// name, partition `i > 0` appends `.<i>`.
pub(crate) fn partition_path(fs_path: &Path, name: &str, pid: usize) -> PathBuf {
    if pid == 0 {
        fs_path.join(name)
    } else {
        fs_path.join(format!("{}.{}", name, pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_type_default_is_wal() {
        assert_eq!(EngineType::default(), EngineType::Wal);
    }

    #[test]
    fn test_engine_type_display() {
        assert_eq!(EngineType::Wal.to_string(), "WAL");
        assert_eq!(EngineType::Lsm.to_string(), "LSM");
    }

    #[test]
    fn test_engine_type_from_name() {
        assert_eq!(EngineType::from_name("wal"), Some(EngineType::Wal));
        assert_eq!(EngineType::from_name("LSM"), Some(EngineType::Lsm));
        assert_eq!(EngineType::from_name("sp"), None);
        assert_eq!(EngineType::from_name("unknown"), None);
    }

    #[test]
    fn test_engine_type_description() {
        assert!(EngineType::Wal.description().contains("undo"));
        assert!(EngineType::Lsm.description().contains("memtables"));
    }

    #[test]
    fn test_partition_path_naming() {
        let base = Path::new("/tmp/run");
        assert_eq!(partition_path(base, "log", 0), Path::new("/tmp/run/log"));
        assert_eq!(partition_path(base, "log", 2), Path::new("/tmp/run/log.2"));
    }
}
