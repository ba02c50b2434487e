//! nvstore - a persistent-memory key-value storage engine testbed
//!
//! nvstore loads a YCSB- or TPCC-style workload and executes mixed
//! read/update transactions across partitions, measuring throughput under
//! storage engine designs that differ in how they balance in-memory
//! updates against durable writes on byte-addressable NVM:
//!
//! - **WAL**: in-place updates on the pool with an undo log
//! - **LSM**: double-buffered volatile memtables merged into an NVM table
//!
//! A coordinator spawns one worker thread per partition; each worker
//! drives its engine through `load()` then `execute()`, while background
//! threads batch undo-log flushes (group commit) and, for LSM, drain the
//! passive memtable generation into the NVM table.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod coordinator;
pub mod engines;
pub mod error;
pub mod pmem;
pub mod types;
pub mod undo;
pub mod workload;

pub use coordinator::{Coordinator, Stats};
pub use engines::{EngineType, KvEngine};
pub use error::{NvStoreError, Result};
pub use workload::BenchmarkKind;

/// Benchmark configuration
///
/// Missing JSON properties fall back to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker threads, one per partition
    pub num_executors: usize,
    /// Key-range partitions (normally equal to `num_executors`)
    pub num_parts: usize,
    /// Transactions across the whole run
    pub num_txns: usize,
    /// Keys loaded before execution
    pub num_keys: usize,
    /// Record value size in bytes
    pub sz_value: usize,
    /// Fraction of transactions that are updates, in [0, 1]
    pub per_writes: f64,
    /// Zipf skew of the key distribution (0 = uniform)
    pub skew: f64,
    /// Group-commit flush interval in milliseconds
    pub gc_interval_ms: u64,
    /// LSM merge interval in milliseconds
    pub lsm_interval_ms: u64,
    /// Storage engine under test
    pub engine: EngineType,
    /// Workload shape
    pub benchmark: BenchmarkKind,
    /// Directory holding the pool, undo log, and NVM table files
    pub fs_path: PathBuf,
    /// Size of each mapped pool file in bytes
    pub pool_size: u64,
    /// Restore the original non-atomic LSM update (remove then insert as
    /// two separate critical sections)
    pub split_updates: bool,
    /// Seed for the workload distributions; `None` draws from entropy
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_executors: 1,
            num_parts: 1,
            num_txns: 1000,
            num_keys: 1000,
            sz_value: 64,
            per_writes: 0.1,
            skew: 0.5,
            gc_interval_ms: 10,
            lsm_interval_ms: 10,
            engine: EngineType::Wal,
            benchmark: BenchmarkKind::Ycsb,
            fs_path: PathBuf::from("./data"),
            pool_size: 64 << 20,
            split_updates: false,
            seed: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file; absent properties keep their
    /// defaults.
    pub fn load(path: &str) -> Result<Config> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config = serde_json::from_reader(reader)?;
        Ok(config)
    }

    /// Reject configurations the harness cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.num_executors == 0 || self.num_parts == 0 {
            return Err(NvStoreError::Config(
                "num_executors and num_parts must be positive".to_string(),
            ));
        }
        if self.num_executors > pmem::MAX_PTRS / 2 {
            return Err(NvStoreError::Config(format!(
                "at most {} executors (static-area root slots)",
                pmem::MAX_PTRS / 2
            )));
        }
        if !(0.0..=1.0).contains(&self.per_writes) {
            return Err(NvStoreError::Config(
                "per_writes must be in [0, 1]".to_string(),
            ));
        }
        if self.skew < 0.0 {
            return Err(NvStoreError::Config("skew must be non-negative".to_string()));
        }
        if self.sz_value == 0 {
            return Err(NvStoreError::Config("sz_value must be positive".to_string()));
        }
        Ok(())
    }
}
