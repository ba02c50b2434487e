//! Workload drivers
//!
//! Each driver owns one key-range partition: it pre-generates its zipf and
//! uniform sequences, loads the partition's keys, then executes the mixed
//! read/update transaction stream against the engine. Logical errors
//! (duplicate key, not found) are counted, never fatal.

pub mod dist;
mod tpcc;
mod ycsb;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engines::KvEngine;
use crate::error::Result;
use crate::Config;

pub use tpcc::TpccBenchmark;
pub use ycsb::YcsbBenchmark;

/// Workload shape selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BenchmarkKind {
    /// Single-key read/update mix over a zipf-distributed key space
    Ycsb,
    /// Payment / new-order style multi-read groups over warehouse-local keys
    Tpcc,
}

impl Default for BenchmarkKind {
    fn default() -> Self {
        BenchmarkKind::Ycsb
    }
}

impl std::fmt::Display for BenchmarkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BenchmarkKind::Ycsb => write!(f, "YCSB"),
            BenchmarkKind::Tpcc => write!(f, "TPCC"),
        }
    }
}

impl BenchmarkKind {
    /// Parse benchmark kind from string name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "YCSB" => Some(BenchmarkKind::Ycsb),
            "TPCC" => Some(BenchmarkKind::Tpcc),
            _ => None,
        }
    }
}

/// A benchmark bound to one partition and one engine.
pub trait Benchmark: Send {
    /// Insert every key in the partition range, then flush the log.
    fn load(&mut self) -> Result<()>;

    /// Run the partition's share of the transaction stream.
    fn execute(&mut self) -> Result<()>;

    /// Diagnostic: read back every key in the range and return how many
    /// are present.
    fn check(&mut self) -> Result<usize>;
}

/// Construct the benchmark selected by the config for one partition.
pub fn build_benchmark(
    config: &Config,
    pid: usize,
    engine: Arc<dyn KvEngine>,
) -> Box<dyn Benchmark> {
    match config.benchmark {
        BenchmarkKind::Ycsb => {
            log::info!("YCSB partition {}", pid);
            Box::new(YcsbBenchmark::new(config, pid, engine))
        }
        BenchmarkKind::Tpcc => {
            log::info!("TPCC partition {}", pid);
            Box::new(TpccBenchmark::new(config, pid, engine))
        }
    }
}

/// Per-partition key-range arithmetic shared by the drivers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Partition {
    pub range_size: usize,
    pub range_offset: usize,
    pub range_txns: usize,
}

impl Partition {
    pub fn new(config: &Config, pid: usize) -> Self {
        let range_size = (config.num_keys / config.num_parts).max(1);
        Self {
            range_size,
            range_offset: pid * range_size,
            range_txns: config.num_txns / config.num_parts,
        }
    }

    /// Map a zipf sample onto this partition's key range.
    pub fn key(&self, z: u64) -> u32 {
        (self.range_offset + (z as usize % self.range_size)) as u32
    }
}
