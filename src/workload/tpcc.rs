//! TPCC-style driver: payment and new-order shaped transaction groups
//!
//! Keys model warehouse-local rows inside the partition's range. A payment
//! is a read plus an in-place update of one row; a new-order reads a small
//! group of item rows. The same zipf/uniform sequences that drive the
//! YCSB mix select rows and transaction kinds here.

use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{dist, Benchmark, Partition};
use crate::engines::KvEngine;
use crate::error::Result;
use crate::types::{OpKind, Txn};
use crate::Config;

/// Item rows touched by one new-order group
const ORDER_LINES: usize = 3;

pub struct TpccBenchmark {
    engine: Arc<dyn KvEngine>,
    part: Partition,
    sz_value: usize,
    per_writes: f64,
    zipf_dist: Vec<u64>,
    uniform_dist: Vec<f64>,
    rng: StdRng,
    duplicates: usize,
    not_found: usize,
}

impl TpccBenchmark {
    pub fn new(config: &Config, pid: usize, engine: Arc<dyn KvEngine>) -> Self {
        let part = Partition::new(config, pid);
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(pid as u64)),
            None => StdRng::from_entropy(),
        };
        let zipf_dist = dist::zipf(part.range_size as u64, config.skew, part.range_txns, &mut rng);
        let uniform_dist = dist::uniform(part.range_txns, &mut rng);

        Self {
            engine,
            part,
            sz_value: config.sz_value,
            per_writes: config.per_writes,
            zipf_dist,
            uniform_dist,
            rng,
            duplicates: 0,
            not_found: 0,
        }
    }

    /// Payment: read the row, then overwrite it in place.
    fn payment(&mut self, id: u64, key: u32, value: &Bytes) -> Result<()> {
        self.engine.read(&Txn::read(id, key))?;
        match self
            .engine
            .update(&Txn::new(id, OpKind::Update, key, value.clone()))
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_logical() => {
                self.not_found += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// New-order: read a small group of item rows near the sampled one.
    fn new_order(&mut self, id: u64, z: u64) -> Result<()> {
        for line in 0..ORDER_LINES as u64 {
            let key = self.part.key(z + line);
            self.engine.read(&Txn::read(id, key))?;
        }
        Ok(())
    }
}

impl Benchmark for TpccBenchmark {
    fn load(&mut self) -> Result<()> {
        for key in self.part.range_offset..self.part.range_offset + self.part.range_size {
            let value = dist::random_value(self.sz_value, &mut self.rng);
            let txn = Txn::new(0, OpKind::Insert, key as u32, value);
            match self.engine.insert(&txn) {
                Ok(()) => {}
                Err(e) if e.is_logical() => self.duplicates += 1,
                Err(e) => return Err(e),
            }
        }
        self.engine.flush_log()
    }

    fn execute(&mut self) -> Result<()> {
        let paid_value = Bytes::from(vec![b'x'; self.sz_value]);

        for i in 0..self.part.range_txns {
            let z = self.zipf_dist[i];

            if self.uniform_dist[i] < self.per_writes {
                let key = self.part.key(z);
                self.payment(i as u64, key, &paid_value)?;
            } else {
                self.new_order(i as u64, z)?;
            }
        }

        if self.duplicates > 0 || self.not_found > 0 {
            log::debug!(
                "tpcc partition done ({} duplicates, {} not found)",
                self.duplicates,
                self.not_found
            );
        }
        Ok(())
    }

    fn check(&mut self) -> Result<usize> {
        let mut present = 0;
        for key in self.part.range_offset..self.part.range_offset + self.part.range_size {
            if self.engine.read(&Txn::read(0, key as u32))?.is_some() {
                present += 1;
            }
        }
        Ok(present)
    }
}
