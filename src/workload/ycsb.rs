//! YCSB-style driver: single-key reads and updates over a zipf key space

use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{dist, Benchmark, Partition};
use crate::engines::KvEngine;
use crate::error::Result;
use crate::types::{OpKind, Txn};
use crate::Config;

pub struct YcsbBenchmark {
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

impl YcsbBenchmark {
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
}

impl Benchmark for YcsbBenchmark {
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
        let updated_value = Bytes::from(vec![b'x'; self.sz_value]);

        for i in 0..self.part.range_txns {
            let key = self.part.key(self.zipf_dist[i]);

            if self.uniform_dist[i] < self.per_writes {
                let txn = Txn::new(i as u64, OpKind::Update, key, updated_value.clone());
                match self.engine.update(&txn) {
                    Ok(()) => {}
                    Err(e) if e.is_logical() => self.not_found += 1,
                    Err(e) => return Err(e),
                }
            } else {
                self.engine.read(&Txn::read(i as u64, key))?;
            }
        }

        if self.duplicates > 0 || self.not_found > 0 {
            log::debug!(
                "ycsb partition done ({} duplicates, {} not found)",
                self.duplicates,
                self.not_found
            );
        }
        Ok(())
    }

    fn check(&mut self) -> Result<usize> {
        let mut present = 0;
        for key in self.part.range_offset..self.part.range_offset + self.part.range_size {
            match self.engine.read(&Txn::read(0, key as u32))? {
                Some(_) => present += 1,
                None => log::debug!("check: key {} missing", key),
            }
        }
        Ok(present)
    }
}
