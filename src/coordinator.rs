//! Coordinator: partitions the key range, launches per-partition workers,
//! joins them, and reports throughput over the slowest partition.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::engines::{build_engine, KvEngine};
use crate::error::{NvStoreError, Result};
use crate::pmem::PmemPool;
use crate::types::{FieldInfo, FieldType, Schema};
use crate::workload::build_benchmark;
use crate::Config;

/// Static-area slots `0..MAX_PTRS/2` hold per-partition table roots;
/// slots from here up hold the per-partition database descriptors.
const DB_ROOT_BASE: usize = crate::pmem::MAX_PTRS / 2;

/// Wall-clock timer for one executor.
#[derive(Debug, Default)]
pub struct Timer {
    started: Option<Instant>,
    elapsed: Duration,
}

impl Timer {
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.elapsed += started.elapsed();
        }
    }

    /// Accumulated duration in seconds.
    pub fn duration(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

/// Run outcome: the slowest partition's duration and the derived
/// throughput.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub duration: f64,
    pub throughput: f64,
}

pub struct Coordinator {
    config: Config,
}

impl Coordinator {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Load the workload and execute it across all partitions.
    ///
    /// For each executor: construct the engine over the shared pool,
    /// persist its database descriptor, build the benchmark, and spawn a
    /// worker running `load(); execute();` with the execute phase timed.
    /// After joining all workers the engines are shut down (final log
    /// flush) and a background failure aborts the run.
    pub fn execute(&self) -> Result<Stats> {
        let config = &self.config;
        fs::create_dir_all(&config.fs_path)?;

        let pool = Arc::new(PmemPool::open(
            config.fs_path.join("pool"),
            config.pool_size,
        )?);
        let failed = Arc::new(AtomicBool::new(false));

        log::info!(
            "engine {} benchmark {}: {} executors, {} txns over {} keys",
            config.engine,
            config.benchmark,
            config.num_executors,
            config.num_txns,
            config.num_keys
        );

        // Construct every engine (and its roots) before marking the pool
        // initialized; init=1 is the final durable step of population.
        let mut engines: Vec<Arc<dyn KvEngine>> = Vec::with_capacity(config.num_executors);
        for pid in 0..config.num_executors {
            let engine: Arc<dyn KvEngine> =
                Arc::from(build_engine(config, Arc::clone(&pool), pid, Arc::clone(&failed))?);

            let schema = Schema::new(vec![
                FieldInfo::new(0, 4, 4, FieldType::Integer),
                FieldInfo::new(4, config.sz_value, config.sz_value, FieldType::Varchar),
            ]);
            let descriptor = schema.persist(&pool)?;
            pool.set_root(DB_ROOT_BASE + pid, descriptor)?;
            log::debug!("partition {} schema:\n{}", pid, schema);

            engines.push(engine);
        }
        pool.set_init(1)?;

        let timers: Vec<Arc<Mutex<Timer>>> = (0..config.num_executors)
            .map(|_| Arc::new(Mutex::new(Timer::default())))
            .collect();

        let mut workers = Vec::with_capacity(config.num_executors);
        for pid in 0..config.num_executors {
            let engine = Arc::clone(&engines[pid]);
            let timer = Arc::clone(&timers[pid]);
            let config = config.clone();

            workers.push(thread::spawn(move || -> Result<()> {
                let mut bench = build_benchmark(&config, pid, Arc::clone(&engine));
                bench.load()?;
                engine.start_workers();

                timer.lock().unwrap().start();
                let outcome = bench.execute();
                timer.lock().unwrap().stop();
                outcome
            }));
        }

        let mut first_error: Option<NvStoreError> = None;
        for (pid, worker) in workers.into_iter().enumerate() {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("partition {} failed: {}", pid, e);
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    log::error!("partition {} panicked", pid);
                    first_error
                        .get_or_insert(NvStoreError::Internal(format!("partition {} panicked", pid)));
                }
            }
        }

        for engine in &engines {
            engine.shutdown()?;
        }

        if failed.load(Ordering::Acquire) {
            return Err(NvStoreError::Log(
                "background worker reported a failure".to_string(),
            ));
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let duration = timers
            .iter()
            .map(|t| t.lock().unwrap().duration())
            .fold(0.0, f64::max);
        let throughput = if duration > 0.0 {
            config.num_txns as f64 / duration
        } else {
            0.0
        };

        log::info!(
            "{} txns in {:.3} s ({:.0} txns/s)",
            config.num_txns,
            duration,
            throughput
        );
        Ok(Stats {
            duration,
            throughput,
        })
    }
}
