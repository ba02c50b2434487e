//! nvstore - a persistent-memory key-value storage engine testbed
//!
//! Loads a YCSB- or TPCC-style workload, executes mixed read/update
//! transactions across partitions, and reports throughput for the
//! selected storage engine (WAL or LSM).

use std::path::PathBuf;
use std::process;

use log::{error, info};

use nvstore::{BenchmarkKind, Config, Coordinator, EngineType, NvStoreError};

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = Config::default();

    // Simple argument parsing
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config = match Config::load(&args[i + 1]) {
                        Ok(config) => config,
                        Err(e) => fail(e),
                    };
                    i += 1;
                }
            }
            "--engine" | "-e" => {
                if i + 1 < args.len() {
                    config.engine = match EngineType::from_name(&args[i + 1]) {
                        Some(engine) => engine,
                        None => fail(NvStoreError::Config(format!(
                            "unknown engine '{}'",
                            args[i + 1]
                        ))),
                    };
                    i += 1;
                }
            }
            "--benchmark" | "-b" => {
                if i + 1 < args.len() {
                    config.benchmark = match BenchmarkKind::from_name(&args[i + 1]) {
                        Some(benchmark) => benchmark,
                        None => fail(NvStoreError::Config(format!(
                            "unknown benchmark '{}'",
                            args[i + 1]
                        ))),
                    };
                    i += 1;
                }
            }
            "--executors" | "-x" => parse_into(&args, &mut i, &mut config.num_executors),
            "--parts" | "-p" => parse_into(&args, &mut i, &mut config.num_parts),
            "--txns" | "-t" => parse_into(&args, &mut i, &mut config.num_txns),
            "--keys" | "-k" => parse_into(&args, &mut i, &mut config.num_keys),
            "--value-size" | "-v" => parse_into(&args, &mut i, &mut config.sz_value),
            "--writes" | "-w" => parse_into(&args, &mut i, &mut config.per_writes),
            "--skew" | "-s" => parse_into(&args, &mut i, &mut config.skew),
            "--gc-interval" | "-g" => parse_into(&args, &mut i, &mut config.gc_interval_ms),
            "--lsm-interval" | "-l" => parse_into(&args, &mut i, &mut config.lsm_interval_ms),
            "--pool-size" => parse_into(&args, &mut i, &mut config.pool_size),
            "--fs-path" | "-f" => {
                if i + 1 < args.len() {
                    config.fs_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--seed" => {
                let mut seed = 0u64;
                parse_into(&args, &mut i, &mut seed);
                config.seed = Some(seed);
            }
            "--split-updates" => {
                config.split_updates = true;
            }
            "--help" | "-h" => {
                print_help();
                return;
            }
            other => {
                fail(NvStoreError::Config(format!("unknown option '{}'", other)));
            }
        }
        i += 1;
    }

    info!(
        "nvstore starting ({} engine, {} benchmark)",
        config.engine, config.benchmark
    );

    let coordinator = match Coordinator::new(config) {
        Ok(coordinator) => coordinator,
        Err(e) => fail(e),
    };
    match coordinator.execute() {
        Ok(stats) => {
            info!(
                "done: {:.3} s, {:.0} txns/s",
                stats.duration, stats.throughput
            );
        }
        Err(e) => fail(e),
    }
}

fn parse_into<T: std::str::FromStr>(args: &[String], i: &mut usize, slot: &mut T) {
    if *i + 1 < args.len() {
        match args[*i + 1].parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => fail(NvStoreError::Config(format!(
                "invalid value '{}' for {}",
                args[*i + 1],
                args[*i]
            ))),
        }
        *i += 1;
    }
}

fn fail(e: NvStoreError) -> ! {
    error!("{}", e);
    process::exit(e.exit_code());
}

fn print_help() {
    println!("nvstore - persistent-memory key-value storage engine testbed");
    println!();
    println!("Usage: nvstore [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -e, --engine ENGINE      Storage engine: wal | lsm (default: wal)");
    println!("  -b, --benchmark BENCH    Workload: ycsb | tpcc (default: ycsb)");
    println!("  -x, --executors N        Worker threads, one per partition (default: 1)");
    println!("  -p, --parts N            Key-range partitions (default: 1)");
    println!("  -t, --txns N             Total transactions (default: 1000)");
    println!("  -k, --keys N             Keys loaded before execution (default: 1000)");
    println!("  -v, --value-size BYTES   Record value size (default: 64)");
    println!("  -w, --writes FRACTION    Update fraction in [0,1] (default: 0.1)");
    println!("  -s, --skew SKEW          Zipf skew, 0 = uniform (default: 0.5)");
    println!("  -g, --gc-interval MS     Group-commit interval (default: 10)");
    println!("  -l, --lsm-interval MS    LSM merge interval (default: 10)");
    println!("  -f, --fs-path DIR        Data directory (default: ./data)");
    println!("      --pool-size BYTES    Mapped pool size (default: 64 MiB)");
    println!("      --seed SEED          Deterministic workload seed");
    println!("      --split-updates      Non-atomic LSM update (remove then insert)");
    println!("  -c, --config FILE        Load a JSON config (flags override it)");
    println!("  -h, --help               Show this help");
}
