use tempfile::TempDir;

use nvstore::{BenchmarkKind, Config, Coordinator, EngineType};

fn run_config(temp_dir: &TempDir) -> Config {
    Config {
        fs_path: temp_dir.path().to_path_buf(),
        num_executors: 1,
        num_parts: 1,
        num_txns: 100,
        num_keys: 16,
        sz_value: 4,
        per_writes: 0.2,
        skew: 0.5,
        gc_interval_ms: 5,
        lsm_interval_ms: 5,
        pool_size: 8 << 20,
        seed: Some(42),
        ..Config::default()
    }
}

#[test]
fn test_read_only_run_reports_throughput() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        num_keys: 4,
        num_txns: 4,
        sz_value: 4,
        per_writes: 0.0,
        ..run_config(&temp_dir)
    };

    let stats = Coordinator::new(config).unwrap().execute().unwrap();
    assert!(stats.duration > 0.0);
    assert!(stats.throughput > 0.0);
}

#[test]
fn test_wal_run_completes() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        engine: EngineType::Wal,
        num_txns: 1000,
        num_keys: 100,
        ..run_config(&temp_dir)
    };

    let stats = Coordinator::new(config).unwrap().execute().unwrap();
    assert!(stats.duration > 0.0);
    assert!(stats.duration.is_finite());
}

#[test]
fn test_lsm_run_completes() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        engine: EngineType::Lsm,
        num_txns: 1000,
        num_keys: 100,
        ..run_config(&temp_dir)
    };

    let stats = Coordinator::new(config).unwrap().execute().unwrap();
    assert!(stats.duration > 0.0);
}

#[test]
fn test_multi_partition_run() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        num_executors: 4,
        num_parts: 4,
        num_txns: 400,
        num_keys: 64,
        ..run_config(&temp_dir)
    };

    let stats = Coordinator::new(config).unwrap().execute().unwrap();
    assert!(stats.duration > 0.0);
}

#[test]
fn test_tpcc_benchmark_run() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        benchmark: BenchmarkKind::Tpcc,
        num_txns: 200,
        num_keys: 32,
        ..run_config(&temp_dir)
    };

    let stats = Coordinator::new(config).unwrap().execute().unwrap();
    assert!(stats.duration > 0.0);
}

#[test]
fn test_lsm_multi_partition_with_split_updates() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        engine: EngineType::Lsm,
        split_updates: true,
        num_executors: 2,
        num_parts: 2,
        num_txns: 200,
        num_keys: 32,
        per_writes: 0.5,
        ..run_config(&temp_dir)
    };

    let stats = Coordinator::new(config).unwrap().execute().unwrap();
    assert!(stats.duration > 0.0);
}
