use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use tempfile::TempDir;

use nvstore::engines::{KvEngine, WalEngine};
use nvstore::pmem::PmemPool;
use nvstore::types::{OpKind, Txn};
use nvstore::undo::UndoLog;
use nvstore::Config;

fn setup_wal(num_keys: usize, sz_value: usize) -> (TempDir, Arc<PmemPool>, WalEngine) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        fs_path: temp_dir.path().to_path_buf(),
        num_keys,
        num_parts: 1,
        sz_value,
        ..Config::default()
    };
    let pool = Arc::new(PmemPool::open(temp_dir.path().join("pool"), 4 << 20).unwrap());
    let failed = Arc::new(AtomicBool::new(false));
    let engine = WalEngine::new(&config, Arc::clone(&pool), 0, failed).unwrap();
    (temp_dir, pool, engine)
}

fn txn(id: u64, op: OpKind, key: u32, value: &'static [u8]) -> Txn {
    Txn::new(id, op, key, Bytes::from_static(value))
}

#[test]
fn test_insert_update_read_sequence() {
    let (temp_dir, _pool, engine) = setup_wal(1, 4);

    engine.insert(&txn(0, OpKind::Insert, 1, b"AAAA")).unwrap();
    engine.update(&txn(1, OpKind::Update, 1, b"xxxx")).unwrap();
    assert_eq!(
        engine.read(&Txn::read(2, 1)).unwrap(),
        Some(Bytes::from_static(b"xxxx"))
    );

    // Two entries after the flush: the insert and the update.
    engine.flush_log().unwrap();
    let entries = UndoLog::read_entries(temp_dir.path().join("log")).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].op, OpKind::Insert);
    assert_eq!(entries[1].op, OpKind::Update);
    assert_eq!(entries[1].before.as_deref(), Some(b"AAAA".as_ref()));
}

#[test]
fn test_insert_remove_read_returns_none() {
    let (_temp_dir, _pool, engine) = setup_wal(8, 4);

    engine.insert(&txn(0, OpKind::Insert, 5, b"vvvv")).unwrap();
    engine.remove(&txn(1, OpKind::Delete, 5, b"")).unwrap();
    assert_eq!(engine.read(&Txn::read(2, 5)).unwrap(), None);
}

#[test]
fn test_concurrent_reader_never_sees_torn_value() {
    let (_temp_dir, _pool, engine) = setup_wal(512, 8);
    let engine = Arc::new(engine);

    let writer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for key in 0..512u32 {
                engine
                    .insert(&Txn::new(
                        key as u64,
                        OpKind::Insert,
                        key,
                        Bytes::from_static(b"CCCCCCCC"),
                    ))
                    .unwrap();
            }
        })
    };

    let reader = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for key in 0..512u32 {
                // Either absent (read raced ahead of the writer) or the
                // complete value, never a torn one.
                if let Some(value) = engine.read(&Txn::read(0, key)).unwrap() {
                    assert_eq!(value, Bytes::from_static(b"CCCCCCCC"));
                }
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
}

#[test]
fn test_group_commit_drains_undo_queue() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        fs_path: temp_dir.path().to_path_buf(),
        num_keys: 16,
        num_parts: 1,
        sz_value: 4,
        gc_interval_ms: 5,
        ..Config::default()
    };
    let pool = Arc::new(PmemPool::open(temp_dir.path().join("pool"), 4 << 20).unwrap());
    let failed = Arc::new(AtomicBool::new(false));
    let engine = WalEngine::new(&config, pool, 0, failed).unwrap();

    engine.start_workers();
    for key in 0..16u32 {
        engine
            .insert(&Txn::new(key as u64, OpKind::Insert, key, Bytes::from_static(b"gggg")))
            .unwrap();
    }
    thread::sleep(std::time::Duration::from_millis(100));
    engine.shutdown().unwrap();

    let entries = UndoLog::read_entries(temp_dir.path().join("log")).unwrap();
    assert_eq!(entries.len(), 16);
}

#[test]
fn test_values_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        fs_path: temp_dir.path().to_path_buf(),
        num_keys: 32,
        num_parts: 1,
        sz_value: 4,
        ..Config::default()
    };
    let failed = Arc::new(AtomicBool::new(false));

    {
        let pool = Arc::new(PmemPool::open(temp_dir.path().join("pool"), 4 << 20).unwrap());
        let engine = WalEngine::new(&config, Arc::clone(&pool), 0, Arc::clone(&failed)).unwrap();
        for key in 0..32u32 {
            engine
                .insert(&Txn::new(key as u64, OpKind::Insert, key, Bytes::from_static(b"dddd")))
                .unwrap();
        }
        engine
            .update(&Txn::new(99, OpKind::Update, 7, Bytes::from_static(b"uuuu")))
            .unwrap();
        engine.flush_log().unwrap();
        pool.set_init(1).unwrap();
    }

    let pool = Arc::new(PmemPool::open(temp_dir.path().join("pool"), 4 << 20).unwrap());
    let engine = WalEngine::new(&config, pool, 0, failed).unwrap();
    for key in 0..32u32 {
        let expected = if key == 7 { b"uuuu" } else { b"dddd" };
        assert_eq!(
            engine.read(&Txn::read(0, key)).unwrap(),
            Some(Bytes::from_static(expected)),
            "key {}",
            key
        );
    }
}
