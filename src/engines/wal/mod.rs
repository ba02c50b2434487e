//! WAL engine: in-place updates on NVM backed by an undo log
//!
//! The primary store is a sequence of pool-resident records plus a hash
//! index from key to record address. Updates overwrite record values in
//! place; every mutation pushes a (before, after) entry onto the undo log
//! inside the same write-locked section, so log order matches table order.
//! A group-commit worker flushes the log on a fixed interval.
//!
//! ## Durability
//!
//! Records are activated before the pool-resident directory references
//! them, and the partition's static-area root points at the directory.
//! After a restart the directory gives back the table and the index; the
//! undo log bounds the window of in-place stores that may be torn.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;

use crate::engines::{partition_path, EngineType, KvEngine};
use crate::error::{NvStoreError, Result};
use crate::pmem::{PAddr, PmemPool};
use crate::types::{OpKind, Record, Txn};
use crate::undo::{GroupCommit, LogEntry, LogMode, UndoLog};
use crate::Config;

/// Pool-resident record directory: `[count: u64][slot: u64; capacity]`.
/// The partition root slot points here; appends flush the written slot and
/// then the count, so a crash can never expose an unwritten slot.
struct Directory {
    addr: PAddr,
    capacity: usize,
}

impl Directory {
    fn create(pool: &PmemPool, capacity: usize) -> Result<Self> {
        let addr = pool.reserve(8 + capacity * 8)?;
        pool.write_u64(addr.get(), 0);
        pool.activate(addr)?;
        Ok(Self { addr, capacity })
    }

    fn load(pool: &PmemPool, addr: PAddr) -> Self {
        // Capacity is recoverable from the allocation's block header.
        let payload = pool.block_payload(addr.get() - 8);
        Self {
            addr,
            capacity: ((payload - 8) / 8) as usize,
        }
    }

    fn count(&self, pool: &PmemPool) -> usize {
        pool.read_u64(self.addr.get()) as usize
    }

    fn slot(&self, pool: &PmemPool, idx: usize) -> PAddr {
        PAddr::from_offset(pool.read_u64(self.addr.get() + 8 + (idx as u64) * 8))
    }

    /// Append a record address, growing into a fresh allocation when full.
    fn append(&mut self, pool: &PmemPool, root_slot: usize, rec: PAddr) -> Result<()> {
        let count = self.count(pool);
        if count == self.capacity {
            let grown = Directory::create(pool, self.capacity * 2)?;
            for idx in 0..count {
                pool.write_u64(grown.addr.get() + 8 + (idx as u64) * 8, self.slot(pool, idx).get());
            }
            pool.write_u64(grown.addr.get(), count as u64);
            pool.activate(grown.addr)?;
            pool.set_root(root_slot, grown.addr)?;
            pool.free_absolute(self.addr);
            *self = grown;
        }

        let slot_off = self.addr.get() + 8 + (count as u64) * 8;
        pool.write_u64(slot_off, rec.get());
        pool.flush(PAddr::from_offset(slot_off), 8)?;
        pool.write_u64(self.addr.get(), (count + 1) as u64);
        pool.flush(self.addr, 8)
    }
}

struct WalTable {
    /// Record addresses in append order
    entries: Vec<PAddr>,
    /// key -> record address
    index: HashMap<u32, PAddr>,
    dir: Directory,
}

/// The WAL engine. One instance per partition.
pub struct WalEngine {
    pool: Arc<PmemPool>,
    table: RwLock<WalTable>,
    undo: Arc<UndoLog>,
    gc: Mutex<Option<GroupCommit>>,
    gc_interval: Duration,
    failed: Arc<AtomicBool>,
    root_slot: usize,
}

impl WalEngine {
    pub fn new(
        config: &Config,
        pool: Arc<PmemPool>,
        pid: usize,
        failed: Arc<AtomicBool>,
    ) -> Result<Self> {
        let root_slot = pid;
        let log_path = partition_path(&config.fs_path, "log", pid);

        let table = if pool.init() == 1 && pool.root(root_slot)?.is_some() {
            Self::recover(&pool, root_slot, &log_path)?
        } else {
            let capacity = (config.num_keys / config.num_parts.max(1)).max(64) * 2;
            let dir = Directory::create(&pool, capacity)?;
            pool.set_root(root_slot, dir.addr)?;
            WalTable {
                entries: Vec::new(),
                index: HashMap::new(),
                dir,
            }
        };

        let undo = Arc::new(UndoLog::new());
        undo.set_path(&log_path, LogMode::Truncate)?;

        Ok(Self {
            pool,
            table: RwLock::new(table),
            undo,
            gc: Mutex::new(None),
            gc_interval: Duration::from_millis(config.gc_interval_ms),
            failed,
            root_slot,
        })
    }

    /// Rebuild the table and index from the pool-resident directory, then
    /// re-apply removals recorded in the surviving undo log (a removed key
    /// is unlinked from the index only, its record stays in the sequence).
    fn recover(
        pool: &PmemPool,
        root_slot: usize,
        log_path: &std::path::Path,
    ) -> Result<WalTable> {
        let root = pool
            .root(root_slot)?
            .ok_or_else(|| NvStoreError::Internal(format!("empty root slot {}", root_slot)))?;
        let dir = Directory::load(pool, root);

        let count = dir.count(pool);
        let mut entries = Vec::with_capacity(count);
        let mut index = HashMap::with_capacity(count);
        for idx in 0..count {
            let rec = dir.slot(pool, idx);
            entries.push(rec);
            index.insert(Record::read_key(pool, rec), rec);
        }

        if log_path.exists() {
            for entry in UndoLog::read_entries(log_path)? {
                if entry.op == OpKind::Delete && entry.after.is_none() {
                    index.remove(&entry.key);
                }
            }
        }

        log::info!(
            "wal recovery: {} records, {} live keys",
            entries.len(),
            index.len()
        );
        Ok(WalTable {
            entries,
            index,
            dir,
        })
    }

    /// Records appended to the table sequence (removed keys included).
    pub fn table_len(&self) -> usize {
        self.table.read().unwrap().entries.len()
    }
}

impl KvEngine for WalEngine {
    fn engine_type(&self) -> EngineType {
        EngineType::Wal
    }

    fn insert(&self, txn: &Txn) -> Result<()> {
        let mut table = self.table.write().unwrap();
        if table.index.contains_key(&txn.key) {
            return Err(NvStoreError::DuplicateKey(txn.key));
        }

        let rec = Record::persist(&self.pool, txn.key, &txn.value)?;
        table.dir.append(&self.pool, self.root_slot, rec)?;
        table.entries.push(rec);
        table.index.insert(txn.key, rec);

        self.undo.push(LogEntry::new(
            txn.id,
            OpKind::Insert,
            txn.key,
            None,
            Some(txn.value.to_vec()),
        ));
        Ok(())
    }

    fn read(&self, txn: &Txn) -> Result<Option<Bytes>> {
        let table = self.table.read().unwrap();
        Ok(table
            .index
            .get(&txn.key)
            .map(|&rec| Record::read_value(&self.pool, rec)))
    }

    fn update(&self, txn: &Txn) -> Result<()> {
        let table = self.table.write().unwrap();
        let &rec = table
            .index
            .get(&txn.key)
            .ok_or(NvStoreError::NotFound(txn.key))?;

        let before = Record::read_value(&self.pool, rec);
        Record::overwrite_value(&self.pool, rec, &txn.value)?;

        self.undo.push(LogEntry::new(
            txn.id,
            OpKind::Update,
            txn.key,
            Some(before.to_vec()),
            Some(txn.value.to_vec()),
        ));
        Ok(())
    }

    fn remove(&self, txn: &Txn) -> Result<()> {
        let mut table = self.table.write().unwrap();
        let rec = table
            .index
            .remove(&txn.key)
            .ok_or(NvStoreError::NotFound(txn.key))?;

        let before = Record::read_value(&self.pool, rec);
        self.undo.push(LogEntry::new(
            txn.id,
            OpKind::Delete,
            txn.key,
            Some(before.to_vec()),
            None,
        ));
        Ok(())
    }

    fn flush_log(&self) -> Result<()> {
        self.undo.write()
    }

    fn start_workers(&self) {
        let mut gc = self.gc.lock().unwrap();
        if gc.is_none() {
            *gc = Some(GroupCommit::start(
                Arc::clone(&self.undo),
                self.gc_interval,
                Arc::clone(&self.failed),
            ));
        }
    }

    fn shutdown(&self) -> Result<()> {
        if let Some(mut gc) = self.gc.lock().unwrap().take() {
            gc.stop();
        }
        self.undo.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            fs_path: dir.to_path_buf(),
            num_keys: 64,
            num_parts: 1,
            sz_value: 4,
            ..Config::default()
        }
    }

    fn setup(dir: &std::path::Path) -> (Arc<PmemPool>, WalEngine) {
        let config = test_config(dir);
        let pool = Arc::new(PmemPool::open(dir.join("pool"), 1 << 20).unwrap());
        let failed = Arc::new(AtomicBool::new(false));
        let engine = WalEngine::new(&config, Arc::clone(&pool), 0, failed).unwrap();
        (pool, engine)
    }

    fn txn(id: u64, op: OpKind, key: u32, value: &'static [u8]) -> Txn {
        Txn::new(id, op, key, Bytes::from_static(value))
    }

    #[test]
    fn test_insert_then_read() {
        let dir = tempdir().unwrap();
        let (_pool, engine) = setup(dir.path());

        engine.insert(&txn(1, OpKind::Insert, 7, b"AAAA")).unwrap();
        let got = engine.read(&Txn::read(2, 7)).unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"AAAA")));
    }

    #[test]
    fn test_insert_duplicate_fails() {
        let dir = tempdir().unwrap();
        let (_pool, engine) = setup(dir.path());

        engine.insert(&txn(1, OpKind::Insert, 7, b"AAAA")).unwrap();
        let err = engine.insert(&txn(2, OpKind::Insert, 7, b"BBBB")).unwrap_err();
        assert!(matches!(err, NvStoreError::DuplicateKey(7)));
    }

    #[test]
    fn test_read_absent_key() {
        let dir = tempdir().unwrap();
        let (_pool, engine) = setup(dir.path());
        assert_eq!(engine.read(&Txn::read(1, 99)).unwrap(), None);
    }

    #[test]
    fn test_update_in_place() {
        let dir = tempdir().unwrap();
        let (_pool, engine) = setup(dir.path());

        engine.insert(&txn(1, OpKind::Insert, 1, b"AAAA")).unwrap();
        engine.update(&txn(2, OpKind::Update, 1, b"xxxx")).unwrap();
        assert_eq!(
            engine.read(&Txn::read(3, 1)).unwrap(),
            Some(Bytes::from_static(b"xxxx"))
        );
        // Idempotent on read.
        assert_eq!(
            engine.read(&Txn::read(4, 1)).unwrap(),
            Some(Bytes::from_static(b"xxxx"))
        );
        // In place: still a single table entry.
        assert_eq!(engine.table_len(), 1);
    }

    #[test]
    fn test_update_absent_key_fails() {
        let dir = tempdir().unwrap();
        let (_pool, engine) = setup(dir.path());
        let err = engine.update(&txn(1, OpKind::Update, 5, b"xxxx")).unwrap_err();
        assert!(matches!(err, NvStoreError::NotFound(5)));
    }

    #[test]
    fn test_insert_remove_read_round_trip() {
        let dir = tempdir().unwrap();
        let (_pool, engine) = setup(dir.path());

        engine.insert(&txn(1, OpKind::Insert, 3, b"AAAA")).unwrap();
        engine.remove(&txn(2, OpKind::Delete, 3, b"")).unwrap();
        assert_eq!(engine.read(&Txn::read(3, 3)).unwrap(), None);
    }

    #[test]
    fn test_remove_absent_key_fails() {
        let dir = tempdir().unwrap();
        let (_pool, engine) = setup(dir.path());
        let err = engine.remove(&txn(1, OpKind::Delete, 3, b"")).unwrap_err();
        assert!(matches!(err, NvStoreError::NotFound(3)));
    }

    #[test]
    fn test_undo_entries_match_operations() {
        let dir = tempdir().unwrap();
        let (_pool, engine) = setup(dir.path());

        engine.insert(&txn(1, OpKind::Insert, 1, b"AAAA")).unwrap();
        engine.update(&txn(2, OpKind::Update, 1, b"xxxx")).unwrap();
        engine.flush_log().unwrap();

        let entries = UndoLog::read_entries(dir.path().join("log")).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].op, OpKind::Insert);
        assert!(entries[0].before.is_none());
        assert_eq!(entries[0].after.as_deref(), Some(b"AAAA".as_ref()));
        // The update's before-image equals the pre-update value.
        assert_eq!(entries[1].op, OpKind::Update);
        assert_eq!(entries[1].before.as_deref(), Some(b"AAAA".as_ref()));
        assert_eq!(entries[1].after.as_deref(), Some(b"xxxx".as_ref()));
    }

    #[test]
    fn test_directory_grows_past_initial_capacity() {
        let dir = tempdir().unwrap();
        let config = Config {
            fs_path: dir.path().to_path_buf(),
            num_keys: 8, // initial capacity 64*2, so force growth with more
            num_parts: 8,
            sz_value: 4,
            ..Config::default()
        };
        let pool = Arc::new(PmemPool::open(dir.path().join("pool"), 4 << 20).unwrap());
        let failed = Arc::new(AtomicBool::new(false));
        let engine = WalEngine::new(&config, Arc::clone(&pool), 0, failed).unwrap();

        for key in 0..300u32 {
            engine
                .insert(&Txn::new(key as u64, OpKind::Insert, key, Bytes::from_static(b"vvvv")))
                .unwrap();
        }
        for key in 0..300u32 {
            assert!(engine.read(&Txn::read(0, key)).unwrap().is_some());
        }
    }

    #[test]
    fn test_recovery_rebuilds_index_from_roots() {
        let dir = tempdir().unwrap();
        let pool_path = dir.path().join("pool");
        let config = test_config(dir.path());
        let failed = Arc::new(AtomicBool::new(false));

        {
            let pool = Arc::new(PmemPool::open(&pool_path, 1 << 20).unwrap());
            let engine =
                WalEngine::new(&config, Arc::clone(&pool), 0, Arc::clone(&failed)).unwrap();
            engine.insert(&txn(1, OpKind::Insert, 1, b"AAAA")).unwrap();
            engine.insert(&txn(2, OpKind::Insert, 2, b"BBBB")).unwrap();
            engine.remove(&txn(3, OpKind::Delete, 2, b"")).unwrap();
            engine.flush_log().unwrap();
            pool.set_init(1).unwrap();
        }

        let pool = Arc::new(PmemPool::open(&pool_path, 1 << 20).unwrap());
        let engine = WalEngine::new(&config, Arc::clone(&pool), 0, failed).unwrap();
        assert_eq!(
            engine.read(&Txn::read(4, 1)).unwrap(),
            Some(Bytes::from_static(b"AAAA"))
        );
        // The removed key was unlinked again during log replay.
        assert_eq!(engine.read(&Txn::read(5, 2)).unwrap(), None);
    }

    #[test]
    fn test_workers_start_and_shutdown() {
        let dir = tempdir().unwrap();
        let (_pool, engine) = setup(dir.path());

        engine.start_workers();
        engine.insert(&txn(1, OpKind::Insert, 1, b"AAAA")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        engine.shutdown().unwrap();

        let entries = UndoLog::read_entries(dir.path().join("log")).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
