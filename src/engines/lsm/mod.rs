//! LSM engine: double-buffered memtables merged into an NVM table
//!
//! Writes land in the active volatile memtable; a background merger
//! toggles the active generation and drains the now-passive one into a
//! pool-resident NVM table, recording each persisted record's stable
//! address in a volatile NVM index. Until a record is merged, the undo
//! log is its sole durable form.
//!
//! Readers probe active, then passive, then the NVM index, under one read
//! lock, so a merge is never observed half-applied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;

use crate::engines::{partition_path, EngineType, KvEngine};
use crate::error::{NvStoreError, Result};
use crate::pmem::{PAddr, PmemPool};
use crate::types::{OpKind, Record, Txn};
use crate::undo::{GroupCommit, LogEntry, LogMode, RunState, UndoLog, WorkerShared};
use crate::Config;

/// A memtable: key -> record value, `None` marking a tombstone. Tombstones
/// are dropped at merge time instead of reaching the NVM table.
type MemTable = HashMap<u32, Option<Bytes>>;

struct LsmTables {
    mem: [MemTable; 2],
    /// Which memtable receives writes. Toggling this is the generation
    /// boundary; only the merger toggles it.
    active: usize,
    /// key -> address of the persisted copy in the NVM table
    nvm_index: HashMap<u32, PAddr>,
}

struct LsmShared {
    tables: RwLock<LsmTables>,
    /// The NVM-resident table: an append-only pool over `usertable`.
    nvm: PmemPool,
    undo: Arc<UndoLog>,
}

impl LsmShared {
    /// One merge pass: retire the active generation and drain the retired
    /// memtable into the NVM table. The toggle and the drain share one
    /// write-locked critical section, so writers and readers observe the
    /// generation switch atomically and never a half-applied merge.
    fn merge_pass(&self) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        tables.active = 1 - tables.active;
        let passive = 1 - tables.active;

        let drained = std::mem::take(&mut tables.mem[passive]);
        let mut merged = 0usize;
        for (key, rec) in drained {
            if let Some(value) = rec {
                let addr = Record::persist(&self.nvm, key, &value)?;
                tables.nvm_index.insert(key, addr);
                merged += 1;
            }
        }
        if merged > 0 {
            log::debug!("merged {} records into nvm table", merged);
        }
        Ok(())
    }
}

/// The LSM engine. One instance per partition.
pub struct LsmEngine {
    shared: Arc<LsmShared>,
    merger: Mutex<Option<Merger>>,
    gc: Mutex<Option<GroupCommit>>,
    gc_interval: Duration,
    lsm_interval: Duration,
    failed: Arc<AtomicBool>,
    /// Restore the original non-atomic remove-then-insert update path.
    split_updates: bool,
}

impl LsmEngine {
    pub fn new(
        config: &Config,
        _pool: Arc<PmemPool>,
        pid: usize,
        failed: Arc<AtomicBool>,
    ) -> Result<Self> {
        let log_path = partition_path(&config.fs_path, "log", pid);
        let table_path = partition_path(&config.fs_path, "usertable", pid);
        let nvm = PmemPool::open(&table_path, config.pool_size)?;

        // Rebuild the volatile NVM index from the durable table, then
        // replay the surviving log into the active memtable. Both are
        // empty on a cold start.
        let mut nvm_index = Self::rebuild_nvm_index(&nvm);
        let mut active_mem = MemTable::new();
        if log_path.exists() {
            for entry in UndoLog::read_entries(&log_path)? {
                match entry.op {
                    OpKind::Insert => {
                        if let Some(after) = entry.after {
                            active_mem.insert(entry.key, Some(Bytes::from(after)));
                        }
                    }
                    OpKind::Delete => {
                        active_mem.remove(&entry.key);
                        nvm_index.remove(&entry.key);
                    }
                    _ => {}
                }
            }
        }
        // A replayed insert shadows any copy merged before the crash.
        for key in active_mem.keys() {
            nvm_index.remove(key);
        }

        let undo = Arc::new(UndoLog::new());
        undo.set_path(&log_path, LogMode::Truncate)?;

        let shared = Arc::new(LsmShared {
            tables: RwLock::new(LsmTables {
                mem: [active_mem, MemTable::new()],
                active: 0,
                nvm_index,
            }),
            nvm,
            undo,
        });

        Ok(Self {
            shared,
            merger: Mutex::new(None),
            gc: Mutex::new(None),
            gc_interval: Duration::from_millis(config.gc_interval_ms),
            lsm_interval: Duration::from_millis(config.lsm_interval_ms),
            failed,
            split_updates: config.split_updates,
        })
    }

    /// Walk the activated span of the NVM table block by block; later
    /// records win, matching merge order.
    fn rebuild_nvm_index(nvm: &PmemPool) -> HashMap<u32, PAddr> {
        let mut index = HashMap::new();
        let mut off = PmemPool::heap_start();
        let committed = nvm.committed();
        while off < committed {
            let payload = nvm.block_payload(off);
            let rec = PAddr::from_offset(off + 8);
            index.insert(Record::read_key(nvm, rec), rec);
            off += 8 + payload;
        }
        if !index.is_empty() {
            log::info!("lsm recovery: {} records in nvm table", index.len());
        }
        index
    }

    /// Run one merge pass synchronously (tests and controlled drains).
    pub fn force_merge(&self) -> Result<()> {
        self.shared.merge_pass()
    }

    /// True if the key currently resolves through the NVM index.
    pub fn in_nvm_index(&self, key: u32) -> bool {
        self.shared.tables.read().unwrap().nvm_index.contains_key(&key)
    }

    fn remove_locked(tables: &mut LsmTables, undo: &UndoLog, txn: &Txn) -> Result<()> {
        let active = tables.active;
        let passive = 1 - active;

        if let Some(before) = tables.mem[active].remove(&txn.key) {
            undo.push(LogEntry::new(
                txn.id,
                OpKind::Delete,
                txn.key,
                before.map(|b| b.to_vec()),
                None,
            ));
            return Ok(());
        }

        if let Some(before) = tables.mem[passive].get(&txn.key) {
            // The passive generation is owned by the merger; record the
            // intent in the log only.
            undo.push(LogEntry::new(
                txn.id,
                OpKind::Delete,
                txn.key,
                before.clone().map(|b| b.to_vec()),
                None,
            ));
            return Ok(());
        }

        if tables.nvm_index.remove(&txn.key).is_some() {
            return Ok(());
        }

        Err(NvStoreError::NotFound(txn.key))
    }
}

impl KvEngine for LsmEngine {
    fn engine_type(&self) -> EngineType {
        EngineType::Lsm
    }

    fn insert(&self, txn: &Txn) -> Result<()> {
        let mut tables = self.shared.tables.write().unwrap();
        let active = tables.active;
        // Only the active generation is checked: a key living in the
        // passive memtable or the NVM table is shadowed by the new entry.
        if tables.mem[active].contains_key(&txn.key) {
            return Err(NvStoreError::DuplicateKey(txn.key));
        }
        tables.mem[active].insert(txn.key, Some(txn.value.clone()));

        self.shared.undo.push(LogEntry::new(
            txn.id,
            OpKind::Insert,
            txn.key,
            None,
            Some(txn.value.to_vec()),
        ));
        Ok(())
    }

    fn read(&self, txn: &Txn) -> Result<Option<Bytes>> {
        let tables = self.shared.tables.read().unwrap();
        let active = tables.active;

        if let Some(rec) = tables.mem[active].get(&txn.key) {
            return Ok(rec.clone());
        }
        if let Some(rec) = tables.mem[1 - active].get(&txn.key) {
            return Ok(rec.clone());
        }
        if let Some(&addr) = tables.nvm_index.get(&txn.key) {
            return Ok(Some(Record::read_value(&self.shared.nvm, addr)));
        }
        Ok(None)
    }

    fn update(&self, txn: &Txn) -> Result<()> {
        if self.split_updates {
            // The original pair: a reader between the two steps may see
            // the key absent.
            let _ = self.remove(txn);
            return self.insert(txn);
        }

        let mut tables = self.shared.tables.write().unwrap();
        let _ = Self::remove_locked(&mut tables, &self.shared.undo, txn);
        let active = tables.active;
        tables.mem[active].insert(txn.key, Some(txn.value.clone()));
        self.shared.undo.push(LogEntry::new(
            txn.id,
            OpKind::Insert,
            txn.key,
            None,
            Some(txn.value.to_vec()),
        ));
        Ok(())
    }

    fn remove(&self, txn: &Txn) -> Result<()> {
        let mut tables = self.shared.tables.write().unwrap();
        Self::remove_locked(&mut tables, &self.shared.undo, txn)
    }

    fn flush_log(&self) -> Result<()> {
        self.shared.undo.write()
    }

    fn start_workers(&self) {
        {
            let mut merger = self.merger.lock().unwrap();
            if merger.is_none() {
                *merger = Some(Merger::start(
                    Arc::clone(&self.shared),
                    self.lsm_interval,
                    Arc::clone(&self.failed),
                ));
            }
        }
        let mut gc = self.gc.lock().unwrap();
        if gc.is_none() {
            *gc = Some(GroupCommit::start(
                Arc::clone(&self.shared.undo),
                self.gc_interval,
                Arc::clone(&self.failed),
            ));
        }
    }

    fn shutdown(&self) -> Result<()> {
        if let Some(mut merger) = self.merger.lock().unwrap().take() {
            merger.stop();
        }
        if let Some(mut gc) = self.gc.lock().unwrap().take() {
            gc.stop();
        }
        self.shared.undo.write()
    }
}

/// Handle to the background merger thread. The merger owns the generation
/// toggle, so one pass fully drains before the next begins.
struct Merger {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl Merger {
    fn start(lsm: Arc<LsmShared>, interval: Duration, failed: Arc<AtomicBool>) -> Self {
        let shared = Arc::new(WorkerShared::new());

        let worker_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            merge_loop(worker_shared, lsm, interval, failed);
        });

        shared.set(RunState::Running);
        Self {
            shared,
            handle: Some(handle),
        }
    }

    fn stop(&mut self) {
        self.shared.set(RunState::Stopping);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Merger {
    fn drop(&mut self) {
        self.stop();
    }
}

fn merge_loop(
    shared: Arc<WorkerShared>,
    lsm: Arc<LsmShared>,
    interval: Duration,
    failed: Arc<AtomicBool>,
) {
    let mut st = shared.state.lock().unwrap();
    while *st == RunState::Idle {
        st = shared.cv.wait(st).unwrap();
    }

    while *st == RunState::Running {
        drop(st);

        if let Err(e) = lsm.merge_pass() {
            log::error!("merge pass failed: {}", e);
            failed.store(true, Ordering::Release);
            return;
        }

        st = shared.state.lock().unwrap();
        if *st != RunState::Running {
            break;
        }
        let (guard, _) = shared.cv.wait_timeout(st, interval).unwrap();
        st = guard;
    }

    log::debug!("merger stopped");
}
