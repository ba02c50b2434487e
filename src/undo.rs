//! Undo log and group commit
//!
//! The undo log is a bounded-memory queue of (before-image, after-image)
//! entries with an explicit durable flush. Writers `push` entries in table
//! order; a dedicated group-commit worker calls `write()` on a fixed
//! interval so many transactions share one fsync.
//!
//! ## Log format
//!
//! Each entry is binary-encoded (bincode) with a 4-byte little-endian
//! length prefix. `write()` drains the queue in FIFO order, then flushes
//! and fsyncs; the flush is durable on return. Entries pushed while a
//! flush is in progress appear in the next flush, never lost, never
//! duplicated.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NvStoreError, Result};
use crate::types::{OpKind, TxnId};

/// One undo-log entry. Insert has only an after-image, delete only a
/// before-image, update both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub txn_id: TxnId,
    pub op: OpKind,
    pub key: u32,
    pub before: Option<Vec<u8>>,
    pub after: Option<Vec<u8>>,
}

impl LogEntry {
    pub fn new(
        txn_id: TxnId,
        op: OpKind,
        key: u32,
        before: Option<Vec<u8>>,
        after: Option<Vec<u8>>,
    ) -> Self {
        Self {
            txn_id,
            op,
            key,
            before,
            after,
        }
    }
}

/// Backing-file open mode for `set_path`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Truncate an existing file (engine start)
    Truncate,
    /// Keep existing contents and append
    Append,
}

/// The undo log: an in-memory FIFO queue plus a backing file.
pub struct UndoLog {
    queue: Mutex<VecDeque<LogEntry>>,
    file: Mutex<Option<File>>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            file: Mutex::new(None),
        }
    }

    /// (Re)configure the backing file.
    pub fn set_path<P: AsRef<Path>>(&self, path: P, mode: LogMode) -> Result<()> {
        let path = path.as_ref();
        let mut opts = OpenOptions::new();
        opts.create(true).write(true);
        match mode {
            LogMode::Truncate => opts.truncate(true),
            LogMode::Append => opts.append(true),
        };
        let file = opts
            .open(path)
            .map_err(|e| NvStoreError::Log(format!("{}: {}", path.display(), e)))?;
        *self.file.lock().unwrap() = Some(file);
        Ok(())
    }

    /// Append an entry to the in-memory queue. O(1), thread-safe.
    pub fn push(&self, entry: LogEntry) {
        self.queue.lock().unwrap().push_back(entry);
    }

    /// Number of entries queued but not yet flushed.
    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Flush all currently queued entries to the backing file in FIFO
    /// order, durable on return. A call with nothing queued is a no-op.
    pub fn write(&self) -> Result<()> {
        // File lock first: concurrent `write` calls must not interleave
        // their batches. The queue lock is only held for the drain.
        let mut file_guard = self.file.lock().unwrap();

        let batch: Vec<LogEntry> = {
            let mut queue = self.queue.lock().unwrap();
            queue.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(());
        }

        let file = file_guard
            .as_mut()
            .ok_or_else(|| NvStoreError::Log("no backing file configured".to_string()))?;

        for entry in &batch {
            let encoded = bincode::serialize(entry)
                .map_err(|e| NvStoreError::Log(format!("encode: {}", e)))?;
            let len = encoded.len() as u32;
            file.write_all(&len.to_le_bytes())
                .map_err(|e| NvStoreError::Log(e.to_string()))?;
            file.write_all(&encoded)
                .map_err(|e| NvStoreError::Log(e.to_string()))?;
        }

        file.flush().map_err(|e| NvStoreError::Log(e.to_string()))?;
        file.sync_data()
            .map_err(|e| NvStoreError::Log(e.to_string()))?;

        log::debug!("undo log flushed {} entries", batch.len());
        Ok(())
    }

    /// Read every entry from a log file written by `write()`. Malformed
    /// trailing records are skipped with a warning, matching a torn final
    /// write.
    pub fn read_entries<P: AsRef<Path>>(path: P) -> Result<Vec<LogEntry>> {
        let mut file = File::open(path.as_ref())?;
        let mut entries = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut record_buf = vec![0u8; len];
            match file.read_exact(&mut record_buf) {
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            match bincode::deserialize(&record_buf) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    log::warn!("skipping malformed undo log entry: {}", e);
                    continue;
                }
            }
        }

        Ok(entries)
    }
}

impl Default for UndoLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a background worker. An explicit Stopping state (instead
/// of a bare bool) means a stop that races the worker's initial wait can
/// never lose the wakeup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Idle,
    Running,
    Stopping,
}

pub(crate) struct WorkerShared {
    pub state: Mutex<RunState>,
    pub cv: Condvar,
}

impl WorkerShared {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunState::Idle),
            cv: Condvar::new(),
        }
    }

    pub fn set(&self, state: RunState) {
        *self.state.lock().unwrap() = state;
        self.cv.notify_all();
    }
}

/// Handle to the group-commit worker thread.
///
/// The worker waits until started, then loops flushing the undo log and
/// sleeping `interval` between passes. An I/O failure sets the shared
/// failure flag and stops the worker; the coordinator observes the flag
/// on join.
pub struct GroupCommit {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl GroupCommit {
    pub fn start(log: Arc<UndoLog>, interval: Duration, failed: Arc<AtomicBool>) -> Self {
        let shared = Arc::new(WorkerShared::new());

        let worker_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            group_commit_loop(worker_shared, log, interval, failed);
        });

        shared.set(RunState::Running);
        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Stop the worker and join it. The caller issues the final
    /// `undo_log.write()` after this returns.
    pub fn stop(&mut self) {
        self.shared.set(RunState::Stopping);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GroupCommit {
    fn drop(&mut self) {
        self.stop();
    }
}

fn group_commit_loop(
    shared: Arc<WorkerShared>,
    log: Arc<UndoLog>,
    interval: Duration,
    failed: Arc<AtomicBool>,
) {
    let mut st = shared.state.lock().unwrap();
    while *st == RunState::Idle {
        st = shared.cv.wait(st).unwrap();
    }

    while *st == RunState::Running {
        drop(st);

        if let Err(e) = log.write() {
            log::error!("group commit flush failed: {}", e);
            failed.store(true, Ordering::Release);
            return;
        }

        st = shared.state.lock().unwrap();
        if *st != RunState::Running {
            break;
        }
        // A stop notification cuts the sleep short.
        let (guard, _) = shared.cv.wait_timeout(st, interval).unwrap();
        st = guard;
    }

    log::debug!("group commit worker stopped");
}
