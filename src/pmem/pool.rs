use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::MmapMut;

use crate::error::{NvStoreError, Result};

/// Number of root slots in the static area
pub const MAX_PTRS: usize = 128;

/// Identifies a formatted pool file
const POOL_MAGIC: u64 = 0x4e56_5354_4f52_4531;
const POOL_VERSION: u32 = 1;

// On-file layout, from offset 0
const MAGIC_OFF: usize = 0;
const VERSION_OFF: usize = 8;
const SIZE_OFF: usize = 16;
const COMMITTED_OFF: usize = 24;
const INIT_OFF: usize = 32;
const PTRS_OFF: usize = 40;
const HEAP_OFF: usize = PTRS_OFF + MAX_PTRS * 8;

/// A pool-resident address: an offset into the mapped file.
///
/// Offsets, unlike virtual addresses, are stable across restarts, so they
/// are what the static area and the NVM index store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PAddr(u64);

impl PAddr {
    pub fn from_offset(off: u64) -> Self {
        PAddr(off)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Address `delta` bytes past this one.
    pub fn offset(self, delta: u64) -> Self {
        PAddr(self.0 + delta)
    }
}

struct AllocState {
    /// Next unreserved offset. Starts at the durable high-water mark on
    /// open, so reservations that were never activated are reclaimed.
    cursor: u64,
    /// Blocks returned by `free_absolute`, as (block offset, total size).
    free: Vec<(u64, u64)>,
}

/// Persistent Memory Pool
///
/// A regular file mapped read-write. Allocation is a bump past the durable
/// high-water mark with a free list in front of it; `activate` flushes an
/// allocation's bytes and advances the mark. All allocation metadata is
/// serialized by a pool-wide mutex.
pub struct PmemPool {
    map: UnsafeCell<MmapMut>,
    path: PathBuf,
    size: u64,
    alloc: Mutex<AllocState>,
}

impl std::fmt::Debug for PmemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmemPool")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

// Data writes go to disjoint allocations owned by exactly one engine and
// serialized by that engine's table lock; allocator metadata is behind the
// mutex. The UnsafeCell only exists to allow `&self` writes into the map.
unsafe impl Send for PmemPool {}
unsafe impl Sync for PmemPool {}

impl PmemPool {
    /// Create or open the pool file at `path` with the given total size.
    ///
    /// A file that does not carry the pool magic is formatted from scratch;
    /// a formatted file keeps its static area and durable heap contents.
    pub fn open<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if size < (HEAP_OFF as u64) + 64 {
            return Err(NvStoreError::PoolOpen(format!(
                "pool size {} too small for header and static area",
                size
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| NvStoreError::PoolOpen(format!("{}: {}", path.display(), e)))?;
        let file_len = file
            .metadata()
            .map_err(|e| NvStoreError::PoolOpen(e.to_string()))?
            .len();
        if file_len < size {
            file.set_len(size)
                .map_err(|e| NvStoreError::PoolOpen(format!("set_len: {}", e)))?;
        }

        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| NvStoreError::PoolOpen(format!("mmap: {}", e)))?;

        let pool = PmemPool {
            map: UnsafeCell::new(map),
            path,
            size,
            alloc: Mutex::new(AllocState {
                cursor: HEAP_OFF as u64,
                free: Vec::new(),
            }),
        };

        if pool.read_u64(MAGIC_OFF as u64) != POOL_MAGIC {
            pool.format()?;
            log::info!("formatted new pool at {}", pool.path.display());
        } else {
            let committed = pool.read_u64(COMMITTED_OFF as u64);
            pool.alloc.lock().unwrap().cursor = committed.max(HEAP_OFF as u64);
            log::debug!(
                "opened pool at {} (committed {} bytes, init {})",
                pool.path.display(),
                committed,
                pool.init()
            );
        }

        Ok(pool)
    }

    fn format(&self) -> Result<()> {
        self.raw_write(0, &vec![0u8; HEAP_OFF]);
        self.write_u64(MAGIC_OFF as u64, POOL_MAGIC);
        self.write_u32(VERSION_OFF as u64, POOL_VERSION);
        self.write_u64(SIZE_OFF as u64, self.size);
        self.write_u64(COMMITTED_OFF as u64, HEAP_OFF as u64);
        self.flush_range(0, HEAP_OFF)?;
        self.alloc.lock().unwrap().cursor = HEAP_OFF as u64;
        Ok(())
    }

    /// Total pool size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// First heap offset; allocations live in `heap_start()..committed()`.
    pub fn heap_start() -> u64 {
        HEAP_OFF as u64
    }

    /// Durable high-water mark. Everything below it was activated.
    pub fn committed(&self) -> u64 {
        self.read_u64(COMMITTED_OFF as u64)
    }

    /// Payload size of the allocation at `addr`, as recorded in its block
    /// header. Walking `heap_start()..committed()` block by block visits
    /// every activated allocation in activation-mark order.
    pub fn block_payload(&self, block_off: u64) -> u64 {
        self.read_u64(block_off)
    }

    /// Reserve `size` bytes, 8-byte aligned. The block is usable at once
    /// but is garbage on restart until `activate` is called.
    pub fn reserve(&self, size: usize) -> Result<PAddr> {
        let payload = align8(size as u64);
        let total = 8 + payload;
        let mut state = self.alloc.lock().unwrap();

        // Reuse a freed block if one is big enough.
        if let Some(idx) = state.free.iter().position(|&(_, sz)| sz >= total) {
            let (off, sz) = state.free.swap_remove(idx);
            if sz > total {
                state.free.push((off + total, sz - total));
            }
            self.write_u64(off, payload);
            return Ok(PAddr(off + 8));
        }

        if state.cursor + total > self.size {
            return Err(NvStoreError::Alloc(format!(
                "need {} bytes, {} left in pool",
                total,
                self.size - state.cursor
            )));
        }
        let off = state.cursor;
        state.cursor += total;
        self.write_u64(off, payload);
        Ok(PAddr(off + 8))
    }

    /// Publish an allocation as durable: flush its bytes, then advance the
    /// durable high-water mark past it. Idempotent. Callers must activate
    /// children before any parent that references them; the monotone mark
    /// makes the child durable no later than the parent.
    pub fn activate(&self, addr: PAddr) -> Result<()> {
        let block = addr.get() - 8;
        let payload = self.read_u64(block);
        self.flush_range(block as usize, (8 + payload) as usize)?;

        let _guard = self.alloc.lock().unwrap();
        let end = addr.get() + payload;
        let committed = self.read_u64(COMMITTED_OFF as u64);
        if end > committed {
            self.write_u64(COMMITTED_OFF as u64, end);
            self.flush_range(COMMITTED_OFF, 8)?;
        }
        Ok(())
    }

    /// Reclaim a reserved or activated allocation.
    pub fn free_absolute(&self, addr: PAddr) {
        let block = addr.get() - 8;
        let payload = self.read_u64(block);
        let mut state = self.alloc.lock().unwrap();
        state.free.push((block, 8 + payload));
    }

    /// The `init` validity gate of the static area. Anything other than 1
    /// means the pool roots are not yet populated (cold start).
    pub fn init(&self) -> u32 {
        self.read_u32(INIT_OFF as u64)
    }

    /// Set the `init` flag. Writing 1 is the final durable step of initial
    /// population.
    pub fn set_init(&self, value: u32) -> Result<()> {
        self.write_u32(INIT_OFF as u64, value);
        self.flush_range(INIT_OFF, 4)
    }

    /// Read root slot `slot`. Empty slots read as `None`.
    pub fn root(&self, slot: usize) -> Result<Option<PAddr>> {
        if slot >= MAX_PTRS {
            return Err(NvStoreError::Internal(format!(
                "root slot {} out of range",
                slot
            )));
        }
        let raw = self.read_u64((PTRS_OFF + slot * 8) as u64);
        Ok(if raw == 0 { None } else { Some(PAddr(raw)) })
    }

    /// Durably store `addr` in root slot `slot`. The referenced object must
    /// already be activated.
    pub fn set_root(&self, slot: usize, addr: PAddr) -> Result<()> {
        if slot >= MAX_PTRS {
            return Err(NvStoreError::Internal(format!(
                "root slot {} out of range",
                slot
            )));
        }
        self.write_u64((PTRS_OFF + slot * 8) as u64, addr.get());
        self.flush_range(PTRS_OFF + slot * 8, 8)
    }

    /// Read `len` bytes at `addr`.
    pub fn read(&self, addr: PAddr, len: usize) -> &[u8] {
        let off = addr.get() as usize;
        let map = unsafe { &*self.map.get() };
        &map[off..off + len]
    }

    /// Write `bytes` at `addr`. Not durable until the allocation is
    /// activated or the range is flushed.
    pub fn write(&self, addr: PAddr, bytes: &[u8]) {
        self.raw_write(addr.get(), bytes);
    }

    /// Flush an arbitrary pool range (in-place updates of already
    /// activated records).
    pub fn flush(&self, addr: PAddr, len: usize) -> Result<()> {
        self.flush_range(addr.get() as usize, len)
    }

    pub fn read_u32(&self, off: u64) -> u32 {
        let map = unsafe { &*self.map.get() };
        let off = off as usize;
        u32::from_le_bytes(map[off..off + 4].try_into().unwrap())
    }

    pub fn read_u64(&self, off: u64) -> u64 {
        let map = unsafe { &*self.map.get() };
        let off = off as usize;
        u64::from_le_bytes(map[off..off + 8].try_into().unwrap())
    }

    pub fn write_u32(&self, off: u64, value: u32) {
        self.raw_write(off, &value.to_le_bytes());
    }

    pub fn write_u64(&self, off: u64, value: u64) {
        self.raw_write(off, &value.to_le_bytes());
    }

    fn raw_write(&self, off: u64, bytes: &[u8]) {
        let off = off as usize;
        let map = unsafe { &mut *self.map.get() };
        map[off..off + bytes.len()].copy_from_slice(bytes);
    }

    fn flush_range(&self, off: usize, len: usize) -> Result<()> {
        let map = unsafe { &*self.map.get() };
        map.flush_range(off, len).map_err(NvStoreError::Io)
    }
}

fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TEST_POOL_SIZE: u64 = 1 << 20;

    #[test]
    fn test_open_formats_fresh_pool() {
        let dir = tempdir().unwrap();
        let pool = PmemPool::open(dir.path().join("pool"), TEST_POOL_SIZE).unwrap();
        assert_eq!(pool.init(), 0);
        assert_eq!(pool.root(0).unwrap(), None);
    }

    #[test]
    fn test_pool_too_small() {
        let dir = tempdir().unwrap();
        let err = PmemPool::open(dir.path().join("pool"), 64).unwrap_err();
        assert!(matches!(err, NvStoreError::PoolOpen(_)));
    }

    #[test]
    fn test_reserve_write_read_back() {
        let dir = tempdir().unwrap();
        let pool = PmemPool::open(dir.path().join("pool"), TEST_POOL_SIZE).unwrap();

        let addr = pool.reserve(16).unwrap();
        assert_eq!(addr.get() % 8, 0);
        pool.write(addr, b"hello persistent");
        pool.activate(addr).unwrap();
        assert_eq!(pool.read(addr, 16), b"hello persistent");
    }

    #[test]
    fn test_activated_data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");

        let addr = {
            let pool = PmemPool::open(&path, TEST_POOL_SIZE).unwrap();
            let addr = pool.reserve(8).unwrap();
            pool.write(addr, b"durable!");
            pool.activate(addr).unwrap();
            pool.set_root(3, addr).unwrap();
            pool.set_init(1).unwrap();
            addr
        };

        let pool = PmemPool::open(&path, TEST_POOL_SIZE).unwrap();
        assert_eq!(pool.init(), 1);
        assert_eq!(pool.root(3).unwrap(), Some(addr));
        assert_eq!(pool.read(addr, 8), b"durable!");
    }

    #[test]
    fn test_unactivated_reservation_reclaimed_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");

        let reserved = {
            let pool = PmemPool::open(&path, TEST_POOL_SIZE).unwrap();
            pool.reserve(32).unwrap()
        };

        // Same offset comes back because nothing was activated.
        let pool = PmemPool::open(&path, TEST_POOL_SIZE).unwrap();
        let again = pool.reserve(32).unwrap();
        assert_eq!(reserved, again);
    }

    #[test]
    fn test_activation_is_idempotent() {
        let dir = tempdir().unwrap();
        let pool = PmemPool::open(dir.path().join("pool"), TEST_POOL_SIZE).unwrap();
        let addr = pool.reserve(8).unwrap();
        pool.write(addr, b"once....");
        pool.activate(addr).unwrap();
        pool.activate(addr).unwrap();
        assert_eq!(pool.read(addr, 8), b"once....");
    }

    #[test]
    fn test_free_block_is_reused() {
        let dir = tempdir().unwrap();
        let pool = PmemPool::open(dir.path().join("pool"), TEST_POOL_SIZE).unwrap();

        let a = pool.reserve(64).unwrap();
        pool.free_absolute(a);
        let b = pool.reserve(64).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_out_of_space() {
        let dir = tempdir().unwrap();
        let pool = PmemPool::open(dir.path().join("pool"), 4096 + HEAP_OFF as u64).unwrap();
        // First fits, second does not.
        pool.reserve(4000).unwrap();
        let err = pool.reserve(4000).unwrap_err();
        assert!(matches!(err, NvStoreError::Alloc(_)));
    }

    #[test]
    fn test_root_slot_bounds() {
        let dir = tempdir().unwrap();
        let pool = PmemPool::open(dir.path().join("pool"), TEST_POOL_SIZE).unwrap();
        assert!(pool.root(MAX_PTRS).is_err());
        let addr = pool.reserve(8).unwrap();
        assert!(pool.set_root(MAX_PTRS, addr).is_err());
    }
}
