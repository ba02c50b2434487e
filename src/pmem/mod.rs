//! Persistent memory pool
//!
//! A memory-mapped file presented as byte-addressable non-volatile memory.
//! The pool hands out allocations with reservation/activation semantics:
//! a reserved block is usable immediately but is reclaimed on restart
//! unless it was activated. A fixed static area of root slots is the only
//! entry point back into the pool after a restart.

mod pool;

pub use pool::{PAddr, PmemPool, MAX_PTRS};
