//! Core value types: transactions, records, and table schemas
//!
//! Records have two lives: a volatile copy inside an LSM memtable and a
//! pool-resident copy once activated. The pool wire form is
//! `[key: u32 LE][len: u32 LE][value bytes]`.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pmem::{PAddr, PmemPool};

/// Transaction ID
pub type TxnId = u64;

/// Operation kind carried by a transaction descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Read,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Insert => write!(f, "Insert"),
            OpKind::Update => write!(f, "Update"),
            OpKind::Delete => write!(f, "Delete"),
            OpKind::Read => write!(f, "Read"),
        }
    }
}

/// Transaction descriptor. A value type: cloning copies the id, the kind,
/// the key, and a reference-counted handle to the value buffer.
#[derive(Debug, Clone)]
pub struct Txn {
    pub id: TxnId,
    pub op: OpKind,
    pub key: u32,
    pub value: Bytes,
}

impl Txn {
    pub fn new(id: TxnId, op: OpKind, key: u32, value: Bytes) -> Self {
        Self { id, op, key, value }
    }

    /// A read descriptor carries no value.
    pub fn read(id: TxnId, key: u32) -> Self {
        Self::new(id, OpKind::Read, key, Bytes::new())
    }
}

/// Pool-resident record helpers.
///
/// A record is a (key, value) pair. Construction copies the caller's value
/// buffer into a fresh pool allocation and activates it; the returned
/// address is stable across restarts.
pub struct Record;

impl Record {
    const HEADER: usize = 8;

    /// Bytes a record with `value_len` value bytes occupies in the pool.
    pub fn layout_len(value_len: usize) -> usize {
        Self::HEADER + value_len
    }

    /// Copy (key, value) into the pool and activate the allocation.
    pub fn persist(pool: &PmemPool, key: u32, value: &[u8]) -> Result<PAddr> {
        let addr = pool.reserve(Self::layout_len(value.len()))?;
        pool.write_u32(addr.get(), key);
        pool.write_u32(addr.get() + 4, value.len() as u32);
        pool.write(addr.offset(Record::HEADER as u64), value);
        pool.activate(addr)?;
        Ok(addr)
    }

    pub fn read_key(pool: &PmemPool, addr: PAddr) -> u32 {
        pool.read_u32(addr.get())
    }

    /// Copy the record's value out of the pool.
    pub fn read_value(pool: &PmemPool, addr: PAddr) -> Bytes {
        let len = pool.read_u32(addr.get() + 4) as usize;
        let value = pool.read(addr.offset(Record::HEADER as u64), len);
        Bytes::copy_from_slice(value)
    }

    /// Overwrite the value of an already persisted record in place and
    /// flush the range. The new value must have the stored length.
    pub fn overwrite_value(pool: &PmemPool, addr: PAddr, value: &[u8]) -> Result<()> {
        let len = pool.read_u32(addr.get() + 4) as usize;
        if len != value.len() {
            return Err(crate::error::NvStoreError::Internal(format!(
                "in-place update with {} bytes over a {} byte value",
                value.len(),
                len
            )));
        }
        let value_addr = addr.offset(Record::HEADER as u64);
        pool.write(value_addr, value);
        pool.flush(addr, Self::layout_len(len))
    }
}

/// Field type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Integer,
    Double,
    Varchar,
}

/// Per-column layout information
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FieldInfo {
    /// Offset of the column within the serialized form
    pub offset: usize,
    /// Serialized length
    pub ser_len: usize,
    /// Deserialized (in-memory) length
    pub deser_len: usize,
    pub ftype: FieldType,
    pub inlined: bool,
    pub enabled: bool,
}

impl FieldInfo {
    pub fn new(offset: usize, ser_len: usize, deser_len: usize, ftype: FieldType) -> Self {
        Self {
            offset,
            ser_len,
            deser_len,
            ftype,
            inlined: true,
            enabled: true,
        }
    }
}

/// An immutable ordered column list with aggregate serialized and
/// deserialized lengths. Constructed once per table and persisted into the
/// pool so it can be found again from a root after restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<FieldInfo>,
    pub ser_len: usize,
    pub deser_len: usize,
}

impl Schema {
    pub fn new(fields: Vec<FieldInfo>) -> Self {
        let ser_len = fields.iter().map(|f| f.ser_len).sum();
        let deser_len = fields.iter().map(|f| f.deser_len).sum();
        Self {
            fields,
            ser_len,
            deser_len,
        }
    }

    /// Serialize the schema into a fresh pool allocation and activate it.
    pub fn persist(&self, pool: &PmemPool) -> Result<PAddr> {
        let encoded = bincode::serialize(self)
            .map_err(|e| crate::error::NvStoreError::Internal(e.to_string()))?;
        let addr = pool.reserve(4 + encoded.len())?;
        pool.write_u32(addr.get(), encoded.len() as u32);
        pool.write(addr.offset(4), &encoded);
        pool.activate(addr)?;
        Ok(addr)
    }

    /// Load a schema previously written by `persist`.
    pub fn load(pool: &PmemPool, addr: PAddr) -> Result<Self> {
        let len = pool.read_u32(addr.get()) as usize;
        let encoded = pool.read(addr.offset(4), len);
        bincode::deserialize(encoded)
            .map_err(|e| crate::error::NvStoreError::Internal(e.to_string()))
    }
}

/// Diagnostic dump of the column layout.
impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in &self.fields {
            writeln!(
                f,
                "offset: {:4}  ser_len: {:4}  deser_len: {:4}  type: {:?}  inlined: {}  enabled: {}",
                field.offset, field.ser_len, field.deser_len, field.ftype, field.inlined, field.enabled
            )?;
        }
        writeln!(f, "ser_len: {}  deser_len: {}", self.ser_len, self.deser_len)
    }
}
