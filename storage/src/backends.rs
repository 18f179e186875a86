//! Storage backend modules.
//!
//! A backend is an ordered byte-string keyspace with atomic batch writes.
//! All transaction logic (versions, conflict detection, retries) lives
//! above the backend in [`crate::Store`]; backends only move bytes.

pub mod memory;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;

use crate::Result;

/// One operation inside an atomic write batch.
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Ordered key/value backend.
pub trait Backend: Send {
    /// Get the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Collect all entries with `lo <= key` and (when `hi` is set)
    /// `key < hi`, in key order, descending when `reverse` is set.
    ///
    /// Callers always bound scans by an entity prefix, so result sets stay
    /// proportional to live rows of one kind.
    fn scan(&self, lo: &[u8], hi: Option<&[u8]>, reverse: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Atomically apply a batch of writes.
    fn apply(&mut self, batch: Vec<BatchOp>) -> Result<()>;
}
