//! RocksDB backend, behind the `rocksdb-backend` feature. Persists the
//! keyspace in the file system; the transaction layer above is unchanged
//! because commit validation state is rebuilt empty on every process
//! start (transactions never span restarts).

use rocksdb::{Direction, IteratorMode, WriteBatch, DB};

use super::{Backend, BatchOp};
use crate::{Error, Result};

/// RocksDB-backed ordered keyspace.
pub struct RocksBackend {
    db: DB,
}

impl RocksBackend {
    /// Open (or create) a database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let db = DB::open_default(path).map_err(|e| Error::Backend(e.to_string()))?;
        Ok(RocksBackend { db })
    }
}

impl Backend for RocksBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .db
            .get(key)
            .map_err(|e| Error::Backend(e.to_string()))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn scan(&self, lo: &[u8], hi: Option<&[u8]>, reverse: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        if reverse {
            // Iterate down from just below `hi`; RocksDB's From/Reverse mode
            // starts at the last key <= the anchor.
            let anchor = match hi {
                Some(hi) => hi.to_vec(),
                None => vec![0xff; 255],
            };
            let iter = self
                .db
                .iterator(IteratorMode::From(&anchor, Direction::Reverse));
            for (key, value) in iter {
                if hi.is_some_and(|hi| key.as_ref() >= hi) {
                    continue;
                }
                if key.as_ref() < lo {
                    break;
                }
                out.push((key.to_vec(), value.to_vec()));
            }
        } else {
            let iter = self.db.iterator(IteratorMode::From(lo, Direction::Forward));
            for (key, value) in iter {
                if hi.is_some_and(|hi| key.as_ref() >= hi) {
                    break;
                }
                out.push((key.to_vec(), value.to_vec()));
            }
        }
        Ok(out)
    }

    fn apply(&mut self, batch: Vec<BatchOp>) -> Result<()> {
        let mut wb = WriteBatch::default();
        for op in batch {
            match op {
                BatchOp::Put(key, value) => wb
                    .put(&key, &value)
                    .map_err(|e| Error::Backend(e.to_string()))?,
                BatchOp::Delete(key) => wb
                    .delete(&key)
                    .map_err(|e| Error::Backend(e.to_string()))?,
            }
        }
        self.db
            .write(wb)
            .map_err(|e| Error::Backend(e.to_string()))
    }
}
