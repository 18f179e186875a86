//! In-memory backend over a `BTreeMap`. The default backend, and the one
//! the test suites run against.

use std::collections::BTreeMap;
use std::ops::Bound;

use super::{Backend, BatchOp};
use crate::Result;

/// Heap-allocated ordered keyspace.
#[derive(Default)]
pub struct MemoryBackend {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(&self, lo: &[u8], hi: Option<&[u8]>, reverse: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let upper = match hi {
            Some(hi) => Bound::Excluded(hi.to_vec()),
            None => Bound::Unbounded,
        };
        let range = self
            .data
            .range::<Vec<u8>, _>((Bound::Included(lo.to_vec()), upper))
            .map(|(k, v)| (k.clone(), v.clone()));
        Ok(if reverse {
            range.rev().collect()
        } else {
            range.collect()
        })
    }

    fn apply(&mut self, batch: Vec<BatchOp>) -> Result<()> {
        for op in batch {
            match op {
                BatchOp::Put(key, value) => {
                    self.data.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    self.data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
