//! The store and its optimistic serializable transactions.
//!
//! Concurrency control is first-updater-wins OCC. A transaction records
//! the version of every key it touches and the commit sequence visible to
//! every range it scans; commit revalidates both under the store lock and
//! applies the write set atomically, or fails with [`Error::Conflict`] so
//! the enclosing [`Store::serializable`] call can re-run the closure.
//! Key versions survive deletion (tombstones), so delete/recreate races
//! are detected like any other write.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{de::DeserializeOwned, Serialize};

use crate::backends::{memory::MemoryBackend, Backend, BatchOp};
use crate::{Error, Result};

struct Inner {
    backend: Box<dyn Backend>,
    /// Last commit sequence that wrote each key. Keys are never evicted.
    versions: BTreeMap<Vec<u8>, u64>,
    commit_seq: u64,
}

/// Shared handle to a storage engine instance.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
}

impl Store {
    /// Store over the in-memory backend.
    pub fn in_memory() -> Self {
        Store::with_backend(Box::new(MemoryBackend::new()))
    }

    /// Store over an arbitrary backend.
    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        Store {
            inner: Arc::new(Mutex::new(Inner {
                backend,
                versions: BTreeMap::new(),
                commit_seq: 0,
            })),
        }
    }

    /// Begin a transaction. Prefer [`Store::serializable`] or
    /// [`Store::view`]; `begin` exists for code that must hold a
    /// transaction open across helper calls.
    pub fn begin(&self) -> Tx {
        Tx {
            inner: Arc::clone(&self.inner),
            reads: HashMap::new(),
            scans: Vec::new(),
            writes: BTreeMap::new(),
        }
    }

    /// Run `f` inside a serializable transaction, committing on success.
    ///
    /// When commit validation detects a conflicting committed write, `f`
    /// is re-invoked from scratch against fresh state, exactly like a SQL
    /// client retrying on a serialization-failure error code. Any error
    /// returned by `f` itself rolls the transaction back (the write set is
    /// dropped) and surfaces unchanged.
    pub fn serializable<T, E, F>(&self, mut f: F) -> std::result::Result<T, E>
    where
        F: FnMut(&mut Tx) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let mut tries = 0u32;
        loop {
            let mut tx = self.begin();
            let out = f(&mut tx)?;
            match tx.commit() {
                Ok(()) => return Ok(out),
                Err(Error::Conflict) => {
                    tries += 1;
                    log::debug!("retrying serializable transaction: try {tries}");
                }
                Err(e) => return Err(E::from(e)),
            }
        }
    }

    /// Run a read-only closure against a consistent snapshot. Writes made
    /// through the transaction are silently discarded.
    pub fn view<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Tx) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let mut tx = self.begin();
        f(&mut tx)
    }
}

struct ScanRange {
    lo: Vec<u8>,
    hi: Option<Vec<u8>>,
    seen_seq: u64,
}

/// An open transaction.
///
/// Reads observe the transaction's own writes. All values are serde types
/// marshalled with bincode.
pub struct Tx {
    inner: Arc<Mutex<Inner>>,
    reads: HashMap<Vec<u8>, u64>,
    scans: Vec<ScanRange>,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Tx {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock means another thread panicked mid-commit
        // validation (not mid-apply, which is infallible for the memory
        // backend); the data itself is consistent.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn get_raw(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }
        let inner = self.lock();
        let version = inner.versions.get(key).copied().unwrap_or(0);
        let value = inner.backend.get(key)?;
        drop(inner);
        self.reads.entry(key.to_vec()).or_insert(version);
        Ok(value)
    }

    /// Record the key in the validation set before a blind write, so that
    /// two transactions updating the same key cannot both commit.
    fn touch(&mut self, key: &[u8]) {
        if self.reads.contains_key(key) || self.writes.contains_key(key) {
            return;
        }
        let version = self
            .lock()
            .versions
            .get(key)
            .copied()
            .unwrap_or(0);
        self.reads.insert(key.to_vec(), version);
    }

    /// Get a value, failing with `KeyNotFound` when absent.
    pub fn get<V: DeserializeOwned>(&mut self, key: impl AsRef<[u8]>) -> Result<V> {
        self.get_opt(&key)?
            .ok_or_else(|| Error::KeyNotFound(String::from_utf8_lossy(key.as_ref()).into_owned()))
    }

    /// Get a value if present.
    pub fn get_opt<V: DeserializeOwned>(&mut self, key: impl AsRef<[u8]>) -> Result<Option<V>> {
        match self.get_raw(key.as_ref())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether a key exists.
    pub fn contains(&mut self, key: impl AsRef<[u8]>) -> Result<bool> {
        Ok(self.get_raw(key.as_ref())?.is_some())
    }

    /// Put a value.
    pub fn put<V: Serialize>(&mut self, key: impl AsRef<[u8]>, value: &V) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.touch(key.as_ref());
        self.writes.insert(key.as_ref().to_vec(), Some(bytes));
        Ok(())
    }

    /// Delete a key.
    pub fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.touch(key.as_ref());
        self.writes.insert(key.as_ref().to_vec(), None);
    }

    /// Scan all entries under a key prefix, in key order.
    pub fn scan_prefix<V: DeserializeOwned>(
        &mut self,
        prefix: impl AsRef<[u8]>,
        reverse: bool,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, V)>> {
        let prefix = prefix.as_ref();
        self.scan_range(prefix, prefix_end(prefix).as_deref(), reverse, limit)
    }

    /// Scan entries in `[lo, hi)`, in key order, descending when `reverse`
    /// is set, at most `limit` entries.
    pub fn scan_range<V: DeserializeOwned>(
        &mut self,
        lo: impl AsRef<[u8]>,
        hi: Option<&[u8]>,
        reverse: bool,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, V)>> {
        let lo = lo.as_ref();
        let inner = self.lock();
        let committed = inner.backend.scan(lo, hi, false)?;
        let seen_seq = inner.commit_seq;
        drop(inner);
        self.scans.push(ScanRange {
            lo: lo.to_vec(),
            hi: hi.map(<[u8]>::to_vec),
            seen_seq,
        });

        // Overlay this transaction's own writes on the committed range.
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = committed.into_iter().collect();
        let upper = match hi {
            Some(hi) => Bound::Excluded(hi.to_vec()),
            None => Bound::Unbounded,
        };
        let pending: Vec<(Vec<u8>, Option<Vec<u8>>)> = self
            .writes
            .range::<Vec<u8>, _>((Bound::Included(lo.to_vec()), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in pending {
            match value {
                Some(value) => {
                    merged.insert(key, value);
                }
                None => {
                    merged.remove(&key);
                }
            }
        }

        let decode = |(key, bytes): (Vec<u8>, Vec<u8>)| -> Result<(Vec<u8>, V)> {
            Ok((key, bincode::deserialize(&bytes)?))
        };
        let limit = limit.unwrap_or(usize::MAX);
        if reverse {
            merged.into_iter().rev().take(limit).map(decode).collect()
        } else {
            merged.into_iter().take(limit).map(decode).collect()
        }
    }

    /// Next value of a named monotonic sequence. The sequence row takes
    /// part in conflict detection like any other key.
    pub fn next_id(&mut self, sequence: &str) -> Result<u64> {
        let key = format!("__seq/{sequence}");
        let next = self.get_opt::<u64>(&key)?.unwrap_or(0) + 1;
        self.put(&key, &next)?;
        Ok(next)
    }

    /// Validate the read and scan sets and apply the write set.
    pub fn commit(self) -> Result<()> {
        let Tx {
            inner,
            reads,
            scans,
            writes,
        } = self;
        let mut inner = match inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for (key, version) in &reads {
            let current = inner.versions.get(key).copied().unwrap_or(0);
            if current != *version {
                return Err(Error::Conflict);
            }
        }
        for scan in &scans {
            let upper = match &scan.hi {
                Some(hi) => Bound::Excluded(hi.clone()),
                None => Bound::Unbounded,
            };
            let phantom = inner
                .versions
                .range::<Vec<u8>, _>((Bound::Included(scan.lo.clone()), upper))
                .any(|(_, seq)| *seq > scan.seen_seq);
            if phantom {
                return Err(Error::Conflict);
            }
        }

        if writes.is_empty() {
            return Ok(());
        }
        inner.commit_seq += 1;
        let seq = inner.commit_seq;
        let mut batch = Vec::with_capacity(writes.len());
        for (key, value) in writes {
            inner.versions.insert(key.clone(), seq);
            match value {
                Some(value) => batch.push(BatchOp::Put(key, value)),
                None => batch.push(BatchOp::Delete(key)),
            }
        }
        inner.backend.apply(batch)
    }
}

/// Smallest key strictly greater than every key with the given prefix, or
/// `None` when the prefix is all `0xff` and the range is right-open.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last() {
        if *last == 0xff {
            end.pop();
        } else {
            *end.last_mut().unwrap() += 1;
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Row {
        name: String,
        amount: i64,
    }

    fn row(name: &str, amount: i64) -> Row {
        Row {
            name: name.to_string(),
            amount,
        }
    }

    #[test]
    fn typed_round_trip_and_not_found() {
        let store = Store::in_memory();
        store
            .serializable(|tx| {
                tx.put("row/1", &row("a", 10))?;
                Ok::<_, Error>(())
            })
            .unwrap();
        let loaded: Row = store.view(|tx| tx.get("row/1")).unwrap();
        assert_eq!(loaded, row("a", 10));
        let missing = store.view(|tx| tx.get::<Row>("row/2"));
        assert!(matches!(missing, Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn reads_observe_own_writes_and_scans_merge_them() {
        let store = Store::in_memory();
        store
            .serializable(|tx| {
                tx.put("row/1", &row("a", 1))?;
                tx.put("row/2", &row("b", 2))?;
                Ok::<_, Error>(())
            })
            .unwrap();

        store
            .serializable(|tx| {
                tx.delete("row/1");
                tx.put("row/3", &row("c", 3))?;
                assert!(tx.get_opt::<Row>("row/1")?.is_none());
                let rows: Vec<(Vec<u8>, Row)> = tx.scan_prefix("row/", false, None)?;
                let names: Vec<String> = rows.into_iter().map(|(_, r)| r.name).collect();
                assert_eq!(names, vec!["b", "c"]);
                Ok::<_, Error>(())
            })
            .unwrap();
    }

    #[test]
    fn conflicting_commit_is_retried() {
        let store = Store::in_memory();
        store
            .serializable(|tx| {
                tx.put("counter", &0u64)?;
                Ok::<_, Error>(())
            })
            .unwrap();

        // Interleave: the first execution of the outer closure reads the
        // counter, then a competing transaction bumps it; the outer commit
        // must conflict and the closure run again against the new value.
        let mut attempts = 0;
        let competing = store.clone();
        let result: std::result::Result<u64, Error> = store.serializable(|tx| {
            attempts += 1;
            let current: u64 = tx.get("counter")?;
            if attempts == 1 {
                competing
                    .serializable(|tx2| {
                        let c: u64 = tx2.get("counter")?;
                        tx2.put("counter", &(c + 10))?;
                        Ok::<_, Error>(())
                    })
                    .unwrap();
            }
            tx.put("counter", &(current + 1))?;
            Ok(current + 1)
        });
        assert_eq!(result.unwrap(), 11);
        assert_eq!(attempts, 2);
    }

    #[test]
    fn phantom_insert_under_scanned_prefix_conflicts() {
        let store = Store::in_memory();
        let mut attempts = 0;
        let competing = store.clone();
        let total: std::result::Result<i64, Error> = store.serializable(|tx| {
            attempts += 1;
            let rows: Vec<(Vec<u8>, Row)> = tx.scan_prefix("acct/", false, None)?;
            let total: i64 = rows.iter().map(|(_, r)| r.amount).sum();
            if attempts == 1 {
                competing
                    .serializable(|tx2| {
                        tx2.put("acct/9", &row("z", 100))?;
                        Ok::<_, Error>(())
                    })
                    .unwrap();
            }
            tx.put("total", &total)?;
            Ok(total)
        });
        assert_eq!(total.unwrap(), 100);
        assert_eq!(attempts, 2);
    }

    #[test]
    fn sequences_are_monotonic() {
        let store = Store::in_memory();
        let first: u64 = store.serializable(|tx| tx.next_id("order")).unwrap();
        let second: u64 = store.serializable(|tx| tx.next_id("order")).unwrap();
        assert_eq!((first, second), (1, 2));
    }

    #[test]
    fn domain_error_rolls_back() {
        let store = Store::in_memory();
        let out: std::result::Result<(), Error> = store.serializable(|tx| {
            tx.put("row/1", &row("a", 1))?;
            Err(Error::KeyNotFound("synthetic".into()))
        });
        assert!(out.is_err());
        assert!(!store.view(|tx| tx.contains("row/1")).unwrap());
    }

    #[test]
    fn prefix_end_increments_correctly() {
        assert_eq!(prefix_end(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(prefix_end(b"a\xff"), Some(b"b".to_vec()));
        assert_eq!(prefix_end(b"\xff\xff"), None);
    }
}
