//! Key-Value Store Adapter (C1): a narrow interface over an ordered embedded
//! KV database. Single-writer within the engine process; reads are lock-free.

use crate::error::StoreError;

/// One mutation in a [`KvStore::commit`] batch.
#[derive(Debug, Clone)]
pub enum KvOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Ordered embedded key-value store. Keyspaces are prefix-namespaced per
/// entity type (`token/`, `instance/`, `timer/`, `sub/`, `buf/`, `job/`,
/// `incident/`, `def/`, `rl/`, `usertimer/`).
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Ordered iteration over every key starting with `prefix`.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Apply every op atomically. A failure aborts the whole batch — no
    /// partial application is ever observable.
    fn commit(&self, ops: Vec<KvOp>) -> Result<(), StoreError>;
}

/// In-memory `KvStore` backed by a `BTreeMap`, guarded by a single lock so
/// `commit` is trivially atomic. Default backend for tests and local runs.
pub struct MemoryKv {
    inner: parking_lot::RwLock<std::collections::BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self {
            inner: parking_lot::RwLock::new(std::collections::BTreeMap::new()),
        }
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let guard = self.inner.read();
        Ok(guard
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, ops: Vec<KvOp>) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        for op in ops {
            match op {
                KvOp::Put(k, v) => {
                    guard.insert(k, v);
                }
                KvOp::Delete(k) => {
                    guard.remove(&k);
                }
            }
        }
        Ok(())
    }
}

/// Production embedded backend. `sled` is a crash-safe, ordered, single-process
/// embedded KV database — the concrete fulfillment of C1's "embedded key-value
/// database" requirement.
#[cfg(feature = "sled-store")]
pub struct SledKv {
    db: sled::Db,
}

#[cfg(feature = "sled-store")]
impl SledKv {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

#[cfg(feature = "sled-store")]
impl KvStore for SledKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(key)
            .map(|opt| opt.map(|ivec| ivec.to_vec()))
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.db
            .scan_prefix(prefix)
            .map(|res| {
                res.map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(|e| StoreError::Backend(e.to_string()))
            })
            .collect()
    }

    fn commit(&self, ops: Vec<KvOp>) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                KvOp::Put(k, v) => batch.insert(k, v),
                KvOp::Delete(k) => batch.remove(k),
            }
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        // sled is crash-safe without an explicit flush, but we flush to bound
        // the durability window for callers that require it synchronously.
        self.db.flush().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let kv = MemoryKv::new();
        kv.commit(vec![KvOp::Put(b"token/1".to_vec(), b"hello".to_vec())])
            .unwrap();
        assert_eq!(kv.get(b"token/1").unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn delete_removes_key() {
        let kv = MemoryKv::new();
        kv.commit(vec![KvOp::Put(b"a".to_vec(), b"1".to_vec())]).unwrap();
        kv.commit(vec![KvOp::Delete(b"a".to_vec())]).unwrap();
        assert_eq!(kv.get(b"a").unwrap(), None);
    }

    #[test]
    fn scan_prefix_is_ordered_and_scoped() {
        let kv = MemoryKv::new();
        kv.commit(vec![
            KvOp::Put(b"token/b".to_vec(), b"2".to_vec()),
            KvOp::Put(b"token/a".to_vec(), b"1".to_vec()),
            KvOp::Put(b"instance/a".to_vec(), b"x".to_vec()),
        ])
        .unwrap();

        let rows = kv.scan_prefix(b"token/").unwrap();
        assert_eq!(
            rows,
            vec![
                (b"token/a".to_vec(), b"1".to_vec()),
                (b"token/b".to_vec(), b"2".to_vec()),
            ]
        );
    }

    #[test]
    fn commit_batch_is_applied_atomically_in_order() {
        let kv = MemoryKv::new();
        kv.commit(vec![
            KvOp::Put(b"k".to_vec(), b"1".to_vec()),
            KvOp::Put(b"k".to_vec(), b"2".to_vec()),
        ])
        .unwrap();
        assert_eq!(kv.get(b"k").unwrap(), Some(b"2".to_vec()));
    }
}
