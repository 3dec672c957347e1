use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use crate::error::StorageError;

/// The raw durable key-value boundary (§1 "Durable key-value storage", out
/// of scope as a *technology* — sled, RocksDB, a remote KV service, etc.
/// all satisfy this trait). `StorageGateway` is the in-scope typed layer
/// built on top of it (§4.A).
pub trait KvStore: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;
    /// Lexicographic range scan over every key starting with `prefix`, in
    /// ascending key order — the primitive `list_by_prefix` and every
    /// family-specific scan in §4.A are built from.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
}

/// Reference `KvStore` backing a `BTreeMap`, suitable for tests and as the
/// embedding process's default when no real durable store is wired in
/// (§0.1 "Reference `KvStore` impl" in SPEC_FULL.md).
#[derive(Default)]
pub struct InMemoryKvStore {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for InMemoryKvStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| StorageError::StorageUnavailable("lock poisoned".to_string()))?;
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self
            .data
            .lock()
            .map_err(|_| StorageError::StorageUnavailable("lock poisoned".to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| StorageError::StorageUnavailable("lock poisoned".to_string()))?;
        data.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let data = self
            .data
            .lock()
            .map_err(|_| StorageError::StorageUnavailable("lock poisoned".to_string()))?;

        // Upper-bound the range at the prefix's successor so the scan stays
        // O(matches) instead of walking the whole map.
        let upper = match prefix_successor(prefix) {
            Some(upper) => Bound::Excluded(upper),
            None => Bound::Unbounded,
        };
        Ok(data
            .range((Bound::Included(prefix.to_vec()), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Smallest byte string that is strictly greater than every string with
/// `prefix` as a prefix, or `None` if `prefix` is all `0xFF` bytes (no
/// finite successor exists, so the scan is unbounded above).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut successor = prefix.to_vec();
    while let Some(&last) = successor.last() {
        if last == 0xFF {
            successor.pop();
        } else {
            *successor.last_mut().unwrap() += 1;
            return Some(successor);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let store = InMemoryKvStore::new();
        store.put(b"tokens:1", b"a").unwrap();
        assert_eq!(store.get(b"tokens:1").unwrap(), Some(b"a".to_vec()));

        store.delete(b"tokens:1").unwrap();
        assert_eq!(store.get(b"tokens:1").unwrap(), None);
    }

    #[test]
    fn scan_prefix_returns_only_matching_keys_in_order() {
        let store = InMemoryKvStore::new();
        store.put(b"jobs:b", b"2").unwrap();
        store.put(b"jobs:a", b"1").unwrap();
        store.put(b"timers:a", b"x").unwrap();

        let results = store.scan_prefix(b"jobs:").unwrap();
        assert_eq!(
            results,
            vec![
                (b"jobs:a".to_vec(), b"1".to_vec()),
                (b"jobs:b".to_vec(), b"2".to_vec()),
            ]
        );
    }

    #[test]
    fn scan_prefix_of_all_0xff_is_unbounded_above() {
        let store = InMemoryKvStore::new();
        store.put(&[0xFF, 0xFF], b"a").unwrap();
        store.put(&[0xFF, 0xFF, 0x00], b"b").unwrap();

        let results = store.scan_prefix(&[0xFF, 0xFF]).unwrap();
        assert_eq!(results.len(), 2);
    }
}
