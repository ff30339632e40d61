//! Byte-addressable key-value storage.
//!
//! A [`Storage`] maps string keys to byte values. Backends report a missing key
//! as `Ok(None)`/`Ok(false)` and every other failure as a [`StorageError`],
//! which aborts the memoized call instead of being mistaken for a miss.
//!
//! Storages compose with [`Chain`]: reads probe every member in order and
//! return the first hit, writes go to the first member only.

mod fs;
mod memory;

use std::fmt::Debug;
use std::sync::Arc;

use camino::Utf8Path;

use crate::error::StorageError;

pub use crate::storage::fs::FileStorage;
pub use crate::storage::memory::MemoryStorage;

/// Backend contract shared by every storage.
pub trait Storage: Debug + Send + Sync {
    /// Returns the stored bytes, or `None` if the key is absent.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    fn contains(&self, key: &str) -> Result<bool, StorageError>;

    /// Removes an entry, returning whether it existed.
    fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Lists all stored keys.
    fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Removes every entry. Optional; meant for ephemeral backends.
    fn clear(&self) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("clear"))
    }
}

impl<S> Storage for Arc<S>
where
    S: Storage + ?Sized,
{
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).load(key)
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        (**self).save(key, bytes)
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        (**self).contains(key)
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        (**self).delete(key)
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        (**self).keys()
    }

    fn clear(&self) -> Result<(), StorageError> {
        (**self).clear()
    }
}

/// Ordered fallback over several storages.
///
/// `load` and `contains` consult members in declaration order, `save`,
/// `delete` and `clear` only touch the first member.
#[derive(Debug, Clone, Default)]
pub struct Chain {
    storages: Vec<Arc<dyn Storage>>,
}

impl Chain {
    pub fn new(storages: impl IntoIterator<Item = Arc<dyn Storage>>) -> Self {
        Self {
            storages: storages.into_iter().collect(),
        }
    }

    pub fn members(&self) -> &[Arc<dyn Storage>] {
        &self.storages
    }

    fn first(&self) -> Result<&Arc<dyn Storage>, StorageError> {
        self.storages.first().ok_or(StorageError::EmptyChain)
    }
}

impl Storage for Chain {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        for storage in &self.storages {
            if let Some(bytes) = storage.load(key)? {
                return Ok(Some(bytes));
            }
        }

        Ok(None)
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.first()?.save(key, bytes)
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        for storage in &self.storages {
            if storage.contains(key)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        match self.storages.first() {
            Some(storage) => storage.delete(key),
            None => Ok(false),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();

        for storage in &self.storages {
            for key in storage.keys()? {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }

        Ok(keys)
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.first()?.clear()
    }
}

/// Opens a storage from a location string.
///
/// * `memory://` creates a fresh in-memory storage,
/// * `file://<path>` or a bare path opens a directory-backed storage.
pub fn open(location: &str) -> Result<Arc<dyn Storage>, StorageError> {
    if location == "memory://" {
        return Ok(Arc::new(MemoryStorage::new()));
    }

    if let Some(path) = location.strip_prefix("file://") {
        return Ok(Arc::new(FileStorage::new(path)?));
    }

    if location.contains("://") {
        return Err(StorageError::UnsupportedScheme(location.to_string()));
    }

    Ok(Arc::new(FileStorage::new(Utf8Path::new(location))?))
}

#[cfg(test)]
mod test {
    use super::*;

    fn memory(entries: &[(&str, &[u8])]) -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage::from_entries(
            entries.iter().map(|(k, v)| (k.to_string(), v.to_vec())),
        ))
    }

    #[test]
    fn test_chain_reads_in_order() {
        let a = memory(&[("k", b"a"), ("only-a", b"1")]);
        let b = memory(&[("k", b"b"), ("only-b", b"2")]);
        let chain = Chain::new([a.clone() as Arc<dyn Storage>, b.clone()]);

        assert_eq!(chain.load("k").unwrap(), Some(b"a".to_vec()));
        assert_eq!(chain.load("only-b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(chain.load("none").unwrap(), None);
        assert!(chain.contains("only-b").unwrap());
        assert!(!chain.contains("none").unwrap());
    }

    #[test]
    fn test_chain_writes_first() {
        let a = memory(&[]);
        let b = memory(&[]);
        let chain = Chain::new([a.clone() as Arc<dyn Storage>, b.clone()]);

        chain.save("k", b"v").unwrap();
        assert!(a.contains("k").unwrap());
        assert!(!b.contains("k").unwrap());
    }

    #[test]
    fn test_chain_delete_only_first() {
        let a = memory(&[("k", b"a")]);
        let b = memory(&[("k", b"b")]);
        let chain = Chain::new([a.clone() as Arc<dyn Storage>, b.clone()]);

        assert!(chain.delete("k").unwrap());
        assert_eq!(chain.load("k").unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn test_chain_keys_deduplicated() {
        let a = memory(&[("x", b"1"), ("y", b"1")]);
        let b = memory(&[("y", b"2"), ("z", b"2")]);
        let chain = Chain::new([a as Arc<dyn Storage>, b]);

        assert_eq!(chain.keys().unwrap(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_empty_chain() {
        let chain = Chain::default();
        assert_eq!(chain.load("k").unwrap(), None);
        assert!(matches!(chain.save("k", b"v"), Err(StorageError::EmptyChain)));
    }

    #[test]
    fn test_open() {
        let storage = open("memory://").unwrap();
        storage.save("k", b"v").unwrap();
        assert_eq!(storage.load("k").unwrap(), Some(b"v".to_vec()));

        assert!(matches!(
            open("s3://bucket"),
            Err(StorageError::UnsupportedScheme(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let location = format!("file://{}", dir.path().display());
        let storage = open(&location).unwrap();
        storage.save("k", b"v").unwrap();
        assert!(dir.path().join("k").exists());
    }
}
