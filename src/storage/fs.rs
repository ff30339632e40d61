use std::fs;
use std::io::{ErrorKind, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::storage::Storage;

/// Storage backed by a directory on the local filesystem.
///
/// Every key maps to a file under the root directory. A `/` in a key creates a
/// sub-directory, so `double/ab12` is stored at `<root>/double/ab12`. Entries
/// are written to a hidden temporary file next to their destination and then
/// renamed into place, so an interrupted save never leaves a partial entry.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: Utf8PathBuf,
}

impl FileStorage {
    /// Opens (and creates, if needed) a storage rooted at `root`.
    pub fn new(root: impl AsRef<Utf8Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|err| StorageError::io(root.as_str(), err))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Resolves a key to its file, rejecting keys that would escape the root.
    fn path(&self, key: &str) -> Result<Utf8PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key.split('/').all(|segment| {
                !segment.is_empty() && !segment.starts_with('.') && !segment.contains('\\')
            });

        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }

        Ok(self.root.join(key))
    }

    fn walk(&self, dir: &Utf8Path, prefix: &str, keys: &mut Vec<String>) -> Result<(), StorageError> {
        let entries = dir
            .read_dir_utf8()
            .map_err(|err| StorageError::io(dir.as_str(), err))?;

        for entry in entries {
            let entry = entry.map_err(|err| StorageError::io(dir.as_str(), err))?;
            let name = entry.file_name();

            // temporary files of in-flight writes
            if name.starts_with('.') {
                continue;
            }

            let key = match prefix {
                "" => name.to_string(),
                _ => format!("{prefix}/{name}"),
            };

            let kind = entry
                .file_type()
                .map_err(|err| StorageError::io(entry.path().as_str(), err))?;

            if kind.is_dir() {
                self.walk(entry.path(), &key, keys)?;
            } else {
                keys.push(key);
            }
        }

        Ok(())
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path(key)?;

        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::io(key, err)),
        }
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path(key)?;
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(|err| StorageError::io(key, err))?;

        // The staging file is removed on drop, so a failed write or rename
        // leaves nothing behind.
        let mut staging = NamedTempFile::new_in(dir).map_err(|err| StorageError::io(key, err))?;
        staging
            .write_all(bytes)
            .map_err(|err| StorageError::io(key, err))?;
        staging
            .persist(&path)
            .map_err(|err| StorageError::io(key, err.error))?;

        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path(key)?;

        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::io(key, err)),
        }
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path(key)?;

        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::io(key, err)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        self.walk(&self.root, "", &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::io(self.root.as_str(), err)),
        }

        fs::create_dir_all(&self.root).map_err(|err| StorageError::io(self.root.as_str(), err))
    }
}
