//! Keyed record storage backing the client keystore and the offline queue.
//!
//! Records are small JSON documents addressed by string keys
//! (`secrets_<username>`, `meta_salt_<username>`, …). The file-backed store
//! writes atomically (temp file + rename) so a crash mid-write never leaves a
//! torn record.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::KeystoreError;

/// Abstract keyed store. Values are serialized records; the store itself is
/// oblivious to their contents.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, KeystoreError>;
    fn put(&self, key: &str, value: &str) -> Result<(), KeystoreError>;
    fn delete(&self, key: &str) -> Result<(), KeystoreError>;
    /// All keys currently present. Used by the queue's TTL sweep.
    fn keys(&self) -> Result<Vec<String>, KeystoreError>;
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, KeystoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| KeystoreError::Storage("store lock poisoned".to_string()))?;
        Ok(records.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), KeystoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| KeystoreError::Storage("store lock poisoned".to_string()))?;
        records.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KeystoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| KeystoreError::Storage("store lock poisoned".to_string()))?;
        records.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, KeystoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| KeystoreError::Storage("store lock poisoned".to_string()))?;
        Ok(records.keys().cloned().collect())
    }
}

/// File-backed store: one JSON file per record under a directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KeystoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| KeystoreError::Storage(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    /// Record keys become file names, so only a conservative character set is
    /// accepted. Anything else would risk path traversal.
    fn path_for(&self, key: &str) -> Result<PathBuf, KeystoreError> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(KeystoreError::Storage(format!("invalid record key: {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, KeystoreError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeystoreError::Storage(format!(
                "read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<(), KeystoreError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)
                .map_err(|e| KeystoreError::Storage(format!("create {}: {}", tmp.display(), e)))?;
            file.write_all(value.as_bytes())
                .map_err(|e| KeystoreError::Storage(format!("write {}: {}", tmp.display(), e)))?;
            file.sync_all()
                .map_err(|e| KeystoreError::Storage(format!("sync {}: {}", tmp.display(), e)))?;
        }
        fs::rename(&tmp, &path)
            .map_err(|e| KeystoreError::Storage(format!("rename {}: {}", path.display(), e)))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KeystoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeystoreError::Storage(format!(
                "remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn keys(&self) -> Result<Vec<String>, KeystoreError> {
        let mut keys = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| KeystoreError::Storage(format!("list {}: {}", self.dir.display(), e)))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| KeystoreError::Storage(format!("list entry: {}", e)))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".json") {
                keys.push(stem.to_string());
            }
        }
        Ok(keys)
    }
}
