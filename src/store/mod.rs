//! Persistent client state: the last session and per-world bot ownership.
//!
//! Everything is stored as JSON strings under flat keys, so any key/value
//! backend works. [`FileStorage`] keeps one file per key; [`MemoryStorage`] is
//! for ephemeral runs and tests.

pub mod ownership;
pub mod session;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

pub use ownership::OwnedBots;
pub use session::Session;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Minimal key/value contract the store needs
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One `<key>.json` file per key inside `dir`
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        // World ids come from the server; keep them from escaping the directory
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        self.dir.join(format!("{}.json", name))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");

        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;

        debug!("Stored {} ({} bytes)", path.display(), value.len());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("botworld-client-{}", uuid::Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("session").unwrap(), None);

        storage.set("session", "{}").unwrap();
        assert_eq!(storage.get("session").unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = temp_dir();
        let storage = FileStorage::new(&dir).unwrap();

        assert_eq!(storage.get("w1.bots").unwrap(), None);
        storage.set("w1.bots", "[]").unwrap();
        assert_eq!(storage.get("w1.bots").unwrap().as_deref(), Some("[]"));

        // A second instance over the same directory sees the same data
        let reopened = FileStorage::new(&dir).unwrap();
        assert_eq!(reopened.get("w1.bots").unwrap().as_deref(), Some("[]"));

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_file_storage_sanitizes_keys() {
        let dir = temp_dir();
        let storage = FileStorage::new(&dir).unwrap();

        storage.set("../escape", "x").unwrap();
        assert!(dir.join(".._escape.json").exists());

        std::fs::remove_dir_all(dir).ok();
    }
}
