//! Opaque key-value persistence. The pipeline only ever reads and writes
//! whole JSON documents under a handful of keys.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::error::TweetFilterError;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, TweetFilterError>;
    fn set(&self, key: &str, value: &str) -> Result<(), TweetFilterError>;

    /// Read a key, falling back to `default` when it is absent or unreadable.
    fn get_or(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Ok(Some(value)) => value,
            Ok(None) => default.to_string(),
            Err(e) => {
                warn!(key, error = %e, "Key-value read failed, using default");
                default.to_string()
            }
        }
    }
}

/// In-process store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    writes: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls so far.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, TweetFilterError> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), TweetFilterError> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}

/// A single JSON object on disk mapping keys to string values.
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl JsonFileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TweetFilterError> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                TweetFilterError::Storage(format!("failed to read {}: {e}", path.display()))
            })?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&raw).map_err(|e| {
                    TweetFilterError::Storage(format!("failed to parse {}: {e}", path.display()))
                })?
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, TweetFilterError> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), TweetFilterError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        let serialized = serde_json::to_string_pretty(&*values)
            .map_err(|e| TweetFilterError::Storage(e.to_string()))?;

        // Write beside the target and rename so readers never see half a file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serialized)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| {
                TweetFilterError::Storage(format!("failed to write {}: {e}", self.path.display()))
            })
    }
}
