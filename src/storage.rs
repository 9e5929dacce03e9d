//! Key/value persistence contract and the bundled stores.
//!
//! The rest of the crate persists small documents (identity material, the
//! known-hosts table, the display name, tab leases) through the [`KvStore`]
//! trait. Applications plug in whatever backend they have; two stores ship
//! here:
//!
//! - [`MemoryKv`] — in-process map, used by tests and throwaway sessions.
//! - [`FileKv`] — a single JSON document on disk with owner-only permissions.

use serde_json;
use std::collections::HashMap;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Errors raised by a key/value store.
#[derive(Debug)]
pub enum StorageError {
    /// Underlying I/O failed.
    Io(String),
    /// Stored document could not be encoded or decoded.
    Serialize(String),
    /// No usable storage location.
    Unavailable(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "storage I/O failed: {msg}"),
            Self::Serialize(msg) => write!(f, "storage encoding failed: {msg}"),
            Self::Unavailable(msg) => write!(f, "storage unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Minimal key/value persistence contract.
///
/// Implementations must be safe to call from multiple tasks; writes for a
/// single key are last-writer-wins.
pub trait KvStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` when the backend cannot persist the write.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a value. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` when the backend cannot persist the removal.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// List all present keys.
    fn keys(&self) -> Vec<String>;
}

/// In-process store backed by a map. Contents die with the process.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("kv lock poisoned")
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .expect("kv lock poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().expect("kv lock poisoned").remove(key);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("kv lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// File-backed store: one pretty-printed JSON object per store.
///
/// Every write rewrites the file. On unix the file is chmod `0o600` since it
/// can hold the signing secret when the OS keyring is unavailable.
#[derive(Debug)]
pub struct FileKv {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileKv {
    /// Open (or create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` when the parent directory cannot be created or
    /// an existing file cannot be read or parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let entries = if path.exists() {
            let content =
                fs::read_to_string(&path).map_err(|e| StorageError::Io(e.to_string()))?;
            serde_json::from_str(&content).map_err(|e| StorageError::Serialize(e.to_string()))?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Platform-default store location: `{config_dir}/parlor/store.json`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` when no config directory exists.
    pub fn default_path() -> Result<PathBuf, StorageError> {
        dirs::config_dir()
            .map(|d| d.join("parlor").join("store.json"))
            .ok_or_else(|| StorageError::Unavailable("no config directory".into()))
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| StorageError::Serialize(e.to_string()))?;
        fs::write(&self.path, content).map_err(|e| StorageError::Io(e.to_string()))?;

        #[cfg(unix)]
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
            .map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }
}

impl KvStore for FileKv {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("kv lock poisoned")
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().expect("kv lock poisoned");
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().expect("kv lock poisoned");
        entries.remove(key);
        self.persist(&entries)
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("kv lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
