//! Persistent storage for engine state.
//!
//! The layout cache, the firing ledger and the report queue are each stored
//! as one JSON document under a fixed key. [`FileStorage`] keeps them as files
//! in the data directory and replaces them atomically; [`MemoryStorage`] keeps
//! them in process for tests and ephemeral hosts.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::lock;

/// Key of the cached layout snapshot.
pub const LAYOUT_KEY: &str = "layout";

/// Key of the firing ledger.
pub const LEDGER_KEY: &str = "ledger";

/// Key of the pending report queue.
pub const REPORTS_KEY: &str = "reports";

/// Storage-level failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading the stored document failed.
    #[error("failed to read '{key}': {source}")]
    Read {
        /// Document key.
        key: String,
        /// Underlying I/O failure.
        source: std::io::Error,
    },

    /// Writing the document failed.
    #[error("failed to write '{key}': {source}")]
    Write {
        /// Document key.
        key: String,
        /// Underlying I/O failure.
        source: std::io::Error,
    },

    /// The stored document is not valid JSON for the expected type.
    #[error("failed to decode '{key}': {source}")]
    Decode {
        /// Document key.
        key: String,
        /// Underlying JSON failure.
        source: serde_json::Error,
    },

    /// The value could not be encoded as JSON.
    #[error("failed to encode '{key}': {source}")]
    Encode {
        /// Document key.
        key: String,
        /// Underlying JSON failure.
        source: serde_json::Error,
    },
}

/// Result alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Keyed blob storage for persisted engine state.
///
/// Implementations must make `save` atomic per key: a reader sees either the
/// previous document or the new one, never a partial write.
pub trait Storage: Send + Sync + fmt::Debug {
    /// Load the document stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the backend cannot be read.
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Replace the document stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the document was not durably stored.
    fn save(&self, key: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Delete the document stored under `key`. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the document could not be removed.
    fn remove(&self, key: &str) -> StorageResult<()>;
}

/// Load and decode a JSON document.
///
/// # Errors
///
/// Returns an error if the document cannot be read or decoded.
pub fn load_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> StorageResult<Option<T>> {
    let Some(bytes) = storage.load(key)? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StorageError::Decode {
            key: key.to_string(),
            source,
        })
}

/// Encode and store a JSON document.
///
/// # Errors
///
/// Returns an error if the value cannot be encoded or stored.
pub fn save_json<T: Serialize>(storage: &dyn Storage, key: &str, value: &T) -> StorageResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Encode {
        key: key.to_string(),
        source,
    })?;
    storage.save(key, &bytes)
}

/// Get the default data directory.
///
/// On the gateway: `/var/lib/proxima/`
/// For development: `~/.local/share/proxima/`
#[must_use]
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/proxima")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "proxima").map_or_else(
            || PathBuf::from("proxima-data"),
            |dirs| dirs.data_dir().to_path_buf(),
        )
    }
}

/// JSON files in a data directory, one per key.
#[derive(Debug, Clone)]
pub struct FileStorage {
    data_dir: PathBuf,
}

impl FileStorage {
    /// Create a new storage instance.
    ///
    /// # Arguments
    ///
    /// * `data_dir` - Directory to store data files
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Directory holding the documents.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn document_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{key}.json"))
    }

    fn staging_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!(".{key}.json.tmp"))
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match std::fs::read(self.document_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Read {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn save(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        let write_err = |source| StorageError::Write {
            key: key.to_string(),
            source,
        };
        std::fs::create_dir_all(&self.data_dir).map_err(write_err)?;

        // Write beside the target, then rename over it.
        let staging = self.staging_path(key);
        std::fs::write(&staging, bytes).map_err(write_err)?;
        std::fs::rename(&staging, self.document_path(key)).map_err(write_err)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        match std::fs::remove_file(self.document_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Write {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// In-process storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    documents: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.documents).len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.documents).is_empty()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(lock(&self.documents).get(key).cloned())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        lock(&self.documents).insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        lock(&self.documents).remove(key);
        Ok(())
    }
}
