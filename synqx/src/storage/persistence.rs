//! Key/value blob persistence.
//!
//! The send queue and the local cache each store one JSON document per key.
//! [`MemoryPersistence`] keeps them in a map (tests, ephemeral sessions);
//! [`FilePersistence`] keeps one file per key in a data directory.

use std::collections::HashMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors that can occur when loading or storing blobs.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The backing store could not be read or written.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document could not be encoded or decoded.
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Synchronous string blob storage.
pub trait Persistence: Send + Sync + 'static {
    /// Returns the blob stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Io`] if the backing store fails.
    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    /// Stores `value` under `key`, replacing any previous blob.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Io`] if the backing store fails.
    fn store(&self, key: &str, value: &str) -> Result<(), PersistenceError>;

    /// Removes the blob under `key`. Removing an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Io`] if the backing store fails.
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}

/// Loads and decodes the JSON document under `key`.
///
/// # Errors
///
/// Returns [`PersistenceError`] if the blob cannot be read or decoded.
pub fn load_json<T: DeserializeOwned>(
    persistence: &impl Persistence,
    key: &str,
) -> Result<Option<T>, PersistenceError> {
    persistence
        .load(key)?
        .map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(PersistenceError::from)
}

/// Encodes `value` as JSON and stores it under `key`.
///
/// # Errors
///
/// Returns [`PersistenceError`] if the value cannot be encoded or stored.
pub fn store_json<T: Serialize + ?Sized>(
    persistence: &impl Persistence,
    key: &str,
    value: &T,
) -> Result<(), PersistenceError> {
    let text = serde_json::to_string(value)?;
    persistence.store(key, &text)
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Blob storage held in memory.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    blobs: Mutex<HashMap<String, String>>,
    failing: std::sync::atomic::AtomicBool,
}

impl MemoryPersistence {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with an I/O error until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PersistenceError::Io(std::io::Error::other(
                "storage quota exceeded",
            )));
        }
        Ok(())
    }
}

impl Persistence for MemoryPersistence {
    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        self.check()?;
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.check()?;
        self.blobs.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.check()?;
        self.blobs.lock().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed
// ---------------------------------------------------------------------------

/// Blob storage with one file per key under a directory.
///
/// Writes go to a temporary file that is then renamed over the target, so a
/// crash mid-write leaves the previous blob intact.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    /// Opens (creating if needed) storage rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Io`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", escape_key(key)))
    }
}

/// Maps a key to a file-name-safe string. Alphanumerics, `-` and `_` pass
/// through; every other byte becomes `%XX`.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

impl Persistence for FilePersistence {
    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let target = self.path_for(key);
        let tmp = target.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
