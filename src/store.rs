//! JSON key-value persistence with keyring, file and in-memory backends
//!
//! Reads never fail: a missing key, an unreadable backend or a corrupt value
//! all resolve to the caller's fallback. Writes report errors.

use crate::error::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const SERVICE_NAME: &str = "sessionlink";
const STORE_FILE_NAME: &str = "store.json";

/// Storage backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// OS native keyring
    Keyring,
    /// JSON file in user config directory
    File,
    /// Process memory only
    Memory,
}

/// Raw string storage under string keys
pub trait StoreBackend: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Typed JSON view over a backend
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StoreBackend>,
    kind: BackendKind,
}

impl Store {
    pub fn with_backend(backend: Arc<dyn StoreBackend>, kind: BackendKind) -> Self {
        Self { backend, kind }
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::default()), BackendKind::Memory)
    }

    /// Open the platform store, preferring the keyring and falling back to a file
    pub fn open_default() -> Result<Self, StoreError> {
        if KeyringBackend::is_available() {
            return Ok(Self::with_backend(
                Arc::new(KeyringBackend::new(SERVICE_NAME)),
                BackendKind::Keyring,
            ));
        }
        let path = default_store_path()?;
        Ok(Self::with_backend(
            Arc::new(FileBackend::new(path)),
            BackendKind::File,
        ))
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Read `key`, returning `fallback` when it is missing or does not parse as `T`
    pub fn get<T: DeserializeOwned>(&self, key: &str, fallback: T) -> T {
        let raw = match self.backend.read(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return fallback,
            Err(e) => {
                warn!(key, error = %e, "Store read failed, using fallback");
                return fallback;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Stored value is corrupt, using fallback");
                fallback
            }
        }
    }

    /// Serialize `value` as JSON and store it under `key`
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|source| StoreError::Serialize {
            key: key.to_string(),
            source,
        })?;
        self.backend.write(key, &raw)?;
        debug!(key, "Stored value");
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.backend.delete(key)
    }
}

/// In-process map
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryBackend {
    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        // A poisoned map still holds whole values, keep using it
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StoreBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries().remove(key);
        Ok(())
    }
}

/// All keys in one JSON object file, user-only permissions on unix
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        match serde_json::from_str(&contents) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Store file is corrupt, starting empty");
                Ok(BTreeMap::new())
            }
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(entries).map_err(|source| {
            StoreError::Serialize {
                key: STORE_FILE_NAME.to_string(),
                source,
            }
        })?;
        fs::write(&self.path, contents)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)?;
        }

        Ok(())
    }
}

impl StoreBackend for FileBackend {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_all()?.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.read_all()?;
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

/// One OS keyring entry per key
#[derive(Debug)]
pub struct KeyringBackend {
    service_name: String,
}

impl KeyringBackend {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Test if keyring is available
    fn is_available() -> bool {
        keyring::Entry::new(SERVICE_NAME, "probe").is_ok()
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, StoreError> {
        keyring::Entry::new(&self.service_name, key)
            .map_err(|e| StoreError::Keyring(format!("Failed to create keyring entry: {}", e)))
    }
}

impl StoreBackend for KeyringBackend {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::Keyring(e.to_string())),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| StoreError::Keyring(format!("Failed to store '{}': {}", key, e)))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Keyring(e.to_string())),
        }
    }
}

/// `<config_dir>/sessionlink/store.json`
pub fn default_store_path() -> Result<PathBuf, StoreError> {
    let config_dir = dirs::config_dir().ok_or(StoreError::NoConfigDir)?;
    Ok(config_dir.join(SERVICE_NAME).join(STORE_FILE_NAME))
}
