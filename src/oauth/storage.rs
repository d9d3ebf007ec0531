//! Credential store backends for persisting the refresh token.
//!
//! Provides the [`CredentialStore`] trait and several implementations:
//! - [`FileCredentialStore`] - JSON key/value file
//! - [`MemoryCredentialStore`] - In-memory storage for testing
//! - [`KeyringCredentialStore`] - System keyring storage (requires `system-keyring` feature)
//!
//! The session only ever stores one value, under [`refresh_token_key`]. The
//! stores themselves are plain string key/value maps.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::instrument;

/// Key suffix for the persisted refresh token.
pub const REFRESH_TOKEN_KEY: &str = "REFRESH_TOKEN";

/// Namespaced store key for the refresh token, e.g. `@auction-login:REFRESH_TOKEN`.
pub fn refresh_token_key(namespace: &str) -> String {
    format!("@{namespace}:{REFRESH_TOKEN_KEY}")
}

/// Errors raised by credential store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Corrupt credential file: {0}")]
    Corrupt(String),

    #[error("Keyring error: {0}")]
    Keyring(String),
}

// =============================================================================
// CredentialStore trait
// =============================================================================

/// Durable key/value persistence.
///
/// All implementations must be thread-safe (`Send + Sync`). Removing a key
/// that does not exist is not an error.
pub trait CredentialStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove the value stored under `key`.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Get the name of this storage backend.
    fn name(&self) -> &str;
}

impl<T: CredentialStore + ?Sized> CredentialStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value)
    }
    fn remove(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key)
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<T: CredentialStore + ?Sized> CredentialStore for Box<T> {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value)
    }
    fn remove(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key)
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}

// =============================================================================
// FileCredentialStore
// =============================================================================

/// File permissions for the credential file (Unix only): owner read/write.
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Directory permissions (Unix only): owner read/write/execute.
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

/// Name of the credential file inside the store directory.
const CREDENTIALS_FILE: &str = "credentials.json";

/// File-based credential store.
///
/// Keeps every key in a single JSON object at `{dir}/credentials.json`.
/// Writes go to a temp file first and are renamed into place. On Unix the
/// file is created 0600 and its directory 0700.
#[derive(Debug)]
pub struct FileCredentialStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_lock: std::sync::Mutex<()>,
}

impl FileCredentialStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: std::sync::Mutex::new(()),
        }
    }

    /// Get the directory holding the credential file.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir).map_err(|e| {
                StoreError::Io(format!(
                    "Failed to create credential directory '{}': {}",
                    self.dir.display(),
                    e
                ))
            })?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(DIR_MODE);
                std::fs::set_permissions(&self.dir, perms).map_err(|e| {
                    StoreError::Io(format!(
                        "Failed to set directory permissions on '{}': {}",
                        self.dir.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let path = self.path();
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to read '{}': {}",
                    path.display(),
                    e
                )));
            }
        };

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&content)
            .map_err(|e| StoreError::Corrupt(format!("'{}': {}", path.display(), e)))
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<(), StoreError> {
        self.ensure_dir()?;

        let path = self.path();
        let content = serde_json::to_string_pretty(map)
            .map_err(|e| StoreError::Io(format!("Failed to serialize credentials: {}", e)))?;

        let temp_path = path.with_extension("tmp");

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(FILE_MODE)
                .open(&temp_path)
                .map_err(|e| {
                    StoreError::Io(format!(
                        "Failed to create temp file '{}': {}",
                        temp_path.display(),
                        e
                    ))
                })?;
            file.write_all(content.as_bytes())
                .and_then(|()| file.sync_all())
                .map_err(|e| {
                    StoreError::Io(format!(
                        "Failed to write temp file '{}': {}",
                        temp_path.display(),
                        e
                    ))
                })?;
        }

        #[cfg(not(unix))]
        {
            std::fs::write(&temp_path, &content).map_err(|e| {
                StoreError::Io(format!(
                    "Failed to write temp file '{}': {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if let Err(e) = std::fs::rename(&temp_path, &path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(StoreError::Io(format!(
                "Failed to rename '{}' to '{}': {}",
                temp_path.display(),
                path.display(),
                e
            )));
        }

        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    #[instrument(skip(self))]
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_map()?.remove(key))
    }

    #[instrument(skip(self, value))]
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }

    #[instrument(skip(self))]
    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        if map.remove(key).is_none() {
            return Ok(());
        }
        self.write_map(&map)
    }

    fn name(&self) -> &str {
        "file"
    }
}

// =============================================================================
// KeyringCredentialStore
// =============================================================================

/// Keyring-based credential store.
///
/// Each key becomes one entry under the configured service name in the
/// platform credential store. Feature-gated behind `system-keyring`.
#[cfg(feature = "system-keyring")]
#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service: String,
}

#[cfg(feature = "system-keyring")]
impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "system-keyring")]
impl KeyringCredentialStore {
    const SERVICE_NAME: &str = "auction-login";

    pub fn new() -> Self {
        Self::with_service(Self::SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, StoreError> {
        keyring::Entry::new(&self.service, key)
            .map_err(|e| StoreError::Keyring(format!("Failed to create keyring entry: {}", e)))
    }
}

#[cfg(feature = "system-keyring")]
impl CredentialStore for KeyringCredentialStore {
    #[instrument(skip(self))]
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::Keyring(e.to_string())),
        }
    }

    #[instrument(skip(self, value))]
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| StoreError::Keyring(e.to_string()))
    }

    #[instrument(skip(self))]
    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Keyring(e.to_string())),
        }
    }

    fn name(&self) -> &str {
        "keyring"
    }
}

// =============================================================================
// MemoryCredentialStore
// =============================================================================

/// In-memory credential store.
///
/// Clones share the same map, so a test can keep a handle while the session
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    inner: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with one entry.
    pub fn with_value(key: impl Into<String>, value: impl Into<String>) -> Self {
        let store = Self::new();
        store
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
        store
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialStore for MemoryCredentialStore {
    #[instrument(skip(self))]
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(key).cloned())
    }

    #[instrument(skip(self, value))]
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    #[instrument(skip(self))]
    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.remove(key);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "@test:REFRESH_TOKEN";

    #[test]
    fn test_refresh_token_key() {
        assert_eq!(refresh_token_key("auction-login"), "@auction-login:REFRESH_TOKEN");
    }

    // =========================================================================
    // MemoryCredentialStore tests
    // =========================================================================

    #[test]
    fn test_memory_new_is_empty() {
        let store = MemoryCredentialStore::new();
        assert!(store.get(KEY).unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_set_get_remove() {
        let store = MemoryCredentialStore::new();
        store.set(KEY, "refresh").unwrap();
        assert_eq!(store.get(KEY).unwrap().as_deref(), Some("refresh"));
        store.remove(KEY).unwrap();
        assert!(store.get(KEY).unwrap().is_none());
    }

    #[test]
    fn test_memory_overwrite() {
        let store = MemoryCredentialStore::with_value(KEY, "first");
        store.set(KEY, "second").unwrap();
        assert_eq!(store.get(KEY).unwrap().as_deref(), Some("second"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_memory_remove_missing() {
        MemoryCredentialStore::new().remove(KEY).unwrap();
    }

    #[test]
    fn test_memory_clone_shares_state() {
        let a = MemoryCredentialStore::new();
        let b = a.clone();
        a.set(KEY, "shared").unwrap();
        assert_eq!(b.get(KEY).unwrap().as_deref(), Some("shared"));
    }

    #[test]
    fn test_box_dyn_store() {
        let store: Box<dyn CredentialStore> = Box::new(MemoryCredentialStore::new());
        store.set(KEY, "boxed").unwrap();
        assert_eq!(store.get(KEY).unwrap().as_deref(), Some("boxed"));
        assert_eq!(store.name(), "memory");
    }

    // =========================================================================
    // FileCredentialStore tests
    // =========================================================================

    #[test]
    fn test_file_set_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());

        assert!(store.get(KEY).unwrap().is_none());
        store.set(KEY, "refresh").unwrap();
        assert_eq!(store.get(KEY).unwrap().as_deref(), Some("refresh"));
    }

    #[test]
    fn test_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        FileCredentialStore::new(dir.path()).set(KEY, "persisted").unwrap();

        let reopened = FileCredentialStore::new(dir.path());
        assert_eq!(reopened.get(KEY).unwrap().as_deref(), Some("persisted"));
    }

    #[test]
    fn test_file_remove_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store.set(KEY, "refresh").unwrap();
        store.set("@other:KEY", "value").unwrap();

        store.remove(KEY).unwrap();
        assert!(store.get(KEY).unwrap().is_none());
        assert_eq!(store.get("@other:KEY").unwrap().as_deref(), Some("value"));
    }

    #[test]
    fn test_file_remove_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("never-created"));
        store.remove(KEY).unwrap();
        assert!(!dir.path().join("never-created").exists());
    }

    #[test]
    fn test_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested").join("dir");
        let store = FileCredentialStore::new(&nested);
        store.set(KEY, "refresh").unwrap();
        assert!(nested.join(CREDENTIALS_FILE).exists());
    }

    #[test]
    fn test_file_corrupt_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CREDENTIALS_FILE), "not json").unwrap();
        let store = FileCredentialStore::new(dir.path());
        assert!(matches!(store.get(KEY), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_file_empty_content_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CREDENTIALS_FILE), "  \n").unwrap();
        let store = FileCredentialStore::new(dir.path());
        assert!(store.get(KEY).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store.set(KEY, "refresh").unwrap();

        let metadata = std::fs::metadata(dir.path().join(CREDENTIALS_FILE)).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_file_name() {
        assert_eq!(FileCredentialStore::new("/tmp/creds").name(), "file");
    }

    #[cfg(feature = "system-keyring")]
    #[test]
    fn test_keyring_name() {
        assert_eq!(KeyringCredentialStore::new().name(), "keyring");
    }
}
