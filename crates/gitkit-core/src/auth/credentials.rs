use std::collections::HashMap;
use std::path::PathBuf;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use keyring::Entry;
use thiserror::Error;
use tracing::{debug, warn};

/// Keychain service name
const SERVICE_NAME: &str = "gitkit";

/// The two persisted credentials. Their storage names are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    /// Identity-provider session token (Firebase ID token)
    IdentityToken,
    /// GitHub access token
    SourceControlToken,
}

impl CredentialKey {
    pub const ALL: [CredentialKey; 2] = [CredentialKey::IdentityToken, CredentialKey::SourceControlToken];

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKey::IdentityToken => "firebase_token",
            CredentialKey::SourceControlToken => "github_token",
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Credential storage unavailable: {0}")]
    Unavailable(String),

    #[error("Credential file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Credential file is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable key/value storage for the two session tokens.
///
/// Reads never fail; an unreadable entry is reported as absent. Only the
/// session manager writes through this trait.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: CredentialKey) -> Option<String>;

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), StoreError>;

    /// Remove one entry. Removing a missing entry is not an error.
    fn clear(&self, key: CredentialKey);

    fn clear_all(&self) {
        for key in CredentialKey::ALL {
            self.clear(key);
        }
    }

    fn contains(&self, key: CredentialKey) -> bool {
        self.get(key).is_some()
    }
}

/// OS keychain backed store.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: CredentialKey) -> keyring::Result<Entry> {
        Entry::new(&self.service, key.as_str())
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, key: CredentialKey) -> Option<String> {
        match self.entry(key).and_then(|entry| entry.get_password()) {
            Ok(value) => Some(value),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                debug!(key = key.as_str(), error = %e, "Failed to read credential from keychain");
                None
            }
        }
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), StoreError> {
        self.entry(key)
            .and_then(|entry| entry.set_password(value))
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn clear(&self, key: CredentialKey) {
        match self.entry(key).and_then(|entry| entry.delete_credential()) {
            Ok(()) | Err(keyring::Error::NoEntry) => {}
            Err(e) => warn!(key = key.as_str(), error = %e, "Failed to delete credential from keychain"),
        }
    }
}

/// JSON file backed store, for hosts without a usable keychain.
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn read_map(&self) -> Result<HashMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<(), StoreError> {
        if map.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(map)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut HashMap<String, String>)) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = self.read_map()?;
        f(&mut map);
        self.write_map(&map)
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: CredentialKey) -> Option<String> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.read_map() {
            Ok(mut map) => map.remove(key.as_str()),
            Err(e) => {
                debug!(path = ?self.path, error = %e, "Failed to read credential file");
                None
            }
        }
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), StoreError> {
        self.update(|map| {
            map.insert(key.as_str().to_string(), value.to_string());
        })
    }

    fn clear(&self, key: CredentialKey) {
        if let Err(e) = self.update(|map| {
            map.remove(key.as_str());
        }) {
            warn!(key = key.as_str(), error = %e, "Failed to clear credential file entry");
        }
    }
}

/// Process-local store, for sessions that should not outlive the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<CredentialKey, String>>,
    #[cfg(test)]
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `set` fail, as a full or locked keychain would.
    #[cfg(test)]
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: CredentialKey) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), StoreError> {
        #[cfg(test)]
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("storage quota exceeded".to_string()));
        }
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, value.to_string());
        Ok(())
    }

    fn clear(&self, key: CredentialKey) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names_are_fixed() {
        assert_eq!(CredentialKey::IdentityToken.as_str(), "firebase_token");
        assert_eq!(CredentialKey::SourceControlToken.as_str(), "github_token");
    }

    #[test]
    fn test_memory_store_set_get_clear() {
        let store = MemoryStore::new();
        assert!(store.get(CredentialKey::IdentityToken).is_none());

        store.set(CredentialKey::IdentityToken, "abc").unwrap();
        store.set(CredentialKey::IdentityToken, "def").unwrap();
        assert_eq!(store.get(CredentialKey::IdentityToken).as_deref(), Some("def"));

        store.clear(CredentialKey::IdentityToken);
        store.clear(CredentialKey::IdentityToken);
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_write_failure() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.set(CredentialKey::SourceControlToken, "gh1"),
            Err(StoreError::Unavailable(_))
        ));
        assert!(!store.contains(CredentialKey::SourceControlToken));
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.json");

        let store = FileStore::new(path.clone());
        store.set(CredentialKey::IdentityToken, "id1").unwrap();
        store.set(CredentialKey::SourceControlToken, "gh1").unwrap();

        let reopened = FileStore::new(path.clone());
        assert_eq!(reopened.get(CredentialKey::IdentityToken).as_deref(), Some("id1"));
        assert_eq!(reopened.get(CredentialKey::SourceControlToken).as_deref(), Some("gh1"));

        reopened.clear_all();
        reopened.clear_all();
        assert!(!path.exists());
        assert!(store.get(CredentialKey::IdentityToken).is_none());
    }

    #[test]
    fn test_file_store_malformed_file_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "not json").unwrap();

        let store = FileStore::new(path);
        assert!(store.get(CredentialKey::IdentityToken).is_none());
        assert!(store.set(CredentialKey::IdentityToken, "id1").is_err());
    }
}
