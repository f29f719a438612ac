use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::GustError;
use crate::provider::ProviderConfig;

/// Persisted registry state. Active pointers are stored by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_chat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_fim: Option<String>,
}

/// Backing storage for the provider registry.
pub trait ProviderStore: Send + Sync {
    fn load(&self) -> Result<RegistrySnapshot, GustError>;
    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), GustError>;
}

/// Non-persistent store, used when no providers path is configured.
#[derive(Default)]
pub struct MemoryProviderStore {
    inner: Mutex<RegistrySnapshot>,
}

impl MemoryProviderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            inner: Mutex::new(snapshot),
        }
    }
}

impl ProviderStore for MemoryProviderStore {
    fn load(&self) -> Result<RegistrySnapshot, GustError> {
        self.inner
            .lock()
            .map(|s| s.clone())
            .map_err(|_| GustError::Store("memory store lock poisoned".to_string()))
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), GustError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| GustError::Store("memory store lock poisoned".to_string()))?;
        *guard = snapshot.clone();
        Ok(())
    }
}

/// JSON file store. Writes go to a sibling temp file first and are renamed
/// into place so a crash never leaves a truncated registry behind.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl ProviderStore for JsonFileStore {
    fn load(&self) -> Result<RegistrySnapshot, GustError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistrySnapshot::default());
            }
            Err(e) => return Err(GustError::Store(format!("{}: {e}", self.path.display()))),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| GustError::Store(format!("{}: {e}", self.path.display())))
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), GustError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GustError::Store(format!("{}: {e}", parent.display())))?;
        }
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| GustError::Store(format!("serialize registry: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| GustError::Store(format!("{}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| GustError::Store(format!("{}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("providers.json"));
        assert_eq!(store.load().unwrap(), RegistrySnapshot::default());
    }

    #[test]
    fn file_store_persists_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("providers.json"));
        let mut provider = ProviderConfig::default_chat(&Config::default());
        provider.id = "p1".to_string();
        let snapshot = RegistrySnapshot {
            providers: BTreeMap::from([("p1".to_string(), provider)]),
            active_chat: Some("p1".to_string()),
            active_fim: None,
        };
        store.save(&snapshot).unwrap();

        let reopened = JsonFileStore::new(store.path().to_path_buf());
        assert_eq!(reopened.load().unwrap(), snapshot);
    }

    #[test]
    fn file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(&path, b"not json").unwrap();
        let err = JsonFileStore::new(path).load().unwrap_err();
        assert!(matches!(err, GustError::Store(_)));
    }
}
