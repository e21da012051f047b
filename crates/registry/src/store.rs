use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{app_data_dir, Registry, Webapp};

/// Blob key holding the whole serialized registry.
pub const REGISTRY_KEY: &str = "webapps";

/// Key-value blob store backing the registry. One key holds the entire
/// collection as JSON text; writes replace the whole blob.
pub trait BlobStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, value: &str) -> Result<()>;
}

/// File-backed store, one file per key under a root directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at the per-user data directory.
    pub fn open_default() -> Result<Self> {
        let root = app_data_dir();
        fs::create_dir_all(&root)
            .with_context(|| format!("create data directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl BlobStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read blob {}", path.display())),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create data directory {}", self.root.display()))?;
        let path = self.key_path(key);
        // Whole-blob atomicity: land the bytes in a sibling file, then rename.
        let tmp = self.root.join(format!("{key}.json.tmp"));
        fs::write(&tmp, value).with_context(|| format!("write blob {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("replace blob {}", path.display()))?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        self.blobs.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Load the registry from its persisted mirror. An absent key means a fresh
/// install and yields an empty registry.
pub fn load_registry(store: &dyn BlobStore) -> Result<Registry> {
    match store.read(REGISTRY_KEY)? {
        Some(text) => {
            let webapps: Vec<Webapp> =
                serde_json::from_str(&text).context("parse persisted registry")?;
            debug!(count = webapps.len(), "loaded registry");
            Ok(Registry::from_webapps(webapps))
        }
        None => Ok(Registry::new()),
    }
}

/// Persist the registry as one JSON blob.
pub fn save_registry(store: &dyn BlobStore, registry: &Registry) -> Result<()> {
    let snapshot = registry.snapshot();
    let text = serde_json::to_string(snapshot.as_slice()).context("serialize registry")?;
    store.write(REGISTRY_KEY, &text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        let mut registry = Registry::new();
        registry.insert(Webapp::new("Notes", "notes.html", "<html><body>hi</body></html>"));

        save_registry(&store, &registry).unwrap();
        let loaded = load_registry(&store).unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.snapshot()[0], registry.snapshot()[0]);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let mut registry = Registry::new();
        let mut app = Webapp::new("Timer", "timer.html", "<html></html>");
        app.tags = vec!["tools".to_string(), "time".to_string()];
        registry.insert(app);

        save_registry(&store, &registry).unwrap();
        let loaded = load_registry(&store).unwrap();
        assert_eq!(loaded.snapshot()[0], registry.snapshot()[0]);
    }

    #[test]
    fn test_absent_key_is_empty_registry() {
        let store = MemoryStore::new();
        let registry = load_registry(&store).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_write_replaces_whole_blob() {
        let store = MemoryStore::new();
        store.write(REGISTRY_KEY, "[1]").unwrap();
        store.write(REGISTRY_KEY, "[]").unwrap();
        assert_eq!(store.read(REGISTRY_KEY).unwrap().unwrap(), "[]");
    }
}
