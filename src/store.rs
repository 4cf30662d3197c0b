use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};

/// Durable key/value surface backing the persistent cache tier
///
/// Writes are whole-value overwrites and removals are unconditional.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Get stored bytes by key
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store bytes under a key, replacing any previous value
    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    /// Check if a key exists in the store
    async fn contains(&self, key: &str) -> bool;

    /// Remove a key, missing keys are not an error
    async fn remove(&self, key: &str) -> Result<()>;

    /// List every stored key
    async fn keys(&self) -> Result<Vec<String>>;

    /// Remove everything
    async fn clear(&self) -> Result<()>;
}

/// In-memory store, mostly useful for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.blobs.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn contains(&self, key: &str) -> bool {
        self.blobs.read().await.contains_key(key)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.blobs.read().await.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.blobs.write().await.clear();
        Ok(())
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key != "."
        && key != ".."
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

fn store_error(action: &str, key: &str, e: std::io::Error) -> GatewayError {
    GatewayError::Store {
        message: format!("{action} `{key}`: {e}"),
    }
}

/// One file per key in a flat directory
///
/// Values are written to a scratch file and renamed into place, so readers
/// never see a partial record. Files whose names are not valid keys are
/// ignored, which lets the directory be shared.
#[derive(Debug)]
pub struct DiskBlobStore {
    dir: PathBuf,
}

impl DiskBlobStore {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        if !is_valid_key(key) {
            return Err(GatewayError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match fs::read(self.path_of(key)?).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_error("reading", key, e)),
        }
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let path = self.path_of(key)?;
        // `~` never appears in a valid key.
        let scratch = self.dir.join(format!("~{key}"));
        fs::write(&scratch, &value)
            .await
            .map_err(|e| store_error("writing", key, e))?;
        fs::rename(&scratch, &path)
            .await
            .map_err(|e| store_error("committing", key, e))
    }

    async fn contains(&self, key: &str) -> bool {
        match self.path_of(key) {
            Ok(path) => fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_of(key)?).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(store_error("removing", key, e)),
            _ => Ok(()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_valid_key(&name) && entry.file_type().await?.is_file() {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> Result<()> {
        for key in self.keys().await? {
            self.remove(&key).await?;
        }
        Ok(())
    }
}

/// Keeps nothing; every lookup misses
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStore;

#[async_trait]
impl BlobStore for NoStore {
    async fn get(&self, _: &str) -> Result<Option<Bytes>> {
        Ok(None)
    }

    async fn set(&self, _: &str, _: Bytes) -> Result<()> {
        Ok(())
    }

    async fn contains(&self, _: &str) -> bool {
        false
    }

    async fn remove(&self, _: &str) -> Result<()> {
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryBlobStore::new();
        assert!(store.get("v3.A.x").await.unwrap().is_none());

        store.set("v3.B.y", Bytes::from("second")).await.unwrap();
        store.set("v3.A.x", Bytes::from("first")).await.unwrap();
        store.set("v3.A.x", Bytes::from("replaced")).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert_eq!(store.keys().await.unwrap(), vec!["v3.A.x", "v3.B.y"]);
        assert_eq!(
            store.get("v3.A.x").await.unwrap(),
            Some(Bytes::from("replaced"))
        );

        store.remove("v3.A.x").await.unwrap();
        store.remove("v3.A.x").await.unwrap();
        assert!(!store.contains("v3.A.x").await);

        store.clear().await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_disk_store() {
        let dir = TempDir::new().unwrap();
        let store = DiskBlobStore::new(dir.path().join("cache")).await.unwrap();

        store.set("v3.TEST.abc", Bytes::from("x")).await.unwrap();
        store.set("v3.TEST.def", Bytes::from("y")).await.unwrap();
        assert!(store.contains("v3.TEST.abc").await);

        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["v3.TEST.abc", "v3.TEST.def"]);

        store.remove("v3.TEST.abc").await.unwrap();
        store.remove("v3.TEST.abc").await.unwrap();
        assert_eq!(store.get("v3.TEST.abc").await.unwrap(), None);
        assert_eq!(store.get("v3.TEST.def").await.unwrap(), Some(Bytes::from("y")));

        // Foreign files survive a clear and are never listed
        std::fs::write(store.dir().join("keep me"), "x").unwrap();
        std::fs::write(store.dir().join("~partial"), "x").unwrap();
        store.clear().await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
        assert!(store.dir().join("keep me").exists());
    }

    #[tokio::test]
    async fn test_disk_store_rejects_unsafe_keys() {
        let dir = TempDir::new().unwrap();
        let store = DiskBlobStore::new(dir.path().to_path_buf()).await.unwrap();

        assert!(matches!(
            store.set("../escape", Bytes::new()).await,
            Err(GatewayError::InvalidKey { .. })
        ));
        assert!(!store.contains("a/b").await);
    }
}
