use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::store::BlobStore;

/// What the durable tier knows about one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record<T> {
    NotFound,
    Data(T),
}

#[derive(Serialize, Deserialize)]
struct RecordBody<T> {
    #[serde(rename = "normalizedPath")]
    normalized_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    not_exists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Deserialize)]
struct RecordPath {
    #[serde(rename = "normalizedPath")]
    normalized_path: String,
}

/// Hex sha256 of `[server_id, normalized_path]` as compact JSON
pub fn record_hash(server_id: &str, normalized_path: &str) -> String {
    // Serializing two strings cannot fail.
    let components = serde_json::to_string(&[server_id, normalized_path]).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(components.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn compress(body: &[u8]) -> Result<Bytes> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    Ok(Bytes::from(encoder.finish()?))
}

fn decompress(raw: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    ZlibDecoder::new(raw).read_to_end(&mut body)?;
    Ok(body)
}

/// Compressed, hash-keyed records on top of a [`BlobStore`]
///
/// Keys are `<version>.<SERVICE>.<sha256 of [serverId, normalizedPath]>`.
/// Store failures are logged and count as misses.
pub struct PersistentCache {
    store: Arc<dyn BlobStore>,
    version: String,
    delete_concurrency: usize,
}

impl PersistentCache {
    pub fn new(store: Arc<dyn BlobStore>, version: impl Into<String>) -> Self {
        Self {
            store,
            version: version.into(),
            delete_concurrency: 16,
        }
    }

    /// Cap the number of removals in flight during clears
    pub fn with_delete_concurrency(mut self, limit: usize) -> Self {
        self.delete_concurrency = limit.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn key(&self, service: &str, server_id: &str, normalized_path: &str) -> String {
        format!(
            "{}.{}.{}",
            self.version,
            service,
            record_hash(server_id, normalized_path)
        )
    }

    fn prefix(&self, service: Option<&str>) -> String {
        match service {
            Some(service) => format!("{}.{}.", self.version, service),
            None => format!("{}.", self.version),
        }
    }

    /// Load a record, `None` on a miss, a store failure or a malformed body
    pub async fn load<T: DeserializeOwned>(
        &self,
        service: &str,
        server_id: &str,
        normalized_path: &str,
    ) -> Option<Record<T>> {
        let key = self.key(service, server_id, normalized_path);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Persistent cache read failed");
                return None;
            }
        };

        let body: RecordBody<T> = match decompress(&raw)
            .and_then(|body| serde_json::from_slice(&body).map_err(Into::into))
        {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Ignoring malformed persistent record");
                return None;
            }
        };
        if body.normalized_path != normalized_path {
            return None;
        }
        match (body.not_exists, body.data) {
            (Some(true), _) => Some(Record::NotFound),
            (_, Some(data)) => Some(Record::Data(data)),
            _ => None,
        }
    }

    /// Write a record; failures are logged and swallowed
    pub async fn save<T: Serialize>(
        &self,
        service: &str,
        server_id: &str,
        normalized_path: &str,
        record: &Record<T>,
    ) -> bool {
        let body = match record {
            Record::NotFound => RecordBody::<&T> {
                normalized_path: normalized_path.to_string(),
                not_exists: Some(true),
                data: None,
            },
            Record::Data(data) => RecordBody {
                normalized_path: normalized_path.to_string(),
                not_exists: None,
                data: Some(data),
            },
        };
        let key = self.key(service, server_id, normalized_path);
        let stored: Result<()> = async {
            let raw = compress(&serde_json::to_vec(&body)?)?;
            self.store.set(&key, raw).await
        }
        .await;
        match stored {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Persistent cache write failed");
                false
            }
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        match self.store.keys().await {
            Ok(keys) => keys.into_iter().filter(|k| k.starts_with(prefix)).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Persistent cache listing failed");
                Vec::new()
            }
        }
    }

    async fn remove_all(&self, keys: Vec<String>) -> usize {
        stream::iter(keys)
            .map(|key| async move {
                match self.store.remove(&key).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Persistent cache delete failed");
                        false
                    }
                }
            })
            .buffer_unordered(self.delete_concurrency)
            .filter(|removed| futures::future::ready(*removed))
            .count()
            .await
    }

    /// Remove records by service and, optionally, exact normalized paths
    ///
    /// Without a server identity the paths cannot be hashed, so every record of
    /// the service is inspected instead.
    pub async fn clear(
        &self,
        service: Option<&str>,
        paths: Option<&[String]>,
        server_id: Option<&str>,
    ) -> usize {
        let keys = self.keys_with_prefix(&self.prefix(service)).await;
        let keys = match (paths, server_id) {
            (None, _) => keys,
            (Some(paths), Some(server_id)) => {
                let hashes: HashSet<String> =
                    paths.iter().map(|p| record_hash(server_id, p)).collect();
                keys.into_iter()
                    .filter(|k| k.rsplit('.').next().is_some_and(|h| hashes.contains(h)))
                    .collect()
            }
            (Some(paths), None) => {
                let wanted: HashSet<&str> = paths.iter().map(String::as_str).collect();
                self.select_by_path(keys, &|p: &str| wanted.contains(p)).await
            }
        };
        self.remove_all(keys).await
    }

    /// Remove every record of `service` whose normalized path matches
    pub async fn clear_matching(&self, service: &str, predicate: &(dyn Fn(&str) -> bool + Sync)) -> usize {
        let keys = self.keys_with_prefix(&self.prefix(Some(service))).await;
        let keys = self.select_by_path(keys, predicate).await;
        self.remove_all(keys).await
    }

    async fn select_by_path(
        &self,
        keys: Vec<String>,
        predicate: &(dyn Fn(&str) -> bool + Sync),
    ) -> Vec<String> {
        stream::iter(keys)
            .map(|key| async move {
                let raw = self.store.get(&key).await.ok().flatten()?;
                let body = decompress(&raw).ok()?;
                let record: RecordPath = serde_json::from_slice(&body).ok()?;
                predicate(&record.normalized_path).then_some(key)
            })
            .buffer_unordered(self.delete_concurrency)
            .filter_map(futures::future::ready)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlobStore;

    fn cache() -> (Arc<MemoryBlobStore>, PersistentCache) {
        let store = Arc::new(MemoryBlobStore::new());
        let cache = PersistentCache::new(store.clone(), "v3");
        (store, cache)
    }

    async fn put_raw(store: &MemoryBlobStore, key: &str, json: serde_json::Value) {
        let raw = compress(&serde_json::to_vec(&json).unwrap()).unwrap();
        store.set(key, raw).await.unwrap();
    }

    #[test]
    fn test_key_derivation() {
        let (_, cache) = cache();
        let mut hasher = Sha256::new();
        hasher.update(br#"["SERVER","/DIR"]"#);
        let expected = format!("v3.TEST.{:x}", hasher.finalize());
        assert_eq!(cache.key("TEST", "SERVER", "/DIR"), expected);
    }

    #[tokio::test]
    async fn test_reads_records_of_expected_shape() {
        let (store, cache) = cache();
        put_raw(
            &store,
            &cache.key("TEST", "SERVER", "/DIR"),
            serde_json::json!({"normalizedPath": "/DIR", "not_exists": true}),
        )
        .await;
        put_raw(
            &store,
            &cache.key("TEST", "SERVER", "/DIR2"),
            serde_json::json!({"normalizedPath": "/DIR2", "data": ["/DIR2/FILE"]}),
        )
        .await;

        assert_eq!(
            cache.load::<Vec<String>>("TEST", "SERVER", "/DIR").await,
            Some(Record::NotFound)
        );
        assert_eq!(
            cache.load::<Vec<String>>("TEST", "SERVER", "/DIR2").await,
            Some(Record::Data(vec!["/DIR2/FILE".to_string()]))
        );
        // A listing is not file content
        assert_eq!(cache.load::<String>("TEST", "SERVER", "/DIR2").await, None);
        // Other server
        assert_eq!(cache.load::<Vec<String>>("TEST", "OTHER", "/DIR2").await, None);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_a_miss() {
        let (store, cache) = cache();
        store
            .set(&cache.key("TEST", "S", "/X"), Bytes::from_static(&[0]))
            .await
            .unwrap();
        assert_eq!(cache.load::<String>("TEST", "S", "/X").await, None);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let (_, cache) = cache();
        assert!(cache.save("TEST", "S", "/F", &Record::Data("text".to_string())).await);
        assert!(cache.save::<String>("TEST", "S", "/G", &Record::NotFound).await);

        assert_eq!(
            cache.load::<String>("TEST", "S", "/F").await,
            Some(Record::Data("text".to_string()))
        );
        assert_eq!(cache.load::<String>("TEST", "S", "/G").await, Some(Record::NotFound));
    }

    #[tokio::test]
    async fn test_selective_clear_by_path() {
        let (store, cache) = cache();
        cache.save("TEST2", "SERVER", "B", &Record::Data("b".to_string())).await;
        cache.save("TEST", "SERVER", "A", &Record::Data("a".to_string())).await;
        cache.save("TEST", "SERVER", "C", &Record::Data("c".to_string())).await;

        let removed = cache
            .clear(Some("TEST"), Some(&["A".to_string()]), Some("SERVER"))
            .await;
        assert_eq!(removed, 1);
        assert!(!store.contains(&cache.key("TEST", "SERVER", "A")).await);
        assert!(store.contains(&cache.key("TEST", "SERVER", "C")).await);
        assert!(store.contains(&cache.key("TEST2", "SERVER", "B")).await);

        // Without an identity the embedded paths are inspected
        assert_eq!(cache.clear(Some("TEST"), Some(&["C".to_string()]), None).await, 1);
        assert_eq!(store.len().await, 1);

        assert_eq!(cache.clear(None, None, None).await, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_clear_matching_reads_embedded_path() {
        let (store, cache) = cache();
        put_raw(
            &store,
            &cache.key("TEST", "SERVER", "A"),
            serde_json::json!({"normalizedPath": "/SERVER/A"}),
        )
        .await;
        put_raw(
            &store,
            &cache.key("TEST", "SERVER", "B"),
            serde_json::json!({"normalizedPath": "/SERVER/B"}),
        )
        .await;
        put_raw(
            &store,
            &cache.key("TEST2", "SERVER", "A"),
            serde_json::json!({"normalizedPath": "/SERVER/A"}),
        )
        .await;

        let removed = cache.clear_matching("TEST", &|p: &str| p.ends_with("/A")).await;
        assert_eq!(removed, 1);
        assert!(!store.contains(&cache.key("TEST", "SERVER", "A")).await);
        assert!(store.contains(&cache.key("TEST2", "SERVER", "A")).await);
        assert_eq!(store.len().await, 2);
    }
}
