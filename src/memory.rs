use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Outcome of a lookup as remembered by the memory tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedResult<T> {
    Data(T),
    NotFound,
    /// No backend was available when the lookup ran
    NoClient,
    /// The backend failed with this message
    Failed(String),
}

impl<T> CachedResult<T> {
    /// Transient outcomes stay in memory only
    pub fn is_transient(&self) -> bool {
        matches!(self, CachedResult::NoClient | CachedResult::Failed(_))
    }
}

#[derive(Debug)]
struct CacheEntry<T> {
    result: Arc<CachedResult<T>>,
    service: String,
    normalized_path: String,
    server_id: Option<String>,
    references: BTreeSet<String>,
    persisted: bool,
}

/// Snapshot of an entry handed out to the request that touched it
#[derive(Debug, Clone)]
pub struct CacheHit<T> {
    pub result: Arc<CachedResult<T>>,
    pub server_id: Option<String>,
    pub persisted: bool,
}

/// A fresh entry about to be stored
#[derive(Debug)]
pub struct NewEntry<T> {
    pub result: CachedResult<T>,
    pub service: String,
    pub normalized_path: String,
    pub server_id: Option<String>,
    pub persisted: bool,
}

/// Map of cache entries for one kind of result
///
/// Keyed by `"/" + service + normalized path`. Entries never expire, and each
/// one remembers the URIs it was served under.
#[derive(Debug)]
pub struct MemoryCache<T> {
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
}

impl<T> Default for MemoryCache<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> MemoryCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Look an entry up and record `uri` as referencing it
    pub fn lookup(&self, key: &str, uri: &str) -> Option<CacheHit<T>> {
        let mut entries = self.entries();
        let entry = entries.get_mut(key)?;
        entry.references.insert(uri.to_string());
        Some(CacheHit {
            result: entry.result.clone(),
            server_id: entry.server_id.clone(),
            persisted: entry.persisted,
        })
    }

    /// Store an entry, last writer wins
    ///
    /// References collected by a concurrent writer for the same key are kept.
    pub fn insert(&self, key: &str, entry: NewEntry<T>, uri: &str) -> CacheHit<T> {
        let mut entries = self.entries();
        let mut references = entries
            .remove(key)
            .map(|previous| previous.references)
            .unwrap_or_default();
        references.insert(uri.to_string());

        let result = Arc::new(entry.result);
        let hit = CacheHit {
            result: result.clone(),
            server_id: entry.server_id.clone(),
            persisted: entry.persisted,
        };
        entries.insert(
            key.to_string(),
            CacheEntry {
                result,
                service: entry.service,
                normalized_path: entry.normalized_path,
                server_id: entry.server_id,
                references,
                persisted: entry.persisted,
            },
        );
        hit
    }

    pub fn mark_persisted(&self, key: &str) {
        if let Some(entry) = self.entries().get_mut(key) {
            entry.persisted = true;
        }
    }

    /// Remove every entry accepted by `matches(service, normalized_path)`
    ///
    /// Returns the URIs that referenced the removed entries.
    pub fn remove_where(&self, matches: impl Fn(&str, &str) -> bool) -> BTreeSet<String> {
        let mut removed = BTreeSet::new();
        self.entries().retain(|_, entry| {
            if matches(&entry.service, &entry.normalized_path) {
                removed.append(&mut entry.references);
                false
            } else {
                true
            }
        });
        removed
    }

    /// URIs referencing any entry of `service`
    pub fn references_of(&self, service: &str) -> BTreeSet<String> {
        self.entries()
            .values()
            .filter(|entry| entry.service == service)
            .flat_map(|entry| entry.references.iter().cloned())
            .collect()
    }
}
