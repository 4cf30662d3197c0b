use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    backend::{Backend, DynBackend, ErasedBackend, Invalidation, Resource},
    config::GatewayConfig,
    error::{GatewayError, Result},
    memory::{CacheHit, CachedResult, MemoryCache, NewEntry},
    notify::EventSink,
    passthrough::{LocalFiles, PassThrough},
    persistent::{PersistentCache, Record},
    store::BlobStore,
    types::{
        DirectoryData, ExternalRequest, ExternalResponse, FileChange, RequestOp, HANDLER_FAILED,
        NOT_FOUND, NO_CLIENT,
    },
    uri::{is_valid_service_name, service_root, ServiceUri},
};

struct ServiceSlot {
    name: String,
    backend: Arc<dyn DynBackend>,
    feed: Option<JoinHandle<()>>,
}

struct Inner {
    config: GatewayConfig,
    services: RwLock<HashMap<String, Arc<ServiceSlot>>>,
    files: MemoryCache<String>,
    listings: MemoryCache<Vec<String>>,
    persistent: PersistentCache,
    pass_through: Arc<dyn PassThrough>,
    events: Arc<dyn EventSink>,
    suspended: AtomicBool,
    workspaces: Mutex<BTreeSet<String>>,
    activity: Mutex<BTreeMap<String, usize>>,
    pending: Mutex<CancellationToken>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Result payloads the gateway caches, one memory map each
#[async_trait]
trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn memory(inner: &Inner) -> &MemoryCache<Self>;
    async fn fetch(resource: &dyn Resource) -> Result<Option<Self>>;
}

#[async_trait]
impl Payload for String {
    fn memory(inner: &Inner) -> &MemoryCache<Self> {
        &inner.files
    }

    async fn fetch(resource: &dyn Resource) -> Result<Option<Self>> {
        resource.read().await
    }
}

#[async_trait]
impl Payload for Vec<String> {
    fn memory(inner: &Inner) -> &MemoryCache<Self> {
        &inner.listings
    }

    async fn fetch(resource: &dyn Resource) -> Result<Option<Self>> {
        resource.list().await
    }
}

/// Decrements the in-flight counter of a service when dropped
struct ActivityGuard<'a> {
    inner: &'a Inner,
    service: String,
}

impl<'a> ActivityGuard<'a> {
    fn new(inner: &'a Inner, service: &str) -> Self {
        *lock(&inner.activity).entry(service.to_string()).or_default() += 1;
        Self {
            inner,
            service: service.to_string(),
        }
    }
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        let mut activity = lock(&self.inner.activity);
        if let Some(count) = activity.get_mut(&self.service) {
            *count -= 1;
            if *count == 0 {
                activity.remove(&self.service);
            }
        }
    }
}

/// Registration of a backend; call [`unregister`](Self::unregister) to remove it
#[derive(Debug)]
pub struct ServiceHandle {
    gateway: Weak<Inner>,
    name: String,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unregister the service, dispose its backend and notify consumers
    pub fn unregister(self) -> bool {
        match self.gateway.upgrade() {
            Some(inner) => Gateway { inner }.unregister_service(&self.name),
            None => false,
        }
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("scheme", &self.config.scheme)
            .field("files", &self.files.len())
            .field("listings", &self.listings.len())
            .field("suspended", &self.suspended.load(Ordering::SeqCst))
            .finish()
    }
}

/// Resolves service URIs through the cache tiers and registered backends
///
/// A lookup is answered from the memory tier, the persistent tier, or a live
/// backend call, in that order. Transient outcomes (no backend, backend
/// failure) stay in memory only, until the next invalidation of their service.
#[derive(Clone, Debug)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Create a gateway with the local filesystem as pass-through
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn BlobStore>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        Self::with_pass_through(config, store, events, Arc::new(LocalFiles))
    }

    pub fn with_pass_through(
        config: GatewayConfig,
        store: Arc<dyn BlobStore>,
        events: Arc<dyn EventSink>,
        pass_through: Arc<dyn PassThrough>,
    ) -> Result<Self> {
        config.validate()?;
        let persistent = PersistentCache::new(store, config.cache_version.clone())
            .with_delete_concurrency(config.delete_concurrency);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                services: RwLock::new(HashMap::new()),
                files: MemoryCache::new(),
                listings: MemoryCache::new(),
                persistent,
                pass_through,
                events,
                suspended: AtomicBool::new(false),
                workspaces: Mutex::new(BTreeSet::new()),
                activity: Mutex::new(BTreeMap::new()),
                pending: Mutex::new(CancellationToken::new()),
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn scheme(&self) -> &str {
        &self.inner.config.scheme
    }

    fn service(&self, name: &str) -> Option<Arc<ServiceSlot>> {
        self.inner
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn slots(&self) -> Vec<Arc<ServiceSlot>> {
        self.inner
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Names of the registered services
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<_> = self.slots().iter().map(|s| s.name.clone()).collect();
        names.sort();
        names
    }

    /// Register `backend` under `name`
    ///
    /// The name must be non-empty uppercase ASCII and not yet registered. A
    /// backend with a change feed is subscribed here, so this must run inside
    /// a tokio runtime.
    pub fn register_service<B: Backend>(&self, name: &str, backend: Arc<B>) -> Result<ServiceHandle> {
        if !is_valid_service_name(name) {
            return Err(GatewayError::InvalidServiceName {
                name: name.to_string(),
            });
        }

        let backend: Arc<dyn DynBackend> = Arc::new(ErasedBackend::new(backend));
        {
            let mut services = self.inner.services.write().unwrap_or_else(|e| e.into_inner());
            if services.contains_key(name) {
                return Err(GatewayError::ServiceAlreadyRegistered {
                    name: name.to_string(),
                });
            }
            let feed = backend.invalidations().map(|receiver| {
                tokio::spawn(run_change_feed(
                    Arc::downgrade(&self.inner),
                    name.to_string(),
                    receiver,
                ))
            });
            services.insert(
                name.to_string(),
                Arc::new(ServiceSlot {
                    name: name.to_string(),
                    backend: backend.clone(),
                    feed,
                }),
            );
        }
        tracing::info!(service = name, capabilities = ?backend.capabilities(), "Service registered");

        if self.is_suspended() {
            backend.suspended();
        }
        let stale = self.drop_memory(|service, _| service == name);
        self.notify([name.to_string()], stale);

        Ok(ServiceHandle {
            gateway: Arc::downgrade(&self.inner),
            name: name.to_string(),
        })
    }

    /// Forget a service; returns `false` if it was not registered
    pub fn unregister_service(&self, name: &str) -> bool {
        let slot = self
            .inner
            .services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        let Some(slot) = slot else {
            return false;
        };
        if let Some(feed) = &slot.feed {
            feed.abort();
        }
        slot.backend.dispose();
        tracing::info!(service = name, "Service unregistered");

        let stale = self.drop_memory(|service, _| service == name);
        self.notify([name.to_string()], stale);
        true
    }

    /// Unregister every service and cancel pending requests
    pub fn shutdown(&self) {
        self.reset();
        for name in self.services() {
            self.unregister_service(&name);
        }
    }

    /// Add a workspace whose root URIs are notified on service changes
    ///
    /// The workspace is identified by the fragment its requests carry.
    pub fn add_workspace(&self, fragment: impl Into<String>) {
        lock(&self.inner.workspaces).insert(fragment.into());
    }

    pub fn remove_workspace(&self, fragment: &str) -> bool {
        lock(&self.inner.workspaces).remove(fragment)
    }

    pub fn workspaces(&self) -> Vec<String> {
        lock(&self.inner.workspaces).iter().cloned().collect()
    }

    /// Number of lookups currently in flight, per service
    pub fn activity(&self) -> BTreeMap<String, usize> {
        lock(&self.inner.activity).clone()
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst)
    }

    /// Stop calling backends; lookups needing one resolve to "no client"
    pub fn suspend_all(&self) {
        let was_suspended = self.inner.suspended.swap(true, Ordering::SeqCst);
        for slot in self.slots() {
            slot.backend.suspended();
        }
        if !was_suspended {
            tracing::info!("Remote activity suspended");
            self.inner.events.suspension_changed(true);
        }
    }

    /// Allow backend calls again and retry everything cached in memory
    pub fn resume_all(&self) {
        self.inner.suspended.store(false, Ordering::SeqCst);
        let slots = self.slots();
        for slot in &slots {
            slot.backend.resumed();
        }
        tracing::info!("Remote activity resumed");
        self.inner.events.suspension_changed(false);

        let names: Vec<String> = slots.iter().map(|s| s.name.clone()).collect();
        let stale = self.drop_memory(|service, _| names.iter().any(|n| n == service));
        self.notify(names, stale);
    }

    /// Drop cached results and notify every URI that referenced them
    ///
    /// `None` for `service` means every service; `paths` restricts the clear to
    /// exact normalized paths, and `server_id` to records of one server.
    pub async fn clear_cache(
        &self,
        service: Option<&str>,
        paths: Option<&[String]>,
        server_id: Option<&str>,
    ) {
        let removed = self.inner.persistent.clear(service, paths, server_id).await;
        let stale = self.drop_memory(|s, p| {
            service.map_or(true, |wanted| wanted == s)
                && paths.map_or(true, |paths| paths.iter().any(|wanted| wanted == p))
        });
        tracing::debug!(
            service = ?service,
            records = removed,
            uris = stale.len(),
            "Cache cleared"
        );

        let services = match service {
            Some(service) => vec![service.to_string()],
            None => self.services(),
        };
        self.notify(services, stale);
    }

    /// Drop cached results of `service` whose normalized path matches
    pub async fn clear_cache_by_predicate<P>(&self, service: &str, predicate: P)
    where
        P: Fn(&str) -> bool + Send + Sync,
    {
        let removed = self.inner.persistent.clear_matching(service, &predicate).await;
        let stale = self.drop_memory(|s, p| s == service && predicate(p));
        tracing::debug!(
            service,
            records = removed,
            uris = stale.len(),
            "Cache cleared by predicate"
        );
        self.notify([service.to_string()], stale);
    }

    fn drop_memory(&self, matches: impl Fn(&str, &str) -> bool) -> BTreeSet<String> {
        let mut stale = self.inner.files.remove_where(&matches);
        stale.append(&mut self.inner.listings.remove_where(&matches));
        stale
    }

    fn notify(&self, services: impl IntoIterator<Item = String>, stale: BTreeSet<String>) {
        let workspaces = self.workspaces();
        let mut uris = stale;
        for service in services {
            if workspaces.is_empty() {
                uris.insert(service_root(self.scheme(), &service, None));
            }
            for workspace in &workspaces {
                uris.insert(service_root(self.scheme(), &service, Some(workspace)));
            }
        }
        if uris.is_empty() {
            return;
        }
        tracing::debug!(count = uris.len(), "Notifying changed URIs");
        self.inner
            .events
            .files_changed(uris.into_iter().map(FileChange::changed).collect());
    }

    /// Cancel every request started through [`serve`](Self::serve) or
    /// [`handle_request_cancellable`](Self::handle_request_cancellable) with
    /// the current token; their results are discarded
    pub fn reset(&self) {
        let mut pending = lock(&self.inner.pending);
        pending.cancel();
        *pending = CancellationToken::new();
    }

    /// Token covering requests started now, cancelled by the next [`reset`](Self::reset)
    pub fn pending_token(&self) -> CancellationToken {
        lock(&self.inner.pending).clone()
    }

    /// Validate a raw channel message and handle it
    ///
    /// Messages without a numeric `id` and a string `op` get no answer.
    pub async fn handle_raw_message(&self, message: &Value) -> Option<ExternalResponse> {
        match parse_raw_message(message)? {
            Ok(request) => Some(self.handle_request(request).await),
            Err(response) => Some(response),
        }
    }

    /// Like [`handle_request`](Self::handle_request), but gives up when
    /// `token` is cancelled; a result arriving after that is discarded
    pub async fn handle_request_cancellable(
        &self,
        request: ExternalRequest,
        token: &CancellationToken,
    ) -> Option<ExternalResponse> {
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            response = self.handle_request(request) => (!token.is_cancelled()).then_some(response),
        }
    }

    /// Answer raw messages from `requests` on `responses` until the request
    /// channel closes; each message is handled concurrently
    pub async fn serve(&self, mut requests: mpsc::Receiver<Value>, responses: mpsc::Sender<ExternalResponse>) {
        while let Some(message) = requests.recv().await {
            let gateway = self.clone();
            let responses = responses.clone();
            let token = self.pending_token();
            tokio::spawn(async move {
                let id = message.get("id").and_then(Value::as_i64);
                let handler = tokio::spawn(async move {
                    match parse_raw_message(&message)? {
                        Ok(request) => gateway.handle_request_cancellable(request, &token).await,
                        Err(response) => Some(response),
                    }
                });
                let response = match handler.await {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::error!(error = %e, "Request handler failed");
                        id.map(|id| ExternalResponse::error(id, HANDLER_FAILED, e.to_string()))
                    }
                };
                if let Some(response) = response {
                    let _ = responses.send(response).await;
                }
            });
        }
    }

    /// Answer one request
    pub async fn handle_request(&self, request: ExternalRequest) -> ExternalResponse {
        let id = request.id;
        let Ok(url) = Url::parse(&request.url) else {
            return ExternalResponse::invalid_request(id);
        };
        if url.scheme() != self.scheme() {
            return self.pass_through(id, request.op, &url).await;
        }

        let Some(target) = ServiceUri::parse(&url) else {
            return ExternalResponse::invalid_request(id);
        };
        let Some(slot) = self.service(&target.service) else {
            return ExternalResponse::error(id, NO_CLIENT, "No client");
        };
        let _activity = ActivityGuard::new(&self.inner, &slot.name);

        let Some(resource) = slot
            .backend
            .parse(&target.path, request.op, target.query.as_deref())
            .await
        else {
            return ExternalResponse::invalid_request(id);
        };

        match request.op {
            RequestOp::ReadFile => {
                let hit = self
                    .lookup::<String>(&slot, resource.as_ref(), &request.url)
                    .await;
                match &*hit.result {
                    CachedResult::Data(text) => ExternalResponse::File {
                        id,
                        data: text.clone(),
                    },
                    other => error_response(id, other),
                }
            }
            RequestOp::ListDirectory => {
                let hit = self
                    .lookup::<Vec<String>>(&slot, resource.as_ref(), &request.url)
                    .await;
                match &*hit.result {
                    CachedResult::Data(members) => ExternalResponse::Directory {
                        id,
                        data: DirectoryData {
                            member_urls: members
                                .iter()
                                .filter_map(|m| target.member_url(self.scheme(), m))
                                .collect(),
                        },
                    },
                    other => error_response(id, other),
                }
            }
        }
    }

    async fn pass_through(&self, id: i64, op: RequestOp, url: &Url) -> ExternalResponse {
        let result = match op {
            RequestOp::ReadFile => self
                .inner
                .pass_through
                .read_file(url)
                .await
                .map(|data| ExternalResponse::File { id, data }),
            RequestOp::ListDirectory => {
                self.inner
                    .pass_through
                    .list_directory(url)
                    .await
                    .map(|member_urls| ExternalResponse::Directory {
                        id,
                        data: DirectoryData { member_urls },
                    })
            }
        };
        result.unwrap_or_else(|e| ExternalResponse::error(id, NO_CLIENT, e.to_string()))
    }

    async fn lookup<T: Payload>(
        &self,
        slot: &ServiceSlot,
        resource: &dyn Resource,
        uri: &str,
    ) -> CacheHit<T> {
        let service = slot.name.as_str();
        let normalized_path = resource.normalized_path();
        let key = format!("/{}{}", service, normalized_path);
        let memory = T::memory(&self.inner);

        if let Some(hit) = memory.lookup(&key, uri) {
            tracing::trace!(key = %key, "Memory cache hit");
            return self.persist(service, &normalized_path, &key, hit).await;
        }

        let server_id = match resource.server_id() {
            Some(server_id) => Some(server_id),
            None if self.is_suspended() => None,
            None => slot.backend.server_id().await,
        };

        if let Some(server_id) = &server_id {
            if let Some(record) = self
                .inner
                .persistent
                .load::<T>(service, server_id, &normalized_path)
                .await
            {
                tracing::debug!(key = %key, "Persistent cache hit");
                let result = match record {
                    Record::NotFound => CachedResult::NotFound,
                    Record::Data(data) => CachedResult::Data(data),
                };
                let entry = NewEntry {
                    result,
                    service: service.to_string(),
                    normalized_path,
                    server_id: Some(server_id.clone()),
                    persisted: true,
                };
                return memory.insert(&key, entry, uri);
            }
        }

        let result = if self.is_suspended() {
            CachedResult::NoClient
        } else {
            tracing::debug!(service, resource = %resource.display(), "Calling backend");
            match T::fetch(resource).await {
                Ok(Some(data)) => CachedResult::Data(data),
                Ok(None) => CachedResult::NotFound,
                Err(e) => {
                    let message = e.to_string();
                    self.backend_failed(service, &message);
                    CachedResult::Failed(message)
                }
            }
        };

        let hit = memory.insert(
            &key,
            NewEntry {
                result,
                service: service.to_string(),
                normalized_path: normalized_path.clone(),
                server_id,
                persisted: false,
            },
            uri,
        );
        self.persist(service, &normalized_path, &key, hit).await
    }

    /// Write a definitive result to the durable tier the first time it is served
    async fn persist<T: Payload>(
        &self,
        service: &str,
        normalized_path: &str,
        key: &str,
        hit: CacheHit<T>,
    ) -> CacheHit<T> {
        let Some(server_id) = hit.server_id.as_deref().filter(|_| !hit.persisted) else {
            return hit;
        };
        let record = match &*hit.result {
            CachedResult::Data(data) => Record::Data(data),
            CachedResult::NotFound => Record::NotFound,
            CachedResult::NoClient | CachedResult::Failed(_) => return hit,
        };
        if self
            .inner
            .persistent
            .save(service, server_id, normalized_path, &record)
            .await
        {
            T::memory(&self.inner).mark_persisted(key);
        }
        hit
    }

    fn backend_failed(&self, service: &str, message: &str) {
        tracing::warn!(service, message, "Backend call failed, suspending remote activity");
        self.inner.events.backend_failed(service, message);
        self.suspend_all();
    }
}

fn error_response<T>(id: i64, result: &CachedResult<T>) -> ExternalResponse {
    match result {
        CachedResult::NotFound => ExternalResponse::error(id, NOT_FOUND, "Not found"),
        CachedResult::Failed(message) => ExternalResponse::error(id, NO_CLIENT, message.clone()),
        CachedResult::NoClient | CachedResult::Data(_) => {
            ExternalResponse::error(id, NO_CLIENT, "No client")
        }
    }
}

/// `None`: not a request at all. `Err`: a request that gets an error answer.
fn parse_raw_message(message: &Value) -> Option<std::result::Result<ExternalRequest, ExternalResponse>> {
    let id = message.get("id")?.as_i64()?;
    let op = message.get("op")?.as_str()?;

    let op = match op {
        "read_file" => RequestOp::ReadFile,
        "list_directory" => RequestOp::ListDirectory,
        _ => return Some(Err(ExternalResponse::invalid_request(id))),
    };
    let Some(url) = message.get("url").and_then(Value::as_str) else {
        return Some(Err(ExternalResponse::invalid_request(id)));
    };
    Some(Ok(ExternalRequest {
        id,
        op,
        url: url.to_string(),
        subdir: message.get("subdir").and_then(Value::as_bool),
    }))
}

async fn run_change_feed(
    gateway: Weak<Inner>,
    service: String,
    mut receiver: broadcast::Receiver<Invalidation>,
) {
    loop {
        let invalidation = match receiver.recv().await {
            Ok(invalidation) => invalidation,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(service = %service, skipped, "Change feed lagged, clearing service");
                Invalidation::All
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = gateway.upgrade() else {
            break;
        };
        let gateway = Gateway { inner };
        match invalidation {
            Invalidation::All => gateway.clear_cache(Some(&service), None, None).await,
            Invalidation::Paths { paths, server_id } => {
                gateway
                    .clear_cache(Some(&service), Some(&paths), server_id.as_deref())
                    .await
            }
            Invalidation::Matching(predicate) => {
                gateway
                    .clear_cache_by_predicate(&service, |path| predicate(path))
                    .await
            }
        }
    }
}
