use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::broadcast;

use crate::{
    backend::{Backend, Capabilities, Invalidation, ParsedArgs, ResourceDetails},
    config::PoolConfig,
    error::Result,
    pool::{ClientFactory, ConnectionPool},
    sync::AsyncMutex,
    types::RequestOp,
};

static DATASET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z$#@][A-Z$#@0-9]{0,7}(?:\.[A-Z$#@][A-Z$#@0-9]{0,7})*$")
        .expect("valid dataset pattern")
});
static MEMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z$#@][A-Z$#@0-9]{0,7})(?:\..*)?$").expect("valid member pattern")
});

const MAX_DATASET_LEN: usize = 44;
const MEMBER_EXTENSION: &str = ".hlasm";

/// Connection to a dataset server
#[async_trait]
pub trait DatasetClient: Send + Sync + 'static {
    /// Member names of a dataset, `None` if it does not exist
    async fn list(&self, dataset: &str) -> Result<Option<Vec<String>>>;

    /// Member content, `None` if it does not exist
    async fn read(&self, dataset: &str, member: &str) -> Result<Option<String>>;
}

/// Names the endpoint a connection factory talks to
///
/// May have to gather credentials first; calls are serialized.
#[async_trait]
pub trait EndpointIdentity: Send + Sync + 'static {
    async fn identify(&self) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDetails {
    pub dataset: String,
    pub member: Option<String>,
}

impl DatasetDetails {
    /// Parse `/DATASET[/MEMBER[.ext]]` for the given purpose
    pub fn parse(path: &str, purpose: RequestOp) -> Option<Self> {
        let mut segments = path.strip_prefix('/')?.split('/');
        let dataset = segments.next()?.to_uppercase();
        let member = segments.next().filter(|m| !m.is_empty()).map(str::to_uppercase);
        if segments.next().is_some_and(|rest| !rest.is_empty()) {
            return None;
        }
        if dataset.len() > MAX_DATASET_LEN || !DATASET.is_match(&dataset) {
            return None;
        }

        let member = match (purpose, member) {
            (RequestOp::ListDirectory, None) => None,
            (RequestOp::ListDirectory, Some(_)) => return None,
            (RequestOp::ReadFile, None) => return None,
            (RequestOp::ReadFile, Some(member)) => {
                Some(MEMBER.captures(&member)?.get(1)?.as_str().to_string())
            }
        };
        Some(Self { dataset, member })
    }
}

impl ResourceDetails for DatasetDetails {
    fn normalized_path(&self) -> String {
        format!("/{}/{}", self.dataset, self.member.as_deref().unwrap_or(""))
    }

    fn to_display_string(&self) -> String {
        match &self.member {
            Some(member) => format!("{}({})", self.dataset, member),
            None => self.dataset.clone(),
        }
    }
}

/// Dataset service over a pool of [`DatasetClient`] connections
///
/// Paths look like `/DATASET` (list the members) or `/DATASET/MEMBER[.ext]`
/// (read a member, the extension is ignored). Members are listed as
/// `/DATASET/MEMBER.hlasm`.
pub struct DatasetBackend<F: ClientFactory> {
    pool: ConnectionPool<F>,
    identity_lock: AsyncMutex,
    identity: Mutex<Option<String>>,
    suspended: AtomicBool,
    changes: broadcast::Sender<Invalidation>,
}

impl<F> DatasetBackend<F>
where
    F: ClientFactory + EndpointIdentity,
    F::Client: DatasetClient,
{
    pub fn new(factory: F, pool: &PoolConfig) -> Result<Self> {
        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            pool: ConnectionPool::from_config(factory, pool)?,
            identity_lock: AsyncMutex::new(),
            identity: Mutex::new(None),
            suspended: AtomicBool::new(false),
            changes,
        })
    }

    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.pool
    }

    /// Tell the gateway that cached content went stale
    pub fn invalidate(&self, invalidation: Invalidation) {
        // No receiver just means nobody caches this service yet.
        let _ = self.changes.send(invalidation);
    }

    fn cached_identity(&self) -> Option<String> {
        self.identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl<F> Backend for DatasetBackend<F>
where
    F: ClientFactory + EndpointIdentity,
    F::Client: DatasetClient,
{
    type Details = DatasetDetails;
    type Context = ();

    async fn parse_args(
        &self,
        path: &str,
        purpose: RequestOp,
        _query: Option<&str>,
    ) -> Option<ParsedArgs<DatasetDetails, ()>> {
        DatasetDetails::parse(path, purpose).map(|details| ParsedArgs {
            details,
            context: (),
        })
    }

    async fn list_members(&self, details: &DatasetDetails, _: &()) -> Result<Option<Vec<String>>> {
        let dataset = details.dataset.clone();
        let members = self
            .pool
            .with_client(|client| async move { client.list(&dataset).await })
            .await?;
        Ok(members.map(|members| {
            members
                .into_iter()
                .map(|member| format!("/{}/{}{}", details.dataset, member, MEMBER_EXTENSION))
                .collect()
        }))
    }

    async fn read_member(&self, details: &DatasetDetails, _: &()) -> Result<Option<String>> {
        let Some(member) = details.member.clone() else {
            return Ok(None);
        };
        let dataset = details.dataset.clone();
        self.pool
            .with_client(|client| async move { client.read(&dataset, &member).await })
            .await
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            identity: true,
            change_feed: true,
            suspend_hooks: true,
        }
    }

    async fn server_id(&self) -> Option<String> {
        self.identity_lock
            .locked(|| async {
                if self.suspended.load(Ordering::SeqCst) {
                    return None;
                }
                if let Some(identity) = self.cached_identity() {
                    return Some(identity);
                }
                match self.pool.factory().identify().await {
                    // Suspended while identifying; the answer may be stale.
                    Ok(_) if self.suspended.load(Ordering::SeqCst) => None,
                    Ok(identity) => {
                        *self.identity.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(identity.clone());
                        Some(identity)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Unable to identify dataset server");
                        None
                    }
                }
            })
            .await
    }

    fn invalidations(&self) -> Option<broadcast::Receiver<Invalidation>> {
        Some(self.changes.subscribe())
    }

    fn suspended(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        // Credentials are gathered again after resume, the endpoint may change.
        *self.identity.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.pool.close_clients();
    }

    fn resumed(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    fn dispose(&self) {
        self.pool.dispose();
    }
}
