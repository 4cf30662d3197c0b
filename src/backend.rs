use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{error::Result, types::RequestOp};

/// Backend-specific description of one addressed resource
pub trait ResourceDetails: Send + Sync + 'static {
    /// Canonical location of the resource within its service
    ///
    /// Used both as a cache key component and as the invalidation target.
    fn normalized_path(&self) -> String;

    /// Identity of the remote endpoint this resource lives on, if it is
    /// specific to the resource rather than the whole service
    fn server_id(&self) -> Option<String> {
        None
    }

    /// Human-readable form for diagnostics
    fn to_display_string(&self) -> String {
        self.normalized_path()
    }
}

/// Result of a successful [`Backend::parse_args`]
#[derive(Debug, Clone)]
pub struct ParsedArgs<D, C> {
    pub details: D,
    /// Opaque to the gateway, handed back to the member calls
    pub context: C,
}

/// Optional features a backend supports
///
/// Read once when the backend is registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// [`Backend::server_id`] can name the remote endpoint
    pub identity: bool,
    /// [`Backend::invalidations`] returns a change feed
    pub change_feed: bool,
    /// [`Backend::suspended`] and [`Backend::resumed`] should be called
    pub suspend_hooks: bool,
}

/// Predicate over normalized paths
pub type PathPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Cache invalidation requested by a backend's change feed
#[derive(Clone)]
pub enum Invalidation {
    /// Everything cached for the service
    All,
    /// Exact normalized paths, optionally restricted to one server
    Paths {
        paths: Vec<String>,
        server_id: Option<String>,
    },
    /// Every normalized path the predicate accepts
    Matching(PathPredicate),
}

impl Invalidation {
    pub fn matching(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Invalidation::Matching(Arc::new(predicate))
    }
}

impl fmt::Debug for Invalidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invalidation::All => f.write_str("All"),
            Invalidation::Paths { paths, server_id } => f
                .debug_struct("Paths")
                .field("paths", paths)
                .field("server_id", server_id)
                .finish(),
            Invalidation::Matching(_) => f.write_str("Matching(..)"),
        }
    }
}

/// A named service exposing a remote, read-only hierarchy
///
/// `Ok(None)` from the member calls means the resource does not exist; an
/// `Err` is a backend failure.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Details: ResourceDetails;
    type Context: Send + Sync + 'static;

    /// Turn a sub-path into resource arguments, `None` if not recognized
    async fn parse_args(
        &self,
        path: &str,
        purpose: RequestOp,
        query: Option<&str>,
    ) -> Option<ParsedArgs<Self::Details, Self::Context>>;

    /// List members; entries starting with `/` are service-absolute paths,
    /// others are relative to the listed resource
    async fn list_members(
        &self,
        details: &Self::Details,
        context: &Self::Context,
    ) -> Result<Option<Vec<String>>>;

    async fn read_member(
        &self,
        details: &Self::Details,
        context: &Self::Context,
    ) -> Result<Option<String>>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Identity of the endpoint the service is bound to right now
    async fn server_id(&self) -> Option<String> {
        None
    }

    fn invalidations(&self) -> Option<broadcast::Receiver<Invalidation>> {
        None
    }

    fn suspended(&self) {}

    fn resumed(&self) {}

    fn dispose(&self) {}
}

/// A parsed resource bound to the backend that can fetch it
#[async_trait]
pub(crate) trait Resource: Send + Sync {
    fn normalized_path(&self) -> String;
    fn server_id(&self) -> Option<String>;
    fn display(&self) -> String;
    async fn list(&self) -> Result<Option<Vec<String>>>;
    async fn read(&self) -> Result<Option<String>>;
}

struct BoundResource<B: Backend> {
    backend: Arc<B>,
    args: ParsedArgs<B::Details, B::Context>,
}

#[async_trait]
impl<B: Backend> Resource for BoundResource<B> {
    fn normalized_path(&self) -> String {
        self.args.details.normalized_path()
    }

    fn server_id(&self) -> Option<String> {
        self.args.details.server_id()
    }

    fn display(&self) -> String {
        self.args.details.to_display_string()
    }

    async fn list(&self) -> Result<Option<Vec<String>>> {
        self.backend
            .list_members(&self.args.details, &self.args.context)
            .await
    }

    async fn read(&self) -> Result<Option<String>> {
        self.backend
            .read_member(&self.args.details, &self.args.context)
            .await
    }
}

/// Object-safe view of a [`Backend`] with its capabilities resolved
#[async_trait]
pub(crate) trait DynBackend: Send + Sync {
    fn capabilities(&self) -> Capabilities;
    async fn parse(
        &self,
        path: &str,
        purpose: RequestOp,
        query: Option<&str>,
    ) -> Option<Box<dyn Resource>>;
    async fn server_id(&self) -> Option<String>;
    fn invalidations(&self) -> Option<broadcast::Receiver<Invalidation>>;
    fn suspended(&self);
    fn resumed(&self);
    fn dispose(&self);
}

pub(crate) struct ErasedBackend<B: Backend> {
    backend: Arc<B>,
    capabilities: Capabilities,
}

impl<B: Backend> ErasedBackend<B> {
    pub(crate) fn new(backend: Arc<B>) -> Self {
        let capabilities = backend.capabilities();
        Self {
            backend,
            capabilities,
        }
    }
}

#[async_trait]
impl<B: Backend> DynBackend for ErasedBackend<B> {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn parse(
        &self,
        path: &str,
        purpose: RequestOp,
        query: Option<&str>,
    ) -> Option<Box<dyn Resource>> {
        let args = self.backend.parse_args(path, purpose, query).await?;
        Some(Box::new(BoundResource {
            backend: self.backend.clone(),
            args,
        }))
    }

    async fn server_id(&self) -> Option<String> {
        if !self.capabilities.identity {
            return None;
        }
        self.backend.server_id().await
    }

    fn invalidations(&self) -> Option<broadcast::Receiver<Invalidation>> {
        if !self.capabilities.change_feed {
            return None;
        }
        self.backend.invalidations()
    }

    fn suspended(&self) {
        if self.capabilities.suspend_hooks {
            self.backend.suspended();
        }
    }

    fn resumed(&self) {
        if self.capabilities.suspend_hooks {
            self.backend.resumed();
        }
    }

    fn dispose(&self) {
        self.backend.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Path(String);

    impl ResourceDetails for Path {
        fn normalized_path(&self) -> String {
            self.0.clone()
        }
    }

    struct Echo;

    #[async_trait]
    impl Backend for Echo {
        type Details = Path;
        type Context = usize;

        async fn parse_args(
            &self,
            path: &str,
            _purpose: RequestOp,
            _query: Option<&str>,
        ) -> Option<ParsedArgs<Path, usize>> {
            (!path.is_empty()).then(|| ParsedArgs {
                details: Path(path.to_uppercase()),
                context: path.len(),
            })
        }

        async fn list_members(&self, _: &Path, context: &usize) -> Result<Option<Vec<String>>> {
            Ok(Some(vec![context.to_string()]))
        }

        async fn read_member(&self, details: &Path, _: &usize) -> Result<Option<String>> {
            Ok(Some(details.0.clone()))
        }

        async fn server_id(&self) -> Option<String> {
            Some("never asked".to_string())
        }
    }

    #[tokio::test]
    async fn test_erased_backend_binds_arguments() {
        let erased = ErasedBackend::new(Arc::new(Echo));
        assert!(erased.parse("", RequestOp::ReadFile, None).await.is_none());

        let resource = erased.parse("/abc", RequestOp::ReadFile, None).await.unwrap();
        assert_eq!(resource.normalized_path(), "/ABC");
        assert_eq!(resource.display(), "/ABC");
        assert_eq!(resource.read().await.unwrap().as_deref(), Some("/ABC"));
        assert_eq!(resource.list().await.unwrap(), Some(vec!["4".to_string()]));
    }

    #[tokio::test]
    async fn test_capabilities_gate_optional_calls() {
        let erased = ErasedBackend::new(Arc::new(Echo));
        assert_eq!(erased.capabilities(), Capabilities::default());
        assert_eq!(erased.server_id().await, None);
        assert!(erased.invalidations().is_none());
    }
}
