pub mod backend;
pub mod config;
pub mod dataset;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod memory;
pub mod notify;
pub mod passthrough;
pub mod persistent;
pub mod pool;
pub mod store;
pub mod sync;
pub mod types;
pub mod uri;

pub use backend::{Backend, Capabilities, Invalidation, ParsedArgs, ResourceDetails};
pub use config::{GatewayConfig, PoolConfig};
pub use dataset::{DatasetBackend, DatasetClient, DatasetDetails, EndpointIdentity};
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, ServiceHandle};
pub use logging::init_logging;
pub use notify::{DiscardEvents, EventSink, GatewayEvent};
pub use passthrough::{LocalFiles, NoPassThrough, PassThrough};
pub use persistent::PersistentCache;
pub use pool::{ClientFactory, ConnectionPool};
pub use store::{BlobStore, DiskBlobStore, MemoryBlobStore, NoStore};
pub use sync::{AsyncMutex, AsyncSemaphore};
pub use types::{
    ChangeKind, DirectoryData, ErrorBody, ExternalRequest, ExternalResponse, FileChange,
    RequestOp,
};
