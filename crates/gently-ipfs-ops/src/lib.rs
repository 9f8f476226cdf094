//! GentlyOS IPFS Daemon Operations
//!
//! They run the daemon, we drive it.
//! DHT, DAG and IPNS primitives over the daemon's HTTP control API.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          OpsContext                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │ DhtOperations│  │ DagOperations│  │    IpnsOperations    │   │
//! │  │  + discovery │  │  + trees     │  │  └── KeyManager      │   │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────┬───────────┘   │
//! │         │                 │                     │               │
//! │         └─────────────────┼─────────────────────┘               │
//! │                           │                                     │
//! │              ┌────────────▼────────────┐                        │
//! │              │     ConnectionPool      │                        │
//! │              │  (bounded, evicting)    │                        │
//! │              └────────────┬────────────┘                        │
//! │                           │ HTTP POST /api/v0/...               │
//! └───────────────────────────┼─────────────────────────────────────┘
//!                             ▼
//!                        IPFS daemon
//! ```
//!
//! Every operation returns an [`Envelope`]: failures from the daemon or the
//! network come back as data, never as `Err`.

pub mod config;
pub mod dag;
pub mod dht;
pub mod duration;
pub mod envelope;
pub mod ipns;
pub mod keys;
pub mod metrics;
pub mod pool;

pub use config::{ConnectionConfig, DhtConfig, Endpoint, IpnsConfig, KeyConfig, OpsConfig};
pub use dag::{DagInput, DagOperations, DagValue, ExportTarget, ImportSource, OutputFormat, PutOptions};
pub use dht::{DhtOperations, DhtRecord, DiscoveredPeer, PeerInfo};
pub use envelope::{Envelope, Failure, FailureKind};
pub use ipns::{IpnsOperations, IpnsRecord, PublishOptions, ResolveOptions};
pub use keys::{KeyInfo, KeyManager, KeyType, ProtectionLevel};
pub use metrics::{OperationStats, PerformanceMetrics};
pub use pool::{ConnectionPool, DaemonResponse, Method, PoolStats, RequestOptions};

use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    #[error("Connection pool is shut down")]
    PoolClosed,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Everything needed to talk to one daemon, built once at startup
///
/// All operations objects share the same pool; the key manager is shared
/// between direct callers and IPNS so both see one cache.
pub struct OpsContext {
    pub config: OpsConfig,
    pub pool: Arc<ConnectionPool>,
    pub dht: DhtOperations,
    pub dag: DagOperations,
    pub keys: Arc<KeyManager>,
    pub ipns: IpnsOperations,
}

impl OpsContext {
    /// Build the pool and every operations object from one config.
    ///
    /// Must be called inside a tokio runtime for the idle eviction loop to run.
    pub fn new(config: OpsConfig) -> Result<Self> {
        let pool = ConnectionPool::new(config.connection.clone())?;
        let dht = DhtOperations::new(Arc::clone(&pool), config.dht.default_timeout);
        let dag = DagOperations::new(Arc::clone(&pool));
        let keys = Arc::new(KeyManager::new(Arc::clone(&pool), config.keys.cache_ttl));
        let ipns = IpnsOperations::new(
            Arc::clone(&pool),
            Arc::clone(&keys),
            &config.ipns,
            &config.dht,
        );

        tracing::info!(api = %pool.endpoint(), "IPFS operations context ready");

        Ok(Self {
            config,
            pool,
            dht,
            dag,
            keys,
            ipns,
        })
    }

    /// Context for the default local daemon.
    pub fn local() -> Result<Self> {
        Self::new(OpsConfig::default())
    }

    /// Drain the pool and stop its eviction loop.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
