//! Configuration
//!
//! One YAML file covers the daemon connection and per-module defaults.
//! Every section falls back to its defaults when omitted.

use crate::duration::humanized;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default daemon API root
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5001/api/v0";

/// Environment variable overriding `connection.base_url`
pub const API_URL_ENV: &str = "GENTLY_IPFS_API";

/// Largest accepted `connection.max_connections`
pub const MAX_CONNECTIONS_LIMIT: usize = 1024;

/// How to reach the daemon and how hard to try
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// API root, e.g. `http://127.0.0.1:5001/api/v0`
    pub base_url: String,
    /// Upper bound on live sessions
    pub max_connections: usize,
    #[serde(with = "humanized")]
    pub connect_timeout: Duration,
    /// Idle sessions older than this are evicted
    #[serde(with = "humanized")]
    pub idle_timeout: Duration,
    /// Retries for retryable statuses (not for network errors)
    pub max_retries: u32,
    /// Sleep `backoff_factor * 2^attempt` seconds between retries
    pub backoff_factor: f64,
    pub retry_status_codes: Vec<u16>,
    /// Sent with every request
    pub headers: BTreeMap<String, String>,
    pub verify_tls: bool,
    /// How often the eviction loop wakes
    #[serde(with = "humanized")]
    pub eviction_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            max_connections: 10,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_retries: 3,
            backoff_factor: 0.3,
            retry_status_codes: vec![500, 502, 503, 504],
            headers: BTreeMap::new(),
            verify_tls: true,
            eviction_interval: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn retries(mut self, max_retries: u32, backoff_factor: f64) -> Self {
        self.max_retries = max_retries;
        self.backoff_factor = backoff_factor;
        self
    }

    pub fn retry_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.retry_status_codes = codes;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let secs = self.backoff_factor * 2f64.powi(attempt as i32);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }

    pub fn is_retryable(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::InvalidConfig("max_connections must be at least 1".into()));
        }
        if self.max_connections > MAX_CONNECTIONS_LIMIT {
            return Err(Error::InvalidConfig(format!(
                "max_connections must be at most {MAX_CONNECTIONS_LIMIT}, got {}",
                self.max_connections
            )));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "backoff_factor must be a non-negative number, got {}",
                self.backoff_factor
            )));
        }
        Endpoint::parse(&self.base_url).map(|_| ())
    }
}

/// Parsed form of `base_url`, computed once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: String,
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl Endpoint {
    pub fn parse(base_url: &str) -> Result<Self> {
        let url = reqwest::Url::parse(base_url)
            .map_err(|e| Error::InvalidConfig(format!("invalid base URL {base_url}: {e}")))?;

        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(Error::InvalidConfig(format!("unsupported scheme: {scheme}")));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidConfig(format!("base URL has no host: {base_url}")))?
            .to_string();

        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            scheme,
            host,
            port: url.port_or_known_default(),
            path: url.path().trim_end_matches('/').to_string(),
        })
    }

    /// Full URL for an API endpoint such as `dht/put`
    pub fn url_for(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base, endpoint.trim_start_matches('/'))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.base)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Per-call timeout forwarded to the daemon when the caller gives none
    #[serde(with = "humanized")]
    pub default_timeout: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpnsConfig {
    /// Record validity when publishing
    #[serde(with = "humanized")]
    pub default_lifetime: Duration,
    /// Cache hint for resolvers
    #[serde(with = "humanized")]
    pub default_ttl: Duration,
}

impl Default for IpnsConfig {
    fn default() -> Self {
        Self {
            default_lifetime: Duration::from_secs(24 * 3600),
            default_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// How long a key listing is trusted before asking the daemon again
    #[serde(with = "humanized")]
    pub cache_ttl: Duration,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Top-level config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub connection: ConnectionConfig,
    pub dht: DhtConfig,
    pub ipns: IpnsConfig,
    pub keys: KeyConfig,
}

impl OpsConfig {
    /// `<config dir>/gently/ipfs-ops.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gently").join("ipfs-ops.yaml"))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.connection.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&text)?;
        config.apply_env();
        tracing::debug!(path = %path.display(), "Loaded IPFS ops config");
        Ok(config)
    }

    /// Load the default file if it exists, else built-in defaults
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                let mut config = Self::default();
                config.apply_env();
                Ok(config)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.connection.base_url = url;
            }
        }
    }
}
