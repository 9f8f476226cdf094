//! IPNS Operations
//!
//! Publish and resolve mutable names. Every publish is checked against the
//! key manager first and remembered in a local record cache, which is what
//! expiry and sequence numbers are tracked against.

use crate::config::{DhtConfig, IpnsConfig};
use crate::dht::DhtOperations;
use crate::duration::{format_duration, humanized, parse_duration};
use crate::envelope::{base64_bytes, Envelope, Failure};
use crate::keys::KeyManager;
use crate::metrics::PerformanceMetrics;
use crate::pool::{ConnectionPool, DaemonResponse, RequestOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const DEFAULT_KEY: &str = "self";

/// A name we published, as we last saw it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpnsRecord {
    /// Peer id of the publishing key
    pub name: String,
    /// Usually `/ipfs/<cid>`
    pub value: String,
    pub key_name: String,
    pub sequence: u64,
    #[serde(with = "humanized")]
    pub ttl: Duration,
    #[serde(with = "humanized")]
    pub validity: Duration,
    #[serde(default, with = "base64_bytes::option", skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    pub created: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
}

impl IpnsRecord {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        key_name: impl Into<String>,
        sequence: u64,
        ttl: Duration,
        validity: Duration,
    ) -> Self {
        let created = Utc::now();
        let expiration = chrono::Duration::from_std(validity)
            .ok()
            .and_then(|v| created.checked_add_signed(v))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            name: name.into(),
            value: value.into(),
            key_name: key_name.into(),
            sequence,
            ttl,
            validity,
            signature: None,
            created,
            expiration,
        }
    }

    /// A zero validity is expired from the start
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }
}

/// Options for [`IpnsOperations::publish`]
///
/// `lifetime` and `ttl` are Go-style strings forwarded verbatim; when they do
/// not parse, the local record falls back to the configured defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub key_name: String,
    pub lifetime: Option<String>,
    pub ttl: Option<String>,
    /// Have the daemon check the path resolves before publishing
    pub resolve: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            key_name: DEFAULT_KEY.to_string(),
            lifetime: None,
            ttl: None,
            resolve: true,
        }
    }
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key_name: impl Into<String>) -> Self {
        self.key_name = key_name.into();
        self
    }

    pub fn lifetime(mut self, lifetime: impl Into<String>) -> Self {
        self.lifetime = Some(lifetime.into());
        self
    }

    pub fn ttl(mut self, ttl: impl Into<String>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    pub fn resolve(mut self, resolve: bool) -> Self {
        self.resolve = resolve;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    pub recursive: bool,
    /// Also fetch the signed record from the DHT
    pub dht_record: bool,
    pub nocache: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            dht_record: false,
            nocache: false,
        }
    }
}

impl ResolveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn dht_record(mut self, dht_record: bool) -> Self {
        self.dht_record = dht_record;
        self
    }

    pub fn nocache(mut self, nocache: bool) -> Self {
        self.nocache = nocache;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub name: String,
    pub path: String,
    /// Raw base64 record as stored in the DHT
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dht_record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dht_record_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedRecord {
    pub key_name: String,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NameRecords {
    pub records: Vec<NamedRecord>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    #[serde(rename = "Path", alias = "Value")]
    path: String,
}

pub struct IpnsOperations {
    pool: Arc<ConnectionPool>,
    keys: Arc<KeyManager>,
    dht: DhtOperations,
    metrics: Arc<PerformanceMetrics>,
    records: Mutex<HashMap<String, IpnsRecord>>,
    default_lifetime: Duration,
    default_ttl: Duration,
}

impl IpnsOperations {
    /// `dht` sets the timeout for the optional signed-record lookup.
    pub fn new(
        pool: Arc<ConnectionPool>,
        keys: Arc<KeyManager>,
        config: &IpnsConfig,
        dht: &DhtConfig,
    ) -> Self {
        Self {
            dht: DhtOperations::new(Arc::clone(&pool), dht.default_timeout),
            pool,
            keys,
            metrics: Arc::new(PerformanceMetrics::new()),
            records: Mutex::new(HashMap::new()),
            default_lifetime: config.default_lifetime,
            default_ttl: config.default_ttl,
        }
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    /// Point the key's name at `cid`. The key must exist.
    pub async fn publish(&self, cid: &str, options: PublishOptions) -> Envelope<IpnsRecord> {
        let started = Instant::now();
        let outcome = self.publish_path(cid, &options).await;
        self.metrics.complete("publish", started, outcome)
    }

    pub async fn resolve(&self, name: &str, options: ResolveOptions) -> Envelope<Resolution> {
        let started = Instant::now();
        let outcome = self.resolve_name(name, &options).await;
        self.metrics.complete("resolve", started, outcome)
    }

    /// Publish the name's current target again, refreshing its lifetime.
    ///
    /// `name` defaults to the key's own id.
    pub async fn republish(&self, name: Option<&str>, key_name: &str) -> Envelope<IpnsRecord> {
        let started = Instant::now();

        let outcome: Result<IpnsRecord, Failure> = async {
            let key = self.keys.find_key(key_name).await?;
            let name = name.map(str::to_string).unwrap_or(key.id);

            let current = self
                .resolve_name(&name, &ResolveOptions::new().nocache(true))
                .await?;
            let cid = current.path.strip_prefix("/ipfs/").ok_or_else(|| {
                Failure::precondition(format!("Cannot republish non-IPFS path: {}", current.path))
            })?;

            let record = self
                .publish_path(cid, &PublishOptions::new().key(key_name))
                .await?;
            info!(name = %record.name, sequence = record.sequence, "IPNS name republished");
            Ok(record)
        }
        .await;
        self.metrics.complete("republish", started, outcome)
    }

    /// Resolve every key's name; names that do not resolve are left out.
    pub async fn get_records(&self) -> Envelope<NameRecords> {
        let started = Instant::now();

        let outcome: Result<NameRecords, Failure> = async {
            let keys = self.keys.all_keys().await?;
            let mut records = Vec::new();
            for key in keys {
                match self.resolve_name(&key.id, &ResolveOptions::new().nocache(true)).await {
                    Ok(resolved) => records.push(NamedRecord {
                        key_name: key.name,
                        name: resolved.name,
                        path: resolved.path,
                    }),
                    Err(failure) => {
                        debug!(key = %key.name, error = %failure, "Name does not resolve");
                    }
                }
            }
            Ok(NameRecords {
                count: records.len(),
                records,
            })
        }
        .await;
        self.metrics.complete("get_records", started, outcome)
    }

    /// Last record published under `name` from this process
    pub fn cached_record(&self, name: &str) -> Option<IpnsRecord> {
        self.lock_records().get(name).cloned()
    }

    async fn publish_path(&self, cid: &str, options: &PublishOptions) -> Result<IpnsRecord, Failure> {
        self.keys.find_key(&options.key_name).await?;

        let path = if cid.starts_with("/ipfs/") || cid.starts_with("/ipns/") {
            cid.to_string()
        } else {
            format!("/ipfs/{cid}")
        };
        let lifetime = options
            .lifetime
            .clone()
            .unwrap_or_else(|| format_duration(self.default_lifetime));
        let ttl = options
            .ttl
            .clone()
            .unwrap_or_else(|| format_duration(self.default_ttl));

        let request = RequestOptions::new()
            .arg(&path)
            .param("key", options.key_name.as_str())
            .param("lifetime", lifetime.as_str())
            .param("ttl", ttl.as_str())
            .flag("resolve", options.resolve);
        let response = self.call("name/publish", request.no_retry(), "IPNS publish").await?;
        let published: PublishResponse = response
            .json()
            .map_err(|_| Failure::invalid_json(response.text()))?;

        let mut records = self.lock_records();
        let sequence = records
            .get(&published.name)
            .map(|previous| previous.sequence + 1)
            .unwrap_or(0);
        let record = IpnsRecord::new(
            published.name,
            published.value,
            options.key_name.as_str(),
            sequence,
            parse_duration(&ttl).unwrap_or(self.default_ttl),
            parse_duration(&lifetime).unwrap_or(self.default_lifetime),
        );
        records.insert(record.name.clone(), record.clone());
        debug!(name = %record.name, value = %record.value, sequence, "IPNS record published");
        Ok(record)
    }

    async fn resolve_name(&self, name: &str, options: &ResolveOptions) -> Result<Resolution, Failure> {
        let request = RequestOptions::new()
            .arg(name)
            .flag("recursive", options.recursive)
            .flag("nocache", options.nocache);
        let response = self.call("name/resolve", request, "IPNS resolve").await?;
        let resolved: ResolveResponse = response
            .json()
            .map_err(|_| Failure::invalid_json(response.text()))?;

        let mut resolution = Resolution {
            name: name.to_string(),
            path: resolved.path,
            dht_record: None,
            dht_record_error: None,
        };
        if options.dht_record {
            let key = if name.starts_with("/ipns/") {
                name.to_string()
            } else {
                format!("/ipns/{name}")
            };
            match self.dht.raw_value(&key).await {
                Ok(raw) => resolution.dht_record = Some(raw),
                Err(failure) => resolution.dht_record_error = Some(failure.to_string()),
            }
        }
        Ok(resolution)
    }

    async fn call(
        &self,
        endpoint: &str,
        options: RequestOptions,
        label: &str,
    ) -> Result<DaemonResponse, Failure> {
        let response = self
            .pool
            .post(endpoint, options)
            .await
            .map_err(Failure::transport)?;
        if !response.is_success() {
            return Err(Failure::status(label, &response));
        }
        Ok(response)
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<String, IpnsRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiration_follows_validity() {
        let record = IpnsRecord::new(
            "k51",
            "/ipfs/bafy",
            "self",
            0,
            Duration::from_secs(3600),
            Duration::from_secs(24 * 3600),
        );
        assert_eq!(record.expiration - record.created, chrono::Duration::hours(24));
        assert!(!record.is_expired());
        assert!(record.is_expired_at(record.created + chrono::Duration::hours(25)));
    }

    #[test]
    fn test_zero_validity_is_expired() {
        let record = IpnsRecord::new("k51", "/ipfs/bafy", "self", 0, Duration::ZERO, Duration::ZERO);
        assert_eq!(record.expiration, record.created);
        assert!(record.is_expired());
    }

    #[test]
    fn test_huge_validity_saturates() {
        let record = IpnsRecord::new("k51", "/ipfs/bafy", "self", 0, Duration::ZERO, Duration::MAX);
        assert_eq!(record.expiration, DateTime::<Utc>::MAX_UTC);
        assert!(!record.is_expired());
    }

    #[test]
    fn test_record_serializes_durations_as_text() {
        let record = IpnsRecord::new(
            "k51",
            "/ipfs/bafy",
            "self",
            3,
            Duration::from_secs(3600),
            Duration::from_secs(5400),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["ttl"], "1h");
        assert_eq!(json["validity"], "1h30m");
        assert!(json.get("signature").is_none());

        let back: IpnsRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_option_defaults() {
        let publish = PublishOptions::default();
        assert_eq!(publish.key_name, "self");
        assert!(publish.resolve);
        assert!(publish.lifetime.is_none());

        let resolve = ResolveOptions::default();
        assert!(resolve.recursive);
        assert!(!resolve.dht_record);
        assert!(!resolve.nocache);
    }
}
