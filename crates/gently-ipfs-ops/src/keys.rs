//! Key Manager
//!
//! The daemon's keystore, fronted by a short-lived metadata cache.
//!
//! The cache is a convenience, not a source of truth: it is rebuilt from
//! `key/list` once older than `cache_ttl`, patched in place by operations
//! whose effect is known, and dropped wholesale when it is not (imports,
//! renames of keys we never saw).

use crate::envelope::{base64_bytes, Envelope, Failure};
use crate::metrics::PerformanceMetrics;
use crate::pool::{ConnectionPool, DaemonResponse, RequestOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_RSA_BITS: u32 = 2048;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    Ed25519,
    Secp256k1,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Rsa => "rsa",
            KeyType::Ed25519 => "ed25519",
            KeyType::Secp256k1 => "secp256k1",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(KeyType::Rsa),
            "ed25519" => Ok(KeyType::Ed25519),
            "secp256k1" => Ok(KeyType::Secp256k1),
            other => Err(format!("unknown key type: {other}")),
        }
    }
}

/// How a key is meant to be guarded. Only `Standard` changes nothing on the
/// daemon; the others are recorded for callers to act on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionLevel {
    #[default]
    Standard,
    Protected,
    Hardware,
}

impl fmt::Display for ProtectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtectionLevel::Standard => "standard",
            ProtectionLevel::Protected => "protected",
            ProtectionLevel::Hardware => "hardware",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub name: String,
    /// Peer id the key publishes under
    pub id: String,
    /// Unknown for keys only ever seen in a listing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_type: Option<KeyType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub protection: ProtectionLevel,
}

impl KeyInfo {
    fn listed(name: String, id: String) -> Self {
        Self {
            name,
            id,
            key_type: None,
            size: None,
            created: Utc::now(),
            protection: ProtectionLevel::Standard,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyList {
    pub keys: Vec<KeyInfo>,
    pub count: usize,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyExport {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyRename {
    pub old_name: String,
    pub new_name: String,
    pub id: String,
    pub overwritten: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyRemoval {
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyRotation {
    pub name: String,
    pub old_id: String,
    pub new_id: String,
    /// Name the previous key lives on under, when it was kept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_as: Option<String>,
    pub old_key_removed: bool,
}

#[derive(Debug, Deserialize)]
struct KeyEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct KeyListResponse {
    #[serde(rename = "Keys", default)]
    keys: Option<Vec<KeyEntry>>,
}

#[derive(Debug, Deserialize)]
struct RenameResponse {
    #[serde(rename = "Was")]
    was: String,
    #[serde(rename = "Now")]
    now: String,
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Overwrite", default)]
    overwrite: bool,
}

#[derive(Default)]
struct KeyCache {
    keys: BTreeMap<String, KeyInfo>,
    refreshed_at: Option<Instant>,
}

impl KeyCache {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.refreshed_at.is_some_and(|at| at.elapsed() < ttl)
    }
}

pub struct KeyManager {
    pool: Arc<ConnectionPool>,
    metrics: Arc<PerformanceMetrics>,
    cache_ttl: Duration,
    cache: Mutex<KeyCache>,
}

impl KeyManager {
    pub fn new(pool: Arc<ConnectionPool>, cache_ttl: Duration) -> Self {
        Self {
            pool,
            metrics: Arc::new(PerformanceMetrics::new()),
            cache_ttl,
            cache: Mutex::new(KeyCache::default()),
        }
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    /// Forget everything; the next lookup lists again.
    pub fn invalidate(&self) {
        let mut cache = self.lock_cache();
        cache.keys.clear();
        cache.refreshed_at = None;
    }

    pub async fn list_keys(&self, force_refresh: bool) -> Envelope<KeyList> {
        let started = Instant::now();

        let cached = if force_refresh { None } else { self.cached_keys() };
        let outcome = match cached {
            Some(keys) => Ok(KeyList {
                count: keys.len(),
                keys,
                cached: true,
            }),
            None => self.refresh().await.map(|keys| KeyList {
                count: keys.len(),
                keys,
                cached: false,
            }),
        };
        self.metrics.complete("list_keys", started, outcome)
    }

    pub async fn get_key(&self, name: &str) -> Envelope<KeyInfo> {
        let started = Instant::now();
        let outcome = self.find_key(name).await;
        self.metrics.complete("get_key", started, outcome)
    }

    /// Generate a key in the daemon keystore.
    ///
    /// `size` applies to RSA only and defaults to 2048 bits.
    pub async fn create_key(
        &self,
        name: &str,
        key_type: KeyType,
        size: Option<u32>,
        protection: ProtectionLevel,
    ) -> Envelope<KeyInfo> {
        let started = Instant::now();
        let outcome = self.generate(name, key_type, size, protection).await;
        self.metrics.complete("create_key", started, outcome)
    }

    /// Import key material. `format` is passed through to the daemon.
    pub async fn import_key(
        &self,
        name: &str,
        key_data: Vec<u8>,
        format: Option<&str>,
        password: Option<&str>,
    ) -> Envelope<KeyInfo> {
        let started = Instant::now();

        let outcome: Result<KeyInfo, Failure> = async {
            require_name(name)?;
            let mut options = RequestOptions::new().arg(name).file("key", key_data);
            if let Some(format) = format {
                options = options.param("format", format);
            }
            if let Some(password) = password {
                options = options.param("password", password);
            }

            let response = self.call("key/import", options.no_retry(), "Key import").await?;
            let entry: KeyEntry = response
                .json()
                .map_err(|_| Failure::invalid_json(response.text()))?;
            self.invalidate();
            info!(key = %entry.name, "Key imported");
            Ok(KeyInfo::listed(entry.name, entry.id))
        }
        .await;
        self.metrics.complete("import_key", started, outcome)
    }

    /// Export key material, optionally also writing it to `output_path`
    pub async fn export_key(
        &self,
        name: &str,
        format: Option<&str>,
        output_path: Option<&Path>,
    ) -> Envelope<KeyExport> {
        let started = Instant::now();

        let outcome: Result<KeyExport, Failure> = async {
            require_name(name)?;
            let mut options = RequestOptions::new().arg(name);
            if let Some(format) = format {
                options = options.param("format", format);
            }

            let response = self.call("key/export", options, "Key export").await?;
            if let Some(path) = output_path {
                tokio::fs::write(path, &response.body).await.map_err(|e| {
                    Failure::internal(format!("Cannot write {}: {e}", path.display()))
                })?;
            }
            Ok(KeyExport {
                name: name.to_string(),
                data: response.body,
                path: output_path.map(Path::to_path_buf),
            })
        }
        .await;
        self.metrics.complete("export_key", started, outcome)
    }

    pub async fn rename_key(&self, old_name: &str, new_name: &str, force: bool) -> Envelope<KeyRename> {
        let started = Instant::now();
        let outcome = self.rename(old_name, new_name, force).await;
        self.metrics.complete("rename_key", started, outcome)
    }

    pub async fn remove_key(&self, name: &str) -> Envelope<KeyRemoval> {
        let started = Instant::now();
        let outcome = self.remove(name).await;
        self.metrics.complete("remove_key", started, outcome)
    }

    /// Replace `name` with a fresh key.
    ///
    /// With `preserve_old` the previous key is renamed to `<name>-<unix ts>`
    /// first. Otherwise it is removed; a failed removal is logged and the
    /// rotation carries on.
    pub async fn rotate_key(
        &self,
        name: &str,
        key_type: KeyType,
        size: Option<u32>,
        preserve_old: bool,
    ) -> Envelope<KeyRotation> {
        let started = Instant::now();

        let outcome: Result<KeyRotation, Failure> = async {
            let old = self.find_key(name).await?;
            let mut archived_as = None;
            let mut old_key_removed = false;

            if preserve_old {
                let archive = format!("{}-{}", name, Utc::now().timestamp());
                self.rename(name, &archive, true).await?;
                archived_as = Some(archive);
            } else {
                match self.remove(name).await {
                    Ok(_) => old_key_removed = true,
                    Err(failure) => {
                        warn!(key = %name, error = %failure, "Failed to remove old key during rotation");
                    }
                }
            }

            let new = self.generate(name, key_type, size, old.protection).await?;
            info!(
                key = %name,
                old_id = %old.id,
                new_id = %new.id,
                archived = archived_as.as_deref().unwrap_or(""),
                "Key rotated"
            );
            Ok(KeyRotation {
                name: name.to_string(),
                old_id: old.id,
                new_id: new.id,
                archived_as,
                old_key_removed,
            })
        }
        .await;
        self.metrics.complete("rotate_key", started, outcome)
    }

    /// Cache hit, else one refresh and a second look
    pub(crate) async fn find_key(&self, name: &str) -> Result<KeyInfo, Failure> {
        require_name(name)?;
        let cached = self.lock_cache().keys.get(name).cloned();
        if let Some(key) = cached {
            return Ok(key);
        }
        self.refresh()
            .await?
            .into_iter()
            .find(|k| k.name == name)
            .ok_or_else(|| Failure::precondition(format!("Key not found: {name}")))
    }

    /// Every known key, from cache when fresh
    pub(crate) async fn all_keys(&self) -> Result<Vec<KeyInfo>, Failure> {
        match self.cached_keys() {
            Some(keys) => Ok(keys),
            None => self.refresh().await,
        }
    }

    fn cached_keys(&self) -> Option<Vec<KeyInfo>> {
        let cache = self.lock_cache();
        cache
            .is_fresh(self.cache_ttl)
            .then(|| cache.keys.values().cloned().collect())
    }

    /// Rebuild the cache from `key/list`, keeping what we knew about keys
    /// that are still there under the same id.
    async fn refresh(&self) -> Result<Vec<KeyInfo>, Failure> {
        let response = self
            .call("key/list", RequestOptions::new().flag("l", true), "Key list")
            .await?;
        let listing: KeyListResponse = response
            .json()
            .map_err(|_| Failure::invalid_json(response.text()))?;

        let mut cache = self.lock_cache();
        let mut keys = BTreeMap::new();
        for entry in listing.keys.unwrap_or_default() {
            let info = match cache.keys.remove(&entry.name) {
                Some(known) if known.id == entry.id => known,
                _ => KeyInfo::listed(entry.name, entry.id),
            };
            keys.insert(info.name.clone(), info);
        }
        cache.keys = keys;
        cache.refreshed_at = Some(Instant::now());
        debug!(keys = cache.keys.len(), "Key cache refreshed");
        Ok(cache.keys.values().cloned().collect())
    }

    async fn generate(
        &self,
        name: &str,
        key_type: KeyType,
        size: Option<u32>,
        protection: ProtectionLevel,
    ) -> Result<KeyInfo, Failure> {
        require_name(name)?;
        let size = match key_type {
            KeyType::Rsa => Some(size.unwrap_or(DEFAULT_RSA_BITS)),
            _ => None,
        };
        if protection != ProtectionLevel::Standard {
            warn!(key = %name, %protection, "Protection level is recorded but not enforced by the daemon");
        }

        let mut options = RequestOptions::new().arg(name).param("type", key_type.as_str());
        if let Some(bits) = size {
            options = options.param("size", bits.to_string());
        }
        let response = self.call("key/gen", options.no_retry(), "Key generation").await?;
        let entry: KeyEntry = response
            .json()
            .map_err(|_| Failure::invalid_json(response.text()))?;

        let info = KeyInfo {
            name: entry.name,
            id: entry.id,
            key_type: Some(key_type),
            size,
            created: Utc::now(),
            protection,
        };
        self.lock_cache().keys.insert(info.name.clone(), info.clone());
        info!(key = %info.name, key_type = %key_type, "Key created");
        Ok(info)
    }

    async fn rename(&self, old_name: &str, new_name: &str, force: bool) -> Result<KeyRename, Failure> {
        require_name(old_name)?;
        require_name(new_name)?;
        let options = RequestOptions::new()
            .arg(old_name)
            .arg(new_name)
            .flag("force", force);
        let response = self.call("key/rename", options.no_retry(), "Key rename").await?;
        let renamed: RenameResponse = response
            .json()
            .map_err(|_| Failure::invalid_json(response.text()))?;

        let tracked = {
            let mut cache = self.lock_cache();
            let overwritten = cache.keys.remove(&renamed.now);
            match cache.keys.remove(&renamed.was) {
                Some(mut info) => {
                    info.name = renamed.now.clone();
                    info.id = renamed.id.clone();
                    cache.keys.insert(info.name.clone(), info);
                    true
                }
                None => overwritten.is_some(),
            }
        };
        if !tracked {
            // Neither name was known here, so the listing is stale.
            if let Err(failure) = self.refresh().await {
                warn!(was = %renamed.was, now = %renamed.now, error = %failure, "Key cache refresh after rename failed");
                self.invalidate();
            }
        }

        debug!(was = %renamed.was, now = %renamed.now, "Key renamed");
        Ok(KeyRename {
            old_name: renamed.was,
            new_name: renamed.now,
            id: renamed.id,
            overwritten: renamed.overwrite,
        })
    }

    async fn remove(&self, name: &str) -> Result<KeyRemoval, Failure> {
        require_name(name)?;
        let response = self
            .call("key/rm", RequestOptions::new().arg(name).no_retry(), "Key removal")
            .await?;
        let removed: KeyListResponse = response
            .json()
            .map_err(|_| Failure::invalid_json(response.text()))?;
        let removed: Vec<String> = removed
            .keys
            .unwrap_or_default()
            .into_iter()
            .map(|k| k.name)
            .collect();

        let mut cache = self.lock_cache();
        cache.keys.remove(name);
        for gone in &removed {
            cache.keys.remove(gone);
        }
        Ok(KeyRemoval { removed })
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

    fn lock_cache(&self) -> MutexGuard<'_, KeyCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn require_name(name: &str) -> Result<(), Failure> {
    if name.trim().is_empty() {
        return Err(Failure::precondition("Key name is required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_type_parse() {
        assert_eq!("RSA".parse::<KeyType>().unwrap(), KeyType::Rsa);
        assert_eq!("ed25519".parse::<KeyType>().unwrap(), KeyType::Ed25519);
        assert!("dsa".parse::<KeyType>().is_err());
        assert_eq!(serde_json::to_string(&KeyType::Secp256k1).unwrap(), "\"secp256k1\"");
    }

    #[test]
    fn test_protection_default() {
        assert_eq!(ProtectionLevel::default(), ProtectionLevel::Standard);
        assert_eq!(ProtectionLevel::Hardware.to_string(), "hardware");
    }

    #[test]
    fn test_cache_freshness() {
        let mut cache = KeyCache::default();
        assert!(!cache.is_fresh(DEFAULT_CACHE_TTL));
        cache.refreshed_at = Some(Instant::now());
        assert!(cache.is_fresh(DEFAULT_CACHE_TTL));
        assert!(!cache.is_fresh(Duration::ZERO));
    }

    #[test]
    fn test_listed_key_has_unknown_type() {
        let info = KeyInfo::listed("self".into(), "12D3KooWSelf".into());
        assert_eq!(info.key_type, None);
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("key_type").is_none());
        assert_eq!(json["protection"], "standard");
    }

    #[test]
    fn test_blank_names_rejected() {
        assert!(require_name("").is_err());
        assert!(require_name("  ").is_err());
        assert!(require_name("publisher").is_ok());
    }
}
