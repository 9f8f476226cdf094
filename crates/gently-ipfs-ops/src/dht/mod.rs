//! DHT Operations
//!
//! Values, provider records, peer lookups and routing-table inspection,
//! all through the daemon's routing API. Peer discovery lives in
//! [`discovery`].

pub mod discovery;
pub mod events;

pub use discovery::{peer_id_from_multiaddr, random_peer_id, DiscoveredPeer, PeerDiscovery};
pub use events::{ConnectedPeer, DhtEvent, PeerInfo};

use crate::duration::format_duration;
use crate::envelope::{base64_bytes, Envelope, Failure};
use crate::metrics::{OperationStats, PerformanceMetrics};
use crate::pool::{ConnectionPool, DaemonResponse, RequestOptions};
use chrono::{DateTime, Utc};
use events::{
    parse_events, BootstrapResponse, RoutingTableResponse, SwarmPeersResponse, EVENT_FINAL_PEER,
    EVENT_PROVIDER, EVENT_VALUE,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Providers requested when the caller does not say
pub const DEFAULT_NUM_PROVIDERS: usize = 20;

/// A value written to the DHT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtRecord {
    pub key: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, with = "base64_bytes::option", skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
}

impl DhtRecord {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp: Utc::now(),
            signature: None,
            publisher: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PutValue {
    pub key: String,
    pub record: DhtRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValueLookup {
    pub key: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Provide {
    pub cid: String,
    pub recursive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Providers {
    pub cid: String,
    pub providers: Vec<PeerInfo>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerLookup {
    pub peer_id: String,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub peer_id: String,
    pub peers: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingBucketSummary {
    pub index: usize,
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingTable {
    pub buckets: Vec<RoutingBucketSummary>,
    pub peer_count: usize,
}

/// Everything we can learn about the node's view of the network.
///
/// A failing sub-call leaves its field empty and fills `<field>_error`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkDiagnostics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_table_peers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_table_peers_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_peers: Option<Vec<ConnectedPeer>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_peer_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_peers_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap_peers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap_peers_error: Option<String>,
    pub metrics: BTreeMap<String, OperationStats>,
}

#[derive(Clone)]
pub struct DhtOperations {
    pool: Arc<ConnectionPool>,
    metrics: Arc<PerformanceMetrics>,
    default_timeout: Duration,
}

impl DhtOperations {
    pub fn new(pool: Arc<ConnectionPool>, default_timeout: Duration) -> Self {
        Self {
            pool,
            metrics: Arc::new(PerformanceMetrics::new()),
            default_timeout,
        }
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    /// Store `value` under `key`
    pub async fn put_value(
        &self,
        key: &str,
        value: &[u8],
        timeout: Option<Duration>,
    ) -> Envelope<PutValue> {
        let started = Instant::now();
        let options = self.options(timeout).arg(key).file("value", value.to_vec());

        let outcome = self.call("dht/put", options, "DHT put").await.map(|_| PutValue {
            key: key.to_string(),
            record: DhtRecord::new(key, value),
        });
        self.metrics.complete("put_value", started, outcome)
    }

    pub async fn get_value(&self, key: &str, timeout: Option<Duration>) -> Envelope<ValueLookup> {
        let started = Instant::now();
        let outcome = self.lookup_value(key, timeout).await;
        self.metrics.complete("get_value", started, outcome)
    }

    /// Announce that this node can serve `cid`
    pub async fn provide(
        &self,
        cid: &str,
        recursive: bool,
        timeout: Option<Duration>,
    ) -> Envelope<Provide> {
        let started = Instant::now();
        let options = self.options(timeout).arg(cid).flag("recursive", recursive);

        let outcome = self.call("dht/provide", options, "DHT provide").await.map(|_| Provide {
            cid: cid.to_string(),
            recursive,
        });
        self.metrics.complete("provide", started, outcome)
    }

    pub async fn find_providers(
        &self,
        cid: &str,
        num_providers: Option<usize>,
        timeout: Option<Duration>,
    ) -> Envelope<Providers> {
        let started = Instant::now();
        let num = num_providers.unwrap_or(DEFAULT_NUM_PROVIDERS);
        let options = self
            .options(timeout)
            .arg(cid)
            .param("num-providers", num.to_string());

        let outcome: Result<Providers, Failure> = async {
            let response = self.call("dht/findprovs", options, "Find providers").await?;
            let mut seen = HashSet::new();
            let providers: Vec<PeerInfo> = parse_events(&response)?
                .iter()
                .filter(|e| e.kind == EVENT_PROVIDER)
                .flat_map(|e| e.responses().iter())
                .filter(|r| !r.id.is_empty() && seen.insert(r.id.clone()))
                .map(PeerInfo::from)
                .collect();
            Ok(Providers {
                cid: cid.to_string(),
                count: providers.len(),
                providers,
            })
        }
        .await;
        self.metrics.complete("find_providers", started, outcome)
    }

    pub async fn find_peer(&self, peer_id: &str, timeout: Option<Duration>) -> Envelope<PeerLookup> {
        let started = Instant::now();
        let options = self.options(timeout).arg(peer_id);

        let outcome: Result<PeerLookup, Failure> = async {
            let response = self.call("dht/findpeer", options, "Find peer").await?;
            let events = parse_events(&response)?;
            let responses: Vec<_> = events
                .iter()
                .filter(|e| e.kind == EVENT_FINAL_PEER)
                .flat_map(|e| e.responses().iter())
                .collect();
            let found = responses
                .iter()
                .find(|r| r.id == peer_id)
                .or_else(|| responses.first())
                .ok_or_else(|| Failure::precondition(format!("Peer not found: {peer_id}")))?;
            Ok(PeerLookup {
                peer_id: peer_id.to_string(),
                addresses: found.addrs().to_vec(),
            })
        }
        .await;
        self.metrics.complete("find_peer", started, outcome)
    }

    /// Ask the DHT for peers close to `peer_id`
    pub async fn query(&self, peer_id: &str, timeout: Option<Duration>) -> Envelope<QueryResult> {
        let started = Instant::now();
        let options = self.options(timeout).arg(peer_id);

        let outcome: Result<QueryResult, Failure> = async {
            let response = self.call("dht/query", options, "DHT query").await?;
            let mut seen = HashSet::new();
            let peers: Vec<String> = parse_events(&response)?
                .iter()
                .flat_map(|e| e.responses().iter())
                .filter(|r| !r.id.is_empty() && seen.insert(r.id.clone()))
                .map(|r| r.id.clone())
                .collect();
            Ok(QueryResult {
                peer_id: peer_id.to_string(),
                count: peers.len(),
                peers,
            })
        }
        .await;
        self.metrics.complete("query", started, outcome)
    }

    pub async fn get_routing_table(&self) -> Envelope<RoutingTable> {
        let started = Instant::now();
        let outcome = self.routing_table().await;
        self.metrics.complete("get_routing_table", started, outcome)
    }

    pub async fn get_network_diagnostics(&self) -> Envelope<NetworkDiagnostics> {
        let started = Instant::now();
        let mut diagnostics = NetworkDiagnostics::default();

        match self.routing_table().await {
            Ok(table) => diagnostics.routing_table_peers = Some(table.peer_count),
            Err(failure) => diagnostics.routing_table_peers_error = Some(failure.to_string()),
        }

        match self.swarm_peers().await {
            Ok(peers) => {
                diagnostics.connected_peer_count = Some(peers.len());
                diagnostics.connected_peers = Some(peers);
            }
            Err(failure) => diagnostics.connected_peers_error = Some(failure.to_string()),
        }

        match self.bootstrap_list().await {
            Ok(peers) => diagnostics.bootstrap_peers = Some(peers),
            Err(failure) => diagnostics.bootstrap_peers_error = Some(failure.to_string()),
        }

        diagnostics.metrics = self.metrics.snapshot();
        self.metrics
            .complete("get_network_diagnostics", started, Ok(diagnostics))
    }

    async fn lookup_value(&self, key: &str, timeout: Option<Duration>) -> Result<ValueLookup, Failure> {
        let response = self
            .call("dht/get", self.options(timeout).arg(key), "DHT get")
            .await?;
        let event = parse_events(&response)?
            .into_iter()
            .find(|e| e.kind == EVENT_VALUE)
            .ok_or_else(|| Failure::precondition(format!("Value not found: {key}")))?;
        Ok(ValueLookup {
            key: key.to_string(),
            value: event.extra_bytes(),
        })
    }

    /// Raw `Extra` of the first value event, without decoding
    pub(crate) async fn raw_value(&self, key: &str) -> Result<String, Failure> {
        let response = self
            .call("dht/get", self.options(None).arg(key), "DHT get")
            .await?;
        parse_events(&response)?
            .into_iter()
            .find(|e| e.kind == EVENT_VALUE)
            .map(|e| e.extra)
            .ok_or_else(|| Failure::precondition(format!("Value not found: {key}")))
    }

    async fn routing_table(&self) -> Result<RoutingTable, Failure> {
        let response = self
            .call("routing/dht/table", RequestOptions::new(), "Routing table")
            .await?;
        let table: RoutingTableResponse = response
            .json()
            .map_err(|_| Failure::invalid_json(response.text()))?;

        let buckets: Vec<RoutingBucketSummary> = table
            .buckets()
            .iter()
            .enumerate()
            .map(|(index, bucket)| RoutingBucketSummary {
                index,
                peers: bucket.peer_ids(),
            })
            .collect();
        Ok(RoutingTable {
            peer_count: buckets.iter().map(|b| b.peers.len()).sum(),
            buckets,
        })
    }

    async fn swarm_peers(&self) -> Result<Vec<ConnectedPeer>, Failure> {
        let response = self
            .call("swarm/peers", RequestOptions::new(), "Swarm peers")
            .await?;
        let peers: SwarmPeersResponse = response
            .json()
            .map_err(|_| Failure::invalid_json(response.text()))?;
        Ok(peers.connected())
    }

    pub(crate) async fn bootstrap_list(&self) -> Result<Vec<String>, Failure> {
        let response = self
            .call("bootstrap/list", RequestOptions::new(), "Bootstrap list")
            .await?;
        let bootstrap: BootstrapResponse = response
            .json()
            .map_err(|_| Failure::invalid_json(response.text()))?;
        Ok(bootstrap.into_peers())
    }

    fn options(&self, timeout: Option<Duration>) -> RequestOptions {
        let timeout = timeout.unwrap_or(self.default_timeout);
        // Leave the daemon room to answer before the HTTP client gives up.
        RequestOptions::new()
            .param("timeout", format_duration(timeout))
            .timeout(timeout + Duration::from_secs(5))
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
}
