//! Daemon response shapes for DHT and swarm endpoints
//!
//! Decoded once here so the operations never poke at raw JSON.

use crate::envelope::Failure;
use crate::pool::DaemonResponse;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Query event discriminants used by the daemon's routing API
pub const EVENT_FINAL_PEER: i64 = 2;
pub const EVENT_PROVIDER: i64 = 4;
pub const EVENT_VALUE: i64 = 5;

/// One line of a DHT NDJSON stream
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DhtEvent {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Type", default)]
    pub kind: i64,
    #[serde(rename = "Responses", default)]
    responses: Option<Vec<PeerResponse>>,
    #[serde(rename = "Extra", default)]
    pub extra: String,
}

impl DhtEvent {
    pub fn responses(&self) -> &[PeerResponse] {
        self.responses.as_deref().unwrap_or(&[])
    }

    /// `Extra` decoded from base64, or the raw bytes if it is not base64
    pub fn extra_bytes(&self) -> Vec<u8> {
        STANDARD
            .decode(self.extra.as_bytes())
            .unwrap_or_else(|_| self.extra.as_bytes().to_vec())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerResponse {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Addrs", default)]
    addrs: Option<Vec<String>>,
}

impl PeerResponse {
    pub fn addrs(&self) -> &[String] {
        self.addrs.as_deref().unwrap_or(&[])
    }
}

/// A peer and the addresses it was reported with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub addrs: Vec<String>,
}

impl From<&PeerResponse> for PeerInfo {
    fn from(response: &PeerResponse) -> Self {
        Self {
            id: response.id.clone(),
            addrs: response.addrs().to_vec(),
        }
    }
}

pub fn parse_events(response: &DaemonResponse) -> Result<Vec<DhtEvent>, Failure> {
    response
        .json_lines()
        .map_err(|_| Failure::invalid_json(response.text()))
}

/// `routing/dht/table`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingTableResponse {
    #[serde(rename = "Buckets", default)]
    buckets: Option<Vec<RoutingBucket>>,
}

impl RoutingTableResponse {
    pub fn buckets(&self) -> &[RoutingBucket] {
        self.buckets.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingBucket {
    #[serde(rename = "Peers", default)]
    peers: Option<Vec<BucketPeer>>,
}

impl RoutingBucket {
    pub fn peer_ids(&self) -> Vec<String> {
        self.peers
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|p| p.id().to_string())
            .collect()
    }
}

/// Bucket entries are bare ids on some daemons, objects on others
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BucketPeer {
    Id(String),
    Entry {
        #[serde(rename = "ID")]
        id: String,
    },
}

impl BucketPeer {
    pub fn id(&self) -> &str {
        match self {
            BucketPeer::Id(id) => id,
            BucketPeer::Entry { id } => id,
        }
    }
}

/// `swarm/peers`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwarmPeersResponse {
    #[serde(rename = "Peers", default)]
    pub peers: Option<SwarmPeers>,
}

/// A list of connections, or a map keyed by peer id
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SwarmPeers {
    List(Vec<SwarmPeer>),
    Map(BTreeMap<String, serde_json::Value>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwarmPeer {
    #[serde(rename = "Peer", default)]
    pub peer: String,
    #[serde(rename = "Addr", default)]
    pub addr: String,
}

/// Flattened connected peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectedPeer {
    pub peer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
}

impl SwarmPeersResponse {
    pub fn connected(&self) -> Vec<ConnectedPeer> {
        match &self.peers {
            None => Vec::new(),
            Some(SwarmPeers::List(list)) => list
                .iter()
                .map(|p| ConnectedPeer {
                    peer: p.peer.clone(),
                    addr: (!p.addr.is_empty()).then(|| p.addr.clone()),
                })
                .collect(),
            Some(SwarmPeers::Map(map)) => map
                .iter()
                .map(|(peer, info)| ConnectedPeer {
                    peer: peer.clone(),
                    addr: info.get("Addr").and_then(|a| a.as_str()).map(str::to_string),
                })
                .collect(),
        }
    }
}

/// `bootstrap/list`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BootstrapResponse {
    #[serde(rename = "Peers", default)]
    peers: Option<Vec<String>>,
}

impl BootstrapResponse {
    pub fn into_peers(self) -> Vec<String> {
        self.peers.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;
    use reqwest::StatusCode;

    fn response(body: &str) -> DaemonResponse {
        DaemonResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_parse_provider_stream() {
        let body = concat!(
            "{\"ID\":\"\",\"Type\":0,\"Responses\":null,\"Extra\":\"\"}\n",
            "{\"ID\":\"\",\"Type\":4,\"Responses\":[{\"ID\":\"QmProv\",\"Addrs\":[\"/ip4/1.2.3.4/tcp/4001\"]}],\"Extra\":\"\"}\n",
        );
        let events = parse_events(&response(body)).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].responses().is_empty());
        assert_eq!(events[1].kind, EVENT_PROVIDER);
        assert_eq!(events[1].responses()[0].id, "QmProv");
        assert_eq!(events[1].responses()[0].addrs().len(), 1);
    }

    #[test]
    fn test_parse_events_rejects_garbage() {
        let failure = parse_events(&response("not json")).unwrap_err();
        assert_eq!(failure.error, "Invalid JSON response");
        assert_eq!(failure.details.as_deref(), Some("not json"));
    }

    #[test]
    fn test_extra_bytes() {
        let event = DhtEvent {
            extra: STANDARD.encode(b"v1"),
            ..Default::default()
        };
        assert_eq!(event.extra_bytes(), b"v1".to_vec());

        let raw = DhtEvent {
            extra: "not*base64".to_string(),
            ..Default::default()
        };
        assert_eq!(raw.extra_bytes(), b"not*base64".to_vec());
    }

    #[test]
    fn test_swarm_peers_both_shapes() {
        let list: SwarmPeersResponse =
            serde_json::from_str(r#"{"Peers":[{"Addr":"/ip4/1.1.1.1/tcp/4001","Peer":"QmA"}]}"#).unwrap();
        assert_eq!(
            list.connected(),
            vec![ConnectedPeer {
                peer: "QmA".into(),
                addr: Some("/ip4/1.1.1.1/tcp/4001".into())
            }]
        );

        let map: SwarmPeersResponse =
            serde_json::from_str(r#"{"Peers":{"QmB":{"Addr":"/ip4/2.2.2.2/tcp/4001"},"QmC":{}}}"#).unwrap();
        let connected = map.connected();
        assert_eq!(connected.len(), 2);
        assert_eq!(connected[0].peer, "QmB");
        assert_eq!(connected[1].addr, None);

        let empty: SwarmPeersResponse = serde_json::from_str(r#"{"Peers":null}"#).unwrap();
        assert!(empty.connected().is_empty());
    }

    #[test]
    fn test_routing_table_peer_shapes() {
        let table: RoutingTableResponse = serde_json::from_str(
            r#"{"Buckets":[{"Peers":["QmA",{"ID":"QmB","Connected":true}]},{"Peers":null}]}"#,
        )
        .unwrap();
        assert_eq!(table.buckets().len(), 2);
        assert_eq!(table.buckets()[0].peer_ids(), vec!["QmA", "QmB"]);
        assert!(table.buckets()[1].peer_ids().is_empty());
    }
}
