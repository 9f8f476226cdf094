//! Peer Discovery
//!
//! Breadth-limited recursive DHT crawl:
//!
//! 1. Query a random peer id and harvest what comes back.
//! 2. Top up from the bootstrap list when fewer than five seeds turned up.
//! 3. Explore at most five seeds concurrently; each exploration queries its
//!    peer and recurses into at most three newly found peers.
//!
//! `max_peers` and the wall-clock timeout both stop new recursion. Queries
//! already in flight are allowed to finish.

use super::DhtOperations;
use crate::envelope::{Envelope, Failure};
use futures::future::{join_all, BoxFuture, FutureExt};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Below this many seeds the bootstrap peers are added
pub const MIN_SEEDS: usize = 5;
/// Seeds explored concurrently at the top level
pub const MAX_ROOTS: usize = 5;
/// Newly found peers recursed into per exploration
pub const MAX_CHILDREN: usize = 3;
/// Characters of the parent id kept in `from_<prefix>` provenance
pub const SOURCE_PREFIX_LEN: usize = 8;

pub const DEFAULT_MAX_PEERS: usize = 100;
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);

pub const SOURCE_INITIAL_QUERY: &str = "initial_query";
pub const SOURCE_BOOTSTRAP: &str = "bootstrap";

/// A peer and how we first heard of it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredPeer {
    pub id: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerDiscovery {
    pub peers: Vec<DiscoveredPeer>,
    pub count: usize,
    pub bootstrap_peers: usize,
    /// Seconds spent crawling
    pub elapsed: f64,
    pub timed_out: bool,
}

/// Fresh Ed25519-style peer id (`12D3KooW...`) to aim a query at
pub fn random_peer_id() -> String {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);

    // identity multihash (0x00, len 36) over protobuf PublicKey { Type: Ed25519, Data: key }
    let mut bytes = Vec::with_capacity(38);
    bytes.extend_from_slice(&[0x00, 0x24, 0x08, 0x01, 0x12, 0x20]);
    bytes.extend_from_slice(&key);
    bs58::encode(bytes).into_string()
}

/// Peer id from the `/p2p/<id>` (or legacy `/ipfs/<id>`) part of a multiaddr
pub fn peer_id_from_multiaddr(addr: &str) -> Option<String> {
    let parts: Vec<&str> = addr.split('/').collect();
    parts
        .windows(2)
        .filter(|w| w[0] == "p2p" || w[0] == "ipfs")
        .map(|w| w[1])
        .filter(|id| !id.is_empty())
        .last()
        .map(str::to_string)
}

fn source_from(parent: &str) -> String {
    let prefix: String = parent.chars().take(SOURCE_PREFIX_LEN).collect();
    format!("from_{prefix}")
}

#[derive(Default)]
struct Discovered {
    order: Vec<DiscoveredPeer>,
    seen: HashSet<String>,
}

/// Shared by every exploration in one crawl
struct DiscoveryState {
    discovered: Mutex<Discovered>,
    max_peers: usize,
    started: Instant,
    timeout: Duration,
}

impl DiscoveryState {
    fn new(max_peers: usize, timeout: Duration) -> Self {
        Self {
            discovered: Mutex::new(Discovered::default()),
            max_peers,
            started: Instant::now(),
            timeout,
        }
    }

    /// Record a peer once; false if already known or the cap is reached
    fn record(&self, id: &str, source: &str) -> bool {
        if id.is_empty() {
            return false;
        }
        let mut discovered = self.discovered.lock().unwrap_or_else(PoisonError::into_inner);
        if discovered.order.len() >= self.max_peers || discovered.seen.contains(id) {
            return false;
        }
        discovered.seen.insert(id.to_string());
        discovered.order.push(DiscoveredPeer {
            id: id.to_string(),
            source: source.to_string(),
        });
        true
    }

    fn timed_out(&self) -> bool {
        self.started.elapsed() >= self.timeout
    }

    fn full(&self) -> bool {
        let discovered = self.discovered.lock().unwrap_or_else(PoisonError::into_inner);
        discovered.order.len() >= self.max_peers
    }

    fn should_stop(&self) -> bool {
        self.timed_out() || self.full()
    }

    fn finish(&self, bootstrap_peers: usize) -> PeerDiscovery {
        let discovered = self.discovered.lock().unwrap_or_else(PoisonError::into_inner);
        PeerDiscovery {
            peers: discovered.order.clone(),
            count: discovered.order.len(),
            bootstrap_peers,
            elapsed: self.started.elapsed().as_secs_f64(),
            timed_out: self.timed_out(),
        }
    }
}

impl DhtOperations {
    /// Crawl the DHT for peers.
    ///
    /// `bootstrap` defaults to the daemon's bootstrap list. Never returns more
    /// than `max_peers` peers, each at most once.
    pub async fn discover_peers(
        &self,
        bootstrap: Option<Vec<String>>,
        max_peers: Option<usize>,
        timeout: Option<Duration>,
    ) -> Envelope<PeerDiscovery> {
        let started = Instant::now();
        let max_peers = max_peers.unwrap_or(DEFAULT_MAX_PEERS);
        let timeout = timeout.unwrap_or(DEFAULT_DISCOVERY_TIMEOUT);

        let ops = self.clone();
        let crawl =
            tokio::spawn(async move { ops.run_discovery(bootstrap, max_peers, timeout).await });

        let outcome = match crawl.await {
            Ok(discovery) => Ok(discovery),
            Err(e) => Err(Failure::internal(format!("Peer discovery failed: {e}"))),
        };
        self.metrics.complete("discover_peers", started, outcome)
    }

    async fn run_discovery(
        &self,
        bootstrap: Option<Vec<String>>,
        max_peers: usize,
        timeout: Duration,
    ) -> PeerDiscovery {
        let bootstrap = match bootstrap {
            Some(peers) => peers,
            None => self.bootstrap_list().await.unwrap_or_else(|failure| {
                warn!(error = %failure, "Could not read bootstrap list; crawling without it");
                Vec::new()
            }),
        };

        let state = Arc::new(DiscoveryState::new(max_peers, timeout));
        let mut seeds = Vec::new();

        let target = random_peer_id();
        match self.query(&target, None).await.into_result() {
            Ok(result) => {
                for id in &result.peers {
                    if state.record(id, SOURCE_INITIAL_QUERY) {
                        seeds.push(id.clone());
                    }
                }
            }
            Err(failure) => debug!(error = %failure, "Initial discovery query failed"),
        }

        if seeds.len() < MIN_SEEDS {
            for id in bootstrap.iter().filter_map(|addr| peer_id_from_multiaddr(addr)) {
                if state.record(&id, SOURCE_BOOTSTRAP) {
                    seeds.push(id);
                }
            }
        }

        debug!(seeds = seeds.len(), "Starting peer discovery fan-out");
        let roots = seeds
            .into_iter()
            .take(MAX_ROOTS)
            .map(|seed| self.explore(seed, Arc::clone(&state)));
        join_all(roots).await;

        let discovery = state.finish(bootstrap.len());
        info!(
            peers = discovery.count,
            elapsed = discovery.elapsed,
            timed_out = discovery.timed_out,
            "Peer discovery finished"
        );
        discovery
    }

    fn explore(&self, peer_id: String, state: Arc<DiscoveryState>) -> BoxFuture<'_, ()> {
        async move {
            if state.should_stop() {
                return;
            }

            let result = match self.query(&peer_id, None).await.into_result() {
                Ok(result) => result,
                Err(failure) => {
                    debug!(peer = %peer_id, error = %failure, "Discovery query failed");
                    return;
                }
            };

            let source = source_from(&peer_id);
            let fresh: Vec<String> = result
                .peers
                .into_iter()
                .filter(|id| state.record(id, &source))
                .collect();

            if fresh.is_empty() || state.should_stop() {
                return;
            }

            let children = fresh
                .into_iter()
                .take(MAX_CHILDREN)
                .map(|child| self.explore(child, Arc::clone(&state)));
            join_all(children).await;
        }
        .boxed()
    }
}
