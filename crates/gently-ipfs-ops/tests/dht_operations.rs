mod common;

use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn test_put_then_get_value() {
    let daemon = common::spawn().await;
    let ctx = daemon.context();

    let put = ctx.dht.put_value("/gently/k", b"v1", None).await.into_value().unwrap();
    assert_eq!(put.key, "/gently/k");
    assert_eq!(put.record.value, b"v1".to_vec());

    let got = ctx.dht.get_value("/gently/k", None).await.into_value().unwrap();
    assert_eq!(got.value, b"v1".to_vec());

    let doc = ctx.dht.get_value("/gently/k", None).await.to_json();
    assert_eq!(doc["value"], json!("djE="));
}

#[tokio::test]
async fn test_get_value_without_value_event() {
    let daemon = common::spawn().await;
    let ctx = daemon.context();

    let env = ctx.dht.get_value("/quiet/nothing", Some(Duration::from_secs(2))).await;
    assert_eq!(env.error(), Some("Value not found: /quiet/nothing"));

    let env = ctx.dht.get_value("/gently/absent", None).await;
    assert_eq!(env.error(), Some("DHT get failed with status 500"));
}

#[tokio::test]
async fn test_provide_and_find_providers() {
    let daemon = common::spawn().await;
    let ctx = daemon.context();

    let provided = ctx.dht.provide("bafyprovided", true, None).await.into_value().unwrap();
    assert!(provided.recursive);

    let found = ctx
        .dht
        .find_providers("bafyprovided", Some(5), None)
        .await
        .into_value()
        .unwrap();
    assert_eq!(found.count, 1);
    assert_eq!(found.providers[0].id, common::SELF_KEY_ID);
    assert_eq!(found.providers[0].addrs, vec!["/ip4/10.0.0.2/tcp/4001".to_string()]);

    let none = ctx.dht.find_providers("bafynobody", None, None).await.into_value().unwrap();
    assert_eq!(none.count, 0);
}

#[tokio::test]
async fn test_find_peer() {
    let daemon = common::spawn().await;
    let ctx = daemon.context();

    let peer = ctx.dht.find_peer("12D3KooWKnown", None).await.into_value().unwrap();
    assert_eq!(peer.peer_id, "12D3KooWKnown");
    assert_eq!(peer.addresses.len(), 2);

    let env = ctx.dht.find_peer("12D3KooWUnknown", None).await;
    assert_eq!(env.error(), Some("Peer not found: 12D3KooWUnknown"));
}

#[tokio::test]
async fn test_query_dedups_in_order() {
    let daemon = common::spawn().await;
    let ctx = daemon.context();

    let result = ctx.dht.query("12D3KooWSeed", None).await.into_value().unwrap();
    assert_eq!(result.peers, common::neighbours("12D3KooWSeed"));
    assert_eq!(result.count, common::NEIGHBOURS_PER_PEER);

    let leaf = result.peers[0].clone();
    let second = ctx.dht.query(&leaf, None).await.into_value().unwrap();
    assert_eq!(second.peers, common::neighbours(&leaf));
    let edge = ctx.dht.query(&second.peers[0], None).await.into_value().unwrap();
    assert_eq!(edge.count, 0);
}

#[tokio::test]
async fn test_routing_table_and_diagnostics() {
    let daemon = common::spawn().await;
    let ctx = daemon.context();

    let table = ctx.dht.get_routing_table().await.into_value().unwrap();
    assert_eq!(table.buckets.len(), 3);
    assert_eq!(table.peer_count, 3);
    assert_eq!(table.buckets[0].peers, vec!["QmBucketA", "QmBucketB"]);

    let diag = ctx.dht.get_network_diagnostics().await.into_value().unwrap();
    assert_eq!(diag.routing_table_peers, Some(3));
    assert_eq!(diag.connected_peer_count, Some(2));
    assert_eq!(diag.bootstrap_peers.as_ref().map(Vec::len), Some(1));
    assert!(diag.metrics.contains_key("get_routing_table"));

    daemon.fail("swarm/peers", 404, 1);
    let diag = ctx.dht.get_network_diagnostics().await;
    assert!(diag.is_success());
    let diag = diag.into_value().unwrap();
    assert!(diag.connected_peers.is_none());
    assert!(diag.connected_peers_error.unwrap().contains("404"));
    assert_eq!(diag.routing_table_peers, Some(3));
}

#[tokio::test]
async fn test_discover_peers_respects_cap() {
    let daemon = common::spawn().await;
    let ctx = daemon.context();

    let discovery = ctx
        .dht
        .discover_peers(None, Some(10), Some(Duration::from_secs(30)))
        .await
        .into_value()
        .unwrap();
    assert_eq!(discovery.count, 10);
    assert_eq!(discovery.peers.len(), 10);
    assert_eq!(discovery.bootstrap_peers, 1);

    let unique: HashSet<&str> = discovery.peers.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(unique.len(), 10);

    // Enough seeds from the first query, so bootstrap peers are not added.
    let seeds = common::NEIGHBOURS_PER_PEER;
    assert!(discovery.peers[..seeds].iter().all(|p| p.source == "initial_query"));
    assert!(discovery.peers[seeds..].iter().all(|p| p.source.starts_with("from_")));
    assert!(discovery.peers.iter().all(|p| p.id != common::BOOTSTRAP_PEER));
    assert!(!discovery.timed_out);

    assert_eq!(ctx.dht.metrics().get("discover_peers").unwrap().count, 1);
}

#[tokio::test]
async fn test_discover_peers_with_explicit_bootstrap() {
    let daemon = common::spawn().await;
    let ctx = daemon.context();

    // Initial query plus its retries fail, leaving only the given bootstrap.
    daemon.fail("dht/query", 500, 3);
    let bootstrap = vec!["/ip4/1.2.3.4/tcp/4001/p2p/QmExplicit".to_string()];
    let discovery = ctx
        .dht
        .discover_peers(Some(bootstrap), Some(5), None)
        .await
        .into_value()
        .unwrap();
    assert_eq!(discovery.count, 5);
    assert_eq!(discovery.bootstrap_peers, 1);
    assert_eq!(discovery.peers[0].id, "QmExplicit");
    assert_eq!(discovery.peers[0].source, "bootstrap");
    assert!(discovery.peers[1..].iter().all(|p| p.source == "from_QmExplic"));
    assert_eq!(daemon.requests("bootstrap/list"), 0);
}

#[tokio::test]
async fn test_discover_peers_zero_timeout_keeps_seeds() {
    let daemon = common::spawn().await;
    let ctx = daemon.context();

    let env = ctx.dht.discover_peers(None, Some(50), Some(Duration::ZERO)).await;
    let doc = env.to_json();
    assert_eq!(doc["success"], json!(true));
    assert_eq!(doc["count"], json!(common::NEIGHBOURS_PER_PEER));
    assert_eq!(doc["timed_out"], json!(true));
    assert!(doc["elapsed"].is_f64());
    assert_eq!(daemon.requests("dht/query"), 1);
}

#[tokio::test]
async fn test_discover_peers_fan_out_is_bounded() {
    let daemon = common::spawn().await;
    let ctx = daemon.context();

    let discovery = ctx
        .dht
        .discover_peers(None, Some(1000), Some(Duration::from_secs(30)))
        .await
        .into_value()
        .unwrap();
    assert!(!discovery.timed_out);

    // One initial query, five roots, three children under each root.
    assert_eq!(daemon.requests("dht/query"), 1 + 5 + 5 * 3);

    // Seeds plus every root's fresh second ring; children add nothing new.
    let per_peer = common::NEIGHBOURS_PER_PEER;
    assert_eq!(discovery.count, per_peer + 5 * per_peer);
    let unique: HashSet<&str> = discovery.peers.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(unique.len(), discovery.count);
}
