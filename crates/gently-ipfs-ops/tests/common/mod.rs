//! In-memory stand-in for the daemon's HTTP control API
//!
//! Speaks just enough of `/api/v0/*` for the operations layer: DAG nodes,
//! keys, IPNS names and DHT values live in maps, and peers are derived
//! deterministically from whatever id is asked about.

#![allow(dead_code)]

use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use gently_ipfs_ops::{ConnectionConfig, OpsConfig, OpsContext};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

pub const SELF_KEY_ID: &str = "12D3KooWSelfFakePeer";
pub const BOOTSTRAP_PEER: &str = "QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN";

#[derive(Default)]
pub struct DaemonState {
    /// CID -> JSON node
    pub nodes: HashMap<String, Value>,
    /// CID -> raw block
    pub blocks: HashMap<String, Vec<u8>>,
    /// key name -> peer id
    pub keys: BTreeMap<String, String>,
    /// peer id -> path
    pub names: HashMap<String, String>,
    pub dht: HashMap<String, Vec<u8>>,
    pub providers: HashMap<String, Vec<String>>,
    /// Every endpoint hit with its query string, in order
    pub calls: Vec<(String, Params)>,
    /// endpoint -> (status, remaining failures)
    pub failures: HashMap<String, (u16, usize)>,
    generation: u64,
}

pub struct FakeDaemon {
    pub state: Mutex<DaemonState>,
    pub url: String,
}

impl FakeDaemon {
    /// Answer `endpoint` with `status` for the next `times` calls
    pub fn fail(&self, endpoint: &str, status: u16, times: usize) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(endpoint.to_string(), (status, times));
    }

    pub fn requests(&self, endpoint: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(e, _)| e == endpoint)
            .count()
    }

    /// Value of `name` on each call to `endpoint`, in order
    pub fn param_values(&self, endpoint: &str, name: &str) -> Vec<Option<String>> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(e, _)| e == endpoint)
            .map(|(_, params)| param(params, name).map(str::to_string))
            .collect()
    }

    pub fn has_key(&self, name: &str) -> bool {
        self.state.lock().unwrap().keys.contains_key(name)
    }

    pub fn config(&self) -> OpsConfig {
        let mut config = OpsConfig::default();
        config.connection = ConnectionConfig::new(self.url.clone())
            .max_connections(4)
            .retries(2, 0.01)
            .connect_timeout(Duration::from_secs(5));
        config
    }

    pub fn context(&self) -> OpsContext {
        OpsContext::new(self.config()).unwrap()
    }
}

/// Start a fake daemon on an ephemeral port
pub async fn spawn() -> Arc<FakeDaemon> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut state = DaemonState::default();
    state.keys.insert("self".to_string(), SELF_KEY_ID.to_string());
    let daemon = Arc::new(FakeDaemon {
        state: Mutex::new(state),
        url: format!("http://{addr}/api/v0"),
    });

    let router = Router::new()
        .route("/api/v0/*endpoint", post(handle))
        .with_state(Arc::clone(&daemon));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    daemon
}

pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

const FIRST_RING: &str = "12D3KooWPeer1";
const SECOND_RING: &str = "12D3KooWPeer2";

/// Peers each reachable id reports
pub const NEIGHBOURS_PER_PEER: usize = 8;

/// Peers the fake DHT reports as close to `id`
///
/// The fake network is finite: any outside id sees a first ring of peers,
/// each first-ring peer sees its own second ring, and second-ring peers
/// know nobody.
pub fn neighbours(id: &str) -> Vec<String> {
    let ring = if id.starts_with(SECOND_RING) {
        return Vec::new();
    } else if id.starts_with(FIRST_RING) {
        SECOND_RING
    } else {
        FIRST_RING
    };
    (0..NEIGHBOURS_PER_PEER)
        .map(|i| format!("{ring}{}", &sha256_hex(format!("{id}/{i}").as_bytes())[..12]))
        .collect()
}

pub type Params = Vec<(String, String)>;

fn args(params: &Params) -> Vec<&str> {
    params
        .iter()
        .filter(|(k, _)| k == "arg")
        .map(|(_, v)| v.as_str())
        .collect()
}

fn param<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

fn daemon_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"Message": message, "Code": 0, "Type": "error"}).to_string(),
    )
        .into_response()
}

fn ok_json(value: Value) -> Response {
    (StatusCode::OK, value.to_string()).into_response()
}

fn ok_lines(values: Vec<Value>) -> Response {
    let body: String = values.iter().map(|v| format!("{v}\n")).collect();
    (StatusCode::OK, body).into_response()
}

fn event(kind: i64, responses: Value, extra: &str) -> Value {
    json!({"ID": "", "Type": kind, "Responses": responses, "Extra": extra})
}

async fn handle(
    State(daemon): State<Arc<FakeDaemon>>,
    Path(endpoint): Path<String>,
    Query(params): Query<Params>,
    request: Request,
) -> Response {
    let mut files = Vec::new();
    if let Ok(mut multipart) = Multipart::from_request(request, &()).await {
        while let Ok(Some(field)) = multipart.next_field().await {
            if let Ok(bytes) = field.bytes().await {
                files.push(bytes.to_vec());
            }
        }
    }

    let mut state = daemon.state.lock().unwrap();
    state.calls.push((endpoint.clone(), params.clone()));
    if let Some((status, remaining)) = state.failures.get_mut(&endpoint) {
        if *remaining > 0 {
            *remaining -= 1;
            let status = StatusCode::from_u16(*status).unwrap();
            return (status, format!("injected failure for {endpoint}")).into_response();
        }
    }

    route(&mut state, &endpoint, &params, files)
}

fn route(state: &mut DaemonState, endpoint: &str, params: &Params, files: Vec<Vec<u8>>) -> Response {
    let args = args(params);
    let arg = args.first().copied().unwrap_or("");
    let file = files.into_iter().next().unwrap_or_default();

    match endpoint {
        "dag/put" => {
            if param(params, "input-codec") == Some("raw") {
                let cid = format!("bafkr{}", &sha256_hex(&file)[..40]);
                state.blocks.insert(cid.clone(), file);
                return ok_json(json!({"Cid": {"/": cid}}));
            }
            let Ok(node) = serde_json::from_slice::<Value>(&file) else {
                return daemon_error("failed to parse input as dag-json");
            };
            let cid = format!("bafy{}", &sha256_hex(node.to_string().as_bytes())[..40]);
            state.nodes.insert(cid.clone(), node);
            ok_json(json!({"Cid": {"/": cid}}))
        }
        "dag/get" => {
            let (cid, path) = split_path(arg);
            if let Some(block) = state.blocks.get(cid) {
                return (StatusCode::OK, block.clone()).into_response();
            }
            match walk(state, cid, &path) {
                Some(found) if found.unresolved.is_empty() => ok_json(found.value),
                _ => daemon_error("block was not found locally (offline)"),
            }
        }
        "dag/resolve" => {
            let (cid, path) = split_path(arg);
            match walk(state, cid, &path) {
                Some(found) => {
                    let rem: Vec<String> = found.within.into_iter().chain(found.unresolved).collect();
                    ok_json(json!({"Cid": {"/": found.cid}, "RemPath": rem.join("/")}))
                }
                None => daemon_error("block was not found locally (offline)"),
            }
        }
        "dag/stat" => {
            let Some((size, blocks)) = stat(state, arg) else {
                return daemon_error("block was not found locally (offline)");
            };
            ok_lines(vec![
                json!({"Size": 0, "NumBlocks": 0}),
                json!({
                    "UniqueBlocks": blocks,
                    "TotalSize": size,
                    "Ratio": 1.0,
                    "DagStats": [{"Cid": {"/": arg}, "Size": size, "NumBlocks": blocks}]
                }),
            ])
        }
        "dag/import" => {
            let cid = format!("bafycar{}", &sha256_hex(&file)[..40]);
            state.blocks.insert(cid.clone(), file);
            ok_lines(vec![
                json!({"Root": {"Cid": {"/": cid}, "PinErrorMsg": ""}}),
                json!({"Stats": {"BlockCount": 1, "BlockBytesCount": 0}}),
            ])
        }
        "dag/export" => {
            let body = if let Some(block) = state.blocks.get(arg) {
                block.clone()
            } else if let Some(node) = state.nodes.get(arg) {
                node.to_string().into_bytes()
            } else {
                return daemon_error("block was not found locally (offline)");
            };
            let mut car = b"CARv1:".to_vec();
            car.extend_from_slice(&body);
            (StatusCode::OK, car).into_response()
        }

        "dht/put" => {
            state.dht.insert(arg.to_string(), file);
            ok_lines(vec![event(5, Value::Null, "")])
        }
        "dht/get" => match state.dht.get(arg) {
            Some(value) => ok_lines(vec![
                event(0, Value::Null, ""),
                event(5, Value::Null, &STANDARD.encode(value)),
            ]),
            // Lookups that finish without ever seeing a value
            None if arg.starts_with("/quiet/") => ok_lines(vec![event(0, Value::Null, "")]),
            None => daemon_error("routing: not found"),
        },
        "dht/provide" => {
            state
                .providers
                .entry(arg.to_string())
                .or_default()
                .push(SELF_KEY_ID.to_string());
            ok_lines(vec![event(4, json!([{"ID": SELF_KEY_ID, "Addrs": []}]), "")])
        }
        "dht/findprovs" => {
            let mut lines = vec![event(0, Value::Null, "")];
            for provider in state.providers.get(arg).cloned().unwrap_or_default() {
                let response = json!([{"ID": provider, "Addrs": ["/ip4/10.0.0.2/tcp/4001"]}]);
                // Real daemons repeat providers across query paths.
                lines.push(event(4, response.clone(), ""));
                lines.push(event(4, response, ""));
            }
            ok_lines(lines)
        }
        "dht/findpeer" => {
            if arg == "12D3KooWUnknown" {
                return ok_lines(vec![event(0, Value::Null, "")]);
            }
            ok_lines(vec![
                event(0, Value::Null, ""),
                event(2, json!([{"ID": arg, "Addrs": ["/ip4/10.0.0.1/tcp/4001", "/ip6/::1/tcp/4001"]}]), ""),
            ])
        }
        "dht/query" => {
            let peers = neighbours(arg);
            let mut lines: Vec<Value> = peers
                .iter()
                .map(|p| event(1, json!([{"ID": p, "Addrs": []}]), ""))
                .collect();
            if let Some(first) = peers.first() {
                lines.push(event(2, json!([{"ID": first, "Addrs": []}]), ""));
            }
            ok_lines(lines)
        }
        "routing/dht/table" => ok_json(json!({
            "Name": "WAN",
            "Buckets": [
                {"LastRefresh": "", "Peers": ["QmBucketA", {"ID": "QmBucketB", "Connected": true}]},
                {"LastRefresh": "", "Peers": [{"ID": "QmBucketC"}]},
                {"LastRefresh": "", "Peers": null}
            ]
        })),
        "swarm/peers" => ok_json(json!({
            "Peers": [
                {"Addr": "/ip4/10.0.0.1/tcp/4001", "Peer": "QmSwarmA"},
                {"Addr": "/ip4/10.0.0.2/tcp/4001", "Peer": "QmSwarmB"}
            ]
        })),
        "bootstrap/list" => ok_json(json!({
            "Peers": [format!("/dnsaddr/bootstrap.libp2p.io/p2p/{BOOTSTRAP_PEER}")]
        })),

        "key/list" => {
            let keys: Vec<Value> = state
                .keys
                .iter()
                .map(|(name, id)| json!({"Name": name, "Id": id}))
                .collect();
            ok_json(json!({"Keys": keys}))
        }
        "key/gen" | "key/import" => {
            if state.keys.contains_key(arg) {
                return daemon_error("key with name already exists");
            }
            state.generation += 1;
            let seed = format!("{arg}/{}/{}", state.generation, sha256_hex(&file));
            let id = format!("12D3KooW{}", &sha256_hex(seed.as_bytes())[..20]);
            state.keys.insert(arg.to_string(), id.clone());
            ok_json(json!({"Name": arg, "Id": id}))
        }
        "key/export" => match state.keys.get(arg) {
            Some(id) => (StatusCode::OK, format!("PRIVATE-KEY:{arg}:{id}")).into_response(),
            None => daemon_error("key not found"),
        },
        "key/rename" => {
            let (Some(old), Some(new)) = (args.first(), args.get(1)) else {
                return daemon_error("argument \"name\" is required");
            };
            let force = param(params, "force") == Some("true");
            let overwrite = state.keys.contains_key(*new);
            if overwrite && !force {
                return daemon_error("key by that name already exists, refusing to overwrite");
            }
            let Some(id) = state.keys.remove(*old) else {
                return daemon_error("no key named old was found");
            };
            state.keys.insert(new.to_string(), id.clone());
            ok_json(json!({"Was": old, "Now": new, "Id": id, "Overwrite": overwrite}))
        }
        "key/rm" => match state.keys.remove(arg) {
            Some(id) => ok_json(json!({"Keys": [{"Name": arg, "Id": id}]})),
            None => daemon_error("no key named was found"),
        },

        "name/publish" => {
            let key = param(params, "key").unwrap_or("self");
            let Some(id) = state.keys.get(key).cloned() else {
                return daemon_error("no key by the given name was found");
            };
            state.names.insert(id.clone(), arg.to_string());
            state
                .dht
                .insert(format!("/ipns/{id}"), format!("signed-record:{arg}").into_bytes());
            ok_json(json!({"Name": id, "Value": arg}))
        }
        "name/resolve" => {
            let name = arg.trim_start_matches("/ipns/");
            match state.names.get(name) {
                Some(path) => ok_json(json!({"Path": path})),
                None => daemon_error("could not resolve name"),
            }
        }

        other => daemon_error(&format!("unknown command {other:?}")),
    }
}

fn split_path(arg: &str) -> (&str, Vec<String>) {
    let mut parts = arg.trim_start_matches("/ipfs/").split('/');
    let cid = parts.next().unwrap_or("");
    let path = parts.filter(|p| !p.is_empty()).map(str::to_string).collect();
    (cid, path)
}

fn link_target(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get("/").and_then(Value::as_str),
        _ => None,
    }
}

/// Where a path walk from a CID ended up
struct Walk {
    /// Last CID entered, crossing links on the way
    cid: String,
    value: Value,
    /// Segments walked inside `cid`
    within: Vec<String>,
    /// Segments that could not be followed
    unresolved: Vec<String>,
}

fn walk(state: &DaemonState, cid: &str, path: &[String]) -> Option<Walk> {
    let mut current = Walk {
        cid: cid.to_string(),
        value: state.nodes.get(cid)?.clone(),
        within: Vec::new(),
        unresolved: Vec::new(),
    };

    for (i, segment) in path.iter().enumerate() {
        let next = match &current.value {
            Value::Object(map) => map.get(segment).cloned(),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
            _ => None,
        };
        let Some(next) = next else {
            current.unresolved = path[i..].to_vec();
            return Some(current);
        };
        match link_target(&next) {
            Some(target) => {
                current.value = state.nodes.get(target)?.clone();
                current.cid = target.to_string();
                current.within.clear();
            }
            None => {
                current.value = next;
                current.within.push(segment.clone());
            }
        }
    }
    Some(current)
}

fn stat(state: &DaemonState, cid: &str) -> Option<(u64, u64)> {
    let node = state.nodes.get(cid)?;
    let mut size = node.to_string().len() as u64;
    let mut blocks = 1;
    let mut pending: Vec<Value> = vec![node.clone()];
    while let Some(value) = pending.pop() {
        match &value {
            v if link_target(v).is_some() => {
                let target = link_target(v)?;
                let child = state.nodes.get(target)?;
                size += child.to_string().len() as u64;
                blocks += 1;
                pending.push(child.clone());
            }
            Value::Object(map) => pending.extend(map.values().cloned()),
            Value::Array(items) => pending.extend(items.iter().cloned()),
            _ => {}
        }
    }
    Some((size, blocks))
}

/// Node `cid` as the fake daemon stored it
pub fn stored_node(daemon: &FakeDaemon, cid: &str) -> Option<Map<String, Value>> {
    match daemon.state.lock().unwrap().nodes.get(cid) {
        Some(Value::Object(map)) => Some(map.clone()),
        _ => None,
    }
}
