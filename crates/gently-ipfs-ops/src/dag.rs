//! DAG Operations
//!
//! IPLD node CRUD, path resolution, CAR import/export and copy-on-write
//! tree helpers.
//!
//! ```text
//!   update_node / add_link / remove_link
//!
//!   old CID ──get──► node ──copy + mutate──► node' ──put──► new CID
//!      │                                                       │
//!      └──────────── both returned, old node untouched ────────┘
//! ```

use crate::envelope::{base64_bytes, Envelope, Failure};
use crate::metrics::PerformanceMetrics;
use crate::pool::{ConnectionPool, DaemonResponse, RequestOptions};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, warn};

pub const DEFAULT_STORE_CODEC: &str = "dag-cbor";
pub const DEFAULT_INPUT_CODEC: &str = "dag-json";
pub const DEFAULT_HASH: &str = "sha2-256";

/// Payload for `dag/put`
#[derive(Debug, Clone, PartialEq)]
pub enum DagInput {
    /// Serialized as JSON text
    Json(Value),
    /// Sent as is
    Text(String),
    /// Sent as is when it is JSON, otherwise base64 with the `raw` codec
    Bytes(Vec<u8>),
}

impl From<Value> for DagInput {
    fn from(value: Value) -> Self {
        DagInput::Json(value)
    }
}

impl From<String> for DagInput {
    fn from(text: String) -> Self {
        DagInput::Text(text)
    }
}

impl From<&str> for DagInput {
    fn from(text: &str) -> Self {
        DagInput::Text(text.to_string())
    }
}

impl From<Vec<u8>> for DagInput {
    fn from(bytes: Vec<u8>) -> Self {
        DagInput::Bytes(bytes)
    }
}

impl From<&[u8]> for DagInput {
    fn from(bytes: &[u8]) -> Self {
        DagInput::Bytes(bytes.to_vec())
    }
}

impl DagInput {
    /// Body text and the input codec it must be sent with
    fn encode(self, input_codec: &str) -> (String, String) {
        match self {
            DagInput::Json(value) => (value.to_string(), input_codec.to_string()),
            DagInput::Text(text) => (text, input_codec.to_string()),
            DagInput::Bytes(bytes) => match String::from_utf8(bytes) {
                Ok(text) if serde_json::from_str::<Value>(&text).is_ok() => {
                    (text, input_codec.to_string())
                }
                Ok(text) => (STANDARD.encode(text.as_bytes()), "raw".to_string()),
                Err(e) => (STANDARD.encode(e.as_bytes()), "raw".to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Json,
    Raw,
}

/// Codec and pinning choices for `dag/put`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOptions {
    /// Codec the node is stored with
    pub format: String,
    /// Codec the payload is written in
    pub input_encoding: String,
    pub pin: bool,
    pub hash: String,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            format: DEFAULT_STORE_CODEC.to_string(),
            input_encoding: DEFAULT_INPUT_CODEC.to_string(),
            pin: true,
            hash: DEFAULT_HASH.to_string(),
        }
    }
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn format(mut self, codec: impl Into<String>) -> Self {
        self.format = codec.into();
        self
    }

    pub fn input_encoding(mut self, codec: impl Into<String>) -> Self {
        self.input_encoding = codec.into();
        self
    }

    pub fn pin(mut self, pin: bool) -> Self {
        self.pin = pin;
        self
    }

    pub fn hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }
}

/// A fetched node: decoded JSON or the raw body
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DagValue {
    Json(Value),
    Raw(#[serde(serialize_with = "base64_bytes::serialize")] Vec<u8>),
}

impl DagValue {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            DagValue::Json(value) => Some(value),
            DagValue::Raw(_) => None,
        }
    }
}

/// What to import: a value to `put`, or a CAR stream
pub enum ImportSource {
    Data(DagInput),
    Car(Box<dyn AsyncRead + Send + Unpin>),
}

impl ImportSource {
    pub fn car(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        ImportSource::Car(Box::new(reader))
    }
}

impl From<DagInput> for ImportSource {
    fn from(data: DagInput) -> Self {
        ImportSource::Data(data)
    }
}

impl From<Value> for ImportSource {
    fn from(value: Value) -> Self {
        ImportSource::Data(value.into())
    }
}

impl From<String> for ImportSource {
    fn from(text: String) -> Self {
        ImportSource::Data(text.into())
    }
}

impl From<&str> for ImportSource {
    fn from(text: &str) -> Self {
        ImportSource::Data(text.into())
    }
}

impl From<Vec<u8>> for ImportSource {
    fn from(bytes: Vec<u8>) -> Self {
        ImportSource::Data(bytes.into())
    }
}

impl From<tokio::fs::File> for ImportSource {
    fn from(file: tokio::fs::File) -> Self {
        ImportSource::car(file)
    }
}

/// Where `export_data` sends the CAR stream
pub enum ExportTarget<'a> {
    /// Collect and return the bytes
    Memory,
    /// Create (or truncate) a file
    Path(PathBuf),
    Writer(&'a mut (dyn AsyncWrite + Send + Unpin)),
}

#[derive(Debug, Clone, Serialize)]
pub struct DagPut {
    pub cid: String,
    pub format: String,
    pub input_encoding: String,
    pub pinned: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DagGet {
    pub cid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub data: DagValue,
}

#[derive(Debug, Clone, Serialize)]
pub struct DagResolve {
    pub cid: String,
    pub remainder_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DagStat {
    pub cid: String,
    pub size: u64,
    pub num_blocks: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DagImport {
    pub roots: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DagExport {
    pub cid: String,
    pub bytes_written: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "base64_bytes::option::serialize"
    )]
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeCreate {
    pub cid: String,
    pub nodes_created: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeView {
    pub cid: String,
    pub tree: Value,
}

/// Result of a copy-on-write mutation
#[derive(Debug, Clone, Serialize)]
pub struct NodeUpdate {
    pub old_cid: String,
    pub new_cid: String,
}

#[derive(Debug, Deserialize)]
struct CidRef {
    #[serde(rename = "/")]
    cid: String,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    #[serde(rename = "Cid")]
    cid: CidRef,
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    #[serde(rename = "Cid")]
    cid: CidRef,
    #[serde(rename = "RemPath", default)]
    rem_path: String,
}

/// `dag/stat` as answered by older and newer daemons
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatResponse {
    Summary {
        #[serde(rename = "TotalSize")]
        total_size: u64,
        #[serde(rename = "DagStats", default)]
        dag_stats: Vec<StatEntry>,
    },
    Legacy {
        #[serde(rename = "Size")]
        size: u64,
        #[serde(rename = "NumBlocks")]
        num_blocks: u64,
    },
}

#[derive(Debug, Deserialize)]
struct StatEntry {
    #[serde(rename = "NumBlocks", default)]
    num_blocks: u64,
}

impl StatResponse {
    fn totals(&self) -> (u64, u64) {
        match self {
            StatResponse::Summary {
                total_size,
                dag_stats,
            } => (*total_size, dag_stats.iter().map(|s| s.num_blocks).sum()),
            StatResponse::Legacy { size, num_blocks } => (*size, *num_blocks),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImportLine {
    #[serde(rename = "Root", default)]
    root: Option<ImportRoot>,
}

#[derive(Debug, Deserialize)]
struct ImportRoot {
    #[serde(rename = "Cid")]
    cid: CidRef,
}

/// `{"/": "<cid>"}`
pub fn link(cid: &str) -> Value {
    let mut map = Map::new();
    map.insert("/".to_string(), Value::String(cid.to_string()));
    Value::Object(map)
}

/// CID of a link-shaped value
pub fn link_target(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get("/").and_then(Value::as_str),
        _ => None,
    }
}

pub fn is_link(value: &Value) -> bool {
    link_target(value).is_some()
}

#[derive(Clone)]
pub struct DagOperations {
    pool: Arc<ConnectionPool>,
    metrics: Arc<PerformanceMetrics>,
}

impl DagOperations {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            metrics: Arc::new(PerformanceMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    /// Store one node
    pub async fn put(&self, data: impl Into<DagInput>, options: PutOptions) -> Envelope<DagPut> {
        let started = Instant::now();
        let outcome = self.put_node(data.into(), &options).await;
        self.metrics.complete("put", started, outcome)
    }

    /// Fetch a node, or the value at `path` inside it
    pub async fn get(&self, cid: &str, path: Option<&str>, format: OutputFormat) -> Envelope<DagGet> {
        let started = Instant::now();
        let target = join_path(cid, path);

        let outcome: Result<DagGet, Failure> = async {
            let response = self
                .call("dag/get", RequestOptions::new().arg(&target), "DAG get")
                .await?;
            let data = match format {
                OutputFormat::Json => DagValue::Json(
                    response
                        .json()
                        .map_err(|_| Failure::invalid_json(response.text()))?,
                ),
                OutputFormat::Raw => DagValue::Raw(response.body),
            };
            Ok(DagGet {
                cid: cid.to_string(),
                path: path.filter(|p| !p.is_empty()).map(str::to_string),
                data,
            })
        }
        .await;
        self.metrics.complete("get", started, outcome)
    }

    /// Walk `cid_path` to the CID holding its last hop
    pub async fn resolve(&self, cid_path: &str) -> Envelope<DagResolve> {
        let started = Instant::now();

        let outcome: Result<DagResolve, Failure> = async {
            let response = self
                .call("dag/resolve", RequestOptions::new().arg(cid_path), "DAG resolve")
                .await?;
            let resolved: ResolveResponse = response
                .json()
                .map_err(|_| Failure::invalid_json(response.text()))?;
            Ok(DagResolve {
                cid: resolved.cid.cid,
                remainder_path: resolved.rem_path,
            })
        }
        .await;
        self.metrics.complete("resolve", started, outcome)
    }

    pub async fn stat(&self, cid: &str) -> Envelope<DagStat> {
        let started = Instant::now();

        let outcome: Result<DagStat, Failure> = async {
            let response = self
                .call("dag/stat", RequestOptions::new().arg(cid), "DAG stat")
                .await?;
            // Newer daemons stream progress lines; the last one is the total.
            let lines: Vec<StatResponse> = response
                .json_lines()
                .map_err(|_| Failure::invalid_json(response.text()))?;
            let (size, num_blocks) = lines
                .last()
                .map(StatResponse::totals)
                .ok_or_else(|| Failure::invalid_json(response.text()))?;
            Ok(DagStat {
                cid: cid.to_string(),
                size,
                num_blocks,
            })
        }
        .await;
        self.metrics.complete("stat", started, outcome)
    }

    /// Import a value (via `put`) or a CAR stream (via `dag/import`)
    pub async fn import_data(
        &self,
        source: impl Into<ImportSource>,
        pin_roots: bool,
    ) -> Envelope<DagImport> {
        let started = Instant::now();

        let outcome: Result<DagImport, Failure> = match source.into() {
            ImportSource::Data(data) => self
                .put_node(data, &PutOptions::default().pin(pin_roots))
                .await
                .map(|put| DagImport {
                    roots: vec![put.cid],
                    count: 1,
                }),
            ImportSource::Car(reader) => self.import_car(reader, pin_roots).await,
        };
        self.metrics.complete("import_data", started, outcome)
    }

    /// Stream `cid` out as a CAR archive
    pub async fn export_data(&self, cid: &str, target: ExportTarget<'_>) -> Envelope<DagExport> {
        let started = Instant::now();
        let options = RequestOptions::new().arg(cid);

        let outcome: Result<DagExport, Failure> = match target {
            ExportTarget::Memory => {
                let mut buffer = Vec::new();
                let written = self.export_into(options, &mut buffer).await;
                written.map(|bytes_written| DagExport {
                    cid: cid.to_string(),
                    bytes_written,
                    path: None,
                    data: Some(buffer),
                })
            }
            ExportTarget::Writer(writer) => {
                let written = self.export_into(options, writer).await;
                written.map(|bytes_written| DagExport {
                    cid: cid.to_string(),
                    bytes_written,
                    path: None,
                    data: None,
                })
            }
            ExportTarget::Path(path) => self.export_to_path(cid, options, path).await,
        };
        self.metrics.complete("export_data", started, outcome)
    }

    /// Store nested objects bottom-up, replacing each with a link
    pub async fn create_tree(&self, structure: Value) -> Envelope<TreeCreate> {
        let started = Instant::now();

        let outcome: Result<TreeCreate, Failure> = async {
            let mut nodes_created = 0;
            let root = self.store_subtrees(structure, &mut nodes_created).await?;
            let cid = self.store_node(root).await?;
            nodes_created += 1;
            debug!(cid = %cid, nodes = nodes_created, "DAG tree created");
            Ok(TreeCreate { cid, nodes_created })
        }
        .await;
        self.metrics.complete("create_tree", started, outcome)
    }

    /// Fetch `cid` and follow links depth-first.
    ///
    /// `max_depth` counts followed links; negative means unbounded. Links past
    /// the limit are left as `{"/": cid}`.
    pub async fn get_tree(&self, cid: &str, max_depth: i64) -> Envelope<TreeView> {
        let started = Instant::now();

        let outcome: Result<TreeView, Failure> = async {
            let root = self.fetch_node(cid).await?;
            let tree = self.expand(root, 0, max_depth).await?;
            Ok(TreeView {
                cid: cid.to_string(),
                tree,
            })
        }
        .await;
        self.metrics.complete("get_tree", started, outcome)
    }

    /// Merge `updates` into a copy of the node
    pub async fn update_node(&self, cid: &str, updates: Map<String, Value>) -> Envelope<NodeUpdate> {
        let started = Instant::now();

        let outcome: Result<NodeUpdate, Failure> = async {
            let mut node = self.fetch_object(cid).await?;
            for (key, value) in updates {
                node.insert(key, value);
            }
            self.replace(cid, node).await
        }
        .await;
        self.metrics.complete("update_node", started, outcome)
    }

    /// Point `name` on a copy of `parent` at `child`
    pub async fn add_link(&self, parent: &str, name: &str, child: &str) -> Envelope<NodeUpdate> {
        let started = Instant::now();

        let outcome: Result<NodeUpdate, Failure> = async {
            require_link_name(name)?;
            let mut node = self.fetch_object(parent).await?;
            node.insert(name.to_string(), link(child));
            self.replace(parent, node).await
        }
        .await;
        self.metrics.complete("add_link", started, outcome)
    }

    /// Drop `name` from a copy of `parent`; other keys keep their order
    pub async fn remove_link(&self, parent: &str, name: &str) -> Envelope<NodeUpdate> {
        let started = Instant::now();

        let outcome: Result<NodeUpdate, Failure> = async {
            require_link_name(name)?;
            let node = self.fetch_object(parent).await?;
            if !node.contains_key(name) {
                return Err(Failure::precondition(format!("Link not found: {name}")));
            }
            let node: Map<String, Value> = node.into_iter().filter(|(key, _)| key != name).collect();
            self.replace(parent, node).await
        }
        .await;
        self.metrics.complete("remove_link", started, outcome)
    }

    async fn put_node(&self, data: DagInput, options: &PutOptions) -> Result<DagPut, Failure> {
        let (body, input_codec) = data.encode(&options.input_encoding);
        let request = RequestOptions::new()
            .param("store-codec", options.format.as_str())
            .param("input-codec", input_codec.as_str())
            .flag("pin", options.pin)
            .param("hash", options.hash.as_str())
            .file("data", body.into_bytes());

        let response = self.call("dag/put", request, "DAG put").await?;
        let put: PutResponse = response
            .json()
            .map_err(|_| Failure::invalid_json(response.text()))?;
        Ok(DagPut {
            cid: put.cid.cid,
            format: options.format.clone(),
            input_encoding: input_codec,
            pinned: options.pin,
        })
    }

    async fn store_node(&self, node: Value) -> Result<String, Failure> {
        self.put_node(DagInput::Json(node), &PutOptions::default())
            .await
            .map(|put| put.cid)
    }

    async fn fetch_node(&self, cid: &str) -> Result<Value, Failure> {
        let response = self
            .call("dag/get", RequestOptions::new().arg(cid), "DAG get")
            .await?;
        response
            .json()
            .map_err(|_| Failure::invalid_json(response.text()))
    }

    async fn fetch_object(&self, cid: &str) -> Result<Map<String, Value>, Failure> {
        match self.fetch_node(cid).await? {
            Value::Object(map) => Ok(map),
            _ => Err(Failure::precondition(format!("Node is not an object: {cid}"))),
        }
    }

    async fn replace(&self, old_cid: &str, node: Map<String, Value>) -> Result<NodeUpdate, Failure> {
        let new_cid = self.store_node(Value::Object(node)).await?;
        debug!(old = %old_cid, new = %new_cid, "DAG node rewritten");
        Ok(NodeUpdate {
            old_cid: old_cid.to_string(),
            new_cid,
        })
    }

    fn store_subtrees<'a>(
        &'a self,
        value: Value,
        created: &'a mut usize,
    ) -> BoxFuture<'a, Result<Value, Failure>> {
        async move {
            if is_link(&value) {
                return Ok(value);
            }
            match value {
                Value::Object(map) => {
                    let mut out = Map::with_capacity(map.len());
                    for (key, child) in map {
                        out.insert(key, self.store_child(child, created).await?);
                    }
                    Ok(Value::Object(out))
                }
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.store_child(item, created).await?);
                    }
                    Ok(Value::Array(out))
                }
                other => Ok(other),
            }
        }
        .boxed()
    }

    /// Nested objects become their own node; everything else is inlined
    async fn store_child(&self, child: Value, created: &mut usize) -> Result<Value, Failure> {
        if child.is_object() && !is_link(&child) {
            let node = self.store_subtrees(child, created).await?;
            let cid = self.store_node(node).await?;
            *created += 1;
            Ok(link(&cid))
        } else {
            self.store_subtrees(child, created).await
        }
    }

    fn expand(&self, value: Value, depth: i64, max_depth: i64) -> BoxFuture<'_, Result<Value, Failure>> {
        async move {
            if let Some(cid) = link_target(&value) {
                if max_depth >= 0 && depth >= max_depth {
                    return Ok(value);
                }
                let node = self.fetch_node(cid).await?;
                return self.expand(node, depth + 1, max_depth).await;
            }
            match value {
                Value::Object(map) => {
                    let mut out = Map::with_capacity(map.len());
                    for (key, child) in map {
                        out.insert(key, self.expand(child, depth, max_depth).await?);
                    }
                    Ok(Value::Object(out))
                }
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.expand(item, depth, max_depth).await?);
                    }
                    Ok(Value::Array(out))
                }
                other => Ok(other),
            }
        }
        .boxed()
    }

    async fn import_car(
        &self,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        pin_roots: bool,
    ) -> Result<DagImport, Failure> {
        let mut car = Vec::new();
        reader
            .read_to_end(&mut car)
            .await
            .map_err(|e| Failure::internal(format!("Failed to read CAR input: {e}")))?;

        let request = RequestOptions::new()
            .flag("pin-roots", pin_roots)
            .file("data.car", car);
        let response = self.call("dag/import", request, "DAG import").await?;
        let lines: Vec<ImportLine> = response
            .json_lines()
            .map_err(|_| Failure::invalid_json(response.text()))?;
        let roots: Vec<String> = lines
            .into_iter()
            .filter_map(|line| line.root)
            .map(|root| root.cid.cid)
            .collect();
        Ok(DagImport {
            count: roots.len(),
            roots,
        })
    }

    async fn export_into<W>(&self, options: RequestOptions, sink: &mut W) -> Result<u64, Failure>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let outcome = self
            .pool
            .stream("dag/export", options, sink)
            .await
            .map_err(Failure::transport)?;
        match outcome.error_body {
            Some(body) => Err(Failure::daemon("DAG export", outcome.status, body)),
            None => Ok(outcome.bytes_written),
        }
    }

    async fn export_to_path(
        &self,
        cid: &str,
        options: RequestOptions,
        path: PathBuf,
    ) -> Result<DagExport, Failure> {
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| Failure::internal(format!("Cannot create {}: {e}", path.display())))?;

        match self.export_into(options, &mut file).await {
            Ok(written) => Ok(DagExport {
                cid: cid.to_string(),
                bytes_written: written,
                path: Some(path),
                data: None,
            }),
            Err(failure) => {
                drop(file);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Could not remove partial export");
                }
                Err(failure)
            }
        }
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

fn join_path(cid: &str, path: Option<&str>) -> String {
    match path.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(path) => format!("{cid}/{path}"),
        None => cid.to_string(),
    }
}

fn require_link_name(name: &str) -> Result<(), Failure> {
    if name.is_empty() {
        return Err(Failure::precondition("Link name is required"));
    }
    Ok(())
}
