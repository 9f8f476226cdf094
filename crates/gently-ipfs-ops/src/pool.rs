//! Connection Pool
//!
//! A bounded set of reusable HTTP sessions to one daemon endpoint.
//!
//! - At most `max_connections` sessions ever exist.
//! - A session is leased to one caller at a time; the lease returns it on drop,
//!   whatever happened to the request.
//! - Waiters queue on a semaphore (FIFO) instead of polling.
//! - A background task evicts sessions idle longer than `idle_timeout`.
//! - Retryable statuses are retried with exponential backoff; network errors
//!   are not.

use crate::config::{ConnectionConfig, Endpoint};
use crate::{Error, Result};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// HTTP verbs the pool will issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            _ => Err(Error::UnsupportedMethod(s.to_string())),
        }
    }
}

/// One multipart upload
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Query parameters, uploads and per-request overrides
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Repeatable, so `arg` can appear more than once
    pub params: Vec<(String, String)>,
    pub files: Vec<FilePart>,
    pub timeout: Option<Duration>,
    pub headers: Vec<(String, String)>,
    /// Send once even on a retryable status
    pub no_retry: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positional daemon argument (`arg=`)
    pub fn arg(self, value: impl Into<String>) -> Self {
        self.param("arg", value)
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn flag(self, name: impl Into<String>, value: bool) -> Self {
        self.param(name, if value { "true" } else { "false" })
    }

    /// Attach a multipart `file` field
    pub fn file(mut self, file_name: impl Into<String>, data: Vec<u8>) -> Self {
        self.files.push(FilePart {
            field: "file".to_string(),
            file_name: file_name.into(),
            data,
        });
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// For RPCs that change daemon state; the daemon reports ordinary
    /// command errors as 500, so a retry would repeat the change.
    pub fn no_retry(mut self) -> Self {
        self.no_retry = true;
        self
    }
}

/// Fully-read daemon response
#[derive(Debug, Clone)]
pub struct DaemonResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl DaemonResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// Newline-delimited JSON, blank lines skipped
    pub fn json_lines<T: DeserializeOwned>(&self) -> serde_json::Result<Vec<T>> {
        self.body
            .split(|b| *b == b'\n')
            .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
            .map(serde_json::from_slice)
            .collect()
    }
}

/// Result of streaming a response body into a sink
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub status: StatusCode,
    pub bytes_written: u64,
    /// Error body when the status was not a success; nothing was written then
    pub error_body: Option<String>,
}

impl StreamOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    pub max: usize,
}

struct PooledConnection {
    id: u64,
    client: reqwest::Client,
    last_used: Instant,
    in_use: bool,
}

impl PooledConnection {
    fn open(id: u64, config: &ConnectionConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::InvalidConfig(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::InvalidConfig(format!("invalid header value for {name}: {e}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .default_headers(headers)
            .danger_accept_invalid_certs(!config.verify_tls)
            .pool_max_idle_per_host(1)
            .build()?;

        Ok(Self {
            id,
            client,
            last_used: Instant::now(),
            in_use: false,
        })
    }
}

struct PoolState {
    connections: Vec<PooledConnection>,
    next_id: u64,
}

/// Exclusive use of one pooled session until dropped
pub(crate) struct ConnectionLease<'a> {
    pool: &'a ConnectionPool,
    id: u64,
    client: reqwest::Client,
    _permit: SemaphorePermit<'a>,
}

impl std::fmt::Debug for ConnectionLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ConnectionLease<'_> {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionLease<'_> {
    fn drop(&mut self) {
        // Runs before the permit is released, so the next waiter finds it free.
        self.pool.release(self.id);
    }
}

pub struct ConnectionPool {
    config: ConnectionConfig,
    endpoint: Endpoint,
    state: Mutex<PoolState>,
    permits: Semaphore,
    closed: AtomicBool,
    stop: Arc<Notify>,
}

impl ConnectionPool {
    /// Build a pool and start its eviction loop on the current tokio runtime.
    pub fn new(config: ConnectionConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let endpoint = Endpoint::parse(&config.base_url)?;
        let stop = Arc::new(Notify::new());

        let pool = Arc::new(Self {
            permits: Semaphore::new(config.max_connections),
            state: Mutex::new(PoolState {
                connections: Vec::with_capacity(config.max_connections),
                next_id: 0,
            }),
            closed: AtomicBool::new(false),
            stop: Arc::clone(&stop),
            endpoint,
            config,
        });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(Self::eviction_loop(
                    Arc::downgrade(&pool),
                    stop,
                    pool.config.eviction_interval,
                ));
            }
            Err(_) => warn!("No tokio runtime; idle connection eviction disabled"),
        }

        info!(
            endpoint = %pool.endpoint,
            max_connections = pool.config.max_connections,
            "Connection pool created"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        let in_use = state.connections.iter().filter(|c| c.in_use).count();
        PoolStats {
            total: state.connections.len(),
            in_use,
            idle: state.connections.len() - in_use,
            max: self.config.max_connections,
        }
    }

    pub async fn get(&self, path: &str, options: RequestOptions) -> Result<DaemonResponse> {
        self.request(Method::Get, path, &options).await
    }

    pub async fn post(&self, path: &str, options: RequestOptions) -> Result<DaemonResponse> {
        self.request(Method::Post, path, &options).await
    }

    /// Issue a request with a method given by name (`"get"`, `"POST"`, ...)
    pub async fn execute(
        &self,
        method: &str,
        path: &str,
        options: RequestOptions,
    ) -> Result<DaemonResponse> {
        let method: Method = method.parse()?;
        self.request(method, path, &options).await
    }

    /// Run a request on its own task and hand the result to `callback`.
    ///
    /// An unsupported method is rejected here, before anything is spawned.
    pub fn async_execute<F, T>(
        self: &Arc<Self>,
        method: &str,
        path: &str,
        options: RequestOptions,
        callback: F,
    ) -> Result<JoinHandle<T>>
    where
        F: FnOnce(Result<DaemonResponse>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let method: Method = method.parse()?;
        let pool = Arc::clone(self);
        let path = path.to_string();
        Ok(tokio::spawn(async move {
            let result = pool.request(method, &path, &options).await;
            callback(result)
        }))
    }

    /// POST and copy the response body into `sink` chunk by chunk.
    pub async fn stream<W>(
        &self,
        path: &str,
        options: RequestOptions,
        sink: &mut W,
    ) -> Result<StreamOutcome>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let lease = self.acquire().await?;
        let response = self.send(&lease, Method::Post, path, &options).await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await?;
            return Ok(StreamOutcome {
                status,
                bytes_written: 0,
                error_body: Some(body),
            });
        }

        let mut written = 0u64;
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;

        debug!(path, bytes = written, connection = lease.id(), "Streamed daemon response");
        Ok(StreamOutcome {
            status,
            bytes_written: written,
            error_body: None,
        })
    }

    /// Remove every session that is idle and older than `idle_timeout`.
    pub fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut state = self.lock_state();
        let before = state.connections.len();
        state
            .connections
            .retain(|c| c.in_use || c.last_used.elapsed() <= idle_timeout);
        let evicted = before - state.connections.len();
        if evicted > 0 {
            debug!(evicted, remaining = state.connections.len(), "Evicted idle connections");
        }
        evicted
    }

    /// Wait for in-flight leases, then close every session.
    ///
    /// Later acquisitions fail with [`Error::PoolClosed`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.notify_one();

        let all = u32::try_from(self.config.max_connections).unwrap_or(u32::MAX);
        let drained = self.permits.acquire_many(all).await;
        self.permits.close();
        drop(drained);

        let mut state = self.lock_state();
        let closed = state.connections.len();
        state.connections.clear();
        info!(closed, "Connection pool shut down");
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        options: &RequestOptions,
    ) -> Result<DaemonResponse> {
        let lease = self.acquire().await?;
        let started = Instant::now();
        let response = self.send(&lease, method, path, options).await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        debug!(
            ?method,
            path,
            status = status.as_u16(),
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            connection = lease.id(),
            "Daemon request"
        );
        Ok(DaemonResponse {
            status,
            headers,
            body,
        })
    }

    /// Send with status-based retries; the body is left unread.
    async fn send(
        &self,
        lease: &ConnectionLease<'_>,
        method: Method,
        path: &str,
        options: &RequestOptions,
    ) -> Result<reqwest::Response> {
        let url = self.endpoint.url_for(path);
        let mut attempt = 0u32;

        loop {
            let response = self
                .build_request(&lease.client, method, &url, options)?
                .send()
                .await?;
            let status = response.status();

            if !options.no_retry
                && attempt < self.config.max_retries
                && self.config.is_retryable(status.as_u16())
            {
                let backoff = self.config.backoff_for(attempt);
                debug!(path, status = status.as_u16(), attempt, ?backoff, "Retrying daemon request");
                tokio::time::sleep(backoff).await;
                attempt += 1;
                continue;
            }

            return Ok(response);
        }
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<reqwest::RequestBuilder> {
        let mut builder = client.request(method.as_reqwest(), url).query(&options.params);

        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        for (name, value) in &options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !options.files.is_empty() {
            let mut form = Form::new();
            for file in &options.files {
                let part = Part::bytes(file.data.clone()).file_name(file.file_name.clone());
                form = form.part(file.field.clone(), part);
            }
            builder = builder.multipart(form);
        }
        Ok(builder)
    }

    pub(crate) async fn acquire(&self) -> Result<ConnectionLease<'_>> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        let permit = self.permits.acquire().await.map_err(|_| Error::PoolClosed)?;

        let mut state = self.lock_state();
        if let Some(conn) = state.connections.iter_mut().find(|c| !c.in_use) {
            conn.in_use = true;
            conn.last_used = Instant::now();
            return Ok(ConnectionLease {
                pool: self,
                id: conn.id,
                client: conn.client.clone(),
                _permit: permit,
            });
        }

        // Holding a permit while every session is busy means there is room.
        let id = state.next_id;
        state.next_id += 1;
        let mut conn = PooledConnection::open(id, &self.config)?;
        conn.in_use = true;
        let client = conn.client.clone();
        state.connections.push(conn);
        debug!(connection = id, total = state.connections.len(), "Opened daemon connection");

        Ok(ConnectionLease {
            pool: self,
            id,
            client,
            _permit: permit,
        })
    }

    fn release(&self, id: u64) {
        let mut state = self.lock_state();
        if let Some(conn) = state.connections.iter_mut().find(|c| c.id == id) {
            conn.in_use = false;
            conn.last_used = Instant::now();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn eviction_loop(pool: Weak<Self>, stop: Arc<Notify>, interval: Duration) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.notified() => break,
            }
            let Some(pool) = pool.upgrade() else { break };
            if pool.is_closed() {
                break;
            }
            pool.evict_idle();
        }
        debug!("Eviction loop stopped");
    }
}
