//! Gateway configuration
//!
//! A typed [`ClientConfig`] holds the client-wide defaults; a per-request
//! [`RequestOptions`] overrides any of them for one send. Merging is a pure
//! function and every clamp is applied exactly once, at merge time, so the
//! admission and lifecycle code never re-validates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::limits::GroupQuotas;
use crate::transport::Transport;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MIN_TIMEOUT_MS: u64 = 10_000;
pub const MAX_TIMEOUT_MS: u64 = 60_000;

pub const DEFAULT_CONTENT_LENGTH: usize = 256 * 1024;
pub const MIN_CONTENT_LENGTH: usize = 64 * 1024;
pub const MAX_CONTENT_LENGTH: usize = 200 * 1024 * 1024;

pub const DEFAULT_MAX_REDIRECTS: u32 = 5;
pub const MIN_MAX_REDIRECTS: u32 = 3;
pub const MAX_MAX_REDIRECTS: u32 = 10;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const MAX_MAX_RETRIES: u32 = 10;

pub const DEFAULT_MAX_DEFERRAL_MS: u64 = 2_500;
pub const MIN_MAX_DEFERRAL_MS: u64 = 100;
pub const MAX_MAX_DEFERRAL_MS: u64 = 10_000;

/// Scheduling priority for a request.
///
/// `Auto` resolves from the method and path at preparation time: mutating
/// verbs are urgent, plain reads are normal, probes and bulk-ish paths are
/// background traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
    #[default]
    Auto,
}

const BULK_SEGMENTS: [&str; 4] = ["download", "export", "bulk", "batch"];

impl Priority {
    /// Resolves `Auto` against the request's method and path.
    pub fn resolve(self, method: &Method, path: &str) -> Priority {
        if self != Priority::Auto {
            return self;
        }
        if path
            .split('/')
            .any(|segment| BULK_SEGMENTS.contains(&segment))
        {
            return Priority::Low;
        }
        let mutating = [Method::POST, Method::PUT, Method::PATCH, Method::DELETE];
        if mutating.contains(method) {
            Priority::High
        } else if *method == Method::GET {
            Priority::Normal
        } else {
            Priority::Low
        }
    }

    /// Queue tier index; `Auto` maps with `Normal` once resolution has run.
    pub(crate) fn tier_index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal | Priority::Auto => 1,
            Priority::Low => 2,
        }
    }
}

/// Caller-supplied credentials, attached to outbound headers verbatim.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub tenant_id: Option<String>,
}

impl Credentials {
    /// Writes the credential headers, replacing any existing values.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<()> {
        if let Some(key) = &self.api_key {
            headers.insert("x-api-key", header_value(key)?);
        }
        if let Some(token) = &self.access_token {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
        }
        if let Some(tenant) = &self.tenant_id {
            headers.insert("x-tenant-id", header_value(tenant)?);
        }
        Ok(())
    }
}

/// A request body in any of the shapes callers hand over.
///
/// Structured values and streams are materialized into bytes at preparation
/// time so retries and queue snapshots stay cheap.
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    Json(serde_json::Value),
    Stream(BoxStream<'static, std::result::Result<Bytes, Box<dyn std::error::Error + Send + Sync>>>),
}

impl RequestBody {
    /// Whether materialization should stamp a JSON content type.
    pub(crate) fn is_json(&self) -> bool {
        matches!(self, RequestBody::Json(_))
    }

    /// Materializes the body into bytes, enforcing the outbound size cap.
    pub(crate) async fn into_bytes(self, max_body_length: usize) -> Result<Bytes> {
        let bytes = match self {
            RequestBody::Empty => Bytes::new(),
            RequestBody::Bytes(bytes) => bytes,
            RequestBody::Json(value) => serde_json::to_vec(&value)
                .map_err(|e| Error::Config(format!("unserializable JSON body: {e}")))?
                .into(),
            RequestBody::Stream(mut stream) => {
                let mut buf = Vec::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(Error::Transport)?;
                    if buf.len() + chunk.len() > max_body_length {
                        return Err(Error::Config(format!(
                            "request body exceeds max_body_length ({max_body_length} bytes)"
                        )));
                    }
                    buf.extend_from_slice(&chunk);
                }
                buf.into()
            }
        };

        if bytes.len() > max_body_length {
            return Err(Error::Config(format!(
                "request body exceeds max_body_length ({max_body_length} bytes)"
            )));
        }
        Ok(bytes)
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            RequestBody::Json(_) => f.write_str("Json"),
            RequestBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        RequestBody::Empty
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::Bytes(bytes.into())
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        RequestBody::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        RequestBody::Bytes(s.into())
    }
}

impl From<serde_json::Value> for RequestBody {
    fn from(value: serde_json::Value) -> Self {
        RequestBody::Json(value)
    }
}

/// Client-wide configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Baseline headers merged under every request's own.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Response body size cap in bytes.
    #[serde(default = "default_content_length")]
    pub max_content_length: usize,

    /// Outbound body size cap in bytes.
    #[serde(default = "default_content_length")]
    pub max_body_length: usize,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Largest admission sleep before a request is enqueued instead.
    #[serde(default = "default_max_deferral_ms")]
    pub max_deferral_ms: u64,

    /// Concurrent in-flight transport exchanges.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,

    /// Retry-queue capacity per priority tier.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Quotas applied to groups with no dedicated entry.
    #[serde(default)]
    pub quotas: GroupQuotas,

    /// Per-group quota overrides.
    #[serde(default)]
    pub group_quotas: HashMap<String, GroupQuotas>,

    /// Accept compressed response bodies.
    #[serde(default = "default_true")]
    pub decompress: bool,

    /// Segment whose successor names the rate-limit group.
    #[serde(default = "default_anchor")]
    pub api_path_anchor: String,

    /// Exact path/segment to group-name mappings.
    #[serde(default)]
    pub group_literals: HashMap<String, String>,

    /// Regex to group-name mappings, first match wins.
    #[serde(default)]
    pub group_patterns: Vec<(String, String)>,

    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,

    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_failure_threshold: u32,

    #[serde(default = "default_breaker_open_secs")]
    pub circuit_breaker_open_duration_secs: u64,

    /// Credentials attached to every request unless overridden.
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_content_length() -> usize {
    DEFAULT_CONTENT_LENGTH
}

fn default_max_redirects() -> u32 {
    DEFAULT_MAX_REDIRECTS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_max_deferral_ms() -> u64 {
    DEFAULT_MAX_DEFERRAL_MS
}

fn default_max_concurrent() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    crate::queue::DEFAULT_TIER_CAPACITY
}

fn default_true() -> bool {
    true
}

fn default_anchor() -> String {
    "api".to_string()
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_open_secs() -> u64 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            timeout_ms: default_timeout_ms(),
            max_content_length: default_content_length(),
            max_body_length: default_content_length(),
            max_redirects: default_max_redirects(),
            max_retries: default_max_retries(),
            max_deferral_ms: default_max_deferral_ms(),
            max_concurrent_requests: default_max_concurrent(),
            queue_capacity: default_queue_capacity(),
            quotas: GroupQuotas::default(),
            group_quotas: HashMap::new(),
            decompress: true,
            api_path_anchor: default_anchor(),
            group_literals: HashMap::new(),
            group_patterns: Vec::new(),
            circuit_breaker_enabled: true,
            circuit_breaker_failure_threshold: default_breaker_threshold(),
            circuit_breaker_open_duration_secs: default_breaker_open_secs(),
            credentials: None,
        }
    }
}

impl ClientConfig {
    /// Loads configuration from the environment (`APIGATE__*` variables),
    /// with `.env` preloading.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let raw = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("APIGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        raw.try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Quotas for a group, falling back to the client-wide default.
    pub fn quotas_for(&self, group: &str) -> &GroupQuotas {
        self.group_quotas.get(group).unwrap_or(&self.quotas)
    }

    /// Merges per-request options over these defaults, applying every clamp.
    pub(crate) fn merge(&self, options: &RequestOptions) -> MergedLimits {
        MergedLimits {
            timeout: Duration::from_millis(
                options
                    .timeout_ms
                    .unwrap_or(self.timeout_ms)
                    .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS),
            ),
            max_content_length: options
                .max_content_length
                .unwrap_or(self.max_content_length)
                .clamp(MIN_CONTENT_LENGTH, MAX_CONTENT_LENGTH),
            max_body_length: options
                .max_body_length
                .unwrap_or(self.max_body_length)
                .clamp(MIN_CONTENT_LENGTH, MAX_CONTENT_LENGTH),
            max_redirects: options
                .max_redirects
                .unwrap_or(self.max_redirects)
                .clamp(MIN_MAX_REDIRECTS, MAX_MAX_REDIRECTS),
            max_retries: options
                .max_retries
                .unwrap_or(self.max_retries)
                .min(MAX_MAX_RETRIES),
            max_deferral_ms: options
                .max_deferral_ms
                .unwrap_or(self.max_deferral_ms)
                .clamp(MIN_MAX_DEFERRAL_MS, MAX_MAX_DEFERRAL_MS),
            decompress: options.decompress.unwrap_or(self.decompress),
        }
    }
}

/// Per-request overrides. Every field defaults to "use the client's value".
#[derive(Default)]
pub struct RequestOptions {
    pub headers: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
    pub max_content_length: Option<usize>,
    pub max_body_length: Option<usize>,
    pub max_redirects: Option<u32>,
    pub max_retries: Option<u32>,
    pub max_deferral_ms: Option<u64>,
    pub priority: Priority,
    pub decompress: Option<bool>,
    pub credentials: Option<Credentials>,
    /// Cancellation handle; one is created when absent.
    pub abort: Option<tokio_util::sync::CancellationToken>,
    /// Transport override for this request alone.
    pub transport: Option<Arc<dyn Transport>>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("headers", &self.headers)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("max_redirects", &self.max_redirects)
            .field("max_deferral_ms", &self.max_deferral_ms)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn max_redirects(mut self, redirects: u32) -> Self {
        self.max_redirects = Some(redirects);
        self
    }

    pub fn max_deferral_ms(mut self, ms: u64) -> Self {
        self.max_deferral_ms = Some(ms);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn abort(mut self, token: tokio_util::sync::CancellationToken) -> Self {
        self.abort = Some(token);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }
}

/// Effective limits for one request after merge and clamping.
#[derive(Debug, Clone)]
pub(crate) struct MergedLimits {
    pub timeout: Duration,
    pub max_content_length: usize,
    pub max_body_length: usize,
    pub max_redirects: u32,
    pub max_retries: u32,
    pub max_deferral_ms: u64,
    pub decompress: bool,
}

/// Builds a header map from loosely-typed string pairs.
pub(crate) fn header_map(pairs: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        let name: HeaderName = name
            .parse()
            .map_err(|_| Error::Config(format!("invalid header name {name:?}")))?;
        headers.insert(name, header_value(value)?);
    }
    Ok(headers)
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| Error::Config(format!("invalid header value {value:?}")))
}

/// Stamps a JSON content type unless the caller already set one.
pub(crate) fn ensure_json_content_type(headers: &mut HeaderMap) {
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
}
