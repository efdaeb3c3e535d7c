//! In-flight request state
//!
//! A [`PreparedRequest`] is the normalized, validated form of one logical
//! send: merged limits, materialized body, resolved priority, and the
//! retry/redirect counters that follow it through re-admission, queueing and
//! dispatch.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{MergedLimits, Priority};
use crate::transport::{Transport, TransportRequest};

/// One logical request, normalized and ready for admission.
pub(crate) struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub limits: MergedLimits,
    pub priority: Priority,
    pub abort: CancellationToken,
    pub transport: Arc<dyn Transport>,
    /// Retries consumed so far (statuses and transient transport errors).
    pub retries: u32,
    /// Redirects followed so far; never counted against the retry budget.
    pub redirects: u32,
}

impl PreparedRequest {
    /// Snapshot handed to the transport for one exchange.
    pub fn transport_request(&self) -> TransportRequest {
        TransportRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            timeout: self.limits.timeout,
            max_content_length: self.limits.max_content_length,
            abort: self.abort.clone(),
        }
    }
}

impl std::fmt::Debug for PreparedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("priority", &self.priority)
            .field("retries", &self.retries)
            .field("redirects", &self.redirects)
            .finish_non_exhaustive()
    }
}
