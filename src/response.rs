//! Normalized response facade
//!
//! A [`ResponseView`] is the read-only value completed back to callers: the
//! status, headers and collected body of one HTTP exchange, plus the
//! accessors the lifecycle needs (redirect target, retry-after).

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::headers;

/// Read-only view over one exchanged response.
#[derive(Debug, Clone)]
pub struct ResponseView {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    url: Url,
}

impl ResponseView {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes, url: Url) -> Self {
        Self {
            status,
            headers,
            body,
            url,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The URL this response was served from (after any redirects followed
    /// so far).
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Body deserialized as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// `Location` target resolved against the response URL, when present and
    /// resolvable.
    pub fn redirect_url(&self) -> Option<Url> {
        let location = self
            .headers
            .get(headers::LOCATION)
            .and_then(|v| v.to_str().ok())?;
        self.url.join(location).ok()
    }

    /// Parsed `Retry-After`, in milliseconds.
    pub fn retry_after_ms(&self) -> Option<u64> {
        headers::retry_after_ms(&self.headers)
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_error(&self) -> bool {
        self.status.is_client_error() || self.status.is_server_error()
    }

    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection()
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS
    }
}
