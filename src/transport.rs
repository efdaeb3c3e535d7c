//! Wire layer
//!
//! A [`Transport`] performs exactly one HTTP exchange: no retries, no
//! redirect following, no rate limiting. The gateway owns all of that; the
//! transport only promises to honor the abort token and the per-exchange
//! timeout. Tests inject fakes, production uses [`ReqwestTransport`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::response::ResponseView;

/// Everything a transport needs for one exchange.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    /// Materialized request body; empty means no body.
    pub body: Bytes,
    pub timeout: Duration,
    /// Response body size cap, in bytes.
    pub max_content_length: usize,
    pub abort: CancellationToken,
}

/// One HTTP exchange per call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: TransportRequest) -> Result<ResponseView>;
}

static SHARED_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("apigate/", env!("CARGO_PKG_VERSION")))
        .gzip(true)
        .brotli(true)
        .build()
        .expect("Failed to build shared HTTP client")
});

/// Default transport backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Transport over the process-wide shared client.
    pub fn shared() -> Arc<dyn Transport> {
        Arc::new(Self {
            client: SHARED_CLIENT.clone(),
        })
    }

    /// Transport over a caller-built client (custom pools, proxies, TLS).
    pub fn with_client(client: reqwest::Client) -> Arc<dyn Transport> {
        Arc::new(Self { client })
    }

    async fn collect_body(
        mut response: reqwest::Response,
        max_content_length: usize,
    ) -> Result<Bytes> {
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if buf.len() + chunk.len() > max_content_length {
                return Err(Error::transport(format!(
                    "response body exceeds max_content_length ({max_content_length} bytes)"
                )));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.into())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: TransportRequest) -> Result<ResponseView> {
        debug!(
            method = %request.method,
            url = %request.url,
            "Executing HTTP exchange"
        );

        let mut builder = self
            .client
            .request(request.method, request.url.clone())
            .headers(request.headers)
            .timeout(request.timeout);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let url = response.url().clone();
            let body = Self::collect_body(response, request.max_content_length).await?;
            Ok(ResponseView::new(status, headers, body, url))
        };

        tokio::select! {
            result = exchange => result,
            _ = request.abort.cancelled() => Err(Error::Cancelled),
        }
    }
}
