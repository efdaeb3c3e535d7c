//! apigate
//! Client-side HTTP gateway for applications talking to rate-limited APIs
//!
//! Features:
//! - Per-group rate-limit accounting across burst/second/minute/hour/day windows
//! - Adaptive quotas absorbed from `X-RateLimit-Limit` response headers
//! - Priority-aware admission: dispatch, sleep-then-dispatch, or enqueue
//! - Bounded three-tier retry queue with a fair, jittered pump
//! - Retry on transient statuses and transport failures with scaled backoff
//! - Redirect following with loop detection
//! - Per-group circuit breakers for failing origins
//! - Semaphore-based concurrency limiting
//! - Cancellation and per-request timeouts at every suspension point
//! - Injected transport seam; tests run against a mock origin
//!
//! ```no_run
//! use apigate::{Client, ClientConfig, RequestOptions};
//!
//! # async fn example() -> apigate::Result<()> {
//! let client = Client::new(ClientConfig::default())?;
//! let response = client
//!     .get("https://api.example.com/api/orders/42", RequestOptions::new())
//!     .await?;
//! assert!(response.is_ok());
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod headers;
pub mod interval;
pub mod limits;
mod queue;
mod request;
pub mod resolver;
pub mod response;
pub mod transport;
pub mod window;

pub use client::{Client, ClientStats};
pub use config::{ClientConfig, Credentials, Priority, RequestBody, RequestOptions};
pub use error::{Error, Result};
pub use interval::Interval;
pub use limits::{GroupQuotas, GroupSnapshot, WindowSnapshot};
pub use queue::DEFAULT_TIER_CAPACITY;
pub use resolver::GroupResolver;
pub use response::ResponseView;
pub use transport::{ReqwestTransport, Transport, TransportRequest};
