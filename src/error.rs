//! Error types for the gateway

use thiserror::Error;

use crate::config::Priority;
use crate::response::ResponseView;

#[derive(Error, Debug)]
pub enum Error {
    #[error("request cancelled")]
    Cancelled,

    #[error("retry queue full for {0:?} priority")]
    Backpressure(Priority),

    #[error("redirect loop detected at {0}")]
    RedirectLoop(String),

    #[error("redirect budget exhausted after {0} redirects")]
    RedirectsExhausted(u32),

    #[error("retry budget exhausted after {retries} retries")]
    RetriesExhausted {
        retries: u32,
        last: Box<ResponseView>,
    },

    #[error("rate limited on group {group} (retry after {retry_after_ms}ms)")]
    RateLimited { group: String, retry_after_ms: u64 },

    #[error("circuit open for group: {0}")]
    CircuitOpen(String),

    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unexpected gateway state: {0}")]
    Fatal(String),
}

impl Error {
    /// Builds a transport error from a plain message.
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport(message.into().into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
