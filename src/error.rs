//! Error types returned by the pool and dispatcher.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PoolError>;

/// Structured error envelope returned by the server: `{error, code, errorMessage, errorNum}`.
///
/// `error_num` is the field callers are expected to match on (e.g. `1203` for
/// "collection not found"); `code` mirrors the HTTP status the server intended.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ArangoError {
    pub error: bool,
    pub code: u16,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
    #[serde(rename = "errorNum")]
    pub error_num: i64,
}

impl std::fmt::Display for ArangoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (errorNum {})", self.error_message, self.error_num)
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    /// Socket-level failure reaching a coordinator that is not a refused
    /// connection (DNS failure, TLS error, timeout, reset, ...).
    #[error("transport error talking to {host}: {source}")]
    Transport {
        host: String,
        #[source]
        source: reqwest::Error,
    },

    /// The coordinator refused the connection outright (`ECONNREFUSED`). This
    /// is the one transport failure the dispatcher transparently retries.
    #[error("connection refused by {host}")]
    ConnectionRefused { host: String },

    /// The server answered with its structured error envelope.
    #[error("arango error: {0}")]
    Arango(#[from] ArangoError),

    /// Non-2xx/3xx status without a structured envelope.
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },

    /// JSON was expected (by content-type) but failed to parse.
    #[error("failed to parse response body as json: {source}")]
    Parse {
        #[source]
        source: serde_json::Error,
        raw: Vec<u8>,
        partial_text: String,
    },

    /// The dispatcher has been closed and rejects new submissions.
    #[error("dispatcher is closed")]
    Closed,

    /// A task was pinned to a host index that does not exist.
    #[error("no host at index {0}")]
    NoSuchHost(usize),

    /// Configuration was internally inconsistent (e.g. empty host list).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A unix-socket endpoint was addressed but this transport cannot dial it.
    #[error("unix socket endpoints are not supported by this transport: {0}")]
    UnixSocketUnsupported(String),

    #[error("url error: {0}")]
    Url(#[from] url::ParseError),

    #[error("request body could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Raised only by [`crate::transport::MockEndpointTransport`] when a test
    /// forgot to script a response for the call it's about to make.
    #[error("no mock response configured for {0}")]
    MockUnconfigured(String),
}

impl PoolError {
    /// True for the narrow class of errors the dispatcher transparently retries:
    /// a refused connection on an unpinned task.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, PoolError::ConnectionRefused { .. })
    }
}
