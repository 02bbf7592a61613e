//! Internal record of one pending or in-flight request.

use crate::error::Result;
use crate::response::ResponseEnvelope;
use crate::transport::PreparedRequest;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

/// The caller-facing alternation for query parameters: either a pre-built
/// query string, or a map of name/value pairs to be percent-encoded (entries
/// with no value are dropped).
#[derive(Debug, Clone)]
pub enum QueryString {
    Raw(String),
    Map(HashMap<String, String>),
}

impl QueryString {
    pub(crate) fn encode(&self) -> String {
        match self {
            QueryString::Raw(s) => s.clone(),
            QueryString::Map(map) => {
                let mut serializer = url::form_urlencoded::Serializer::new(String::new());
                for (k, v) in map {
                    serializer.append_pair(k, v);
                }
                serializer.finish()
            }
        }
    }
}

/// What the caller's request body was built from.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
}

/// A tagged description of one request to submit, independent of how it will
/// be scheduled. Produced by the public request-building surface and consumed
/// by the dispatcher to build a [`Task`].
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: reqwest::Method,
    pub base_path: Option<String>,
    pub path: Option<String>,
    pub qs: Option<QueryString>,
    pub body: RequestBody,
    pub headers: HashMap<String, String>,
    pub host: Option<usize>,
    pub allow_dirty_read: bool,
    pub expect_binary: bool,
    pub timeout: Option<Duration>,
}

impl Default for RequestDescriptor {
    fn default() -> Self {
        Self {
            method: reqwest::Method::GET,
            base_path: None,
            path: None,
            qs: None,
            body: RequestBody::Empty,
            headers: HashMap::new(),
            host: None,
            allow_dirty_read: false,
            expect_binary: false,
            timeout: None,
        }
    }
}

impl RequestDescriptor {
    pub fn new(method: reqwest::Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, qs: QueryString) -> Self {
        self.qs = Some(qs);
        self
    }

    pub fn with_json_body(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_host(mut self, host: usize) -> Self {
        self.host = Some(host);
        self
    }

    pub fn allow_dirty_read(mut self) -> Self {
        self.allow_dirty_read = true;
        self
    }

    pub fn expect_binary(mut self) -> Self {
        self.expect_binary = true;
        self
    }
}

/// What the caller eventually receives: the parsed/raw body and the index of
/// the host that produced it (needed for cursor continuations that must pin
/// to the same coordinator).
#[derive(Debug, Clone)]
pub struct PoolResponse {
    pub status: u16,
    pub host: usize,
    pub body: ResponseEnvelope,
}

/// One queued unit of work. Carries everything needed to prepare and execute
/// a request, plus the completion sink and the bookkeeping the dispatcher
/// needs for failover/redirect/retry decisions.
pub struct Task {
    pub method: reqwest::Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub expect_binary: bool,
    pub timeout: Option<Duration>,
    pub allow_dirty_read: bool,
    pub host_pin: Option<usize>,
    pub retries: u32,
    pub sink: Option<oneshot::Sender<Result<PoolResponse>>>,
}

impl Task {
    pub(crate) fn prepared_request(&self) -> PreparedRequest {
        PreparedRequest {
            method: self.method.clone(),
            path: self.path.clone(),
            query: self.query.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            timeout: self.timeout,
        }
    }
}
