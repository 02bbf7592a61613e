//! Per-endpoint HTTP execution.
//!
//! An [`EndpointTransport`] is bound to exactly one coordinator URL and knows
//! nothing about load balancing, retries, or redirection — that is the
//! dispatcher's job. It only executes one prepared request and reports the
//! outcome.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::error::{PoolError, Result};

/// Walks a `reqwest::Error`'s source chain looking for an `ECONNREFUSED` io error.
fn is_connection_refused(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = e.source();
    }
    false
}

/// A prepared, fully-addressed HTTP request.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: reqwest::Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub timeout: Option<Duration>,
}

/// What a transport hands back on success: status, lowercased headers, and
/// raw body bytes. The dispatcher attaches the originating host index.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait EndpointTransport: Send + Sync {
    /// Execute one request against this endpoint.
    async fn execute(&self, request: PreparedRequest) -> Result<TransportResponse>;

    /// The URL this transport is bound to, for error messages and logging.
    fn url(&self) -> &str;

    /// Best-effort release of pooled sockets. Never fails the caller.
    async fn close(&self);
}

/// Production transport: one `reqwest::Client` per coordinator, configured
/// with the agent's keep-alive and socket-cap settings.
pub struct ReqwestEndpointTransport {
    url: String,
    client: reqwest::Client,
}

impl ReqwestEndpointTransport {
    pub fn new(url: &str, agent: &crate::config::AgentOptions) -> Result<Self> {
        if url.starts_with("http+unix://") || url.starts_with("https+unix://") {
            return Err(PoolError::UnixSocketUnsupported(url.to_string()));
        }
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(agent.max_sockets)
            .pool_idle_timeout(if agent.keep_alive {
                Some(Duration::from_millis(agent.keep_alive_msecs))
            } else {
                Some(Duration::from_millis(0))
            })
            .build()
            .map_err(|source| PoolError::Transport {
                host: url.to_string(),
                source,
            })?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl EndpointTransport for ReqwestEndpointTransport {
    #[instrument(skip(self, request), fields(host = %self.url, path = %request.path))]
    async fn execute(&self, request: PreparedRequest) -> Result<TransportResponse> {
        let mut url = format!("{}{}", self.url.trim_end_matches('/'), request.path);
        if let Some(qs) = &request.query {
            if !qs.is_empty() {
                url.push('?');
                url.push_str(qs);
            }
        }
        tracing::debug!(%url, method = %request.method, "dispatching request");

        let mut builder = self.client.request(request.method.clone(), &url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|source| {
            tracing::warn!(error = %source, host = %self.url, "transport error");
            if source.is_connect() && is_connection_refused(&source) {
                PoolError::ConnectionRefused {
                    host: self.url.clone(),
                }
            } else {
                PoolError::Transport {
                    host: self.url.clone(),
                    source,
                }
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_ascii_lowercase(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|source| PoolError::Transport {
                host: self.url.clone(),
                source,
            })?
            .to_vec();

        tracing::trace!(status, bytes = body.len(), "received response");
        Ok(TransportResponse { status, headers, body })
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn close(&self) {
        tracing::debug!(host = %self.url, "closing transport");
    }
}

/// A single queued (or immediate) scripted response, keyed by `"METHOD path"`.
type MockResult = Result<TransportResponse>;

/// Records one call for assertions, mirroring the production client's shape.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// An in-process transport double driven entirely by scripted responses.
/// Shipped in the library (not test-only) so downstream code that builds
/// request facades on top of the dispatcher can unit test without a live
/// server.
pub struct MockEndpointTransport {
    url: String,
    responses: Mutex<HashMap<String, Vec<MockResult>>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockEndpointTransport {
    pub fn new() -> Self {
        Self::new_named("mock://host")
    }

    pub fn new_named(url: &str) -> Self {
        Self {
            url: url.to_string(),
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn key(method: &reqwest::Method, path: &str) -> String {
        format!("{method} {path}")
    }

    /// Queue a response (or error) for the next call matching `method path`.
    pub fn add_response(&self, method: &reqwest::Method, path: &str, response: MockResult) {
        self.responses
            .lock()
            .entry(Self::key(method, path))
            .or_default()
            .push(response);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for MockEndpointTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EndpointTransport for MockEndpointTransport {
    async fn execute(&self, request: PreparedRequest) -> Result<TransportResponse> {
        let key = Self::key(&request.method, &request.path);
        self.calls.lock().push(MockCall {
            method: request.method.to_string(),
            path: request.path.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        });

        let mut responses = self.responses.lock();
        match responses.get_mut(&key).and_then(|queue| {
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        }) {
            Some(result) => result,
            None => Err(PoolError::MockUnconfigured(key)),
        }
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn close(&self) {}
}


#[cfg(test)]
mod reqwest_transport_tests {
    use super::*;
    use crate::config::AgentOptions;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn json_body_round_trips_through_a_real_server() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_api/document/c"))
            .respond_with(
                ResponseTemplate::new(202)
                    .set_body_raw(r#"{"_id":"c/1","_key":"1"}"#, "application/json"),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = ReqwestEndpointTransport::new(&mock_server.uri(), &AgentOptions::default()).unwrap();
        let response = transport
            .execute(PreparedRequest {
                method: reqwest::Method::POST,
                path: "/_api/document/c".to_string(),
                query: None,
                headers: HashMap::new(),
                body: br#"{"name":"arango"}"#.to_vec(),
                timeout: None,
            })
            .await
            .unwrap();

        assert_eq!(response.status, 202);
        let parsed: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(parsed["_id"], "c/1");
    }

    #[tokio::test]
    async fn connection_refused_is_classified_for_failover() {
        // Nothing listens on this port; the connection is refused outright
        // rather than timing out, the way a downed coordinator behaves.
        let transport = ReqwestEndpointTransport::new("http://127.0.0.1:1", &AgentOptions::default()).unwrap();
        let err = transport
            .execute(PreparedRequest {
                method: reqwest::Method::GET,
                path: "/_api/version".to_string(),
                query: None,
                headers: HashMap::new(),
                body: Vec::new(),
                timeout: None,
            })
            .await
            .unwrap_err();

        assert!(err.is_connection_refused(), "expected ConnectionRefused, got {err:?}");
    }

    #[tokio::test]
    async fn leader_redirect_header_is_surfaced_for_the_dispatcher_to_act_on() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_api/version"))
            .respond_with(ResponseTemplate::new(503).insert_header("x-arango-endpoint", "http://h2:8529"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = ReqwestEndpointTransport::new(&mock_server.uri(), &AgentOptions::default()).unwrap();
        let response = transport
            .execute(PreparedRequest {
                method: reqwest::Method::GET,
                path: "/_api/version".to_string(),
                query: None,
                headers: HashMap::new(),
                body: Vec::new(),
                timeout: None,
            })
            .await
            .unwrap();

        assert_eq!(response.status, 503);
        assert_eq!(response.headers.get("x-arango-endpoint").unwrap(), "http://h2:8529");
    }
}
