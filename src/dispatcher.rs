//! The connection pool's scheduler: task queue, host cursors, and the
//! submit / select-host / outcome-handling loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tracing::instrument;

use crate::config::{AgentOptions, ConnectionConfig, LoadBalancingStrategy, MaxRetries};
use crate::error::{PoolError, Result};
use crate::host_list::HostList;
use crate::response::interpret;
use crate::task::{PoolResponse, QueryString, RequestBody, RequestDescriptor, Task};
use crate::transport::{EndpointTransport, ReqwestEndpointTransport};

/// Guarded, mutable scheduler state. Every field here is touched only while
/// holding `Dispatcher::state`'s lock, and never across an `.await`.
struct State {
    hosts: HostList,
    queue: VecDeque<Task>,
    active_tasks: usize,
    primary_cursor: usize,
    dirty_cursor: usize,
    transaction_id: Option<String>,
}

/// The connection pool and request dispatcher fronting one or more
/// coordinators. Cheaply cloneable: internally reference-counted.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    max_tasks: usize,
    policy: LoadBalancingStrategy,
    max_retries: MaxRetries,
    agent_options: AgentOptions,
    arango_version: u32,
    default_headers: Mutex<HashMap<String, String>>,
    closed: AtomicBool,
}

impl Dispatcher {
    /// Builds a dispatcher from configuration, constructing one
    /// [`ReqwestEndpointTransport`] per URL.
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        if config.urls.is_empty() {
            return Err(PoolError::Config("at least one url is required".to_string()));
        }
        let agent_options = config.agent_options.clone();
        let mut hosts = HostList::new();
        hosts.add(&config.urls, |url| {
            Ok(Arc::new(ReqwestEndpointTransport::new(url, &agent_options)?) as Arc<dyn EndpointTransport>)
        })?;
        Self::from_host_list(hosts, config)
    }

    /// Builds a dispatcher over an already-populated [`HostList`] — the seam
    /// tests use to inject [`crate::transport::MockEndpointTransport`]s.
    pub fn from_host_list(hosts: HostList, config: ConnectionConfig) -> Result<Self> {
        let host_count = hosts.len();
        if host_count == 0 {
            return Err(PoolError::Config("at least one url is required".to_string()));
        }
        let (primary_cursor, dirty_cursor) = if config.load_balancing_strategy == LoadBalancingStrategy::OneRandom {
            let mut rng = rand::thread_rng();
            (rng.gen_range(0..host_count), rng.gen_range(0..host_count))
        } else {
            (0, 0)
        };

        let inner = Inner {
            max_tasks: config.agent_options.max_tasks(),
            policy: config.load_balancing_strategy,
            max_retries: config.max_retries,
            agent_options: config.agent_options,
            arango_version: config.arango_version,
            default_headers: Mutex::new(config.headers),
            closed: AtomicBool::new(false),
            state: Mutex::new(State {
                hosts,
                queue: VecDeque::new(),
                active_tasks: 0,
                primary_cursor,
                dirty_cursor,
            }),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn host_count(&self) -> usize {
        self.inner.state.lock().hosts.len()
    }

    pub fn set_header(&self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        let mut headers = self.inner.default_headers.lock();
        match value {
            Some(v) => {
                headers.insert(name, v);
            }
            None => {
                headers.remove(&name);
            }
        }
    }

    pub fn set_transaction_id(&self, id: impl Into<String>) {
        self.inner.state.lock().transaction_id = Some(id.into());
    }

    pub fn clear_transaction_id(&self) {
        self.inner.state.lock().transaction_id = None;
    }

    /// Best-effort socket release. New submissions after this are rejected.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let transports: Vec<Arc<dyn EndpointTransport>> = {
            let state = self.inner.state.lock();
            (0..state.hosts.len())
                .filter_map(|i| state.hosts.get(i))
                .map(|e| e.transport.clone())
                .collect()
        };
        for transport in transports {
            transport.close().await;
        }
    }

    /// Builds a [`Task`] from a caller's [`RequestDescriptor`] and submits it.
    #[instrument(skip(self, descriptor))]
    pub async fn request(&self, descriptor: RequestDescriptor) -> Result<PoolResponse> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        let (content_type, body) = match &descriptor.body {
            RequestBody::Empty => (None, Vec::new()),
            RequestBody::Json(value) => (Some("application/json"), serde_json::to_vec(value)?),
            RequestBody::Text(text) => (Some("text/plain"), text.clone().into_bytes()),
            RequestBody::Binary(bytes) => (Some("application/octet-stream"), bytes.clone()),
        };

        let mut headers = self.inner.default_headers.lock().clone();
        headers.insert("x-arango-version".to_string(), self.inner.arango_version.to_string());
        if let Some(ct) = content_type {
            headers.insert("content-type".to_string(), ct.to_string());
        }
        if let Some(trx) = self.inner.state.lock().transaction_id.clone() {
            headers.insert("x-arango-trx-id".to_string(), trx);
        }
        if descriptor.allow_dirty_read {
            headers.insert("x-arango-allow-dirty-read".to_string(), "true".to_string());
        }
        for (name, value) in &descriptor.headers {
            headers.insert(name.clone(), value.clone());
        }

        let path = format!(
            "{}{}",
            descriptor.base_path.as_deref().unwrap_or(""),
            descriptor.path.as_deref().unwrap_or("")
        );
        let query = descriptor.qs.as_ref().map(QueryString::encode);

        let (tx, rx) = oneshot::channel();
        let task = Task {
            method: descriptor.method,
            path,
            query,
            headers,
            body,
            expect_binary: descriptor.expect_binary,
            timeout: descriptor.timeout,
            allow_dirty_read: descriptor.allow_dirty_read,
            host_pin: descriptor.host,
            retries: 0,
            sink: Some(tx),
        };

        self.submit(task);
        rx.await.map_err(|_| PoolError::Closed)?
    }

    fn submit(&self, task: Task) {
        self.inner.state.lock().queue.push_back(task);
        self.pump();
    }

    /// Drains the queue while there is spare concurrency, dispatching each
    /// task to its transport on a spawned task so the scheduler lock is never
    /// held across network I/O.
    fn pump(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        loop {
            let (task, host_index, transport) = {
                let mut state = self.inner.state.lock();
                if state.active_tasks >= self.inner.max_tasks || state.queue.is_empty() {
                    return;
                }
                let mut task = state.queue.pop_front().expect("checked non-empty above");
                let host_index = self.select_host(&mut state, &mut task);
                let transport = match state.hosts.get(host_index) {
                    Some(endpoint) => endpoint.transport.clone(),
                    None => {
                        drop(state);
                        self.resolve(task, Err(PoolError::NoSuchHost(host_index)));
                        continue;
                    }
                };
                state.active_tasks += 1;
                (task, host_index, transport)
            };

            let dispatcher = self.clone();
            tokio::spawn(async move {
                let prepared = task.prepared_request();
                let result = transport.execute(prepared).await;
                dispatcher.handle_outcome(task, host_index, result);
            });
        }
    }

    /// Picks the host index for `task`, honoring pins, dirty-read routing,
    /// and the configured load-balancing strategy. Mutates cursors as needed.
    fn select_host(&self, state: &mut State, task: &mut Task) -> usize {
        if let Some(pinned) = task.host_pin {
            return pinned;
        }
        let host_count = state.hosts.len();
        if task.allow_dirty_read {
            let index = state.dirty_cursor;
            state.dirty_cursor = (state.dirty_cursor + 1) % host_count;
            return index;
        }
        let index = state.primary_cursor;
        if self.inner.policy == LoadBalancingStrategy::RoundRobin {
            state.primary_cursor = (state.primary_cursor + 1) % host_count;
        }
        index
    }

    fn handle_outcome(
        &self,
        task: Task,
        host_index: usize,
        result: Result<crate::transport::TransportResponse>,
    ) {
        {
            let mut state = self.inner.state.lock();
            state.active_tasks = state.active_tasks.saturating_sub(1);
        }

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.handle_transport_error(task, host_index, err);
                self.pump();
                return;
            }
        };

        if response.status == 503 {
            if let Some(endpoint_url) = response.headers.get("x-arango-endpoint").cloned() {
                self.handle_leader_redirect(task, host_index, &endpoint_url);
                self.pump();
                return;
            }
        }

        let expect_binary = task.expect_binary;
        let outcome = interpret(response, expect_binary).map(|(status, envelope)| PoolResponse {
            status,
            host: host_index,
            body: envelope,
        });
        self.resolve(task, outcome);
        self.pump();
    }

    fn handle_transport_error(&self, mut task: Task, host_index: usize, err: PoolError) {
        let use_failover = self.inner.policy != LoadBalancingStrategy::RoundRobin;
        let eligible = {
            let mut state = self.inner.state.lock();
            let host_count = state.hosts.len();

            if use_failover && host_count > 1 && !task.allow_dirty_read && state.primary_cursor == host_index {
                state.primary_cursor = (state.primary_cursor + 1) % host_count;
            }

            let bound = self.inner.max_retries.effective_bound(host_count);
            err.is_connection_refused()
                && task.host_pin.is_none()
                && bound.map(|max| task.retries < max).unwrap_or(false)
        };

        if eligible {
            task.retries += 1;
            self.inner.state.lock().queue.push_back(task);
        } else {
            self.resolve(task, Err(err));
        }
    }

    fn handle_leader_redirect(&self, mut task: Task, host_index: usize, endpoint_url: &str) {
        let new_index = {
            let mut state = self.inner.state.lock();
            let agent_options = self.inner.agent_options.clone();
            let endpoint_url = endpoint_url.to_string();
            let index = match state.hosts.add_one(&endpoint_url, move |url| {
                Ok(Arc::new(ReqwestEndpointTransport::new(url, &agent_options)?) as Arc<dyn EndpointTransport>)
            }) {
                Ok(index) => index,
                Err(err) => {
                    drop(state);
                    self.resolve(task, Err(err));
                    return;
                }
            };
            if state.primary_cursor == host_index {
                state.primary_cursor = index;
            }
            index
        };
        task.host_pin = Some(new_index);
        self.inner.state.lock().queue.push_back(task);
    }

    fn resolve(&self, mut task: Task, result: Result<PoolResponse>) {
        if let Some(sink) = task.sink.take() {
            let _ = sink.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{RequestBody, RequestDescriptor};
    use crate::transport::MockEndpointTransport;
    use std::collections::HashMap as StdHashMap;

    fn build(
        mocks: Vec<Arc<MockEndpointTransport>>,
        strategy: LoadBalancingStrategy,
        max_retries: MaxRetries,
    ) -> Dispatcher {
        let mut hosts = HostList::new();
        let mut mocks = mocks.into_iter();
        for i in 0.. {
            let Some(mock) = mocks.next() else { break };
            let url = format!("mock://h{i}");
            hosts
                .add_one(&url, move |_| Ok(mock.clone() as Arc<dyn EndpointTransport>))
                .unwrap();
        }
        let config = ConnectionConfig {
            urls: vec![],
            load_balancing_strategy: strategy,
            max_retries,
            ..ConnectionConfig::default()
        };
        Dispatcher::from_host_list(hosts, config).unwrap()
    }

    fn ok_json(status: u16, body: &str) -> Result<crate::transport::TransportResponse> {
        let mut headers = StdHashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Ok(crate::transport::TransportResponse {
            status,
            headers,
            body: body.as_bytes().to_vec(),
        })
    }

    #[tokio::test]
    async fn single_host_happy_path() {
        let mock = Arc::new(MockEndpointTransport::new());
        mock.add_response(
            &reqwest::Method::GET,
            "/_api/version",
            ok_json(200, r#"{"version":"3.7.0","server":"arango"}"#),
        );
        let dispatcher = build(vec![mock], LoadBalancingStrategy::None, MaxRetries::default());

        let response = dispatcher
            .request(RequestDescriptor::new(reqwest::Method::GET, "/_api/version"))
            .await
            .unwrap();
        assert_eq!(response.body.as_json().unwrap()["version"], "3.7.0");
    }

    #[tokio::test]
    async fn round_robin_distribution_wraps_cursor() {
        let mocks: Vec<_> = (0..3).map(|_| Arc::new(MockEndpointTransport::new())).collect();
        for mock in &mocks {
            mock.add_response(&reqwest::Method::GET, "/ping", ok_json(200, "{}"));
        }
        let dispatcher = build(mocks.clone(), LoadBalancingStrategy::RoundRobin, MaxRetries::default());

        for _ in 0..3 {
            dispatcher
                .request(RequestDescriptor::new(reqwest::Method::GET, "/ping"))
                .await
                .unwrap();
        }

        for mock in &mocks {
            assert_eq!(mock.call_count(), 1);
        }
        assert_eq!(dispatcher.inner.state.lock().primary_cursor, 0);
    }

    #[tokio::test]
    async fn failover_on_connection_refused() {
        let h1 = Arc::new(MockEndpointTransport::new());
        let h2 = Arc::new(MockEndpointTransport::new());
        h1.add_response(
            &reqwest::Method::GET,
            "/ping",
            Err(PoolError::ConnectionRefused { host: "h1".to_string() }),
        );
        h2.add_response(&reqwest::Method::GET, "/ping", ok_json(200, "{}"));
        let dispatcher = build(
            vec![h1.clone(), h2.clone()],
            LoadBalancingStrategy::None,
            MaxRetries::default(),
        );

        let response = dispatcher
            .request(RequestDescriptor::new(reqwest::Method::GET, "/ping"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(h1.call_count(), 1);
        assert_eq!(h2.call_count(), 1);
    }

    #[tokio::test]
    async fn leader_redirect_pins_and_moves_cursor() {
        let h1 = Arc::new(MockEndpointTransport::new());
        let mut headers = StdHashMap::new();
        headers.insert("x-arango-endpoint".to_string(), "mock://h2".to_string());
        h1.add_response(
            &reqwest::Method::POST,
            "/_api/document/c",
            Ok(crate::transport::TransportResponse {
                status: 503,
                headers,
                body: Vec::new(),
            }),
        );
        let dispatcher = build(vec![h1.clone()], LoadBalancingStrategy::None, MaxRetries::default());

        {
            let mut state = dispatcher.inner.state.lock();
            let h2 = Arc::new(MockEndpointTransport::new());
            h2.add_response(&reqwest::Method::POST, "/_api/document/c", ok_json(202, "{}"));
            state
                .hosts
                .add_one("mock://h2", move |_| Ok(h2.clone() as Arc<dyn EndpointTransport>))
                .unwrap();
        }

        let response = dispatcher
            .request(RequestDescriptor::new(reqwest::Method::POST, "/_api/document/c"))
            .await
            .unwrap();
        assert_eq!(response.status, 202);
        assert_eq!(dispatcher.host_count(), 2);
        assert_eq!(dispatcher.inner.state.lock().primary_cursor, 1);
    }

    #[tokio::test]
    async fn domain_error_passthrough() {
        let mock = Arc::new(MockEndpointTransport::new());
        mock.add_response(
            &reqwest::Method::GET,
            "/_api/collection/missing",
            ok_json(
                404,
                r#"{"error":true,"code":404,"errorMessage":"collection not found","errorNum":1203}"#,
            ),
        );
        let dispatcher = build(vec![mock], LoadBalancingStrategy::None, MaxRetries::default());

        let err = dispatcher
            .request(RequestDescriptor::new(reqwest::Method::GET, "/_api/collection/missing"))
            .await
            .unwrap_err();
        match err {
            PoolError::Arango(e) => assert_eq!(e.error_num, 1203),
            other => panic!("expected Arango error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dirty_read_fanout_leaves_primary_cursor_untouched() {
        let mocks: Vec<_> = (0..3).map(|_| Arc::new(MockEndpointTransport::new())).collect();
        for mock in &mocks {
            mock.add_response(&reqwest::Method::GET, "/read", ok_json(200, "{}"));
        }
        let dispatcher = build(mocks.clone(), LoadBalancingStrategy::None, MaxRetries::default());

        for _ in 0..3 {
            dispatcher
                .request(RequestDescriptor::new(reqwest::Method::GET, "/read").allow_dirty_read())
                .await
                .unwrap();
        }

        for mock in &mocks {
            assert_eq!(mock.call_count(), 1);
        }
        assert_eq!(dispatcher.inner.state.lock().primary_cursor, 0);

        mocks[0].add_response(&reqwest::Method::GET, "/plain", ok_json(200, "{}"));
        dispatcher
            .request(RequestDescriptor::new(reqwest::Method::GET, "/plain"))
            .await
            .unwrap();
        assert_eq!(mocks[0].call_count(), 2);
        assert_eq!(mocks[1].call_count(), 1);
        assert_eq!(mocks[2].call_count(), 1);
    }

    #[tokio::test]
    async fn max_retries_zero_with_one_host_surfaces_immediately() {
        let mock = Arc::new(MockEndpointTransport::new());
        mock.add_response(
            &reqwest::Method::GET,
            "/ping",
            Err(PoolError::ConnectionRefused { host: "h1".to_string() }),
        );
        let dispatcher = build(vec![mock.clone()], LoadBalancingStrategy::None, MaxRetries::default());

        let err = dispatcher
            .request(RequestDescriptor::new(reqwest::Method::GET, "/ping"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::ConnectionRefused { .. }));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn default_max_retries_bounds_to_hosts_minus_one() {
        let mocks: Vec<_> = (0..3).map(|_| Arc::new(MockEndpointTransport::new())).collect();
        for mock in &mocks {
            mock.add_response(
                &reqwest::Method::GET,
                "/ping",
                Err(PoolError::ConnectionRefused { host: "x".to_string() }),
            );
        }
        let dispatcher = build(mocks.clone(), LoadBalancingStrategy::None, MaxRetries::default());

        let err = dispatcher
            .request(RequestDescriptor::new(reqwest::Method::GET, "/ping"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::ConnectionRefused { .. }));
        for mock in &mocks {
            assert_eq!(mock.call_count(), 1);
        }
    }

    #[tokio::test]
    async fn max_retries_disabled_never_retries() {
        let h1 = Arc::new(MockEndpointTransport::new());
        let h2 = Arc::new(MockEndpointTransport::new());
        h1.add_response(
            &reqwest::Method::GET,
            "/ping",
            Err(PoolError::ConnectionRefused { host: "h1".to_string() }),
        );
        h2.add_response(&reqwest::Method::GET, "/ping", ok_json(200, "{}"));
        let dispatcher = build(
            vec![h1.clone(), h2.clone()],
            LoadBalancingStrategy::None,
            MaxRetries::Disabled,
        );

        let err = dispatcher
            .request(RequestDescriptor::new(reqwest::Method::GET, "/ping"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::ConnectionRefused { .. }));
        assert_eq!(h1.call_count(), 1);
        assert_eq!(h2.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_queue_pump_is_a_no_op() {
        let mock = Arc::new(MockEndpointTransport::new());
        let dispatcher = build(vec![mock], LoadBalancingStrategy::None, MaxRetries::default());
        dispatcher.pump();
        assert_eq!(dispatcher.inner.state.lock().active_tasks, 0);
    }

    #[tokio::test]
    async fn close_rejects_new_submissions() {
        let mock = Arc::new(MockEndpointTransport::new());
        let dispatcher = build(vec![mock], LoadBalancingStrategy::None, MaxRetries::default());
        dispatcher.close().await;
        let err = dispatcher
            .request(RequestDescriptor::new(reqwest::Method::GET, "/ping"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Closed));
    }

    #[tokio::test]
    async fn host_pinned_task_never_fails_over() {
        let h1 = Arc::new(MockEndpointTransport::new());
        let h2 = Arc::new(MockEndpointTransport::new());
        h1.add_response(
            &reqwest::Method::GET,
            "/cursor/1",
            Err(PoolError::ConnectionRefused { host: "h1".to_string() }),
        );
        let dispatcher = build(
            vec![h1.clone(), h2.clone()],
            LoadBalancingStrategy::None,
            MaxRetries::default(),
        );

        let err = dispatcher
            .request(RequestDescriptor::new(reqwest::Method::GET, "/cursor/1").with_host(0))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::ConnectionRefused { .. }));
        assert_eq!(h1.call_count(), 1);
        assert_eq!(h2.call_count(), 0);
    }

    #[tokio::test]
    async fn parse_error_carries_raw_bytes() {
        let mock = Arc::new(MockEndpointTransport::new());
        let mut headers = StdHashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        mock.add_response(
            &reqwest::Method::GET,
            "/broken",
            Ok(crate::transport::TransportResponse {
                status: 200,
                headers,
                body: b"{not json".to_vec(),
            }),
        );
        let dispatcher = build(vec![mock], LoadBalancingStrategy::None, MaxRetries::default());

        let err = dispatcher
            .request(RequestDescriptor::new(reqwest::Method::GET, "/broken"))
            .await
            .unwrap_err();
        match err {
            PoolError::Parse { raw, .. } => assert_eq!(raw, b"{not json"),
            other => panic!("expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn request_body_variant_selects_content_type() {
        // RequestBody content-type selection is exercised end-to-end via the
        // happy-path test above; this just documents the mapping used in
        // `Dispatcher::request`.
        let empty = RequestBody::Empty;
        let json = RequestBody::Json(serde_json::json!({"a":1}));
        assert!(matches!(empty, RequestBody::Empty));
        assert!(matches!(json, RequestBody::Json(_)));
    }
}
