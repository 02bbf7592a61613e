//! Typed construction options for the connection pool.

use std::collections::HashMap;

/// How the dispatcher picks a host for an unpinned, non-dirty-read task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancingStrategy {
    /// Stick to one host until it fails, then fail over to the next.
    #[default]
    None,
    /// Rotate through hosts on every request.
    RoundRobin,
    /// Pick one host at random at construction time and stick to it (with failover).
    OneRandom,
}

/// Upper bound on transparent connection-refused retries.
///
/// `Default` (the server's implicit `0`) means "retry up to `hosts.len() - 1`
/// times"; `Bounded(n)` is an exact cap, not multiplied by host count;
/// `Disabled` turns transparent retry off entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxRetries {
    #[default]
    Default,
    Bounded(u32),
    Disabled,
}

impl MaxRetries {
    pub(crate) fn effective_bound(&self, host_count: usize) -> Option<u32> {
        match self {
            MaxRetries::Disabled => None,
            MaxRetries::Default => Some(host_count.saturating_sub(1) as u32),
            MaxRetries::Bounded(n) => Some(*n),
        }
    }
}

/// Socket pooling knobs, mirroring what an HTTP agent would expose.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub max_sockets: usize,
    pub keep_alive: bool,
    pub keep_alive_msecs: u64,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_sockets: 3,
            keep_alive: true,
            keep_alive_msecs: 1000,
        }
    }
}

impl AgentOptions {
    /// `maxTasks = maxSockets * (keepAlive ? 2 : 1)`.
    pub(crate) fn max_tasks(&self) -> usize {
        self.max_sockets * if self.keep_alive { 2 } else { 1 }
    }
}

/// Construction options for [`crate::Dispatcher`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub urls: Vec<String>,
    pub arango_version: u32,
    pub load_balancing_strategy: LoadBalancingStrategy,
    pub max_retries: MaxRetries,
    pub agent_options: AgentOptions,
    pub headers: HashMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            urls: vec!["http://localhost:8529".to_string()],
            arango_version: 30400,
            load_balancing_strategy: LoadBalancingStrategy::default(),
            max_retries: MaxRetries::default(),
            agent_options: AgentOptions::default(),
            headers: HashMap::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_urls(mut self, urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_load_balancing_strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.load_balancing_strategy = strategy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: MaxRetries) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_agent_options(mut self, agent_options: AgentOptions) -> Self {
        self.agent_options = agent_options;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}
