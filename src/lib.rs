//! A connection pool and request dispatcher for a multi-coordinator document
//! database's HTTP API.
//!
//! The [`Dispatcher`] owns a set of coordinator endpoints ([`HostList`]),
//! load-balances requests across them, transparently retries connection
//! failures, follows leader redirects, and classifies responses into
//! success, domain errors, and HTTP errors.
//!
//! # Example
//!
//! ```no_run
//! use arangopool::{ConnectionConfig, Dispatcher, LoadBalancingStrategy, RequestDescriptor};
//!
//! # async fn run() -> arangopool::Result<()> {
//! let config = ConnectionConfig::new()
//!     .with_urls(["http://localhost:8529"])
//!     .with_load_balancing_strategy(LoadBalancingStrategy::RoundRobin);
//! let dispatcher = Dispatcher::new(config)?;
//!
//! let response = dispatcher
//!     .request(RequestDescriptor::new(reqwest::Method::GET, "/_api/version"))
//!     .await?;
//! println!("status: {}", response.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod host_list;
pub mod response;
pub mod task;
pub mod transport;

pub use config::{AgentOptions, ConnectionConfig, LoadBalancingStrategy, MaxRetries};
pub use dispatcher::Dispatcher;
pub use error::{ArangoError, PoolError, Result};
pub use host_list::{normalize_url, HostList};
pub use response::ResponseEnvelope;
pub use task::{PoolResponse, QueryString, RequestBody, RequestDescriptor};
pub use transport::{EndpointTransport, MockEndpointTransport, PreparedRequest, ReqwestEndpointTransport, TransportResponse};
