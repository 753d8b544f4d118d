//! An HTTP reverse proxy with health-polled, ranked backend selection
//! and per-request failover, built on [Hyper].
//!
//! Requests flow through three stages:
//!
//! 1. The [`server`] accept loop wraps every inbound request into a
//!    [`RequestData`] and pushes it onto the shared [`RequestQueue`].
//! 2. A fixed pool of [`ProxyWorker`]s takes requests off the queue and
//!    tries the active backends best first, failing over on redirects,
//!    server errors, transport errors and timeouts.
//! 3. The [`BackendPool`] probes every backend on an interval and
//!    republishes the active set, ranked by latency penalised for
//!    failures.
//!
//! [Hyper]: https://hyper.rs/

pub mod config;
pub mod dns;
pub mod error;
pub mod headers;
pub mod pool;
pub mod proxy;
pub mod queue;
pub mod request;
pub mod ring;
pub mod server;
pub mod shutdown;
pub mod telemetry;
pub mod tls;
pub mod upstream;

pub use config::{Config, HostConfig, RuntimeConfig};
pub use dns::HostResolver;
pub use error::{ProxyError, NO_ACTIVE_HOSTS_BODY};
pub use pool::{BackendPool, PollSettings};
pub use proxy::{
    build_client, build_https_client, spawn_workers, BackendConnector, HttpClient, HttpsClient,
    ProxyWorker,
};
pub use queue::RequestQueue;
pub use request::{ProxyData, RequestData};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use telemetry::{EventLog, EventSink, Telemetry, TracingTelemetry};
pub use upstream::BackendHost;

/// An alias to simplify the calls to `Box<dyn std::error::Error + Send + Sync>`.
pub type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased inbound request body.
///
/// Lets a [`RequestData`] hold any body implementation (`Incoming` from
/// the listener, `Full` or `Empty` in tests) behind one type.
pub type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, StdError>;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, ProxyError>;
