//! Name resolution for outbound connections.
//!
//! Backends configured with a literal IP keep their hostname in every
//! outbound URI, so the `Host` header and the TLS server name stay
//! correct. Only the connect step is redirected: [`HostResolver`]
//! answers lookups for overridden hostnames with the configured address
//! and hands every other name to the system resolver.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper_util::client::legacy::connect::dns::{GaiResolver, Name};
use tower_service::Service;
use tracing::debug;

use crate::upstream::BackendHost;

/// Resolver plugged into `HttpConnector::new_with_resolver`.
#[derive(Clone)]
pub struct HostResolver {
    overrides: Arc<HashMap<String, IpAddr>>,
    system: GaiResolver,
}

impl HostResolver {
    /// A resolver without overrides.
    pub fn new() -> Self {
        Self::with_overrides(HashMap::new())
    }

    /// Maps every host with an IP override to that address.
    pub fn from_hosts(hosts: &[Arc<BackendHost>]) -> Self {
        let overrides = hosts
            .iter()
            .filter_map(|host| host.ip().map(|ip| (host.host().to_ascii_lowercase(), ip)))
            .collect();
        Self::with_overrides(overrides)
    }

    fn with_overrides(overrides: HashMap<String, IpAddr>) -> Self {
        Self {
            overrides: Arc::new(overrides),
            system: GaiResolver::new(),
        }
    }

    /// The configured address for `hostname`, if any.
    pub fn lookup(&self, hostname: &str) -> Option<IpAddr> {
        self.overrides.get(&hostname.to_ascii_lowercase()).copied()
    }
}

impl Default for HostResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HostResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostResolver")
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

impl Service<Name> for HostResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        if let Some(ip) = self.lookup(name.as_str()) {
            debug!(host = name.as_str(), %ip, "using configured address");
            // Port 0 is replaced by the URI's port in the connector.
            let addrs = vec![SocketAddr::new(ip, 0)];
            return Box::pin(async move { Ok(addrs.into_iter()) });
        }

        let lookup = self.system.call(name);
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = lookup.await?.collect();
            Ok(addrs.into_iter())
        })
    }
}
