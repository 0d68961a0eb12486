//! Host-header resolution: which service or tunnel answers a request.

use crate::config::{Config, Service};
use crate::tunnel::SshTunnel;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of resolving a Host header.
pub enum Route<'a> {
    /// A configured service, by name
    Service(&'a str, &'a Service),
    /// An alt-host tunnel
    Tunnel(&'a Arc<SshTunnel>),
    /// Nothing answers this host
    NotFound,
}

/// Stateless resolver over the immutable config and the tunnel table.
///
/// Matching is case-sensitive on exact labels, mirroring the subdomain index.
pub struct Router {
    config: Arc<Config>,
    tunnels: HashMap<String, Arc<SshTunnel>>,
}

impl Router {
    pub fn new(config: Arc<Config>, tunnels: HashMap<String, Arc<SshTunnel>>) -> Self {
        Self { config, tunnels }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn tunnels(&self) -> impl Iterator<Item = &Arc<SshTunnel>> {
        self.tunnels.values()
    }

    /// Resolve a raw Host header to a route.
    ///
    /// An alt-host match on the full (port-stripped) host wins. Otherwise the
    /// subdomain is the label left of the configured parent domain, "" for the
    /// apex, or the leftmost dot label of an unrelated host.
    pub fn resolve<'a>(&'a self, host: &str) -> Route<'a> {
        let host = host.split(':').next().unwrap_or(host);

        if let Some(tunnel) = self.tunnels.get(host) {
            return Route::Tunnel(tunnel);
        }

        let subdomain = subdomain_of(host, &self.config.domain);
        match self.config.service_by_subdomain(subdomain) {
            Some((name, service)) => Route::Service(name, service),
            None => Route::NotFound,
        }
    }
}

/// Extract the subdomain label the routing table is keyed by.
fn subdomain_of<'a>(host: &'a str, domain: &str) -> &'a str {
    if !domain.is_empty() {
        if let Some(prefix) = host.strip_suffix(domain) {
            if let Some(subdomain) = prefix.strip_suffix('.') {
                return subdomain;
            }
            if prefix.is_empty() {
                return "";
            }
        }
    }
    host.split('.').next().unwrap_or("")
}
