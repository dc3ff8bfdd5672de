//! Server pool resolution.
//!
//! Turns the declarative host/port configuration into the ordered list of
//! endpoints registered with the backend. Pure data transformation; shape
//! mismatches are normalized rather than rejected.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default memcached port.
pub const DEFAULT_PORT: u16 = 11211;

/// Host part of a connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostSpec {
    /// One server with weight 1.
    Single(String),
    /// Several servers, in order, with their distribution weights.
    Weighted(IndexMap<String, u32>),
}

impl Default for HostSpec {
    fn default() -> Self {
        HostSpec::Single("127.0.0.1".to_string())
    }
}

impl HostSpec {
    /// Build a weighted spec from `(host, weight)` pairs, keeping their order.
    pub fn weighted<I, H>(hosts: I) -> Self
    where
        I: IntoIterator<Item = (H, u32)>,
        H: Into<String>,
    {
        HostSpec::Weighted(hosts.into_iter().map(|(h, w)| (h.into(), w)).collect())
    }

    fn hosts(&self) -> Vec<(&str, u32)> {
        match self {
            HostSpec::Single(host) => vec![(host.as_str(), 1)],
            HostSpec::Weighted(map) => map
                .iter()
                .map(|(host, weight)| (host.as_str(), *weight))
                .collect(),
        }
    }
}

impl From<&str> for HostSpec {
    fn from(host: &str) -> Self {
        HostSpec::Single(host.to_string())
    }
}

impl From<String> for HostSpec {
    fn from(host: String) -> Self {
        HostSpec::Single(host)
    }
}

/// Port part of a connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// The same port for every host.
    Single(u16),
    /// Ports aligned positionally with the hosts.
    List(Vec<u16>),
}

impl Default for PortSpec {
    fn default() -> Self {
        PortSpec::Single(DEFAULT_PORT)
    }
}

impl From<u16> for PortSpec {
    fn from(port: u16) -> Self {
        PortSpec::Single(port)
    }
}

impl From<Vec<u16>> for PortSpec {
    fn from(ports: Vec<u16>) -> Self {
        PortSpec::List(ports)
    }
}

/// One resolved backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Distribution weight, interpreted by the backend
    pub weight: u32,
}

impl ServerEndpoint {
    /// Create a new endpoint.
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Connection URL understood by memcache clients.
    pub fn url(&self) -> String {
        format!("memcache://{}", self.address())
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (weight {})", self.address(), self.weight)
    }
}

/// Resolve a host and port specification into ordered endpoints.
///
/// A port list whose length differs from the host count is replaced by its
/// first port for every host. Ports are matched to hosts before blank hosts
/// are dropped. No hosts, or an empty port list, resolve to an empty pool
/// which the caller must treat as "cannot connect".
///
/// # Examples
///
/// ```
/// use memtag_cache::servers::{resolve, HostSpec, PortSpec, ServerEndpoint};
///
/// let hosts = HostSpec::weighted([("h1", 1), ("h2", 2)]);
/// let servers = resolve(&hosts, &PortSpec::List(vec![11211]));
///
/// assert_eq!(servers, vec![
///     ServerEndpoint::new("h1", 11211, 1),
///     ServerEndpoint::new("h2", 11211, 2),
/// ]);
/// ```
pub fn resolve(hosts: &HostSpec, ports: &PortSpec) -> Vec<ServerEndpoint> {
    let hosts = hosts.hosts();
    if hosts.is_empty() {
        return Vec::new();
    }

    let ports: Vec<u16> = match ports {
        PortSpec::Single(port) => vec![*port; hosts.len()],
        PortSpec::List(list) if list.is_empty() => return Vec::new(),
        PortSpec::List(list) if list.len() != hosts.len() => {
            memtag_log::debug!(
                target: "memtag::servers",
                "{} ports given for {} hosts, using port {} for every host",
                list.len(),
                hosts.len(),
                list[0]
            );
            vec![list[0]; hosts.len()]
        }
        PortSpec::List(list) => list.clone(),
    };

    hosts
        .into_iter()
        .zip(ports)
        .filter(|((host, _), _)| !host.trim().is_empty())
        .map(|((host, weight), port)| ServerEndpoint::new(host, port, weight))
        .collect()
}
