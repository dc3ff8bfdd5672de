//! Connection configuration types.

use crate::error::{CacheError, CacheResult};
use crate::invalidation::KeySpace;
use crate::servers::{self, HostSpec, PortSpec, ServerEndpoint};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name used when a configuration does not set one.
pub const DEFAULT_CONNECTION_NAME: &str = "default";

/// How intercepted failures reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Failures are logged and the operation returns its no-op value.
    #[default]
    Production,
    /// Failures are logged and then returned as `Err`.
    Development,
}

/// Backend-specific tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOptions {
    /// Compress large payloads
    pub compress: bool,
    /// Payloads shorter than this many bytes are never compressed
    pub compress_threshold: usize,
    /// Minimum fraction of bytes compression must save to be kept
    pub min_savings: f64,
    /// Consecutive backend failures before the connection disables itself (0 = never)
    pub failure_limit: u32,
    /// Probe servers at connect time and leave unreachable ones out of the pool
    pub remove_failed_servers: bool,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            compress: false,
            compress_threshold: 32_768,
            min_savings: 0.2,
            failure_limit: 0,
            remove_failed_servers: false,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// One logical cache connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connection name, the registry key
    pub name: String,

    /// Single host or host -> weight mapping
    #[serde(rename = "host")]
    pub hosts: HostSpec,

    /// Single port or ports aligned with the hosts
    #[serde(rename = "port")]
    pub ports: PortSpec,

    /// Namespace; every key is prefixed with `<database>:`
    pub database: Option<String>,

    /// Connect and I/O timeout, given in milliseconds in serialized form
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,

    /// Keep pooled connections alive between operations
    pub persistent: bool,

    /// Failure propagation policy
    pub mode: ExecutionMode,

    /// Backend tuning
    pub provider: ProviderOptions,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CONNECTION_NAME.to_string(),
            hosts: HostSpec::default(),
            ports: PortSpec::default(),
            database: None,
            timeout: Duration::from_millis(500),
            persistent: true,
            mode: ExecutionMode::Production,
            provider: ProviderOptions::default(),
        }
    }
}

impl ConnectionConfig {
    /// Configuration for a single memcached server.
    ///
    /// # Examples
    ///
    /// ```
    /// use memtag_cache::ConnectionConfig;
    ///
    /// let config = ConnectionConfig::memcached("10.0.0.5", 11211).unwrap();
    /// assert_eq!(config.name, "default");
    /// assert_eq!(config.servers().len(), 1);
    /// ```
    pub fn memcached(host: impl Into<String>, port: u16) -> CacheResult<Self> {
        Self::builder().host(host).port(port).build()
    }

    /// Create a builder starting from the defaults.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new()
    }

    /// Parse a JSON document and validate it.
    pub fn from_json(json: &str) -> CacheResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CacheError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `MEMTAG_CACHE_*` environment variables.
    ///
    /// `MEMTAG_CACHE_HOST` accepts `host` or `host1=weight,host2=weight`;
    /// `MEMTAG_CACHE_PORT` accepts `port` or `port1,port2`.
    pub fn from_env() -> CacheResult<ConnectionConfigBuilder> {
        let mut builder = ConnectionConfigBuilder::new();

        if let Ok(name) = std::env::var("MEMTAG_CACHE_NAME") {
            builder = builder.name(name);
        }

        if let Ok(hosts) = std::env::var("MEMTAG_CACHE_HOST") {
            builder = builder.hosts(parse_hosts(&hosts)?);
        }

        if let Ok(ports) = std::env::var("MEMTAG_CACHE_PORT") {
            builder = builder.ports(parse_ports(&ports)?);
        }

        if let Ok(database) = std::env::var("MEMTAG_CACHE_DATABASE") {
            builder = builder.database(database);
        }

        if let Ok(timeout) = std::env::var("MEMTAG_CACHE_TIMEOUT_MS") {
            let millis = timeout.trim().parse::<u64>().map_err(|e| {
                CacheError::Config(format!("MEMTAG_CACHE_TIMEOUT_MS '{}': {}", timeout, e))
            })?;
            builder = builder.timeout(Duration::from_millis(millis));
        }

        if let Ok(persistent) = std::env::var("MEMTAG_CACHE_PERSISTENT") {
            builder = builder.persistent(parse_flag(&persistent));
        }

        if let Ok(development) = std::env::var("MEMTAG_CACHE_DEVELOPMENT")
            && parse_flag(&development)
        {
            builder = builder.mode(ExecutionMode::Development);
        }

        if let Ok(compress) = std::env::var("MEMTAG_CACHE_COMPRESS") {
            builder = builder.compress(parse_flag(&compress));
        }

        Ok(builder)
    }

    /// Resolved server pool, in registration order.
    pub fn servers(&self) -> Vec<ServerEndpoint> {
        servers::resolve(&self.hosts, &self.ports)
    }

    /// Namespace prefix prepended to every backend key.
    pub fn key_prefix(&self) -> String {
        match &self.database {
            Some(database) if !database.is_empty() => format!("{}:", database),
            _ => String::new(),
        }
    }

    /// Key space derived from the namespace prefix.
    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.key_prefix())
    }

    /// Whether failures are returned to the caller.
    pub fn is_development(&self) -> bool {
        self.mode == ExecutionMode::Development
    }

    /// Check value ranges. Host/port shape mismatches are not errors.
    pub fn validate(&self) -> CacheResult<()> {
        if self.name.trim().is_empty() {
            return Err(CacheError::Config("connection name must not be empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(CacheError::Config("timeout must be greater than zero".into()));
        }
        let savings = self.provider.min_savings;
        if !(0.0..1.0).contains(&savings) {
            return Err(CacheError::Config(format!(
                "min_savings must be within [0, 1), got {}",
                savings
            )));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    let value = value.trim();
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}

fn parse_hosts(raw: &str) -> CacheResult<HostSpec> {
    if !raw.contains(',') && !raw.contains('=') {
        return Ok(HostSpec::Single(raw.trim().to_string()));
    }

    let mut hosts = indexmap::IndexMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (host, weight) = match entry.split_once('=') {
            Some((host, weight)) => {
                let weight = weight.trim().parse::<u32>().map_err(|e| {
                    CacheError::Config(format!("invalid weight for host '{}': {}", host, e))
                })?;
                (host.trim(), weight)
            }
            None => (entry, 1),
        };
        hosts.insert(host.to_string(), weight);
    }
    Ok(HostSpec::Weighted(hosts))
}

fn parse_ports(raw: &str) -> CacheResult<PortSpec> {
    let ports = raw
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<u16>()
                .map_err(|e| CacheError::Config(format!("invalid port '{}': {}", p, e)))
        })
        .collect::<CacheResult<Vec<u16>>>()?;

    match ports.as_slice() {
        [single] if !raw.contains(',') => Ok(PortSpec::Single(*single)),
        _ => Ok(PortSpec::List(ports)),
    }
}

/// Builder for [`ConnectionConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Use a single host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.hosts = HostSpec::Single(host.into());
        self
    }

    /// Set the host specification.
    pub fn hosts(mut self, hosts: HostSpec) -> Self {
        self.config.hosts = hosts;
        self
    }

    /// Use one port for every host.
    pub fn port(mut self, port: u16) -> Self {
        self.config.ports = PortSpec::Single(port);
        self
    }

    /// Set the port specification.
    pub fn ports(mut self, ports: impl Into<PortSpec>) -> Self {
        self.config.ports = ports.into();
        self
    }

    /// Set the namespace.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    /// Set the connection timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Keep pooled connections alive.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.config.persistent = persistent;
        self
    }

    /// Set the failure propagation policy.
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Shorthand for [`ExecutionMode::Development`].
    pub fn development(self) -> Self {
        self.mode(ExecutionMode::Development)
    }

    /// Enable or disable payload compression.
    pub fn compress(mut self, compress: bool) -> Self {
        self.config.provider.compress = compress;
        self
    }

    /// Compression threshold and minimum savings ratio.
    pub fn compression(mut self, threshold: usize, min_savings: f64) -> Self {
        self.config.provider.compress = true;
        self.config.provider.compress_threshold = threshold;
        self.config.provider.min_savings = min_savings;
        self
    }

    /// Consecutive failures tolerated before disabling the connection.
    pub fn failure_limit(mut self, limit: u32) -> Self {
        self.config.provider.failure_limit = limit;
        self
    }

    /// Drop unreachable servers from the pool at connect time.
    pub fn remove_failed_servers(mut self, remove: bool) -> Self {
        self.config.provider.remove_failed_servers = remove;
        self
    }

    /// Replace all provider options at once.
    pub fn provider(mut self, provider: ProviderOptions) -> Self {
        self.config.provider = provider;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> CacheResult<ConnectionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
