//! Configuration for leasehold

use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub groups: Vec<GroupConfig>,
    pub cache: CacheConfig,
    pub metrics: MetricsConfig,
}

/// One named consistent-hash group of shards
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Name the router is registered under
    pub name: String,

    /// Backend instances on the ring
    pub shards: Vec<ShardConfig>,
}

/// A single backend instance and its connection pool
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    pub host: String,
    pub port: u16,

    /// Password sent with AUTH (empty = none)
    pub auth: String,

    /// Database index selected on connect
    pub db: u8,

    /// Stable instance index, part of the ring identity
    pub index: u32,

    /// Extra ring nodes for this instance (it gets `virtual_count + 1` nodes)
    pub virtual_count: u32,

    /// Idle connections kept after a reap
    pub max_idle: usize,

    /// Maximum open connections
    pub max_active: usize,

    /// Wait for a free connection when the pool is exhausted (false = fail fast)
    pub wait: bool,

    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,

    /// Connections older than this are dropped on reap (0 = unlimited)
    pub max_conn_lifetime_secs: u64,

    /// Connections idle longer than this are dropped on reap (0 = unlimited)
    pub idle_timeout_secs: u64,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            auth: String::new(),
            db: 0,
            index: 0,
            virtual_count: 0,
            max_idle: 2,
            max_active: 8,
            wait: false,
            connect_timeout_ms: 1000,
            read_timeout_ms: 3000,
            write_timeout_ms: 3000,
            max_conn_lifetime_secs: 1200,
            idle_timeout_secs: 60,
        }
    }
}

impl ShardConfig {
    /// Shorthand for a shard at `host:port` with default pool settings
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Identity of the physical instance: `host:port-index`
    pub fn instance_id(&self) -> String {
        format!("{}:{}-{}", self.host, self.port, self.index)
    }

    /// Connection parameters for the redis driver. The password is passed
    /// as-is, never through a URL.
    pub fn connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                db: i64::from(self.db),
                password: (!self.auth.is_empty()).then(|| self.auth.clone()),
                ..Default::default()
            },
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.connect_timeout_ms)
    }

    /// Upper bound for one command round trip
    pub fn command_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.read_timeout_ms.saturating_add(self.write_timeout_ms))
    }

    pub fn max_conn_lifetime(&self) -> Option<Duration> {
        (self.max_conn_lifetime_secs > 0).then(|| Duration::from_secs(self.max_conn_lifetime_secs))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Reject options no pool can be built from
    pub fn validate(&self) -> crate::Result<()> {
        if self.host.is_empty() {
            return Err(crate::Error::Config("shard host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(crate::Error::Config(format!(
                "shard {} has port 0",
                self.host
            )));
        }
        if self.max_active == 0 {
            return Err(crate::Error::Config(format!(
                "shard {} has max_active = 0",
                self.instance_id()
            )));
        }
        Ok(())
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Cache and lock tuning shared by the cache layers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lease length for refresh locks, both remote and local
    pub lock_ttl_secs: u64,

    /// Remote expiry of a cache item; it outlives freshness so stale values can be served
    pub item_ttl_secs: u64,

    /// Poll interval while waiting for another caller's rebuild of a missing key
    pub miss_poll_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 5,
            item_ttl_secs: 86400,
            miss_poll_interval_ms: 25,
        }
    }
}

impl CacheConfig {
    pub fn miss_poll_interval(&self) -> Duration {
        Duration::from_millis(self.miss_poll_interval_ms.max(1))
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics collection
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml(contents: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables or use defaults
    ///
    /// Builds a single group named `LEASEHOLD_GROUP` (default `default`) from
    /// `LEASEHOLD_SHARDS`, a comma separated list of `host:port` entries.
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        let name = std::env::var("LEASEHOLD_GROUP").unwrap_or_else(|_| "default".to_string());
        let shards = std::env::var("LEASEHOLD_SHARDS").unwrap_or_else(|_| "127.0.0.1:6379".to_string());
        let virtual_count = std::env::var("LEASEHOLD_VIRTUAL_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let auth = std::env::var("LEASEHOLD_AUTH").unwrap_or_default();

        let mut group = GroupConfig {
            name,
            shards: Vec::new(),
        };
        for (index, endpoint) in shards.split(',').map(str::trim).filter(|s| !s.is_empty()).enumerate() {
            let (host, port) = parse_host_port(endpoint)?;
            group.shards.push(ShardConfig {
                index: index as u32,
                virtual_count,
                auth: auth.clone(),
                ..ShardConfig::new(host, port)
            });
        }
        config.groups.push(group);

        if let Ok(ttl) = std::env::var("LEASEHOLD_LOCK_TTL_SECS")
            && let Ok(n) = ttl.parse()
        {
            config.cache.lock_ttl_secs = n;
        }

        if let Ok(enabled) = std::env::var("LEASEHOLD_METRICS_ENABLED") {
            config.metrics.enabled = enabled.to_lowercase() == "true" || enabled == "1";
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every group and shard
    pub fn validate(&self) -> crate::Result<()> {
        for group in &self.groups {
            if group.shards.is_empty() {
                return Err(crate::Error::OptionEmpty);
            }
            for shard in &group.shards {
                shard.validate()?;
            }
        }
        Ok(())
    }
}

/// Parse a `host:port` string. If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> crate::Result<(&str, u16)> {
    let endpoint = endpoint
        .trim_start_matches("redis://")
        .split('/')
        .next()
        .unwrap_or(endpoint);

    if let Some((host, port)) = endpoint.rsplit_once(':') {
        let port = port
            .parse()
            .map_err(|_| crate::Error::Config(format!("invalid port in endpoint: {endpoint}")))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}
