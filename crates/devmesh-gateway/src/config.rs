//! Gateway configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use devmesh_error::{DevmeshError, Result};
use serde::{Deserialize, Serialize};

/// One registered subgraph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgraphEndpoint {
    /// Subgraph name (stable; used in error extensions and cache
    /// origin sets).
    pub name: String,
    /// Base URL (e.g. `http://127.0.0.1:4002`); the gateway appends
    /// `/graphql` and `/graphql/stream`.
    pub url: String,
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Registered subgraphs.
    #[serde(default)]
    pub subgraphs: Vec<SubgraphEndpoint>,

    /// Recomposition interval (seconds).
    #[serde(default = "default_recompose_secs")]
    pub recompose_interval_secs: u64,

    /// Per-subgraph call timeout (seconds).
    #[serde(default = "default_subgraph_timeout_secs")]
    pub subgraph_timeout_secs: u64,

    /// Maximum operation depth.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Maximum alias count per operation.
    #[serde(default = "default_max_aliases")]
    pub max_aliases: usize,

    /// Maximum request body size in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Requests per minute per client IP.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: usize,

    /// Entity reference chasing bound.
    #[serde(default = "default_entity_depth")]
    pub max_entity_depth: usize,

    /// Subscription buffer size in frames.
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,

    /// Subscription idle timeout (seconds).
    #[serde(default = "default_subscription_idle_secs")]
    pub subscription_idle_secs: u64,

    /// Default cache TTL (seconds).
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_default_ttl_secs: u64,

    /// Per-operation TTL overrides, keyed by top-level field name.
    #[serde(default = "default_cache_ttl_table")]
    pub cache_ttl_table: HashMap<String, u64>,

    /// Response cache capacity (entries).
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// CORS allowed origins; empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Expose introspection/landing page (disabled in production).
    #[serde(default = "default_true")]
    pub introspection_enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr:               default_bind_addr(),
            subgraphs:               Vec::new(),
            recompose_interval_secs: default_recompose_secs(),
            subgraph_timeout_secs:   default_subgraph_timeout_secs(),
            max_depth:               default_max_depth(),
            max_aliases:             default_max_aliases(),
            max_body_bytes:          default_max_body_bytes(),
            rate_limit_per_minute:   default_rate_limit(),
            max_entity_depth:        default_entity_depth(),
            subscription_buffer:     default_subscription_buffer(),
            subscription_idle_secs:  default_subscription_idle_secs(),
            cache_default_ttl_secs:  default_cache_ttl_secs(),
            cache_ttl_table:         default_cache_ttl_table(),
            cache_capacity:          default_cache_capacity(),
            cors_origins:            Vec::new(),
            introspection_enabled:   true,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the environment.
    ///
    /// `GATEWAY_PORT`, `GATEWAY_HOST`, `GIT_SERVICE_URL`,
    /// `AGENT_SERVICE_URL`, `QUALITY_SERVICE_URL`, `CORS_ORIGIN`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unparseable values or when no
    /// subgraph URL is configured.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("GATEWAY_PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| DevmeshError::config(format!("invalid GATEWAY_PORT: {port}")))?;
            config.bind_addr.set_port(port);
        }
        if let Ok(host) = std::env::var("GATEWAY_HOST") {
            let ip = host
                .parse()
                .map_err(|_| DevmeshError::config(format!("invalid GATEWAY_HOST: {host}")))?;
            config.bind_addr.set_ip(ip);
        }

        for (name, var) in [
            ("git", "GIT_SERVICE_URL"),
            ("claude-agent", "AGENT_SERVICE_URL"),
            ("quality", "QUALITY_SERVICE_URL"),
        ] {
            if let Ok(url) = std::env::var(var) {
                config.subgraphs.push(SubgraphEndpoint {
                    name: name.to_string(),
                    url,
                });
            }
        }
        if config.subgraphs.is_empty() {
            return Err(DevmeshError::config(
                "no subgraphs configured; set GIT_SERVICE_URL / AGENT_SERVICE_URL / QUALITY_SERVICE_URL",
            ));
        }

        if let Ok(origins) = std::env::var("CORS_ORIGIN") {
            config.cors_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(env) = std::env::var("NODE_ENV").or_else(|_| std::env::var("ENVIRONMENT")) {
            if env == "production" {
                config.introspection_enabled = false;
            }
        }

        Ok(config)
    }

    /// Recomposition interval.
    #[must_use]
    pub const fn recompose_interval(&self) -> Duration {
        Duration::from_secs(self.recompose_interval_secs)
    }

    /// Subgraph call timeout.
    #[must_use]
    pub const fn subgraph_timeout(&self) -> Duration {
        Duration::from_secs(self.subgraph_timeout_secs)
    }

    /// TTL for a set of top-level fields: the tightest field TTL wins.
    #[must_use]
    pub fn ttl_for_fields<'a>(&self, fields: impl Iterator<Item = &'a str>) -> Duration {
        let mut ttl = self.cache_default_ttl_secs;
        for field in fields {
            if let Some(field_ttl) = self.cache_ttl_table.get(field) {
                ttl = ttl.min(*field_ttl);
            }
        }
        Duration::from_secs(ttl)
    }
}

fn default_bind_addr() -> SocketAddr {
    "127.0.0.1:4000".parse().expect("static addr")
}

fn default_recompose_secs() -> u64 {
    30
}

fn default_subgraph_timeout_secs() -> u64 {
    30
}

fn default_max_depth() -> usize {
    15
}

fn default_max_aliases() -> usize {
    30
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_rate_limit() -> usize {
    100
}

fn default_entity_depth() -> usize {
    3
}

fn default_subscription_buffer() -> usize {
    256
}

fn default_subscription_idle_secs() -> u64 {
    600
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_cache_ttl_table() -> HashMap<String, u64> {
    // Status-like queries stay fresh; expensive scans cache longer.
    let mut table = HashMap::new();
    table.insert("repoAgentHealth".to_string(), 5);
    table.insert("claudeHealth".to_string(), 5);
    table.insert("qualityHealth".to_string(), 5);
    table.insert("sessionStatistics".to_string(), 5);
    table.insert("preWarmMetrics".to_string(), 5);
    table.insert("scanAllRepositories".to_string(), 30);
    table.insert("scanAllDetailed".to_string(), 300);
    table
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = GatewayConfig::default();
        assert_eq!(config.max_depth, 15);
        assert_eq!(config.subgraph_timeout_secs, 30);
        assert_eq!(config.recompose_interval_secs, 30);
        assert_eq!(config.rate_limit_per_minute, 100);
        assert_eq!(config.max_entity_depth, 3);
        assert_eq!(config.subscription_buffer, 256);
        assert_eq!(config.cache_default_ttl_secs, 60);
    }

    #[test]
    fn test_ttl_table_minimum_wins() {
        let config = GatewayConfig::default();
        let ttl = config.ttl_for_fields(["scanAllDetailed", "repoAgentHealth"].into_iter());
        assert_eq!(ttl, Duration::from_secs(5));

        let ttl = config.ttl_for_fields(["scanAllDetailed"].into_iter());
        assert_eq!(ttl, Duration::from_secs(300));

        let ttl = config.ttl_for_fields(["unknownField"].into_iter());
        assert_eq!(ttl, Duration::from_secs(60));
    }
}
