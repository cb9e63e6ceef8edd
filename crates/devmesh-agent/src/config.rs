//! Agent subgraph configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use devmesh_error::{DevmeshError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the agent subgraph service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentServiceConfig {
    /// Bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Workspace root; default working directory for sessions and the
    /// location of `.handoffs/`.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Agent CLI binary.
    #[serde(default = "default_cli_binary")]
    pub cli_binary: String,

    /// Base arguments passed to every CLI launch.
    #[serde(default = "default_cli_args")]
    pub cli_args: Vec<String>,

    /// Default model for new sessions.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Pre-warm pool size.
    #[serde(default = "default_pool_size")]
    pub prewarm_pool_size: usize,

    /// Maximum age of a pre-warmed slot before replacement (seconds).
    #[serde(default = "default_max_session_age_secs")]
    pub max_session_age_secs: u64,

    /// Pre-warm maintenance interval (seconds).
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Warm-up handshake timeout (seconds).
    #[serde(default = "default_warmup_timeout_secs")]
    pub warmup_timeout_secs: u64,

    /// Global cap on in-flight commands.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_commands: usize,

    /// Rolling limit on command starts per second.
    #[serde(default = "default_rate_per_second")]
    pub max_commands_per_second: usize,

    /// Grace period before a child is force-killed (seconds).
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    /// Archive destination for archived sessions.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Batch result cache TTL (seconds).
    #[serde(default = "default_batch_cache_ttl_secs")]
    pub batch_cache_ttl_secs: u64,
}

impl Default for AgentServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr:               default_bind_addr(),
            workspace_root:          default_workspace_root(),
            cli_binary:              default_cli_binary(),
            cli_args:                default_cli_args(),
            default_model:           default_model(),
            prewarm_pool_size:       default_pool_size(),
            max_session_age_secs:    default_max_session_age_secs(),
            cleanup_interval_secs:   default_cleanup_interval_secs(),
            warmup_timeout_secs:     default_warmup_timeout_secs(),
            max_concurrent_commands: default_max_concurrent(),
            max_commands_per_second: default_rate_per_second(),
            kill_grace_secs:         default_kill_grace_secs(),
            archive_dir:             default_archive_dir(),
            batch_cache_ttl_secs:    default_batch_cache_ttl_secs(),
        }
    }
}

impl AgentServiceConfig {
    /// Load configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unparseable values.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("AGENT_SERVICE_PORT") {
            let port: u16 = port.parse().map_err(|_| {
                DevmeshError::config(format!("invalid AGENT_SERVICE_PORT: {port}"))
            })?;
            config.bind_addr.set_port(port);
        }
        if let Ok(host) = std::env::var("AGENT_SERVICE_HOST") {
            let ip = host
                .parse()
                .map_err(|_| DevmeshError::config(format!("invalid AGENT_SERVICE_HOST: {host}")))?;
            config.bind_addr.set_ip(ip);
        }
        if let Ok(root) = std::env::var("WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }
        if let Ok(binary) = std::env::var("AGENT_CLI_BINARY") {
            config.cli_binary = binary;
        }
        if let Ok(model) = std::env::var("AGENT_DEFAULT_MODEL") {
            config.default_model = model;
        }
        read_usize(&mut config.prewarm_pool_size, "PREWARM_POOL_SIZE")?;
        read_u64(&mut config.max_session_age_secs, "PREWARM_MAX_SESSION_AGE_SECS")?;
        read_u64(&mut config.cleanup_interval_secs, "PREWARM_CLEANUP_INTERVAL_SECS")?;
        read_u64(&mut config.warmup_timeout_secs, "PREWARM_WARMUP_TIMEOUT_SECS")?;
        read_usize(&mut config.max_concurrent_commands, "AGENT_MAX_CONCURRENT")?;
        read_usize(&mut config.max_commands_per_second, "AGENT_RATE_PER_SECOND")?;
        if let Ok(dir) = std::env::var("AGENT_ARCHIVE_DIR") {
            config.archive_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Kill grace period as a duration.
    #[must_use]
    pub const fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Handoff document directory (`<workspace>/.handoffs`).
    #[must_use]
    pub fn handoff_dir(&self) -> PathBuf {
        self.workspace_root.join(".handoffs")
    }
}

fn read_usize(target: &mut usize, var: &str) -> Result<()> {
    if let Ok(value) = std::env::var(var) {
        *target = value
            .parse()
            .map_err(|_| DevmeshError::config(format!("invalid {var}: {value}")))?;
    }
    Ok(())
}

fn read_u64(target: &mut u64, var: &str) -> Result<()> {
    if let Ok(value) = std::env::var(var) {
        *target = value
            .parse()
            .map_err(|_| DevmeshError::config(format!("invalid {var}: {value}")))?;
    }
    Ok(())
}

fn default_bind_addr() -> SocketAddr {
    "127.0.0.1:4001".parse().expect("static addr")
}

fn default_workspace_root() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}

fn default_cli_binary() -> String {
    "claude".to_string()
}

fn default_cli_args() -> Vec<String> {
    vec![
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--print".to_string(),
    ]
}

fn default_model() -> String {
    "sonnet".to_string()
}

fn default_pool_size() -> usize {
    3
}

fn default_max_session_age_secs() -> u64 {
    15 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_warmup_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent() -> usize {
    5
}

fn default_rate_per_second() -> usize {
    3
}

fn default_kill_grace_secs() -> u64 {
    5
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("/archives/sessions")
}

fn default_batch_cache_ttl_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = AgentServiceConfig::default();
        assert_eq!(config.prewarm_pool_size, 3);
        assert_eq!(config.max_concurrent_commands, 5);
        assert_eq!(config.max_commands_per_second, 3);
        assert_eq!(config.kill_grace_secs, 5);
        assert_eq!(config.cleanup_interval_secs, 60);
        assert_eq!(config.max_session_age_secs, 900);
        assert_eq!(config.batch_cache_ttl_secs, 300);
    }

    #[test]
    fn test_handoff_dir_under_workspace() {
        let config = AgentServiceConfig {
            workspace_root: PathBuf::from("/ws"),
            ..AgentServiceConfig::default()
        };
        assert_eq!(config.handoff_dir(), PathBuf::from("/ws/.handoffs"));
    }
}
