//! Git subgraph configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use devmesh_error::{DevmeshError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the git subgraph service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitServiceConfig {
    /// Bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Workspace root; every git operation is confined inside it.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// History depth for detailed scans.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Git binary to invoke.
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
}

impl Default for GitServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr:      default_bind_addr(),
            workspace_root: default_workspace_root(),
            history_limit:  default_history_limit(),
            git_binary:     default_git_binary(),
        }
    }
}

impl GitServiceConfig {
    /// Load configuration from the environment.
    ///
    /// Reads `GIT_SERVICE_PORT`, `GIT_SERVICE_HOST`, `WORKSPACE_ROOT`,
    /// and `GIT_BINARY`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unparseable values.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("GIT_SERVICE_PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| DevmeshError::config(format!("invalid GIT_SERVICE_PORT: {port}")))?;
            config.bind_addr.set_port(port);
        }
        if let Ok(host) = std::env::var("GIT_SERVICE_HOST") {
            let ip = host
                .parse()
                .map_err(|_| DevmeshError::config(format!("invalid GIT_SERVICE_HOST: {host}")))?;
            config.bind_addr.set_ip(ip);
        }
        if let Ok(root) = std::env::var("WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }
        if let Ok(binary) = std::env::var("GIT_BINARY") {
            config.git_binary = binary;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the workspace root is not
    /// absolute.
    pub fn validate(&self) -> Result<()> {
        if !self.workspace_root.is_absolute() {
            return Err(DevmeshError::config(format!(
                "WORKSPACE_ROOT must be absolute, got {}",
                self.workspace_root.display()
            )));
        }
        Ok(())
    }
}

fn default_bind_addr() -> SocketAddr {
    "127.0.0.1:4002".parse().expect("static addr")
}

fn default_workspace_root() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}

fn default_history_limit() -> usize {
    10
}

fn default_git_binary() -> String {
    "git".to_string()
}
