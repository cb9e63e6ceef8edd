//! Transport seam between the session manager and the CLI child
//! process.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use devmesh_error::Result;
use tokio::sync::broadcast;

use super::envelope::CliEnvelope;

/// How to start a session's child process.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Working directory for the child.
    pub working_dir: PathBuf,
    /// Upstream session correlator to resume from, if any.
    pub resume: Option<String>,
    /// Model override.
    pub model: Option<String>,
    /// Extra CLI flags.
    pub flags: Vec<String>,
}

/// A live connection to one CLI child process.
#[async_trait]
pub trait CliTransport: Send + Sync {
    /// Write one protocol line to the child's stdin.
    async fn send_line(&self, line: String) -> Result<()>;

    /// Subscribe to parsed envelopes from the child's stdout/stderr.
    /// Every subscriber sees every envelope published after it
    /// subscribes.
    fn events(&self) -> broadcast::Receiver<CliEnvelope>;

    /// Graceful shutdown: polite signal, then forceful termination
    /// after `grace`.
    async fn shutdown(&self, grace: Duration) -> Result<()>;

    /// Whether the child is still running.
    fn is_alive(&self) -> bool;
}

/// Launches transports. The production implementation spawns the
/// configured CLI binary; tests substitute an in-memory fake.
#[async_trait]
pub trait CliLauncher: Send + Sync {
    /// Start a child process per `spec`.
    async fn launch(&self, spec: &LaunchSpec) -> Result<std::sync::Arc<dyn CliTransport>>;
}
