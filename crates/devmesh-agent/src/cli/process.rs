//! Child-process transport: the production [`CliTransport`].

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devmesh_error::{DevmeshError, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::envelope::CliEnvelope;
use super::transport::{CliLauncher, CliTransport, LaunchSpec};

/// Channel capacity for parsed envelopes. Oversubscribed readers lag
/// rather than blocking the reader task.
const EVENT_CAPACITY: usize = 1024;

/// A transport wrapping a spawned CLI child process.
pub struct ChildProcessTransport {
    child:  Mutex<Option<Child>>,
    stdin:  tokio::sync::Mutex<Option<ChildStdin>>,
    events: broadcast::Sender<CliEnvelope>,
}

impl ChildProcessTransport {
    /// Spawn the CLI and wire its standard streams.
    ///
    /// # Errors
    ///
    /// Returns an upstream error if the process cannot be spawned.
    pub fn spawn(program: &str, args: &[String], spec: &LaunchSpec) -> Result<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .args(&spec.flags)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(model) = &spec.model {
            command.arg("--model").arg(model);
        }
        if let Some(resume) = &spec.resume {
            command.arg("--resume").arg(resume);
        }

        let mut child = command
            .spawn()
            .map_err(|e| DevmeshError::upstream(format!("failed to spawn agent CLI: {e}")))?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let stdout = child.stdout.take();
        if let Some(stdout) = stdout {
            let sender = events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(envelope) = CliEnvelope::parse_line(&line) {
                        let _ = sender.send(envelope);
                    } else {
                        debug!(line = %line, "unparsed CLI stdout line");
                    }
                }
                // Stream closed: the child exited or closed stdout.
                let _ = sender.send(CliEnvelope::Error {
                    message: "agent CLI closed its output stream".to_string(),
                });
            });
        }

        let stderr = child.stderr.take();
        if let Some(stderr) = stderr {
            let sender = events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = sender.send(CliEnvelope::Progress { message: line });
                }
            });
        }

        let stdin = child.stdin.take();

        Ok(Self {
            child: Mutex::new(Some(child)),
            stdin: tokio::sync::Mutex::new(stdin),
            events,
        })
    }
}

#[async_trait]
impl CliTransport for ChildProcessTransport {
    async fn send_line(&self, line: String) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| DevmeshError::upstream("agent CLI stdin is closed"))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DevmeshError::upstream(format!("write to agent CLI failed: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| DevmeshError::upstream(format!("write to agent CLI failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| DevmeshError::upstream(format!("flush to agent CLI failed: {e}")))?;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<CliEnvelope> {
        self.events.subscribe()
    }

    async fn shutdown(&self, grace: Duration) -> Result<()> {
        // Closing stdin is the polite signal; the CLI exits on EOF.
        self.stdin.lock().await.take();

        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return Ok(());
        };

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(?status, "agent CLI exited");
                Ok(())
            }
            Ok(Err(e)) => Err(DevmeshError::upstream(format!(
                "waiting for agent CLI failed: {e}"
            ))),
            Err(_) => {
                warn!("agent CLI did not exit within grace period, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| DevmeshError::upstream(format!("kill failed: {e}")))?;
                Ok(())
            }
        }
    }

    fn is_alive(&self) -> bool {
        let mut guard = self.child.lock();
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Launcher spawning the configured CLI binary.
#[derive(Debug, Clone)]
pub struct ChildProcessLauncher {
    program: String,
    args:    Vec<String>,
}

impl ChildProcessLauncher {
    /// Launcher for `program` with base arguments prepended to every
    /// launch.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl CliLauncher for ChildProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn CliTransport>> {
        let transport = ChildProcessTransport::spawn(&self.program, &self.args, spec)?;
        Ok(Arc::new(transport))
    }
}
