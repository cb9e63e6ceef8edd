//! The seam between the executor and the system `git` binary.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use devmesh_error::{DevmeshError, Result};
use tokio::process::Command;
use tracing::debug;

/// Captured output of one git invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    /// Process exit code (`-1` when terminated by signal).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl GitOutput {
    /// True for a zero exit code.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convenience constructor for successful output.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout:    stdout.into(),
            stderr:    String::new(),
        }
    }

    /// Convenience constructor for failed output.
    #[must_use]
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Executes git subcommands. The real implementation shells out; tests
/// substitute a scripted fake.
#[async_trait]
pub trait GitRunner: Send + Sync {
    /// Run `git <args>` with `cwd` as the working directory.
    async fn run(&self, cwd: &Path, args: &[String]) -> Result<GitOutput>;
}

/// Production runner invoking the system binary.
#[derive(Debug, Clone)]
pub struct SystemGitRunner {
    binary: String,
}

impl SystemGitRunner {
    /// Use the given binary (normally `git`).
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for SystemGitRunner {
    fn default() -> Self {
        Self::new("git")
    }
}

#[async_trait]
impl GitRunner for SystemGitRunner {
    async fn run(&self, cwd: &Path, args: &[String]) -> Result<GitOutput> {
        debug!(cwd = %cwd.display(), ?args, "invoking git");

        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DevmeshError::upstream(format!("failed to spawn git: {e}")))?;

        Ok(GitOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout:    String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr:    String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_success_predicate() {
        assert!(GitOutput::ok("x").success());
        assert!(!GitOutput::failed(128, "boom").success());
    }
}
