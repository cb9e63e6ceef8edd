//! Safe git command execution.
//!
//! Two invariants hold for every invocation: the working directory is a
//! descendant of the configured workspace root, and free-form commands
//! are restricted to a read-only allowlist. `commit`, `push`, and `add`
//! never pass through [`GitExecutor::execute_allowed`]; the typed
//! mutations call the internal helpers directly, which serialize
//! mutating commands per repository path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use devmesh_error::{DevmeshError, Result};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::parse::{
    self, parse_branch_header, parse_log, parse_porcelain_status, parse_submodule_status,
};
use crate::runner::{GitOutput, GitRunner};
use crate::types::{Commit, Repository, RepoType, Submodule};

/// Subcommands reachable through `executeGitCommand`.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "status",
    "diff",
    "log",
    "branch",
    "remote",
    "tag",
    "rev-parse",
    "ls-files",
    "submodule",
    "config",
    "show",
];

/// Per-file diff bound (1 MiB).
pub const MAX_DIFF_BYTES_PER_FILE: usize = 1 << 20;

/// Result of a free-form allowlisted command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// Whether git exited zero.
    pub success: bool,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Exit code.
    pub exit_code: i32,
}

/// Executes git commands inside the workspace.
#[derive(Clone)]
pub struct GitExecutor {
    runner:         Arc<dyn GitRunner>,
    workspace_root: PathBuf,
    // One lock per repository path; mutating commands serialize on it.
    repo_locks:     Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for GitExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitExecutor")
            .field("workspace_root", &self.workspace_root)
            .finish_non_exhaustive()
    }
}

impl GitExecutor {
    /// Create an executor confined to `workspace_root`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the root does not exist.
    pub fn new(runner: Arc<dyn GitRunner>, workspace_root: impl Into<PathBuf>) -> Result<Self> {
        let workspace_root: PathBuf = workspace_root.into();
        let workspace_root = workspace_root.canonicalize().map_err(|e| {
            DevmeshError::config(format!(
                "workspace root {} is not accessible: {e}",
                workspace_root.display()
            ))
        })?;
        Ok(Self {
            runner,
            workspace_root,
            repo_locks: Arc::new(DashMap::new()),
        })
    }

    /// The canonicalized workspace root.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Canonicalize `path` and verify it stays inside the workspace.
    ///
    /// # Errors
    ///
    /// Returns [`DevmeshError::PathOutsideWorkspace`] for escaping or
    /// inaccessible paths.
    pub fn confine(&self, path: &str) -> Result<PathBuf> {
        let joined = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.workspace_root.join(path)
        };
        let resolved = joined
            .canonicalize()
            .map_err(|_| DevmeshError::path_outside_workspace(path))?;
        if !resolved.starts_with(&self.workspace_root) {
            return Err(DevmeshError::path_outside_workspace(path));
        }
        Ok(resolved)
    }

    /// Run a free-form command from the read-only allowlist.
    ///
    /// # Errors
    ///
    /// `COMMAND_NOT_ALLOWED` for subcommands outside the allowlist and
    /// `PATH_OUTSIDE_WORKSPACE` for escaping paths.
    pub async fn execute_allowed(
        &self,
        repo_path: &str,
        command: &str,
        args: &[String],
    ) -> Result<CommandResult> {
        if !ALLOWED_COMMANDS.contains(&command) {
            return Err(DevmeshError::command_not_allowed(command));
        }
        let cwd = self.confine(repo_path)?;

        let mut full_args = vec![command.to_string()];
        full_args.extend(args.iter().cloned());

        let output = self.runner.run(&cwd, &full_args).await?;
        Ok(CommandResult {
            success:   output.success(),
            stdout:    output.stdout,
            stderr:    output.stderr,
            exit_code: output.exit_code,
        })
    }

    async fn run_checked(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        let output = self.runner.run(cwd, &args).await?;
        if !output.success() {
            return Err(DevmeshError::upstream(format!(
                "git {} exited {}: {}",
                args.first().map_or("", String::as_str),
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    fn lock_for(&self, repo: &Path) -> Arc<Mutex<()>> {
        self.repo_locks
            .entry(repo.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ========================================================================
    // Read operations
    // ========================================================================

    /// Full repository state: branch header, file statuses, remote.
    ///
    /// # Errors
    ///
    /// Propagates confinement and git failures.
    pub async fn repository(&self, repo_path: &str) -> Result<Repository> {
        let cwd = self.confine(repo_path)?;
        let status = self
            .run_checked(&cwd, &["status", "--porcelain=v1", "-b"])
            .await?;

        let header_line = status.stdout.lines().next().unwrap_or_default();
        let header = parse_branch_header(header_line);
        let files = parse_porcelain_status(&status.stdout);

        let repo_type = Self::classify_repo(&cwd);
        let parent_path = match repo_type {
            RepoType::Submodule => cwd
                .parent()
                .and_then(|p| self.find_enclosing_repo(p))
                .map(|p| p.display().to_string()),
            _ => None,
        };

        Ok(Repository {
            typename: Repository::TYPENAME,
            name: cwd
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: cwd.display().to_string(),
            branch: header.branch,
            is_dirty: !files.is_empty(),
            files,
            ahead: header.ahead,
            behind: header.behind,
            has_remote: header.has_upstream,
            repo_type,
            parent_path,
        })
    }

    fn classify_repo(cwd: &Path) -> RepoType {
        // A submodule working copy has a `.git` file (gitlink) instead
        // of a directory; a bare repository has neither.
        let dot_git = cwd.join(".git");
        if dot_git.is_file() {
            let content = std::fs::read_to_string(&dot_git).unwrap_or_default();
            if content.contains(".git/modules/") {
                return RepoType::Submodule;
            }
            return RepoType::Worktree;
        }
        if dot_git.is_dir() {
            return RepoType::Regular;
        }
        RepoType::Bare
    }

    fn find_enclosing_repo(&self, start: &Path) -> Option<PathBuf> {
        let mut current = Some(start);
        while let Some(dir) = current {
            if !dir.starts_with(&self.workspace_root) {
                return None;
            }
            if dir.join(".git").exists() {
                return Some(dir.to_path_buf());
            }
            current = dir.parent();
        }
        None
    }

    /// Uncommitted diff (worktree + index), bounded per file.
    ///
    /// # Errors
    ///
    /// Propagates confinement and git failures.
    pub async fn uncommitted_diff(&self, repo_path: &str) -> Result<String> {
        let cwd = self.confine(repo_path)?;
        let output = self.run_checked(&cwd, &["diff", "HEAD"]).await;
        // Repositories without any commit yet have no HEAD; fall back
        // to the index diff.
        let diff = match output {
            Ok(out) => out.stdout,
            Err(_) => self.run_checked(&cwd, &["diff"]).await?.stdout,
        };
        Ok(parse::bound_diff(&diff, MAX_DIFF_BYTES_PER_FILE))
    }

    /// Line additions/deletions of the uncommitted diff.
    ///
    /// # Errors
    ///
    /// Propagates confinement and git failures.
    pub async fn uncommitted_numstat(&self, repo_path: &str) -> Result<(u64, u64)> {
        let cwd = self.confine(repo_path)?;
        let output = self.run_checked(&cwd, &["diff", "--numstat"]).await?;
        Ok(parse::parse_numstat(&output.stdout))
    }

    /// Recent history, newest first.
    ///
    /// # Errors
    ///
    /// Propagates confinement and git failures.
    pub async fn recent_commits(&self, repo_path: &str, limit: usize) -> Result<Vec<Commit>> {
        let cwd = self.confine(repo_path)?;
        let limit_arg = format!("-{limit}");
        let format_arg = format!("--pretty={}", parse::LOG_FORMAT);
        let output = self
            .runner
            .run(
                &cwd,
                &[
                    "log".to_string(),
                    limit_arg,
                    format_arg,
                ],
            )
            .await?;
        // An empty repository has no log; that is not an error.
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(parse_log(&output.stdout))
    }

    /// Submodules of a repository with their sync status.
    ///
    /// # Errors
    ///
    /// Propagates confinement and git failures.
    pub async fn submodules(&self, repo_path: &str) -> Result<Vec<Submodule>> {
        let cwd = self.confine(repo_path)?;
        if !cwd.join(".gitmodules").exists() {
            return Ok(Vec::new());
        }

        let config = self
            .run_checked(
                &cwd,
                &[
                    "config",
                    "-f",
                    ".gitmodules",
                    "--get-regexp",
                    r"submodule\..*\.(path|url)",
                ],
            )
            .await?;
        let status = self
            .run_checked(&cwd, &["submodule", "status"])
            .await?;

        let entries = parse_submodule_status(&status.stdout);
        Ok(parse::assemble_submodules(&config.stdout, &entries))
    }

    // ========================================================================
    // Mutations (typed; never exposed through execute_allowed)
    // ========================================================================

    /// Stage everything and commit. Returns the new commit hash, or
    /// `None` when there was nothing to commit.
    ///
    /// # Errors
    ///
    /// Propagates confinement and git failures.
    pub async fn stage_and_commit(
        &self,
        repo_path: &str,
        message: &str,
        author: Option<&str>,
    ) -> Result<Option<String>> {
        let cwd = self.confine(repo_path)?;
        let lock = self.lock_for(&cwd);
        let _guard = lock.lock().await;

        self.run_checked(&cwd, &["add", "-A"]).await?;

        let staged = self
            .runner
            .run(
                &cwd,
                &["diff".to_string(), "--cached".to_string(), "--quiet".to_string()],
            )
            .await?;
        if staged.success() {
            // Nothing staged.
            return Ok(None);
        }

        let mut args = vec!["commit".to_string(), "-m".to_string(), message.to_string()];
        if let Some(author) = author {
            args.push(format!("--author={author}"));
        }
        let output = self.runner.run(&cwd, &args).await?;
        if !output.success() {
            return Err(DevmeshError::upstream(format!(
                "git commit exited {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let hash = self.run_checked(&cwd, &["rev-parse", "HEAD"]).await?;
        let hash = hash.stdout.trim().to_string();
        info!(repo = %cwd.display(), commit = %hash, "committed");
        Ok(Some(hash))
    }

    /// Stage specific paths in a repository.
    ///
    /// # Errors
    ///
    /// Propagates confinement and git failures.
    pub async fn stage_paths(&self, repo_path: &str, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let cwd = self.confine(repo_path)?;
        let lock = self.lock_for(&cwd);
        let _guard = lock.lock().await;

        let mut args = vec!["add".to_string(), "--".to_string()];
        args.extend(paths.iter().cloned());
        let output = self.runner.run(&cwd, &args).await?;
        if !output.success() {
            return Err(DevmeshError::upstream(format!(
                "git add exited {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Push the current branch.
    ///
    /// # Errors
    ///
    /// Propagates confinement and git failures.
    pub async fn push(&self, repo_path: &str) -> Result<()> {
        let cwd = self.confine(repo_path)?;
        let lock = self.lock_for(&cwd);
        let _guard = lock.lock().await;

        let output = self.runner.run(&cwd, &["push".to_string()]).await?;
        if !output.success() {
            return Err(DevmeshError::upstream(format!(
                "git push exited {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        info!(repo = %cwd.display(), "pushed");
        Ok(())
    }

    /// Relative display path of a repository against the workspace root.
    #[must_use]
    pub fn display_path(&self, repo: &Path) -> String {
        repo.strip_prefix(&self.workspace_root)
            .map(|rel| {
                if rel.as_os_str().is_empty() {
                    ".".to_string()
                } else {
                    rel.display().to_string()
                }
            })
            .unwrap_or_else(|_| repo.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use crate::runner::GitOutput;

    fn executor_with(runner: Arc<ScriptedRunner>, root: &Path) -> GitExecutor {
        GitExecutor::new(runner, root).unwrap()
    }

    #[tokio::test]
    async fn test_disallowed_command_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let exec = executor_with(runner, tmp.path());

        let err = exec
            .execute_allowed(".", "rebase", &[])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "COMMAND_NOT_ALLOWED");
    }

    #[tokio::test]
    async fn test_mutating_commands_not_in_allowlist() {
        for cmd in ["commit", "push", "add"] {
            assert!(!ALLOWED_COMMANDS.contains(&cmd), "{cmd} must not be allowlisted");
        }
    }

    #[tokio::test]
    async fn test_path_confinement_rejects_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let exec = executor_with(runner, tmp.path());

        let err = exec.confine("../../etc").unwrap_err();
        assert_eq!(err.error_code(), "PATH_OUTSIDE_WORKSPACE");
    }

    #[tokio::test]
    async fn test_confine_accepts_workspace_paths() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("repo")).unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let exec = executor_with(runner, tmp.path());

        let resolved = exec.confine("repo").unwrap();
        assert!(resolved.starts_with(exec.workspace_root()));
    }

    #[tokio::test]
    async fn test_repository_state_from_porcelain() {
        let tmp = tempfile::tempdir().unwrap();
        let repo_dir = tmp.path().join("app");
        std::fs::create_dir_all(repo_dir.join(".git")).unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.expect(
            &["status"],
            GitOutput::ok("## main...origin/main [ahead 1]\n M src/lib.rs\n?? notes.txt\n"),
        );

        let exec = executor_with(runner, tmp.path());
        let repo = exec.repository("app").await.unwrap();

        assert_eq!(repo.branch, "main");
        assert!(repo.is_dirty);
        assert_eq!(repo.files.len(), 2);
        assert_eq!(repo.ahead, 1);
        assert!(repo.has_remote);
        assert_eq!(repo.repo_type, RepoType::Regular);
        assert_eq!(repo.name, "app");
    }

    #[tokio::test]
    async fn test_stage_and_commit_nothing_staged() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("clean")).unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.expect(&["add"], GitOutput::ok(""));
        // `diff --cached --quiet` exits 0 when nothing is staged.
        runner.expect(&["diff"], GitOutput::ok(""));

        let exec = executor_with(runner.clone(), tmp.path());
        let hash = exec
            .stage_and_commit("clean", "chore: sync", None)
            .await
            .unwrap();
        assert!(hash.is_none());
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_stage_and_commit_produces_hash() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("dirty")).unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.expect(&["add"], GitOutput::ok(""));
        runner.expect(&["diff"], GitOutput::failed(1, ""));
        runner.expect(&["commit"], GitOutput::ok("[main abc1234] chore: sync"));
        runner.expect(
            &["rev-parse"],
            GitOutput::ok("abc1234def5678\n"),
        );

        let exec = executor_with(runner, tmp.path());
        let hash = exec
            .stage_and_commit("dirty", "chore: sync", Some("Bot <bot@example.com>"))
            .await
            .unwrap();
        assert_eq!(hash.as_deref(), Some("abc1234def5678"));
    }

    #[tokio::test]
    async fn test_execute_allowed_passes_args() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.expect(&["log"], GitOutput::ok("history"));

        let exec = executor_with(runner.clone(), tmp.path());
        let result = exec
            .execute_allowed(".", "log", &["-3".to_string()])
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "history");

        let calls = runner.calls();
        assert_eq!(calls[0].1, vec!["log".to_string(), "-3".to_string()]);
    }

    #[tokio::test]
    async fn test_display_path_relative_to_root() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let exec = executor_with(runner, tmp.path());

        let nested = exec.workspace_root().join("a/b");
        assert_eq!(exec.display_path(&nested), "a/b");
        assert_eq!(exec.display_path(exec.workspace_root()), ".");
    }
}
