//! Hierarchical commit: submodules first, then the parent.
//!
//! The operation is best-effort sequenced, not atomic. Submodules
//! commit in discovery order; the first failure skips every later
//! repository including the parent, so a parent commit never records a
//! gitlink for a submodule whose own commit failed.

use devmesh_error::Result;
use tracing::{info, warn};

use crate::exec::GitExecutor;
use crate::types::{HierarchicalCommitResult, RepoCommitResult, RepoPushResult};

/// Options for a hierarchical commit.
#[derive(Debug, Clone, Default)]
pub struct HierarchicalCommitOptions {
    /// Parent repository path; defaults to the workspace root.
    pub parent_path: Option<String>,
    /// Commit message shared by every created commit.
    pub message: String,
    /// Optional `Author Name <email>` override.
    pub author: Option<String>,
}

/// Commit dirty submodules (discovery order) and then the parent.
///
/// # Errors
///
/// Returns an error only for workspace confinement failures; per-repo
/// commit failures are reported in the result.
pub async fn hierarchical_commit(
    executor: &GitExecutor,
    options: &HierarchicalCommitOptions,
) -> Result<HierarchicalCommitResult> {
    let parent_path = options
        .parent_path
        .clone()
        .unwrap_or_else(|| executor.workspace_root().display().to_string());
    let parent_abs = executor.confine(&parent_path)?;

    let submodules = executor.submodules(&parent_path).await.unwrap_or_default();

    // Discover which repositories actually need a commit.
    let mut dirty_submodules = Vec::new();
    for sub in &submodules {
        if !sub.initialized {
            continue;
        }
        let sub_path = parent_abs.join(&sub.path).display().to_string();
        match executor.repository(&sub_path).await {
            Ok(repo) if repo.is_dirty => dirty_submodules.push((sub.clone(), sub_path)),
            Ok(_) => {}
            Err(err) => {
                warn!(submodule = %sub.path, error = %err, "skipping unreadable submodule");
            }
        }
    }

    let parent_repo = executor.repository(&parent_path).await?;
    let parent_dirty = parent_repo.is_dirty;

    let total_repositories =
        dirty_submodules.len() + usize::from(parent_dirty || !dirty_submodules.is_empty());
    if total_repositories == 0 {
        // Nothing to commit anywhere: success by definition.
        return Ok(HierarchicalCommitResult {
            success: true,
            parent_commit: None,
            submodule_commits: Vec::new(),
            success_count: 0,
            total_repositories: 0,
            pushes: Vec::new(),
        });
    }

    let mut submodule_commits = Vec::new();
    let mut success_count = 0;
    let mut aborted = false;

    for (sub, sub_path) in &dirty_submodules {
        if aborted {
            submodule_commits.push(RepoCommitResult {
                repository: executor.display_path(&parent_abs.join(&sub.path)),
                success:    false,
                commit_hash: None,
                error:      Some("skipped: earlier submodule commit failed".to_string()),
            });
            continue;
        }
        match executor
            .stage_and_commit(sub_path, &options.message, options.author.as_deref())
            .await
        {
            Ok(hash) => {
                success_count += 1;
                submodule_commits.push(RepoCommitResult {
                    repository: executor.display_path(&parent_abs.join(&sub.path)),
                    success:    true,
                    commit_hash: hash,
                    error:      None,
                });
            }
            Err(err) => {
                aborted = true;
                submodule_commits.push(RepoCommitResult {
                    repository: executor.display_path(&parent_abs.join(&sub.path)),
                    success:    false,
                    commit_hash: None,
                    error:      Some(err.to_string()),
                });
            }
        }
    }

    // The parent commits only when every submodule commit succeeded.
    let parent_commit = if aborted {
        None
    } else {
        // Stage updated gitlinks explicitly, then everything else.
        let committed_paths: Vec<String> = dirty_submodules
            .iter()
            .map(|(sub, _)| sub.path.clone())
            .collect();
        if let Err(err) = executor.stage_paths(&parent_path, &committed_paths).await {
            warn!(error = %err, "failed to stage submodule pointers");
        }

        match executor
            .stage_and_commit(&parent_path, &options.message, options.author.as_deref())
            .await
        {
            Ok(Some(hash)) => {
                success_count += 1;
                Some(RepoCommitResult {
                    repository: executor.display_path(&parent_abs),
                    success:    true,
                    commit_hash: Some(hash),
                    error:      None,
                })
            }
            Ok(None) => None,
            Err(err) => Some(RepoCommitResult {
                repository: executor.display_path(&parent_abs),
                success:    false,
                commit_hash: None,
                error:      Some(err.to_string()),
            }),
        }
    };

    let all_committed = !aborted
        && parent_commit
            .as_ref()
            .is_none_or(|parent| parent.success);

    info!(
        success = all_committed,
        submodules = submodule_commits.len(),
        "hierarchical commit finished"
    );

    Ok(HierarchicalCommitResult {
        success: all_committed,
        parent_commit,
        submodule_commits,
        success_count,
        total_repositories,
        pushes: Vec::new(),
    })
}

/// Hierarchical commit followed by pushes in the same order
/// (submodules first, then the parent). Push failures are reported
/// per-repo and never undo commits.
///
/// # Errors
///
/// Returns an error only for workspace confinement failures.
pub async fn hierarchical_commit_and_push(
    executor: &GitExecutor,
    options: &HierarchicalCommitOptions,
) -> Result<HierarchicalCommitResult> {
    let mut result = hierarchical_commit(executor, options).await?;
    if !result.success {
        return Ok(result);
    }

    let parent_path = options
        .parent_path
        .clone()
        .unwrap_or_else(|| executor.workspace_root().display().to_string());
    let parent_abs = executor.confine(&parent_path)?;

    let mut push_targets: Vec<String> = result
        .submodule_commits
        .iter()
        .filter(|c| c.success)
        .map(|c| c.repository.clone())
        .collect();
    if result.parent_commit.as_ref().is_some_and(|c| c.success) {
        push_targets.push(
            result
                .parent_commit
                .as_ref()
                .map(|c| c.repository.clone())
                .unwrap_or_default(),
        );
    }

    for repository in push_targets {
        let abs = if repository == "." {
            parent_abs.clone()
        } else {
            executor.workspace_root().join(&repository)
        };
        let outcome = executor.push(&abs.display().to_string()).await;
        result.pushes.push(RepoPushResult {
            repository,
            success: outcome.is_ok(),
            error: outcome.err().map(|e| e.to_string()),
        });
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use crate::runner::GitOutput;
    use std::path::Path;
    use std::sync::Arc;

    /// Lay out a parent repo with one submodule at libs/core.
    fn scaffold(root: &Path) {
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(
            root.join(".gitmodules"),
            "[submodule \"core\"]\n\tpath = libs/core\n\turl = https://example.com/core.git\n",
        )
        .unwrap();
        std::fs::create_dir_all(root.join("libs/core")).unwrap();
        std::fs::write(
            root.join("libs/core/.git"),
            "gitdir: ../../.git/modules/core\n",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_clean_tree_commits_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        scaffold(tmp.path());

        let runner = Arc::new(ScriptedRunner::new());
        // submodules(): config + submodule status
        runner.expect(
            &["config"],
            GitOutput::ok("submodule.core.path libs/core\nsubmodule.core.url https://example.com/core.git\n"),
        );
        runner.expect(&["submodule"], GitOutput::ok(" abc123 libs/core (main)\n"));
        // submodule repository(): clean
        runner.expect(&["status"], GitOutput::ok("## main...origin/main\n"));
        // parent repository(): clean
        runner.expect(&["status"], GitOutput::ok("## main...origin/main\n"));

        let exec = GitExecutor::new(runner, tmp.path()).unwrap();
        let result = hierarchical_commit(
            &exec,
            &HierarchicalCommitOptions {
                message: "chore: sync".to_string(),
                ..HierarchicalCommitOptions::default()
            },
        )
        .await
        .unwrap();

        assert!(result.success);
        assert_eq!(result.success_count, 0);
        assert_eq!(result.total_repositories, 0);
        assert!(result.parent_commit.is_none());
    }

    #[tokio::test]
    async fn test_submodule_commits_before_parent() {
        let tmp = tempfile::tempdir().unwrap();
        scaffold(tmp.path());

        let runner = Arc::new(ScriptedRunner::new());
        runner.expect(
            &["config"],
            GitOutput::ok("submodule.core.path libs/core\nsubmodule.core.url https://example.com/core.git\n"),
        );
        runner.expect(&["submodule"], GitOutput::ok("+def456 libs/core (main)\n"));
        // submodule status: dirty
        runner.expect(&["status"], GitOutput::ok("## main\n M src/lib.rs\n"));
        // parent status: dirty
        runner.expect(&["status"], GitOutput::ok("## main\n M README.md\n"));
        // submodule commit: add, diff --cached (dirty), commit, rev-parse
        runner.expect(&["add"], GitOutput::ok(""));
        runner.expect(&["diff"], GitOutput::failed(1, ""));
        runner.expect(&["commit"], GitOutput::ok(""));
        runner.expect(&["rev-parse"], GitOutput::ok("subhash123\n"));
        // parent: stage gitlink, then add/diff/commit/rev-parse
        runner.expect(&["add", "--"], GitOutput::ok(""));
        runner.expect(&["add"], GitOutput::ok(""));
        runner.expect(&["diff"], GitOutput::failed(1, ""));
        runner.expect(&["commit"], GitOutput::ok(""));
        runner.expect(&["rev-parse"], GitOutput::ok("parenthash9\n"));

        let exec = GitExecutor::new(runner.clone(), tmp.path()).unwrap();
        let result = hierarchical_commit(
            &exec,
            &HierarchicalCommitOptions {
                message: "chore: sync".to_string(),
                ..HierarchicalCommitOptions::default()
            },
        )
        .await
        .unwrap();

        assert!(result.success);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.total_repositories, 2);
        assert_eq!(result.submodule_commits.len(), 1);
        assert_eq!(
            result.submodule_commits[0].commit_hash.as_deref(),
            Some("subhash123")
        );
        assert_eq!(
            result.parent_commit.as_ref().unwrap().commit_hash.as_deref(),
            Some("parenthash9")
        );

        // The submodule's commit call happened before any parent add.
        let calls = runner.calls();
        let commit_positions: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, (_, args))| args.first().map(String::as_str) == Some("commit"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(commit_positions.len(), 2);
        let sub_commit_cwd = &calls[commit_positions[0]].0;
        assert!(sub_commit_cwd.ends_with("libs/core"));
    }

    #[tokio::test]
    async fn test_submodule_failure_skips_parent() {
        let tmp = tempfile::tempdir().unwrap();
        scaffold(tmp.path());

        let runner = Arc::new(ScriptedRunner::new());
        runner.expect(
            &["config"],
            GitOutput::ok("submodule.core.path libs/core\nsubmodule.core.url u\n"),
        );
        runner.expect(&["submodule"], GitOutput::ok("+def456 libs/core (main)\n"));
        runner.expect(&["status"], GitOutput::ok("## main\n M src/lib.rs\n"));
        runner.expect(&["status"], GitOutput::ok("## main\n M README.md\n"));
        // submodule commit fails at `git add`
        runner.expect(&["add"], GitOutput::failed(128, "index locked"));

        let exec = GitExecutor::new(runner.clone(), tmp.path()).unwrap();
        let result = hierarchical_commit(
            &exec,
            &HierarchicalCommitOptions {
                message: "chore: sync".to_string(),
                ..HierarchicalCommitOptions::default()
            },
        )
        .await
        .unwrap();

        assert!(!result.success);
        assert!(result.parent_commit.is_none());
        assert!(!result.submodule_commits[0].success);
        // No parent commit call was ever made.
        let calls = runner.calls();
        assert!(!calls
            .iter()
            .any(|(cwd, args)| args.first().map(String::as_str) == Some("commit")
                && cwd == tmp.path().canonicalize().as_ref().unwrap()));
    }
}
