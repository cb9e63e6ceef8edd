//! Workspace scanning: repository discovery and detailed state
//! collection.

use std::path::{Path, PathBuf};

use devmesh_error::Result;
use tracing::{debug, warn};

use crate::exec::GitExecutor;
use crate::types::{DetailedRepository, Repository, RepoType, ScanStatistics};

/// Directories never descended into during discovery.
const SKIPPED_DIRS: &[&str] = &["node_modules", "target", ".cache", "dist", "build"];

/// Default history depth for detailed scans.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Discover every repository under the workspace root.
///
/// A directory counts as a repository when it contains a `.git`
/// directory or a `.git` gitlink file (submodule working copies).
/// Nested repositories are reported individually; discovery does not
/// descend into a repository's `.git` directory.
#[must_use]
pub fn discover_repositories(workspace_root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    walk(workspace_root, &mut found, 0);
    found.sort();
    found
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>, depth: usize) {
    if depth > 16 {
        return;
    }
    if dir.join(".git").exists() {
        found.push(dir.to_path_buf());
        // Keep walking: submodules live inside their parent.
    }

    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref()) {
            continue;
        }
        walk(&path, found, depth + 1);
    }
}

/// Scan every repository's basic state.
///
/// Repositories that fail to report (corrupt, mid-operation) are
/// logged and skipped rather than failing the scan.
///
/// # Errors
///
/// Propagates workspace confinement failures only.
pub async fn scan_all(executor: &GitExecutor) -> Result<Vec<Repository>> {
    let mut repositories = Vec::new();
    for path in discover_repositories(executor.workspace_root()) {
        let path_str = path.display().to_string();
        match executor.repository(&path_str).await {
            Ok(repo) => repositories.push(repo),
            Err(err) => {
                warn!(repo = %path_str, error = %err, "skipping unreadable repository");
            }
        }
    }
    debug!(count = repositories.len(), "workspace scan complete");
    Ok(repositories)
}

/// Detailed scan: per-repository status, bounded diff, recent history,
/// plus aggregate statistics.
///
/// # Errors
///
/// Propagates workspace confinement failures only.
pub async fn scan_all_detailed(
    executor: &GitExecutor,
    history_limit: usize,
) -> Result<(Vec<DetailedRepository>, ScanStatistics)> {
    let repositories = scan_all(executor).await?;

    let mut detailed = Vec::with_capacity(repositories.len());
    let mut stats = ScanStatistics {
        total_repositories: repositories.len(),
        ..ScanStatistics::default()
    };

    for repository in repositories {
        match repository.repo_type {
            RepoType::Regular => stats.by_type.regular += 1,
            RepoType::Submodule => stats.by_type.submodule += 1,
            RepoType::Bare => stats.by_type.bare += 1,
            RepoType::Worktree => stats.by_type.worktree += 1,
        }
        if repository.is_dirty {
            stats.dirty_repositories += 1;
        }
        stats.uncommitted_files += repository.files.len();

        let uncommitted_diff = if repository.is_dirty {
            executor
                .uncommitted_diff(&repository.path)
                .await
                .unwrap_or_default()
        } else {
            String::new()
        };

        if repository.is_dirty {
            if let Ok((additions, deletions)) =
                executor.uncommitted_numstat(&repository.path).await
            {
                stats.additions += additions;
                stats.deletions += deletions;
            }
        }

        let recent_commits = executor
            .recent_commits(&repository.path, history_limit)
            .await
            .unwrap_or_default();

        detailed.push(DetailedRepository {
            repository,
            uncommitted_diff,
            recent_commits,
        });
    }

    Ok((detailed, stats))
}
