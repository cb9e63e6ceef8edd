//! Domain types owned by the git subgraph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a repository participates in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepoType {
    /// A standalone working copy.
    Regular,
    /// A working copy recorded as a gitlink in a parent repository.
    Submodule,
    /// A bare repository (no working tree).
    Bare,
    /// A linked worktree of another repository.
    Worktree,
}

/// Classification of one changed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatusCode {
    /// Content changed.
    Modified,
    /// Newly tracked.
    Added,
    /// Removed.
    Deleted,
    /// Renamed (porcelain `R`).
    Renamed,
    /// Unmerged conflict entry.
    Unmerged,
    /// Present on disk, unknown to the index.
    Untracked,
}

/// One entry from porcelain status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    /// Path relative to the repository root.
    pub path: String,
    /// Status classification.
    pub status: FileStatusCode,
    /// True when the change is staged in the index.
    pub staged: bool,
}

/// A repository in the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// GraphQL typename, carried for entity resolution.
    #[serde(rename = "__typename")]
    pub typename: &'static str,
    /// Absolute, canonicalized path. Entity key.
    pub path: String,
    /// Short name (final path component).
    pub name: String,
    /// Current branch, or the commit hash when detached.
    pub branch: String,
    /// True iff `files` is non-empty.
    pub is_dirty: bool,
    /// Changed paths, index order.
    pub files: Vec<FileStatus>,
    /// Commits ahead of upstream.
    pub ahead: u32,
    /// Commits behind upstream.
    pub behind: u32,
    /// Whether an upstream remote is configured.
    pub has_remote: bool,
    /// Repository flavor.
    pub repo_type: RepoType,
    /// Parent repository path; present exactly when `repo_type` is
    /// `SUBMODULE`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
}

impl Repository {
    /// Typename constant used in federation representations.
    pub const TYPENAME: &'static str = "Repository";
}

/// A commit, as parsed from history output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    /// Full content hash (hex).
    pub hash: String,
    /// First 7 characters of `hash`.
    pub short_hash: String,
    /// Author name.
    pub author: String,
    /// Author email.
    pub author_email: String,
    /// Commit message subject.
    pub message: String,
    /// Author timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Commit {
    /// Build a commit, deriving the short hash.
    #[must_use]
    pub fn new(
        hash: impl Into<String>,
        author: impl Into<String>,
        author_email: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let hash = hash.into();
        let short_hash = hash.chars().take(7).collect();
        Self {
            hash,
            short_hash,
            author: author.into(),
            author_email: author_email.into(),
            message: message.into(),
            timestamp,
        }
    }
}

/// Sync state of a submodule relative to its pinned commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmoduleStatus {
    /// Checked-out commit is ahead of the recorded gitlink.
    pub ahead: bool,
    /// Checked-out commit is behind the recorded gitlink.
    pub behind: bool,
    /// Merge conflicts present.
    pub has_conflicts: bool,
    /// Checked-out commit matches the gitlink.
    pub is_up_to_date: bool,
}

/// A submodule of a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submodule {
    /// Submodule name from `.gitmodules`.
    pub name: String,
    /// Path relative to the parent repository.
    pub path: String,
    /// Upstream URL.
    pub url: String,
    /// Commit recorded in the parent's index.
    pub pinned_commit: String,
    /// Whether the submodule working tree is initialized.
    pub initialized: bool,
    /// Sync status.
    pub status: SubmoduleStatus,
}

/// Aggregate statistics from a detailed workspace scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStatistics {
    /// Total repositories discovered.
    pub total_repositories: usize,
    /// Repositories with uncommitted changes.
    pub dirty_repositories: usize,
    /// Total uncommitted files across the workspace.
    pub uncommitted_files: usize,
    /// Total added lines across uncommitted diffs.
    pub additions: u64,
    /// Total deleted lines across uncommitted diffs.
    pub deletions: u64,
    /// Repository count per type.
    pub by_type: TypeBreakdown,
}

/// Repository count per [`RepoType`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeBreakdown {
    /// REGULAR repositories.
    pub regular: usize,
    /// SUBMODULE repositories.
    pub submodule: usize,
    /// BARE repositories.
    pub bare: usize,
    /// WORKTREE repositories.
    pub worktree: usize,
}

/// A detailed per-repository scan record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedRepository {
    /// The repository itself.
    #[serde(flatten)]
    pub repository: Repository,
    /// Uncommitted diff, bounded per file.
    pub uncommitted_diff: String,
    /// Recent history, newest first.
    pub recent_commits: Vec<Commit>,
}

/// Result of committing one repository during a hierarchical commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoCommitResult {
    /// Repository path relative to the workspace root.
    pub repository: String,
    /// Whether the commit succeeded.
    pub success: bool,
    /// Hash of the created commit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    /// Error detail on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of pushing one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoPushResult {
    /// Repository path relative to the workspace root.
    pub repository: String,
    /// Whether the push succeeded.
    pub success: bool,
    /// Error detail on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate result of a hierarchical commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchicalCommitResult {
    /// True when every needed commit succeeded (or nothing needed
    /// committing).
    pub success: bool,
    /// Parent commit, when one was made.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_commit: Option<RepoCommitResult>,
    /// Submodule commits in execution order.
    pub submodule_commits: Vec<RepoCommitResult>,
    /// Number of successful commits.
    pub success_count: usize,
    /// Number of repositories that needed committing.
    pub total_repositories: usize,
    /// Push results, present for commit-and-push.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pushes: Vec<RepoPushResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash_derivation() {
        let commit = Commit::new(
            "0123456789abcdef0123456789abcdef01234567",
            "Ada",
            "ada@example.com",
            "feat: engine",
            Utc::now(),
        );
        assert_eq!(commit.short_hash, "0123456");
    }

    #[test]
    fn test_repo_type_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&RepoType::Submodule).unwrap(),
            "\"SUBMODULE\""
        );
    }

    #[test]
    fn test_repository_serializes_camel_case() {
        let repo = Repository {
            typename: Repository::TYPENAME,
            path: "/ws/a".to_string(),
            name: "a".to_string(),
            branch: "main".to_string(),
            is_dirty: false,
            files: Vec::new(),
            ahead: 0,
            behind: 0,
            has_remote: true,
            repo_type: RepoType::Regular,
            parent_path: None,
        };
        let value = serde_json::to_value(&repo).unwrap();
        assert_eq!(value["isDirty"], serde_json::json!(false));
        assert_eq!(value["hasRemote"], serde_json::json!(true));
        assert_eq!(value["__typename"], serde_json::json!("Repository"));
        assert!(value.get("parentPath").is_none());
    }
}
