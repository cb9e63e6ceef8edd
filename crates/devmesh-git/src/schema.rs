//! GraphQL schema and resolvers for the git subgraph.

use std::sync::Arc;

use devmesh_error::{DevmeshError, Result};
use devmesh_subgraph::{entity_resolver, resolver, SubgraphSchema};
use serde_json::{json, Map, Value};

use crate::exec::GitExecutor;
use crate::hierarchy::{
    hierarchical_commit, hierarchical_commit_and_push, HierarchicalCommitOptions,
};
use crate::scan::{scan_all, scan_all_detailed};
use crate::types::{RepoCommitResult, RepoPushResult};

/// Subgraph service name.
pub const SERVICE_NAME: &str = "git";

/// Base SDL published through `_service { sdl }`.
pub const SDL: &str = r#"type Query {
  repoAgentHealth: ServiceHealth!
  repository(path: String!): Repository
  scanAllRepositories: [Repository!]!
  scanAllDetailed: DetailedScan!
  submodules(path: String!): [Submodule!]!
  recentCommits(path: String!, limit: Int): [Commit!]!
  uncommittedDiff(path: String!): String!
  executeGitCommand(path: String!, command: String!, args: [String!]): CommandResult!
}

type Mutation {
  commitChanges(path: String!, message: String!, author: String): RepoCommitResult!
  pushChanges(path: String!): RepoPushResult!
  hierarchicalCommit(path: String, message: String!, author: String): HierarchicalCommitResult!
  hierarchicalCommitAndPush(path: String, message: String!, author: String): HierarchicalCommitResult!
}

type ServiceHealth @shareable {
  healthy: Boolean!
  service: String!
  timestamp: String!
}

type Repository @key(fields: "path") {
  path: String!
  name: String!
  branch: String!
  isDirty: Boolean!
  files: [FileStatus!]!
  ahead: Int!
  behind: Int!
  hasRemote: Boolean!
  repoType: RepoType!
  parentPath: String
}

enum RepoType {
  REGULAR
  SUBMODULE
  BARE
  WORKTREE
}

type FileStatus {
  path: String!
  status: FileStatusCode!
  staged: Boolean!
}

enum FileStatusCode {
  MODIFIED
  ADDED
  DELETED
  RENAMED
  UNMERGED
  UNTRACKED
}

type Commit {
  hash: String!
  shortHash: String!
  author: String!
  authorEmail: String!
  message: String!
  timestamp: String!
}

type Submodule {
  name: String!
  path: String!
  url: String!
  pinnedCommit: String!
  initialized: Boolean!
  status: SubmoduleStatus!
}

type SubmoduleStatus {
  ahead: Boolean!
  behind: Boolean!
  hasConflicts: Boolean!
  isUpToDate: Boolean!
}

type DetailedScan {
  repositories: [DetailedRepository!]!
  statistics: ScanStatistics!
}

type DetailedRepository {
  path: String!
  name: String!
  branch: String!
  isDirty: Boolean!
  files: [FileStatus!]!
  ahead: Int!
  behind: Int!
  hasRemote: Boolean!
  repoType: RepoType!
  uncommittedDiff: String!
  recentCommits: [Commit!]!
}

type ScanStatistics {
  totalRepositories: Int!
  dirtyRepositories: Int!
  uncommittedFiles: Int!
  additions: Int!
  deletions: Int!
  byType: TypeBreakdown!
}

type TypeBreakdown {
  regular: Int!
  submodule: Int!
  bare: Int!
  worktree: Int!
}

type CommandResult {
  success: Boolean!
  stdout: String!
  stderr: String!
  exitCode: Int!
}

type RepoCommitResult {
  repository: String!
  success: Boolean!
  commitHash: String
  error: String
}

type RepoPushResult {
  repository: String!
  success: Boolean!
  error: String
}

type HierarchicalCommitResult {
  success: Boolean!
  parentCommit: RepoCommitResult
  submoduleCommits: [RepoCommitResult!]!
  successCount: Int!
  totalRepositories: Int!
  pushes: [RepoPushResult!]!
}
"#;

fn required_str(args: &Map<String, Value>, name: &str) -> Result<String> {
    args.get(name)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| DevmeshError::bad_user_input(format!("argument '{name}' is required")))
}

fn optional_str(args: &Map<String, Value>, name: &str) -> Option<String> {
    args.get(name)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| DevmeshError::internal(format!("serialize: {e}")))
}

/// Build the git subgraph schema around an executor.
#[must_use]
pub fn build_schema(executor: Arc<GitExecutor>, history_limit: usize) -> SubgraphSchema {
    let health = {
        resolver(move |_ctx, _args| async move {
            Ok(json!({
                "healthy": true,
                "service": SERVICE_NAME,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }))
        })
    };

    let repository = {
        let executor = executor.clone();
        resolver(move |_ctx, args| {
            let executor = executor.clone();
            async move {
                let path = required_str(&args, "path")?;
                match executor.repository(&path).await {
                    Ok(repo) => to_json(&repo),
                    Err(err) if err.error_code() == "PATH_OUTSIDE_WORKSPACE" => Err(err),
                    Err(_) => Ok(Value::Null),
                }
            }
        })
    };

    let scan_repositories = {
        let executor = executor.clone();
        resolver(move |_ctx, _args| {
            let executor = executor.clone();
            async move {
                let repos = scan_all(&executor).await?;
                to_json(&repos)
            }
        })
    };

    let scan_detailed = {
        let executor = executor.clone();
        resolver(move |_ctx, _args| {
            let executor = executor.clone();
            async move {
                let (repositories, statistics) =
                    scan_all_detailed(&executor, history_limit).await?;
                Ok(json!({
                    "repositories": to_json(&repositories)?,
                    "statistics": to_json(&statistics)?,
                }))
            }
        })
    };

    let submodules = {
        let executor = executor.clone();
        resolver(move |_ctx, args| {
            let executor = executor.clone();
            async move {
                let path = required_str(&args, "path")?;
                to_json(&executor.submodules(&path).await?)
            }
        })
    };

    let recent_commits = {
        let executor = executor.clone();
        resolver(move |_ctx, args| {
            let executor = executor.clone();
            async move {
                let path = required_str(&args, "path")?;
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map_or(history_limit, |n| n as usize);
                to_json(&executor.recent_commits(&path, limit).await?)
            }
        })
    };

    let uncommitted_diff = {
        let executor = executor.clone();
        resolver(move |_ctx, args| {
            let executor = executor.clone();
            async move {
                let path = required_str(&args, "path")?;
                Ok(json!(executor.uncommitted_diff(&path).await?))
            }
        })
    };

    let execute_git_command = {
        let executor = executor.clone();
        resolver(move |_ctx, args| {
            let executor = executor.clone();
            async move {
                let path = required_str(&args, "path")?;
                let command = required_str(&args, "command")?;
                let extra: Vec<String> = args
                    .get("args")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(ToString::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                to_json(&executor.execute_allowed(&path, &command, &extra).await?)
            }
        })
    };

    let commit_changes = {
        let executor = executor.clone();
        resolver(move |_ctx, args| {
            let executor = executor.clone();
            async move {
                let path = required_str(&args, "path")?;
                let message = required_str(&args, "message")?;
                let author = optional_str(&args, "author");
                let abs = executor.confine(&path)?;
                let result = match executor
                    .stage_and_commit(&path, &message, author.as_deref())
                    .await
                {
                    Ok(hash) => RepoCommitResult {
                        repository: executor.display_path(&abs),
                        success:    true,
                        commit_hash: hash,
                        error:      None,
                    },
                    Err(err) => RepoCommitResult {
                        repository: executor.display_path(&abs),
                        success:    false,
                        commit_hash: None,
                        error:      Some(err.to_string()),
                    },
                };
                to_json(&result)
            }
        })
    };

    let push_changes = {
        let executor = executor.clone();
        resolver(move |_ctx, args| {
            let executor = executor.clone();
            async move {
                let path = required_str(&args, "path")?;
                let abs = executor.confine(&path)?;
                let outcome = executor.push(&path).await;
                let result = RepoPushResult {
                    repository: executor.display_path(&abs),
                    success:    outcome.is_ok(),
                    error:      outcome.err().map(|e| e.to_string()),
                };
                to_json(&result)
            }
        })
    };

    let hier_commit = {
        let executor = executor.clone();
        resolver(move |_ctx, args| {
            let executor = executor.clone();
            async move {
                let options = HierarchicalCommitOptions {
                    parent_path: optional_str(&args, "path"),
                    message:     required_str(&args, "message")?,
                    author:      optional_str(&args, "author"),
                };
                to_json(&hierarchical_commit(&executor, &options).await?)
            }
        })
    };

    let hier_commit_push = {
        let executor = executor.clone();
        resolver(move |_ctx, args| {
            let executor = executor.clone();
            async move {
                let options = HierarchicalCommitOptions {
                    parent_path: optional_str(&args, "path"),
                    message:     required_str(&args, "message")?,
                    author:      optional_str(&args, "author"),
                };
                to_json(&hierarchical_commit_and_push(&executor, &options).await?)
            }
        })
    };

    let repository_entity = {
        let executor = executor.clone();
        entity_resolver(move |_ctx, rep| {
            let executor = executor.clone();
            async move {
                let Some(path) = rep.get("path").and_then(Value::as_str) else {
                    return Ok(None);
                };
                match executor.repository(path).await {
                    Ok(repo) => Ok(Some(to_json(&repo)?)),
                    Err(_) => Ok(None),
                }
            }
        })
    };

    SubgraphSchema::builder(SERVICE_NAME, SDL)
        .query("repoAgentHealth", health)
        .query("repository", repository)
        .query("scanAllRepositories", scan_repositories)
        .query("scanAllDetailed", scan_detailed)
        .query("submodules", submodules)
        .query("recentCommits", recent_commits)
        .query("uncommittedDiff", uncommitted_diff)
        .query("executeGitCommand", execute_git_command)
        .mutation("commitChanges", commit_changes)
        .mutation("pushChanges", push_changes)
        .mutation("hierarchicalCommit", hier_commit)
        .mutation("hierarchicalCommitAndPush", hier_commit_push)
        .entity("Repository", repository_entity)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use crate::runner::GitOutput;
    use devmesh_graphql::request::GraphQLRequest;
    use devmesh_subgraph::{execute, ResolverCtx};

    fn schema_in(root: &std::path::Path, runner: Arc<ScriptedRunner>) -> SubgraphSchema {
        let executor = Arc::new(GitExecutor::new(runner, root).unwrap());
        build_schema(executor, 10)
    }

    #[tokio::test]
    async fn test_health_query() {
        let tmp = tempfile::tempdir().unwrap();
        let schema = schema_in(tmp.path(), Arc::new(ScriptedRunner::new()));
        let request = GraphQLRequest::new("{ repoAgentHealth { healthy service } }");
        let response = execute(&schema, &request, &ResolverCtx::default()).await;
        let data = response.data.unwrap();
        assert_eq!(data["repoAgentHealth"]["healthy"], json!(true));
        assert_eq!(data["repoAgentHealth"]["service"], json!("git"));
    }

    #[tokio::test]
    async fn test_sdl_parses() {
        let tmp = tempfile::tempdir().unwrap();
        let schema = schema_in(tmp.path(), Arc::new(ScriptedRunner::new()));
        graphql_parser::parse_schema::<String>(&schema.federation_sdl()).unwrap();
    }

    #[tokio::test]
    async fn test_execute_git_command_rejects_disallowed() {
        let tmp = tempfile::tempdir().unwrap();
        let schema = schema_in(tmp.path(), Arc::new(ScriptedRunner::new()));
        let request = GraphQLRequest::new(
            r#"{ executeGitCommand(path: ".", command: "rebase") { success } }"#,
        );
        let response = execute(&schema, &request, &ResolverCtx::default()).await;
        assert_eq!(response.errors[0].code(), Some("COMMAND_NOT_ALLOWED"));
    }

    #[tokio::test]
    async fn test_repository_entity_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("app/.git")).unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.expect(&["status"], GitOutput::ok("## main\n"));
        let schema = schema_in(tmp.path(), runner);

        let canonical = tmp.path().canonicalize().unwrap();
        let request = GraphQLRequest::new(
            r#"query($reps: [_Any!]!) { _entities(representations: $reps) { ... on Repository { path branch isDirty } } }"#,
        )
        .with_variables(json!({
            "reps": [{"__typename": "Repository", "path": canonical.join("app").display().to_string()}]
        }));
        let response = execute(&schema, &request, &ResolverCtx::default()).await;
        let entity = &response.data.unwrap()["_entities"][0];
        assert_eq!(entity["branch"], json!("main"));
        assert_eq!(entity["isDirty"], json!(false));
    }

    #[tokio::test]
    async fn test_scan_empty_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let schema = schema_in(tmp.path(), Arc::new(ScriptedRunner::new()));
        let request = GraphQLRequest::new(
            "{ scanAllDetailed { repositories { path } statistics { totalRepositories } } }",
        );
        let response = execute(&schema, &request, &ResolverCtx::default()).await;
        let data = response.data.unwrap();
        assert_eq!(data["scanAllDetailed"]["repositories"], json!([]));
        assert_eq!(
            data["scanAllDetailed"]["statistics"]["totalRepositories"],
            json!(0)
        );
    }
}
