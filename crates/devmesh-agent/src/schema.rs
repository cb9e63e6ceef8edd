//! GraphQL schema and resolvers for the agent subgraph.

use std::sync::Arc;
use std::time::Duration;

use devmesh_error::{DevmeshError, Result};
use devmesh_subgraph::{entity_resolver, resolver, stream_resolver, SubgraphSchema};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio_stream::wrappers::BroadcastStream;

use crate::batch::{BatchDispatcher, BatchItem};
use crate::config::AgentServiceConfig;
use crate::manager::{ExecuteOptions, SessionManager};
use crate::prewarm::PreWarmPool;
use crate::runs::{RunFilter, RunStore};
use crate::types::{AgentRun, RunStatus, TemplateVariable};

/// Subgraph service name.
pub const SERVICE_NAME: &str = "claude-agent";

/// Base SDL published through `_service { sdl }`.
pub const SDL: &str = r#"type Query {
  claudeHealth: ServiceHealth!
  agentSession(id: ID!): AgentSession
  agentSessions: [AgentSession!]!
  sessionStatistics: SessionStatistics!
  sessionTemplates: [SessionTemplate!]!
  sharedSession(code: String!): AgentSession
  preWarmMetrics: PreWarmMetrics!
  agentRun(id: ID!): AgentRun
  agentRuns(repository: String, status: RunStatus, sinceIso: String, untilIso: String): [AgentRun!]!
  runStatistics: RunStatistics!
}

type Mutation {
  executeCommand(prompt: String!, sessionId: ID, workingDir: String, model: String, flags: [String!], name: String): ExecuteReceipt!
  continueSession(sessionId: ID!, prompt: String!, additionalContext: String): ExecuteReceipt!
  killSession(sessionId: ID!): Boolean!
  forkSession(sessionId: ID!, messageIndex: Int, name: String, includeHistory: Boolean): AgentSession!
  createSessionTemplate(sessionId: ID!, name: String!, tags: [String!], variables: [TemplateVariableInput!], initialContext: String, includeHistory: Boolean): SessionTemplate!
  createSessionFromTemplate(templateId: ID!, name: String): AgentSession!
  archiveSession(sessionId: ID!): String!
  shareSession(sessionId: ID!, ttlSecs: Int): ShareGrant!
  batchSessionOperation(sessionIds: [ID!]!, operation: SessionBatchOp!, params: JSON): [BatchOpResult!]!
  createHandoffDocument(sessionId: ID!): String!
  claimPreWarmedSession(name: String): ClaimResult!
  generateCommitMessages(items: [CommitMessageInput!]!): BatchResult!
  generateExecutiveSummary(messages: [RepoMessageInput!]!): ExecutiveSummary!
  retryAgentRun(id: ID!): AgentRun!
  cancelAgentRun(id: ID!): AgentRun!
  deleteOldRuns(olderThanDays: Int): Int!
}

type Subscription {
  commandOutput(sessionId: ID!): CommandOutput!
  preWarmStatus: PreWarmEvent!
  batchProgress(batchId: ID!): BatchProgress!
}

scalar JSON

type ServiceHealth @shareable {
  healthy: Boolean!
  service: String!
  timestamp: String!
}

type AgentSession @key(fields: "id") {
  id: ID!
  status: SessionStatus!
  createdAt: String!
  lastActivity: String!
  workingDir: String!
  history: [Interaction!]!
  metadata: SessionMetadata!
  parentSessionId: ID
  forkPoint: Int
  name: String
}

enum SessionStatus {
  ACTIVE
  PROCESSING
  IDLE
  TERMINATED
  ERROR
}

type Interaction {
  timestamp: String!
  prompt: String!
  response: String
  executionTimeMs: Int!
  success: Boolean!
  upstreamSessionId: String
}

type SessionMetadata {
  model: String!
  tokenUsage: TokenUsage!
  flags: [String!]!
  projectContext: String
  upstreamSessionId: String
}

type TokenUsage {
  inputTokens: Int!
  outputTokens: Int!
  estimatedCostUsd: Float!
}

type SessionStatistics {
  totalSessions: Int!
  byStatus: JSON!
  inputTokens: Int!
  outputTokens: Int!
  estimatedCostUsd: Float!
}

type SessionTemplate {
  id: ID!
  name: String!
  tags: [String!]!
  variables: [TemplateVariable!]!
  initialContext: String!
  defaultFlags: [String!]!
  defaultModel: String!
  usageCount: Int!
  lastUsedAt: String
  createdAt: String!
}

type TemplateVariable {
  name: String!
  required: Boolean!
  default: String
  description: String
}

input TemplateVariableInput {
  name: String!
  required: Boolean!
  default: String
  description: String
}

type ExecuteReceipt {
  sessionId: ID!
  success: Boolean!
  startedAt: String!
  estimatedDurationMs: Int!
  flags: [String!]!
}

type ShareGrant {
  code: String!
  sessionId: ID!
  expiresAt: String!
}

enum SessionBatchOp {
  ARCHIVE
  DELETE
  EXPORT
  TAG
  ANALYZE
}

type BatchOpResult {
  sessionId: ID!
  success: Boolean!
  error: String
  payload: JSON
}

type ClaimResult {
  success: Boolean!
  sessionId: ID
  status: String!
}

type PreWarmMetrics {
  poolSize: Int!
  total: Int!
  ready: Int!
  warming: Int!
  claimed: Int!
  failed: Int!
  slots: JSON!
}

type PreWarmEvent {
  slotId: ID!
  state: String!
  at: String!
  error: String
}

type CommandOutput {
  sessionId: ID!
  type: String!
  content: String!
  timestamp: String!
  isFinal: Boolean!
  tokens: Int
}

input CommitMessageInput {
  repoName: String!
  diff: String!
  recentCommits: [String!]
  context: String
}

input RepoMessageInput {
  repoName: String!
  message: String!
}

type BatchResult {
  batchId: ID!
  results: [BatchItemResult!]!
  total: Int!
  successCount: Int!
  executionTimeMs: Int!
  tokenUsage: BatchTokenUsage!
}

type BatchItemResult {
  repoName: String!
  success: Boolean!
  message: String
  error: String
  confidence: Float
  commitType: String
}

type BatchTokenUsage {
  inputTokens: Int!
  outputTokens: Int!
}

type BatchProgress {
  batchId: ID!
  repoName: String!
  status: String!
  completed: Int!
  total: Int!
}

enum RunStatus {
  QUEUED
  RUNNING
  SUCCESS
  FAILED
  CANCELLED
  RETRYING
}

type AgentRun @key(fields: "id") {
  id: ID!
  repository: String!
  status: RunStatus!
  startedAt: String!
  completedAt: String
  durationMs: Int
  input: JSON!
  output: JSON
  error: String
  retryCount: Int!
  parentRunId: ID
}

type RunStatistics {
  total: Int!
  byStatus: JSON!
  byRepository: JSON!
  averageDurationMs: Float
  successRate: Float!
}

type ExecutiveSummary {
  themes: [String!]!
  riskLevel: String!
  suggestedActions: [String!]!
  summary: String!
}

type Repository @key(fields: "path") @extends {
  path: String! @external
  recentRuns: [AgentRun!]!
}
"#;

/// Everything the resolvers close over.
#[derive(Clone)]
pub struct AgentServices {
    /// Session manager.
    pub manager: Arc<SessionManager>,
    /// Pre-warm pool.
    pub pool: Arc<PreWarmPool>,
    /// Run store.
    pub runs: Arc<RunStore>,
    /// Batch dispatcher.
    pub batch: Arc<BatchDispatcher>,
    /// Service config.
    pub config: AgentServiceConfig,
}

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

fn str_list(args: &Map<String, Value>, name: &str) -> Vec<String> {
    args.get(name)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| DevmeshError::internal(format!("serialize: {e}")))
}

fn parse_run_status(name: &str) -> Result<RunStatus> {
    match name {
        "QUEUED" => Ok(RunStatus::Queued),
        "RUNNING" => Ok(RunStatus::Running),
        "SUCCESS" => Ok(RunStatus::Success),
        "FAILED" => Ok(RunStatus::Failed),
        "CANCELLED" => Ok(RunStatus::Cancelled),
        "RETRYING" => Ok(RunStatus::Retrying),
        other => Err(DevmeshError::bad_user_input(format!(
            "unknown run status '{other}'"
        ))),
    }
}

/// Build the agent subgraph schema around its services.
#[must_use]
pub fn build_schema(services: AgentServices) -> SubgraphSchema {
    let mut builder = SubgraphSchema::builder(SERVICE_NAME, SDL);

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------
    builder = builder.query(
        "claudeHealth",
        resolver(move |_ctx, _args| async move {
            Ok(json!({
                "healthy": true,
                "service": SERVICE_NAME,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }))
        }),
    );

    let svc = services.clone();
    builder = builder.query(
        "agentSession",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let id = required_str(&args, "id")?;
                match svc.manager.session(&id) {
                    Some(session) => to_json(&session),
                    None => Ok(Value::Null),
                }
            }
        }),
    );

    let svc = services.clone();
    builder = builder.query(
        "agentSessions",
        resolver(move |_ctx, _args| {
            let svc = svc.clone();
            async move { to_json(&svc.manager.sessions()) }
        }),
    );

    let svc = services.clone();
    builder = builder.query(
        "sessionStatistics",
        resolver(move |_ctx, _args| {
            let svc = svc.clone();
            async move { Ok(svc.manager.statistics()) }
        }),
    );

    let svc = services.clone();
    builder = builder.query(
        "sessionTemplates",
        resolver(move |_ctx, _args| {
            let svc = svc.clone();
            async move { to_json(&svc.manager.templates()) }
        }),
    );

    let svc = services.clone();
    builder = builder.query(
        "sharedSession",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let code = required_str(&args, "code")?;
                match svc.manager.redeem_share(&code) {
                    Some(session) => to_json(&session),
                    None => Ok(Value::Null),
                }
            }
        }),
    );

    let svc = services.clone();
    builder = builder.query(
        "preWarmMetrics",
        resolver(move |_ctx, _args| {
            let svc = svc.clone();
            async move { Ok(svc.pool.metrics()) }
        }),
    );

    let svc = services.clone();
    builder = builder.query(
        "agentRun",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let id = required_str(&args, "id")?;
                match svc.runs.get(&id) {
                    Some(run) => to_json(&run),
                    None => Ok(Value::Null),
                }
            }
        }),
    );

    let svc = services.clone();
    builder = builder.query(
        "agentRuns",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let mut filter = RunFilter {
                    repository: optional_str(&args, "repository"),
                    ..RunFilter::default()
                };
                if let Some(status) = optional_str(&args, "status") {
                    filter.status = Some(parse_run_status(&status)?);
                }
                if let Some(since) = optional_str(&args, "sinceIso") {
                    filter.since = Some(parse_iso(&since, "sinceIso")?);
                }
                if let Some(until) = optional_str(&args, "untilIso") {
                    filter.until = Some(parse_iso(&until, "untilIso")?);
                }
                to_json(&svc.runs.query(&filter))
            }
        }),
    );

    let svc = services.clone();
    builder = builder.query(
        "runStatistics",
        resolver(move |_ctx, _args| {
            let svc = svc.clone();
            async move { to_json(&svc.runs.statistics()) }
        }),
    );

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------
    let svc = services.clone();
    builder = builder.mutation(
        "executeCommand",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let prompt = required_str(&args, "prompt")?;
                let options = ExecuteOptions {
                    session_id:  optional_str(&args, "sessionId"),
                    working_dir: optional_str(&args, "workingDir"),
                    model:       optional_str(&args, "model"),
                    flags:       str_list(&args, "flags"),
                    name:        optional_str(&args, "name"),
                };
                to_json(&svc.manager.execute_command(prompt, options)?)
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "continueSession",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let session_id = required_str(&args, "sessionId")?;
                let prompt = required_str(&args, "prompt")?;
                let context = optional_str(&args, "additionalContext");
                to_json(&svc.manager.continue_session(&session_id, prompt, context)?)
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "killSession",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let session_id = required_str(&args, "sessionId")?;
                Ok(json!(svc.manager.kill_session(&session_id).await))
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "forkSession",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let session_id = required_str(&args, "sessionId")?;
                let message_index = args.get("messageIndex").and_then(Value::as_i64);
                let include_history = args
                    .get("includeHistory")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let fork = svc.manager.fork_session(
                    &session_id,
                    message_index,
                    optional_str(&args, "name"),
                    include_history,
                )?;
                to_json(&fork)
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "createSessionTemplate",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let session_id = required_str(&args, "sessionId")?;
                let name = required_str(&args, "name")?;
                let variables: Vec<TemplateVariable> = args
                    .get("variables")
                    .map(|v| serde_json::from_value(v.clone()))
                    .transpose()
                    .map_err(|e| {
                        DevmeshError::bad_user_input(format!("invalid variables: {e}"))
                    })?
                    .unwrap_or_default();
                let template = svc.manager.create_template(
                    &session_id,
                    name,
                    str_list(&args, "tags"),
                    variables,
                    optional_str(&args, "initialContext").unwrap_or_default(),
                    args.get("includeHistory")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                )?;
                to_json(&template)
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "createSessionFromTemplate",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let template_id = required_str(&args, "templateId")?;
                let session = svc
                    .manager
                    .create_from_template(&template_id, optional_str(&args, "name"))?;
                to_json(&session)
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "archiveSession",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let session_id = required_str(&args, "sessionId")?;
                let path = svc.manager.archive_session(&session_id).await?;
                Ok(json!(path.display().to_string()))
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "shareSession",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let session_id = required_str(&args, "sessionId")?;
                let ttl = args
                    .get("ttlSecs")
                    .and_then(Value::as_u64)
                    .unwrap_or(3600);
                to_json(&svc.manager.share_session(&session_id, Duration::from_secs(ttl))?)
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "batchSessionOperation",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let ids = str_list(&args, "sessionIds");
                let op = required_str(&args, "operation")?;
                let params = args.get("params").cloned();
                to_json(
                    &svc.manager
                        .batch_operation(&ids, &op, params.as_ref())
                        .await,
                )
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "createHandoffDocument",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let session_id = required_str(&args, "sessionId")?;
                let path = svc.manager.create_handoff(&session_id)?;
                Ok(json!(path.display().to_string()))
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "claimPreWarmedSession",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                match svc.pool.claim() {
                    Ok((transport, correlator)) => {
                        let session_id = svc.manager.adopt_prewarmed(
                            transport,
                            correlator,
                            optional_str(&args, "name"),
                        );
                        Ok(json!({
                            "success": true,
                            "sessionId": session_id,
                            "status": "CLAIMED",
                        }))
                    }
                    Err(outcome) => Ok(json!({
                        "success": false,
                        "sessionId": Value::Null,
                        "status": outcome.status,
                    })),
                }
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "generateCommitMessages",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let items: Vec<BatchItem> = args
                    .get("items")
                    .map(|v| serde_json::from_value(v.clone()))
                    .transpose()
                    .map_err(|e| DevmeshError::bad_user_input(format!("invalid items: {e}")))?
                    .unwrap_or_default();
                if items.is_empty() {
                    return Err(DevmeshError::bad_user_input("items must be non-empty"));
                }
                to_json(&svc.batch.generate_commit_messages(items).await?)
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "generateExecutiveSummary",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let messages: Vec<(String, String)> = args
                    .get("messages")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|item| {
                                Some((
                                    item.get("repoName")?.as_str()?.to_string(),
                                    item.get("message")?.as_str()?.to_string(),
                                ))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                to_json(&svc.batch.generate_executive_summary(&messages).await?)
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "retryAgentRun",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let id = required_str(&args, "id")?;
                to_json(&svc.runs.retry(&id)?)
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "cancelAgentRun",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let id = required_str(&args, "id")?;
                to_json(&svc.runs.cancel(&id)?)
            }
        }),
    );

    let svc = services.clone();
    builder = builder.mutation(
        "deleteOldRuns",
        resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let days = args
                    .get("olderThanDays")
                    .and_then(Value::as_i64)
                    .unwrap_or(30);
                Ok(json!(svc.runs.delete_older_than(days)))
            }
        }),
    );

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------
    let svc = services.clone();
    builder = builder.subscription(
        "commandOutput",
        stream_resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let session_id = required_str(&args, "sessionId")?;
                let receiver = svc.manager.subscribe_output(&session_id)?;
                let stream = BroadcastStream::new(receiver)
                    .filter_map(|frame| async move { frame.ok() })
                    .map(|frame| to_json(&frame));
                Ok(stream.boxed())
            }
        }),
    );

    let svc = services.clone();
    builder = builder.subscription(
        "preWarmStatus",
        stream_resolver(move |_ctx, _args| {
            let svc = svc.clone();
            async move {
                let receiver = svc.pool.subscribe();
                let stream = BroadcastStream::new(receiver)
                    .filter_map(|event| async move { event.ok() })
                    .map(|event| to_json(&event));
                Ok(stream.boxed())
            }
        }),
    );

    let svc = services.clone();
    builder = builder.subscription(
        "batchProgress",
        stream_resolver(move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let batch_id = required_str(&args, "batchId")?;
                let receiver = svc.batch.subscribe_progress();
                let stream = BroadcastStream::new(receiver)
                    .filter_map(|frame| async move { frame.ok() })
                    .filter(move |frame| {
                        let matches = frame.batch_id == batch_id;
                        async move { matches }
                    })
                    .map(|frame| to_json(&frame));
                Ok(stream.boxed())
            }
        }),
    );

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------
    let svc = services.clone();
    builder = builder.entity(
        "AgentSession",
        entity_resolver(move |_ctx, rep| {
            let svc = svc.clone();
            async move {
                let Some(id) = rep.get("id").and_then(Value::as_str) else {
                    return Ok(None);
                };
                match svc.manager.session(id) {
                    Some(session) => Ok(Some(to_json(&session)?)),
                    None => Ok(None),
                }
            }
        }),
    );

    let svc = services.clone();
    builder = builder.entity(
        "AgentRun",
        entity_resolver(move |_ctx, rep| {
            let svc = svc.clone();
            async move {
                let Some(id) = rep.get("id").and_then(Value::as_str) else {
                    return Ok(None);
                };
                match svc.runs.get(id) {
                    Some(run) => Ok(Some(to_json(&run)?)),
                    None => Ok(None),
                }
            }
        }),
    );

    let svc = services.clone();
    builder = builder.entity(
        "Repository",
        entity_resolver(move |_ctx, rep| {
            let svc = svc.clone();
            async move {
                let Some(path) = rep.get("path").and_then(Value::as_str) else {
                    return Ok(None);
                };
                let recent: Vec<AgentRun> = svc
                    .runs
                    .query(&RunFilter {
                        repository: Some(path.to_string()),
                        ..RunFilter::default()
                    })
                    .into_iter()
                    .take(10)
                    .collect();
                Ok(Some(json!({
                    "__typename": "Repository",
                    "path": path,
                    "recentRuns": to_json(&recent)?,
                })))
            }
        }),
    );

    builder.build()
}

fn parse_iso(value: &str, field: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| DevmeshError::bad_user_input_at(format!("invalid timestamp: {e}"), field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::testing::FakeLauncher;
    use devmesh_graphql::request::GraphQLRequest;
    use devmesh_graphql::sse::StreamFrame;
    use devmesh_subgraph::{execute, execute_stream, ResolverCtx};

    fn services() -> AgentServices {
        let launcher = FakeLauncher::new();
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentServiceConfig {
            workspace_root: tmp.path().to_path_buf(),
            archive_dir: tmp.path().join("archives"),
            ..AgentServiceConfig::default()
        };
        std::mem::forget(tmp);
        let manager = SessionManager::new(config.clone(), launcher.clone());
        let pool = PreWarmPool::new(&config, launcher);
        let runs = Arc::new(RunStore::new());
        let batch = BatchDispatcher::new(
            manager.clone(),
            runs.clone(),
            Duration::from_secs(config.batch_cache_ttl_secs),
        );
        AgentServices {
            manager,
            pool,
            runs,
            batch,
            config,
        }
    }

    #[tokio::test]
    async fn test_sdl_parses() {
        let schema = build_schema(services());
        graphql_parser::parse_schema::<String>(&schema.federation_sdl()).unwrap();
    }

    #[tokio::test]
    async fn test_health_and_statistics() {
        let schema = build_schema(services());
        let request = GraphQLRequest::new(
            "{ claudeHealth { healthy service } sessionStatistics { totalSessions } }",
        );
        let response = execute(&schema, &request, &ResolverCtx::default()).await;
        let data = response.data.unwrap();
        assert_eq!(data["claudeHealth"]["healthy"], json!(true));
        assert_eq!(data["claudeHealth"]["service"], json!("claude-agent"));
        assert_eq!(data["sessionStatistics"]["totalSessions"], json!(0));
    }

    #[tokio::test]
    async fn test_execute_and_stream_roundtrip() {
        let svc = services();
        let manager = svc.manager.clone();
        let schema = build_schema(svc);

        let request = GraphQLRequest::new(
            r#"mutation { executeCommand(prompt: "hello world") { sessionId success estimatedDurationMs } }"#,
        );
        let response = execute(&schema, &request, &ResolverCtx::default()).await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        let receipt = &response.data.unwrap()["executeCommand"];
        assert_eq!(receipt["success"], json!(true));
        assert_eq!(receipt["estimatedDurationMs"], json!(2020));
        let session_id = receipt["sessionId"].as_str().unwrap().to_string();

        // Wait for the first command to finish, then subscribe before
        // issuing the next one: subscribers only see frames published
        // after they attach.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let done = manager
                .session(&session_id)
                .is_some_and(|s| s.history.first().is_some_and(|i| i.response.is_some()));
            if done {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "first command never completed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let sub = GraphQLRequest::new(format!(
            r#"subscription {{ commandOutput(sessionId: "{session_id}") {{ content isFinal type }} }}"#
        ));
        let mut frames = execute_stream(&schema, &sub, &ResolverCtx::default())
            .await
            .unwrap();

        let follow_up = GraphQLRequest::new(format!(
            r#"mutation {{ continueSession(sessionId: "{session_id}", prompt: "again") {{ success }} }}"#
        ));
        let response = execute(&schema, &follow_up, &ResolverCtx::default()).await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);

        let mut saw_final = false;
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_secs(2), frames.next()).await
        {
            if let StreamFrame::Next { payload } = frame {
                let out = &payload.data.unwrap()["commandOutput"];
                if out["isFinal"] == json!(true) {
                    saw_final = true;
                    break;
                }
            }
        }
        assert!(saw_final);
    }

    #[tokio::test]
    async fn test_kill_missing_session_returns_success() {
        let schema = build_schema(services());
        let request =
            GraphQLRequest::new(r#"mutation { killSession(sessionId: "missing") }"#);
        let response = execute(&schema, &request, &ResolverCtx::default()).await;
        assert_eq!(response.data.unwrap()["killSession"], json!(true));
    }

    #[tokio::test]
    async fn test_retry_non_terminal_is_bad_input() {
        let svc = services();
        let run = svc.runs.create("repoA", json!({}));
        let schema = build_schema(svc);

        let request = GraphQLRequest::new(format!(
            r#"mutation {{ retryAgentRun(id: "{}") {{ id }} }}"#,
            run.id
        ));
        let response = execute(&schema, &request, &ResolverCtx::default()).await;
        assert_eq!(response.errors[0].code(), Some("BAD_USER_INPUT"));
    }

    #[tokio::test]
    async fn test_claim_prewarm_flow() {
        let svc = services();
        let pool = svc.pool.clone();
        let schema = build_schema(svc);

        // Nothing warmed yet.
        let request =
            GraphQLRequest::new("mutation { claimPreWarmedSession { success status } }");
        let response = execute(&schema, &request, &ResolverCtx::default()).await;
        let claim = &response.data.unwrap()["claimPreWarmedSession"];
        assert_eq!(claim["success"], json!(false));
        assert_eq!(claim["status"], json!("NONE"));

        // Warm the pool, then claim successfully.
        pool.maintain().await;
        assert!(pool.wait_ready(1, Duration::from_secs(2)).await);
        let response = execute(
            &schema,
            &GraphQLRequest::new(
                "mutation { claimPreWarmedSession { success sessionId status } }",
            ),
            &ResolverCtx::default(),
        )
        .await;
        let claim = &response.data.unwrap()["claimPreWarmedSession"];
        assert_eq!(claim["success"], json!(true));
        assert!(claim["sessionId"].is_string());
    }

    #[tokio::test]
    async fn test_repository_entity_extension() {
        let svc = services();
        let run = svc.runs.create("/ws/repoA", json!({}));
        svc.runs.mark_success(&run.id, json!({}));
        let schema = build_schema(svc);

        let request = GraphQLRequest::new(
            r#"query($reps: [_Any!]!) { _entities(representations: $reps) { ... on Repository { path recentRuns { id status } } } }"#,
        )
        .with_variables(json!({
            "reps": [{"__typename": "Repository", "path": "/ws/repoA"}]
        }));
        let response = execute(&schema, &request, &ResolverCtx::default()).await;
        let entity = &response.data.unwrap()["_entities"][0];
        assert_eq!(entity["path"], json!("/ws/repoA"));
        assert_eq!(entity["recentRuns"][0]["status"], json!("SUCCESS"));
    }
}
