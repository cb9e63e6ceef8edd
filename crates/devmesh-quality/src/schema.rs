//! GraphQL schema and resolvers for the quality subgraph.

use std::sync::Arc;

use devmesh_error::{DevmeshError, Result};
use devmesh_subgraph::{entity_resolver, resolver, stream_resolver, SubgraphSchema};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio_stream::wrappers::BroadcastStream;

use crate::store::{QualityStore, RawViolation};

/// Subgraph service name.
pub const SERVICE_NAME: &str = "quality";

/// Base SDL published through `_service { sdl }`.
pub const SDL: &str = r#"type Query {
  qualityHealth: ServiceHealth!
  qualityFiles: [QualityFile!]!
  qualityFile(path: String!): QualityFile
  fileViolations(path: String!): [Violation!]!
  qualitySession(id: ID!): QualitySession
  qualityMetrics(sinceIso: String): [QualityMetric!]!
}

type Mutation {
  beginQualitySession(tool: String!): QualitySession!
  recordFileResults(sessionId: ID!, path: String!, violations: [ViolationInput!]!): QualityFile!
  completeQualitySession(sessionId: ID!): QualitySession!
}

type Subscription {
  qualityEvents: QualityEvent!
}

type ServiceHealth @shareable {
  healthy: Boolean!
  service: String!
  timestamp: String!
}

type QualityFile @key(fields: "path") {
  path: String!
  violations: [Violation!]!
  lastProcessed: String!
  processCount: Int!
}

enum Severity {
  INFO
  WARNING
  ERROR
}

type Violation {
  id: ID!
  rule: String!
  severity: Severity!
  line: Int!
  column: Int!
  message: String!
  tool: String!
}

input ViolationInput {
  rule: String!
  severity: Severity!
  line: Int!
  column: Int!
  message: String!
  tool: String
}

type QualitySession {
  id: ID!
  startedAt: String!
  completedAt: String
  filesProcessed: Int!
  violationsFound: Int!
  tool: String!
}

type QualityMetric {
  bucket: String!
  errors: Int!
  warnings: Int!
  infos: Int!
  filesProcessed: Int!
}

type QualityEvent {
  path: String!
  violations: Int!
  sessionId: ID!
  at: String!
}

type Repository @key(fields: "path") @extends {
  path: String! @external
  qualityFiles: [QualityFile!]!
}
"#;

fn required_str(args: &Map<String, Value>, name: &str) -> Result<String> {
    args.get(name)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| DevmeshError::bad_user_input(format!("argument '{name}' is required")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| DevmeshError::internal(format!("serialize: {e}")))
}

/// Build the quality subgraph schema around a store.
#[must_use]
pub fn build_schema(store: Arc<QualityStore>) -> SubgraphSchema {
    let health = resolver(move |_ctx, _args| async move {
        Ok(json!({
            "healthy": true,
            "service": SERVICE_NAME,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    });

    let files = {
        let store = store.clone();
        resolver(move |_ctx, _args| {
            let store = store.clone();
            async move { to_json(&store.files()) }
        })
    };

    let file = {
        let store = store.clone();
        resolver(move |_ctx, args| {
            let store = store.clone();
            async move {
                let path = required_str(&args, "path")?;
                match store.file(&path) {
                    Some(file) => to_json(&file),
                    None => Ok(Value::Null),
                }
            }
        })
    };

    let violations = {
        let store = store.clone();
        resolver(move |_ctx, args| {
            let store = store.clone();
            async move {
                let path = required_str(&args, "path")?;
                let violations = store.file(&path).map(|f| f.violations).unwrap_or_default();
                to_json(&violations)
            }
        })
    };

    let session = {
        let store = store.clone();
        resolver(move |_ctx, args| {
            let store = store.clone();
            async move {
                let id = required_str(&args, "id")?;
                match store.session(&id) {
                    Some(session) => to_json(&session),
                    None => Ok(Value::Null),
                }
            }
        })
    };

    let metrics = {
        let store = store.clone();
        resolver(move |_ctx, args| {
            let store = store.clone();
            async move {
                let since = match args.get("sinceIso").and_then(Value::as_str) {
                    Some(iso) => chrono::DateTime::parse_from_rfc3339(iso)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                        .map_err(|e| {
                            DevmeshError::bad_user_input(format!("invalid sinceIso: {e}"))
                        })?,
                    None => chrono::Utc::now() - chrono::Duration::hours(1),
                };
                to_json(&store.metrics_since(since))
            }
        })
    };

    let begin_session = {
        let store = store.clone();
        resolver(move |_ctx, args| {
            let store = store.clone();
            async move {
                let tool = required_str(&args, "tool")?;
                to_json(&store.begin_session(tool))
            }
        })
    };

    let record_results = {
        let store = store.clone();
        resolver(move |_ctx, args| {
            let store = store.clone();
            async move {
                let session_id = required_str(&args, "sessionId")?;
                let path = required_str(&args, "path")?;
                let raw: Vec<RawViolation> = args
                    .get("violations")
                    .map(|v| serde_json::from_value(v.clone()))
                    .transpose()
                    .map_err(|e| {
                        DevmeshError::bad_user_input(format!("invalid violations: {e}"))
                    })?
                    .unwrap_or_default();
                to_json(&store.record_file(&session_id, &path, raw)?)
            }
        })
    };

    let complete_session = {
        let store = store.clone();
        resolver(move |_ctx, args| {
            let store = store.clone();
            async move {
                let session_id = required_str(&args, "sessionId")?;
                to_json(&store.complete_session(&session_id)?)
            }
        })
    };

    let events = {
        let store = store.clone();
        stream_resolver(move |_ctx, _args| {
            let store = store.clone();
            async move {
                let receiver = store.subscribe();
                let stream = BroadcastStream::new(receiver)
                    .filter_map(|event| async move { event.ok() })
                    .map(|event| to_json(&event));
                Ok(stream.boxed())
            }
        })
    };

    let file_entity = {
        let store = store.clone();
        entity_resolver(move |_ctx, rep| {
            let store = store.clone();
            async move {
                let Some(path) = rep.get("path").and_then(Value::as_str) else {
                    return Ok(None);
                };
                match store.file(path) {
                    Some(file) => Ok(Some(to_json(&file)?)),
                    None => Ok(None),
                }
            }
        })
    };

    let repository_entity = {
        let store = store.clone();
        entity_resolver(move |_ctx, rep| {
            let store = store.clone();
            async move {
                let Some(path) = rep.get("path").and_then(Value::as_str) else {
                    return Ok(None);
                };
                // Files under the repository path.
                let files: Vec<_> = store
                    .files()
                    .into_iter()
                    .filter(|f| f.path.starts_with(path))
                    .collect();
                Ok(Some(json!({
                    "__typename": "Repository",
                    "path": path,
                    "qualityFiles": to_json(&files)?,
                })))
            }
        })
    };

    SubgraphSchema::builder(SERVICE_NAME, SDL)
        .query("qualityHealth", health)
        .query("qualityFiles", files)
        .query("qualityFile", file)
        .query("fileViolations", violations)
        .query("qualitySession", session)
        .query("qualityMetrics", metrics)
        .mutation("beginQualitySession", begin_session)
        .mutation("recordFileResults", record_results)
        .mutation("completeQualitySession", complete_session)
        .subscription("qualityEvents", events)
        .entity("QualityFile", file_entity)
        .entity("Repository", repository_entity)
        .build()
}
