//! End-to-end federation tests: a gateway composing two live
//! subgraph servers over HTTP.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use devmesh_gateway::config::{GatewayConfig, SubgraphEndpoint};
use devmesh_gateway::http::router;
use devmesh_gateway::GatewayState;
use devmesh_graphql::request::{GraphQLRequest, GraphQLResponse};
use devmesh_subgraph::{entity_resolver, resolver, stream_resolver, SubgraphSchema};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;

const GIT_SDL: &str = r#"type Query {
  repoAgentHealth: ServiceHealth!
  repository(path: String!): Repository
}

type Mutation {
  touchRepository(path: String!): Repository!
}

type ServiceHealth @shareable {
  healthy: Boolean!
  service: String!
  timestamp: String!
  correlationId: String!
}

type Repository @key(fields: "path") {
  path: String!
  branch: String!
  isDirty: Boolean!
}
"#;

const AGENT_SDL: &str = r#"type Query {
  claudeHealth: ServiceHealth!
}

type Subscription {
  ticks(count: Int): Tick!
}

type Tick {
  tick: Int!
}

type ServiceHealth @shareable {
  healthy: Boolean!
  service: String!
  timestamp: String!
  correlationId: String!
}

type AgentRun @key(fields: "id") {
  id: ID!
  status: String!
}

type Repository @key(fields: "path") @extends {
  path: String! @external
  recentRuns: [AgentRun!]!
}
"#;

fn git_schema(repo_lookups: Arc<AtomicUsize>) -> SubgraphSchema {
    SubgraphSchema::builder("git", GIT_SDL)
        .query(
            "repoAgentHealth",
            resolver(|ctx, _args| async move {
                Ok(json!({
                    "healthy": true,
                    "service": "git",
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "correlationId": ctx.correlation_id,
                }))
            }),
        )
        .query("repository", {
            let lookups = repo_lookups.clone();
            resolver(move |_ctx, args| {
                let lookups = lookups.clone();
                async move {
                    lookups.fetch_add(1, Ordering::SeqCst);
                    let path = args["path"].as_str().unwrap_or_default().to_string();
                    Ok(json!({
                        "__typename": "Repository",
                        "path": path,
                        "branch": "main",
                        "isDirty": false,
                    }))
                }
            })
        })
        .mutation(
            "touchRepository",
            resolver(|_ctx, args| async move {
                Ok(json!({
                    "__typename": "Repository",
                    "path": args["path"],
                    "branch": "main",
                    "isDirty": true,
                }))
            }),
        )
        .entity(
            "Repository",
            entity_resolver(|_ctx, rep| async move {
                Ok(Some(json!({
                    "__typename": "Repository",
                    "path": rep["path"],
                    "branch": "main",
                    "isDirty": false,
                })))
            }),
        )
        .build()
}

fn agent_schema() -> SubgraphSchema {
    SubgraphSchema::builder("claude-agent", AGENT_SDL)
        .query(
            "claudeHealth",
            resolver(|ctx, _args| async move {
                Ok(json!({
                    "healthy": true,
                    "service": "claude-agent",
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "correlationId": ctx.correlation_id,
                }))
            }),
        )
        .subscription(
            "ticks",
            stream_resolver(|_ctx, args| async move {
                let count = args.get("count").and_then(Value::as_i64).unwrap_or(3);
                let stream =
                    futures::stream::iter((0..count).map(|i| Ok(json!({"tick": i}))));
                Ok(stream.boxed())
            }),
        )
        .entity(
            "Repository",
            entity_resolver(|_ctx, rep| async move {
                Ok(Some(json!({
                    "__typename": "Repository",
                    "path": rep["path"],
                    "recentRuns": [
                        {"__typename": "AgentRun", "id": "run_1", "status": "SUCCESS"}
                    ],
                })))
            }),
        )
        .entity(
            "AgentRun",
            entity_resolver(|_ctx, rep| async move {
                Ok(Some(json!({
                    "__typename": "AgentRun",
                    "id": rep["id"],
                    "status": "SUCCESS",
                })))
            }),
        )
        .build()
}

async fn spawn_subgraph(schema: SubgraphSchema) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = devmesh_subgraph::router(Arc::new(schema))
        .into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

struct Fixture {
    state:        GatewayState,
    repo_lookups: Arc<AtomicUsize>,
}

async fn fixture() -> Fixture {
    let repo_lookups = Arc::new(AtomicUsize::new(0));
    let git_url = spawn_subgraph(git_schema(repo_lookups.clone())).await;
    let agent_url = spawn_subgraph(agent_schema()).await;

    let config = GatewayConfig {
        subgraphs: vec![
            SubgraphEndpoint {
                name: "git".to_string(),
                url:  git_url,
            },
            SubgraphEndpoint {
                name: "claude-agent".to_string(),
                url:  agent_url,
            },
        ],
        ..GatewayConfig::default()
    };
    let state = GatewayState::new(config);
    state.composer.recompose().await;
    assert!(state.composer.supergraph().is_some(), "composition failed");

    Fixture {
        state,
        repo_lookups,
    }
}

async fn post_query(
    state: &GatewayState,
    request: &GraphQLRequest,
    correlation: Option<&str>,
) -> GraphQLResponse {
    let app = router(state.clone());
    let mut builder = Request::post("/graphql")
        .header(header::CONTENT_TYPE, "application/json")
        // `oneshot` bypasses the connect-info make-service.
        .extension(axum::extract::ConnectInfo(SocketAddr::from((
            [127, 0, 0, 1],
            54321,
        ))));
    if let Some(correlation) = correlation {
        builder = builder.header("x-correlation-id", correlation);
    }
    let response = app
        .oneshot(
            builder
                .body(Body::from(serde_json::to_string(request).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 22)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_federated_health_with_correlation_propagation() {
    let fx = fixture().await;

    let request = GraphQLRequest::new(
        "{ repoAgentHealth { healthy correlationId } claudeHealth { healthy correlationId } }",
    );
    let response = post_query(&fx.state, &request, Some("corr-s1")).await;

    assert!(response.errors.is_empty(), "{:?}", response.errors);
    let data = response.data.unwrap();
    assert_eq!(data["repoAgentHealth"]["healthy"], json!(true));
    assert_eq!(data["claudeHealth"]["healthy"], json!(true));
    // Both subgraphs observed the same inbound correlation id.
    assert_eq!(data["repoAgentHealth"]["correlationId"], json!("corr-s1"));
    assert_eq!(data["claudeHealth"]["correlationId"], json!("corr-s1"));

    // Top-level order matches the client selection.
    let keys: Vec<&String> = data.as_object().unwrap().keys().collect();
    assert_eq!(keys, vec!["repoAgentHealth", "claudeHealth"]);
}

#[tokio::test]
async fn test_entity_extension_resolves_across_subgraphs() {
    let fx = fixture().await;

    let request = GraphQLRequest::new(
        r#"{ repository(path: "/ws/a") { branch recentRuns { id status } } }"#,
    );
    let response = post_query(&fx.state, &request, None).await;

    assert!(response.errors.is_empty(), "{:?}", response.errors);
    let repo = &response.data.unwrap()["repository"];
    assert_eq!(repo["branch"], json!("main"));
    assert_eq!(repo["recentRuns"][0]["id"], json!("run_1"));
    assert_eq!(repo["recentRuns"][0]["status"], json!("SUCCESS"));
    // Injected key fields do not leak into the client response.
    assert!(repo.get("path").is_none());
    assert!(repo.get("__typename").is_none());
}

#[tokio::test]
async fn test_cache_hit_and_mutation_invalidation() {
    let fx = fixture().await;
    let query = GraphQLRequest::new(r#"{ repository(path: "/ws/a") { branch } }"#);

    let first = post_query(&fx.state, &query, None).await;
    assert!(first.is_ok());
    assert_eq!(fx.repo_lookups.load(Ordering::SeqCst), 1);

    // Identical query within the TTL: served from cache, byte-identical.
    let second = post_query(&fx.state, &query, None).await;
    assert_eq!(fx.repo_lookups.load(Ordering::SeqCst), 1);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );

    // A mutation touching the git subgraph invalidates its entries.
    let mutation =
        GraphQLRequest::new(r#"mutation { touchRepository(path: "/ws/a") { isDirty } }"#);
    let mutated = post_query(&fx.state, &mutation, None).await;
    assert!(mutated.is_ok(), "{:?}", mutated.errors);

    let third = post_query(&fx.state, &query, None).await;
    assert!(third.is_ok());
    assert_eq!(fx.repo_lookups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unreachable_subgraph_yields_partial_data() {
    let fx = fixture().await;

    // Re-register the agent subgraph at a dead address, keeping the
    // composed supergraph (it survives subgraph outages by design).
    let supergraph = fx.state.composer.supergraph().unwrap();
    let config = GatewayConfig {
        subgraphs: vec![
            fx.state.config.subgraphs[0].clone(),
            SubgraphEndpoint {
                name: "claude-agent".to_string(),
                url:  "http://127.0.0.1:1".to_string(),
            },
        ],
        ..GatewayConfig::default()
    };
    let degraded = GatewayState::new(config);
    degraded.composer.install((*supergraph).clone());

    let request =
        GraphQLRequest::new("{ repoAgentHealth { healthy } claudeHealth { healthy } }");
    let response = post_query(&degraded, &request, None).await;

    let data = response.data.unwrap();
    assert_eq!(data["repoAgentHealth"]["healthy"], json!(true));
    assert_eq!(data["claudeHealth"], Value::Null);

    let error = &response.errors[0];
    assert_eq!(error.code(), Some("SUBGRAPH_UNAVAILABLE"));
    let encoded = serde_json::to_value(error).unwrap();
    assert_eq!(encoded["extensions"]["subgraph"], json!("claude-agent"));
    assert_eq!(encoded["path"][0], json!("claudeHealth"));
}

#[tokio::test]
async fn test_subscription_frames_in_order_over_sse() {
    let fx = fixture().await;
    let app = router(fx.state.clone());

    let request = GraphQLRequest::new("subscription { ticks(count: 3) { tick } }");
    let response = app
        .oneshot(
            Request::post("/graphql/stream")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_string(&request).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), 1 << 22)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&bytes);

    // Frames arrive in upstream order and end with complete.
    let tick_order: Vec<usize> = text
        .match_indices("\"tick\":")
        .map(|(idx, _)| {
            text[idx + 7..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse()
                .unwrap()
        })
        .collect();
    assert_eq!(tick_order, vec![0, 1, 2]);
    assert!(text.contains("event: complete"));
    let complete_pos = text.find("event: complete").unwrap();
    let last_tick_pos = text.rfind("\"tick\":").unwrap();
    assert!(last_tick_pos < complete_pos);
}

#[tokio::test]
async fn test_unknown_subscription_field_errors() {
    let fx = fixture().await;
    let app = router(fx.state.clone());

    let request = GraphQLRequest::new("subscription { nope }");
    let response = app
        .oneshot(
            Request::post("/graphql/stream")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_string(&request).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("event: error"));
    assert!(text.contains("BAD_USER_INPUT"));
}
