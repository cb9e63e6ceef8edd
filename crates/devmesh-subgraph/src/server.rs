//! HTTP serving for a subgraph.
//!
//! Routes: `POST /graphql` (operations), `GET /graphql` (landing
//! page), `POST /graphql/stream` (SSE subscriptions), `GET /health`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use devmesh_error::{DevmeshError, Result};
use devmesh_graphql::request::{GraphQLRequest, GraphQLResponse, WireError};
use devmesh_graphql::sse::StreamFrame;
use futures::{Stream, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::execute::{execute, execute_stream};
use crate::schema::{ResolverCtx, SubgraphSchema};

/// Header carrying the request correlation id.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

fn ctx_from_headers(headers: &HeaderMap) -> ResolverCtx {
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(uuid_like, ToString::to_string);
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    ResolverCtx {
        correlation_id,
        authorization,
    }
}

fn uuid_like() -> String {
    // Subgraphs normally receive a correlation id from the gateway;
    // direct callers get a locally minted one.
    format!("local-{}", uuid::Uuid::new_v4())
}

/// Build the axum router for a schema.
#[must_use]
pub fn router(schema: Arc<SubgraphSchema>) -> Router {
    Router::new()
        .route("/graphql", post(graphql_handler).get(landing_handler))
        .route("/graphql/stream", post(stream_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(schema)
}

/// Serve a schema on the given address until the process exits.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn serve(schema: Arc<SubgraphSchema>, addr: SocketAddr) -> Result<()> {
    let name = schema.name().to_string();
    let app = router(schema);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| DevmeshError::config(format!("failed to bind {addr}: {e}")))?;

    info!(subgraph = %name, %addr, "subgraph listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| DevmeshError::internal(format!("server error: {e}")))?;
    Ok(())
}

async fn graphql_handler(
    State(schema): State<Arc<SubgraphSchema>>,
    headers: HeaderMap,
    Json(request): Json<GraphQLRequest>,
) -> Json<GraphQLResponse> {
    let ctx = ctx_from_headers(&headers);
    Json(execute(&schema, &request, &ctx).await)
}

async fn stream_handler(
    State(schema): State<Arc<SubgraphSchema>>,
    headers: HeaderMap,
    Json(request): Json<GraphQLRequest>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let ctx = ctx_from_headers(&headers);

    let frames = match execute_stream(&schema, &request, &ctx).await {
        Ok(stream) => stream,
        Err(err) => {
            let error_frame = StreamFrame::Error {
                errors: vec![WireError::from_error(&err)],
            };
            futures::stream::once(async move { error_frame }).boxed()
        }
    };

    let events = frames.map(|frame| {
        let event = Event::default().event(frame.event_name());
        let event = match &frame {
            StreamFrame::Next { payload } => {
                event.data(serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string()))
            }
            StreamFrame::Error { errors } => {
                event.data(serde_json::to_string(errors).unwrap_or_else(|_| "[]".to_string()))
            }
            StreamFrame::Complete => event.data("{}"),
        };
        Ok(event)
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn health_handler(State(schema): State<Arc<SubgraphSchema>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": schema.name(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

async fn landing_handler(State(schema): State<Arc<SubgraphSchema>>) -> Html<String> {
    Html(landing_page(schema.name()))
}

fn landing_page(service: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <title>{service} - GraphQL</title>
    <style>
      body {{ font-family: system-ui, sans-serif; margin: 4rem auto; max-width: 40rem; }}
      code {{ background: #f4f4f4; padding: 0.15rem 0.4rem; border-radius: 3px; }}
    </style>
  </head>
  <body>
    <h1>{service}</h1>
    <p>This is a devmesh subgraph endpoint.</p>
    <ul>
      <li><code>POST /graphql</code> - queries and mutations</li>
      <li><code>POST /graphql/stream</code> - subscriptions (server-sent events)</li>
      <li><code>GET /health</code> - health check</li>
    </ul>
    <p>Schema SDL is published through <code>{{ _service {{ sdl }} }}</code>.</p>
  </body>
</html>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::resolver;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_schema() -> Arc<SubgraphSchema> {
        Arc::new(
            SubgraphSchema::builder("git", "type Query { ping: String }")
                .query("ping", resolver(|_ctx, _args| async { Ok(json!("pong")) }))
                .build(),
        )
    }

    #[tokio::test]
    async fn test_graphql_post() {
        let app = router(test_schema());
        let body = serde_json::to_string(&GraphQLRequest::new("{ ping }")).unwrap();
        let response = app
            .oneshot(
                Request::post("/graphql")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let parsed: GraphQLResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.data.unwrap()["ping"], json!("pong"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(test_schema());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["service"], json!("git"));
        assert_eq!(parsed["status"], json!("healthy"));
    }

    #[tokio::test]
    async fn test_landing_page_on_get() {
        let app = router(test_schema());
        let response = app
            .oneshot(Request::get("/graphql").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
            .await
            .unwrap();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains("devmesh subgraph"));
    }
}
