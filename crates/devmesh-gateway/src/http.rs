//! HTTP surface of the gateway.
//!
//! - `POST /graphql` - queries and mutations
//! - `GET /graphql` - `graphql-transport-ws` upgrade, or the landing
//!   page for plain requests
//! - `POST /graphql/stream` - subscriptions over server-sent events
//! - `GET /health`, `GET /services`, `GET /metrics`

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use devmesh_error::DevmeshError;
use devmesh_graphql::request::{GraphQLRequest, GraphQLResponse, WireError};
use devmesh_graphql::sse::StreamFrame;
use futures::{Stream, StreamExt};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::executor::{handle_request, subscription_target, RequestHeaders};
use crate::state::GatewayState;
use crate::subscriptions::{open_upstream, pump};
use crate::ws;

/// Build the gateway router.
#[must_use]
pub fn router(state: GatewayState) -> Router {
    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_credentials(true)
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
    };

    Router::new()
        .route("/graphql", post(post_graphql).get(get_graphql))
        .route("/graphql/stream", post(post_graphql_stream))
        .route("/health", get(health_handler))
        .route("/services", get(services_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn headers_of(headers: &HeaderMap) -> RequestHeaders {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    };
    RequestHeaders {
        correlation_id: get("x-correlation-id"),
        authorization:  get("authorization"),
        cache_scope:    get("x-cache-scope"),
    }
}

fn client_ip(connect: &ConnectInfo<SocketAddr>, headers: &HeaderMap) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| connect.0.ip())
}

async fn post_graphql(
    State(state): State<GatewayState>,
    connect: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<GraphQLRequest>,
) -> Response {
    let ip = client_ip(&connect, &headers);
    if let Err(retry_after) = state.limiter.check(ip) {
        let err = DevmeshError::TooManyRequests {
            retry_after_secs: retry_after,
        };
        let body = GraphQLResponse::error(WireError::from_error(&err));
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    }

    let started = Instant::now();
    let request_headers = headers_of(&headers);
    let response = handle_request(&state, &request, &request_headers).await;
    state
        .metrics
        .record(started.elapsed().as_millis() as u64, !response.is_ok());

    Json(response).into_response()
}

/// Wraps [`WebSocketUpgrade`] so it can be extracted optionally: `axum` 0.8
/// only allows `Option<T>` extraction for types that implement
/// `OptionalFromRequestParts`, which `WebSocketUpgrade` does not.
struct MaybeWebSocketUpgrade(Option<WebSocketUpgrade>);

impl<S> FromRequestParts<S> for MaybeWebSocketUpgrade
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            WebSocketUpgrade::from_request_parts(parts, state).await.ok(),
        ))
    }
}

async fn get_graphql(
    State(state): State<GatewayState>,
    MaybeWebSocketUpgrade(ws): MaybeWebSocketUpgrade,
    headers: HeaderMap,
) -> Response {
    if let Some(upgrade) = ws {
        let request_headers = headers_of(&headers);
        return upgrade
            .protocols(["graphql-transport-ws"])
            .on_upgrade(move |socket| ws::handle_socket(socket, state, request_headers))
            .into_response();
    }

    if state.config.introspection_enabled {
        Html(landing_page()).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn post_graphql_stream(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<GraphQLRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let request_headers = headers_of(&headers);
    let correlation_id = request_headers
        .correlation_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let frames: ReceiverStream<StreamFrame> = match open_subscription(
        &state,
        &request,
        &correlation_id,
        request_headers.authorization.as_deref(),
    )
    .await
    {
        Ok(receiver) => ReceiverStream::new(receiver),
        Err(err) => {
            debug!(error = %err, "subscription setup failed");
            let (tx, rx) = tokio::sync::mpsc::channel(1);
            let _ = tx.try_send(StreamFrame::Error {
                errors: vec![WireError::from_error(&err)],
            });
            ReceiverStream::new(rx)
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

/// Open one upstream subscription and return the bounded client-facing
/// receiver.
pub(crate) async fn open_subscription(
    state: &GatewayState,
    request: &GraphQLRequest,
    correlation_id: &str,
    authorization: Option<&str>,
) -> devmesh_error::Result<tokio::sync::mpsc::Receiver<StreamFrame>> {
    let (field, owner) = subscription_target(state, request)?;
    let url = state
        .composer
        .url_of(&owner)
        .ok_or_else(|| {
            DevmeshError::subgraph_unavailable(&owner, "subgraph is not registered")
        })?
        .to_string();

    debug!(field = %field, subgraph = %owner, "opening upstream subscription");
    let upstream = open_upstream(&owner, &url, request, correlation_id, authorization).await?;
    let (receiver, _task) = pump(
        upstream,
        state.config.subscription_buffer,
        std::time::Duration::from_secs(state.config.subscription_idle_secs),
    );
    Ok(receiver)
}

async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let composition = state.composer.health();
    let healthy = composition["composed"] == json!(true)
        && composition["compositionError"].is_null();

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "service": "devmesh-gateway",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "details": { "composition": composition },
        })),
    )
}

async fn services_handler(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({ "services": state.composer.services() }))
}

async fn metrics_handler(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(state.metrics.snapshot())
}

fn landing_page() -> String {
    r#"<!DOCTYPE html>
<html>
  <head>
    <title>devmesh gateway</title>
    <style>
      body { margin: 0; height: 100vh; }
      #graphiql { height: 100vh; }
    </style>
    <link rel="stylesheet" href="https://unpkg.com/graphiql/graphiql.min.css" />
  </head>
  <body>
    <div id="graphiql">Loading GraphiQL...</div>
    <script crossorigin src="https://unpkg.com/react/umd/react.production.min.js"></script>
    <script crossorigin src="https://unpkg.com/react-dom/umd/react-dom.production.min.js"></script>
    <script crossorigin src="https://unpkg.com/graphiql/graphiql.min.js"></script>
    <script>
      const fetcher = GraphiQL.createFetcher({ url: '/graphql' });
      ReactDOM.render(
        React.createElement(GraphiQL, { fetcher }),
        document.getElementById('graphiql'),
      );
    </script>
  </body>
</html>"#
        .to_string()
}
