//! Gateway request lifecycle.
//!
//! Parse and validate, derive the correlation scope, consult the
//! response cache, plan, fan out to the owning subgraphs in parallel
//! (mutations keep client order), resolve entity references, project
//! the merged result back onto the client's selection, and maintain the
//! cache. Partial data is preferred over total failure: a failed
//! subgraph nulls its fields with a path-qualified error while other
//! subgraphs still answer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use devmesh_error::{DevmeshError, Result};
use devmesh_events::{RequestEvent, RequestScope};
use devmesh_graphql::ops::{
    self, canonical_text, canonical_variables, count_aliases, find_operation, max_depth, parse,
    top_level_fields,
};
use devmesh_graphql::projection::{to_owned_with_variables, OwnedSelection};
use devmesh_graphql::request::{GraphQLRequest, GraphQLResponse, WireError};
use devmesh_graphql::OperationKind;
use serde_json::{json, Map, Value};
use tracing::{debug, info_span, Instrument};

use crate::cache::ResponseCache;
use crate::composer::Composer;
use crate::entities::resolve_extensions;
use crate::plan::{self, SubgraphCall};
use crate::state::GatewayState;

/// Headers the gateway consumes and forwards.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    /// Inbound `x-correlation-id`, if any.
    pub correlation_id: Option<String>,
    /// `authorization`, forwarded verbatim.
    pub authorization: Option<String>,
    /// Opt-in cache scope token (`x-cache-scope`).
    pub cache_scope: Option<String>,
}

/// HTTP client for subgraph calls, carrying per-request headers.
pub struct SubgraphClient {
    http:           reqwest::Client,
    composer:       Arc<Composer>,
    timeout:        Duration,
    correlation_id: String,
    authorization:  Option<String>,
}

impl SubgraphClient {
    /// Build a client for one request.
    #[must_use]
    pub fn new(
        composer: Arc<Composer>,
        timeout: Duration,
        correlation_id: String,
        authorization: Option<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            composer,
            timeout,
            correlation_id,
            authorization,
        }
    }

    /// POST one operation to a subgraph.
    ///
    /// # Errors
    ///
    /// `SUBGRAPH_UNAVAILABLE` for transport failures and
    /// `SUBGRAPH_TIMEOUT` for deadline overruns.
    pub async fn call(
        &self,
        subgraph: &str,
        query: &str,
        variables: Map<String, Value>,
    ) -> Result<GraphQLResponse> {
        let url = self
            .composer
            .url_of(subgraph)
            .ok_or_else(|| {
                DevmeshError::subgraph_unavailable(subgraph, "subgraph is not registered")
            })?
            .trim_end_matches('/')
            .to_string();

        let request = GraphQLRequest {
            query:          query.to_string(),
            variables:      if variables.is_empty() {
                None
            } else {
                Some(Value::Object(variables))
            },
            operation_name: None,
        };

        let mut builder = self
            .http
            .post(format!("{url}/graphql"))
            .header("x-correlation-id", &self.correlation_id)
            .json(&request);
        if let Some(authorization) = &self.authorization {
            builder = builder.header("authorization", authorization);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DevmeshError::subgraph_timeout(subgraph, self.timeout.as_millis() as u64)
            } else {
                DevmeshError::subgraph_unavailable(subgraph, e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(DevmeshError::subgraph_unavailable(
                subgraph,
                format!("HTTP {}", response.status()),
            ));
        }

        response
            .json::<GraphQLResponse>()
            .await
            .map_err(|e| DevmeshError::subgraph_unavailable(subgraph, format!("bad body: {e}")))
    }
}

/// Execute one client request end to end.
pub async fn handle_request(
    state: &GatewayState,
    request: &GraphQLRequest,
    headers: &RequestHeaders,
) -> GraphQLResponse {
    let scope = match &headers.correlation_id {
        Some(id) => RequestScope::new(id.clone()),
        None => RequestScope::minted(),
    };
    let span = info_span!("request", correlation_id = %scope.correlation_id());

    async {
        match run(state, request, headers, &scope).await {
            Ok(response) => response,
            Err(err) => GraphQLResponse::error(
                WireError::from_error(&err)
                    .with_extension("correlationId", json!(scope.correlation_id())),
            ),
        }
    }
    .instrument(span)
    .await
}

async fn run(
    state: &GatewayState,
    request: &GraphQLRequest,
    headers: &RequestHeaders,
    scope: &RequestScope,
) -> Result<GraphQLResponse> {
    let doc = parse(&request.query)?;
    let op = find_operation(&doc, request.operation_name.as_deref())?;

    let depth = max_depth(&op);
    if depth > state.config.max_depth {
        return Err(DevmeshError::QueryTooDeep {
            depth,
            max_depth: state.config.max_depth,
        });
    }
    if count_aliases(&op) > state.config.max_aliases {
        return Err(DevmeshError::bad_user_input(format!(
            "operation exceeds the alias limit of {}",
            state.config.max_aliases
        )));
    }
    if op.kind == OperationKind::Subscription {
        return Err(DevmeshError::bad_user_input(
            "subscriptions must use the streaming transport",
        ));
    }

    let variables = request.variable_map();
    let field_names: Vec<String> = top_level_fields(&op)
        .iter()
        .map(|f| f.name.clone())
        .collect();

    // Cache lookup applies to queries only.
    let fingerprint = if op.kind == OperationKind::Query {
        let fp = ResponseCache::fingerprint(
            &canonical_text(&request.query)?,
            &canonical_variables(request.variables.as_ref()),
            headers.cache_scope.as_deref(),
        );
        if let Some(hit) = state.cache.get(&fp) {
            scope.publish(RequestEvent::CacheHit {
                fingerprint: fp.clone(),
            });
            return Ok(hit);
        }
        Some(fp)
    } else {
        None
    };

    let supergraph = state.composer.require_supergraph()?;
    let planned = plan::plan(&supergraph, &op, &variables)?;
    let owned_selections = to_owned_with_variables(op.selection_set, &op.fragments, &variables);

    let client = SubgraphClient::new(
        state.composer.clone(),
        state.config.subgraph_timeout(),
        scope.correlation_id().to_string(),
        headers.authorization.clone(),
    );

    let mut merged = Map::new();
    let mut errors = Vec::new();

    match planned.kind {
        OperationKind::Mutation => {
            // Mutations run serially, preserving client order across
            // subgraphs.
            for call in &planned.calls {
                dispatch_call(&client, scope, call, &mut merged, &mut errors).await;
            }
        }
        _ => {
            let calls: Vec<_> = planned
                .calls
                .iter()
                .map(|call| {
                    let client = &client;
                    async move {
                        let mut local_data = Map::new();
                        let mut local_errors = Vec::new();
                        dispatch_call(client, scope, call, &mut local_data, &mut local_errors)
                            .await;
                        (local_data, local_errors)
                    }
                })
                .collect();
            for (data, mut call_errors) in futures::future::join_all(calls).await {
                merged.extend(data);
                errors.append(&mut call_errors);
            }
        }
    }

    let mut data = Value::Object(merged);

    // Resolve cross-subgraph extension fields.
    let mut entity_errors = resolve_extensions(
        &supergraph,
        &client,
        &mut data,
        &owned_selections,
        state.config.max_entity_depth,
    )
    .await;
    errors.append(&mut entity_errors);

    // Project onto the client's selection: client field order, no
    // leaked key injections.
    let data = trim(&data, &owned_selections);

    let response = GraphQLResponse {
        data: Some(data),
        errors,
    };

    match planned.kind {
        OperationKind::Mutation => {
            let touched = plan::touched_subgraphs(&planned);
            let removed = state.cache.invalidate_subgraphs(&touched);
            scope.publish(RequestEvent::CacheInvalidated {
                subgraphs: touched.iter().cloned().collect(),
                removed,
            });
        }
        OperationKind::Query => {
            if let Some(fingerprint) = fingerprint {
                let ttl = state
                    .config
                    .ttl_for_fields(field_names.iter().map(String::as_str));
                state.cache.store(
                    fingerprint,
                    &response,
                    ttl,
                    plan::touched_subgraphs(&planned),
                );
            }
        }
        OperationKind::Subscription => {}
    }

    Ok(response)
}

async fn dispatch_call(
    client: &SubgraphClient,
    scope: &RequestScope,
    call: &SubgraphCall,
    merged: &mut Map<String, Value>,
    errors: &mut Vec<WireError>,
) {
    scope.publish(RequestEvent::SubgraphCallStarted {
        subgraph:    call.subgraph.clone(),
        field_count: call.response_keys.len(),
    });
    let started = std::time::Instant::now();

    match client
        .call(&call.subgraph, &call.operation, call.variables.clone())
        .await
    {
        Ok(response) => {
            scope.publish(RequestEvent::SubgraphCallFinished {
                subgraph:    call.subgraph.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
                had_errors:  !response.errors.is_empty(),
            });
            if let Some(Value::Object(data)) = response.data {
                merged.extend(data);
            } else {
                for key in &call.response_keys {
                    merged.insert(key.clone(), Value::Null);
                }
            }
            for error in response.errors {
                errors.push(error.from_subgraph(call.subgraph.clone()));
            }
        }
        Err(err) => {
            scope.publish(RequestEvent::SubgraphCallFinished {
                subgraph:    call.subgraph.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
                had_errors:  true,
            });
            debug!(subgraph = %call.subgraph, error = %err, "subgraph call failed");
            // The failed subgraph's fields null out; the rest of the
            // response still resolves.
            for key in &call.response_keys {
                merged.insert(key.clone(), Value::Null);
                errors.push(
                    WireError::from_error(&err)
                        .from_subgraph(call.subgraph.clone())
                        .at_path(vec![json!(key)]),
                );
            }
        }
    }
}

/// Trim merged (already response-keyed) data to the client selection,
/// restoring client field order and dropping injected key fields.
fn trim(value: &Value, selections: &[OwnedSelection]) -> Value {
    if selections.is_empty() {
        return value.clone();
    }
    match value {
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| trim(item, selections)).collect())
        }
        Value::Object(obj) => {
            let mut out = Map::new();
            trim_object(obj, selections, &mut out, 0);
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn trim_object(
    obj: &Map<String, Value>,
    selections: &[OwnedSelection],
    out: &mut Map<String, Value>,
    guard: usize,
) {
    if guard > 32 {
        return;
    }
    for sel in selections {
        match sel {
            OwnedSelection::Field {
                name, selections, ..
            } => {
                let key = sel.key().unwrap_or(name).to_string();
                // Merged data is keyed by response key (the subgraphs
                // applied aliases already).
                let trimmed = obj
                    .get(&key)
                    .map_or(Value::Null, |child| trim(child, selections));
                out.insert(key, trimmed);
            }
            OwnedSelection::Fragment {
                type_condition,
                selections,
            } => {
                let applies = match type_condition {
                    None => true,
                    Some(wanted) => obj
                        .get("__typename")
                        .and_then(Value::as_str)
                        .is_none_or(|actual| actual == wanted),
                };
                if applies {
                    trim_object(obj, selections, out, guard + 1);
                }
            }
        }
    }
}

/// Top-level subscription field and its owning subgraph.
///
/// # Errors
///
/// `BAD_USER_INPUT` when the operation is not a single-field
/// subscription or the field has no owner.
pub fn subscription_target(
    state: &GatewayState,
    request: &GraphQLRequest,
) -> Result<(String, String)> {
    let doc = parse(&request.query)?;
    let op = find_operation(&doc, request.operation_name.as_deref())?;
    if op.kind != OperationKind::Subscription {
        return Err(DevmeshError::bad_user_input(
            "the streaming transport only accepts subscriptions",
        ));
    }
    let fields = ops::top_level_fields(&op);
    let [field] = fields.as_slice() else {
        return Err(DevmeshError::bad_user_input(
            "subscriptions must select exactly one root field",
        ));
    };
    let supergraph = state.composer.require_supergraph()?;
    let owner = supergraph
        .owner_of(OperationKind::Subscription, &field.name)
        .ok_or_else(|| {
            DevmeshError::bad_user_input(format!(
                "Cannot subscribe to field '{}'",
                field.name
            ))
        })?;
    Ok((field.name.clone(), owner.to_string()))
}
