//! Operation execution against a [`SubgraphSchema`].
//!
//! The executor dispatches top-level fields to resolvers, answers the
//! federation fields (`_service`, `_entities`), projects resolver
//! output through the client's selection set, and prefers partial data
//! over total failure: a failing field contributes `null` plus a
//! path-qualified error while its siblings still resolve.

use devmesh_error::{DevmeshError, Result};
use devmesh_graphql::ops::{
    argument_object, find_operation, parse, response_key, top_level_fields, OperationKind,
};
use devmesh_graphql::projection::{project, project_owned, to_owned};
use devmesh_graphql::request::{GraphQLRequest, GraphQLResponse, WireError};
use devmesh_graphql::sse::StreamFrame;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::schema::{ResolverCtx, SubgraphSchema};

/// Execute a query or mutation against the schema.
///
/// Subscriptions are rejected here; they go through
/// [`execute_stream`].
pub async fn execute(
    schema: &SubgraphSchema,
    request: &GraphQLRequest,
    ctx: &ResolverCtx,
) -> GraphQLResponse {
    match run(schema, request, ctx).await {
        Ok(response) => response,
        Err(err) => {
            if err.is_server_error() {
                warn!(
                    subgraph = schema.name(),
                    correlation_id = %ctx.correlation_id,
                    error = %err,
                    "operation failed"
                );
            }
            GraphQLResponse::error(WireError::from_error(&err))
        }
    }
}

async fn run(
    schema: &SubgraphSchema,
    request: &GraphQLRequest,
    ctx: &ResolverCtx,
) -> Result<GraphQLResponse> {
    let doc = parse(&request.query)?;
    let op = find_operation(&doc, request.operation_name.as_deref())?;
    let variables = request.variable_map();

    if op.kind == OperationKind::Subscription {
        return Err(DevmeshError::bad_user_input(
            "Subscriptions must use the streaming endpoint",
        ));
    }

    let mut data = Map::new();
    let mut errors = Vec::new();

    for field in top_level_fields(&op) {
        let key = response_key(field).to_string();
        let args = argument_object(field, &variables);

        if field.name == "__typename" {
            let typename = match op.kind {
                OperationKind::Query => "Query",
                OperationKind::Mutation => "Mutation",
                OperationKind::Subscription => "Subscription",
            };
            data.insert(key, json!(typename));
            continue;
        }

        if op.kind == OperationKind::Query && field.name == "_service" {
            let service = json!({"sdl": schema.federation_sdl()});
            data.insert(key, project(&service, &field.selection_set, &op.fragments));
            continue;
        }

        if op.kind == OperationKind::Query && field.name == "_entities" {
            let (entities, mut entity_errors) =
                resolve_entities(schema, ctx, &args, field, &op.fragments).await;
            data.insert(key, entities);
            errors.append(&mut entity_errors);
            continue;
        }

        let resolver = match op.kind {
            OperationKind::Query => schema.query_field(&field.name),
            OperationKind::Mutation => schema.mutation_field(&field.name),
            OperationKind::Subscription => None,
        };

        let Some(resolver) = resolver else {
            data.insert(key.clone(), Value::Null);
            errors.push(
                WireError::with_code(
                    format!("Unknown field '{}'", field.name),
                    "BAD_USER_INPUT",
                )
                .at_path(vec![json!(key)]),
            );
            continue;
        };

        debug!(
            subgraph = schema.name(),
            field = %field.name,
            correlation_id = %ctx.correlation_id,
            "resolving field"
        );

        match resolver(ctx.clone(), args).await {
            Ok(value) => {
                data.insert(key, project(&value, &field.selection_set, &op.fragments));
            }
            Err(err) => {
                data.insert(key.clone(), Value::Null);
                errors.push(WireError::from_error(&err).at_path(vec![json!(key)]));
            }
        }
    }

    Ok(GraphQLResponse {
        data: Some(Value::Object(data)),
        errors,
    })
}

async fn resolve_entities<'a>(
    schema: &SubgraphSchema,
    ctx: &ResolverCtx,
    args: &Map<String, Value>,
    field: &'a graphql_parser::query::Field<'a, String>,
    fragments: &devmesh_graphql::projection::Fragments<'a>,
) -> (Value, Vec<WireError>) {
    let mut errors = Vec::new();
    let Some(representations) = args.get("representations").and_then(Value::as_array) else {
        errors.push(WireError::with_code(
            "_entities requires a representations list",
            "BAD_USER_INPUT",
        ));
        return (Value::Null, errors);
    };

    let mut entities = Vec::with_capacity(representations.len());
    for (idx, rep) in representations.iter().enumerate() {
        match resolve_one_entity(schema, ctx, rep).await {
            Ok(Some(entity)) => {
                entities.push(project(&entity, &field.selection_set, fragments));
            }
            Ok(None) => entities.push(Value::Null),
            Err(err) => {
                entities.push(Value::Null);
                errors.push(
                    WireError::from_error(&err)
                        .at_path(vec![json!("_entities"), json!(idx)]),
                );
            }
        }
    }
    (Value::Array(entities), errors)
}

async fn resolve_one_entity(
    schema: &SubgraphSchema,
    ctx: &ResolverCtx,
    representation: &Value,
) -> Result<Option<Value>> {
    let obj = representation
        .as_object()
        .ok_or_else(|| DevmeshError::bad_user_input("Entity representation must be an object"))?;
    let typename = obj
        .get("__typename")
        .and_then(Value::as_str)
        .ok_or_else(|| DevmeshError::bad_user_input("Representation is missing __typename"))?;

    let resolver = schema.entity_type(typename).ok_or_else(|| {
        DevmeshError::bad_user_input(format!("Unknown entity type '{typename}'"))
    })?;

    resolver(ctx.clone(), obj.clone()).await
}

/// Execute a subscription, returning the frame stream.
///
/// The stream yields zero or more `next` frames followed by exactly one
/// terminal frame (`complete`, or `error` if the resolver stream
/// fails).
///
/// # Errors
///
/// Returns an error for parse failures, non-subscription operations,
/// multi-field subscriptions, or unknown subscription fields; transport
/// handlers shape these into a terminal `error` frame.
pub async fn execute_stream(
    schema: &SubgraphSchema,
    request: &GraphQLRequest,
    ctx: &ResolverCtx,
) -> Result<BoxStream<'static, StreamFrame>> {
    let doc = parse(&request.query)?;
    let op = find_operation(&doc, request.operation_name.as_deref())?;

    if op.kind != OperationKind::Subscription {
        return Err(DevmeshError::bad_user_input(
            "Streaming endpoint only accepts subscriptions",
        ));
    }

    let fields = top_level_fields(&op);
    let [field] = fields.as_slice() else {
        return Err(DevmeshError::bad_user_input(
            "Subscriptions must select exactly one root field",
        ));
    };

    let resolver = schema
        .subscription_field(&field.name)
        .ok_or_else(|| {
            DevmeshError::bad_user_input(format!("Unknown subscription field '{}'", field.name))
        })?
        .clone();

    let variables = request.variable_map();
    let args = argument_object(field, &variables);
    let key = response_key(field).to_string();
    let selections = to_owned(&field.selection_set, &op.fragments);

    let upstream = resolver(ctx.clone(), args).await?;

    let frames = upstream
        .map(move |item| match item {
            Ok(value) => {
                let mut data = Map::new();
                data.insert(key.clone(), project_owned(&value, &selections));
                StreamFrame::Next {
                    payload: GraphQLResponse::data(Value::Object(data)),
                }
            }
            Err(err) => StreamFrame::Error {
                errors: vec![WireError::from_error(&err)],
            },
        })
        // Frames after the first terminal frame are discarded, then a
        // lone Complete closes streams that ended without error.
        .scan(false, |terminated, frame| {
            if *terminated {
                return futures::future::ready(None);
            }
            *terminated = frame.is_terminal();
            futures::future::ready(Some(frame))
        });

    let with_completion = frames.chain(futures::stream::once(async { StreamFrame::Complete }));

    // A second scan strips anything after the first terminal frame so
    // an error stream does not also emit Complete.
    let bounded = with_completion.scan(false, |terminated, frame| {
        if *terminated {
            return futures::future::ready(None);
        }
        *terminated = frame.is_terminal();
        futures::future::ready(Some(frame))
    });

    Ok(bounded.boxed())
}
