//! Subgraph schema: SDL plus resolver registry.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use devmesh_error::Result;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

/// Per-request context handed to every resolver.
#[derive(Debug, Clone, Default)]
pub struct ResolverCtx {
    /// Correlation id propagated from the gateway (or minted locally).
    pub correlation_id: String,
    /// `authorization` header forwarded verbatim by the gateway.
    pub authorization: Option<String>,
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A query or mutation field resolver.
pub type ResolverFn =
    Arc<dyn Fn(ResolverCtx, Map<String, Value>) -> BoxFuture<Result<Value>> + Send + Sync>;

/// A subscription field resolver, returning a stream of payload values.
pub type StreamResolverFn = Arc<
    dyn Fn(ResolverCtx, Map<String, Value>) -> BoxFuture<Result<BoxStream<'static, Result<Value>>>>
        + Send
        + Sync,
>;

/// An entity resolver: representation fields in, entity value (or null) out.
pub type EntityResolverFn =
    Arc<dyn Fn(ResolverCtx, Map<String, Value>) -> BoxFuture<Result<Option<Value>>> + Send + Sync>;

/// Wrap an async closure as a [`ResolverFn`].
pub fn resolver<F, Fut>(f: F) -> ResolverFn
where
    F: Fn(ResolverCtx, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |ctx, args| Box::pin(f(ctx, args)))
}

/// Wrap an async closure as a [`StreamResolverFn`].
pub fn stream_resolver<F, Fut>(f: F) -> StreamResolverFn
where
    F: Fn(ResolverCtx, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BoxStream<'static, Result<Value>>>> + Send + 'static,
{
    Arc::new(move |ctx, args| Box::pin(f(ctx, args)))
}

/// Wrap an async closure as an [`EntityResolverFn`].
pub fn entity_resolver<F, Fut>(f: F) -> EntityResolverFn
where
    F: Fn(ResolverCtx, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
{
    Arc::new(move |ctx, args| Box::pin(f(ctx, args)))
}

/// A subgraph's schema: its SDL and the resolvers behind it.
#[derive(Clone)]
pub struct SubgraphSchema {
    name:                String,
    base_sdl:            String,
    query_fields:        HashMap<String, ResolverFn>,
    mutation_fields:     HashMap<String, ResolverFn>,
    subscription_fields: HashMap<String, StreamResolverFn>,
    entity_types:        HashMap<String, EntityResolverFn>,
}

impl fmt::Debug for SubgraphSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubgraphSchema")
            .field("name", &self.name)
            .field("queries", &self.query_fields.len())
            .field("mutations", &self.mutation_fields.len())
            .field("subscriptions", &self.subscription_fields.len())
            .field("entities", &self.entity_types.len())
            .finish()
    }
}

impl SubgraphSchema {
    /// Start building a schema from its service name and base SDL.
    ///
    /// The base SDL declares the subgraph's types and root fields,
    /// including `@key` directives on entity types; the federation
    /// envelope (`_Service`, `_Any`, `_Entity`) is appended by
    /// [`SubgraphSchema::federation_sdl`].
    #[must_use]
    pub fn builder(name: impl Into<String>, base_sdl: impl Into<String>) -> SubgraphSchemaBuilder {
        SubgraphSchemaBuilder {
            schema: Self {
                name:                name.into(),
                base_sdl:            base_sdl.into(),
                query_fields:        HashMap::new(),
                mutation_fields:     HashMap::new(),
                subscription_fields: HashMap::new(),
                entity_types:        HashMap::new(),
            },
        }
    }

    /// Service name (matches the gateway's subgraph registry entry).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The SDL published through `_service { sdl }`: the base SDL plus
    /// the federation envelope and the `_Entity` union over this
    /// subgraph's entity types.
    #[must_use]
    pub fn federation_sdl(&self) -> String {
        let mut sdl = String::with_capacity(self.base_sdl.len() + 512);
        sdl.push_str(&self.base_sdl);
        sdl.push_str("\n\n");
        sdl.push_str(FEDERATION_ENVELOPE);

        let mut entity_names: Vec<&str> = self.entity_types.keys().map(String::as_str).collect();
        entity_names.sort_unstable();
        if entity_names.is_empty() {
            sdl.push_str("scalar _Entity\n");
        } else {
            sdl.push_str(&format!("union _Entity = {}\n", entity_names.join(" | ")));
        }
        sdl
    }

    /// Look up a query resolver.
    #[must_use]
    pub fn query_field(&self, name: &str) -> Option<&ResolverFn> {
        self.query_fields.get(name)
    }

    /// Look up a mutation resolver.
    #[must_use]
    pub fn mutation_field(&self, name: &str) -> Option<&ResolverFn> {
        self.mutation_fields.get(name)
    }

    /// Look up a subscription resolver.
    #[must_use]
    pub fn subscription_field(&self, name: &str) -> Option<&StreamResolverFn> {
        self.subscription_fields.get(name)
    }

    /// Look up an entity resolver by typename.
    #[must_use]
    pub fn entity_type(&self, typename: &str) -> Option<&EntityResolverFn> {
        self.entity_types.get(typename)
    }
}

const FEDERATION_ENVELOPE: &str = r#"directive @key(fields: String!, resolvable: Boolean = true) repeatable on OBJECT
directive @extends on OBJECT
directive @external on FIELD_DEFINITION
directive @shareable on FIELD_DEFINITION | OBJECT

scalar _Any

type _Service {
  sdl: String!
}

"#;

/// Builder for [`SubgraphSchema`].
pub struct SubgraphSchemaBuilder {
    schema: SubgraphSchema,
}

impl SubgraphSchemaBuilder {
    /// Register a query field.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, f: ResolverFn) -> Self {
        self.schema.query_fields.insert(name.into(), f);
        self
    }

    /// Register a mutation field.
    #[must_use]
    pub fn mutation(mut self, name: impl Into<String>, f: ResolverFn) -> Self {
        self.schema.mutation_fields.insert(name.into(), f);
        self
    }

    /// Register a subscription field.
    #[must_use]
    pub fn subscription(mut self, name: impl Into<String>, f: StreamResolverFn) -> Self {
        self.schema.subscription_fields.insert(name.into(), f);
        self
    }

    /// Register an entity type with its reference resolver.
    #[must_use]
    pub fn entity(mut self, typename: impl Into<String>, f: EntityResolverFn) -> Self {
        self.schema.entity_types.insert(typename.into(), f);
        self
    }

    /// Finish the schema.
    #[must_use]
    pub fn build(self) -> SubgraphSchema {
        self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_schema() -> SubgraphSchema {
        SubgraphSchema::builder("git", "type Query { ping: String }")
            .query("ping", resolver(|_ctx, _args| async { Ok(json!("pong")) }))
            .entity(
                "Repository",
                entity_resolver(|_ctx, rep| async move {
                    Ok(Some(json!({"__typename": "Repository", "path": rep["path"]})))
                }),
            )
            .build()
    }

    #[test]
    fn test_federation_sdl_declares_envelope() {
        let sdl = test_schema().federation_sdl();
        assert!(sdl.contains("directive @key"));
        assert!(sdl.contains("scalar _Any"));
        assert!(sdl.contains("type _Service"));
        assert!(sdl.contains("union _Entity = Repository"));
    }

    #[test]
    fn test_federation_sdl_without_entities() {
        let schema = SubgraphSchema::builder("quality", "type Query { ping: String }").build();
        assert!(schema.federation_sdl().contains("scalar _Entity"));
    }

    #[test]
    fn test_field_lookup() {
        let schema = test_schema();
        assert!(schema.query_field("ping").is_some());
        assert!(schema.query_field("missing").is_none());
        assert!(schema.entity_type("Repository").is_some());
    }

    #[test]
    fn test_sdl_parses_as_schema_document() {
        let sdl = test_schema().federation_sdl();
        graphql_parser::parse_schema::<String>(&sdl).expect("envelope SDL must stay parseable");
    }
}
