//! Shared subgraph server kit.
//!
//! Every devmesh subgraph (git, agent, quality) is built from the same
//! pieces: a [`SubgraphSchema`] mapping top-level fields to resolver
//! closures, an executor that dispatches parsed operations against it
//! (including the federation `_service` / `_entities` fields), and an
//! axum router serving `POST /graphql`, a `GET` landing page,
//! `POST /graphql/stream` (SSE subscriptions), and `GET /health`.
//!
//! The kit deliberately implements only what the gateway's composition
//! model needs: top-level field dispatch plus selection projection.
//! Nested field resolution happens inside resolvers, which return
//! complete JSON trees.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod execute;
pub mod schema;
pub mod server;

pub use execute::{execute, execute_stream};
pub use schema::{
    entity_resolver, resolver, stream_resolver, ResolverCtx, SubgraphSchema, SubgraphSchemaBuilder,
};
pub use server::{router, serve};
