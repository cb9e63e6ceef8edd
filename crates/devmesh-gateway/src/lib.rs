//! Federation gateway.
//!
//! The gateway presents one GraphQL endpoint and owns no domain data:
//! it composes a supergraph from subgraph SDL (refetched periodically),
//! routes each top-level field to its owning subgraph, resolves
//! cross-subgraph entity references through `_entities`, multiplexes
//! subscriptions over SSE and `graphql-transport-ws`, and fronts
//! idempotent queries with a short-TTL response cache.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod composer;
pub mod config;
pub mod entities;
pub mod executor;
pub mod http;
pub mod metrics;
pub mod plan;
pub mod rate_limit;
pub mod server;
pub mod state;
pub mod subscriptions;
pub mod supergraph;
pub mod ws;

pub use config::GatewayConfig;
pub use state::GatewayState;
