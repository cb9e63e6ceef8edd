//! GraphQL wire types and transport protocol for devmesh.
//!
//! This crate is the shared vocabulary between the gateway and the
//! subgraphs: HTTP request/response payloads, GraphQL error shaping
//! (`extensions.code`, `path`, `subgraph`), operation analysis over the
//! `graphql-parser` AST (depth, aliases, top-level fields, variable
//! usage), selection-set projection of resolver output, the
//! `graphql-transport-ws` message set, and server-sent-event framing
//! for streaming responses.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ops;
pub mod projection;
pub mod request;
pub mod sse;
pub mod transport_ws;

pub use ops::{OperationKind, ParsedOperation};
pub use request::{GraphQLRequest, GraphQLResponse, WireError};
pub use sse::StreamFrame;
