//! Agent subgraph: long-running AI agent sessions wrapping an external
//! interactive CLI.
//!
//! The session manager owns one child process per live session and
//! speaks a line-delimited JSON protocol on its standard streams
//! (behind the [`cli::CliTransport`] seam). Around it sit the pre-warm
//! pool (child processes held at the "awaiting first prompt" state),
//! the rate-limited command dispatcher, the batch dispatcher for
//! per-repository fan-out, and the in-memory run store.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod manager;
pub mod output;
pub mod prewarm;
pub mod runs;
pub mod schema;
pub mod tokens;
pub mod types;

pub use config::AgentServiceConfig;
pub use manager::SessionManager;
