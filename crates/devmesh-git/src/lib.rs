//! Git subgraph: repository inspection and hierarchical mutation across
//! a workspace of nested repositories.
//!
//! The executor invokes the system `git` binary behind the
//! [`runner::GitRunner`] seam, restricted to an allowlist of read
//! subcommands; `commit`, `push`, and `add` are reachable only through
//! the typed mutations. Every path is canonicalized and confined under
//! the configured workspace root.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod exec;
pub mod hierarchy;
pub mod parse;
pub mod runner;
pub mod scan;
pub mod schema;
pub mod types;

pub use config::GitServiceConfig;
pub use exec::GitExecutor;
pub use runner::{GitOutput, GitRunner, SystemGitRunner};
