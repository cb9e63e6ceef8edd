//! Quality subgraph: per-file violation state and time-bucketed
//! metrics.
//!
//! External analyzer adapters (lint, format, type-check) push their
//! results here through `recordFileResults`; the store keeps the
//! current violation set per file, per-session aggregates, and
//! time-bucketed counts. Violation ids are derived from the violation's
//! content so reprocessing a file reproduces identical ids.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod schema;
pub mod store;

pub use store::{QualityStore, Severity, Violation};
