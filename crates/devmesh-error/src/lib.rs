//! Error types for the devmesh control plane.
//!
//! Every crate in the workspace converts its failures into
//! [`DevmeshError`]. The gateway maps each variant to a GraphQL error
//! with an `extensions.code` entry; subgraphs reuse the same mapping so
//! a code produced deep inside the git executor survives unchanged all
//! the way to the client.
//!
//! # Error Hierarchy
//!
//! ```text
//! DevmeshError
//! ├── Parse               - GraphQL parse errors (GRAPHQL_PARSE_FAILED)
//! ├── BadUserInput        - validation / unknown entity / bad arguments
//! ├── QueryTooDeep        - operation depth limit exceeded
//! ├── TooManyRequests     - rate limit hit (carries retry_after_secs)
//! ├── BufferOverflow      - subscription buffer overflow
//! ├── SessionNotFound     - unknown or terminated agent session
//! ├── CommandNotAllowed   - git subcommand outside the allowlist
//! ├── PathOutsideWorkspace- path escapes WORKSPACE_ROOT
//! ├── SubgraphUnavailable - subgraph unreachable
//! ├── SubgraphTimeout     - subgraph deadline exceeded
//! ├── Upstream            - child process / git binary failure
//! ├── Composition         - supergraph composition failure
//! ├── Configuration       - config/setup errors
//! ├── Cancelled           - request-scope cancellation
//! └── Internal            - unexpected internal errors
//! ```

use thiserror::Error;

/// Result type alias for devmesh operations.
pub type Result<T> = std::result::Result<T, DevmeshError>;

/// Main error type for devmesh operations.
#[derive(Error, Debug)]
pub enum DevmeshError {
    // ========================================================================
    // User errors
    // ========================================================================
    /// GraphQL parsing error.
    #[error("Parse error at {location}: {message}")]
    Parse {
        /// Error message describing the parse failure.
        message:  String,
        /// Location in the operation where the error occurred.
        location: String,
    },

    /// Validation error: syntactically valid but semantically wrong input.
    #[error("Invalid input: {message}")]
    BadUserInput {
        /// Error message describing the validation failure.
        message: String,
        /// Path to the offending field (e.g., "retryAgentRun.id").
        path:    Option<String>,
    },

    /// Operation depth exceeds the configured bound.
    #[error("Query depth {depth} exceeds the maximum of {max_depth}")]
    QueryTooDeep {
        /// Measured depth of the operation.
        depth:     usize,
        /// Configured maximum depth.
        max_depth: usize,
    },

    // ========================================================================
    // Resource errors
    // ========================================================================
    /// Rate limit exceeded.
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    TooManyRequests {
        /// Seconds until the caller may retry.
        retry_after_secs: u64,
    },

    /// A subscription's outgoing buffer overflowed.
    #[error("Subscription buffer overflow after {buffered} frames")]
    BufferOverflow {
        /// Number of frames that were buffered when the overflow hit.
        buffered: usize,
    },

    // ========================================================================
    // Domain errors
    // ========================================================================
    /// Unknown or terminated agent session.
    #[error("Session not found: {session_id}")]
    SessionNotFound {
        /// The session id that was looked up.
        session_id: String,
    },

    /// Git subcommand outside the executor allowlist.
    #[error("Git command not allowed: {command}")]
    CommandNotAllowed {
        /// The rejected subcommand.
        command: String,
    },

    /// Path escapes the configured workspace root.
    #[error("Path outside workspace: {path}")]
    PathOutsideWorkspace {
        /// The offending path as given by the caller.
        path: String,
    },

    /// Resource not found (entity lookups, templates, runs).
    #[error("{resource_type} not found: {identifier}")]
    NotFound {
        /// Type of resource (e.g., "AgentRun", "SessionTemplate").
        resource_type: String,
        /// Identifier that was looked up.
        identifier:    String,
    },

    // ========================================================================
    // Upstream errors
    // ========================================================================
    /// A subgraph could not be reached.
    #[error("Subgraph '{subgraph}' unavailable: {message}")]
    SubgraphUnavailable {
        /// Name of the unreachable subgraph.
        subgraph: String,
        /// Transport-level detail.
        message:  String,
    },

    /// A subgraph call exceeded its deadline.
    #[error("Subgraph '{subgraph}' timed out after {timeout_ms}ms")]
    SubgraphTimeout {
        /// Name of the subgraph that timed out.
        subgraph:   String,
        /// Deadline in milliseconds.
        timeout_ms: u64,
    },

    /// Child process or external binary failure.
    #[error("Upstream failure: {message}")]
    Upstream {
        /// What failed and how.
        message: String,
    },

    // ========================================================================
    // Internal errors
    // ========================================================================
    /// Supergraph composition failure.
    #[error("Composition failed: {message}")]
    Composition {
        /// What the composer rejected.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message.
        message: String,
    },

    /// Request-scope cancellation.
    #[error("Cancelled: {reason}")]
    Cancelled {
        /// Reason for cancellation.
        reason: String,
    },

    /// Internal error. Should be rare; detail is logged, never surfaced.
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
        /// Optional source error for debugging.
        #[source]
        source:  Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl DevmeshError {
    // ========================================================================
    // Constructor helpers
    // ========================================================================

    /// Create a parse error.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message:  message.into(),
            location: "unknown".to_string(),
        }
    }

    /// Create a parse error with location.
    #[must_use]
    pub fn parse_at(message: impl Into<String>, location: impl Into<String>) -> Self {
        Self::Parse {
            message:  message.into(),
            location: location.into(),
        }
    }

    /// Create a validation error.
    #[must_use]
    pub fn bad_user_input(message: impl Into<String>) -> Self {
        Self::BadUserInput {
            message: message.into(),
            path:    None,
        }
    }

    /// Create a validation error with a field path.
    #[must_use]
    pub fn bad_user_input_at(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::BadUserInput {
            message: message.into(),
            path:    Some(path.into()),
        }
    }

    /// Create a session-not-found error.
    #[must_use]
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Create a command-not-allowed error.
    #[must_use]
    pub fn command_not_allowed(command: impl Into<String>) -> Self {
        Self::CommandNotAllowed {
            command: command.into(),
        }
    }

    /// Create a path-outside-workspace error.
    #[must_use]
    pub fn path_outside_workspace(path: impl Into<String>) -> Self {
        Self::PathOutsideWorkspace { path: path.into() }
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(resource_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            identifier:    identifier.into(),
        }
    }

    /// Create a subgraph-unavailable error.
    #[must_use]
    pub fn subgraph_unavailable(subgraph: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SubgraphUnavailable {
            subgraph: subgraph.into(),
            message:  message.into(),
        }
    }

    /// Create a subgraph-timeout error.
    #[must_use]
    pub fn subgraph_timeout(subgraph: impl Into<String>, timeout_ms: u64) -> Self {
        Self::SubgraphTimeout {
            subgraph: subgraph.into(),
            timeout_ms,
        }
    }

    /// Create an upstream failure.
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// Create a composition error.
    #[must_use]
    pub fn composition(message: impl Into<String>) -> Self {
        Self::Composition {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a cancellation error.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source:  None,
        }
    }

    // ========================================================================
    // Error classification
    // ========================================================================

    /// Check if this is a client error (4xx equivalent).
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. }
                | Self::BadUserInput { .. }
                | Self::QueryTooDeep { .. }
                | Self::TooManyRequests { .. }
                | Self::SessionNotFound { .. }
                | Self::CommandNotAllowed { .. }
                | Self::PathOutsideWorkspace { .. }
                | Self::NotFound { .. }
        )
    }

    /// Check if this is a server error (5xx equivalent).
    #[must_use]
    pub const fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::SubgraphUnavailable { .. }
                | Self::SubgraphTimeout { .. }
                | Self::Upstream { .. }
                | Self::Composition { .. }
                | Self::Configuration { .. }
                | Self::Cancelled { .. }
                | Self::BufferOverflow { .. }
                | Self::Internal { .. }
        )
    }

    /// Check if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TooManyRequests { .. }
                | Self::SubgraphUnavailable { .. }
                | Self::SubgraphTimeout { .. }
        )
    }

    /// Get HTTP status code equivalent.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Parse { .. } | Self::BadUserInput { .. } | Self::QueryTooDeep { .. } => 400,
            Self::NotFound { .. } | Self::SessionNotFound { .. } => 404,
            Self::CommandNotAllowed { .. } | Self::PathOutsideWorkspace { .. } => 403,
            Self::TooManyRequests { .. } => 429,
            Self::SubgraphTimeout { .. } | Self::Cancelled { .. } => 408,
            Self::SubgraphUnavailable { .. } => 502,
            Self::BufferOverflow { .. }
            | Self::Upstream { .. }
            | Self::Composition { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => 500,
        }
    }

    /// Get the `extensions.code` value for GraphQL responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "GRAPHQL_PARSE_FAILED",
            Self::BadUserInput { .. } | Self::NotFound { .. } => "BAD_USER_INPUT",
            Self::QueryTooDeep { .. } => "QUERY_TOO_DEEP",
            Self::TooManyRequests { .. } => "TOO_MANY_REQUESTS",
            Self::BufferOverflow { .. } => "BUFFER_OVERFLOW",
            Self::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            Self::CommandNotAllowed { .. } => "COMMAND_NOT_ALLOWED",
            Self::PathOutsideWorkspace { .. } => "PATH_OUTSIDE_WORKSPACE",
            Self::SubgraphUnavailable { .. } => "SUBGRAPH_UNAVAILABLE",
            Self::SubgraphTimeout { .. } => "SUBGRAPH_TIMEOUT",
            Self::Upstream { .. }
            | Self::Composition { .. }
            | Self::Configuration { .. }
            | Self::Cancelled { .. }
            | Self::Internal { .. } => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Retry-after hint in seconds, where applicable.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::TooManyRequests { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for DevmeshError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse {
            message:  e.to_string(),
            location: format!("line {}, column {}", e.line(), e.column()),
        }
    }
}

impl From<std::io::Error> for DevmeshError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal {
            message: format!("I/O error: {e}"),
            source:  Some(Box::new(e)),
        }
    }
}

impl From<std::env::VarError> for DevmeshError {
    fn from(e: std::env::VarError) -> Self {
        Self::Configuration {
            message: format!("Environment variable error: {e}"),
        }
    }
}

// ============================================================================
// Error context extension trait
// ============================================================================

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    ///
    /// # Errors
    ///
    /// Returns the error with additional context message prepended.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context lazily (only computed on error).
    ///
    /// # Errors
    ///
    /// Returns the error with additional context message prepended.
    fn with_context<F, M>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> M,
        M: Into<String>;
}

impl<T, E: Into<DevmeshError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let inner = e.into();
            DevmeshError::Internal {
                message: format!("{}: {inner}", message.into()),
                source:  None,
            }
        })
    }

    fn with_context<F, M>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> M,
        M: Into<String>,
    {
        self.map_err(|e| {
            let inner = e.into();
            DevmeshError::Internal {
                message: format!("{}: {inner}", f().into()),
                source:  None,
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error() {
        let err = DevmeshError::parse("unexpected token");
        assert!(err.is_client_error());
        assert!(!err.is_server_error());
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.error_code(), "GRAPHQL_PARSE_FAILED");
    }

    #[test]
    fn test_session_not_found() {
        let err = DevmeshError::session_not_found("sess_42");
        assert!(err.is_client_error());
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.error_code(), "SESSION_NOT_FOUND");
        assert_eq!(err.to_string(), "Session not found: sess_42");
    }

    #[test]
    fn test_rate_limit_carries_retry_hint() {
        let err = DevmeshError::TooManyRequests {
            retry_after_secs: 12,
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after_secs(), Some(12));
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.error_code(), "TOO_MANY_REQUESTS");
    }

    #[test]
    fn test_subgraph_errors_are_server_errors() {
        let unavailable = DevmeshError::subgraph_unavailable("git", "connection refused");
        assert!(unavailable.is_server_error());
        assert!(unavailable.is_retryable());
        assert_eq!(unavailable.error_code(), "SUBGRAPH_UNAVAILABLE");

        let timeout = DevmeshError::subgraph_timeout("agent", 30_000);
        assert_eq!(timeout.error_code(), "SUBGRAPH_TIMEOUT");
        assert_eq!(timeout.status_code(), 408);
    }

    #[test]
    fn test_internal_hides_behind_generic_code() {
        let err = DevmeshError::internal("invariant violated");
        assert_eq!(err.error_code(), "INTERNAL_SERVER_ERROR");
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_workspace_confinement_codes() {
        assert_eq!(
            DevmeshError::command_not_allowed("rebase").error_code(),
            "COMMAND_NOT_ALLOWED"
        );
        assert_eq!(
            DevmeshError::path_outside_workspace("../../etc").error_code(),
            "PATH_OUTSIDE_WORKSPACE"
        );
    }

    #[test]
    fn test_from_serde_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: DevmeshError = json_err.into();
        assert!(matches!(err, DevmeshError::Parse { .. }));
    }

    #[test]
    fn test_error_context() {
        fn may_fail() -> std::result::Result<(), std::io::Error> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"))
        }

        let result = may_fail().context("failed to load workspace");
        assert!(result.is_err());

        let err = result.unwrap_err();
        assert!(err.to_string().contains("failed to load workspace"));
    }
}
