//! GraphQL HTTP payloads and error shaping.

use devmesh_error::DevmeshError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// GraphQL request payload (`POST /graphql`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    /// GraphQL operation text.
    pub query: String,

    /// Operation variables (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,

    /// Operation name (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl GraphQLRequest {
    /// Build a request from operation text alone.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query:          query.into(),
            variables:      None,
            operation_name: None,
        }
    }

    /// Attach variables.
    #[must_use]
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Variables as an object map, defaulting to empty.
    #[must_use]
    pub fn variable_map(&self) -> Map<String, Value> {
        match &self.variables {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }
}

/// GraphQL response payload (`{ data?, errors? }`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphQLResponse {
    /// Response data; absent when the whole operation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Errors, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<WireError>,
}

impl GraphQLResponse {
    /// A pure-data response.
    #[must_use]
    pub fn data(data: Value) -> Self {
        Self {
            data:   Some(data),
            errors: Vec::new(),
        }
    }

    /// A response carrying a single error and no data.
    #[must_use]
    pub fn error(error: WireError) -> Self {
        Self {
            data:   None,
            errors: vec![error],
        }
    }

    /// True when no errors were recorded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl From<&DevmeshError> for GraphQLResponse {
    fn from(err: &DevmeshError) -> Self {
        Self::error(WireError::from_error(err))
    }
}

/// A GraphQL error as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    /// Error message.
    pub message: String,

    /// Path to the field the error applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,

    /// Extensions: always carries `code`; may carry `subgraph`,
    /// `retryAfter`, or `correlationId`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl WireError {
    /// Create an error with a message and a code extension.
    #[must_use]
    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        let mut extensions = Map::new();
        extensions.insert("code".to_string(), json!(code.into()));
        Self {
            message:    message.into(),
            path:       None,
            extensions: Some(extensions),
        }
    }

    /// Shape a [`DevmeshError`] for the wire.
    ///
    /// Internal errors are replaced with a generic message; everything
    /// else keeps its display text. `retryAfter` is attached when the
    /// error carries a hint.
    #[must_use]
    pub fn from_error(err: &DevmeshError) -> Self {
        let message = if matches!(err, DevmeshError::Internal { .. }) {
            "Internal server error".to_string()
        } else {
            err.to_string()
        };

        let mut wire = Self::with_code(message, err.error_code());
        if let Some(secs) = err.retry_after_secs() {
            wire = wire.with_extension("retryAfter", json!(secs));
        }
        wire
    }

    /// Attach a field path.
    #[must_use]
    pub fn at_path(mut self, path: Vec<Value>) -> Self {
        self.path = Some(path);
        self
    }

    /// Attach an arbitrary extension entry.
    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Attach the originating subgraph name.
    #[must_use]
    pub fn from_subgraph(self, subgraph: impl Into<String>) -> Self {
        self.with_extension("subgraph", json!(subgraph.into()))
    }

    /// Read the `code` extension, if present.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_deserialize() {
        let json = r#"{"query": "{ repositories { path } }"}"#;
        let request: GraphQLRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.query, "{ repositories { path } }");
        assert!(request.variables.is_none());
    }

    #[test]
    fn test_request_with_variables() {
        let json = r#"{"query": "query($id: ID!) { agentSession(id: $id) { id } }", "variables": {"id": "s1"}}"#;
        let request: GraphQLRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.variable_map()["id"], json!("s1"));
    }

    #[test]
    fn test_error_shaping_hides_internal_detail() {
        let err = DevmeshError::internal("lock poisoned in registry");
        let wire = WireError::from_error(&err);
        assert_eq!(wire.message, "Internal server error");
        assert_eq!(wire.code(), Some("INTERNAL_SERVER_ERROR"));
    }

    #[test]
    fn test_error_shaping_keeps_client_detail() {
        let err = DevmeshError::session_not_found("sess_9");
        let wire = WireError::from_error(&err);
        assert!(wire.message.contains("sess_9"));
        assert_eq!(wire.code(), Some("SESSION_NOT_FOUND"));
    }

    #[test]
    fn test_rate_limit_retry_after_extension() {
        let err = DevmeshError::TooManyRequests {
            retry_after_secs: 30,
        };
        let wire = WireError::from_error(&err);
        let ext = wire.extensions.unwrap();
        assert_eq!(ext["retryAfter"], json!(30));
    }

    #[test]
    fn test_subgraph_extension_and_path() {
        let wire = WireError::with_code("boom", "SUBGRAPH_TIMEOUT")
            .from_subgraph("git")
            .at_path(vec![json!("scanAllRepositories")]);
        let encoded = serde_json::to_value(&wire).unwrap();
        assert_eq!(encoded["extensions"]["subgraph"], json!("git"));
        assert_eq!(encoded["path"][0], json!("scanAllRepositories"));
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = GraphQLResponse::data(json!({"claudeHealth": {"healthy": true}}));
        let text = serde_json::to_string(&resp).unwrap();
        assert!(!text.contains("errors"));
        let back: GraphQLResponse = serde_json::from_str(&text).unwrap();
        assert!(back.is_ok());
    }
}
