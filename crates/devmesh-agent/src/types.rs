//! Domain types owned by the agent subgraph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Streaming output to at least one subscriber.
    Active,
    /// A command is executing.
    Processing,
    /// Awaiting the next command.
    Idle,
    /// Killed, exited, or archived. Terminal.
    Terminated,
    /// The child process failed. Terminal.
    Error,
}

impl SessionStatus {
    /// Terminal states accept no further commands.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }
}

/// One prompt/response exchange in a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    /// When the prompt was submitted.
    pub timestamp: DateTime<Utc>,
    /// The prompt text.
    pub prompt: String,
    /// The response; `None` while still streaming.
    pub response: Option<String>,
    /// Wall-clock execution time.
    pub execution_time_ms: u64,
    /// Whether the interaction completed successfully.
    pub success: bool,
    /// Upstream session correlator captured when the interaction
    /// completed; forking resumes from it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_session_id: Option<String>,
}

/// Cumulative token accounting for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Prompt-side tokens.
    pub input_tokens: u64,
    /// Completion-side tokens.
    pub output_tokens: u64,
    /// Informational cost estimate in USD.
    pub estimated_cost_usd: f64,
}

/// Session metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// Model identifier.
    pub model: String,
    /// Cumulative token usage.
    pub token_usage: TokenUsage,
    /// CLI flags the session was created with.
    pub flags: Vec<String>,
    /// Optional project context note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_context: Option<String>,
    /// Most recent upstream session correlator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_session_id: Option<String>,
}

/// A live (or archived) agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    /// GraphQL typename, carried for entity resolution.
    #[serde(rename = "__typename")]
    pub typename: &'static str,
    /// Synthetic id.
    pub id: String,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last command or stream activity.
    pub last_activity: DateTime<Utc>,
    /// Working directory of the child process.
    pub working_dir: String,
    /// Prompt/response history, append-only (fork copies a prefix).
    pub history: Vec<Interaction>,
    /// Metadata.
    pub metadata: SessionMetadata,
    /// Fork parent, if this session was forked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    /// History index in the parent this fork was taken at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_point: Option<usize>,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl AgentSession {
    /// Typename constant used in federation representations.
    pub const TYPENAME: &'static str = "AgentSession";

    /// Create a fresh idle session.
    #[must_use]
    pub fn new(id: impl Into<String>, working_dir: impl Into<String>, model: String) -> Self {
        let now = Utc::now();
        Self {
            typename: Self::TYPENAME,
            id: id.into(),
            status: SessionStatus::Idle,
            created_at: now,
            last_activity: now,
            working_dir: working_dir.into(),
            history: Vec::new(),
            metadata: SessionMetadata {
                model,
                ..SessionMetadata::default()
            },
            parent_session_id: None,
            fork_point: None,
            name: None,
        }
    }
}

/// Status of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Accepted, not yet started.
    Queued,
    /// Executing.
    Running,
    /// Completed successfully. Terminal.
    Success,
    /// Completed with an error. Terminal.
    Failed,
    /// Cancelled before completion. Terminal.
    Cancelled,
    /// Superseded by a retry.
    Retrying,
}

impl RunStatus {
    /// Terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Whether a run in this state may be retried.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

/// A recorded agent run (one repository-level operation).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRun {
    /// GraphQL typename, carried for entity resolution.
    #[serde(rename = "__typename")]
    pub typename: &'static str,
    /// Run id.
    pub id: String,
    /// Repository the run operated on.
    pub repository: String,
    /// Current status.
    pub status: RunStatus,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Completion time; `None` until terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// `completed_at - started_at` in milliseconds, when completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Input snapshot (prompt, diff fingerprint).
    pub input: serde_json::Value,
    /// Output artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error detail on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of retries in this chain before this run.
    pub retry_count: u32,
    /// Source run when this run is a retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
}

impl AgentRun {
    /// Typename constant used in federation representations.
    pub const TYPENAME: &'static str = "AgentRun";
}

/// One variable in a session template's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVariable {
    /// Variable name.
    pub name: String,
    /// Whether the variable must be supplied.
    pub required: bool,
    /// Default value when optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Human description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A reusable session template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTemplate {
    /// Template id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Classification tags.
    pub tags: Vec<String>,
    /// Declared variables.
    pub variables: Vec<TemplateVariable>,
    /// Context prepended to the first prompt of instantiated sessions.
    pub initial_context: String,
    /// CLI flags snapshot from the originating session.
    pub default_flags: Vec<String>,
    /// Model snapshot from the originating session.
    pub default_model: String,
    /// History snapshot, when captured.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Interaction>,
    /// How many sessions were created from this template.
    pub usage_count: u64,
    /// Last instantiation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(SessionStatus::Terminated.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(!SessionStatus::Idle.is_terminal());

        assert!(RunStatus::Success.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_retryable_runs() {
        assert!(RunStatus::Failed.is_retryable());
        assert!(RunStatus::Cancelled.is_retryable());
        assert!(!RunStatus::Success.is_retryable());
        assert!(!RunStatus::Running.is_retryable());
    }

    #[test]
    fn test_session_serialization_shape() {
        let session = AgentSession::new("s1", "/ws", "sonnet".to_string());
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["__typename"], serde_json::json!("AgentSession"));
        assert_eq!(value["status"], serde_json::json!("IDLE"));
        assert_eq!(value["workingDir"], serde_json::json!("/ws"));
        assert_eq!(value["metadata"]["model"], serde_json::json!("sonnet"));
    }
}
