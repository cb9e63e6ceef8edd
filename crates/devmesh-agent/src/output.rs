//! Per-session command output streaming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frame classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputType {
    /// Assistant output chunk.
    Stdout,
    /// CLI diagnostics.
    Stderr,
    /// Lifecycle notices (command accepted, session state changes).
    System,
    /// Progress notices.
    Progress,
    /// Terminal frame of one command; exactly one per execution.
    Final,
}

/// One frame of a session's output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    /// Owning session.
    pub session_id: String,
    /// Frame classification.
    #[serde(rename = "type")]
    pub output_type: OutputType,
    /// Frame content.
    pub content: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// True exactly for the `FINAL` frame.
    pub is_final: bool,
    /// Output tokens attributed so far, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

impl CommandOutput {
    /// Build a non-final frame.
    #[must_use]
    pub fn frame(
        session_id: impl Into<String>,
        output_type: OutputType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            session_id:  session_id.into(),
            output_type,
            content:     content.into(),
            timestamp:   Utc::now(),
            is_final:    false,
            tokens:      None,
        }
    }

    /// Build the terminal frame of a command.
    #[must_use]
    pub fn final_frame(
        session_id: impl Into<String>,
        content: impl Into<String>,
        tokens: Option<u64>,
    ) -> Self {
        Self {
            session_id:  session_id.into(),
            output_type: OutputType::Final,
            content:     content.into(),
            timestamp:   Utc::now(),
            is_final:    true,
            tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_frame_is_final() {
        let frame = CommandOutput::final_frame("s1", "done", Some(42));
        assert!(frame.is_final);
        assert_eq!(frame.output_type, OutputType::Final);
        assert_eq!(frame.tokens, Some(42));
    }

    #[test]
    fn test_serialization_shape() {
        let frame = CommandOutput::frame("s1", OutputType::Stdout, "hello");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["sessionId"], serde_json::json!("s1"));
        assert_eq!(value["type"], serde_json::json!("STDOUT"));
        assert_eq!(value["isFinal"], serde_json::json!(false));
        assert!(value.get("tokens").is_none());
    }
}
