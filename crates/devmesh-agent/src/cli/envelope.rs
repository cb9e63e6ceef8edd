//! Wire envelopes exchanged with the agent CLI.
//!
//! Inbound lines are tagged JSON objects. The `result` envelope's
//! payload may itself wrap a fenced JSON block
//! (`{"type":"result","result":"```json\n{...}\n```"}`); callers
//! unwrap both levels through [`unwrap_result_payload`], which falls
//! back from fenced JSON to direct JSON to free text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message sent to the CLI on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliCommand {
    /// Submit a prompt for the current session.
    Prompt {
        /// The prompt text.
        prompt: String,
        /// Resume from a captured upstream session correlator.
        #[serde(skip_serializing_if = "Option::is_none")]
        resume: Option<String>,
    },
    /// Ask the CLI to shut down gracefully.
    Shutdown {},
}

impl CliCommand {
    /// Encode as one protocol line (no trailing newline).
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A message received from the CLI's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliEnvelope {
    /// Lifecycle notice. `subtype: "init"` is the handshake marker that
    /// moves a pre-warm slot to READY; it carries the upstream session
    /// correlator.
    System {
        /// Notice subtype.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        /// Upstream session correlator.
        #[serde(default, rename = "session_id", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// A streamed chunk of assistant output.
    Stream {
        /// Chunk content.
        content: String,
    },
    /// Progress notice (tool use, long operations).
    Progress {
        /// Human-readable progress message.
        message: String,
    },
    /// Terminal result of one prompt.
    Result {
        /// The result payload; possibly a fenced JSON block.
        result: String,
        /// Upstream session correlator captured at completion.
        #[serde(default, rename = "session_id", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Token usage for this interaction.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<UsageEnvelope>,
    },
    /// Fatal error from the CLI.
    Error {
        /// Error detail.
        message: String,
    },
}

impl CliEnvelope {
    /// Parse one protocol line. Unknown or malformed lines come back as
    /// `None`; the CLI occasionally prints human-oriented noise.
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    /// True for `Result` and `Error` envelopes.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. } | Self::Error { .. })
    }

    /// True for the handshake marker.
    #[must_use]
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::System { subtype: Some(sub), .. } if sub == "init"
        )
    }
}

/// Token usage reported by the CLI per interaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEnvelope {
    /// Prompt-side tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion-side tokens.
    #[serde(default)]
    pub output_tokens: u64,
}

/// Unwrap a result payload into structured JSON.
///
/// Fallback order: fenced ```` ```json ```` block, then the whole
/// payload as JSON, then free text wrapped as `{"text": ...}`.
#[must_use]
pub fn unwrap_result_payload(payload: &str) -> Value {
    if let Some(fenced) = extract_fenced_json(payload) {
        if let Ok(value) = serde_json::from_str::<Value>(&fenced) {
            return value;
        }
    }
    if let Ok(value) = serde_json::from_str::<Value>(payload.trim()) {
        // Bare scalars parse as JSON too; only objects and arrays count
        // as structured payloads.
        if value.is_object() || value.is_array() {
            return value;
        }
    }
    serde_json::json!({ "text": payload.trim() })
}

fn extract_fenced_json(payload: &str) -> Option<String> {
    let start = payload.find("```json").map(|idx| idx + "```json".len())
        .or_else(|| payload.find("```").map(|idx| idx + 3))?;
    let rest = &payload[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}
