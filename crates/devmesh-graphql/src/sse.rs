//! Server-sent-event framing for streaming GraphQL responses.
//!
//! The SSE binding carries the same logical frames as the WebSocket
//! binding: any number of `next` events followed by exactly one
//! `complete` or `error` event. Frames are encoded as
//! `event: <kind>\ndata: <json>\n\n`.

use serde::{Deserialize, Serialize};

use crate::request::{GraphQLResponse, WireError};

/// One logical frame of a streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamFrame {
    /// A data frame: `{ data, errors? }`, same shape as a non-streaming
    /// response.
    Next {
        /// The response payload.
        payload: GraphQLResponse,
    },
    /// Terminal error frame; no frames follow.
    Error {
        /// The errors that ended the stream.
        errors: Vec<WireError>,
    },
    /// Terminal completion frame; no frames follow.
    Complete,
}

impl StreamFrame {
    /// True for `Error` and `Complete` frames.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Complete)
    }

    /// SSE event name for this frame.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Next { .. } => "next",
            Self::Error { .. } => "error",
            Self::Complete => "complete",
        }
    }

    /// Encode as one SSE event block.
    ///
    /// # Errors
    ///
    /// Returns error if the payload fails to serialize.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let data = match self {
            Self::Next { payload } => serde_json::to_string(payload)?,
            Self::Error { errors } => serde_json::to_string(errors)?,
            Self::Complete => "{}".to_string(),
        };
        Ok(format!("event: {}\ndata: {}\n\n", self.event_name(), data))
    }

    /// Decode one SSE event block (`event:` and `data:` lines).
    ///
    /// Returns `None` for blocks that are not devmesh stream frames
    /// (comments, keepalives).
    #[must_use]
    pub fn decode(block: &str) -> Option<Self> {
        let mut event = None;
        let mut data = String::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(rest.trim_start());
            }
        }

        match event.as_deref() {
            Some("next") => serde_json::from_str(&data)
                .ok()
                .map(|payload| Self::Next { payload }),
            Some("error") => serde_json::from_str(&data)
                .ok()
                .map(|errors| Self::Error { errors }),
            Some("complete") => Some(Self::Complete),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_roundtrip() {
        let frame = StreamFrame::Next {
            payload: GraphQLResponse::data(json!({"commandOutput": {"content": "hi"}})),
        };
        let encoded = frame.encode().unwrap();
        assert!(encoded.starts_with("event: next\n"));
        assert!(encoded.ends_with("\n\n"));

        let decoded = StreamFrame::decode(&encoded).unwrap();
        match decoded {
            StreamFrame::Next { payload } => {
                assert_eq!(
                    payload.data.unwrap()["commandOutput"]["content"],
                    json!("hi")
                );
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_error_is_terminal() {
        let frame = StreamFrame::Error {
            errors: vec![WireError::with_code("overflow", "BUFFER_OVERFLOW")],
        };
        assert!(frame.is_terminal());
        let decoded = StreamFrame::decode(&frame.encode().unwrap()).unwrap();
        assert!(decoded.is_terminal());
    }

    #[test]
    fn test_complete_roundtrip() {
        let encoded = StreamFrame::Complete.encode().unwrap();
        let decoded = StreamFrame::decode(&encoded).unwrap();
        assert!(matches!(decoded, StreamFrame::Complete));
    }

    #[test]
    fn test_decode_ignores_keepalive_comments() {
        assert!(StreamFrame::decode(": keepalive\n\n").is_none());
    }
}
