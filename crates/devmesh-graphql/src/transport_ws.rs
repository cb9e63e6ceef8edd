//! `graphql-transport-ws` protocol messages.
//!
//! Message set per the protocol specification:
//! <https://github.com/enisdenjo/graphql-ws/blob/master/PROTOCOL.md>
//! Used by the gateway's WebSocket binding; the same `next`/`error`/
//! `complete` payload shapes ride the SSE binding.

use serde::{Deserialize, Serialize};

use crate::request::{GraphQLRequest, WireError};

/// Client-to-server message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessageType {
    /// Connection initialization.
    ConnectionInit,
    /// Ping (keepalive).
    Ping,
    /// Pong response.
    Pong,
    /// Subscribe to an operation.
    Subscribe,
    /// Complete/unsubscribe from an operation.
    Complete,
}

impl ClientMessageType {
    /// Parse message type from its wire string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connection_init" => Some(Self::ConnectionInit),
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            "subscribe" => Some(Self::Subscribe),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

/// Client message (from the WebSocket client).
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: String,

    /// Operation id (for subscribe/complete).
    #[serde(default)]
    pub id: Option<String>,

    /// Payload (connection params or subscribe payload).
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl ClientMessage {
    /// Parse the message type.
    #[must_use]
    pub fn parsed_type(&self) -> Option<ClientMessageType> {
        ClientMessageType::parse(&self.message_type)
    }

    /// Extract the subscribe payload as a GraphQL request.
    #[must_use]
    pub fn subscribe_request(&self) -> Option<GraphQLRequest> {
        self.payload
            .as_ref()
            .and_then(|p| serde_json::from_value(p.clone()).ok())
    }
}

/// Server message (to the WebSocket client).
#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage {
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: String,

    /// Operation id (for next/error/complete).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Payload (data, errors, or ack payload).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ServerMessage {
    /// Create a `connection_ack` message.
    #[must_use]
    pub fn connection_ack() -> Self {
        Self {
            message_type: "connection_ack".to_string(),
            id:           None,
            payload:      None,
        }
    }

    /// Create a `ping` message.
    #[must_use]
    pub fn ping() -> Self {
        Self {
            message_type: "ping".to_string(),
            id:           None,
            payload:      None,
        }
    }

    /// Create a `pong` message echoing the ping payload.
    #[must_use]
    pub fn pong(payload: Option<serde_json::Value>) -> Self {
        Self {
            message_type: "pong".to_string(),
            id:           None,
            payload,
        }
    }

    /// Create a `next` (data) message.
    #[must_use]
    pub fn next(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_type: "next".to_string(),
            id:           Some(id.into()),
            payload:      Some(payload),
        }
    }

    /// Create an `error` message.
    #[must_use]
    pub fn error(id: impl Into<String>, errors: Vec<WireError>) -> Self {
        Self {
            message_type: "error".to_string(),
            id:           Some(id.into()),
            payload:      Some(serde_json::to_value(errors).unwrap_or_default()),
        }
    }

    /// Create a `complete` message.
    #[must_use]
    pub fn complete(id: impl Into<String>) -> Self {
        Self {
            message_type: "complete".to_string(),
            id:           Some(id.into()),
            payload:      None,
        }
    }

    /// Serialize to JSON text.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Close codes for the WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Normal closure.
    Normal = 1000,
    /// Client violated the protocol.
    ProtocolError = 4400,
    /// Connection initialization timeout.
    ConnectionInitTimeout = 4408,
    /// Subscriber with a duplicate operation id.
    SubscriberAlreadyExists = 4409,
    /// Too many initialization requests.
    TooManyInitRequests = 4429,
}

impl CloseCode {
    /// Numeric close code.
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Human-readable close reason.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Normal => "Normal closure",
            Self::ProtocolError => "Protocol error",
            Self::ConnectionInitTimeout => "Connection initialization timeout",
            Self::SubscriberAlreadyExists => "Subscriber already exists",
            Self::TooManyInitRequests => "Too many initialization requests",
        }
    }
}
