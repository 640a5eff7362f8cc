//! Defines the protocol for one atelier session between a client and the
//! orchestration runtime.
//!
//! The channel is bidirectional and message-oriented: clients send
//! [`ClientMessage`] values, the server streams [`Envelope`] values back.
//! Everything is JSON with an internal `type` tag.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// A message sent by the client over the session channel.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One user turn. The server replies with a stream of envelopes
    /// terminated by exactly one `done` or `error`.
    Chat { message: String },

    /// Liveness check; answered immediately with `pong`.
    Ping,

    /// Tear down the agent and workspace for this session and rebuild them.
    /// Rejected while a turn is in flight.
    Reset,
}

/// One tagged message on the server → client stream.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Envelope {
    /// Emitted once per successful channel bind, before any other envelope
    /// on that channel.
    Connection { session_id: String },

    /// A chunk of assistant text.
    Text { content: String },

    /// The agent invoked a tool. Only emitted for calls the policy gate
    /// allowed; denied calls surface as an error `tool_result` instead.
    ToolUse {
        tool: String,
        input: JsonValue,
        id: String,
    },

    /// Result of a tool call, successful or not.
    ToolResult {
        tool_use_id: String,
        content: JsonValue,
        is_error: bool,
    },

    /// Terminal envelope of a successful turn.
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        preview_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        num_turns: Option<u32>,
    },

    /// Terminal envelope of a failed turn, or a standalone failure
    /// (busy, timeout, broken session). The message is intentionally
    /// opaque; details go to the server logs.
    Error { message: String },

    /// Reply to `ping`.
    Pong,
}

impl Envelope {
    /// Whether this envelope ends a turn stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Envelope::Done { .. } | Envelope::Error { .. })
    }
}

/// Body of `POST /session`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SessionCreatedResponse {
    pub session_id: String,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
}
