//! Types and transport for the reasoning-model subprocess.
//!
//! The model is a black box that keeps multi-turn context internally. The
//! runtime speaks to it with [`ModelInput`] values and consumes a stream of
//! [`ModelEvent`] values; the concrete wire (JSON lines over stdio) lives in
//! [`process`]. The trait seam exists so tests can script a model without
//! spawning anything.

mod process;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::tools::ToolSpec;

pub use process::ProcessTransport;
pub use process::ProcessTransportFactory;

/// One typed message emitted by the reasoning model.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelEvent {
    /// Assistant text delta.
    Text { text: String },

    /// The model wants a tool executed on its behalf.
    ToolUse {
        id: String,
        name: String,
        input: JsonValue,
    },

    /// Result of a tool the model ran internally (e.g. a data-exploration
    /// query against an external service). Passed through to the client.
    ToolResult {
        tool_use_id: String,
        content: JsonValue,
        is_error: bool,
    },

    /// Terminal summary for the current query.
    Done {
        #[serde(default)]
        cost_usd: Option<f64>,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        num_turns: Option<u32>,
    },

    /// The model gave up on the current query.
    Error { message: String },
}

/// One typed message sent to the reasoning model.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelInput {
    /// Sent exactly once, before the first query. Fixes the system prompt,
    /// tool surface and working directory for the life of the session.
    Configure {
        system_prompt: String,
        tools: Vec<ToolSpec>,
        subagents: Vec<SubagentAdvert>,
        cwd: PathBuf,
    },

    /// One user turn.
    User { text: String },

    /// A synthetic system message injected by a post-hook (build-failure
    /// correction, review-state notices).
    System { text: String },

    /// Outcome of a tool call the model requested.
    ToolOutput {
        tool_use_id: String,
        content: JsonValue,
        is_error: bool,
    },
}

/// What the model is told about an available sub-agent.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SubagentAdvert {
    pub name: String,
    pub description: String,
}

/// Which model tier serves a profile. Sub-agents may run on the smaller
/// tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    Deep,
}

/// Identity of one reasoning context: the main agent or a named sub-agent.
#[derive(Debug, Clone)]
pub struct ModelProfile {
    pub role: String,
    pub tier: ModelTier,
}

impl ModelProfile {
    pub fn main() -> Self {
        Self {
            role: "main".to_string(),
            tier: ModelTier::Deep,
        }
    }
}

/// Bidirectional channel to one reasoning context. Single writer; the task
/// driving the turn is the only reader.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn send(&self, input: ModelInput) -> Result<()>;

    /// Next event, or `None` once the model side has closed down.
    async fn recv(&self) -> Result<Option<ModelEvent>>;

    /// Disconnect. Must be safe to call more than once.
    async fn shutdown(&self);
}

/// Creates transports: one for the main agent at session init, and one per
/// sub-agent delegation.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, profile: &ModelProfile) -> Result<Box<dyn ModelTransport>>;
}
