use std::io;

use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, AtelierErr>;

#[derive(Error, Debug)]
pub enum SandboxErr {
    /// A tool call referenced a path whose canonical form lies outside the
    /// session workspace.
    #[error("path escapes the session workspace: {0}")]
    OutOfSandbox(String),

    /// No listenable port was found in the configured range.
    #[error("no free port in range {0}-{1}")]
    PortExhausted(u16, u16),

    /// The dev server came up but never answered the readiness probe, or
    /// died before it did.
    #[error("dev server on port {port} failed readiness probe: {reason}")]
    DevServerNotReady { port: u16, reason: String },

    /// Command timed out.
    #[error("command timed out")]
    Timeout,

    /// Command was killed by a signal.
    #[error("command was killed by signal {0}")]
    Signal(i32),
}

#[derive(Error, Debug)]
pub enum AtelierErr {
    /// The reasoning-model stream disconnected or errored out before the
    /// terminal summary. The turn is aborted; the runtime does not retry.
    #[error("model stream disconnected before completion: {0}")]
    Stream(String),

    /// The reasoning-model subprocess exited or its channel closed.
    #[error("model subprocess died unexpectedly")]
    ModelProcessDied,

    /// The turn exceeded its configured wall-clock budget.
    #[error("turn timed out")]
    TurnTimeout,

    /// A chat arrived while another turn held the session lock.
    #[error("another turn is already in flight")]
    Busy,

    /// A failed reset left the session unusable; it must be discarded.
    #[error("session is broken and must be discarded")]
    Broken,

    /// Agent construction failed before the first envelope was sent.
    #[error("agent initialization failed: {0}")]
    Init(String),

    /// Invalid configuration detected at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Sub-agent name not present in the registry.
    #[error("unknown sub-agent: {0}")]
    UnknownSubagent(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxErr),

    #[error("{0}")]
    EnvVar(EnvVarError),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

#[derive(Debug)]
pub struct EnvVarError {
    /// Name of the environment variable that is missing.
    pub var: String,

    /// Optional instructions to help the user get a valid value for the
    /// variable and set it.
    pub instructions: Option<String>,
}

impl std::fmt::Display for EnvVarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Missing environment variable: `{}`.", self.var)?;
        if let Some(instructions) = &self.instructions {
            write!(f, " {instructions}")?;
        }
        Ok(())
    }
}
