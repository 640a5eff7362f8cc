//! The tool surface invoked by the reasoning model. Every call is policy
//! gated and hook wrapped before it lands here; dispatch itself never
//! panics and never returns a transport error, only a `ToolOutput` whose
//! `is_error` flag tells the model what happened.

mod file;
mod preview;
mod shell;
mod spec;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use serde_json::json;

use crate::config::Config;
use crate::sandbox::SandboxSupervisor;
use crate::state::SessionState;

pub use spec::ToolSpec;
pub use spec::builtin_tool_specs;
pub use spec::tool_specs_for;

pub const TOOL_READ: &str = "Read";
pub const TOOL_WRITE: &str = "Write";
pub const TOOL_EDIT: &str = "Edit";
pub const TOOL_GLOB: &str = "Glob";
pub const TOOL_GREP: &str = "Grep";
pub const TOOL_BASH: &str = "Bash";
pub const TOOL_TASK: &str = "Task";
pub const TOOL_GET_PREVIEW_URL: &str = "get-preview-url";
pub const TOOL_START_DEV_SERVER: &str = "start-dev-server";
pub const TOOL_MARK_REVIEW_PASSED: &str = "mark-security-review-passed";

/// Tools that take a path argument and must stay inside the workspace.
pub fn is_file_tool(name: &str) -> bool {
    matches!(
        name,
        TOOL_READ | TOOL_WRITE | TOOL_EDIT | TOOL_GLOB | TOOL_GREP
    )
}

/// Tools whose success mutates workspace files, which invalidates a passed
/// security review.
pub fn is_mutating_tool(name: &str) -> bool {
    matches!(name, TOOL_WRITE | TOOL_EDIT)
}

/// Tools the runtime executes itself. Anything else the model runs on its
/// own side and reports back.
pub fn is_builtin_tool(name: &str) -> bool {
    matches!(
        name,
        TOOL_READ
            | TOOL_WRITE
            | TOOL_EDIT
            | TOOL_GLOB
            | TOOL_GREP
            | TOOL_BASH
            | TOOL_TASK
            | TOOL_GET_PREVIEW_URL
            | TOOL_START_DEV_SERVER
            | TOOL_MARK_REVIEW_PASSED
    )
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: JsonValue,
}

/// Structured result of a tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub output: String,
    pub exit_code: Option<i32>,
    pub url: Option<String>,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: None,
            url: None,
            is_error: false,
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: None,
            url: None,
            is_error: true,
        }
    }

    /// Payload for the `tool_result` envelope and the model echo. Plain
    /// text stays a string; shell and preview results become an object.
    pub fn to_content(&self) -> JsonValue {
        if self.exit_code.is_none() && self.url.is_none() {
            return JsonValue::String(self.output.clone());
        }
        let mut obj = json!({ "output": self.output });
        if let Some(map) = obj.as_object_mut() {
            if let Some(code) = self.exit_code {
                map.insert("exit_code".to_string(), json!(code));
            }
            if let Some(url) = &self.url {
                map.insert("url".to_string(), json!(url));
            }
        }
        obj
    }
}

/// Session-scoped context threaded through every tool call. Tools act on
/// the sandbox of the session that issued them; there is deliberately no
/// process-global supervisor handle.
#[derive(Clone)]
pub struct ToolContext {
    pub supervisor: Arc<SandboxSupervisor>,
    pub state: Arc<SessionState>,
    pub config: Arc<Config>,
}

/// Execute one allowed tool call.
pub async fn dispatch(call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
    match call.name.as_str() {
        TOOL_READ => file::read(&call.input, ctx),
        TOOL_WRITE => file::write(&call.input, ctx),
        TOOL_EDIT => file::edit(&call.input, ctx),
        TOOL_GLOB => file::glob(&call.input, ctx),
        TOOL_GREP => file::grep(&call.input, ctx),
        TOOL_BASH => shell::run(call, ctx).await,
        TOOL_GET_PREVIEW_URL => preview::get_preview_url(ctx),
        TOOL_START_DEV_SERVER => preview::start_dev_server(ctx).await,
        TOOL_MARK_REVIEW_PASSED => {
            ctx.state.mark_review_passed();
            ToolOutput::text("security review recorded as passed")
        }
        other => ToolOutput::error(format!("unsupported tool: {other}")),
    }
}

/// Parse tool arguments, folding failures into an error result so the
/// model can re-sample.
pub(crate) fn parse_input<T: DeserializeOwned>(input: &JsonValue) -> Result<T, ToolOutput> {
    serde_json::from_value(input.clone())
        .map_err(|e| ToolOutput::error(format!("failed to parse tool arguments: {e}")))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn content_shape_depends_on_fields() {
        let plain = ToolOutput::text("hello");
        assert_eq!(plain.to_content(), JsonValue::String("hello".to_string()));

        let shell = ToolOutput {
            output: "ok".to_string(),
            exit_code: Some(0),
            url: None,
            is_error: false,
        };
        assert_eq!(
            shell.to_content(),
            json!({ "output": "ok", "exit_code": 0 })
        );
    }

    #[test]
    fn tool_families() {
        assert!(is_file_tool(TOOL_READ));
        assert!(is_file_tool(TOOL_GREP));
        assert!(!is_file_tool(TOOL_BASH));
        assert!(is_mutating_tool(TOOL_WRITE));
        assert!(!is_mutating_tool(TOOL_READ));
    }
}
