//! Declarative tool schemas advertised to the reasoning model.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_json::json;

use super::TOOL_BASH;
use super::TOOL_EDIT;
use super::TOOL_GET_PREVIEW_URL;
use super::TOOL_GLOB;
use super::TOOL_GREP;
use super::TOOL_MARK_REVIEW_PASSED;
use super::TOOL_READ;
use super::TOOL_START_DEV_SERVER;
use super::TOOL_TASK;
use super::TOOL_WRITE;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: JsonValue,
}

fn tool(name: &str, description: &str, input_schema: JsonValue) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

/// The full tool surface of the main agent.
pub fn builtin_tool_specs() -> Vec<ToolSpec> {
    vec![
        tool(
            TOOL_READ,
            "Read a file from the workspace.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "Path relative to the workspace root." },
                    "offset": { "type": "integer", "description": "1-based line to start from." },
                    "limit": { "type": "integer", "description": "Maximum number of lines to return." }
                },
                "required": ["file_path"]
            }),
        ),
        tool(
            TOOL_WRITE,
            "Write a file, creating parent directories as needed.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["file_path", "content"]
            }),
        ),
        tool(
            TOOL_EDIT,
            "Replace an exact string in a file. The target must be unique unless replace_all is set.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string" },
                    "old_string": { "type": "string" },
                    "new_string": { "type": "string" },
                    "replace_all": { "type": "boolean" }
                },
                "required": ["file_path", "old_string", "new_string"]
            }),
        ),
        tool(
            TOOL_GLOB,
            "List workspace files matching a glob pattern.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "e.g. 'app/**/*.tsx'" },
                    "path": { "type": "string", "description": "Subdirectory to search. Default '.'." }
                },
                "required": ["pattern"]
            }),
        ),
        tool(
            TOOL_GREP,
            "Search file contents with a regular expression.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string" },
                    "path": { "type": "string", "description": "Subdirectory to search. Default '.'." },
                    "glob": { "type": "string", "description": "Only search files matching this glob." }
                },
                "required": ["pattern"]
            }),
        ),
        tool(
            TOOL_BASH,
            "Run a shell command inside the workspace.",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "background": { "type": "boolean", "description": "Run as a long-lived background process." },
                    "timeout_ms": { "type": "integer" }
                },
                "required": ["command"]
            }),
        ),
        tool(
            TOOL_TASK,
            "Delegate a task to a named sub-agent.",
            json!({
                "type": "object",
                "properties": {
                    "subagent": { "type": "string", "description": "Registered sub-agent name." },
                    "prompt": { "type": "string", "description": "What the sub-agent should do." }
                },
                "required": ["subagent", "prompt"]
            }),
        ),
        tool(
            TOOL_GET_PREVIEW_URL,
            "Return the public URL of the running preview server.",
            json!({ "type": "object", "properties": {} }),
        ),
        tool(
            TOOL_START_DEV_SERVER,
            "Start the preview dev server on the session's allocated port. Requires a passed security review.",
            json!({
                "type": "object",
                "properties": {
                    "port": { "type": "integer", "description": "Ignored; the session's allocated port is always used." }
                }
            }),
        ),
        tool(
            TOOL_MARK_REVIEW_PASSED,
            "Record that the security review passed. Unblocks start-dev-server until the next code change.",
            json!({ "type": "object", "properties": {} }),
        ),
    ]
}

/// The subset of the surface a sub-agent is permitted to use.
pub fn tool_specs_for(names: &[&str]) -> Vec<ToolSpec> {
    builtin_tool_specs()
        .into_iter()
        .filter(|spec| names.contains(&spec.name.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subset_preserves_order_and_filters() {
        let specs = tool_specs_for(&[TOOL_READ, TOOL_GREP]);
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![TOOL_READ, TOOL_GREP]);
    }

    #[test]
    fn every_builtin_has_an_object_schema() {
        for spec in builtin_tool_specs() {
            assert_eq!(
                spec.input_schema.get("type").and_then(|t| t.as_str()),
                Some("object"),
                "{} schema is not an object",
                spec.name
            );
        }
    }
}
