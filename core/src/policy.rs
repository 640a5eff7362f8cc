//! Synchronous allow/deny decision on every tool call.
//!
//! Rules are evaluated in order: shell denylist, path containment,
//! sensitive-file denylist, review gate, port bounds. The first rule that
//! fires wins. A denial becomes a synthetic error tool result; the model is
//! told why and may re-plan.

use regex_lite::Regex;
use tracing::warn;

use crate::config::Config;
use crate::tools::TOOL_BASH;
use crate::tools::TOOL_EDIT;
use crate::tools::TOOL_READ;
use crate::tools::TOOL_START_DEV_SERVER;
use crate::tools::TOOL_WRITE;
use crate::tools::ToolCall;
use crate::tools::ToolContext;
use crate::tools::is_file_tool;

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
}

impl PolicyDecision {
    fn deny(reason: impl Into<String>) -> Self {
        PolicyDecision::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, PolicyDecision::Deny { .. })
    }
}

/// Compiled once per agent session from the session config.
pub struct PolicyGate {
    dangerous_commands: Vec<Regex>,
    sensitive_markers: Vec<String>,
}

impl PolicyGate {
    pub fn from_config(config: &Config) -> Self {
        let dangerous_commands = config
            .dangerous_command_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("skipping unparseable dangerous-command pattern {pattern:?}: {e}");
                    None
                }
            })
            .collect();
        Self {
            dangerous_commands,
            sensitive_markers: config.sensitive_path_markers.clone(),
        }
    }

    pub fn decide(&self, call: &ToolCall, ctx: &ToolContext) -> PolicyDecision {
        // 1. Shell denylist.
        if call.name == TOOL_BASH {
            if let Some(command) = call.input.get("command").and_then(|v| v.as_str())
                && let Some(pattern) = self.match_dangerous(command)
            {
                return PolicyDecision::deny(format!(
                    "blocked: command matches dangerous pattern `{pattern}`"
                ));
            }
        }

        // 2. Path containment, symlinks resolved.
        if is_file_tool(&call.name) {
            let raw_path = call
                .input
                .get("file_path")
                .or_else(|| call.input.get("path"))
                .and_then(|v| v.as_str());
            if let Some(raw) = raw_path {
                match ctx.supervisor.resolve_path(raw) {
                    Ok(resolved) => {
                        // 3. Sensitive-file denylist on the canonical form.
                        if matches!(call.name.as_str(), TOOL_READ | TOOL_WRITE | TOOL_EDIT) {
                            let canonical = resolved.to_string_lossy();
                            if let Some(marker) = self
                                .sensitive_markers
                                .iter()
                                .find(|marker| canonical.contains(marker.as_str()))
                            {
                                return PolicyDecision::deny(format!(
                                    "blocked: path matches sensitive marker `{marker}`"
                                ));
                            }
                        }
                    }
                    Err(e) => return PolicyDecision::deny(e.to_string()),
                }
            }
        }

        // 4. Review gate.
        if call.name == TOOL_START_DEV_SERVER && !ctx.state.review_state().allows_dev_server() {
            return PolicyDecision::deny(format!(
                "blocked: security review state is {}; the preview server requires a passed review",
                ctx.state.review_state()
            ));
        }

        // 5. Port bounds, on any tool input that carries one.
        if let Some(port) = call.input.get("port").and_then(|v| v.as_i64())
            && !(1..=65535).contains(&port)
        {
            return PolicyDecision::deny(format!("blocked: port {port} is out of range"));
        }

        PolicyDecision::Allow
    }

    fn match_dangerous(&self, command: &str) -> Option<String> {
        self.dangerous_commands
            .iter()
            .find(|regex| regex.is_match(command))
            .map(|regex| regex.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::sandbox::SandboxSupervisor;
    use crate::state::SessionState;
    use crate::test_support::test_config;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn gate_and_context(dir: &TempDir) -> (PolicyGate, ToolContext) {
        let config = Arc::new(test_config(dir.path().to_path_buf()));
        let supervisor = Arc::new(
            SandboxSupervisor::create(Uuid::new_v4(), Arc::clone(&config))
                .await
                .unwrap(),
        );
        let gate = PolicyGate::from_config(&config);
        (
            gate,
            ToolContext {
                supervisor,
                state: Arc::new(SessionState::new()),
                config,
            },
        )
    }

    fn call(name: &str, input: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "call-1".to_string(),
            name: name.to_string(),
            input,
        }
    }

    #[tokio::test]
    async fn dangerous_commands_are_denied() {
        let dir = TempDir::new().unwrap();
        let (gate, ctx) = gate_and_context(&dir).await;

        let decision = gate.decide(&call(TOOL_BASH, json!({ "command": "rm -rf /" })), &ctx);
        let PolicyDecision::Deny { reason } = decision else {
            panic!("expected denial");
        };
        assert!(reason.contains("blocked"));

        assert_eq!(
            gate.decide(&call(TOOL_BASH, json!({ "command": "npm run build" })), &ctx),
            PolicyDecision::Allow
        );
    }

    #[tokio::test]
    async fn escaping_paths_are_denied() {
        let dir = TempDir::new().unwrap();
        let (gate, ctx) = gate_and_context(&dir).await;

        let decision = gate.decide(
            &call(TOOL_READ, json!({ "file_path": "../../etc/passwd" })),
            &ctx,
        );
        assert!(decision.is_deny());
    }

    #[tokio::test]
    async fn sensitive_paths_are_denied() {
        let dir = TempDir::new().unwrap();
        let (gate, ctx) = gate_and_context(&dir).await;

        let decision = gate.decide(&call(TOOL_READ, json!({ "file_path": ".env" })), &ctx);
        assert!(decision.is_deny());

        // Ordinary source files are fine.
        assert_eq!(
            gate.decide(&call(TOOL_READ, json!({ "file_path": "app/page.tsx" })), &ctx),
            PolicyDecision::Allow
        );
    }

    #[tokio::test]
    async fn dev_server_requires_passed_review() {
        let dir = TempDir::new().unwrap();
        let (gate, ctx) = gate_and_context(&dir).await;

        let start = call(TOOL_START_DEV_SERVER, json!({}));
        assert!(gate.decide(&start, &ctx).is_deny());

        ctx.state.mark_review_passed();
        assert_eq!(gate.decide(&start, &ctx), PolicyDecision::Allow);

        // A mutation after the pass closes the gate again.
        ctx.state.note_file_mutation();
        assert!(gate.decide(&start, &ctx).is_deny());
    }

    #[tokio::test]
    async fn out_of_range_ports_are_denied() {
        let dir = TempDir::new().unwrap();
        let (gate, ctx) = gate_and_context(&dir).await;
        ctx.state.mark_review_passed();

        let decision = gate.decide(&call(TOOL_START_DEV_SERVER, json!({ "port": 70000 })), &ctx);
        assert!(decision.is_deny());

        // An in-range port is allowed through (and later ignored in favor
        // of the session allocation).
        assert_eq!(
            gate.decide(&call(TOOL_START_DEV_SERVER, json!({ "port": 3000 })), &ctx),
            PolicyDecision::Allow
        );
    }
}
