//! Pre- and post-tool hooks.
//!
//! Pre hooks may deny a call (sharing the policy gate's deny mechanism);
//! post hooks may inject synthetic system messages into the agent's next
//! model exchange. Hooks run strictly sequentially per tool call and match
//! on tool name with simple patterns (`*` wildcard, `|` alternation). A
//! misbehaving hook is logged and skipped, never aborting the pipeline.

use tracing::debug;
use tracing::warn;

use crate::audit::AuditRecorder;
use crate::policy::PolicyDecision;
use crate::tools::TOOL_BASH;
use crate::tools::TOOL_TASK;
use crate::tools::ToolCall;
use crate::tools::ToolContext;
use crate::tools::ToolOutput;
use crate::tools::is_file_tool;
use crate::tools::is_mutating_tool;

/// How much failing build output the correction message carries.
const MAX_CORRECTION_OUTPUT_CHARS: usize = 2_000;

/// Tool-name prefix for model-side data-exploration tools.
const EXPLORATION_TOOL_PREFIX: &str = "data_";

/// Per-turn hook state, reset when a turn starts or errors out.
#[derive(Debug, Default)]
pub struct TurnFlags {
    pub build_failures: u32,
}

impl TurnFlags {
    pub fn reset(&mut self) {
        self.build_failures = 0;
    }
}

#[derive(Debug, PartialEq)]
pub enum PreHookDecision {
    Continue,
    Deny { reason: String },
}

/// Accumulated effects of the post hooks for one tool call.
#[derive(Debug, Default, PartialEq)]
pub struct PostHookEffects {
    /// System messages to inject before the model's next exchange.
    pub inject: Vec<String>,
    /// Set when the self-correction budget is exhausted; the turn ends
    /// with this error instead of another nudge.
    pub fail_turn: Option<String>,
}

/// Simple tool-name pattern match: `*` suffix wildcard and `|`
/// alternation.
fn tool_matches(pattern: &str, name: &str) -> bool {
    pattern.split('|').any(|alt| {
        if alt == "*" {
            true
        } else if let Some(prefix) = alt.strip_suffix('*') {
            name.starts_with(prefix)
        } else {
            alt == name
        }
    })
}

pub struct HookPipeline {
    audit: AuditRecorder,
    build_failure_limit: u32,
}

impl HookPipeline {
    pub fn new(audit: AuditRecorder, build_failure_limit: u32) -> Self {
        Self {
            audit,
            build_failure_limit,
        }
    }

    /// Unconditional audit pre-hook. Runs for every attempt, including
    /// ones the policy gate denied, so post-mortems see the whole story.
    pub async fn audit_call(&self, call: &ToolCall, decision: &PolicyDecision) {
        let (verdict, reason) = match decision {
            PolicyDecision::Allow => ("allow", None),
            PolicyDecision::Deny { reason } => ("deny", Some(reason.as_str())),
        };
        self.audit
            .record(&call.name, &call.id, verdict, reason, &call.input)
            .await;
    }

    /// Remaining pre hooks. Path validation duplicates the policy gate's
    /// containment check on purpose.
    pub fn run_pre(&self, call: &ToolCall, ctx: &ToolContext) -> PreHookDecision {
        if tool_matches("Read|Write|Edit|Glob|Grep", &call.name) && is_file_tool(&call.name) {
            let raw = call
                .input
                .get("file_path")
                .or_else(|| call.input.get("path"))
                .and_then(|v| v.as_str());
            if let Some(raw) = raw
                && let Err(e) = ctx.supervisor.resolve_path(raw)
            {
                return PreHookDecision::Deny {
                    reason: e.to_string(),
                };
            }
        }
        PreHookDecision::Continue
    }

    /// Post hooks, in order: build-failure self-correction, review
    /// invalidation, planning tracking.
    pub fn run_post(
        &self,
        call: &ToolCall,
        output: &ToolOutput,
        ctx: &ToolContext,
        flags: &mut TurnFlags,
    ) -> PostHookEffects {
        let mut effects = PostHookEffects::default();

        if tool_matches(TOOL_BASH, &call.name) {
            self.build_failure_hook(call, output, flags, &mut effects);
        }
        if tool_matches("Write|Edit", &call.name) && is_mutating_tool(&call.name) && !output.is_error
        {
            debug!("review invalidation: {} succeeded", call.name);
            ctx.state.note_file_mutation();
        }
        if tool_matches(TOOL_TASK, &call.name) && !output.is_error {
            self.planning_hook(call, ctx);
        }

        effects
    }

    /// Planning tracking for model-side exploration tools, whose results
    /// arrive as pass-through events rather than dispatched calls.
    pub fn note_exploration_result(&self, tool_name: &str, is_error: bool, ctx: &ToolContext) {
        if !is_error && tool_name.starts_with(EXPLORATION_TOOL_PREFIX) {
            ctx.state.note_exploration();
        }
    }

    fn build_failure_hook(
        &self,
        call: &ToolCall,
        output: &ToolOutput,
        flags: &mut TurnFlags,
        effects: &mut PostHookEffects,
    ) {
        let Some(command) = call.input.get("command").and_then(|v| v.as_str()) else {
            return;
        };
        if !is_build_command(command) {
            return;
        }

        match output.exit_code {
            Some(0) => {
                flags.build_failures = 0;
            }
            Some(code) => {
                flags.build_failures += 1;
                if flags.build_failures > self.build_failure_limit {
                    effects.fail_turn = Some(format!(
                        "`{command}` failed {} consecutive times; giving up on automatic correction",
                        flags.build_failures
                    ));
                    return;
                }
                let mut excerpt = output.output.clone();
                if excerpt.len() > MAX_CORRECTION_OUTPUT_CHARS {
                    let mut cut = MAX_CORRECTION_OUTPUT_CHARS;
                    while !excerpt.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    excerpt.truncate(cut);
                    excerpt.push_str("[truncated]");
                }
                effects.inject.push(format!(
                    "`{command}` failed with exit code {code}.\n\n{excerpt}\n\n\
                     Delegate to the code-reviewer sub-agent to diagnose the failure, \
                     then to the error-fixer sub-agent to repair it, before running \
                     the build again."
                ));
            }
            None => {}
        }
    }

    fn planning_hook(&self, call: &ToolCall, ctx: &ToolContext) {
        let Some(subagent) = call.input.get("subagent").and_then(|v| v.as_str()) else {
            warn!("Task call without a subagent field; skipping planning hook");
            return;
        };
        ctx.state.note_subagent_complete(subagent);
    }
}

/// Whether a shell command is a known build, type-check or test
/// invocation. Compound commands count if any segment does.
pub(crate) fn is_build_command(command: &str) -> bool {
    const BUILD_PREFIXES: &[&str] = &[
        "npm run build",
        "npm run typecheck",
        "npm run check",
        "npm test",
        "npm run test",
        "yarn build",
        "yarn test",
        "pnpm build",
        "pnpm run build",
        "pnpm test",
        "npx tsc",
        "tsc",
        "next build",
        "vitest",
        "jest",
    ];
    command
        .split(';')
        .flat_map(|seg| seg.split("&&"))
        .map(str::trim)
        .any(|seg| BUILD_PREFIXES.iter().any(|prefix| seg.starts_with(prefix)))
}
