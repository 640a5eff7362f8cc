//! The sub-agent registry: named reasoning profiles the main agent can
//! delegate to. Each runs with its own restricted tool subset but shares
//! the session's policy gate, hook pipeline, and workspace.

use crate::model::ModelTier;
use crate::model::SubagentAdvert;
use crate::tools::TOOL_BASH;
use crate::tools::TOOL_EDIT;
use crate::tools::TOOL_GLOB;
use crate::tools::TOOL_GREP;
use crate::tools::TOOL_READ;
use crate::tools::TOOL_WRITE;

#[derive(Debug, Clone, Copy)]
pub struct SubagentSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub prompt: &'static str,
    pub tools: &'static [&'static str],
    pub tier: ModelTier,
}

const READ_ONLY_TOOLS: &[&str] = &[TOOL_READ, TOOL_GLOB, TOOL_GREP];

/// The fixed registry. Names referenced by hooks (`code-reviewer`,
/// `error-fixer`) must stay present.
pub const REGISTRY: &[SubagentSpec] = &[
    SubagentSpec {
        name: "code-reviewer",
        description: "Diagnoses build failures and defective changes; reports findings without fixing.",
        prompt: include_str!("../prompts/subagents/code_reviewer.md"),
        tools: &[TOOL_READ, TOOL_GLOB, TOOL_GREP, TOOL_BASH],
        tier: ModelTier::Fast,
    },
    SubagentSpec {
        name: "error-fixer",
        description: "Applies minimal edits to resolve diagnosed defects and re-runs the failing command.",
        prompt: include_str!("../prompts/subagents/error_fixer.md"),
        tools: &[TOOL_READ, TOOL_WRITE, TOOL_EDIT, TOOL_GLOB, TOOL_GREP, TOOL_BASH],
        tier: ModelTier::Deep,
    },
    SubagentSpec {
        name: "security-reviewer",
        description: "Inspects the workspace for secrets, injection risks and unsafe input handling.",
        prompt: include_str!("../prompts/subagents/security_reviewer.md"),
        tools: READ_ONLY_TOOLS,
        tier: ModelTier::Deep,
    },
    SubagentSpec {
        name: "planner",
        description: "Produces a step-by-step build plan from the request and exploration notes.",
        prompt: include_str!("../prompts/subagents/planner.md"),
        tools: READ_ONLY_TOOLS,
        tier: ModelTier::Deep,
    },
    SubagentSpec {
        name: "requirements-analyzer",
        description: "Decides whether the request is buildable as stated or needs clarification.",
        prompt: include_str!("../prompts/subagents/requirements_analyzer.md"),
        tools: READ_ONLY_TOOLS,
        tier: ModelTier::Fast,
    },
    SubagentSpec {
        name: "plan-validator",
        description: "Checks a build plan for missing data, unknown components and ordering problems.",
        prompt: include_str!("../prompts/subagents/plan_validator.md"),
        tools: READ_ONLY_TOOLS,
        tier: ModelTier::Fast,
    },
];

pub fn find(name: &str) -> Option<&'static SubagentSpec> {
    REGISTRY.iter().find(|spec| spec.name == name)
}

/// What the main agent is told about the registry at configure time.
pub fn adverts() -> Vec<SubagentAdvert> {
    REGISTRY
        .iter()
        .map(|spec| SubagentAdvert {
            name: spec.name.to_string(),
            description: spec.description.to_string(),
        })
        .collect()
}
