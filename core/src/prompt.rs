//! System-prompt composition: a preset base plus append-only layers. The
//! composition is fixed at agent initialization for the life of the session.

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::config::Config;

const BASE_PROMPT: &str = include_str!("../prompts/base.md");
const DOMAIN_KNOWLEDGE: &str = include_str!("../prompts/domain.md");
const PLANNING_WORKFLOW: &str = include_str!("../prompts/planning.md");
const TOOL_GUIDE: &str = include_str!("../prompts/tool_guide.md");
const DATA_PLATFORM_PREAMBLE: &str = include_str!("../prompts/data_platform.md");

/// File inside the injected `curated/` tree describing the component
/// library.
const COMPONENT_REGISTRY_FILE: &str = "curated/registry.json";

/// One entry of the curated component registry.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ComponentEntry {
    pub name: String,
    pub path: String,
    pub description: String,
    #[serde(rename = "useWhen", default)]
    pub use_when: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Loads `curated/registry.json` from the workspace, if present. A missing
/// or malformed registry only costs the catalogue prompt layer.
pub(crate) fn load_component_registry(workspace_root: &Path) -> Vec<ComponentEntry> {
    let path = workspace_root.join(COMPONENT_REGISTRY_FILE);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str(&contents) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("ignoring malformed component registry at {path:?}: {e}");
            Vec::new()
        }
    }
}

/// Assemble the full system prompt from the preset base and the append-only
/// layers.
pub(crate) fn compose_system_prompt(config: &Config, components: &[ComponentEntry]) -> String {
    let mut sections: Vec<String> = vec![
        BASE_PROMPT.to_string(),
        DOMAIN_KNOWLEDGE.to_string(),
        PLANNING_WORKFLOW.to_string(),
        TOOL_GUIDE.to_string(),
    ];

    if !components.is_empty() {
        sections.push(render_catalogue(components));
    }

    if config.data_platform_url.is_some() {
        sections.push(DATA_PLATFORM_PREAMBLE.to_string());
    }

    sections.join("\n\n")
}

fn render_catalogue(components: &[ComponentEntry]) -> String {
    let mut out = String::from("# Curated components\n");
    for entry in components {
        out.push_str(&format!(
            "\n- `{}` ({}): {}",
            entry.name, entry.path, entry.description
        ));
        if !entry.use_when.is_empty() {
            out.push_str(&format!(" Use when: {}.", entry.use_when.join("; ")));
        }
        if !entry.features.is_empty() {
            out.push_str(&format!(" Features: {}.", entry.features.join(", ")));
        }
    }
    out.push('\n');
    out
}
