//! File-family tools. Every path is resolved through the sandbox
//! supervisor before it touches the filesystem; a denied resolution comes
//! back as an error result and nothing is read or written.

use std::path::Path;
use std::path::PathBuf;

use glob::Pattern;
use ignore::WalkBuilder;
use regex_lite::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::ToolContext;
use super::ToolOutput;
use super::parse_input;

/// Caps keep tool results model-sized.
const MAX_READ_BYTES: usize = 100 * 1024;
const MAX_GLOB_RESULTS: usize = 500;
const MAX_GREP_MATCHES: usize = 200;

#[derive(Deserialize)]
struct ReadParams {
    file_path: String,
    offset: Option<usize>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct WriteParams {
    file_path: String,
    content: String,
}

#[derive(Deserialize)]
struct EditParams {
    file_path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

#[derive(Deserialize)]
struct GlobParams {
    pattern: String,
    path: Option<String>,
}

#[derive(Deserialize)]
struct GrepParams {
    pattern: String,
    path: Option<String>,
    glob: Option<String>,
}

pub(super) fn read(input: &JsonValue, ctx: &ToolContext) -> ToolOutput {
    let params: ReadParams = match parse_input(input) {
        Ok(p) => p,
        Err(out) => return out,
    };
    let path = match ctx.supervisor.resolve_path(&params.file_path) {
        Ok(p) => p,
        Err(e) => return ToolOutput::error(e.to_string()),
    };

    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => return ToolOutput::error(format!("failed to read {}: {e}", params.file_path)),
    };

    let start = params.offset.unwrap_or(1).saturating_sub(1);
    let selected: String = match params.limit {
        Some(limit) => contents
            .lines()
            .skip(start)
            .take(limit)
            .collect::<Vec<_>>()
            .join("\n"),
        None if start > 0 => contents.lines().skip(start).collect::<Vec<_>>().join("\n"),
        None => contents,
    };

    if selected.len() > MAX_READ_BYTES {
        let mut truncated: String = selected.chars().take(MAX_READ_BYTES).collect();
        truncated.push_str("\n[truncated]");
        ToolOutput::text(truncated)
    } else {
        ToolOutput::text(selected)
    }
}

pub(super) fn write(input: &JsonValue, ctx: &ToolContext) -> ToolOutput {
    let params: WriteParams = match parse_input(input) {
        Ok(p) => p,
        Err(out) => return out,
    };
    let path = match ctx.supervisor.resolve_path(&params.file_path) {
        Ok(p) => p,
        Err(e) => return ToolOutput::error(e.to_string()),
    };

    if let Some(parent) = path.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        return ToolOutput::error(format!(
            "failed to create parent directories for {}: {e}",
            params.file_path
        ));
    }
    match std::fs::write(&path, &params.content) {
        Ok(()) => ToolOutput::text(format!(
            "wrote {} bytes to {}",
            params.content.len(),
            params.file_path
        )),
        Err(e) => ToolOutput::error(format!("failed to write {}: {e}", params.file_path)),
    }
}

pub(super) fn edit(input: &JsonValue, ctx: &ToolContext) -> ToolOutput {
    let params: EditParams = match parse_input(input) {
        Ok(p) => p,
        Err(out) => return out,
    };
    let path = match ctx.supervisor.resolve_path(&params.file_path) {
        Ok(p) => p,
        Err(e) => return ToolOutput::error(e.to_string()),
    };

    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => return ToolOutput::error(format!("failed to read {}: {e}", params.file_path)),
    };

    let occurrences = contents.matches(&params.old_string).count();
    if occurrences == 0 {
        return ToolOutput::error(format!("old_string not found in {}", params.file_path));
    }
    if occurrences > 1 && !params.replace_all {
        return ToolOutput::error(format!(
            "old_string matches {occurrences} times in {}; pass replace_all or make it unique",
            params.file_path
        ));
    }

    let updated = if params.replace_all {
        contents.replace(&params.old_string, &params.new_string)
    } else {
        contents.replacen(&params.old_string, &params.new_string, 1)
    };
    match std::fs::write(&path, updated) {
        Ok(()) => ToolOutput::text(format!(
            "edited {} ({occurrences} replacement{})",
            params.file_path,
            if occurrences == 1 { "" } else { "s" }
        )),
        Err(e) => ToolOutput::error(format!("failed to write {}: {e}", params.file_path)),
    }
}

pub(super) fn glob(input: &JsonValue, ctx: &ToolContext) -> ToolOutput {
    let params: GlobParams = match parse_input(input) {
        Ok(p) => p,
        Err(out) => return out,
    };
    let search_root = match ctx
        .supervisor
        .resolve_path(params.path.as_deref().unwrap_or("."))
    {
        Ok(p) => p,
        Err(e) => return ToolOutput::error(e.to_string()),
    };
    let pattern = match Pattern::new(&params.pattern) {
        Ok(p) => p,
        Err(e) => return ToolOutput::error(format!("invalid glob pattern: {e}")),
    };

    let mut matches: Vec<String> = walk_files(&search_root)
        .into_iter()
        .filter_map(|path| {
            let rel = rel_to(&search_root, &path)?;
            pattern.matches_path(Path::new(&rel)).then_some(rel)
        })
        .collect();
    matches.sort();

    let truncated = matches.len() > MAX_GLOB_RESULTS;
    matches.truncate(MAX_GLOB_RESULTS);
    let mut output = matches.join("\n");
    if truncated {
        output.push_str("\n[truncated]");
    }
    if output.is_empty() {
        output = "no files matched".to_string();
    }
    ToolOutput::text(output)
}

pub(super) fn grep(input: &JsonValue, ctx: &ToolContext) -> ToolOutput {
    let params: GrepParams = match parse_input(input) {
        Ok(p) => p,
        Err(out) => return out,
    };
    let search_root = match ctx
        .supervisor
        .resolve_path(params.path.as_deref().unwrap_or("."))
    {
        Ok(p) => p,
        Err(e) => return ToolOutput::error(e.to_string()),
    };
    let regex = match Regex::new(&params.pattern) {
        Ok(r) => r,
        Err(e) => return ToolOutput::error(format!("invalid regex: {e}")),
    };
    let file_filter = match params.glob.as_deref().map(Pattern::new) {
        Some(Ok(p)) => Some(p),
        Some(Err(e)) => return ToolOutput::error(format!("invalid glob pattern: {e}")),
        None => None,
    };

    let mut lines: Vec<String> = Vec::new();
    'outer: for path in walk_files(&search_root) {
        let Some(rel) = rel_to(&search_root, &path) else {
            continue;
        };
        if let Some(filter) = &file_filter
            && !filter.matches_path(Path::new(&rel))
        {
            continue;
        }
        // Binary and unreadable files are silently skipped.
        let Ok(contents) = std::fs::read_to_string(&path) else {
            continue;
        };
        for (idx, line) in contents.lines().enumerate() {
            if regex.is_match(line) {
                lines.push(format!("{rel}:{}:{line}", idx + 1));
                if lines.len() >= MAX_GREP_MATCHES {
                    lines.push("[truncated]".to_string());
                    break 'outer;
                }
            }
        }
    }

    if lines.is_empty() {
        ToolOutput::text("no matches")
    } else {
        ToolOutput::text(lines.join("\n"))
    }
}

/// All regular files under `root`, honoring ignore files the way the
/// ripgrep walker does.
fn walk_files(root: &Path) -> Vec<PathBuf> {
    WalkBuilder::new(root)
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.into_path())
        .collect()
}

fn rel_to(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}
