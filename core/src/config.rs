use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AtelierErr;
use crate::error::EnvVarError;
use crate::error::Result;
use crate::flags;

const CONFIG_TOML_FILE: &str = "config.toml";

/// Which sandbox backend hosts session workspaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    #[default]
    Local,
    /// Reserved for a remote sandbox backend; this build refuses it at
    /// startup rather than silently degrading to local.
    Cloud,
}

/// Application configuration loaded from disk and merged with overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory under which per-session workspaces are created.
    pub workspace_root: PathBuf,

    /// Project template copied into every fresh workspace.
    pub scaffold_dir: Option<PathBuf>,

    /// Curated component library injected as `curated/` before the first
    /// user turn.
    pub curated_dir: Option<PathBuf>,

    /// Directory receiving per-session audit logs.
    pub audit_dir: PathBuf,

    /// Public base used to derive preview URLs, without a port.
    pub public_base_url: String,

    /// Inclusive port range probed for preview servers. The floor sits well
    /// above user-facing services on purpose.
    pub port_floor: u16,
    pub port_ceiling: u16,

    /// How many fresh ports to try when the probed one is taken at spawn
    /// time.
    pub port_spawn_retries: u32,

    /// Argv of the reasoning-model subprocess.
    pub model_command: Vec<String>,

    /// API key forwarded to the model subprocess environment.
    pub model_api_key: String,

    pub sandbox_mode: SandboxMode,

    /// Argv used to start the preview dev server inside the workspace.
    /// The allocated port is passed via the `PORT` environment variable.
    pub dev_server_command: Vec<String>,

    /// Consecutive failed build cycles tolerated per turn before the
    /// self-correction hook gives up and fails the turn.
    pub build_failure_limit: u32,

    /// Whether teardown deletes the workspace directory. Off by default so
    /// sessions can be inspected post-mortem.
    pub remove_workspace_on_teardown: bool,

    /// Credentials written to `.env.local` before the dev server starts.
    /// Consumed only by the preview's runtime, never by the core.
    pub preview_env: HashMap<String, String>,

    /// When set, the data-platform exploration preamble is appended to the
    /// system prompt and exploration tools are advertised.
    pub data_platform_url: Option<String>,

    /// Shell commands matching any of these patterns are denied outright.
    pub dangerous_command_patterns: Vec<String>,

    /// Reads/writes/edits whose canonical path contains any of these
    /// substrings are denied.
    pub sensitive_path_markers: Vec<String>,

    /// Test override for the turn timeout; falls back to the env flag.
    pub turn_timeout_ms: Option<u64>,

    /// Test override for the reconnect grace window; falls back to the env
    /// flag.
    pub reconnect_grace_ms: Option<u64>,

    /// Test override for the readiness-probe budget; falls back to the env
    /// flag.
    pub dev_server_ready_timeout_ms: Option<u64>,
}

impl Config {
    pub fn turn_timeout(&self) -> Duration {
        self.turn_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(*flags::ATELIER_TURN_TIMEOUT_MS)
    }

    pub fn reconnect_grace(&self) -> Duration {
        self.reconnect_grace_ms
            .map(Duration::from_millis)
            .unwrap_or(*flags::ATELIER_RECONNECT_GRACE_MS)
    }

    pub fn dev_server_ready_timeout(&self) -> Duration {
        self.dev_server_ready_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(*flags::ATELIER_DEV_SERVER_READY_TIMEOUT_MS)
    }

    /// Load `config.toml` from the atelier home directory (if present),
    /// apply CLI overrides, and validate. Returns a configuration error for
    /// anything the operator must fix before the server can run.
    pub fn load_with_cli_overrides(overrides: ConfigOverrides) -> Result<Config> {
        let home = atelier_home();
        let toml_path = home.join(CONFIG_TOML_FILE);
        let cfg: ConfigToml = if toml_path.exists() {
            let contents = std::fs::read_to_string(&toml_path)?;
            toml::from_str(&contents)
                .map_err(|e| AtelierErr::Config(format!("failed to parse {toml_path:?}: {e}")))?
        } else {
            ConfigToml::default()
        };

        let model_api_key = match *flags::ATELIER_MODEL_API_KEY {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => {
                return Err(AtelierErr::EnvVar(EnvVarError {
                    var: "ATELIER_MODEL_API_KEY".to_string(),
                    instructions: Some(
                        "Set it to the API key of your reasoning-model provider.".to_string(),
                    ),
                }));
            }
        };

        let sandbox_mode = overrides
            .sandbox_mode
            .or(cfg.sandbox_mode)
            .unwrap_or_default();
        if sandbox_mode == SandboxMode::Cloud {
            return Err(AtelierErr::Config(
                "sandbox mode `cloud` is not available in this build; use `local`".to_string(),
            ));
        }

        let port_floor = cfg.port_floor.unwrap_or(4100);
        let port_ceiling = cfg.port_ceiling.unwrap_or(4999);
        if port_floor == 0 || port_floor > port_ceiling {
            return Err(AtelierErr::Config(format!(
                "invalid preview port range {port_floor}-{port_ceiling}"
            )));
        }

        let mut preview_env = cfg.preview_env.unwrap_or_default();
        preview_env.extend(preview_env_from_process());

        Ok(Config {
            workspace_root: overrides
                .workspace_root
                .or(cfg.workspace_root)
                .unwrap_or_else(|| home.join("workspaces")),
            scaffold_dir: overrides.scaffold_dir.or(cfg.scaffold_dir),
            curated_dir: overrides.curated_dir.or(cfg.curated_dir),
            audit_dir: cfg.audit_dir.unwrap_or_else(|| home.join("sessions")),
            public_base_url: cfg
                .public_base_url
                .unwrap_or_else(|| "http://127.0.0.1".to_string()),
            port_floor,
            port_ceiling,
            port_spawn_retries: cfg.port_spawn_retries.unwrap_or(5),
            model_command: overrides
                .model_command
                .or(cfg.model_command)
                .unwrap_or_else(|| vec!["atelier-model".to_string()]),
            model_api_key,
            sandbox_mode,
            dev_server_command: cfg.dev_server_command.unwrap_or_else(|| {
                vec!["npm".to_string(), "run".to_string(), "dev".to_string()]
            }),
            build_failure_limit: cfg.build_failure_limit.unwrap_or(3),
            remove_workspace_on_teardown: cfg.remove_workspace_on_teardown.unwrap_or(false),
            preview_env,
            data_platform_url: cfg.data_platform_url,
            dangerous_command_patterns: cfg
                .dangerous_command_patterns
                .unwrap_or_else(default_dangerous_command_patterns),
            sensitive_path_markers: cfg
                .sensitive_path_markers
                .unwrap_or_else(default_sensitive_path_markers),
            turn_timeout_ms: cfg.turn_timeout_ms,
            reconnect_grace_ms: cfg.reconnect_grace_ms,
            dev_server_ready_timeout_ms: cfg.dev_server_ready_timeout_ms,
        })
    }
}

/// Base config deserialized from `config.toml`. Every field is optional so a
/// missing file and an empty file behave identically.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigToml {
    pub workspace_root: Option<PathBuf>,
    pub scaffold_dir: Option<PathBuf>,
    pub curated_dir: Option<PathBuf>,
    pub audit_dir: Option<PathBuf>,
    pub public_base_url: Option<String>,
    pub port_floor: Option<u16>,
    pub port_ceiling: Option<u16>,
    pub port_spawn_retries: Option<u32>,
    pub model_command: Option<Vec<String>>,
    pub sandbox_mode: Option<SandboxMode>,
    pub dev_server_command: Option<Vec<String>>,
    pub build_failure_limit: Option<u32>,
    pub remove_workspace_on_teardown: Option<bool>,
    pub preview_env: Option<HashMap<String, String>>,
    pub data_platform_url: Option<String>,
    pub dangerous_command_patterns: Option<Vec<String>>,
    pub sensitive_path_markers: Option<Vec<String>>,
    pub turn_timeout_ms: Option<u64>,
    pub reconnect_grace_ms: Option<u64>,
    pub dev_server_ready_timeout_ms: Option<u64>,
}

/// Overrides that can be set from the command line. A `None` means "defer
/// to config.toml, then to the built-in default".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub workspace_root: Option<PathBuf>,
    pub scaffold_dir: Option<PathBuf>,
    pub curated_dir: Option<PathBuf>,
    pub model_command: Option<Vec<String>>,
    pub sandbox_mode: Option<SandboxMode>,
}

/// Returns the atelier home directory: `$ATELIER_HOME` if set, otherwise
/// `~/.atelier`.
pub fn atelier_home() -> PathBuf {
    if let Ok(home) = std::env::var("ATELIER_HOME")
        && !home.is_empty()
    {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".atelier")
}

/// `ATELIER_PREVIEW_ENV_FOO=bar` becomes `FOO=bar` in `.env.local`.
fn preview_env_from_process() -> HashMap<String, String> {
    const PREFIX: &str = "ATELIER_PREVIEW_ENV_";
    std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(PREFIX)
                .map(|stripped| (stripped.to_string(), value))
        })
        .collect()
}

pub(crate) fn default_dangerous_command_patterns() -> Vec<String> {
    [
        // Root-wide recursive deletion.
        r"rm\s+(-[a-zA-Z]+\s+)*-?(rf|fr|r|f)[a-zA-Z]*\s+/(\s|$|\*)",
        // Privilege escalation.
        r"(^|\s|;|&&|\|\|)sudo\s",
        r"(^|\s|;|&&|\|\|)su\s+root",
        // Device writes and filesystem creation.
        r"\bmkfs(\.[a-z0-9]+)?\b",
        r"\bdd\b[^|;]*\bof=/dev/",
        r">\s*/dev/sd[a-z]",
        // Fork bomb.
        r":\(\)\s*\{\s*:\|:\s*&\s*\}\s*;",
        // Host power control.
        r"(^|\s|;|&&|\|\|)(shutdown|reboot|halt|poweroff)\b",
        // Blanket permission changes at the root.
        r"chmod\s+(-[a-zA-Z]+\s+)*777\s+/(\s|$)",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

pub(crate) fn default_sensitive_path_markers() -> Vec<String> {
    [
        ".env",
        ".ssh/",
        "id_rsa",
        "id_ed25519",
        "credentials",
        "secrets",
        ".aws/",
        ".netrc",
        ".pgpass",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use regex_lite::Regex;

    #[test]
    fn default_dangerous_patterns_compile_and_match() {
        let patterns: Vec<Regex> = default_dangerous_command_patterns()
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect();

        let hits = [
            "rm -rf /",
            "rm -r -f / ",
            "sudo rm -rf /var",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            ":(){ :|: & };:",
            "echo done && reboot",
        ];
        for cmd in hits {
            assert!(
                patterns.iter().any(|p| p.is_match(cmd)),
                "expected denial for {cmd:?}"
            );
        }

        let misses = [
            "rm -rf node_modules",
            "npm run build",
            "echo sudoku",
            "git status",
        ];
        for cmd in misses {
            assert!(
                !patterns.iter().any(|p| p.is_match(cmd)),
                "unexpected denial for {cmd:?}"
            );
        }
    }
}
