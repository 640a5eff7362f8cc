//! Helpers shared by unit tests across the crate.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::Config;
use crate::config::SandboxMode;

/// A minimal configuration rooted at the given workspace directory.
pub(crate) fn test_config(workspace_root: PathBuf) -> Config {
    Config {
        audit_dir: workspace_root.join("audit"),
        workspace_root,
        scaffold_dir: None,
        curated_dir: None,
        public_base_url: "http://127.0.0.1".to_string(),
        port_floor: 4100,
        port_ceiling: 4999,
        port_spawn_retries: 3,
        model_command: vec!["true".to_string()],
        model_api_key: "test-key".to_string(),
        sandbox_mode: SandboxMode::Local,
        dev_server_command: vec!["true".to_string()],
        build_failure_limit: 3,
        remove_workspace_on_teardown: false,
        preview_env: HashMap::new(),
        data_platform_url: None,
        dangerous_command_patterns: crate::config::default_dangerous_command_patterns(),
        sensitive_path_markers: crate::config::default_sensitive_path_markers(),
        turn_timeout_ms: None,
        reconnect_grace_ms: None,
        dev_server_ready_timeout_ms: None,
    }
}
