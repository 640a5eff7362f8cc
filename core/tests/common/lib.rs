#![allow(clippy::unwrap_used)]

//! Shared helpers for the integration suites: a scripted stand-in for the
//! reasoning-model subprocess and a test configuration. Consumed by the
//! core and server test suites as a dev-dependency.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use serde_json::json;

use atelier_core::TurnHandle;
use atelier_core::config::Config;
use atelier_core::config::SandboxMode;
use atelier_core::error::Result;
use atelier_core::model::ModelEvent;
use atelier_core::model::ModelInput;
use atelier_core::model::ModelProfile;
use atelier_core::model::ModelTransport;
use atelier_core::model::TransportFactory;
use atelier_protocol::Envelope;

/// One step of a scripted model run.
pub enum Step {
    Event(ModelEvent),
    /// Never yields; used to exercise turn timeouts.
    Hang,
}

pub fn text(s: &str) -> Step {
    Step::Event(ModelEvent::Text {
        text: s.to_string(),
    })
}

pub fn tool_use(id: &str, name: &str, input: JsonValue) -> Step {
    Step::Event(ModelEvent::ToolUse {
        id: id.to_string(),
        name: name.to_string(),
        input,
    })
}

pub fn done() -> Step {
    Step::Event(ModelEvent::Done {
        cost_usd: Some(0.02),
        duration_ms: Some(1500),
        num_turns: Some(1),
    })
}

/// Recorded state of one scripted transport.
pub struct ScriptedInner {
    steps: tokio::sync::Mutex<VecDeque<Step>>,
    pub sent: StdMutex<Vec<ModelInput>>,
}

impl ScriptedInner {
    pub fn sent_inputs(&self) -> Vec<ModelInput> {
        self.sent.lock().unwrap().clone()
    }
}

pub struct ScriptedModel {
    inner: Arc<ScriptedInner>,
}

#[async_trait]
impl ModelTransport for ScriptedModel {
    async fn send(&self, input: ModelInput) -> Result<()> {
        self.inner.sent.lock().unwrap().push(input);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<ModelEvent>> {
        let step = self.inner.steps.lock().await.pop_front();
        match step {
            Some(Step::Event(event)) => Ok(Some(event)),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn shutdown(&self) {}
}

/// Hands out scripted transports keyed by profile role. The main agent
/// consumes scripts pushed for `"main"`; sub-agents consume scripts pushed
/// for their registry name.
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: StdMutex<HashMap<String, VecDeque<Vec<Step>>>>,
    pub created: StdMutex<Vec<(String, Arc<ScriptedInner>)>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_script(&self, role: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(role.to_string())
            .or_default()
            .push_back(steps);
    }

    /// The transport most recently created for `role`.
    pub fn transport_for(&self, role: &str) -> Arc<ScriptedInner> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(r, _)| r == role)
            .map(|(_, inner)| Arc::clone(inner))
            .unwrap_or_else(|| panic!("no transport created for role {role}"))
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn create(&self, profile: &ModelProfile) -> Result<Box<dyn ModelTransport>> {
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&profile.role)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_default();
        let inner = Arc::new(ScriptedInner {
            steps: tokio::sync::Mutex::new(VecDeque::from(steps)),
            sent: StdMutex::new(Vec::new()),
        });
        self.created
            .lock()
            .unwrap()
            .push((profile.role.clone(), Arc::clone(&inner)));
        Ok(Box::new(ScriptedModel { inner }))
    }
}

pub fn test_config(workspace_root: PathBuf) -> Config {
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
        dev_server_command: vec![
            "sh".to_string(),
            "-c".to_string(),
            "exec python3 -m http.server \"$PORT\" --bind 127.0.0.1".to_string(),
        ],
        build_failure_limit: 3,
        remove_workspace_on_teardown: false,
        preview_env: HashMap::new(),
        data_platform_url: None,
        dangerous_command_patterns: default_dangerous_patterns(),
        sensitive_path_markers: vec![".env".to_string(), ".ssh/".to_string()],
        turn_timeout_ms: None,
        reconnect_grace_ms: None,
        dev_server_ready_timeout_ms: Some(10_000),
    }
}

fn default_dangerous_patterns() -> Vec<String> {
    [
        r"rm\s+(-[a-zA-Z]+\s+)*-?(rf|fr|r|f)[a-zA-Z]*\s+/(\s|$|\*)",
        r"(^|\s|;|&&|\|\|)sudo\s",
        r"\bmkfs(\.[a-z0-9]+)?\b",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Drain a turn stream to completion.
pub async fn collect_envelopes(turn: &TurnHandle) -> Vec<Envelope> {
    let mut envelopes = Vec::new();
    while let Some(envelope) = turn.next().await {
        let terminal = envelope.is_terminal();
        envelopes.push(envelope);
        if terminal {
            break;
        }
    }
    envelopes
}

/// Convenience asserting helpers used across scenarios.
pub fn tool_uses(envelopes: &[Envelope]) -> Vec<(String, JsonValue)> {
    envelopes
        .iter()
        .filter_map(|e| match e {
            Envelope::ToolUse { tool, input, .. } => Some((tool.clone(), input.clone())),
            _ => None,
        })
        .collect()
}

pub fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok()
}

/// A canned happy-path script: write a page, build it, pass review, start
/// the preview. The build step uses a command that exists everywhere the
/// suite runs; real sessions run the scaffold's npm scripts.
pub fn happy_build_script() -> Vec<Step> {
    vec![
        text("Creating the page now."),
        tool_use(
            "c1",
            "Write",
            json!({
                "file_path": "app/hello/page.tsx",
                "content": "export default function Page() { return <p>Hello</p>; }",
            }),
        ),
        tool_use("c2", "Bash", json!({ "command": "true" })),
        tool_use("c3", "mark-security-review-passed", json!({})),
        tool_use("c4", "start-dev-server", json!({ "port": 3000 })),
        text("All done."),
        done(),
    ]
}
