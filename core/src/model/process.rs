//! JSON-lines-over-stdio transport to the reasoning-model subprocess.
//!
//! Each [`ModelInput`] is written as one JSON line to the child's stdin;
//! each line of its stdout parses into a [`ModelEvent`]. Unparseable lines
//! are logged and skipped so a chatty subprocess cannot wedge a session.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::error::AtelierErr;
use crate::error::Result;
use crate::model::ModelEvent;
use crate::model::ModelInput;
use crate::model::ModelProfile;
use crate::model::ModelTier;
use crate::model::ModelTransport;
use crate::model::TransportFactory;

const MODEL_API_KEY_ENV_VAR: &str = "ATELIER_MODEL_API_KEY";

pub struct ProcessTransport {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    rx_event: async_channel::Receiver<ModelEvent>,
}

impl ProcessTransport {
    /// Spawn the subprocess and start the stdout reader task.
    pub async fn spawn(command: &[String], api_key: &str, profile: &ModelProfile) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            return Err(AtelierErr::Config("model command is empty".to_string()));
        };

        let tier = match profile.tier {
            ModelTier::Fast => "fast",
            ModelTier::Deep => "deep",
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--role")
            .arg(&profile.role)
            .arg("--tier")
            .arg(tier)
            .env(MODEL_API_KEY_ENV_VAR, api_key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            AtelierErr::Stream("model subprocess stdin was not captured".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AtelierErr::Stream("model subprocess stdout was not captured".to_string())
        })?;

        let (tx_event, rx_event) = async_channel::bounded(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<ModelEvent>(line) {
                            Ok(event) => {
                                if tx_event.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("skipping unparseable model output line: {e}");
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("model subprocess closed stdout");
                        break;
                    }
                    Err(e) => {
                        warn!("error reading model subprocess stdout: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            rx_event,
        })
    }
}

#[async_trait]
impl ModelTransport for ProcessTransport {
    async fn send(&self, input: ModelInput) -> Result<()> {
        let mut line = serde_json::to_string(&input)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| AtelierErr::ModelProcessDied)?;
        stdin
            .flush()
            .await
            .map_err(|_| AtelierErr::ModelProcessDied)?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<ModelEvent>> {
        match self.rx_event.recv().await {
            Ok(event) => Ok(Some(event)),
            Err(_) => Ok(None),
        }
    }

    async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            debug!("model subprocess already gone: {e}");
        }
    }
}

/// Spawns one subprocess per reasoning context from the configured argv.
pub struct ProcessTransportFactory {
    command: Vec<String>,
    api_key: String,
}

impl ProcessTransportFactory {
    pub fn new(command: Vec<String>, api_key: String) -> Arc<Self> {
        Arc::new(Self { command, api_key })
    }
}

#[async_trait]
impl TransportFactory for ProcessTransportFactory {
    async fn create(&self, profile: &ModelProfile) -> Result<Box<dyn ModelTransport>> {
        let transport = ProcessTransport::spawn(&self.command, &self.api_key, profile).await?;
        Ok(Box::new(transport))
    }
}
