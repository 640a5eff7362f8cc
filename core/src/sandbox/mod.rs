// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Sandbox supervision: the per-session workspace directory, background
//! child processes, the preview port, and the dev server.
//!
//! Every background child is spawned in its own process group so teardown
//! can deliver a group-level terminate signal without touching siblings.
//! Children never outlive their session.

mod ports;
pub(crate) mod workspace;

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::process::Child;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::error::SandboxErr;
use crate::flags;
use crate::util::backoff;
use uuid::Uuid;

#[cfg(unix)]
use libc::SIGKILL;
#[cfg(unix)]
use libc::SIGTERM;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// A background child owned by the session.
struct ChildHandle {
    pid: u32,
    pgid: i32,
    command: String,
    tool_call_id: String,
    port: Option<u16>,
    child: Child,
}

pub struct SandboxSupervisor {
    session_id: Uuid,
    root: PathBuf,
    config: Arc<Config>,
    children: Mutex<Vec<ChildHandle>>,
    dev_server_pgid: Mutex<Option<i32>>,
    port: Mutex<Option<u16>>,
}

impl SandboxSupervisor {
    /// Materialise the workspace for `session_id`: a fresh directory under
    /// the configured root, seeded with the project scaffold and the
    /// curated component library. An existing directory for the same id is
    /// replaced, which is what gives `reset` its clean-slate semantics.
    pub async fn create(session_id: Uuid, config: Arc<Config>) -> Result<Self> {
        std::fs::create_dir_all(&config.workspace_root)?;
        let root = config.workspace_root.join(session_id.to_string());
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
        }
        std::fs::create_dir_all(&root)?;

        if let Some(scaffold) = &config.scaffold_dir {
            workspace::copy_tree(scaffold, &root)?;
        }
        if let Some(curated) = &config.curated_dir {
            workspace::copy_tree(curated, &root.join("curated"))?;
        }

        let root = root.canonicalize()?;
        info!("workspace created at {root:?}");

        Ok(Self {
            session_id,
            root,
            config,
            children: Mutex::new(Vec::new()),
            dev_server_pgid: Mutex::new(None),
            port: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn workspace_root(&self) -> &Path {
        &self.root
    }

    /// Resolve a (possibly relative) tool-supplied path and reject it
    /// unless its canonical form stays inside the workspace.
    pub fn resolve_path(&self, raw: &str) -> std::result::Result<PathBuf, SandboxErr> {
        workspace::resolve_under(&self.root, raw)
    }

    pub fn allocated_port(&self) -> Option<u16> {
        *self.port.lock().unwrap()
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    pub fn live_child_pids(&self) -> Vec<u32> {
        self.children.lock().unwrap().iter().map(|c| c.pid).collect()
    }

    /// Spawn a long-running command in its own process group and register
    /// it with the session.
    pub async fn spawn_background(
        &self,
        command: Vec<String>,
        tool_call_id: &str,
        env: &[(&str, String)],
        port: Option<u16>,
    ) -> Result<u32> {
        let Some((program, args)) = command.split_first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "command args are empty",
            )
            .into());
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::other("background child exited before it could be tracked")
        })?;
        let pgid = pid as i32;

        debug!(
            "session {}: background child {pid} ({})",
            self.session_id,
            command.join(" ")
        );
        self.children.lock().unwrap().push(ChildHandle {
            pid,
            pgid,
            command: command.join(" "),
            tool_call_id: tool_call_id.to_string(),
            port,
            child,
        });
        Ok(pid)
    }

    /// Start (or restart) the preview dev server. The session's allocated
    /// port is always used; any port the model asked for was discarded
    /// upstream. A probed port can be taken by the time the server spawns,
    /// so readiness failures retry on a fresh port up to a bounded number
    /// of attempts.
    pub async fn start_dev_server(&self) -> Result<String> {
        self.stop_dev_server().await;
        workspace::write_env_local(&self.root, &self.config.preview_env)?;

        let mut attempt = 0u32;
        loop {
            let port = self.ensure_port()?;
            let pid = self
                .spawn_background(
                    self.config.dev_server_command.clone(),
                    "dev-server",
                    &[("PORT", port.to_string())],
                    Some(port),
                )
                .await?;
            let pgid = pid as i32;

            match self.probe_ready(port).await {
                Ok(()) => {
                    *self.dev_server_pgid.lock().unwrap() = Some(pgid);
                    info!(
                        "session {}: dev server ready on port {port}",
                        self.session_id
                    );
                    return Ok(self.url_for_port(port));
                }
                Err(reason) => {
                    warn!(
                        "session {}: dev server on port {port} not ready: {reason}",
                        self.session_id
                    );
                    self.kill_child_group(pgid).await;
                    // No dev server holds the port now; release it so the
                    // next attempt (or the next start) probes afresh.
                    *self.port.lock().unwrap() = None;
                    attempt += 1;
                    if attempt > self.config.port_spawn_retries {
                        return Err(SandboxErr::DevServerNotReady { port, reason }.into());
                    }
                }
            }
        }
    }

    /// Preview URL, available only while a dev server is up. The port's
    /// lifecycle is coupled to the dev-server child alone: other
    /// background children never hold it, and their exits never release
    /// it. Across a dev-server restart the port is retained and reused.
    pub fn preview_url(&self) -> Option<String> {
        let port = (*self.port.lock().unwrap())?;
        self.dev_server_pgid.lock().unwrap().map(|_| self.url_for_port(port))
    }

    /// Terminate every tracked child: group TERM, bounded grace, group
    /// KILL. Clears the child set and releases the allocated port.
    pub async fn terminate_children(&self) {
        let handles: Vec<ChildHandle> = {
            let mut children = self.children.lock().unwrap();
            children.drain(..).collect()
        };
        *self.dev_server_pgid.lock().unwrap() = None;
        *self.port.lock().unwrap() = None;

        if handles.is_empty() {
            return;
        }

        for handle in &handles {
            debug!(
                "session {}: terminating group {} ({}, tool call {})",
                self.session_id, handle.pgid, handle.command, handle.tool_call_id
            );
            signal_group(handle.pgid, SIGTERM);
        }

        let deadline = Instant::now() + *flags::ATELIER_CHILD_KILL_GRACE_MS;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, handle.child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    signal_group(handle.pgid, SIGKILL);
                    let _ = handle.child.wait().await;
                }
            }
        }
    }

    /// Release all session resources. The workspace directory is left on
    /// disk for post-mortem inspection unless configured otherwise. Never
    /// fails; teardown problems are logged.
    pub async fn teardown(&self) {
        self.terminate_children().await;
        if self.config.remove_workspace_on_teardown
            && let Err(e) = std::fs::remove_dir_all(&self.root)
        {
            warn!("failed to remove workspace {:?}: {e}", self.root);
        }
    }

    fn url_for_port(&self, port: u16) -> String {
        format!("{}:{port}", self.config.public_base_url)
    }

    /// Reuse the session's port if one is allocated, otherwise probe for a
    /// listenable one in the configured range.
    fn ensure_port(&self) -> std::result::Result<u16, SandboxErr> {
        let mut port = self.port.lock().unwrap();
        if let Some(p) = *port {
            return Ok(p);
        }
        let fresh = ports::probe_free_port(self.config.port_floor, self.config.port_ceiling, &[])
            .ok_or(SandboxErr::PortExhausted(
            self.config.port_floor,
            self.config.port_ceiling,
        ))?;
        *port = Some(fresh);
        Ok(fresh)
    }

    /// HTTP readiness probe with exponential retries. Any HTTP response
    /// counts as ready; a connection refused means the server is not up
    /// yet.
    async fn probe_ready(&self, port: u16) -> std::result::Result<(), String> {
        let url = format!("http://127.0.0.1:{port}/");
        let client = reqwest::Client::new();
        let deadline = Instant::now() + self.config.dev_server_ready_timeout();
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            match client
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(e.to_string());
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
    }

    /// Remove one child from the set and kill its process group.
    async fn kill_child_group(&self, pgid: i32) {
        let handle = {
            let mut children = self.children.lock().unwrap();
            children
                .iter()
                .position(|c| c.pgid == pgid)
                .map(|idx| children.remove(idx))
        };
        let Some(mut handle) = handle else {
            return;
        };

        signal_group(pgid, SIGTERM);
        let grace = *flags::ATELIER_CHILD_KILL_GRACE_MS;
        if tokio::time::timeout(grace, handle.child.wait()).await.is_err() {
            signal_group(pgid, SIGKILL);
            let _ = handle.child.wait().await;
        }
    }

    async fn stop_dev_server(&self) {
        let pgid = self.dev_server_pgid.lock().unwrap().take();
        if let Some(pgid) = pgid {
            debug!("session {}: stopping previous dev server", self.session_id);
            // The allocated port is deliberately retained so a restarted
            // server comes back on the same preview URL.
            self.kill_child_group(pgid).await;
        }
    }
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: libc::c_int) {
    // A dead group is fine; anything else is worth a log line.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!("killpg({pgid}, {signal}) failed: {err}");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _signal: i32) {
    // Group signalling is unix-only; kill_on_drop is the fallback.
}
