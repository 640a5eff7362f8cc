// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! The session table and per-session lifecycle: bind, grace-window
//! disconnect, reconnect, reset, teardown.
//!
//! The table lock is a plain mutex held only for map mutations; everything
//! long-running happens on cloned-out entries. Turn serialisation uses the
//! entry's own lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use atelier_core::AgentSession;
use atelier_core::config::Config;
use atelier_core::error::AtelierErr;
use atelier_core::error::Result;
use atelier_core::model::TransportFactory;

/// One session's server-side record.
pub struct SessionEntry {
    id: Uuid,
    agent: Mutex<Option<Arc<AgentSession>>>,
    /// Serialises user turns; a turn holds this for its whole stream.
    pub turn_lock: Mutex<()>,
    cleanup: StdMutex<Option<AbortHandle>>,
    broken: AtomicBool,
}

impl SessionEntry {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            agent: Mutex::new(None),
            turn_lock: Mutex::new(()),
            cleanup: StdMutex::new(None),
            broken: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn agent(&self) -> Option<Arc<AgentSession>> {
        self.agent.lock().await.clone()
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Cancel a scheduled teardown, if any. The handle lives on the entry
    /// so the cancel cannot race a fresh schedule.
    fn cancel_cleanup(&self) {
        if let Some(handle) = self.cleanup.lock().unwrap().take() {
            debug!("session {}: scheduled cleanup cancelled", self.id);
            handle.abort();
        }
    }

    fn set_cleanup(&self, handle: AbortHandle) {
        if let Some(previous) = self.cleanup.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }
}

pub struct ConnectionManager {
    sessions: StdMutex<HashMap<Uuid, Arc<SessionEntry>>>,
    config: Arc<Config>,
    factory: Arc<dyn TransportFactory>,
}

impl ConnectionManager {
    pub fn new(config: Arc<Config>, factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        Arc::new(Self {
            sessions: StdMutex::new(HashMap::new()),
            config,
            factory,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Bind a channel to a session. With `reconnect`, an existing live
    /// session is reused and its scheduled cleanup cancelled; otherwise a
    /// fresh Session + Agent Session are constructed, fully initialised
    /// before the caller may emit any envelope.
    pub async fn connect(
        self: &Arc<Self>,
        session_id: Uuid,
        reconnect: bool,
    ) -> Result<Arc<SessionEntry>> {
        let existing = self.sessions.lock().unwrap().get(&session_id).cloned();
        if let Some(entry) = existing {
            entry.cancel_cleanup();
            if entry.is_broken() {
                return Err(AtelierErr::Broken);
            }
            if reconnect {
                if entry.agent().await.is_some() {
                    info!("session {session_id}: channel rebound to live agent");
                    return Ok(entry);
                }
            } else {
                // A fresh bind on a known id discards the old session.
                self.teardown(session_id).await;
            }
        }

        let agent = AgentSession::initialize(
            session_id,
            Arc::clone(&self.config),
            Arc::clone(&self.factory),
        )
        .await?;

        let entry = Arc::new(SessionEntry::new(session_id));
        *entry.agent.lock().await = Some(agent);
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id, Arc::clone(&entry));
        info!("session {session_id}: created");
        Ok(entry)
    }

    /// Channel closed. Graceful disconnects schedule teardown after the
    /// grace window so a page reload can reclaim the live agent.
    pub fn disconnect(self: &Arc<Self>, session_id: Uuid, graceful: bool) {
        let entry = self.sessions.lock().unwrap().get(&session_id).cloned();
        let Some(entry) = entry else {
            return;
        };

        if !graceful {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.teardown(session_id).await;
            });
            return;
        }

        let grace = self.config.reconnect_grace();
        debug!("session {session_id}: teardown scheduled in {grace:?}");
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            manager.teardown(session_id).await;
        })
        .abort_handle();
        entry.set_cleanup(handle);
    }

    /// Remove the session and clean up its agent exactly once. Waits for
    /// any in-flight turn rather than preempting it.
    pub async fn teardown(&self, session_id: Uuid) {
        let entry = self.sessions.lock().unwrap().remove(&session_id);
        let Some(entry) = entry else {
            return;
        };
        entry.cancel_cleanup();

        let _turn = entry.turn_lock.lock().await;
        let agent = entry.agent.lock().await.take();
        if let Some(agent) = agent {
            agent.cleanup().await;
        }
        info!("session {session_id}: torn down");
    }

    /// Rebuild the agent and workspace in place. The caller holds the turn
    /// lock. A failed rebuild latches the session broken; every subsequent
    /// operation errors until the session is discarded.
    pub async fn reset(&self, entry: &Arc<SessionEntry>) -> Result<()> {
        let old = entry.agent.lock().await.take();
        if let Some(agent) = old {
            agent.cleanup().await;
        }

        match AgentSession::initialize(
            entry.id,
            Arc::clone(&self.config),
            Arc::clone(&self.factory),
        )
        .await
        {
            Ok(agent) => {
                *entry.agent.lock().await = Some(agent);
                info!("session {}: reset complete", entry.id);
                Ok(())
            }
            Err(e) => {
                warn!("session {}: reset failed, marking broken: {e}", entry.id);
                entry.broken.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Server shutdown: every session goes away, child process groups
    /// included.
    pub async fn teardown_all(&self) {
        let ids: Vec<Uuid> = self.sessions.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.teardown(id).await;
        }
    }
}
