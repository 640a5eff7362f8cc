//! WebSocket connection lifecycle: recv loop, turn streaming under the
//! session locks, and the busy / timeout / broken error surfaces.

use std::sync::Arc;

use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use futures_util::SinkExt;
use futures_util::StreamExt;
use futures_util::stream::SplitSink;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use atelier_protocol::ClientMessage;
use atelier_protocol::Envelope;

use crate::app::AppState;
use crate::manager::ConnectionManager;
use crate::manager::SessionEntry;

/// Serialises outbound envelope writes so ordering across sources is
/// well-defined at the channel boundary.
struct Outbound {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl Outbound {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), axum::Error> {
        let json = serde_json::to_string(envelope)
            .map_err(|e| axum::Error::new(std::io::Error::other(e)))?;
        self.sink.lock().await.send(Message::Text(json)).await
    }

    async fn send_error(&self, message: &str) {
        let _ = self
            .send(&Envelope::Error {
                message: message.to_string(),
            })
            .await;
    }
}

pub(crate) async fn handle_socket(
    socket: WebSocket,
    session_id: Uuid,
    reconnect: bool,
    state: Arc<AppState>,
) {
    let manager = &state.manager;

    // Agent construction completes before any envelope is written; a
    // failure closes the channel with no `connection` envelope at all.
    let entry = match manager.connect(session_id, reconnect).await {
        Ok(entry) => entry,
        Err(e) => {
            warn!("session {session_id}: connect failed: {e}");
            let mut socket = socket;
            let _ = socket.close().await;
            return;
        }
    };

    let (sink, mut stream) = socket.split();
    let outbound = Outbound::new(sink);

    if outbound
        .send(&Envelope::Connection {
            session_id: session_id.to_string(),
        })
        .await
        .is_err()
    {
        manager.disconnect(session_id, true);
        return;
    }

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("session {session_id}: read error (client closed?): {e}");
                break;
            }
        };
        handle_message(&text, &entry, manager, &outbound).await;
    }

    manager.disconnect(session_id, true);
}

async fn handle_message(
    text: &str,
    entry: &Arc<SessionEntry>,
    manager: &Arc<ConnectionManager>,
    outbound: &Outbound,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            outbound.send_error(&format!("invalid message: {e}")).await;
            return;
        }
    };

    match message {
        ClientMessage::Ping => {
            let _ = outbound.send(&Envelope::Pong).await;
        }
        ClientMessage::Chat { message } => {
            handle_chat(message, entry, manager, outbound).await;
        }
        ClientMessage::Reset => {
            handle_reset(entry, manager, outbound).await;
        }
    }
}

/// One user turn: non-blocking lock acquisition, streaming under a
/// wall-clock deadline, lock released on every exit path.
async fn handle_chat(
    message: String,
    entry: &Arc<SessionEntry>,
    manager: &Arc<ConnectionManager>,
    outbound: &Outbound,
) {
    if entry.is_broken() {
        outbound
            .send_error("session is broken and must be discarded")
            .await;
        return;
    }

    // Concurrent turns are rejected, not queued.
    let Ok(_turn_guard) = entry.turn_lock.try_lock() else {
        outbound.send_error("busy: a turn is already in flight").await;
        return;
    };

    let Some(agent) = entry.agent().await else {
        outbound
            .send_error("session is broken and must be discarded")
            .await;
        return;
    };

    let turn = agent.chat(message);
    let deadline = Instant::now() + manager.config().turn_timeout();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, turn.next()).await {
            Ok(Some(envelope)) => {
                let terminal = envelope.is_terminal();
                if outbound.send(&envelope).await.is_err() {
                    info!("session {}: client went away mid-turn", entry.id());
                    turn.abort();
                    agent.reset_turn_flags();
                    return;
                }
                if terminal {
                    return;
                }
            }
            Ok(None) => {
                agent.reset_turn_flags();
                outbound.send_error("turn ended unexpectedly").await;
                return;
            }
            Err(_) => {
                warn!("session {}: turn timeout", entry.id());
                turn.abort();
                agent.reset_turn_flags();
                outbound.send_error("timeout").await;
                return;
            }
        }
    }
}

/// Reset tears down the agent and workspace and rebuilds both. Rejected
/// while a turn holds the session lock; never preempts.
async fn handle_reset(
    entry: &Arc<SessionEntry>,
    manager: &Arc<ConnectionManager>,
    outbound: &Outbound,
) {
    if entry.is_broken() {
        outbound
            .send_error("session is broken and must be discarded")
            .await;
        return;
    }

    let Ok(_turn_guard) = entry.turn_lock.try_lock() else {
        outbound
            .send_error("busy: reset rejected while a turn is in flight")
            .await;
        return;
    };

    match manager.reset(entry).await {
        Ok(()) => {
            // Rebind acknowledgement: the rebuilt session is ready.
            let _ = outbound
                .send(&Envelope::Connection {
                    session_id: entry.id().to_string(),
                })
                .await;
        }
        Err(_) => {
            outbound
                .send_error("session is broken and must be discarded")
                .await;
        }
    }
}
