#![allow(clippy::unwrap_used)]

//! Channel-level tests over a real WebSocket: envelope ordering, turn
//! serialisation, reconnect grace, reset, timeout and init failure.

use atelier_test_support as common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use futures_util::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use atelier_core::config::Config;
use atelier_core::error::AtelierErr;
use atelier_core::error::Result as CoreResult;
use atelier_core::model::ModelProfile;
use atelier_core::model::ModelTransport;
use atelier_core::model::TransportFactory;
use atelier_protocol::ClientMessage;
use atelier_protocol::Envelope;
use atelier_server::run_serve_on_listener;

use common::ScriptedFactory;
use common::Step;
use common::done;
use common::text;
use common::tool_use;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(config: Config, factory: Arc<dyn TransportFactory>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_serve_on_listener(listener, Arc::new(config), factory));
    // Let the acceptor come up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

async fn ws_connect(addr: SocketAddr, session_id: Uuid, reconnect: bool) -> WsClient {
    let query = if reconnect { "?reconnect=true" } else { "" };
    let url = format!("ws://{addr}/session/{session_id}/channel{query}");
    let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    socket
}

async fn send(socket: &mut WsClient, message: &ClientMessage) {
    let json = serde_json::to_string(message).unwrap();
    socket.send(Message::Text(json)).await.unwrap();
}

async fn recv_envelope(socket: &mut WsClient) -> Option<Envelope> {
    loop {
        match socket.next().await? {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Send a chat and drain envelopes until the terminal one.
async fn run_turn(socket: &mut WsClient, message: &str) -> Vec<Envelope> {
    send(
        socket,
        &ClientMessage::Chat {
            message: message.to_string(),
        },
    )
    .await;
    let mut envelopes = Vec::new();
    while let Some(envelope) = recv_envelope(socket).await {
        let terminal = envelope.is_terminal();
        envelopes.push(envelope);
        if terminal {
            break;
        }
    }
    envelopes
}

fn server_config(dir: &tempfile::TempDir) -> Config {
    let mut config = common::test_config(dir.path().to_path_buf());
    config.reconnect_grace_ms = Some(5_000);
    config.turn_timeout_ms = Some(30_000);
    config
}

#[tokio::test]
async fn connection_envelope_precedes_all_turn_envelopes() {
    let dir = tempfile::tempdir().unwrap();
    let factory = ScriptedFactory::new();
    factory.push_script("main", vec![text("hi there"), done()]);
    let addr = start_server(server_config(&dir), factory).await;

    let session_id = Uuid::new_v4();
    let mut socket = ws_connect(addr, session_id, false).await;

    // First envelope on the channel is the connection acknowledgement.
    match recv_envelope(&mut socket).await.unwrap() {
        Envelope::Connection { session_id: id } => assert_eq!(id, session_id.to_string()),
        other => panic!("expected connection envelope first, got {other:?}"),
    }

    let envelopes = run_turn(&mut socket, "hello").await;
    assert!(matches!(envelopes.first(), Some(Envelope::Text { .. })));
    assert!(matches!(envelopes.last(), Some(Envelope::Done { .. })));
}

#[tokio::test]
async fn ping_returns_pong() {
    let dir = tempfile::tempdir().unwrap();
    let factory = ScriptedFactory::new();
    factory.push_script("main", vec![done()]);
    let addr = start_server(server_config(&dir), factory).await;

    let mut socket = ws_connect(addr, Uuid::new_v4(), false).await;
    let _connection = recv_envelope(&mut socket).await.unwrap();

    send(&mut socket, &ClientMessage::Ping).await;
    assert_eq!(recv_envelope(&mut socket).await.unwrap(), Envelope::Pong);
}

#[tokio::test]
async fn concurrent_chat_on_second_channel_is_rejected_busy() {
    let dir = tempfile::tempdir().unwrap();
    let factory = ScriptedFactory::new();
    // The first turn never completes on its own.
    factory.push_script("main", vec![text("working…"), Step::Hang]);
    let addr = start_server(server_config(&dir), factory).await;

    let session_id = Uuid::new_v4();
    let mut first = ws_connect(addr, session_id, false).await;
    let _connection = recv_envelope(&mut first).await.unwrap();
    send(
        &mut first,
        &ClientMessage::Chat {
            message: "long task".to_string(),
        },
    )
    .await;
    // The turn is live once its first envelope arrives.
    assert!(matches!(
        recv_envelope(&mut first).await.unwrap(),
        Envelope::Text { .. }
    ));

    // A second channel bound to the same session gets a busy error, and
    // the first turn keeps the lock.
    let mut second = ws_connect(addr, session_id, true).await;
    let _connection = recv_envelope(&mut second).await.unwrap();
    send(
        &mut second,
        &ClientMessage::Chat {
            message: "me too".to_string(),
        },
    )
    .await;
    match recv_envelope(&mut second).await.unwrap() {
        Envelope::Error { message } => assert!(message.contains("busy")),
        other => panic!("expected busy error, got {other:?}"),
    }
}

/// S6: disconnect then reconnect inside the grace window reuses the live
/// agent (same model memory, same workspace).
#[tokio::test]
async fn reconnect_within_grace_reuses_agent_and_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let factory = ScriptedFactory::new();
    // One continuous script across both turns: the reconnect must land on
    // the same transport for the remaining steps to be consumed.
    factory.push_script(
        "main",
        vec![
            tool_use(
                "c1",
                "Write",
                json!({ "file_path": "notes.md", "content": "remember me" }),
            ),
            done(),
            tool_use("c2", "Read", json!({ "file_path": "notes.md" })),
            done(),
        ],
    );
    let addr = start_server(server_config(&dir), factory.clone()).await;

    let session_id = Uuid::new_v4();
    let mut socket = ws_connect(addr, session_id, false).await;
    let _connection = recv_envelope(&mut socket).await.unwrap();
    let first = run_turn(&mut socket, "create a file").await;
    assert!(matches!(first.last(), Some(Envelope::Done { .. })));
    socket.close(None).await.unwrap();

    // Reconnect well inside the 5s grace window.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut socket = ws_connect(addr, session_id, true).await;
    let _connection = recv_envelope(&mut socket).await.unwrap();
    let second = run_turn(&mut socket, "read the file you just created").await;

    let read_result = second
        .iter()
        .find_map(|e| match e {
            Envelope::ToolResult {
                tool_use_id,
                content,
                is_error,
            } if tool_use_id == "c2" => Some((content.clone(), *is_error)),
            _ => None,
        })
        .expect("read result present");
    assert!(!read_result.1);
    assert_eq!(read_result.0.as_str().unwrap(), "remember me");

    // Exactly one agent (and transport) served both turns.
    let mains = factory
        .created
        .lock()
        .unwrap()
        .iter()
        .filter(|(role, _)| role == "main")
        .count();
    assert_eq!(mains, 1);
}

#[tokio::test]
async fn missed_grace_window_tears_the_session_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = server_config(&dir);
    config.reconnect_grace_ms = Some(200);
    let workspace_root = config.workspace_root.clone();
    let factory = ScriptedFactory::new();
    factory.push_script(
        "main",
        vec![
            tool_use("c1", "Bash", json!({ "command": "sleep 300", "background": true })),
            done(),
        ],
    );
    // The replacement session created after the grace expires.
    factory.push_script("main", vec![done()]);
    let addr = start_server(config, factory.clone()).await;

    let session_id = Uuid::new_v4();
    let mut socket = ws_connect(addr, session_id, false).await;
    let _connection = recv_envelope(&mut socket).await.unwrap();
    let _turn = run_turn(&mut socket, "start something").await;
    socket.close(None).await.unwrap();

    // Wait past the grace window: the agent is cleaned up, children die,
    // the workspace directory is retained.
    tokio::time::sleep(Duration::from_millis(800)).await;
    let workspace = workspace_root.join(session_id.to_string());
    assert!(workspace.exists());

    // Reconnecting now builds a brand-new agent.
    let mut socket = ws_connect(addr, session_id, true).await;
    let _connection = recv_envelope(&mut socket).await.unwrap();
    let mains = factory
        .created
        .lock()
        .unwrap()
        .iter()
        .filter(|(role, _)| role == "main")
        .count();
    assert_eq!(mains, 2);
}

#[tokio::test]
async fn turn_timeout_emits_error_and_frees_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = server_config(&dir);
    config.turn_timeout_ms = Some(300);
    let factory = ScriptedFactory::new();
    factory.push_script("main", vec![text("stalling"), Step::Hang]);
    let addr = start_server(config, factory).await;

    let mut socket = ws_connect(addr, Uuid::new_v4(), false).await;
    let _connection = recv_envelope(&mut socket).await.unwrap();

    send(
        &mut socket,
        &ClientMessage::Chat {
            message: "never finishes".to_string(),
        },
    )
    .await;
    assert!(matches!(
        recv_envelope(&mut socket).await.unwrap(),
        Envelope::Text { .. }
    ));
    match recv_envelope(&mut socket).await.unwrap() {
        Envelope::Error { message } => assert_eq!(message, "timeout"),
        other => panic!("expected timeout error, got {other:?}"),
    }

    // The lock is free again: a ping round-trip proves the channel is
    // healthy and a fresh reset is accepted rather than rejected busy.
    send(&mut socket, &ClientMessage::Ping).await;
    assert_eq!(recv_envelope(&mut socket).await.unwrap(), Envelope::Pong);
}

#[tokio::test]
async fn reset_rebuilds_the_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let config = server_config(&dir);
    let workspace_root = config.workspace_root.clone();
    let factory = ScriptedFactory::new();
    factory.push_script(
        "main",
        vec![
            tool_use(
                "c1",
                "Write",
                json!({ "file_path": "scratch.txt", "content": "old state" }),
            ),
            done(),
        ],
    );
    // The agent built by reset.
    factory.push_script("main", vec![done()]);
    let addr = start_server(config, factory.clone()).await;

    let session_id = Uuid::new_v4();
    let mut socket = ws_connect(addr, session_id, false).await;
    let _connection = recv_envelope(&mut socket).await.unwrap();
    let _turn = run_turn(&mut socket, "write something").await;

    let scratch = workspace_root
        .join(session_id.to_string())
        .join("scratch.txt");
    assert!(scratch.exists());

    send(&mut socket, &ClientMessage::Reset).await;
    match recv_envelope(&mut socket).await.unwrap() {
        Envelope::Connection { session_id: id } => assert_eq!(id, session_id.to_string()),
        other => panic!("expected rebind acknowledgement, got {other:?}"),
    }

    // Fresh workspace, fresh agent.
    assert!(!scratch.exists());
    let mains = factory
        .created
        .lock()
        .unwrap()
        .iter()
        .filter(|(role, _)| role == "main")
        .count();
    assert_eq!(mains, 2);
}

/// A factory that cannot build a transport: the channel must close
/// without ever emitting a `connection` envelope.
struct FailingFactory;

#[async_trait]
impl TransportFactory for FailingFactory {
    async fn create(&self, _profile: &ModelProfile) -> CoreResult<Box<dyn ModelTransport>> {
        Err(AtelierErr::Init("no model available".to_string()))
    }
}

#[tokio::test]
async fn init_failure_closes_channel_without_connection_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(server_config(&dir), Arc::new(FailingFactory)).await;

    let mut socket = ws_connect(addr, Uuid::new_v4(), false).await;
    assert!(recv_envelope(&mut socket).await.is_none());
}

#[tokio::test]
async fn health_and_session_endpoints_answer() {
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;

    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(server_config(&dir), ScriptedFactory::new()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            format!("GET /health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""status":"ok""#));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            format!(
                "POST /session HTTP/1.1\r\nHost: {addr}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("session_id"));
}
