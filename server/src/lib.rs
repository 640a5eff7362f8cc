//! WebSocket + HTTP control surface for atelier (axum + ws).
//!
//! One channel per session at `GET /session/:id/channel`; `POST /session`
//! allocates identifiers; `GET /health` answers liveness probes.
//!
//! **Public API**: [`run_serve`], [`run_serve_on_listener`], [`app::router`],
//! [`app::AppState`].

pub mod app;
mod connection;
pub mod manager;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use atelier_core::config::Config;
use atelier_core::model::ProcessTransportFactory;
use atelier_core::model::TransportFactory;
use atelier_core::util::notify_on_sigint;

use app::AppState;
use app::router;
use manager::ConnectionManager;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Runs the server on an existing listener. Used by tests (bind to
/// 127.0.0.1:0 then pass the listener in, with a scripted transport
/// factory).
pub async fn run_serve_on_listener(
    listener: TcpListener,
    config: Arc<Config>,
    factory: Arc<dyn TransportFactory>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!("atelier listening on http://{addr}");

    let manager = ConnectionManager::new(Arc::clone(&config), factory);
    let state = Arc::new(AppState {
        manager: Arc::clone(&manager),
    });
    let app = router(state);

    let sigint = notify_on_sigint();
    let shutdown = {
        let sigint = Arc::clone(&sigint);
        async move {
            sigint.notified().await;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    // Sessions own child process groups; none may outlive the server.
    manager.teardown_all().await;
    Ok(())
}

/// Runs the server with the subprocess-backed model transport. Listens on
/// `addr` (default 127.0.0.1:8080).
pub async fn run_serve(addr: Option<&str>, config: Config) -> std::io::Result<()> {
    let factory =
        ProcessTransportFactory::new(config.model_command.clone(), config.model_api_key.clone());
    let listener = TcpListener::bind(addr.unwrap_or(DEFAULT_LISTEN_ADDR)).await?;
    run_serve_on_listener(listener, Arc::new(config), factory).await
}
