//! Router and shared application state.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::extract::WebSocketUpgrade;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use uuid::Uuid;

use atelier_protocol::HealthResponse;
use atelier_protocol::SessionCreatedResponse;

use crate::connection::handle_socket;
use crate::manager::ConnectionManager;

pub struct AppState {
    pub manager: Arc<ConnectionManager>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/session", post(create_session))
        .route("/session/:session_id/channel", get(open_channel))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Allocates a session identifier. State is created lazily on the first
/// channel bind.
async fn create_session() -> Json<SessionCreatedResponse> {
    Json(SessionCreatedResponse {
        session_id: Uuid::new_v4().to_string(),
    })
}

#[derive(Deserialize)]
struct ChannelQuery {
    #[serde(default)]
    reconnect: bool,
}

async fn open_channel(
    Path(session_id): Path<Uuid>,
    Query(query): Query<ChannelQuery>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, query.reconnect, state))
        .into_response()
}
