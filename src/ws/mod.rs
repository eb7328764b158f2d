//! Listener (spec §4.9): binds `/ws`, authorizes the upgrade, and hands
//! accepted sockets to [`connection::handle_socket`].
//!
//! Grounded on the teacher's `ws_upgrade`/`handle_ws` split — a thin
//! extractor-based handler that validates the caller before upgrading,
//! then spawns the connection's own event loop — generalized to the full
//! four-path `AuthGate` (spec §4.7) instead of a single query-token check.

pub mod connection;

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::is_authorized;
use crate::state::{AppState, UserKey};

use connection::{handle_socket, ResumeRequest};

/// Query parameters accepted on the `/ws` upgrade (spec §6).
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "userId", default = "default_user_id")]
    pub user_id: String,
    #[serde(rename = "sessionId", default = "default_session_id")]
    pub session_id: String,
    pub connection_id: Option<Uuid>,
    pub sequence_number: Option<u64>,
    pub token: Option<String>,
}

fn default_user_id() -> String {
    "default".to_string()
}
fn default_session_id() -> String {
    "default".to_string()
}

/// `GET /ws` — WebSocket upgrade handler.
///
/// Rejects with `401 Unauthorized` before the upgrade completes if
/// [`is_authorized`] fails (spec §4.7); anything else on the path is
/// discarded by the router itself (no other routes are registered).
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !is_authorized(&state.config, Some(peer.ip()), &headers, query.token.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let user_key = UserKey::new(query.user_id.clone(), query.session_id);
    let account_id = query.user_id;
    let resume = query
        .connection_id
        .zip(query.sequence_number)
        .map(|(connection_id, sequence_number)| ResumeRequest {
            connection_id,
            sequence_number,
        });

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_key, account_id, resume))
}
