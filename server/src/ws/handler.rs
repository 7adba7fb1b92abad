use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::auth::{jwt, middleware::bearer_token};
use crate::state::AppState;
use crate::ws::connection::{run_connection, ConnectionHandle};

/// Query parameters for WebSocket connection.
/// The token may instead arrive as `Authorization: Bearer`.
#[derive(Debug, Deserialize)]
pub struct WsConnectQuery {
    pub token: Option<String>,
    pub device_id: Option<String>,
}

/// GET /ws?token=JWT&device_id=...
/// Validates the token before upgrading; a bad or missing token is a plain 401
/// and no connection is created.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = match params.token.as_deref().or_else(|| bearer_token(&headers)) {
        Some(token) => token,
        None => {
            tracing::debug!("WebSocket upgrade without token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let claims = match jwt::validate_access_token(&state.jwt_secret, token) {
        Ok(claims) => claims,
        Err(err) => {
            tracing::warn!(reason = ?err.kind(), "WebSocket auth failed");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let user_id = claims.sub;
    let device_id = params
        .device_id
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
    let limits = state.limits;

    tracing::info!(
        user_id = user_id,
        device_id = %device_id,
        "WebSocket connection authenticated"
    );

    ws.max_message_size(limits.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            let (handle, outbound_rx) =
                ConnectionHandle::new(user_id, &device_id, limits.send_queue_capacity);
            run_connection(socket, state.hub.clone(), handle, outbound_rx, limits).await;
        })
}
