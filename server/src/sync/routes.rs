//! REST surface for the difference engine. JWT auth required on every route.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::auth::middleware::Claims;
use crate::db::models::SyncState;
use crate::state::AppState;
use crate::sync::{ChannelDifference, Difference, SyncError};

#[derive(Debug, Deserialize)]
pub struct DifferenceQuery {
    pub pts: Option<i64>,
    pub limit: Option<i64>,
}

impl DifferenceQuery {
    fn from_pts(&self) -> Result<i64, StatusCode> {
        match self.pts {
            Some(pts) if pts >= 0 => Ok(pts),
            _ => Err(StatusCode::BAD_REQUEST),
        }
    }
}

fn sync_error_status(user_id: i64, err: SyncError) -> StatusCode {
    match err {
        SyncError::NotMember(chat_id) => {
            tracing::debug!(user_id = user_id, chat_id = chat_id, "Channel difference for non-member");
            StatusCode::FORBIDDEN
        }
        SyncError::Repo(e) => {
            tracing::error!(user_id = user_id, error = %e, "Sync query failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// GET /sync/state
pub async fn get_state(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<SyncState>, StatusCode> {
    state
        .sync
        .get_state(claims.sub)
        .await
        .map(Json)
        .map_err(|e| sync_error_status(claims.sub, e))
}

/// GET /sync/difference?pts={pts}&limit={n}
/// Advances the caller's stored watermark when the page moves past `pts`.
pub async fn get_difference(
    State(state): State<AppState>,
    claims: Claims,
    Query(query): Query<DifferenceQuery>,
) -> Result<Json<Difference>, StatusCode> {
    let user_id = claims.sub;
    let from_pts = query.from_pts()?;

    let difference = state
        .sync
        .get_difference(user_id, from_pts, query.limit)
        .await
        .map_err(|e| sync_error_status(user_id, e))?;

    state
        .sync
        .commit_state(user_id, from_pts, difference.state)
        .await
        .map_err(|e| sync_error_status(user_id, e))?;

    tracing::debug!(
        user_id = user_id,
        from_pts = from_pts,
        count = difference.new_messages.len(),
        pts = difference.state.pts,
        "Difference served"
    );

    Ok(Json(difference))
}

/// GET /sync/channel/{chat_id}/difference?pts={pts}&limit={n}
pub async fn get_channel_difference(
    State(state): State<AppState>,
    claims: Claims,
    Path(chat_id): Path<i64>,
    Query(query): Query<DifferenceQuery>,
) -> Result<Json<ChannelDifference>, StatusCode> {
    let user_id = claims.sub;
    let from_pts = query.from_pts()?;

    let difference = state
        .sync
        .get_channel_difference(user_id, chat_id, from_pts, query.limit)
        .await
        .map_err(|e| sync_error_status(user_id, e))?;

    state
        .sync
        .commit_channel_state(user_id, chat_id, from_pts, difference.pts)
        .await
        .map_err(|e| sync_error_status(user_id, e))?;

    Ok(Json(difference))
}
