use axum::{middleware, Router};

use crate::auth::middleware::JwtSecret;
use crate::chat::presence;
use crate::state::AppState;
use crate::sync::routes as sync_routes;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // WebSocket endpoint (token via query param or Bearer header, checked before upgrade)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    // Authenticated routes, the Claims extractor validates the Bearer token
    let sync_routes = Router::new()
        .route("/sync/state", axum::routing::get(sync_routes::get_state))
        .route("/sync/difference", axum::routing::get(sync_routes::get_difference))
        .route(
            "/sync/channel/{chat_id}/difference",
            axum::routing::get(sync_routes::get_channel_difference),
        );
    let presence_routes = Router::new().route(
        "/presence/{user_id}",
        axum::routing::get(presence::get_presence),
    );

    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(ws_routes)
        .merge(sync_routes)
        .merge(presence_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
