use axum::{
    http::{header, HeaderValue, Method},
    middleware, Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::auth::middleware as auth_middleware;
use crate::chat::sessions;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Chat session endpoints (auth required — Claims extractor rejects
    // anonymous callers)
    let chat_routes = Router::new().route(
        "/api/chats",
        axum::routing::post(sessions::create_chat).get(sessions::list_chats),
    );

    // WebSocket endpoint (auth via query param, not bearer header)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    // Health check
    let health = Router::new().route("/health", axum::routing::get(health_check));

    let cors = cors_layer(&state.allowed_origins);

    Router::new()
        .merge(chat_routes)
        .merge(ws_routes)
        .merge(health)
        // Identity synchronization gate: runs once per request, ahead
        // of every handler
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware::synchronize_identity,
        ))
        .layer(cors)
        .with_state(state)
}

/// CORS policy from the configured allowed origins. Static
/// configuration; origins that fail to parse are skipped with a warning.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring unparseable allowed origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
        ])
        .allow_headers([
            header::ORIGIN,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
        ])
        .allow_credentials(true)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
