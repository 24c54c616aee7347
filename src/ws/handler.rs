use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::auth::jwt;
use crate::state::AppState;
use crate::users::synchronizer::{self, SyncError};
use crate::ws::actor;

/// Query parameters for WebSocket connection.
/// Browsers cannot set headers on WebSocket requests, so auth is via
/// query param ?token=JWT.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
}

/// WebSocket close codes:
/// 4001 = token expired
/// 4002 = token invalid
const CLOSE_TOKEN_EXPIRED: u16 = 4001;
const CLOSE_TOKEN_INVALID: u16 = 4002;

/// GET /ws?token=JWT
/// WebSocket upgrade endpoint. Authenticates via query parameter.
/// On auth failure, upgrades then immediately closes with appropriate close code.
/// On success, synchronizes the caller's identity and spawns an actor
/// for the connection — a connection is never registered for a user
/// that has not passed synchronization.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // Validate JWT from query parameter
    let claims = jwt::validate_access_token(&state.jwt_secret, &params.token);

    match claims {
        Ok(claims) => {
            tracing::info!(user_id = %claims.sub, "WebSocket connection authenticated");
            ws.on_upgrade(move |socket| handle_authenticated(socket, state, claims))
        }
        Err(err) => {
            // Determine close code based on error type
            let (close_code, reason) = match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    (CLOSE_TOKEN_EXPIRED, "Token expired")
                }
                _ => (CLOSE_TOKEN_INVALID, "Token invalid"),
            };

            tracing::warn!(
                close_code = close_code,
                reason = reason,
                "WebSocket auth failed"
            );

            ws.on_upgrade(move |socket| close_with(socket, close_code, reason))
        }
    }
}

/// Synchronize the authenticated identity, then run the connection actor.
async fn handle_authenticated(
    socket: WebSocket,
    state: AppState,
    claims: crate::auth::middleware::Claims,
) {
    let db = state.db.clone();
    let sync_claims = claims.clone();
    let sync_result =
        tokio::task::spawn_blocking(move || synchronizer::synchronize(&db, &sync_claims)).await;

    match sync_result {
        Ok(Ok(())) => {}
        Ok(Err(SyncError::InvalidCredential)) => {
            tracing::warn!("Closing WebSocket: credential has no usable subject claim");
            close_with(socket, CLOSE_TOKEN_INVALID, "Token invalid").await;
            return;
        }
        Ok(Err(err)) => {
            // Best-effort, same as the HTTP gate: the connection still
            // belongs to a validated identity
            tracing::warn!(user_id = %claims.sub, error = %err, "Identity synchronization failed");
        }
        Err(err) => {
            tracing::warn!(error = %err, "Identity synchronization task panicked");
        }
    }

    actor::run_connection(socket, state, claims.sub).await;
}

/// Upgrade the connection, then immediately close with the error code
/// so browser clients can distinguish auth failures.
async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let close_frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(close_frame))).await;
}
