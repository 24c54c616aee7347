use axum::{
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::auth::jwt;
use crate::state::AppState;
use crate::users::synchronizer::{self, SyncError};

/// Validated credential claims extracted from a bearer token.
/// The subject claim is the canonical user identity; the profile
/// attributes are issuer-asserted and copied into the local user
/// record on every synchronization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID (issuer subject claim)
    pub sub: String,
    /// First name asserted by the identity provider
    pub given_name: Option<String>,
    /// Last name asserted by the identity provider
    pub family_name: Option<String>,
    /// Email asserted by the identity provider
    pub email: Option<String>,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// Claims extractor for protected handlers. The synchronization gate
/// middleware stores Claims in request extensions for every request
/// that carried a valid bearer token; anything else is anonymous and
/// rejected here with 401.
impl<S> FromRequestParts<S> for Claims
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .cloned()
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

/// Per-request identity synchronization gate.
///
/// Runs ahead of every handler:
/// - requests without a bearer token are anonymous and pass through
///   (protected handlers reject them via the Claims extractor);
/// - a bearer token that fails validation also passes through as
///   anonymous, for the same rejection downstream;
/// - a valid token triggers the identity synchronizer. A credential
///   with an unusable subject claim rejects the request with 401
///   before any business logic runs. Store errors are logged and the
///   request proceeds — synchronization is best-effort on every call
///   and will be retried by the next request anyway.
pub async fn synchronize_identity(
    State(state): State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let bearer = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = bearer else {
        // Anonymous request — skip synchronization
        return next.run(req).await;
    };

    let claims = match jwt::validate_access_token(&state.jwt_secret, &token) {
        Ok(claims) => claims,
        Err(err) => {
            tracing::debug!(error = %err, "Bearer token failed validation, treating as anonymous");
            return next.run(req).await;
        }
    };

    let db = state.db.clone();
    let sync_claims = claims.clone();
    let sync_result =
        tokio::task::spawn_blocking(move || synchronizer::synchronize(&db, &sync_claims)).await;

    match sync_result {
        Ok(Ok(())) => {}
        Ok(Err(SyncError::InvalidCredential)) => {
            tracing::warn!("Rejecting request: credential has no usable subject claim");
            return (StatusCode::UNAUTHORIZED, "Invalid credential").into_response();
        }
        Ok(Err(err)) => {
            tracing::warn!(user_id = %claims.sub, error = %err, "Identity synchronization failed");
        }
        Err(err) => {
            tracing::warn!(error = %err, "Identity synchronization task panicked");
        }
    }

    req.extensions_mut().insert(claims);
    next.run(req).await
}
