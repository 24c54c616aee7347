//! Identity synchronization against the external identity provider.
//!
//! Every authenticated request carries issuer-asserted profile claims.
//! The synchronizer upserts the local user record from those claims so
//! the record exists before any business logic touches it. The upsert
//! is keyed on the subject claim and safe to run on every request.

use chrono::Utc;
use thiserror::Error;

use crate::auth::middleware::Claims;
use crate::db::DbPool;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The credential has no usable subject claim. The request gate
    /// rejects the request before any downstream operation runs.
    #[error("credential has no usable subject claim")]
    InvalidCredential,

    /// The local user store failed. Non-fatal for the request: the
    /// next request repeats the synchronization.
    #[error("user store error: {0}")]
    Store(String),
}

/// Ensure a local user record exists for the credential's subject and
/// carries its current profile attributes. Idempotent: repeating the
/// call with identical claims leaves the row untouched (the UPDATE arm
/// only fires when an attribute actually differs).
pub fn synchronize(db: &DbPool, claims: &Claims) -> Result<(), SyncError> {
    let user_id = claims.sub.trim();
    if user_id.is_empty() {
        return Err(SyncError::InvalidCredential);
    }

    let first_name = claims.given_name.clone().unwrap_or_default();
    let last_name = claims.family_name.clone().unwrap_or_default();
    let email = claims.email.clone().unwrap_or_default();
    let now = Utc::now().to_rfc3339();

    let conn = db
        .lock()
        .map_err(|e| SyncError::Store(format!("DB lock: {}", e)))?;

    conn.execute(
        "INSERT INTO users (id, first_name, last_name, email, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(id) DO UPDATE SET
             first_name = excluded.first_name,
             last_name = excluded.last_name,
             email = excluded.email,
             updated_at = excluded.updated_at
         WHERE users.first_name IS NOT excluded.first_name
            OR users.last_name IS NOT excluded.last_name
            OR users.email IS NOT excluded.email",
        rusqlite::params![user_id, first_name, last_name, email, now],
    )
    .map_err(|e| SyncError::Store(format!("Upsert user: {}", e)))?;

    Ok(())
}
