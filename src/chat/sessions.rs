//! REST endpoints for chat session management.
//!
//! Sessions are one-to-one between two users. Creation is idempotent:
//! an existing chat between the pair (in either direction) is returned
//! instead of duplicated. A newly created chat is announced to both
//! participants over their private notification destinations.

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::notify::{self, Notification};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateChatRequest {
    pub sender_id: String,
    pub receiver_id: String,
}

#[derive(Debug, Serialize)]
pub struct CreateChatResponse {
    pub chat_id: String,
}

/// Summary of a chat session as seen by one participant. The name is
/// the other participant's display name.
#[derive(Debug, Serialize)]
pub struct ChatSummary {
    pub id: String,
    pub name: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub created_at: String,
}

/// POST /api/chats — Create or get a chat between sender and receiver.
/// Auth required; the caller must be the sender. Returns the existing
/// chat id (200) when one already exists in either direction, 201 on
/// creation. Both participants are notified of a newly created chat.
pub async fn create_chat(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<CreateChatRequest>,
) -> Result<(StatusCode, Json<CreateChatResponse>), (StatusCode, String)> {
    // A caller can only open chats on their own behalf
    if body.sender_id != claims.sub {
        return Err((
            StatusCode::FORBIDDEN,
            "Sender must be the authenticated user".to_string(),
        ));
    }

    let db = state.db.clone();
    let sender_id = body.sender_id.clone();
    let receiver_id = body.receiver_id.clone();

    let (is_new, chat_id) = tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB lock: {}", e)))?;

        // Validate the receiver exists. The sender exists by construction:
        // the synchronization gate ran before this handler.
        let receiver_exists: Option<String> = conn
            .query_row(
                "SELECT id FROM users WHERE id = ?1",
                [&receiver_id],
                |row| row.get(0),
            )
            .ok();
        if receiver_exists.is_none() {
            return Err((StatusCode::NOT_FOUND, "Receiver not found".to_string()));
        }

        // An existing chat between the pair, in either direction, is reused
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM chats
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)",
                rusqlite::params![sender_id, receiver_id],
                |row| row.get(0),
            )
            .ok();

        if let Some(id) = existing {
            return Ok((false, id));
        }

        let chat_id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO chats (id, sender_id, receiver_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![chat_id, sender_id, receiver_id, now],
        )
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Chat creation failed: {}", e),
            )
        })?;

        Ok((true, chat_id))
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Task join: {}", e)))??;

    if is_new {
        // Announce the new chat to both participants (targeted, never broadcast)
        let event = Notification::new(
            "chat.created",
            json!({
                "chat_id": &chat_id,
                "sender_id": &body.sender_id,
                "receiver_id": &body.receiver_id,
            }),
        );
        notify::notify(&state.connections, &body.sender_id, &event);
        notify::notify(&state.connections, &body.receiver_id, &event);

        tracing::info!(
            chat_id = %chat_id,
            sender_id = %body.sender_id,
            receiver_id = %body.receiver_id,
            "Chat created"
        );
        Ok((StatusCode::CREATED, Json(CreateChatResponse { chat_id })))
    } else {
        Ok((StatusCode::OK, Json(CreateChatResponse { chat_id })))
    }
}

/// GET /api/chats — List chat sessions for the authenticated user.
/// Scoped to the caller's own identity; there is no way to list
/// another user's chats.
pub async fn list_chats(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<ChatSummary>>, (StatusCode, String)> {
    let db = state.db.clone();
    let user_id = claims.sub.clone();

    let chats = tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB lock: {}", e)))?;

        let mut stmt = conn
            .prepare(
                "SELECT c.id, c.sender_id, c.receiver_id, c.created_at,
                        us.first_name, us.last_name,
                        ur.first_name, ur.last_name
                 FROM chats c
                 LEFT JOIN users us ON us.id = c.sender_id
                 LEFT JOIN users ur ON ur.id = c.receiver_id
                 WHERE c.sender_id = ?1 OR c.receiver_id = ?1
                 ORDER BY c.created_at DESC",
            )
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Prepare: {}", e)))?;

        let chats: Vec<ChatSummary> = stmt
            .query_map([&user_id], |row| {
                let sender_id: String = row.get(1)?;
                let receiver_id: String = row.get(2)?;

                // Display the *other* participant's name
                let (first, last) = if sender_id == user_id {
                    (
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    )
                } else {
                    (
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    )
                };
                let name = format!(
                    "{} {}",
                    first.unwrap_or_default(),
                    last.unwrap_or_default()
                )
                .trim()
                .to_string();

                Ok(ChatSummary {
                    id: row.get(0)?,
                    name,
                    sender_id,
                    receiver_id,
                    created_at: row.get(3)?,
                })
            })
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query: {}", e)))?
            .filter_map(|r| r.ok())
            .collect();

        Ok::<_, (StatusCode, String)>(chats)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Task join: {}", e)))??;

    Ok(Json(chats))
}
