//! Per-user notification routing over live WebSocket connections.
//!
//! A notification targets one user and is delivered to every
//! connection that user had live at lookup time. Delivery is
//! fire-and-forget: a failed send is logged and never aborts delivery
//! to sibling connections, and nothing propagates past this module.
//! Connections that open after the registry snapshot do not receive
//! the notification.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};

use crate::ws::registry::connections_for;
use crate::ws::ConnectionRegistry;

/// Ephemeral payload addressed to one user's live connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub body: serde_json::Value,
}

impl Notification {
    pub fn new(kind: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            body,
        }
    }
}

/// Wire envelope pushed to clients. The destination is always the
/// target user's private destination, never a shared topic.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    destination: String,
    #[serde(rename = "type")]
    kind: &'a str,
    body: &'a serde_json::Value,
}

/// Private delivery destination for a user. Enforced here, at the
/// router boundary, so callers cannot accidentally address a payload
/// to another user's connections.
pub fn user_destination(user_id: &str) -> String {
    format!("/user/{}/chat", user_id)
}

/// Deliver a notification to every connection the user has live right
/// now. Returns the number of delivery attempts; zero is the normal
/// "offline" result, not an error.
pub fn notify(registry: &ConnectionRegistry, user_id: &str, notification: &Notification) -> usize {
    let connections = connections_for(registry, user_id);
    if connections.is_empty() {
        tracing::debug!(user_id = %user_id, "No live connections, notification dropped");
        return 0;
    }

    let envelope = Envelope {
        destination: user_destination(user_id),
        kind: &notification.kind,
        body: &notification.body,
    };
    let text = match serde_json::to_string(&envelope) {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(user_id = %user_id, error = %err, "Failed to serialize notification");
            return 0;
        }
    };

    let mut attempted = 0;
    for sender in &connections {
        attempted += 1;
        // The send lands in the connection's writer task; a closed
        // channel means the connection died mid-delivery. Discard.
        if sender.send(Message::Text(text.clone().into())).is_err() {
            tracing::debug!(
                user_id = %user_id,
                "Delivery failed, connection already closed"
            );
        }
    }

    tracing::debug!(
        user_id = %user_id,
        kind = %notification.kind,
        attempted = attempted,
        "Notification routed"
    );
    attempted
}
