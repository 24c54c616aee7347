//! Connection registry operations.
//!
//! Registration and deregistration arrive from connection lifecycle
//! events on arbitrary tasks; lookups arrive from the notification
//! router concurrently with both. All mutation for one user happens
//! under that user's DashMap shard lock, so register/deregister for
//! the same (user, connection) pair never interleave inconsistently
//! and a lookup never observes a connection once deregistration has
//! returned.

use super::{ConnectionRegistry, ConnectionSender};

/// Add a live connection under the owning user.
pub fn register(registry: &ConnectionRegistry, user_id: &str, tx: ConnectionSender) {
    registry.entry(user_id.to_string()).or_default().push(tx);

    let conn_count = registry.get(user_id).map(|v| v.len()).unwrap_or(0);
    tracing::debug!(
        user_id = %user_id,
        connections = conn_count,
        "Connection registered"
    );
}

/// Remove exactly the given connection. No-op if already absent —
/// disconnect events may race or duplicate. Also sweeps senders whose
/// receiver half is already gone, and drops the user's entry when the
/// last connection goes.
pub fn deregister(registry: &ConnectionRegistry, user_id: &str, tx: &ConnectionSender) {
    let mut remove_user = false;

    if let Some(mut connections) = registry.get_mut(user_id) {
        connections.retain(|sender| !sender.same_channel(tx) && !sender.is_closed());
        if connections.is_empty() {
            remove_user = true;
        }
    }

    if remove_user {
        registry.remove_if(user_id, |_, connections| connections.is_empty());
    }

    tracing::debug!(user_id = %user_id, "Connection deregistered");
}

/// Snapshot of the user's live connections at lookup time.
/// Empty means the user is simply offline for this channel.
pub fn connections_for(registry: &ConnectionRegistry, user_id: &str) -> Vec<ConnectionSender> {
    registry
        .get(user_id)
        .map(|entry| entry.value().clone())
        .unwrap_or_default()
}
