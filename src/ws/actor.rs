use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::state::AppState;
use crate::ws::registry;

/// Ping interval: server sends WebSocket ping every 30 seconds.
/// Prevents connection leaks from abrupt disconnects.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the actor-per-connection pattern for an authenticated WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader task: handles keepalive traffic and close frames
///
/// The mpsc channel is what the notification router resolves through
/// the connection registry: anything holding a clone of the sender can
/// push payloads to this client without touching the socket directly.
///
/// A connection moves Connecting -> Open -> Closed; the reader loop
/// exiting is the single Open -> Closed transition, and the cleanup
/// below deregisters exactly once regardless of which side initiated
/// the close. A reconnect is a brand-new connection and a new actor.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: String) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Register this connection in the connection registry
    registry::register(&state.connections, &user_id, tx.clone());

    tracing::info!(user_id = %user_id, "WebSocket actor started");

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died — connection is gone
                break;
            }

            // Wait for pong within timeout
            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    // Pong timeout or channel closed — close connection
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Reader loop: the push channel is one-directional, so inbound
    // traffic is keepalive only
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    tracing::debug!(
                        user_id = %user_id,
                        "Ignoring inbound text frame: {}",
                        text.chars().take(100).collect::<String>()
                    );
                }
                Message::Binary(_) => {
                    tracing::debug!(user_id = %user_id, "Ignoring inbound binary frame");
                }
                Message::Pong(_) => {
                    // Pong received — notify the ping task
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    // Respond to client pings with pong
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        user_id = %user_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                // Stream ended — client disconnected
                tracing::info!(user_id = %user_id, "WebSocket stream ended");
                break;
            }
        }
    }

    // Cleanup: abort writer and ping tasks, then remove this
    // connection from the registry before the actor returns
    writer_handle.abort();
    ping_handle.abort();

    registry::deregister(&state.connections, &user_id, &tx);

    tracing::info!(user_id = %user_id, "WebSocket actor stopped");
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
/// A failed write only tears down this connection; deliveries to the
/// user's other connections run through their own writer tasks.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}
