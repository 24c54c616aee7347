//! Integration tests for the WebSocket channel: auth close codes,
//! keepalive, per-user notification delivery, multi-device fan-out,
//! and registry cleanup on disconnect.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Helper: start the server on a random port and return (base_url, jwt_secret, addr).
async fn start_test_server() -> (String, Vec<u8>, SocketAddr) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = parley_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = parley_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");

    let state = parley_server::state::AppState {
        db,
        jwt_secret: jwt_secret.clone(),
        connections: parley_server::ws::new_connection_registry(),
        allowed_origins: vec![],
    };

    let app = parley_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
        let _keep = tmp_dir;
    });

    (format!("http://{}", addr), jwt_secret, addr)
}

fn mint_token(secret: &[u8], sub: &str, given: &str, family: &str, email: &str) -> String {
    parley_server::auth::jwt::issue_access_token(secret, sub, given, family, email)
        .expect("Failed to issue token")
}

async fn connect_ws(addr: &SocketAddr, token: &str) -> WsStream {
    let ws_url = format!("ws://{}/ws?token={}", addr, token);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream
}

/// Read the next Text frame within a timeout, skipping pings.
async fn next_text(
    read: &mut futures_util::stream::SplitStream<WsStream>,
    wait: Duration,
) -> Option<String> {
    loop {
        match tokio::time::timeout(wait, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(text.to_string()),
            Ok(Some(Ok(Message::Ping(_)))) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn test_ws_connection_with_valid_token() {
    let (_base_url, secret, addr) = start_test_server().await;
    let token = mint_token(&secret, "alice", "Alice", "Anderson", "alice@example.com");

    let ws_stream = connect_ws(&addr, &token).await;
    let (mut _write, mut read) = ws_stream.split();

    // Connection stays open with no unsolicited messages
    let result = tokio::time::timeout(Duration::from_millis(500), read.next()).await;
    assert!(result.is_err(), "Expected silence on a fresh connection");
}

#[tokio::test]
async fn test_ws_auth_failure_invalid_token() {
    let (_base_url, _secret, addr) = start_test_server().await;

    let ws_url = format!("ws://{}/ws?token=invalid_jwt_token", addr);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("WebSocket should upgrade even with invalid token");

    let (mut _write, mut read) = ws_stream.split();

    // Server should immediately send a close frame with code 4002 (token invalid)
    let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Expected close message within timeout");

    match msg {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(
                frame.code,
                tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::from(4002),
                "Expected close code 4002 (token invalid)"
            );
        }
        Some(Ok(Message::Close(None))) => {
            // Close without frame — acceptable for invalid token
        }
        other => {
            if let Some(Ok(msg)) = other {
                assert!(msg.is_close(), "Expected close message, got: {:?}", msg);
            }
        }
    }
}

#[tokio::test]
async fn test_ws_auth_failure_expired_token() {
    let (_base_url, secret, addr) = start_test_server().await;

    // Hand-craft a token that expired an hour ago
    let now = chrono::Utc::now().timestamp();
    let claims = parley_server::auth::middleware::Claims {
        sub: "alice".to_string(),
        given_name: Some("Alice".to_string()),
        family_name: Some("Anderson".to_string()),
        email: Some("alice@example.com".to_string()),
        iat: now - 7200,
        exp: now - 3600,
    };
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(&secret),
    )
    .unwrap();

    let ws_url = format!("ws://{}/ws?token={}", addr, token);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("WebSocket should upgrade even with expired token");
    let (mut _write, mut read) = ws_stream.split();

    let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Expected close message within timeout");

    match msg {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(
                frame.code,
                tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::from(4001),
                "Expected close code 4001 (token expired)"
            );
        }
        other => panic!("Expected close frame, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_ws_ping_pong() {
    let (_base_url, secret, addr) = start_test_server().await;
    let token = mint_token(&secret, "alice", "Alice", "Anderson", "alice@example.com");

    let ws_stream = connect_ws(&addr, &token).await;
    let (mut write, mut read) = ws_stream.split();

    // Send a client ping
    write
        .send(Message::Ping(vec![42, 43, 44].into()))
        .await
        .expect("Failed to send ping");

    // We should receive a pong back
    let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Expected pong within timeout");

    match msg {
        Some(Ok(Message::Pong(data))) => {
            assert_eq!(data.as_ref(), &[42, 43, 44], "Pong data should match ping");
        }
        other => {
            panic!("Expected Pong message, got: {:?}", other);
        }
    }
}

#[tokio::test]
async fn test_chat_created_notification_reaches_the_receiver() {
    let (base_url, secret, addr) = start_test_server().await;
    let client = reqwest::Client::new();

    let alice = mint_token(&secret, "alice", "Alice", "Anderson", "alice@example.com");
    let bob = mint_token(&secret, "bob", "Bob", "Brown", "bob@example.com");

    // Bob connects; the WS auth path synchronizes his record
    let bob_stream = connect_ws(&addr, &bob).await;
    let (mut _bob_write, mut bob_read) = bob_stream.split();

    // Alice creates the chat over REST
    let resp = client
        .post(format!("{}/api/chats", base_url))
        .bearer_auth(&alice)
        .json(&serde_json::json!({"sender_id": "alice", "receiver_id": "bob"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    let chat_id = body["chat_id"].as_str().unwrap().to_string();

    // Bob's connection receives the event on his private destination
    let text = next_text(&mut bob_read, Duration::from_secs(2))
        .await
        .expect("Expected chat.created notification");
    let event: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(event["destination"].as_str().unwrap(), "/user/bob/chat");
    assert_eq!(event["type"].as_str().unwrap(), "chat.created");
    assert_eq!(event["body"]["chat_id"].as_str().unwrap(), chat_id);
    assert_eq!(event["body"]["sender_id"].as_str().unwrap(), "alice");
}

#[tokio::test]
async fn test_notification_fans_out_to_all_devices() {
    let (base_url, secret, addr) = start_test_server().await;
    let client = reqwest::Client::new();

    let alice = mint_token(&secret, "alice", "Alice", "Anderson", "alice@example.com");
    let bob = mint_token(&secret, "bob", "Bob", "Brown", "bob@example.com");

    // Bob is connected from two devices
    let (mut _w1, mut bob_read_1) = connect_ws(&addr, &bob).await.split();
    let (mut _w2, mut bob_read_2) = connect_ws(&addr, &bob).await.split();

    let resp = client
        .post(format!("{}/api/chats", base_url))
        .bearer_auth(&alice)
        .json(&serde_json::json!({"sender_id": "alice", "receiver_id": "bob"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    for read in [&mut bob_read_1, &mut bob_read_2] {
        let text = next_text(read, Duration::from_secs(2))
            .await
            .expect("Every device should receive the notification");
        let event: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(event["type"].as_str().unwrap(), "chat.created");
    }
}

#[tokio::test]
async fn test_disconnected_receiver_causes_no_error() {
    let (base_url, secret, addr) = start_test_server().await;
    let client = reqwest::Client::new();

    let alice = mint_token(&secret, "alice", "Alice", "Anderson", "alice@example.com");
    let carol = mint_token(&secret, "carol", "Carol", "Clark", "carol@example.com");

    // Carol connects (synchronizing her record), then disconnects
    {
        let ws_stream = connect_ws(&addr, &carol).await;
        let (mut write, _read) = ws_stream.split();
        write
            .send(Message::Close(None))
            .await
            .expect("Failed to send close");
    }

    // Give the server a moment to clean up
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Chat creation still succeeds with zero deliveries attempted
    let resp = client
        .post(format!("{}/api/chats", base_url))
        .bearer_auth(&alice)
        .json(&serde_json::json!({"sender_id": "alice", "receiver_id": "carol"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    // A reconnect is a fresh connection and sees nothing stale
    let ws_stream = connect_ws(&addr, &carol).await;
    let (mut _write, mut read) = ws_stream.split();
    let result = tokio::time::timeout(Duration::from_millis(300), read.next()).await;
    assert!(result.is_err(), "Expected no redelivery after reconnect");
}
