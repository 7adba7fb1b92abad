//! Integration tests for WebSocket auth, heartbeat, ping/pong and message dispatch.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use parley_server::config::{HubConfig, SyncConfig};
use parley_server::db::models::ChatKind;
use parley_server::push::LogNotifier;
use parley_server::repo::{ChatRepository, SqliteStore};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    base_url: String,
    addr: SocketAddr,
    store: SqliteStore,
    jwt_secret: Vec<u8>,
}

/// Helper: start the server on a random port.
async fn start_test_server() -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = parley_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = parley_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");

    let state = parley_server::state::AppState::new(
        db,
        jwt_secret.clone(),
        &HubConfig::default(),
        SyncConfig::default(),
        Arc::new(LogNotifier),
    );
    let store = state.store.clone();

    let app = parley_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
        let _keep = tmp_dir;
    });

    TestServer {
        base_url: format!("http://{}", addr),
        addr,
        store,
        jwt_secret,
    }
}

impl TestServer {
    async fn user(&self, name: &str) -> (i64, String) {
        let user = self.store.create_user(name).await.unwrap();
        let token = parley_server::auth::jwt::issue_access_token(&self.jwt_secret, user.id).unwrap();
        (user.id, token)
    }

    async fn connect(&self, token: &str) -> WsStream {
        let url = format!("ws://{}/ws?token={}", self.addr, token);
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("Failed to connect");
        ws
    }
}

async fn send_json(ws: &mut WsStream, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Read text frames until one of the given type arrives.
async fn next_of_type(ws: &mut WsStream, kind: &str) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let frame = tokio::time::timeout_at(deadline, ws.next())
            .await
            .unwrap_or_else(|_| panic!("Timed out waiting for {}", kind))
            .expect("stream ended")
            .expect("read error");
        if let Message::Text(text) = frame {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            if value["header"]["type"] == kind {
                return value;
            }
        }
    }
}

fn heartbeat(id: &str) -> serde_json::Value {
    json!({"header": {"version": "1.0", "type": "heartbeat", "message_id": id, "timestamp": 0, "sender_id": 0}})
}

#[tokio::test]
async fn test_ws_upgrade_without_token_is_unauthorized() {
    let server = start_test_server().await;

    let url = format!("ws://{}/ws", server.addr);
    match tokio_tungstenite::connect_async(&url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), 401),
        other => panic!("Expected 401, got {:?}", other.map(|_| ())),
    }

    let url = format!("ws://{}/ws?token=garbage", server.addr);
    match tokio_tungstenite::connect_async(&url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), 401),
        other => panic!("Expected 401, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_ws_accepts_bearer_header() {
    let server = start_test_server().await;
    let (_, token) = server.user("alice").await;

    let mut request = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", format!("Bearer {}", token).parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("Bearer header should authenticate");

    send_json(&mut ws, heartbeat("hb-header")).await;
    let ack = next_of_type(&mut ws, "ack").await;
    assert_eq!(ack["header"]["message_id"], "hb-header");
}

#[tokio::test]
async fn test_heartbeat_is_acked_and_malformed_frames_are_ignored() {
    let server = start_test_server().await;
    let (alice, token) = server.user("alice").await;
    let mut ws = server.connect(&token).await;

    ws.send(Message::Text("{not json".to_string().into())).await.unwrap();
    send_json(&mut ws, heartbeat("hb-1")).await;

    let ack = next_of_type(&mut ws, "ack").await;
    assert_eq!(ack["header"]["message_id"], "hb-1");
    assert_eq!(ack["header"]["recipient_id"], alice);
    assert_eq!(ack["body"]["status"], "ok");
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let server = start_test_server().await;
    let (_, token) = server.user("alice").await;
    let mut ws = server.connect(&token).await;

    ws.send(Message::Ping(b"keepalive".to_vec().into())).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let frame = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("Timed out waiting for pong")
            .unwrap()
            .unwrap();
        if let Message::Pong(data) = frame {
            assert_eq!(data.as_ref(), b"keepalive");
            break;
        }
    }
}

#[tokio::test]
async fn test_chat_message_round_trip() {
    let server = start_test_server().await;
    let (alice, alice_token) = server.user("alice").await;
    let (bob, bob_token) = server.user("bob").await;
    let chat = ChatRepository::create(&server.store, ChatKind::Group, None, alice)
        .await
        .unwrap();
    server.store.add_member(chat.id, bob).await.unwrap();

    let mut alice_ws = server.connect(&alice_token).await;
    let mut bob_ws = server.connect(&bob_token).await;
    // Alice sees Bob come online once both are registered
    let online = next_of_type(&mut alice_ws, "online").await;
    assert_eq!(online["body"]["user_id"], bob);

    send_json(
        &mut alice_ws,
        json!({
            "header": {"version": "1.0", "type": "chat_message", "message_id": "c-1",
                       "timestamp": 0, "sender_id": 999, "chat_id": chat.id},
            "body": {"content": "hi bob"}
        }),
    )
    .await;

    let ack = next_of_type(&mut alice_ws, "ack").await;
    assert_eq!(ack["header"]["message_id"], "c-1");
    assert_eq!(ack["body"]["status"], "ok");

    let delivered = next_of_type(&mut bob_ws, "chat_message").await;
    // The server stamps the authenticated sender, not the client's claim
    assert_eq!(delivered["header"]["sender_id"], alice);
    assert_eq!(delivered["header"]["chat_id"], chat.id);
    assert_eq!(delivered["body"]["content"], "hi bob");
    let pts = delivered["body"]["pts"].as_i64().unwrap();

    let diff: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/sync/channel/{}/difference?pts=0", server.base_url, chat.id))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(diff["pts"], pts);
    assert_eq!(diff["new_messages"][0]["message_id"], "c-1");
}

#[tokio::test]
async fn test_presence_endpoint_tracks_connections() {
    let server = start_test_server().await;
    let (_, watcher_token) = server.user("watcher").await;
    let (alice, alice_token) = server.user("alice").await;
    let client = reqwest::Client::new();
    let presence_url = format!("{}/presence/{}", server.base_url, alice);

    let before: serde_json::Value = client
        .get(&presence_url)
        .bearer_auth(&watcher_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(before["online"], false);

    let mut watcher_ws = server.connect(&watcher_token).await;
    let alice_ws = server.connect(&alice_token).await;
    next_of_type(&mut watcher_ws, "online").await;

    let during: serde_json::Value = client
        .get(&presence_url)
        .bearer_auth(&watcher_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(during["online"], true);

    drop(alice_ws);
    let offline = next_of_type(&mut watcher_ws, "offline").await;
    assert_eq!(offline["body"]["user_id"], alice);

    let after: serde_json::Value = client
        .get(&presence_url)
        .bearer_auth(&watcher_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(after["online"], false);
    assert!(after["last_seen"].is_i64());
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = start_test_server().await;
    let resp = reqwest::get(format!("{}/health", server.base_url)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
}
