//! Integration tests for the sync REST endpoints over a real server.

use std::sync::Arc;
use tokio::net::TcpListener;

use parley_server::config::{HubConfig, SyncConfig};
use parley_server::db::models::{ChatKind, Message, NewMessage};
use parley_server::push::LogNotifier;
use parley_server::repo::{ChatRepository, MessageRepository, SqliteStore, SyncRepository};

struct TestServer {
    base_url: String,
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

    async fn group(&self, members: &[i64]) -> i64 {
        let chat = ChatRepository::create(&self.store, ChatKind::Group, None, members[0])
            .await
            .unwrap();
        for member in &members[1..] {
            self.store.add_member(chat.id, *member).await.unwrap();
        }
        chat.id
    }

    async fn message(&self, chat_id: i64, sender_id: i64, message_id: &str) -> Message {
        MessageRepository::create(
            &self.store,
            NewMessage {
                message_id: message_id.to_string(),
                chat_id,
                sender_id,
                message_type: "text".to_string(),
                content: message_id.to_string(),
                reply_to: None,
                created_at: 1_700_000_000,
            },
        )
        .await
        .unwrap()
    }

    async fn get(&self, token: &str, path: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
    }

    async fn get_json(&self, token: &str, path: &str) -> serde_json::Value {
        let resp = self.get(token, path).await;
        assert_eq!(resp.status(), 200, "GET {} failed", path);
        resp.json().await.unwrap()
    }
}

fn message_ids(value: &serde_json::Value) -> Vec<String> {
    value["new_messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["message_id"].as_str().unwrap().to_string())
        .collect()
}

fn pts_list(value: &serde_json::Value) -> Vec<i64> {
    value["new_messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["pts"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_channel_difference_returns_ascending_tail() {
    let server = start_test_server().await;
    let (alice, token) = server.user("alice").await;
    let (bob, _) = server.user("bob").await;
    let chat = server.group(&[alice, bob]).await;

    let mut stored = Vec::new();
    for i in 0..5 {
        let sender = if i % 2 == 0 { alice } else { bob };
        stored.push(server.message(chat, sender, &format!("m{}", i)).await);
    }
    let p0 = stored[0].pts;

    let body = server
        .get_json(&token, &format!("/sync/channel/{}/difference?pts={}&limit=10", chat, p0))
        .await;
    assert_eq!(body["final"], true);
    assert_eq!(message_ids(&body), vec!["m1", "m2", "m3", "m4"]);
    let pts = pts_list(&body);
    assert!(pts.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(body["pts"], stored[4].pts);

    // Same request, same page
    let again = server
        .get_json(&token, &format!("/sync/channel/{}/difference?pts={}&limit=10", chat, p0))
        .await;
    assert_eq!(message_ids(&again), message_ids(&body));
}

#[tokio::test]
async fn test_channel_difference_pages_until_final() {
    let server = start_test_server().await;
    let (alice, token) = server.user("alice").await;
    let chat = server.group(&[alice]).await;
    for i in 0..5 {
        server.message(chat, alice, &format!("m{}", i)).await;
    }

    let mut from = 0;
    let mut pages = Vec::new();
    loop {
        let body = server
            .get_json(&token, &format!("/sync/channel/{}/difference?pts={}&limit=2", chat, from))
            .await;
        pages.push(message_ids(&body));
        from = body["pts"].as_i64().unwrap();
        if body["final"] == true {
            break;
        }
    }

    assert_eq!(
        pages,
        vec![vec!["m0", "m1"], vec!["m2", "m3"], vec!["m4"]]
    );
}

#[tokio::test]
async fn test_channel_difference_exact_page_is_final() {
    let server = start_test_server().await;
    let (alice, token) = server.user("alice").await;
    let chat = server.group(&[alice]).await;
    server.message(chat, alice, "m0").await;
    server.message(chat, alice, "m1").await;

    let body = server
        .get_json(&token, &format!("/sync/channel/{}/difference?pts=0&limit=2", chat))
        .await;
    assert_eq!(body["final"], true);
    assert_eq!(message_ids(&body).len(), 2);
}

#[tokio::test]
async fn test_difference_covers_only_own_chats_and_skips_deleted() {
    let server = start_test_server().await;
    let (alice, token) = server.user("alice").await;
    let (bob, _) = server.user("bob").await;
    let (carol, _) = server.user("carol").await;
    let shared = server.group(&[alice, bob]).await;
    let own = server.group(&[alice]).await;
    let foreign = server.group(&[bob, carol]).await;

    server.message(shared, bob, "s1").await;
    server.message(foreign, carol, "f1").await;
    let removed = server.message(own, alice, "o1").await;
    server.message(shared, alice, "s2").await;
    let last = server.message(own, alice, "o2").await;
    server.store.soft_delete_message(removed.id).await.unwrap();

    let body = server.get_json(&token, "/sync/difference?pts=0").await;
    assert_eq!(message_ids(&body), vec!["s1", "s2", "o2"]);
    assert_eq!(body["state"]["pts"], last.pts);
}

#[tokio::test]
async fn test_difference_advances_state_without_regressing() {
    let server = start_test_server().await;
    let (alice, token) = server.user("alice").await;
    let chat = server.group(&[alice]).await;

    let state = server.get_json(&token, "/sync/state").await;
    assert_eq!(state["pts"], 0);
    assert!(state["date"].as_i64().unwrap() > 0);

    let first = server.message(chat, alice, "m0").await;
    let last = server.message(chat, alice, "m1").await;

    let body = server.get_json(&token, "/sync/difference?pts=0").await;
    assert_eq!(body["state"]["pts"], last.pts);
    assert_eq!(server.get_json(&token, "/sync/state").await["pts"], last.pts);

    // Re-fetching an older window never lowers the stored watermark
    let partial = server.get_json(&token, "/sync/difference?pts=0&limit=1").await;
    assert_eq!(partial["state"]["pts"], first.pts);
    assert_eq!(server.get_json(&token, "/sync/state").await["pts"], last.pts);
}

#[tokio::test]
async fn test_empty_difference_reports_current_maximum() {
    let server = start_test_server().await;
    let (alice, _) = server.user("alice").await;
    let (_, token) = server.user("loner").await;
    let chat = server.group(&[alice]).await;
    let latest = server.message(chat, alice, "m0").await;

    let body = server.get_json(&token, "/sync/difference?pts=0").await;
    assert!(message_ids(&body).is_empty());
    assert_eq!(body["state"]["pts"], latest.pts);
}

#[tokio::test]
async fn test_channel_watermark_survives_deleting_the_newest_message() {
    let server = start_test_server().await;
    let (alice, token) = server.user("alice").await;
    let chat = server.group(&[alice]).await;
    let first = server.message(chat, alice, "m1").await;
    let newest = server.message(chat, alice, "m2").await;
    assert!(newest.pts > first.pts);
    server.store.soft_delete_message(newest.id).await.unwrap();

    let body = server
        .get_json(
            &token,
            &format!("/sync/channel/{}/difference?pts={}", chat, newest.pts),
        )
        .await;
    assert!(message_ids(&body).is_empty());
    assert_eq!(body["final"], true);
    assert_eq!(body["pts"], newest.pts);
}

#[tokio::test]
async fn test_channel_difference_advances_channel_state() {
    let server = start_test_server().await;
    let (alice, token) = server.user("alice").await;
    let chat = server.group(&[alice]).await;
    let latest = server.message(chat, alice, "m0").await;

    server
        .get_json(&token, &format!("/sync/channel/{}/difference?pts=0", chat))
        .await;

    let state = server
        .store
        .get_channel_state(alice, chat)
        .await
        .unwrap()
        .expect("channel state stored");
    assert_eq!(state.pts, latest.pts);
}

#[tokio::test]
async fn test_sync_rejects_bad_requests() {
    let server = start_test_server().await;
    let (alice, token) = server.user("alice").await;
    let (_, bob_token) = server.user("bob").await;
    let chat = server.group(&[alice]).await;

    assert_eq!(server.get(&token, "/sync/difference").await.status(), 400);
    assert_eq!(server.get(&token, "/sync/difference?pts=abc").await.status(), 400);
    assert_eq!(server.get(&token, "/sync/difference?pts=-1").await.status(), 400);
    assert_eq!(
        server
            .get(&token, &format!("/sync/channel/{}/difference", chat))
            .await
            .status(),
        400
    );
    assert_eq!(
        server
            .get(&bob_token, &format!("/sync/channel/{}/difference?pts=0", chat))
            .await
            .status(),
        403
    );

    let unauthenticated = reqwest::Client::new()
        .get(format!("{}/sync/state", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthenticated.status(), 401);
    assert_eq!(server.get("not-a-jwt", "/sync/state").await.status(), 401);
}
