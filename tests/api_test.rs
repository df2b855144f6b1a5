//! Integration tests for the REST surface: character CRUD with optimistic
//! concurrency, memory endpoints, wish state, and probes.

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

use voicecast::config::ServerConfig;
use voicecast::coordinator::GenerationCoordinator;
use voicecast::db::Database;
use voicecast::memory::ConversationMemory;
use voicecast::registry::ConnectionRegistry;
use voicecast::server::{build_router, AppState};
use voicecast::twitch::{ChatBuffer, TwitchManager};
use voicecast::wish::{WishModel, WishSessionManager, WishSpeaker};

struct StubModel;

#[async_trait]
impl WishModel for StubModel {
    async fn complete(&self, _messages: Vec<Value>, _format: Value) -> Result<String> {
        Ok(r#"{"speech": "ho ho", "action": "deny"}"#.to_string())
    }
}

struct StubSpeaker;

#[async_trait]
impl WishSpeaker for StubSpeaker {
    async fn speak(&self, _text: &str) -> Result<()> {
        Ok(())
    }
}

async fn test_state() -> AppState {
    let db = Arc::new(Database::open_in_memory().await.unwrap());
    let registry = Arc::new(ConnectionRegistry::new());
    let memory = Arc::new(ConversationMemory::new(db.clone()));
    let coordinator = Arc::new(GenerationCoordinator::new(registry.clone(), memory.clone()));
    let chat_buffer = Arc::new(ChatBuffer::new());
    let (events_tx, _events_rx) = tokio::sync::mpsc::channel(8);
    let twitch = Arc::new(TwitchManager::new(events_tx));
    let wish = Arc::new(WishSessionManager::new(
        Arc::new(StubModel),
        Arc::new(StubSpeaker),
        db.clone(),
        registry.clone(),
        chat_buffer.clone(),
    ));

    AppState {
        config: Arc::new(ServerConfig::default()),
        db,
        registry,
        coordinator,
        memory,
        chat_buffer,
        twitch,
        wish,
    }
}

async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn alice() -> Value {
    json!({
        "name": "alice",
        "tts_provider": "elevenlabs",
        "tts_settings": {"voice_id": "v1"},
        "text_style": {"font_size": 64},
    })
}

#[tokio::test]
async fn test_health_and_version() {
    let app = build_router(test_state().await);

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, "GET", "/version", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "voicecast");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_character_crud_roundtrip() {
    let app = build_router(test_state().await);

    let (status, created) = send(&app, "POST", "/api/characters", Some(alice())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["name"], "alice");
    assert_eq!(created["text_style"]["font_size"], 64);

    // Create-then-get returns identical semantic content
    let (status, fetched) = send(&app, "GET", "/api/characters/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], created["name"]);
    assert_eq!(fetched["tts_settings"], created["tts_settings"]);
    assert_eq!(fetched["updated_at"], created["updated_at"]);
    assert_eq!(fetched["connected"], false);

    let (status, list) = send(&app, "GET", "/api/characters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, "DELETE", "/api/characters/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "GET", "/api/characters/alice", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicate_character_rejected() {
    let app = build_router(test_state().await);
    send(&app, "POST", "/api/characters", Some(alice())).await;
    let (status, _) = send(&app, "POST", "/api/characters", Some(alice())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_tts_settings_rejected() {
    let app = build_router(test_state().await);
    let (status, body) = send(
        &app,
        "POST",
        "/api/characters",
        Some(json!({
            "name": "bad",
            "tts_provider": "elevenlabs",
            "tts_settings": {},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");
}

#[tokio::test]
async fn test_update_optimistic_concurrency_conflict() {
    let app = build_router(test_state().await);
    let (_, created) = send(&app, "POST", "/api/characters", Some(alice())).await;
    let token = created["updated_at"].clone();

    let (status, updated) = send(
        &app,
        "PUT",
        "/api/characters/alice",
        Some(json!({
            "expected_updated_at": token,
            "description": "the first update",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["description"], "the first update");

    // The stale token now conflicts: refresh and retry
    let (status, body) = send(
        &app,
        "PUT",
        "/api/characters/alice",
        Some(json!({
            "expected_updated_at": token,
            "description": "stale write",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
}

#[tokio::test]
async fn test_update_same_values_is_noop() {
    let app = build_router(test_state().await);
    send(&app, "POST", "/api/characters", Some(alice())).await;

    let update = json!({"description": "same thing"});
    let (_, first) = send(&app, "PUT", "/api/characters/alice", Some(update.clone())).await;
    let (_, second) = send(&app, "PUT", "/api/characters/alice", Some(update)).await;
    assert_eq!(first["updated_at"], second["updated_at"]);
}

#[tokio::test]
async fn test_memory_endpoints() {
    let state = test_state().await;
    let app = build_router(state.clone());
    send(&app, "POST", "/api/characters", Some(alice())).await;

    // Seed an entry directly, then read and clear over REST
    state
        .memory
        .append(
            "alice",
            voicecast::memory::StoredMessage::text(voicecast::memory::Role::User, "hello"),
            false,
        )
        .await
        .unwrap();

    let (status, body) = send(&app, "GET", "/api/characters/alice/memory", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["role"], "user");

    let (status, _) = send(&app, "DELETE", "/api/characters/alice/memory", None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, "GET", "/api/characters/alice/memory", None).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_speak_without_overlay_fails_cleanly() {
    let app = build_router(test_state().await);
    send(&app, "POST", "/api/characters", Some(alice())).await;

    let (status, _) = send(
        &app,
        "POST",
        "/api/characters/alice/speak",
        Some(json!({"text": "Hello, world."})),
    )
    .await;
    // No overlay connected: the operation fails at the first send
    assert_ne!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_speak_unknown_character_404() {
    let app = build_router(test_state().await);
    let (status, _) = send(
        &app,
        "POST",
        "/api/characters/nobody/speak",
        Some(json!({"text": "hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stop_without_generation() {
    let app = build_router(test_state().await);
    send(&app, "POST", "/api/characters", Some(alice())).await;
    let (status, body) = send(&app, "POST", "/api/characters/alice/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["was_active"], false);
}

#[tokio::test]
async fn test_wish_state_and_config() {
    let app = build_router(test_state().await);

    let (status, body) = send(&app, "GET", "/api/wish/state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], false);

    let (status, body) = send(&app, "GET", "/api/wish/config", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["max_followups"], 2);
    assert_eq!(body["chat_vote_secs"], 15);

    let (status, body) = send(
        &app,
        "PUT",
        "/api/wish/config",
        Some(json!({"max_followups": 1, "chat_vote_secs": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["max_followups"], 1);

    let (_, body) = send(&app, "GET", "/api/wish/config", None).await;
    assert_eq!(body["chat_vote_secs"], 5);
}

#[tokio::test]
async fn test_wish_cancel_is_idempotent() {
    let app = build_router(test_state().await);
    for _ in 0..3 {
        let (status, body) = send(
            &app,
            "POST",
            "/api/wish/override",
            Some(json!({"action": "cancel"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }
}

#[tokio::test]
async fn test_presets_crud() {
    let app = build_router(test_state().await);

    let (status, preset) = send(
        &app,
        "POST",
        "/api/presets",
        Some(json!({"name": "intro", "text": "Welcome to the stream!"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = preset["id"].as_i64().unwrap();

    let (_, list) = send(&app, "GET", "/api/presets", None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, "DELETE", &format!("/api/presets/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, "DELETE", &format!("/api/presets/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_twitch_status_disconnected() {
    let app = build_router(test_state().await);
    let (status, body) = send(&app, "GET", "/api/twitch/auth", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected"], false);
    assert_eq!(body["has_token"], false);
}

#[tokio::test]
async fn test_rewards_require_twitch_connection() {
    let app = build_router(test_state().await);
    let (status, _) = send(&app, "GET", "/api/rewards", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
