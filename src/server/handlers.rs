//! REST API handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::db::DbError;
use crate::models::{
    CharacterCreate, CharacterUpdate, ChatRequest, GenerationResponse, SpeakRequest, StopResponse,
};
use crate::tts::{self, TtsError, TtsProvider, TtsSettings};
use crate::twitch::{EventSubConfig, HelixClient, TwitchError};

use super::AppState;

/// Error taxonomy mapped onto HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Request is malformed or violates a precondition; nothing mutated
    Validation(String),
    NotFound(String),
    /// Optimistic-concurrency mismatch; client must refresh and retry
    Conflict(String),
    /// Upstream provider failed after the retry budget
    Upstream(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Validation(m) => (StatusCode::BAD_REQUEST, "validation", m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "conflict", m),
            ApiError::Upstream(m) => (StatusCode::BAD_GATEWAY, "upstream", m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", m),
        };
        (status, Json(json!({"error": kind, "detail": message}))).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => ApiError::NotFound("not found".into()),
            DbError::Duplicate => ApiError::Validation("already exists".into()),
            DbError::Conflict => ApiError::Conflict(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<TtsError> for ApiError {
    fn from(e: TtsError) -> Self {
        match e {
            TtsError::Settings(m) => ApiError::Validation(m),
            TtsError::MissingKey(k) => ApiError::Validation(format!("{} not set", k)),
            other => ApiError::Upstream(other.to_string()),
        }
    }
}

impl From<TwitchError> for ApiError {
    fn from(e: TwitchError) -> Self {
        ApiError::Upstream(e.to_string())
    }
}

fn generation_error(e: anyhow::Error) -> ApiError {
    let message = format!("{:#}", e);
    if message.contains("no connected overlays") {
        ApiError::Validation(message)
    } else {
        ApiError::Upstream(message)
    }
}

fn parse_provider(raw: &str) -> Result<TtsProvider, ApiError> {
    match raw {
        "elevenlabs" => Ok(TtsProvider::ElevenLabs),
        "cartesia" => Ok(TtsProvider::Cartesia),
        other => Err(ApiError::Validation(format!(
            "unknown TTS provider '{}'",
            other
        ))),
    }
}

// ─── Characters ──────────────────────────────────────────────────

pub async fn list_characters(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let characters = state.db.list_characters().await?;
    let enriched: Vec<Value> = characters
        .into_iter()
        .map(|c| {
            let connected = state.registry.is_connected(&c.name);
            let channel_state = state.registry.channel_state(&c.name).unwrap_or_default();
            let mut value = serde_json::to_value(&c).unwrap_or_default();
            value["connected"] = json!(connected);
            value["overlay_count"] = json!(state.registry.overlay_count(&c.name));
            value["playing"] = json!(channel_state.playing);
            value["streaming"] = json!(channel_state.streaming);
            value
        })
        .collect();
    Ok(Json(json!(enriched)))
}

pub async fn create_character(
    State(state): State<AppState>,
    Json(create): Json<CharacterCreate>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if create.name.trim().is_empty() {
        return Err(ApiError::Validation("character name is required".into()));
    }
    // Settings must pass the provider's schema before anything is stored
    TtsSettings::from_value(create.tts_provider, &create.tts_settings)?;

    let character = state.db.create_character(create).await?;
    state.registry.notify_dashboards().await;
    info!("Character created - {}", character.name);
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(&character).unwrap_or_default()),
    ))
}

pub async fn get_character(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let character = state
        .db
        .get_character(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("character '{}' not found", name)))?;
    let channel_state = state.registry.channel_state(&name).unwrap_or_default();
    let mut value = serde_json::to_value(&character).unwrap_or_default();
    value["connected"] = json!(state.registry.is_connected(&name));
    value["overlay_count"] = json!(state.registry.overlay_count(&name));
    value["playing"] = json!(channel_state.playing);
    value["streaming"] = json!(channel_state.streaming);
    Ok(Json(value))
}

pub async fn update_character(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<CharacterUpdate>,
) -> Result<Json<Value>, ApiError> {
    if let Some(settings) = &update.tts_settings {
        let provider = match update.tts_provider {
            Some(p) => p,
            None => {
                state
                    .db
                    .get_character(&name)
                    .await?
                    .ok_or_else(|| ApiError::NotFound(format!("character '{}' not found", name)))?
                    .tts_provider
            }
        };
        TtsSettings::from_value(provider, settings)?;
    }
    let character = state.db.update_character(&name, update).await?;
    state.registry.notify_dashboards().await;
    Ok(Json(serde_json::to_value(&character).unwrap_or_default()))
}

pub async fn delete_character(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.db.delete_character(&name).await?;
    // Deletion severs any live overlay sessions for the name
    state.registry.disconnect_character(&name).await;
    state.coordinator.clear_pending(&name);
    info!("Character deleted - {}", name);
    Ok(Json(json!({"success": true, "deleted": name})))
}

// ─── Generation ──────────────────────────────────────────────────

pub async fn speak(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<SpeakRequest>,
) -> Result<Json<GenerationResponse>, ApiError> {
    if request.text.trim().is_empty() {
        return Err(ApiError::Validation("text is required".into()));
    }
    let character = state
        .db
        .get_character(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("character '{}' not found", name)))?;

    let _ = state.db.log_playback(&name, &request.text, "stream").await;
    let outcome = state
        .coordinator
        .speak(&character, &request.text, request.show_text)
        .await
        .map_err(generation_error)?;

    Ok(Json(GenerationResponse {
        success: true,
        character: name,
        text: Some(outcome.text),
        interrupted: Some(outcome.interrupted),
    }))
}

pub async fn chat(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<GenerationResponse>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::Validation("message is required".into()));
    }
    let character = state
        .db
        .get_character(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("character '{}' not found", name)))?;
    if character.ai.is_none() {
        return Err(ApiError::Validation(format!(
            "character '{}' has no AI settings",
            name
        )));
    }

    // Live-chat context: the character policy, or a per-request window
    let context = if character.chat_context.enabled || request.twitch_chat_seconds.is_some() {
        let seconds = request
            .twitch_chat_seconds
            .unwrap_or(character.chat_context.window_seconds);
        let block = state
            .chat_buffer
            .context_block(seconds, character.chat_context.max_messages);
        if block.is_empty() {
            None
        } else {
            Some(block)
        }
    } else {
        None
    };

    // History snapshot precedes this turn's entries
    let history = state.memory.history_for_llm(&name).await;

    if character.memory.enabled {
        if let Some(context_block) = &context {
            let entry = crate::memory::StoredMessage::text(
                crate::memory::Role::Context,
                context_block.clone(),
            );
            state
                .memory
                .append(&name, entry, character.memory.persist)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
        }
        let content = if request.images.is_empty() {
            Value::String(request.message.clone())
        } else {
            let mut parts = vec![json!({"type": "text", "text": request.message})];
            for image in &request.images {
                parts.push(json!({
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:{};base64,{}", image.media_type, image.data),
                    },
                }));
            }
            Value::Array(parts)
        };
        let mut entry =
            crate::memory::StoredMessage::text(crate::memory::Role::User, String::new());
        entry.content = content;
        state
            .memory
            .append(&name, entry, character.memory.persist)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
    }

    let llm = crate::llm::OpenRouterClient::from_env()
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    let _ = state.db.log_playback(&name, &request.message, "chat").await;

    let outcome = state
        .coordinator
        .chat(
            &character,
            &request.message,
            request.show_text,
            context,
            request.images,
            history,
            llm,
        )
        .await
        .map_err(generation_error)?;

    Ok(Json(GenerationResponse {
        success: true,
        character: name,
        text: Some(outcome.text),
        interrupted: Some(outcome.interrupted),
    }))
}

pub async fn stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    let (was_active, spoken_text) = state.coordinator.stop(&name).await;
    Ok(Json(StopResponse {
        was_active,
        spoken_text,
    }))
}

// ─── Memory ──────────────────────────────────────────────────────

pub async fn get_memory(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entries = state.memory.get(&name).await;
    Ok(Json(serde_json::to_value(&entries).unwrap_or_default()))
}

pub async fn clear_memory(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .memory
        .clear(&name)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    state.coordinator.clear_pending(&name);
    Ok(Json(json!({"success": true, "character": name})))
}

// ─── TTS catalogs ────────────────────────────────────────────────

pub async fn list_voices(Path(provider): Path<String>) -> Result<Json<Value>, ApiError> {
    let voices = match parse_provider(&provider)? {
        TtsProvider::ElevenLabs => tts::elevenlabs::list_voices().await?,
        TtsProvider::Cartesia => tts::cartesia::list_voices().await?,
    };
    Ok(Json(json!({"voices": voices})))
}

pub async fn list_models(Path(provider): Path<String>) -> Result<Json<Value>, ApiError> {
    let models = match parse_provider(&provider)? {
        TtsProvider::ElevenLabs => tts::elevenlabs::list_models().await?,
        TtsProvider::Cartesia => tts::cartesia::list_models(),
    };
    Ok(Json(json!({"models": models})))
}

// ─── Twitch auth and rewards ─────────────────────────────────────

pub async fn twitch_auth_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let connected = state.twitch.is_connected().await;
    let broadcaster = state.twitch.broadcaster_user_id().await;
    let has_token = matches!(state.db.get_twitch_token().await, Ok(Some(_)));
    Ok(Json(json!({
        "connected": connected,
        "has_token": has_token,
        "broadcaster_user_id": broadcaster,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TwitchAuthRequest {
    pub access_token: String,
    /// Broadcaster user id; defaults to the token's own user
    pub broadcaster_user_id: Option<String>,
}

pub async fn twitch_auth_set(
    State(state): State<AppState>,
    Json(request): Json<TwitchAuthRequest>,
) -> Result<Json<Value>, ApiError> {
    let client_id = crate::config::twitch_client_id()
        .ok_or_else(|| ApiError::Validation("TWITCH_CLIENT_ID environment variable not set".into()))?;

    let (user_id, login) = HelixClient::validate_token(&request.access_token).await?;
    let broadcaster_user_id = request
        .broadcaster_user_id
        .unwrap_or_else(|| user_id.clone());

    state
        .db
        .set_twitch_token(
            &request.access_token,
            Some(&broadcaster_user_id),
            Some(&user_id),
        )
        .await?;

    state
        .twitch
        .start(EventSubConfig {
            access_token: request.access_token,
            client_id,
            broadcaster_user_id: broadcaster_user_id.clone(),
            user_id,
            reward_id: None,
        })
        .await;

    Ok(Json(json!({
        "success": true,
        "login": login,
        "broadcaster_user_id": broadcaster_user_id,
    })))
}

async fn helix_or_err(state: &AppState) -> Result<HelixClient, ApiError> {
    state
        .twitch
        .helix()
        .await
        .ok_or_else(|| ApiError::Validation("Twitch is not connected".into()))
}

pub async fn list_rewards(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let helix = helix_or_err(&state).await?;
    let rewards = helix.get_rewards().await?;
    Ok(Json(json!({"rewards": rewards})))
}

#[derive(Debug, Deserialize)]
pub struct CreateRewardRequest {
    pub title: String,
    pub cost: u32,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_true")]
    pub is_user_input_required: bool,
}

fn default_true() -> bool {
    true
}

pub async fn create_reward(
    State(state): State<AppState>,
    Json(request): Json<CreateRewardRequest>,
) -> Result<Json<Value>, ApiError> {
    let helix = helix_or_err(&state).await?;
    let reward = helix
        .create_reward(
            &request.title,
            request.cost,
            &request.prompt,
            request.is_user_input_required,
        )
        .await?;
    Ok(Json(reward))
}

pub async fn delete_reward(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let helix = helix_or_err(&state).await?;
    helix.delete_reward(&id).await?;
    Ok(Json(json!({"success": true, "deleted": id})))
}

#[derive(Debug, Deserialize)]
pub struct RewardEnabledRequest {
    pub enabled: bool,
}

pub async fn set_reward_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RewardEnabledRequest>,
) -> Result<Json<Value>, ApiError> {
    let helix = helix_or_err(&state).await?;
    helix.set_reward_enabled(&id, request.enabled).await?;
    Ok(Json(json!({"success": true, "id": id, "enabled": request.enabled})))
}

#[derive(Debug, Deserialize)]
pub struct RedemptionUpdateRequest {
    pub reward_id: String,
    /// "FULFILLED" or "CANCELED"
    pub status: String,
}

pub async fn update_redemption(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RedemptionUpdateRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.status != "FULFILLED" && request.status != "CANCELED" {
        return Err(ApiError::Validation(
            "status must be FULFILLED or CANCELED".into(),
        ));
    }
    let helix = helix_or_err(&state).await?;
    helix
        .update_redemption_status(&request.reward_id, &id, &request.status)
        .await?;
    Ok(Json(json!({"success": true, "id": id, "status": request.status})))
}

// ─── Wish session ────────────────────────────────────────────────

pub async fn wish_state(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let status = state.wish.status().await;
    Ok(Json(serde_json::to_value(&status).unwrap_or_default()))
}

pub async fn get_wish_config(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let config = state.wish.config().await;
    Ok(Json(serde_json::to_value(&config).unwrap_or_default()))
}

pub async fn set_wish_config(
    State(state): State<AppState>,
    Json(raw): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let config: crate::wish::WishConfig = serde_json::from_value(raw)
        .map_err(|e| ApiError::Validation(format!("invalid wish config: {}", e)))?;
    let value = serde_json::to_value(&config).unwrap_or_default();
    state.db.set_wish_config(&value).await?;
    Ok(Json(value))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WishOverrideRequest {
    ForceVerdict { grant: bool },
    DirectMessage { message: String },
    Cancel,
}

pub async fn wish_override(
    State(state): State<AppState>,
    Json(request): Json<WishOverrideRequest>,
) -> Result<Json<Value>, ApiError> {
    let delivered = match request {
        WishOverrideRequest::ForceVerdict { grant } => state.wish.force_verdict(grant).await,
        WishOverrideRequest::DirectMessage { message } => {
            if message.trim().is_empty() {
                return Err(ApiError::Validation("message is required".into()));
            }
            state.wish.direct_message(message).await
        }
        // Cancel is idempotent: cancelling an idle session succeeds
        WishOverrideRequest::Cancel => {
            state.wish.cancel().await;
            true
        }
    };
    Ok(Json(json!({"success": delivered})))
}

// ─── Presets and history ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PresetCreateRequest {
    pub name: String,
    pub text: String,
    #[serde(default)]
    pub style: Option<String>,
}

pub async fn list_presets(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let presets = state.db.list_presets().await?;
    Ok(Json(serde_json::to_value(&presets).unwrap_or_default()))
}

pub async fn create_preset(
    State(state): State<AppState>,
    Json(request): Json<PresetCreateRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if request.name.trim().is_empty() || request.text.trim().is_empty() {
        return Err(ApiError::Validation("name and text are required".into()));
    }
    let preset = state
        .db
        .create_preset(&request.name, &request.text, request.style.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(&preset).unwrap_or_default()),
    ))
}

pub async fn delete_preset(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if state.db.delete_preset(id).await? {
        Ok(Json(json!({"success": true, "deleted": id})))
    } else {
        Err(ApiError::NotFound(format!("preset {} not found", id)))
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: u32,
}

fn default_history_limit() -> u32 {
    50
}

pub async fn playback_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let entries = state.db.recent_playback(query.limit).await?;
    Ok(Json(serde_json::to_value(&entries).unwrap_or_default()))
}

// ─── Probes ──────────────────────────────────────────────────────

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn version() -> Json<Value> {
    Json(json!({
        "name": crate::NAME,
        "version": crate::VERSION,
        "build_id": crate::BUILD_ID,
    }))
}
