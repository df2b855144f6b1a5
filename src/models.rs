//! Data models: characters, API request/response shapes, channel status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tts::TtsProvider;

/// Text overlay typography for a character.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextStyle {
    #[serde(default = "default_font_family")]
    pub font_family: String,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    /// Fill color, CSS hex
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub stroke_color: Option<String>,
    #[serde(default)]
    pub stroke_width: u32,
    /// Normalized position in [0,1]
    #[serde(default = "default_position")]
    pub position_x: f64,
    #[serde(default = "default_position")]
    pub position_y: f64,
    /// Default text display duration in milliseconds
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u32,
}

fn default_font_family() -> String {
    "Arial".to_string()
}

fn default_font_size() -> u32 {
    48
}

fn default_color() -> String {
    "#ffffff".to_string()
}

fn default_position() -> f64 {
    0.5
}

fn default_duration_ms() -> u32 {
    3000
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font_family: default_font_family(),
            font_size: default_font_size(),
            color: default_color(),
            stroke_color: None,
            stroke_width: 0,
            position_x: default_position(),
            position_y: default_position(),
            duration_ms: default_duration_ms(),
        }
    }
}

/// LLM settings for a character that can chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiSettings {
    pub system_prompt: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// OpenRouter provider routing order. Fallbacks are disabled when set.
    #[serde(default)]
    pub provider_order: Option<Vec<String>>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4.5".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

/// Live-chat context injection policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatContextPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_context_seconds")]
    pub window_seconds: u32,
    #[serde(default = "default_context_max")]
    pub max_messages: usize,
}

fn default_context_seconds() -> u32 {
    60
}

fn default_context_max() -> usize {
    20
}

impl Default for ChatContextPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            window_seconds: default_context_seconds(),
            max_messages: default_context_max(),
        }
    }
}

/// Conversation memory policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryPolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Persist across restarts (durable tier)
    #[serde(default)]
    pub persist: bool,
}

/// A configured character. One character drives zero or more live overlays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub text_style: TextStyle,
    pub tts_provider: TtsProvider,
    /// Provider settings blob, validated against the provider's schema
    pub tts_settings: serde_json::Value,
    #[serde(default)]
    pub ai: Option<AiSettings>,
    #[serde(default)]
    pub chat_context: ChatContextPolicy,
    #[serde(default)]
    pub memory: MemoryPolicy,
    pub created_at: DateTime<Utc>,
    /// Last-modified token for optimistic concurrency
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating a character.
#[derive(Debug, Clone, Deserialize)]
pub struct CharacterCreate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub text_style: TextStyle,
    pub tts_provider: TtsProvider,
    pub tts_settings: serde_json::Value,
    #[serde(default)]
    pub ai: Option<AiSettings>,
    #[serde(default)]
    pub chat_context: ChatContextPolicy,
    #[serde(default)]
    pub memory: MemoryPolicy,
}

/// Partial update for a character. `expected_updated_at` must match the
/// stored row or the update is rejected with a conflict.
///
/// Nullable fields use double-Option: absent = untouched, `null` = cleared.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CharacterUpdate {
    pub expected_updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub color: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub icon: Option<Option<String>>,
    pub text_style: Option<TextStyle>,
    pub tts_provider: Option<TtsProvider>,
    pub tts_settings: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "double_option")]
    pub ai: Option<Option<AiSettings>>,
    pub chat_context: Option<ChatContextPolicy>,
    pub memory: Option<MemoryPolicy>,
}

fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Connection-registry view of a character, reported to dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub name: String,
    pub connected: bool,
    pub overlay_count: usize,
    pub playing: bool,
    pub streaming: bool,
}

/// Speak request body.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeakRequest {
    pub text: String,
    #[serde(default = "default_true")]
    pub show_text: bool,
}

/// Chat request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default = "default_true")]
    pub show_text: bool,
    /// Override the character's chat-context window for this request
    #[serde(default)]
    pub twitch_chat_seconds: Option<u32>,
    #[serde(default)]
    pub images: Vec<ImageAttachment>,
}

fn default_true() -> bool {
    true
}

/// Inline image for multimodal chat requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAttachment {
    /// Base64-encoded image data
    pub data: String,
    /// e.g. "image/png"
    pub media_type: String,
}

/// Response for speak/chat requests.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResponse {
    pub success: bool,
    pub character: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<bool>,
}

/// Response for a stop request.
#[derive(Debug, Clone, Serialize)]
pub struct StopResponse {
    pub was_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spoken_text: Option<String>,
}

/// A saved text preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPreset {
    pub id: Option<i64>,
    pub name: String,
    pub text: String,
    #[serde(default)]
    pub style: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One playback-log row.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackLogEntry {
    pub id: i64,
    pub character: String,
    pub content: String,
    pub content_type: String,
    pub timestamp: DateTime<Utc>,
}
