//! TTS provider abstraction
//!
//! Two streaming providers (ElevenLabs, Cartesia) with very different wire
//! framing present one capability set: push text in, receive paired
//! `{audio, word timings}` chunks out. The transport trait covers the input
//! side; received chunks arrive on a channel fed by each client's receive
//! loop, so a session can be force-closed from another task (cancellation)
//! while the streamer is draining chunks.

pub mod cartesia;
pub mod elevenlabs;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Number of connection attempts before giving up.
pub const CONNECT_RETRIES: u32 = 3;

/// Supported TTS providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    ElevenLabs,
    Cartesia,
}

impl TtsProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            TtsProvider::ElevenLabs => "elevenlabs",
            TtsProvider::Cartesia => "cartesia",
        }
    }
}

impl std::fmt::Display for TtsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error from a TTS provider.
#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("invalid TTS settings: {0}")]
    Settings(String),
    #[error("connection failed after {attempts} attempts: {message}")]
    Connect { attempts: u32, message: String },
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive error: {0}")]
    Receive(String),
    #[error("{0} API key not set")]
    MissingKey(&'static str),
    #[error("upstream error [{code}]: {message}")]
    Upstream { code: String, message: String },
}

/// Timing information for a single word, in seconds from the session's
/// audio timeline origin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

/// Audio chunk with zero or more word timings.
#[derive(Debug, Clone, Default)]
pub struct AudioChunk {
    pub audio: Vec<u8>,
    pub words: Vec<WordTiming>,
}

/// ElevenLabs-specific voice settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElevenLabsSettings {
    pub voice_id: String,
    #[serde(default = "elevenlabs_default_model")]
    pub model_id: String,
    #[serde(default = "default_stability")]
    pub stability: f64,
    #[serde(default = "default_similarity")]
    pub similarity_boost: f64,
    #[serde(default)]
    pub style: f64,
    #[serde(default = "default_speed")]
    pub speed: f64,
}

fn elevenlabs_default_model() -> String {
    "eleven_multilingual_v2".to_string()
}

fn default_stability() -> f64 {
    0.5
}

fn default_similarity() -> f64 {
    0.75
}

fn default_speed() -> f64 {
    1.0
}

impl ElevenLabsSettings {
    /// ElevenLabs valid speed range.
    pub const SPEED_RANGE: (f64, f64) = (0.7, 1.2);

    /// Validate settings, clamping out-of-range speed with a warning.
    pub fn validate(mut self) -> Result<Self, TtsError> {
        if self.voice_id.trim().is_empty() {
            return Err(TtsError::Settings("voice_id is required".into()));
        }
        for (name, value) in [
            ("stability", self.stability),
            ("similarity_boost", self.similarity_boost),
            ("style", self.style),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TtsError::Settings(format!(
                    "{} must be between 0.0 and 1.0, got {}",
                    name, value
                )));
            }
        }
        let (lo, hi) = Self::SPEED_RANGE;
        let clamped = self.speed.clamp(lo, hi);
        if clamped != self.speed {
            warn!(
                "ElevenLabs speed {} clamped to {} (valid: {}-{})",
                self.speed, clamped, lo, hi
            );
            self.speed = clamped;
        }
        Ok(self)
    }
}

/// Cartesia-specific voice settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CartesiaSettings {
    pub voice_id: String,
    #[serde(default = "cartesia_default_model")]
    pub model_id: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_speed")]
    pub speed: f64,
    #[serde(default)]
    pub emotion: Option<String>,
}

fn cartesia_default_model() -> String {
    "sonic-2024-12-12".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

impl CartesiaSettings {
    /// Cartesia valid speed range.
    pub const SPEED_RANGE: (f64, f64) = (0.6, 1.5);

    pub fn validate(mut self) -> Result<Self, TtsError> {
        if self.voice_id.trim().is_empty() {
            return Err(TtsError::Settings("voice_id is required".into()));
        }
        let (lo, hi) = Self::SPEED_RANGE;
        let clamped = self.speed.clamp(lo, hi);
        if clamped != self.speed {
            warn!(
                "Cartesia speed {} clamped to {} (valid: {}-{})",
                self.speed, clamped, lo, hi
            );
            self.speed = clamped;
        }
        Ok(self)
    }
}

/// Validated per-provider settings.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsSettings {
    ElevenLabs(ElevenLabsSettings),
    Cartesia(CartesiaSettings),
}

impl TtsSettings {
    /// Validate an opaque settings blob against the provider's schema.
    pub fn from_value(provider: TtsProvider, value: &serde_json::Value) -> Result<Self, TtsError> {
        match provider {
            TtsProvider::ElevenLabs => {
                let settings: ElevenLabsSettings = serde_json::from_value(value.clone())
                    .map_err(|e| TtsError::Settings(e.to_string()))?;
                Ok(TtsSettings::ElevenLabs(settings.validate()?))
            }
            TtsProvider::Cartesia => {
                let settings: CartesiaSettings = serde_json::from_value(value.clone())
                    .map_err(|e| TtsError::Settings(e.to_string()))?;
                Ok(TtsSettings::Cartesia(settings.validate()?))
            }
        }
    }

    pub fn provider(&self) -> TtsProvider {
        match self {
            TtsSettings::ElevenLabs(_) => TtsProvider::ElevenLabs,
            TtsSettings::Cartesia(_) => TtsProvider::Cartesia,
        }
    }

    pub fn voice_id(&self) -> &str {
        match self {
            TtsSettings::ElevenLabs(s) => &s.voice_id,
            TtsSettings::Cartesia(s) => &s.voice_id,
        }
    }
}

/// Input side of a streaming TTS session.
///
/// Implementations are cheap to share (`Arc`) so a cancelling task can
/// force-close the socket while the owner is still pumping text.
#[async_trait]
pub trait TtsTransport: Send + Sync {
    /// Push a text fragment; `flush` requests immediate synthesis of
    /// buffered text.
    async fn send_text(&self, text: &str, flush: bool) -> Result<(), TtsError>;
    /// Signal end-of-input; upstream will drain remaining audio.
    async fn close_input(&self) -> Result<(), TtsError>;
    /// Tear down the session. Idempotent.
    async fn close(&self);
}

/// Shared handle to a session's input side.
pub type TtsSender = Arc<dyn TtsTransport>;

/// A connected streaming session: input handle plus the chunk stream.
///
/// The channel closes when the upstream sends its terminal marker or the
/// session is closed; an `Err` item carries a mid-stream failure.
pub struct TtsSession {
    pub sender: TtsSender,
    pub chunks: mpsc::Receiver<Result<AudioChunk, TtsError>>,
}

/// Open a streaming session for the chosen provider, retrying the
/// connection with exponential backoff.
pub async fn connect(settings: &TtsSettings) -> Result<TtsSession, TtsError> {
    let mut last_error = String::new();
    for attempt in 0..CONNECT_RETRIES {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1));
            warn!(
                "TTS connect failed (attempt {}): {}; retrying in {:?}",
                attempt, last_error, delay
            );
            tokio::time::sleep(delay).await;
        }
        let result = match settings {
            TtsSettings::ElevenLabs(s) => elevenlabs::ElevenLabsWsClient::connect(s).await,
            TtsSettings::Cartesia(s) => cartesia::CartesiaWsClient::connect(s).await,
        };
        match result {
            Ok(session) => return Ok(session),
            Err(TtsError::MissingKey(k)) => return Err(TtsError::MissingKey(k)),
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(TtsError::Connect {
        attempts: CONNECT_RETRIES,
        message: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_serde() {
        assert_eq!(
            serde_json::to_string(&TtsProvider::ElevenLabs).unwrap(),
            "\"elevenlabs\""
        );
        let p: TtsProvider = serde_json::from_str("\"cartesia\"").unwrap();
        assert_eq!(p, TtsProvider::Cartesia);
    }

    #[test]
    fn test_elevenlabs_settings_validation() {
        let settings = ElevenLabsSettings {
            voice_id: "v1".into(),
            model_id: elevenlabs_default_model(),
            stability: 0.5,
            similarity_boost: 0.75,
            style: 0.0,
            speed: 1.0,
        };
        assert!(settings.clone().validate().is_ok());

        let empty = ElevenLabsSettings {
            voice_id: "".into(),
            ..settings.clone()
        };
        assert!(empty.validate().is_err());

        let bad = ElevenLabsSettings {
            stability: 1.5,
            ..settings
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_speed_clamped_not_rejected() {
        let settings = ElevenLabsSettings {
            voice_id: "v1".into(),
            model_id: elevenlabs_default_model(),
            stability: 0.5,
            similarity_boost: 0.75,
            style: 0.0,
            speed: 2.0,
        }
        .validate()
        .unwrap();
        assert_eq!(settings.speed, 1.2);

        let settings = CartesiaSettings {
            voice_id: "v1".into(),
            model_id: cartesia_default_model(),
            language: "en".into(),
            speed: 0.2,
            emotion: None,
        }
        .validate()
        .unwrap();
        assert_eq!(settings.speed, 0.6);
    }

    #[test]
    fn test_settings_from_blob() {
        let blob = serde_json::json!({"voice_id": "v1"});
        let settings = TtsSettings::from_value(TtsProvider::ElevenLabs, &blob).unwrap();
        assert_eq!(settings.provider(), TtsProvider::ElevenLabs);
        assert_eq!(settings.voice_id(), "v1");
        match settings {
            TtsSettings::ElevenLabs(s) => {
                assert_eq!(s.model_id, "eleven_multilingual_v2");
                assert_eq!(s.speed, 1.0);
            }
            _ => unreachable!(),
        }

        let missing = serde_json::json!({});
        assert!(TtsSettings::from_value(TtsProvider::Cartesia, &missing).is_err());
    }
}
