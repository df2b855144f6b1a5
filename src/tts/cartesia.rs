//! Cartesia WebSocket TTS streaming
//!
//! Cartesia sends native word-timestamp frames, but audio and timing arrive
//! in separate messages. The receive loop accumulates pending audio until a
//! matching `timestamps` frame lands, emitting paired chunks; the terminal
//! `done` frame flushes anything left unpaired.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error};
use uuid::Uuid;

use super::{AudioChunk, CartesiaSettings, TtsError, TtsSession, TtsTransport, WordTiming};

const CARTESIA_WS_URL: &str = "wss://api.cartesia.ai/tts/websocket";
const CARTESIA_API_URL: &str = "https://api.cartesia.ai";
const CARTESIA_VERSION: &str = "2024-06-10";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// WebSocket client for Cartesia streaming TTS.
pub struct CartesiaWsClient {
    sink: tokio::sync::Mutex<WsSink>,
    settings: CartesiaSettings,
    context_id: String,
    closed: AtomicBool,
    input_ended: AtomicBool,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl CartesiaWsClient {
    /// Open a session and start the receive loop.
    pub async fn connect(settings: &CartesiaSettings) -> Result<TtsSession, TtsError> {
        let api_key = crate::config::cartesia_api_key()
            .map_err(|_| TtsError::MissingKey("CARTESIA_API_KEY"))?;
        let url = format!(
            "{}?cartesia_version={}&api_key={}",
            CARTESIA_WS_URL, CARTESIA_VERSION, api_key
        );

        let (ws, _) = connect_async(url).await.map_err(|e| TtsError::Connect {
            attempts: 1,
            message: e.to_string(),
        })?;
        let (sink, stream) = ws.split();

        let context_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(receive_loop(stream, tx, context_id.clone()));

        let client = Arc::new(Self {
            sink: tokio::sync::Mutex::new(sink),
            settings: settings.clone(),
            context_id,
            closed: AtomicBool::new(false),
            input_ended: AtomicBool::new(false),
            receive_task: Mutex::new(Some(handle)),
        });
        debug!("Cartesia WS connected - voice={}", settings.voice_id);

        Ok(TtsSession {
            sender: client,
            chunks: rx,
        })
    }

    fn build_message(&self, text: &str, is_final: bool) -> Value {
        build_message(&self.settings, &self.context_id, text, is_final)
    }
}

/// Every Cartesia message carries the full generation config.
fn build_message(settings: &CartesiaSettings, context_id: &str, text: &str, is_final: bool) -> Value {
    let mut message = serde_json::json!({
        "model_id": settings.model_id,
        "transcript": text,
        "voice": {"mode": "id", "id": settings.voice_id},
        "language": settings.language,
        "context_id": context_id,
        "output_format": {
            "container": "raw",
            "encoding": "pcm_s16le",
            "sample_rate": crate::config::SAMPLE_RATE,
        },
        "add_timestamps": true,
        "continue": !is_final,
    });
    // Settings validation already clamped speed to the provider range
    message["generation_config"] = serde_json::json!({"speed": settings.speed});
    if let Some(emotion) = &settings.emotion {
        message["voice"]["__experimental_controls"] = serde_json::json!({"emotion": [emotion]});
    }
    message
}

#[async_trait::async_trait]
impl TtsTransport for CartesiaWsClient {
    async fn send_text(&self, text: &str, flush: bool) -> Result<(), TtsError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TtsError::Send("session closed".into()));
        }
        if self.input_ended.load(Ordering::SeqCst) {
            return Err(TtsError::Send("input already ended".into()));
        }
        let message = self.build_message(text, flush);
        self.sink
            .lock()
            .await
            .send(Message::Text(message.to_string().into()))
            .await
            .map_err(|e| TtsError::Send(e.to_string()))
    }

    async fn close_input(&self) -> Result<(), TtsError> {
        if self.closed.load(Ordering::SeqCst) || self.input_ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Empty transcript with continue=false finalizes the context
        let message = self.build_message("", true);
        self.sink
            .lock()
            .await
            .send(Message::Text(message.to_string().into()))
            .await
            .map_err(|e| TtsError::Send(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.sink.lock().await.send(Message::Close(None)).await;
        let handle = self.receive_task.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

async fn receive_loop(
    mut stream: WsStream,
    tx: mpsc::Sender<Result<AudioChunk, TtsError>>,
    context_id: String,
) {
    let mut pending_audio: Vec<u8> = Vec::new();
    let mut pending_words: Vec<WordTiming> = Vec::new();

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                let _ = tx.send(Err(TtsError::Receive(e.to_string()))).await;
                return;
            }
        };
        let text = match message {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        let data: Value = match serde_json::from_str(text.as_str()) {
            Ok(d) => d,
            Err(_) => continue,
        };

        // Only process frames for our context
        if data.get("context_id").and_then(Value::as_str) != Some(context_id.as_str()) {
            continue;
        }

        match data.get("type").and_then(Value::as_str) {
            Some("chunk") => {
                if let Some(audio_b64) = data.get("data").and_then(Value::as_str) {
                    if let Ok(audio) = BASE64.decode(audio_b64) {
                        pending_audio.extend_from_slice(&audio);
                    }
                }
                // Keep audio flowing with low latency when no timing is due
                if !pending_audio.is_empty() && pending_words.is_empty() {
                    let chunk = AudioChunk {
                        audio: std::mem::take(&mut pending_audio),
                        words: Vec::new(),
                    };
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            }
            Some("timestamps") => {
                if let Some(ts) = data.get("word_timestamps") {
                    let words = ts.get("words").and_then(Value::as_array);
                    let starts = ts.get("start").and_then(Value::as_array);
                    let ends = ts.get("end").and_then(Value::as_array);
                    if let (Some(words), Some(starts), Some(ends)) = (words, starts, ends) {
                        for ((word, start), end) in words.iter().zip(starts).zip(ends) {
                            if let (Some(word), Some(start), Some(end)) =
                                (word.as_str(), start.as_f64(), end.as_f64())
                            {
                                pending_words.push(WordTiming {
                                    word: word.to_string(),
                                    start,
                                    end,
                                });
                            }
                        }
                    }
                }
                if !pending_audio.is_empty() || !pending_words.is_empty() {
                    let chunk = AudioChunk {
                        audio: std::mem::take(&mut pending_audio),
                        words: std::mem::take(&mut pending_words),
                    };
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            }
            Some("done") => {
                // Flush any unpaired audio before ending
                if !pending_audio.is_empty() || !pending_words.is_empty() {
                    let chunk = AudioChunk {
                        audio: std::mem::take(&mut pending_audio),
                        words: std::mem::take(&mut pending_words),
                    };
                    let _ = tx.send(Ok(chunk)).await;
                }
                break;
            }
            Some("error") => {
                let code = data
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let message = data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string();
                error!("Cartesia error [{}]: {}", code, message);
                let _ = tx.send(Err(TtsError::Upstream { code, message })).await;
                return;
            }
            _ => {}
        }
    }
}

/// List available voices via the REST API.
pub async fn list_voices() -> Result<Vec<Value>, TtsError> {
    let api_key = crate::config::cartesia_api_key()
        .map_err(|_| TtsError::MissingKey("CARTESIA_API_KEY"))?;
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| TtsError::Receive(e.to_string()))?;

    let response = client
        .get(format!("{}/voices", CARTESIA_API_URL))
        .header("X-API-Key", api_key)
        .header("Cartesia-Version", CARTESIA_VERSION)
        .send()
        .await
        .map_err(|e| TtsError::Receive(e.to_string()))?;
    if !response.status().is_success() {
        return Err(TtsError::Upstream {
            code: response.status().as_u16().to_string(),
            message: response.text().await.unwrap_or_default(),
        });
    }
    let body: Value = response
        .json()
        .await
        .map_err(|e| TtsError::Receive(e.to_string()))?;
    Ok(body.as_array().cloned().unwrap_or_default())
}

/// Known Cartesia TTS models. There is no public models endpoint.
pub fn list_models() -> Vec<Value> {
    serde_json::json!([
        {
            "model_id": "sonic-2024-12-12",
            "name": "Sonic",
            "description": "Latest generation TTS model with low latency and high quality",
            "supports_timestamps": true,
        },
        {
            "model_id": "sonic-english",
            "name": "Sonic English",
            "description": "English-optimized TTS model",
            "supports_timestamps": true,
        },
        {
            "model_id": "sonic-multilingual",
            "name": "Sonic Multilingual",
            "description": "Multilingual TTS model supporting 15+ languages",
            "supports_timestamps": true,
        },
    ])
    .as_array()
    .cloned()
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> CartesiaSettings {
        CartesiaSettings {
            voice_id: "voice-1".into(),
            model_id: "sonic-2024-12-12".into(),
            language: "en".into(),
            speed: 1.0,
            emotion: None,
        }
    }

    #[test]
    fn test_build_message_fields() {
        let message = build_message(&test_settings(), "ctx-1", "Hello", false);
        assert_eq!(message["transcript"], "Hello");
        assert_eq!(message["voice"]["mode"], "id");
        assert_eq!(message["voice"]["id"], "voice-1");
        assert_eq!(message["context_id"], "ctx-1");
        assert_eq!(message["continue"], true);
        assert_eq!(message["add_timestamps"], true);
        assert_eq!(message["output_format"]["encoding"], "pcm_s16le");
        assert_eq!(message["output_format"]["sample_rate"], 24000);
        assert_eq!(message["generation_config"]["speed"], 1.0);
    }

    #[test]
    fn test_build_message_final_and_emotion() {
        let mut settings = test_settings();
        settings.emotion = Some("curiosity".into());
        let message = build_message(&settings, "ctx-1", "", true);
        assert_eq!(message["continue"], false);
        assert_eq!(
            message["voice"]["__experimental_controls"]["emotion"][0],
            "curiosity"
        );
    }

    #[test]
    fn test_model_catalog() {
        let models = list_models();
        assert_eq!(models.len(), 3);
        assert_eq!(models[0]["model_id"], "sonic-2024-12-12");
    }
}
