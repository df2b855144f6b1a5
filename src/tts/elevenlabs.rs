//! ElevenLabs WebSocket TTS streaming
//!
//! Uses the stream-input endpoint with `sync_alignment` so the upstream
//! returns character-level alignment alongside base64 audio. Word-level
//! timings are reconstructed by `WordAligner`, which carries an incomplete
//! word across chunk boundaries (a chunk that ends with no whitespace leaves
//! a pending word for the next chunk to complete).

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
use tracing::debug;

use super::{AudioChunk, ElevenLabsSettings, TtsError, TtsSession, TtsTransport, WordTiming};

const ELEVENLABS_WS_URL: &str = "wss://api.elevenlabs.io/v1/text-to-speech";
const ELEVENLABS_API_URL: &str = "https://api.elevenlabs.io/v1";

/// PCM s16le at 24 kHz mono: bytes per second of audio.
const BYTES_PER_SECOND: f64 = 48_000.0;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Reconstructs word timings from a character-level alignment stream.
#[derive(Debug, Default)]
pub struct WordAligner {
    pending: String,
    pending_start: f64,
    pending_end: f64,
}

impl WordAligner {
    /// Consume one alignment block. Times are milliseconds relative to the
    /// block's audio; `offset_s` shifts them onto the session timeline.
    pub fn push_chars(
        &mut self,
        chars: &[String],
        starts_ms: &[f64],
        durations_ms: &[f64],
        offset_s: f64,
    ) -> Vec<WordTiming> {
        let mut words = Vec::new();
        for (i, ch) in chars.iter().enumerate() {
            let start = offset_s + starts_ms.get(i).copied().unwrap_or(0.0) / 1000.0;
            let end = start + durations_ms.get(i).copied().unwrap_or(0.0) / 1000.0;
            if ch.chars().all(char::is_whitespace) {
                self.finalize_into(&mut words);
            } else {
                if self.pending.is_empty() {
                    self.pending_start = start;
                }
                self.pending.push_str(ch);
                self.pending_end = end;
            }
        }
        words
    }

    fn finalize_into(&mut self, words: &mut Vec<WordTiming>) {
        if self.pending.is_empty() {
            return;
        }
        let token = std::mem::take(&mut self.pending);
        if token.chars().any(char::is_alphanumeric) {
            words.push(WordTiming {
                word: token,
                start: self.pending_start,
                end: self.pending_end,
            });
        } else if let Some(last) = words.last_mut() {
            // Punctuation attaches to the preceding word
            last.word.push_str(&token);
            last.end = self.pending_end;
        }
        // A pure-punctuation token with no preceding word is suppressed
    }

    /// Flush the still-pending word at the upstream's terminal marker.
    pub fn flush(&mut self) -> Option<WordTiming> {
        if self.pending.is_empty() {
            return None;
        }
        let token = std::mem::take(&mut self.pending);
        if token.chars().any(char::is_alphanumeric) {
            Some(WordTiming {
                word: token,
                start: self.pending_start,
                end: self.pending_end,
            })
        } else {
            None
        }
    }
}

/// WebSocket client for ElevenLabs streaming TTS.
pub struct ElevenLabsWsClient {
    sink: tokio::sync::Mutex<WsSink>,
    closed: AtomicBool,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl ElevenLabsWsClient {
    fn ws_url(settings: &ElevenLabsSettings) -> String {
        format!(
            "{}/{}/stream-input?model_id={}&output_format=pcm_24000&sync_alignment=true",
            ELEVENLABS_WS_URL, settings.voice_id, settings.model_id
        )
    }

    /// Open a session: connect, send the BOS message with voice settings,
    /// start the receive loop.
    pub async fn connect(settings: &ElevenLabsSettings) -> Result<TtsSession, TtsError> {
        let api_key = crate::config::elevenlabs_api_key()
            .map_err(|_| TtsError::MissingKey("ELEVENLABS_API_KEY"))?;

        let (ws, _) = connect_async(Self::ws_url(settings))
            .await
            .map_err(|e| TtsError::Connect {
                attempts: 1,
                message: e.to_string(),
            })?;
        let (mut sink, stream) = ws.split();

        // BOS: initial text is a single space, the minimal required payload
        let init = serde_json::json!({
            "text": " ",
            "voice_settings": {
                "stability": settings.stability,
                "similarity_boost": settings.similarity_boost,
                "style": settings.style,
                "speed": settings.speed,
            },
            "generation_config": {
                // Lower buffering thresholds trade quality for latency
                "chunk_length_schedule": [120, 160, 250, 290],
            },
            "xi-api-key": api_key,
        });
        sink.send(Message::Text(init.to_string().into()))
            .await
            .map_err(|e| TtsError::Connect {
                attempts: 1,
                message: format!("BOS send failed: {}", e),
            })?;

        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(receive_loop(stream, tx));

        let client = Arc::new(Self {
            sink: tokio::sync::Mutex::new(sink),
            closed: AtomicBool::new(false),
            receive_task: Mutex::new(Some(handle)),
        });
        debug!("ElevenLabs WS connected - voice={}", settings.voice_id);

        Ok(TtsSession {
            sender: client,
            chunks: rx,
        })
    }
}

#[async_trait::async_trait]
impl TtsTransport for ElevenLabsWsClient {
    async fn send_text(&self, text: &str, flush: bool) -> Result<(), TtsError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TtsError::Send("session closed".into()));
        }
        let mut message = serde_json::json!({
            "text": text,
            "try_trigger_generation": true,
        });
        if flush {
            message["flush"] = Value::Bool(true);
        }
        self.sink
            .lock()
            .await
            .send(Message::Text(message.to_string().into()))
            .await
            .map_err(|e| TtsError::Send(e.to_string()))
    }

    async fn close_input(&self) -> Result<(), TtsError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        // EOS: empty text signals end of input
        self.sink
            .lock()
            .await
            .send(Message::Text(r#"{"text": ""}"#.to_string().into()))
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

async fn receive_loop(mut stream: WsStream, tx: mpsc::Sender<Result<AudioChunk, TtsError>>) {
    let mut aligner = WordAligner::default();
    let mut audio_offset_s = 0.0;

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

        if data.get("isFinal").and_then(Value::as_bool).unwrap_or(false) {
            // Terminal marker: flush any still-pending word, timing-only
            if let Some(word) = aligner.flush() {
                let _ = tx
                    .send(Ok(AudioChunk {
                        audio: Vec::new(),
                        words: vec![word],
                    }))
                    .await;
            }
            break;
        }

        let mut chunk = AudioChunk::default();
        if let Some(audio_b64) = data.get("audio").and_then(Value::as_str) {
            chunk.audio = BASE64.decode(audio_b64).unwrap_or_default();
        }

        let alignment = data
            .get("normalizedAlignment")
            .filter(|a| !a.is_null())
            .or_else(|| data.get("alignment").filter(|a| !a.is_null()));
        if let Some(alignment) = alignment {
            let chars = string_array(alignment, "chars");
            let starts = number_array(alignment, "charStartTimesMs");
            let durations = number_array(alignment, "charDurationsMs");
            chunk.words = aligner.push_chars(&chars, &starts, &durations, audio_offset_s);
        }

        audio_offset_s += chunk.audio.len() as f64 / BYTES_PER_SECOND;

        if !chunk.audio.is_empty() || !chunk.words.is_empty() {
            if tx.send(Ok(chunk)).await.is_err() {
                return;
            }
        }
    }
}

fn string_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn number_array(value: &Value, key: &str) -> Vec<f64> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

/// List available voices via the REST API.
pub async fn list_voices() -> Result<Vec<Value>, TtsError> {
    let api_key = crate::config::elevenlabs_api_key()
        .map_err(|_| TtsError::MissingKey("ELEVENLABS_API_KEY"))?;
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| TtsError::Receive(e.to_string()))?;

    let response = client
        .get(format!("{}/voices", ELEVENLABS_API_URL))
        .header("xi-api-key", api_key)
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
    Ok(body
        .get("voices")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

/// List available models via the REST API.
pub async fn list_models() -> Result<Vec<Value>, TtsError> {
    let api_key = crate::config::elevenlabs_api_key()
        .map_err(|_| TtsError::MissingKey("ELEVENLABS_API_KEY"))?;
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| TtsError::Receive(e.to_string()))?;

    let response = client
        .get(format!("{}/models", ELEVENLABS_API_URL))
        .header("xi-api-key", api_key)
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

/// Estimate TTS audio duration from word count at ~150 WPM, clamped to
/// [1s, 5min]. Used for one-shot text animation durations.
pub fn estimate_tts_duration_ms(text: &str, words_per_minute: u32) -> u32 {
    let word_count = text.split_whitespace().count() as u64;
    let duration_ms = word_count * 60_000 / words_per_minute.max(1) as u64;
    duration_ms.clamp(1000, 300_000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars_of(s: &str) -> (Vec<String>, Vec<f64>, Vec<f64>) {
        let chars: Vec<String> = s.chars().map(|c| c.to_string()).collect();
        let starts: Vec<f64> = (0..chars.len()).map(|i| i as f64 * 50.0).collect();
        let durations: Vec<f64> = vec![50.0; chars.len()];
        (chars, starts, durations)
    }

    #[test]
    fn test_aligner_simple_words() {
        let mut aligner = WordAligner::default();
        let (chars, starts, durations) = chars_of("Hello, world. ");
        let words = aligner.push_chars(&chars, &starts, &durations, 0.0);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].word, "Hello,");
        assert_eq!(words[1].word, "world.");
        assert!(words[0].start < words[1].start);
        assert!(aligner.flush().is_none());
    }

    #[test]
    fn test_aligner_pending_word_across_chunks() {
        let mut aligner = WordAligner::default();

        // Chunk ends mid-word: "wo" stays pending
        let (chars, starts, durations) = chars_of("Hello wo");
        let words = aligner.push_chars(&chars, &starts, &durations, 0.0);
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].word, "Hello");

        // Next chunk completes it exactly once
        let (chars, starts, durations) = chars_of("rld ");
        let words = aligner.push_chars(&chars, &starts, &durations, 1.0);
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].word, "world");
        // Start time comes from the first chunk, not the second
        assert!(words[0].start < 1.0);
    }

    #[test]
    fn test_aligner_whitespace_ending_leaves_no_pending() {
        let mut aligner = WordAligner::default();
        let (chars, starts, durations) = chars_of("done ");
        let words = aligner.push_chars(&chars, &starts, &durations, 0.0);
        assert_eq!(words.len(), 1);
        assert!(aligner.flush().is_none());
    }

    #[test]
    fn test_aligner_pure_punctuation_suppressed() {
        let mut aligner = WordAligner::default();
        let (chars, starts, durations) = chars_of("! ");
        let words = aligner.push_chars(&chars, &starts, &durations, 0.0);
        assert!(words.is_empty());

        // At terminal flush too
        let (chars, starts, durations) = chars_of("!");
        aligner.push_chars(&chars, &starts, &durations, 0.0);
        assert!(aligner.flush().is_none());
    }

    #[test]
    fn test_aligner_punctuation_attaches_to_preceding_word() {
        let mut aligner = WordAligner::default();
        let (chars, starts, durations) = chars_of("wait ! ");
        let words = aligner.push_chars(&chars, &starts, &durations, 0.0);
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].word, "wait!");
    }

    #[test]
    fn test_aligner_terminal_flush() {
        let mut aligner = WordAligner::default();
        let (chars, starts, durations) = chars_of("end");
        let words = aligner.push_chars(&chars, &starts, &durations, 0.0);
        assert!(words.is_empty());
        let flushed = aligner.flush().unwrap();
        assert_eq!(flushed.word, "end");
        // Flushing twice yields nothing
        assert!(aligner.flush().is_none());
    }

    #[test]
    fn test_aligner_offset_applied() {
        let mut aligner = WordAligner::default();
        let (chars, starts, durations) = chars_of("hi ");
        let words = aligner.push_chars(&chars, &starts, &durations, 10.0);
        assert!(words[0].start >= 10.0);
        assert!(words[0].end > words[0].start);
    }

    #[test]
    fn test_duration_estimate() {
        // 150 words at 150 WPM = one minute
        let text = vec!["word"; 150].join(" ");
        assert_eq!(estimate_tts_duration_ms(&text, 150), 60_000);
        // Short text clamps to 1s
        assert_eq!(estimate_tts_duration_ms("hi", 150), 1000);
    }

    #[test]
    fn test_ws_url() {
        let settings = ElevenLabsSettings {
            voice_id: "v1".into(),
            model_id: "eleven_multilingual_v2".into(),
            stability: 0.5,
            similarity_boost: 0.75,
            style: 0.0,
            speed: 1.0,
        };
        let url = ElevenLabsWsClient::ws_url(&settings);
        assert!(url.contains("/v1/text-to-speech/v1/stream-input"));
        assert!(url.contains("output_format=pcm_24000"));
        assert!(url.contains("sync_alignment=true"));
    }
}
