//! TTS streamer
//!
//! The atomic unit of speech output: opens an upstream TTS session, pumps a
//! text source through it, and forwards audio plus word timing to the
//! overlay in the required order (word timing always lands before the audio
//! frame containing the word).
//!
//! Cancellation is cooperative: a shared flag, a forced close of the
//! upstream socket so its chunk stream terminates, and an abort of the
//! receive task. After cancel, `get_spoken_text()` returns what had been
//! converted to audio so far; the caller reconciles that with the overlay's
//! `stream_stopped` report.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::tts::{self, TtsSender, TtsSettings, WordTiming};

/// The six hooks a generation drives on the overlay command protocol.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn text_start(&self) -> Result<()>;
    async fn text_end(&self) -> Result<()>;
    async fn audio_start(&self) -> Result<()>;
    async fn audio_chunk(&self, audio: Vec<u8>) -> Result<()>;
    async fn audio_end(&self) -> Result<()>;
    async fn word_timing(&self, words: &[WordTiming]) -> Result<()>;
}

/// Text input for one generation: a literal string, or a lazy token stream.
pub enum TextSource {
    Literal(String),
    Tokens(mpsc::Receiver<String>),
}

impl From<&str> for TextSource {
    fn from(s: &str) -> Self {
        TextSource::Literal(s.to_string())
    }
}

/// Streams one utterance to the overlays of a character.
pub struct TtsStreamer {
    settings: TtsSettings,
    show_text: bool,
    sink: Arc<dyn StreamSink>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
    /// Shared with the receive task, which appends received words
    spoken_text: Arc<Mutex<String>>,
    sender: tokio::sync::Mutex<Option<TtsSender>>,
    receive_task: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl TtsStreamer {
    pub fn new(settings: TtsSettings, show_text: bool, sink: Arc<dyn StreamSink>) -> Self {
        Self {
            settings,
            show_text,
            sink,
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            spoken_text: Arc::new(Mutex::new(String::new())),
            sender: tokio::sync::Mutex::new(None),
            receive_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Text that was actually converted to audio, word-joined with single
    /// spaces. Valid during and after the stream, including after cancel.
    pub fn get_spoken_text(&self) -> String {
        self.spoken_text
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Stream the source to the overlays. Returns the full text that was
    /// sent into the TTS session (possibly larger than the spoken text if
    /// cancelled).
    pub async fn stream(&self, source: TextSource) -> Result<String> {
        let start = Instant::now();
        let provider = self.settings.provider();
        debug!(
            "TTS stream starting - provider={} voice={}",
            provider,
            self.settings.voice_id()
        );
        if let Ok(mut spoken) = self.spoken_text.lock() {
            spoken.clear();
        }

        let mut text_started = false;
        let mut audio_started = false;
        let result = self
            .run(source, &mut text_started, &mut audio_started)
            .await;

        match result {
            Ok(full_text) => {
                info!(
                    "TTS complete - {} - {} credits in {:.2}s",
                    provider,
                    full_text.chars().count(),
                    start.elapsed().as_secs_f64()
                );
                Ok(full_text)
            }
            Err(e) => {
                // Best-effort teardown so the overlay is not left half-open
                error!("TTS stream error: {}", e);
                if audio_started {
                    let _ = self.sink.audio_end().await;
                }
                if text_started {
                    let _ = self.sink.text_end().await;
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        source: TextSource,
        text_started: &mut bool,
        audio_started: &mut bool,
    ) -> Result<String> {
        // 1. Text stream opens before any audio frame
        if self.show_text {
            self.sink.text_start().await.context("text_start failed")?;
            *text_started = true;
        }

        // 2. Connect upstream TTS
        let session = tts::connect(&self.settings)
            .await
            .context("TTS connect failed")?;
        let sender = session.sender.clone();
        *self.sender.lock().await = Some(sender.clone());

        // 3. Announce the audio stream
        self.sink.audio_start().await.context("audio_start failed")?;
        *audio_started = true;

        // 4. Receive task: forward chunks, word timing before audio
        let mut chunks = session.chunks;
        let sink = self.sink.clone();
        let show_text = self.show_text;
        let spoken = self.spoken_text.clone();
        let receive = tokio::spawn(async move {
            while let Some(item) = chunks.recv().await {
                let chunk = item.context("TTS receive failed")?;
                if !chunk.words.is_empty() {
                    append_spoken(&spoken, &chunk.words);
                    if show_text {
                        sink.word_timing(&chunk.words)
                            .await
                            .context("word_timing failed")?;
                    }
                }
                if !chunk.audio.is_empty() {
                    sink.audio_chunk(chunk.audio)
                        .await
                        .context("audio_chunk failed")?;
                }
            }
            Ok(())
        });
        *self.receive_task.lock().await = Some(receive);

        // 5. Drive the source
        let full_text = match source {
            TextSource::Literal(text) => {
                if let Err(e) = sender.send_text(&text, false).await {
                    if !self.is_cancelled() {
                        return Err(e).context("TTS send failed");
                    }
                }
                text
            }
            TextSource::Tokens(mut rx) => {
                let mut full = String::new();
                loop {
                    if self.is_cancelled() {
                        break;
                    }
                    let token = tokio::select! {
                        token = rx.recv() => token,
                        _ = self.cancel_notify.notified() => break,
                    };
                    let Some(token) = token else { break };
                    full.push_str(&token);
                    if let Err(e) = sender.send_text(&token, false).await {
                        // An in-flight send racing a cancel is not an error
                        if self.is_cancelled() {
                            break;
                        }
                        return Err(e).context("TTS send failed");
                    }
                }
                full
            }
        };

        // 6. Drain: signal end-of-input and wait for the receive task
        if !self.is_cancelled() {
            sender.close_input().await.context("TTS close_input failed")?;
            let handle = self.receive_task.lock().await.take();
            if let Some(handle) = handle {
                match handle.await {
                    Ok(result) => result?,
                    // Aborted by a concurrent cancel
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => return Err(e).context("receive task panicked"),
                }
            }
        }

        sender.close().await;
        *self.sender.lock().await = None;

        // 7. Close streams: audio first, then text
        self.sink.audio_end().await.context("audio_end failed")?;
        *audio_started = false;
        if self.show_text {
            self.sink.text_end().await.context("text_end failed")?;
            *text_started = false;
        }

        Ok(full_text)
    }

    /// Cancel the stream: set the flag, close the upstream socket so its
    /// iterator terminates, abort the receive task.
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
        if let Some(sender) = self.sender.lock().await.take() {
            sender.close().await;
        }
        if let Some(handle) = self.receive_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// Append received words to the spoken-text buffer, word-joined with
/// single spaces. This is the source of truth for what was actually heard.
fn append_spoken(buffer: &Arc<Mutex<String>>, words: &[WordTiming]) {
    if let Ok(mut spoken) = buffer.lock() {
        for w in words {
            if !spoken.is_empty() && !spoken.ends_with(' ') {
                spoken.push(' ');
            }
            spoken.push_str(&w.word);
        }
    }
}
