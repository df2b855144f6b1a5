//! Generation coordinator
//!
//! Enforces at-most-one in-flight generation per character. The per-character
//! lock serializes the preemption sequence: cancel the incumbent, wait for
//! its holder to unwind, send `stop_stream` so buffered overlay audio is
//! truncated, then install the replacement. Each generation additionally
//! holds a run guard for its whole duration so a preemptor can wait for the
//! outgoing holder to finish recording its partial result.
//!
//! Interrupted generations persist an assistant message whose `content` is
//! the generator-side spoken-text estimate; a pending-reconciliation entry
//! keyed by character lets a later `stream_stopped` report from the overlay
//! rewrite the content with what was actually heard. If the overlay never
//! reports, the estimate is retained.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::chat_pipeline::ChatPipeline;
use crate::memory::{ConversationMemory, Role, StoredMessage};
use crate::models::TextStyle;
use crate::protocol::OverlayCommand;
use crate::registry::ConnectionRegistry;
use crate::streamer::{StreamSink, TtsStreamer};
use crate::tts::WordTiming;

/// One in-flight generation: a bare speak or an LLM-backed chat.
#[derive(Clone)]
pub enum Generation {
    Speak(Arc<TtsStreamer>),
    Chat(Arc<ChatPipeline>),
}

impl Generation {
    pub async fn cancel(&self) {
        match self {
            Generation::Speak(s) => s.cancel().await,
            Generation::Chat(c) => c.cancel().await,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Generation::Speak(s) => s.is_cancelled(),
            Generation::Chat(c) => c.is_cancelled(),
        }
    }

    pub fn spoken_text(&self) -> String {
        match self {
            Generation::Speak(s) => s.get_spoken_text(),
            Generation::Chat(c) => c.get_spoken_text(),
        }
    }
}

/// Memory recording policy for one generation.
#[derive(Debug, Clone, Copy)]
pub struct MemoryCtx {
    pub enabled: bool,
    pub persist: bool,
}

/// Result of a completed (possibly interrupted) generation.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub text: String,
    pub interrupted: bool,
    pub spoken_text: String,
}

/// Awaiting the overlay's `stream_stopped` report for an interrupted entry.
#[derive(Debug, Clone)]
struct PendingInterrupt {
    memory_index: usize,
    #[allow(dead_code)]
    persist: bool,
    #[allow(dead_code)]
    db_id: Option<i64>,
}

struct ActiveEntry {
    generation: Generation,
    /// Held by the running holder for the generation's whole duration
    run_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Coordinates generations across characters.
pub struct GenerationCoordinator {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    active: Mutex<HashMap<String, ActiveEntry>>,
    pending: Mutex<HashMap<String, PendingInterrupt>>,
    registry: Arc<ConnectionRegistry>,
    memory: Arc<ConversationMemory>,
}

impl GenerationCoordinator {
    pub fn new(registry: Arc<ConnectionRegistry>, memory: Arc<ConversationMemory>) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            registry,
            memory,
        }
    }

    /// Per-character lock, created on first reference.
    fn lock_for(&self, character: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        locks
            .entry(character.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn take_active(&self, character: &str) -> Option<ActiveEntry> {
        self.active
            .lock()
            .expect("active table poisoned")
            .remove(character)
    }

    pub fn has_active(&self, character: &str) -> bool {
        self.active
            .lock()
            .expect("active table poisoned")
            .contains_key(character)
    }

    /// Run a generation for a character, preempting any incumbent.
    ///
    /// `run` is the generation's own future (the caller builds it from its
    /// handles); it is awaited with the generation installed as active.
    pub async fn execute<F>(
        &self,
        character: &str,
        generation: Generation,
        memory_ctx: Option<MemoryCtx>,
        run: F,
    ) -> Result<GenerationOutcome>
    where
        F: Future<Output = Result<String>>,
    {
        let run_lock = Arc::new(tokio::sync::Mutex::new(()));
        let run_guard = run_lock.clone().lock_owned().await;

        // Preemption is atomic under the character lock:
        // cancel-old -> wait-unwind -> stop_stream -> install-new.
        {
            let char_lock = self.lock_for(character);
            let _guard = char_lock.lock().await;
            if let Some(old) = self.take_active(character) {
                info!("Preempting active generation - character={}", character);
                old.generation.cancel().await;
                let _ = old.run_lock.lock().await;
                let _ = self
                    .registry
                    .send_json(character, &OverlayCommand::StopStream)
                    .await;
            }
            self.active.lock().expect("active table poisoned").insert(
                character.to_string(),
                ActiveEntry {
                    generation: generation.clone(),
                    run_lock: run_lock.clone(),
                },
            );
        }

        let result = run.await;

        // Remove ourselves if a preemptor has not already done so
        {
            let mut active = self.active.lock().expect("active table poisoned");
            if let Some(entry) = active.get(character) {
                if Arc::ptr_eq(&entry.run_lock, &run_lock) {
                    active.remove(character);
                }
            }
        }

        let outcome = match result {
            Ok(full_text) => {
                let interrupted = generation.is_cancelled();
                let spoken_text = generation.spoken_text();

                if let Some(ctx) = memory_ctx.filter(|c| c.enabled) {
                    let content = if interrupted {
                        spoken_text.clone()
                    } else {
                        full_text.clone()
                    };
                    let mut message = StoredMessage::text(Role::Assistant, content);
                    message.interrupted = interrupted;
                    if interrupted {
                        message.generated_text = Some(full_text.clone());
                    }
                    let (index, db_id) = self
                        .memory
                        .append(character, message, ctx.persist)
                        .await?;
                    if interrupted {
                        // A stale entry is simply overwritten by the next interrupt
                        self.pending.lock().expect("pending table poisoned").insert(
                            character.to_string(),
                            PendingInterrupt {
                                memory_index: index,
                                persist: ctx.persist,
                                db_id,
                            },
                        );
                    }
                }

                Ok(GenerationOutcome {
                    text: full_text,
                    interrupted,
                    spoken_text,
                })
            }
            Err(e) => {
                self.pending
                    .lock()
                    .expect("pending table poisoned")
                    .remove(character);
                let _ = self
                    .registry
                    .send_json(character, &OverlayCommand::StopStream)
                    .await;
                Err(e)
            }
        };

        drop(run_guard);
        outcome
    }

    /// Stop a character's generation without starting a new one. Sends
    /// `stop_stream` unconditionally: overlay audio may outlive the
    /// server-side generator.
    pub async fn stop(&self, character: &str) -> (bool, Option<String>) {
        let char_lock = self.lock_for(character);
        let _guard = char_lock.lock().await;

        let (was_active, spoken_text) = match self.take_active(character) {
            Some(old) => {
                old.generation.cancel().await;
                let _ = old.run_lock.lock().await;
                (true, Some(old.generation.spoken_text()))
            }
            None => (false, None),
        };

        let _ = self
            .registry
            .send_json(character, &OverlayCommand::StopStream)
            .await;
        (was_active, spoken_text)
    }

    /// Handle the overlay's authoritative `stream_stopped` report for an
    /// interrupted generation: rewrite the remembered content.
    pub async fn resolve_stream_stopped(&self, character: &str, spoken_text: &str) {
        let pending = self
            .pending
            .lock()
            .expect("pending table poisoned")
            .remove(character);
        let Some(pending) = pending else {
            return;
        };
        debug!(
            "Reconciling interrupted memory - character={} spoken=\"{}\"",
            character, spoken_text
        );
        if let Err(e) = self
            .memory
            .update_content(character, pending.memory_index, spoken_text.to_string())
            .await
        {
            warn!("Failed to reconcile interrupted memory: {}", e);
        }
    }

    /// Clear the pending-reconciliation entry (explicit memory clear).
    pub fn clear_pending(&self, character: &str) {
        self.pending
            .lock()
            .expect("pending table poisoned")
            .remove(character);
    }

    /// Speak a literal text on a character's overlays.
    pub async fn speak(
        &self,
        character: &crate::models::Character,
        text: &str,
        show_text: bool,
    ) -> Result<GenerationOutcome> {
        let settings =
            crate::tts::TtsSettings::from_value(character.tts_provider, &character.tts_settings)?;
        let sink = Arc::new(OverlaySink::new(
            self.registry.clone(),
            character.name.clone(),
            character.text_style.clone(),
        ));
        let streamer = Arc::new(TtsStreamer::new(settings, show_text, sink));
        let generation = Generation::Speak(streamer.clone());
        let text = text.to_string();
        let run = async move { streamer.stream(crate::streamer::TextSource::Literal(text)).await };
        self.execute(&character.name, generation, None, run).await
    }

    /// Run an LLM-backed chat generation on a character's overlays.
    #[allow(clippy::too_many_arguments)]
    pub async fn chat(
        &self,
        character: &crate::models::Character,
        message: &str,
        show_text: bool,
        chat_context: Option<String>,
        images: Vec<crate::models::ImageAttachment>,
        history: Vec<serde_json::Value>,
        llm: crate::llm::OpenRouterClient,
    ) -> Result<GenerationOutcome> {
        let ai = character
            .ai
            .clone()
            .ok_or_else(|| anyhow::anyhow!("character '{}' has no AI settings", character.name))?;
        let settings =
            crate::tts::TtsSettings::from_value(character.tts_provider, &character.tts_settings)?;
        let sink = Arc::new(OverlaySink::new(
            self.registry.clone(),
            character.name.clone(),
            character.text_style.clone(),
        ));
        let streamer = Arc::new(TtsStreamer::new(settings, show_text, sink));
        let config = crate::chat_pipeline::ChatPipelineConfig {
            system_prompt: ai.system_prompt,
            model: ai.model,
            provider_order: ai.provider_order,
            temperature: ai.temperature,
            max_tokens: ai.max_tokens,
            twitch_chat_context: chat_context,
            history,
            images,
        };
        let pipeline = Arc::new(ChatPipeline::new(config, streamer, llm));
        let generation = Generation::Chat(pipeline.clone());
        let memory_ctx = MemoryCtx {
            enabled: character.memory.enabled,
            persist: character.memory.persist,
        };
        let message = message.to_string();
        let run = async move { pipeline.run(&message).await };
        self.execute(&character.name, generation, Some(memory_ctx), run)
            .await
    }
}

/// `StreamSink` wired to the connection registry for one character.
pub struct OverlaySink {
    registry: Arc<ConnectionRegistry>,
    character: String,
    typography: TextStyle,
}

impl OverlaySink {
    pub fn new(registry: Arc<ConnectionRegistry>, character: String, typography: TextStyle) -> Self {
        Self {
            registry,
            character,
            typography,
        }
    }

    fn disconnected(&self) -> anyhow::Error {
        anyhow::anyhow!("no connected overlays for character '{}'", self.character)
    }
}

#[async_trait]
impl StreamSink for OverlaySink {
    async fn text_start(&self) -> Result<()> {
        let delivered = self
            .registry
            .send_json(
                &self.character,
                &OverlayCommand::TextStreamStart {
                    typography: self.typography.clone(),
                    instant_reveal: None,
                },
            )
            .await;
        if !delivered {
            return Err(self.disconnected());
        }
        Ok(())
    }

    async fn text_end(&self) -> Result<()> {
        self.registry
            .send_json(&self.character, &OverlayCommand::TextStreamEnd)
            .await;
        Ok(())
    }

    async fn audio_start(&self) -> Result<()> {
        let delivered = self
            .registry
            .send_json(
                &self.character,
                &OverlayCommand::StreamStart {
                    sample_rate: crate::config::SAMPLE_RATE,
                    channels: crate::config::CHANNELS,
                    format: crate::protocol::STREAM_FORMAT.to_string(),
                },
            )
            .await;
        if !delivered {
            return Err(self.disconnected());
        }
        self.registry
            .set_channel_state(&self.character, |s| s.streaming = true)
            .await;
        Ok(())
    }

    async fn audio_chunk(&self, audio: Vec<u8>) -> Result<()> {
        if !self.registry.send_bytes(&self.character, audio).await {
            return Err(self.disconnected());
        }
        Ok(())
    }

    async fn audio_end(&self) -> Result<()> {
        // The streaming flag stays set until the overlay reports
        // stream_ended/stream_stopped; the server does not know when
        // playback finishes.
        self.registry
            .send_json(&self.character, &OverlayCommand::StreamEnd)
            .await;
        Ok(())
    }

    async fn word_timing(&self, words: &[WordTiming]) -> Result<()> {
        let delivered = self
            .registry
            .send_json(
                &self.character,
                &OverlayCommand::WordTiming {
                    words: words.to_vec(),
                },
            )
            .await;
        if !delivered {
            return Err(self.disconnected());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::streamer::TextSource;
    use crate::tts::{TtsProvider, TtsSettings};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        frames: AtomicUsize,
    }

    #[async_trait]
    impl StreamSink for CountingSink {
        async fn text_start(&self) -> Result<()> {
            self.frames.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn text_end(&self) -> Result<()> {
            Ok(())
        }
        async fn audio_start(&self) -> Result<()> {
            Ok(())
        }
        async fn audio_chunk(&self, _audio: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn audio_end(&self) -> Result<()> {
            Ok(())
        }
        async fn word_timing(&self, _words: &[WordTiming]) -> Result<()> {
            Ok(())
        }
    }

    async fn coordinator() -> GenerationCoordinator {
        let registry = Arc::new(ConnectionRegistry::new());
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let memory = Arc::new(ConversationMemory::new(db));
        GenerationCoordinator::new(registry, memory)
    }

    fn streamer() -> Arc<TtsStreamer> {
        let settings = TtsSettings::from_value(
            TtsProvider::ElevenLabs,
            &serde_json::json!({"voice_id": "v1"}),
        )
        .unwrap();
        Arc::new(TtsStreamer::new(
            settings,
            false,
            Arc::new(CountingSink {
                frames: AtomicUsize::new(0),
            }),
        ))
    }

    #[tokio::test]
    async fn test_execute_records_normal_memory() {
        let coordinator = coordinator().await;
        let generation = Generation::Speak(streamer());
        let outcome = coordinator
            .execute(
                "alice",
                generation,
                Some(MemoryCtx {
                    enabled: true,
                    persist: false,
                }),
                async { Ok("Hello there.".to_string()) },
            )
            .await
            .unwrap();

        assert!(!outcome.interrupted);
        assert_eq!(outcome.text, "Hello there.");
        let entries = coordinator.memory.get("alice").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].role, Role::Assistant);
        assert!(!entries[0].interrupted);
    }

    #[tokio::test]
    async fn test_active_cleared_after_execute() {
        let coordinator = coordinator().await;
        let generation = Generation::Speak(streamer());
        coordinator
            .execute("alice", generation, None, async { Ok(String::new()) })
            .await
            .unwrap();
        assert!(!coordinator.has_active("alice"));
    }

    #[tokio::test]
    async fn test_error_path_clears_pending_and_active() {
        let coordinator = coordinator().await;
        let generation = Generation::Speak(streamer());
        let result = coordinator
            .execute("alice", generation, None, async {
                Err(anyhow::anyhow!("upstream exploded"))
            })
            .await;
        assert!(result.is_err());
        assert!(!coordinator.has_active("alice"));
    }

    #[tokio::test]
    async fn test_stop_without_active() {
        let coordinator = coordinator().await;
        let (was_active, spoken) = coordinator.stop("alice").await;
        assert!(!was_active);
        assert!(spoken.is_none());
    }

    #[tokio::test]
    async fn test_interrupted_memory_and_reconciliation() {
        let coordinator = coordinator().await;
        let s = streamer();
        let generation = Generation::Speak(s.clone());

        // Simulate a generation that was cancelled mid-run
        s.cancel().await;
        let outcome = coordinator
            .execute(
                "bob",
                generation,
                Some(MemoryCtx {
                    enabled: true,
                    persist: false,
                }),
                async {
                    Ok("One two three four five six seven eight nine ten".to_string())
                },
            )
            .await
            .unwrap();
        assert!(outcome.interrupted);

        let entries = coordinator.memory.get("bob").await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].interrupted);
        assert_eq!(
            entries[0].generated_text.as_deref(),
            Some("One two three four five six seven eight nine ten")
        );

        // Overlay reports what was actually heard
        coordinator
            .resolve_stream_stopped("bob", "One two three")
            .await;
        let entries = coordinator.memory.get("bob").await;
        assert_eq!(
            entries[0].content,
            serde_json::Value::String("One two three".into())
        );

        // Reconciliation is consumed; a second report is a no-op
        coordinator.resolve_stream_stopped("bob", "unrelated").await;
        let entries = coordinator.memory.get("bob").await;
        assert_eq!(
            entries[0].content,
            serde_json::Value::String("One two three".into())
        );
    }

    #[tokio::test]
    async fn test_preemption_cancels_incumbent() {
        let coordinator = Arc::new(coordinator().await);
        let first = streamer();
        let first_gen = Generation::Speak(first.clone());

        let coord = coordinator.clone();
        let first_streamer = first.clone();
        let first_task = tokio::spawn(async move {
            coord
                .execute("dave", first_gen, None, async move {
                    // Runs until cancelled by the preemptor
                    let mut waited = 0u64;
                    while !first_streamer.is_cancelled() && waited < 5000 {
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        waited += 10;
                    }
                    Ok("partial output".to_string())
                })
                .await
        });

        // Give the first generation time to install itself
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(coordinator.has_active("dave"));

        let second = Generation::Speak(streamer());
        let outcome = coordinator
            .execute("dave", second, None, async { Ok("Short.".to_string()) })
            .await
            .unwrap();
        assert!(!outcome.interrupted);

        let first_outcome = first_task.await.unwrap().unwrap();
        assert!(first_outcome.interrupted);
        assert!(!coordinator.has_active("dave"));
    }

    #[tokio::test]
    async fn test_stop_cancels_incumbent() {
        let coordinator = Arc::new(coordinator().await);
        let s = streamer();
        let generation = Generation::Speak(s.clone());

        let coord = coordinator.clone();
        let streamer_handle = s.clone();
        let task = tokio::spawn(async move {
            coord
                .execute("erin", generation, None, async move {
                    let mut waited = 0u64;
                    while !streamer_handle.is_cancelled() && waited < 5000 {
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        waited += 10;
                    }
                    Ok("cut short".to_string())
                })
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let (was_active, spoken) = coordinator.stop("erin").await;
        assert!(was_active);
        assert!(spoken.is_some());

        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.interrupted);
    }
}
