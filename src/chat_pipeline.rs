//! Chat pipeline orchestrating LLM streaming -> TTS -> overlay
//!
//! Builds the LLM message array (system prompt, optional live-chat context,
//! conversation history, final user message with optional inline images),
//! then forwards the token stream into a `TtsStreamer`.

use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::llm::{model_short_name, ChatParams, OpenRouterClient, Usage};
use crate::models::ImageAttachment;
use crate::streamer::{TextSource, TtsStreamer};

/// LLM configuration for one chat generation.
#[derive(Debug, Clone)]
pub struct ChatPipelineConfig {
    pub system_prompt: String,
    pub model: String,
    pub provider_order: Option<Vec<String>>,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Recent live chat to inject into the system prompt
    pub twitch_chat_context: Option<String>,
    /// Past messages for memory, verbatim `{role, content}` objects
    pub history: Vec<Value>,
    /// Inline images for vision models
    pub images: Vec<ImageAttachment>,
}

/// Orchestrates one LLM-backed generation through a TTS streamer.
pub struct ChatPipeline {
    config: ChatPipelineConfig,
    streamer: Arc<TtsStreamer>,
    llm: OpenRouterClient,
    cancelled: Arc<AtomicBool>,
}

impl ChatPipeline {
    pub fn new(config: ChatPipelineConfig, streamer: Arc<TtsStreamer>, llm: OpenRouterClient) -> Self {
        Self {
            config,
            streamer,
            llm,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build the messages array for the LLM request.
    pub fn build_messages(&self, user_message: &str) -> Vec<Value> {
        let system_content = match self
            .config
            .twitch_chat_context
            .as_deref()
            .filter(|c| !c.is_empty())
        {
            Some(context) => format!(
                "{}\n\n---\nRecent Twitch chat (you can see what viewers are saying):\n{}",
                self.config.system_prompt, context
            ),
            None => self.config.system_prompt.clone(),
        };

        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": system_content,
        })];
        messages.extend(self.config.history.iter().cloned());

        if self.config.images.is_empty() {
            messages.push(serde_json::json!({
                "role": "user",
                "content": user_message,
            }));
        } else {
            let mut parts = vec![serde_json::json!({"type": "text", "text": user_message})];
            for image in &self.config.images {
                parts.push(serde_json::json!({
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:{};base64,{}", image.media_type, image.data),
                    },
                }));
            }
            messages.push(serde_json::json!({"role": "user", "content": parts}));
        }

        messages
    }

    /// Execute the full pipeline. Returns the complete LLM response text
    /// (what was sent into TTS, not necessarily what was heard).
    pub async fn run(&self, user_message: &str) -> Result<String> {
        let start = Instant::now();
        let preview: String = user_message.chars().take(40).collect();
        debug!(
            "Pipeline starting - model={} message=\"{}\"",
            self.config.model, preview
        );

        let messages = self.build_messages(user_message);
        let mut token_stream = self
            .llm
            .stream_chat(ChatParams {
                model: self.config.model.clone(),
                messages,
                provider_order: self.config.provider_order.clone(),
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
            })
            .await
            .context("LLM request failed")?;
        let usage_handle = token_stream.usage_handle();

        // Forward tokens into the streamer, stopping on the cancel flag
        let (tx, rx) = mpsc::channel::<String>(64);
        let cancelled = self.cancelled.clone();
        let forwarder = tokio::spawn(async move {
            let mut failure: Option<anyhow::Error> = None;
            while let Some(item) = token_stream.next_token().await {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                match item {
                    Ok(token) => {
                        if tx.send(token).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        failure = Some(e.into());
                        break;
                    }
                }
            }
            failure
        });

        let result = self.streamer.stream(TextSource::Tokens(rx)).await;
        let llm_failure = forwarder.await.ok().flatten();

        let elapsed = start.elapsed().as_secs_f64();
        let model_short = model_short_name(&self.config.model);
        let usage: Option<Usage> = usage_handle.lock().ok().and_then(|u| u.clone());

        match &result {
            Ok(text) => match usage {
                Some(usage) => {
                    let cost = usage
                        .cost
                        .map(|c| format!("${:.4}", c))
                        .unwrap_or_else(|| "?".to_string());
                    if self.is_cancelled() {
                        info!(
                            "LLM cancelled - {} - {}+{} tokens - {}",
                            model_short, usage.prompt_tokens, usage.completion_tokens, cost
                        );
                    } else {
                        info!(
                            "LLM complete - {} - {}+{} tokens - {} in {:.2}s",
                            model_short,
                            usage.prompt_tokens,
                            usage.completion_tokens,
                            cost,
                            elapsed
                        );
                    }
                }
                None => {
                    if self.is_cancelled() {
                        info!("LLM cancelled - {}", model_short);
                    } else {
                        info!(
                            "LLM complete - {} - {} chars in {:.2}s",
                            model_short,
                            text.len(),
                            elapsed
                        );
                    }
                }
            },
            Err(_) => {}
        }

        // A mid-stream LLM failure outranks a clean-looking streamer result
        if let Some(e) = llm_failure {
            if !self.is_cancelled() {
                return Err(e).context("LLM stream failed");
            }
        }

        result
    }

    /// Cancel the pipeline: stops LLM token forwarding and the TTS stream.
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.streamer.cancel().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.streamer.is_cancelled()
    }

    pub fn get_spoken_text(&self) -> String {
        self.streamer.get_spoken_text()
    }
}
