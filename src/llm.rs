//! OpenRouter LLM client with streaming support
//!
//! Two entry points:
//! - `stream_chat` — SSE token stream for the speak-as-you-generate pipeline
//! - `complete_structured` — non-streaming call with a JSON-schema response
//!   format, used by the wish session
//!
//! Transient failures (429, 5xx, network errors, provider-tagged rate-limit
//! codes) are retried with exponential backoff starting at 1s, 3 attempts.

use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Overall timeout for one LLM request, streaming included.
pub const LLM_TIMEOUT: Duration = Duration::from_secs(120);

/// Retry budget for transient upstream failures.
const MAX_ATTEMPTS: u32 = 3;

/// Error from the OpenRouter API.
#[derive(Debug, thiserror::Error)]
pub enum OpenRouterError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("stream error: {0}")]
    Stream(String),
    #[error("OPENROUTER_API_KEY environment variable not set")]
    MissingKey,
}

impl OpenRouterError {
    /// Whether the error class is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            OpenRouterError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() && !e.is_builder()
            }
            OpenRouterError::Api { status, .. } => *status == 429 || *status >= 500,
            OpenRouterError::Stream(_) => false,
            OpenRouterError::MissingKey => false,
        }
    }
}

/// Token usage captured from the terminal stream event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    #[serde(default)]
    pub cost: Option<f64>,
}

/// Parameters for a chat completion.
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub model: String,
    pub messages: Vec<Value>,
    /// Provider routing order; fallbacks are disabled when present
    pub provider_order: Option<Vec<String>>,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatCompletionBody {
    model: String,
    messages: Vec<Value>,
    stream: bool,
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

/// A lazy, finite, non-restartable sequence of content fragments.
///
/// After the stream ends, `usage()` exposes the usage record captured from
/// the terminal event (if the provider sent one).
pub struct TokenStream {
    rx: mpsc::Receiver<Result<String, OpenRouterError>>,
    usage: Arc<Mutex<Option<Usage>>>,
}

impl TokenStream {
    /// Next content fragment, or `None` when the stream is exhausted.
    pub async fn next_token(&mut self) -> Option<Result<String, OpenRouterError>> {
        self.rx.recv().await
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage.lock().ok().and_then(|u| u.clone())
    }

    /// Shared handle for reading usage after the stream is consumed elsewhere.
    pub fn usage_handle(&self) -> Arc<Mutex<Option<Usage>>> {
        self.usage.clone()
    }
}

/// Async client for the OpenRouter API.
#[derive(Clone)]
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
}

impl OpenRouterClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .timeout(LLM_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, api_key }
    }

    pub fn from_env() -> Result<Self, OpenRouterError> {
        let api_key = crate::config::openrouter_api_key()
            .map_err(|_| OpenRouterError::MissingKey)?;
        Ok(Self::new(api_key))
    }

    fn provider_value(order: &Option<Vec<String>>) -> Option<Value> {
        order.as_ref().map(|order| {
            serde_json::json!({
                "order": order,
                "allow_fallbacks": false,
            })
        })
    }

    async fn post_completion(&self, body: &ChatCompletionBody) -> Result<reqwest::Response, OpenRouterError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .post(format!("{}/chat/completions", OPENROUTER_BASE_URL))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(body)
                .send()
                .await;

            let error = match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let message = response.text().await.unwrap_or_default();
                    OpenRouterError::Api { status, message }
                }
                Err(e) => OpenRouterError::Http(e),
            };

            if attempt >= MAX_ATTEMPTS || !error.is_transient() {
                return Err(error);
            }

            let delay = Duration::from_secs(1 << (attempt - 1));
            warn!(
                "OpenRouter request failed (attempt {}/{}), retrying in {:?}: {}",
                attempt, MAX_ATTEMPTS, delay, error
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Stream chat completion tokens.
    ///
    /// The returned stream yields content fragments; keep-alive comments are
    /// discarded and the `[DONE]` sentinel closes the sequence cleanly.
    pub async fn stream_chat(&self, params: ChatParams) -> Result<TokenStream, OpenRouterError> {
        let body = ChatCompletionBody {
            model: params.model.clone(),
            messages: params.messages,
            stream: true,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            provider: Self::provider_value(&params.provider_order),
            usage: Some(serde_json::json!({"include": true})),
            response_format: None,
        };

        let response = self.post_completion(&body).await?;
        debug!("LLM stream open - model={}", params.model);

        let (tx, rx) = mpsc::channel::<Result<String, OpenRouterError>>(64);
        let usage: Arc<Mutex<Option<Usage>>> = Arc::new(Mutex::new(None));
        let usage_slot = usage.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            'outer: while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(OpenRouterError::Http(e))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are separated by a blank line
                while let Some(pos) = buffer.find("\n\n") {
                    let event = buffer[..pos].to_string();
                    buffer.drain(..pos + 2);

                    for line in event.lines() {
                        // OpenRouter keep-alive comments
                        if line.starts_with(':') {
                            continue;
                        }
                        let data = match line.strip_prefix("data: ") {
                            Some(d) => d,
                            None => continue,
                        };
                        if data == "[DONE]" {
                            break 'outer;
                        }

                        let parsed: StreamResponse = match serde_json::from_str(data) {
                            Ok(p) => p,
                            Err(_) => continue,
                        };

                        if let Some(err) = parsed.error {
                            let tagged_transient = matches!(err.code, Some(429) | Some(502) | Some(503));
                            let status = if tagged_transient { 503 } else { 400 };
                            let _ = tx
                                .send(Err(OpenRouterError::Api {
                                    status,
                                    message: err.message,
                                }))
                                .await;
                            return;
                        }

                        if let Some(u) = parsed.usage {
                            if let Ok(mut slot) = usage_slot.lock() {
                                *slot = Some(u);
                            }
                        }

                        if let Some(choice) = parsed.choices.first() {
                            if let Some(content) = &choice.delta.content {
                                if !content.is_empty() && tx.send(Ok(content.clone())).await.is_err() {
                                    // Consumer dropped the stream
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(TokenStream { rx, usage })
    }

    /// Non-streaming completion with a JSON-schema response format.
    ///
    /// Returns the raw assistant content string for the caller to parse.
    pub async fn complete_structured(
        &self,
        params: ChatParams,
        response_schema: Value,
    ) -> Result<String, OpenRouterError> {
        let body = ChatCompletionBody {
            model: params.model.clone(),
            messages: params.messages,
            stream: false,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            provider: Self::provider_value(&params.provider_order),
            usage: None,
            response_format: Some(response_schema),
        };

        let response = self.post_completion(&body).await?;
        let raw: Value = response.json().await?;

        if let Some(err) = raw.get("error") {
            return Err(OpenRouterError::Api {
                status: 400,
                message: err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        let content = raw
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"));

        match content {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Array(parts)) => Ok(parts
                .iter()
                .filter_map(|part| {
                    if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                        part.get("text").and_then(|t| t.as_str()).map(str::to_string)
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
                .join("")),
            _ => Err(OpenRouterError::Stream("no content in response".to_string())),
        }
    }
}

/// Short model name for log lines: "anthropic/claude-sonnet-4.5" -> "claude-sonnet-4.5".
pub fn model_short_name(model: &str) -> &str {
    model.rsplit('/').next().unwrap_or(model)
}
