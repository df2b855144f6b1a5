//! Conversation memory
//!
//! Two-tier store keyed by character name: an in-memory list always, plus
//! durable rows for characters configured to persist across restarts. Every
//! mutation updates the in-memory copy and then the durable copy before
//! returning, so the tiers agree after every successful call.
//!
//! The interrupted-message lifecycle lives here: an interrupted assistant
//! entry stores the spoken-text estimate as `content` and the full model
//! output as `generated_text`; the coordinator later rewrites `content`
//! with the overlay-authoritative string.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::db::Database;

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Context,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Context => "context",
        }
    }

    pub fn parse(raw: &str) -> Option<Role> {
        match raw {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "context" => Some(Role::Context),
            _ => None,
        }
    }
}

/// One ordered conversation entry.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub role: Role,
    /// Plain string, or a JSON array of content parts for multimodal turns
    pub content: Value,
    pub interrupted: bool,
    /// Full model output at cancellation time; non-null iff interrupted
    pub generated_text: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub db_id: Option<i64>,
}

impl StoredMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Value::String(content.into()),
            interrupted: false,
            generated_text: None,
            created_at: Utc::now(),
            db_id: None,
        }
    }

    /// Content as it is stored durably: structured parts serialize to a
    /// JSON-encoded array string.
    fn content_for_db(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn content_as_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Decode stored content: strings beginning with `[` are tried for JSON
/// structured parts, falling back to the literal string on parse failure.
pub fn decode_content(raw: &str) -> Value {
    if raw.starts_with('[') {
        if let Ok(parsed @ Value::Array(_)) = serde_json::from_str::<Value>(raw) {
            return parsed;
        }
    }
    Value::String(raw.to_string())
}

/// Two-tier conversation memory.
pub struct ConversationMemory {
    entries: Mutex<HashMap<String, Vec<StoredMessage>>>,
    db: Arc<Database>,
}

impl ConversationMemory {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            db,
        }
    }

    /// Load all persistent characters' messages into the in-memory tier,
    /// in created-at order. Called once at startup.
    pub async fn load_persisted(&self) -> Result<()> {
        let rows = self
            .db
            .load_persistent_messages()
            .await
            .context("failed to load persistent memory")?;
        let mut entries = self.entries.lock().await;
        let mut count = 0usize;
        for (character, id, role, content, interrupted, generated_text, created_at) in rows {
            let Some(role) = Role::parse(&role) else {
                continue;
            };
            entries.entry(character).or_default().push(StoredMessage {
                role,
                content: decode_content(&content),
                interrupted,
                generated_text,
                created_at,
                db_id: Some(id),
            });
            count += 1;
        }
        if count > 0 {
            info!("Loaded {} persisted conversation messages", count);
        }
        Ok(())
    }

    /// Append an entry. Returns the entry's index in the character's list
    /// and its durable row id when persisted.
    pub async fn append(
        &self,
        character: &str,
        mut message: StoredMessage,
        persist: bool,
    ) -> Result<(usize, Option<i64>)> {
        let mut entries = self.entries.lock().await;

        let db_id = if persist {
            let id = self
                .db
                .insert_message(
                    character,
                    message.role.as_str(),
                    &message.content_for_db(),
                    message.interrupted,
                    message.generated_text.as_deref(),
                    message.created_at,
                )
                .await
                .context("failed to persist message")?;
            Some(id)
        } else {
            None
        };

        message.db_id = db_id;
        let list = entries.entry(character.to_string()).or_default();
        list.push(message);
        Ok((list.len() - 1, db_id))
    }

    /// Rewrite the content of an existing entry (interrupted-message
    /// reconciliation), in both tiers.
    pub async fn update_content(
        &self,
        character: &str,
        index: usize,
        content: String,
    ) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let db_id = match entries.get_mut(character).and_then(|l| l.get_mut(index)) {
            Some(entry) => {
                entry.content = Value::String(content.clone());
                entry.db_id
            }
            None => return Ok(()),
        };
        if let Some(id) = db_id {
            self.db
                .update_message_content(id, &content)
                .await
                .context("failed to persist content update")?;
        }
        Ok(())
    }

    /// Delete both tiers for a character.
    pub async fn clear(&self, character: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.remove(character);
        self.db
            .delete_messages(character)
            .await
            .context("failed to clear persisted messages")?;
        Ok(())
    }

    /// Snapshot of a character's entries.
    pub async fn get(&self, character: &str) -> Vec<StoredMessage> {
        self.entries
            .lock()
            .await
            .get(character)
            .cloned()
            .unwrap_or_default()
    }

    /// Reconstruct history for an LLM request: user/assistant entries pass
    /// through verbatim; `context` entries re-project as user messages so
    /// the model perceives prior chat context without mistaking it for
    /// prior turns.
    pub async fn history_for_llm(&self, character: &str) -> Vec<Value> {
        let entries = self.entries.lock().await;
        let Some(list) = entries.get(character) else {
            return Vec::new();
        };
        list.iter()
            .map(|entry| match entry.role {
                Role::User | Role::Assistant => serde_json::json!({
                    "role": entry.role.as_str(),
                    "content": entry.content,
                }),
                Role::Context => serde_json::json!({
                    "role": "user",
                    "content": format!(
                        "[Twitch chat at the time]:\n{}",
                        entry.content_as_text()
                    ),
                }),
            })
            .collect()
    }
}
