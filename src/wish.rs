//! Wish-session state machine
//!
//! A channel point redemption opens a turn-based conversation gated by a
//! structured-output model: each turn the model returns `{speech, action}`;
//! `speech` is spoken through the character pipeline, `action` drives the
//! state machine (`ask_followup`, `await_chat`, `grant`, `deny`).
//!
//! At most one wish session is active globally. All session speech
//! serializes through a single speech lock; after each utterance the lock
//! is held for a conservative duration estimate because the speak call
//! returns before playback finishes.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::llm::{ChatParams, OpenRouterClient};
use crate::registry::ConnectionRegistry;
use crate::twitch::{ChatBuffer, ChatMessageEvent, RedemptionEvent};

pub const DEFAULT_MAX_FOLLOWUPS: u32 = 2;
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DEBOUNCE_SECS: u64 = 4;
pub const DEFAULT_CHAT_VOTE_SECS: u64 = 15;
/// Extra slack added to the vote window when snapshotting the chat buffer.
pub const CHAT_VOTE_COLLECT_SLACK_SECS: u32 = 5;
/// Verdict prompts include at most this many chat messages.
pub const MAX_VOTE_MESSAGES: usize = 20;

const DEFAULT_SYSTEM_PROMPT: &str = "You are Santa's mall director, taking wishes from stream \
viewers. Stay jolly and brief: two or three sentences per reply. Every reply must be a JSON \
object with a \"speech\" field (what you say out loud) and an \"action\" field: \"ask_followup\" \
to ask the wisher one clarifying question, \"await_chat\" to let the chat react before you \
decide, \"grant\" to grant the wish, or \"deny\" to deny it.";

const TIMEOUT_FAREWELL: &str =
    "Looks like our wisher wandered off into the snow. Come back and make another wish anytime!";

const ERROR_APOLOGY: &str =
    "Ho ho... my magic snow globe has fogged up. Let's try this wish again a little later.";

/// Wish-session configuration (stored as the `wish_config` DB singleton).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WishConfig {
    /// Character whose overlays speak the session
    pub character: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_followups")]
    pub max_followups: u32,
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_debounce")]
    pub debounce_secs: u64,
    #[serde(default = "default_chat_vote")]
    pub chat_vote_secs: u64,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4.5".to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_max_followups() -> u32 {
    DEFAULT_MAX_FOLLOWUPS
}

fn default_response_timeout() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT_SECS
}

fn default_debounce() -> u64 {
    DEFAULT_DEBOUNCE_SECS
}

fn default_chat_vote() -> u64 {
    DEFAULT_CHAT_VOTE_SECS
}

impl Default for WishConfig {
    fn default() -> Self {
        Self {
            character: None,
            model: default_model(),
            system_prompt: default_system_prompt(),
            max_followups: default_max_followups(),
            response_timeout_secs: default_response_timeout(),
            debounce_secs: default_debounce(),
            chat_vote_secs: default_chat_vote(),
        }
    }
}

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WishState {
    Idle,
    Processing,
    AskFollowup,
    AwaitChat,
    Complete,
}

/// Terminal outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WishOutcome {
    Grant,
    Deny,
    Timeout,
    Cancelled,
    Error,
}

impl WishOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WishOutcome::Grant => "grant",
            WishOutcome::Deny => "deny",
            WishOutcome::Timeout => "timeout",
            WishOutcome::Cancelled => "cancelled",
            WishOutcome::Error => "error",
        }
    }
}

/// The redeeming viewer.
#[derive(Debug, Clone, Serialize)]
pub struct Redeemer {
    pub id: String,
    pub login: String,
    pub display_name: String,
}

/// One conversation turn in the session record.
#[derive(Debug, Clone, Serialize)]
pub struct WishTurn {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed_speech: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed_action: Option<String>,
}

/// Model action for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WishAction {
    AskFollowup,
    AwaitChat,
    Grant,
    Deny,
}

impl WishAction {
    /// Unknown action strings are treated as `await_chat`.
    pub fn parse(raw: &str) -> WishAction {
        match raw {
            "ask_followup" => WishAction::AskFollowup,
            "grant" => WishAction::Grant,
            "deny" => WishAction::Deny,
            _ => WishAction::AwaitChat,
        }
    }
}

/// Dashboard overrides injected into a running session.
#[derive(Debug, Clone)]
pub enum WishOverride {
    ForceVerdict { grant: bool },
    DirectMessage(String),
    Cancel,
}

/// Speaks session utterances through the character pipeline. In-process
/// seam into the generation coordinator.
#[async_trait]
pub trait WishSpeaker: Send + Sync {
    async fn speak(&self, text: &str) -> Result<()>;
}

/// Structured-output model seam (scripted in tests).
#[async_trait]
pub trait WishModel: Send + Sync {
    async fn complete(&self, messages: Vec<Value>, response_format: Value) -> Result<String>;
}

/// `WishModel` backed by OpenRouter.
pub struct OpenRouterWishModel {
    pub client: OpenRouterClient,
    pub model: String,
}

#[async_trait]
impl WishModel for OpenRouterWishModel {
    async fn complete(&self, messages: Vec<Value>, response_format: Value) -> Result<String> {
        Ok(self
            .client
            .complete_structured(
                ChatParams {
                    model: self.model.clone(),
                    messages,
                    provider_order: None,
                    temperature: 0.8,
                    max_tokens: 512,
                },
                response_format,
            )
            .await?)
    }
}

/// JSON-schema response format requiring `{speech, action}`.
pub fn turn_response_format() -> Value {
    serde_json::json!({
        "type": "json_schema",
        "json_schema": {
            "name": "wish_turn",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "speech": {"type": "string"},
                    "action": {
                        "type": "string",
                        "enum": ["ask_followup", "await_chat", "grant", "deny"],
                    },
                },
                "required": ["speech", "action"],
                "additionalProperties": false,
            },
        },
    })
}

/// Parse the model's turn output, tolerating prose around the JSON object.
pub fn parse_turn(raw: &str) -> Option<(String, WishAction)> {
    let parsed: Option<Value> = serde_json::from_str(raw).ok().or_else(|| {
        // The model sometimes wraps the object in prose; fish it out
        let re = Regex::new(r"\{[\s\S]*\}").ok()?;
        let found = re.find(raw)?;
        serde_json::from_str(found.as_str()).ok()
    });
    let parsed = parsed?;
    let speech = parsed.get("speech")?.as_str()?.to_string();
    let action = parsed
        .get("action")
        .and_then(Value::as_str)
        .map(WishAction::parse)
        .unwrap_or(WishAction::AwaitChat);
    Some((speech, action))
}

/// Initial user turn: the wish, plus a returning-visitor block when the
/// redeemer has prior archived sessions.
pub fn build_initial_turn(wish_text: &str, prior: &[(String, String)]) -> String {
    if prior.is_empty() {
        return wish_text.to_string();
    }
    let mut lines = vec![format!(
        "{}\n\n[Returning visitor] This viewer has wished before:",
        wish_text
    )];
    for (wish, outcome) in prior {
        lines.push(format!("- \"{}\" ({})", wish, outcome));
    }
    lines.join("\n")
}

/// Verdict prompt built from the chat-vote window.
pub fn build_verdict_prompt(messages: &[crate::twitch::StoredChatMessage]) -> String {
    if messages.is_empty() {
        return "The elves are silent - nobody in chat reacted during the vote window. \
                Make the call yourself: respond with action \"grant\" or \"deny\"."
            .to_string();
    }
    let formatted = ChatBuffer::format_for_prompt(messages, MAX_VOTE_MESSAGES);
    format!(
        "Chat has voted. Here is what they said:\n{}\n\nBased on chat's reaction, decide now: \
         respond with action \"grant\" or \"deny\".",
        formatted
    )
}

/// Snapshot of the session for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct WishStatus {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeemer_display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wish_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<WishState>,
    pub followup_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WishOutcome>,
}

impl WishStatus {
    fn inactive() -> Self {
        Self {
            active: false,
            session_id: None,
            redeemer_display_name: None,
            wish_text: None,
            state: None,
            followup_count: 0,
            outcome: None,
        }
    }
}

struct SessionShared {
    session_id: String,
    redeemer: Redeemer,
    wish_text: String,
    state: WishState,
    followup_count: u32,
    outcome: Option<WishOutcome>,
    conversation: Vec<WishTurn>,
}

struct ActiveWish {
    shared: Arc<Mutex<SessionShared>>,
    chat_tx: mpsc::UnboundedSender<ChatMessageEvent>,
    override_tx: mpsc::UnboundedSender<WishOverride>,
    task: JoinHandle<()>,
}

/// Global single-occupancy wish-session manager.
pub struct WishSessionManager {
    active: tokio::sync::Mutex<Option<ActiveWish>>,
    speech_lock: Arc<tokio::sync::Mutex<()>>,
    model: Arc<dyn WishModel>,
    speaker: Arc<dyn WishSpeaker>,
    db: Arc<Database>,
    registry: Arc<ConnectionRegistry>,
    chat_buffer: Arc<ChatBuffer>,
}

impl WishSessionManager {
    pub fn new(
        model: Arc<dyn WishModel>,
        speaker: Arc<dyn WishSpeaker>,
        db: Arc<Database>,
        registry: Arc<ConnectionRegistry>,
        chat_buffer: Arc<ChatBuffer>,
    ) -> Self {
        Self {
            active: tokio::sync::Mutex::new(None),
            speech_lock: Arc::new(tokio::sync::Mutex::new(())),
            model,
            speaker,
            db,
            registry,
            chat_buffer,
        }
    }

    /// Current wish config from the DB singleton, defaulted when unset.
    pub async fn config(&self) -> WishConfig {
        match self.db.get_wish_config().await {
            Ok(Some(raw)) => serde_json::from_value(raw).unwrap_or_default(),
            _ => WishConfig::default(),
        }
    }

    /// Start a session for a redemption. Rejects when one is active.
    pub async fn start_session(&self, redemption: &RedemptionEvent) -> Result<bool> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.as_ref() {
            if !existing.task.is_finished() {
                info!(
                    "Wish session rejected - another is active for {}",
                    redemption.user_display_name
                );
                return Ok(false);
            }
        }

        let config = self.config().await;
        let redeemer = Redeemer {
            id: redemption.user_id.clone(),
            login: redemption.user_login.clone(),
            display_name: redemption.user_display_name.clone(),
        };
        let wish_text = redemption
            .user_input
            .clone()
            .unwrap_or_else(|| "(no wish text provided)".to_string());

        let shared = Arc::new(Mutex::new(SessionShared {
            session_id: Uuid::new_v4().to_string(),
            redeemer: redeemer.clone(),
            wish_text: wish_text.clone(),
            state: WishState::Idle,
            followup_count: 0,
            outcome: None,
            conversation: Vec::new(),
        }));

        let prior = self
            .db
            .recent_wishes_for_user(&redeemer.id, 3)
            .await
            .unwrap_or_default();
        let initial = build_initial_turn(&wish_text, &prior);

        let (chat_tx, chat_rx) = mpsc::unbounded_channel();
        let (override_tx, override_rx) = mpsc::unbounded_channel();

        let ctx = SessionCtx {
            config,
            shared: shared.clone(),
            model: self.model.clone(),
            speaker: self.speaker.clone(),
            speech_lock: self.speech_lock.clone(),
            db: self.db.clone(),
            registry: self.registry.clone(),
            chat_buffer: self.chat_buffer.clone(),
        };
        info!(
            "Wish session started - {} wishes: \"{}\"",
            redeemer.display_name, wish_text
        );
        let task = tokio::spawn(run_session(ctx, initial, chat_rx, override_rx));

        *active = Some(ActiveWish {
            shared,
            chat_tx,
            override_tx,
            task,
        });
        Ok(true)
    }

    /// Feed an inbound chat message to the running session (if any).
    pub async fn handle_chat_message(&self, message: ChatMessageEvent) {
        let active = self.active.lock().await;
        if let Some(session) = active.as_ref() {
            if !session.task.is_finished() {
                let _ = session.chat_tx.send(message);
            }
        }
    }

    async fn send_override(&self, value: WishOverride) -> bool {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(session) if !session.task.is_finished() => {
                session.override_tx.send(value).is_ok()
            }
            _ => false,
        }
    }

    /// Force a grant/deny verdict from the dashboard.
    pub async fn force_verdict(&self, grant: bool) -> bool {
        self.send_override(WishOverride::ForceVerdict { grant }).await
    }

    /// Speak a direct dashboard message through the session's speech lock.
    pub async fn direct_message(&self, text: String) -> bool {
        self.send_override(WishOverride::DirectMessage(text)).await
    }

    /// Cancel the active session. Idempotent.
    pub async fn cancel(&self) -> bool {
        self.send_override(WishOverride::Cancel).await
    }

    /// Current status snapshot for dashboards and the REST surface.
    pub async fn status(&self) -> WishStatus {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(session) => {
                let shared = session.shared.lock().expect("wish state poisoned");
                WishStatus {
                    active: !session.task.is_finished()
                        && shared.state != WishState::Complete,
                    session_id: Some(shared.session_id.clone()),
                    redeemer_display_name: Some(shared.redeemer.display_name.clone()),
                    wish_text: Some(shared.wish_text.clone()),
                    state: Some(shared.state),
                    followup_count: shared.followup_count,
                    outcome: shared.outcome,
                }
            }
            None => WishStatus::inactive(),
        }
    }
}

struct SessionCtx {
    config: WishConfig,
    shared: Arc<Mutex<SessionShared>>,
    model: Arc<dyn WishModel>,
    speaker: Arc<dyn WishSpeaker>,
    speech_lock: Arc<tokio::sync::Mutex<()>>,
    db: Arc<Database>,
    registry: Arc<ConnectionRegistry>,
    chat_buffer: Arc<ChatBuffer>,
}

impl SessionCtx {
    async fn set_state(&self, state: WishState) {
        {
            let mut shared = self.shared.lock().expect("wish state poisoned");
            shared.state = state;
        }
        self.broadcast_status().await;
    }

    async fn broadcast_status(&self) {
        let status = {
            let shared = self.shared.lock().expect("wish state poisoned");
            WishStatus {
                active: shared.state != WishState::Complete,
                session_id: Some(shared.session_id.clone()),
                redeemer_display_name: Some(shared.redeemer.display_name.clone()),
                wish_text: Some(shared.wish_text.clone()),
                state: Some(shared.state),
                followup_count: shared.followup_count,
                outcome: shared.outcome,
            }
        };
        let payload = serde_json::json!({
            "type": "santa_status",
            "status": status,
        });
        self.registry.broadcast_wish_status(payload).await;
    }

    /// Speak through the session speech lock. The per-character speak call
    /// has no playback-completion signal, so the lock is held for a
    /// conservative duration estimate before release.
    async fn speak_locked(&self, text: &str) {
        let _guard = self.speech_lock.lock().await;
        if let Err(e) = self.speaker.speak(text).await {
            warn!("Wish speech failed: {}", e);
        }
        let estimate = text.len() as f64 * 0.1 + 1.0;
        tokio::time::sleep(Duration::from_secs_f64(estimate)).await;
    }

    fn push_turn(&self, turn: WishTurn) {
        self.shared
            .lock()
            .expect("wish state poisoned")
            .conversation
            .push(turn);
    }

    async fn finish(&self, outcome: WishOutcome) {
        {
            let mut shared = self.shared.lock().expect("wish state poisoned");
            shared.outcome = Some(outcome);
            shared.state = WishState::Complete;
        }
        self.broadcast_status().await;

        let (session_id, redeemer, wish_text, followups, conversation) = {
            let shared = self.shared.lock().expect("wish state poisoned");
            (
                shared.session_id.clone(),
                shared.redeemer.clone(),
                shared.wish_text.clone(),
                shared.followup_count,
                serde_json::to_value(&shared.conversation).unwrap_or(Value::Array(vec![])),
            )
        };
        if let Err(e) = self
            .db
            .archive_wish_session(
                &session_id,
                &redeemer.id,
                &redeemer.login,
                &redeemer.display_name,
                &wish_text,
                outcome.as_str(),
                followups,
                &conversation,
            )
            .await
        {
            error!("Failed to archive wish session: {}", e);
        }
        info!("Wish session complete - outcome={}", outcome.as_str());
    }
}

/// What a waiting state resolved to.
enum WaitResult {
    /// Next user input for the turn loop
    Input(String),
    Timeout,
    Cancelled,
}

async fn run_session(
    ctx: SessionCtx,
    initial_input: String,
    mut chat_rx: mpsc::UnboundedReceiver<ChatMessageEvent>,
    mut override_rx: mpsc::UnboundedReceiver<WishOverride>,
) {
    let mut next_input = initial_input;

    loop {
        ctx.set_state(WishState::Processing).await;
        ctx.push_turn(WishTurn {
            role: "user".into(),
            content: next_input.clone(),
            parsed_speech: None,
            parsed_action: None,
        });

        let turn = match process_turn(&ctx).await {
            Ok(turn) => turn,
            Err(e) => {
                error!("Wish turn failed: {}", e);
                ctx.speak_locked(ERROR_APOLOGY).await;
                ctx.finish(WishOutcome::Error).await;
                return;
            }
        };
        let (speech, mut action) = turn;

        // Followup budget: the would-be extra followup coerces to a vote
        let over_budget = {
            let shared = ctx.shared.lock().expect("wish state poisoned");
            action == WishAction::AskFollowup && shared.followup_count >= ctx.config.max_followups
        };
        if over_budget {
            action = WishAction::AwaitChat;
        }

        ctx.speak_locked(&speech).await;

        match action {
            WishAction::AskFollowup => {
                {
                    let mut shared = ctx.shared.lock().expect("wish state poisoned");
                    shared.followup_count += 1;
                }
                ctx.set_state(WishState::AskFollowup).await;
                match wait_for_followup(&ctx, &mut chat_rx, &mut override_rx).await {
                    WaitResult::Input(input) => next_input = input,
                    WaitResult::Timeout => {
                        ctx.speak_locked(TIMEOUT_FAREWELL).await;
                        ctx.finish(WishOutcome::Timeout).await;
                        return;
                    }
                    WaitResult::Cancelled => {
                        ctx.finish(WishOutcome::Cancelled).await;
                        return;
                    }
                }
            }
            WishAction::AwaitChat => {
                ctx.set_state(WishState::AwaitChat).await;
                match wait_for_chat_vote(&ctx, &mut override_rx).await {
                    WaitResult::Input(input) => next_input = input,
                    WaitResult::Timeout => unreachable!("vote wait has no timeout"),
                    WaitResult::Cancelled => {
                        ctx.finish(WishOutcome::Cancelled).await;
                        return;
                    }
                }
            }
            WishAction::Grant => {
                ctx.finish(WishOutcome::Grant).await;
                return;
            }
            WishAction::Deny => {
                ctx.finish(WishOutcome::Deny).await;
                return;
            }
        }
    }
}

/// One model turn: build messages from the conversation, call the model,
/// parse, record the assistant turn.
async fn process_turn(ctx: &SessionCtx) -> Result<(String, WishAction)> {
    let messages = {
        let shared = ctx.shared.lock().expect("wish state poisoned");
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": ctx.config.system_prompt,
        })];
        for turn in &shared.conversation {
            messages.push(serde_json::json!({
                "role": turn.role,
                "content": turn.content,
            }));
        }
        messages
    };

    let raw = ctx.model.complete(messages, turn_response_format()).await?;
    let (speech, action) =
        parse_turn(&raw).ok_or_else(|| anyhow!("unparseable model output: {}", raw))?;

    let action_str = match action {
        WishAction::AskFollowup => "ask_followup",
        WishAction::AwaitChat => "await_chat",
        WishAction::Grant => "grant",
        WishAction::Deny => "deny",
    };
    ctx.push_turn(WishTurn {
        role: "assistant".into(),
        content: raw,
        parsed_speech: Some(speech.clone()),
        parsed_action: Some(action_str.into()),
    });
    Ok((speech, action))
}

/// Wait for the redeemer's reply: first message bounded by the response
/// timeout, then a debounce window that accumulates further messages until
/// silence, joined with spaces.
async fn wait_for_followup(
    ctx: &SessionCtx,
    chat_rx: &mut mpsc::UnboundedReceiver<ChatMessageEvent>,
    override_rx: &mut mpsc::UnboundedReceiver<WishOverride>,
) -> WaitResult {
    let redeemer_id = {
        let shared = ctx.shared.lock().expect("wish state poisoned");
        shared.redeemer.id.clone()
    };
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(ctx.config.response_timeout_secs);

    // Phase 1: first message from the redeemer
    let first = loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return WaitResult::Timeout,
            message = chat_rx.recv() => {
                match message {
                    Some(m) if m.user_id == redeemer_id => break m.text,
                    Some(_) => continue,
                    None => return WaitResult::Timeout,
                }
            }
            override_msg = override_rx.recv() => {
                match handle_override(ctx, override_msg).await {
                    Some(result) => return result,
                    None => continue,
                }
            }
        }
    };

    // Phase 2: debounce until silence
    let mut parts = vec![first];
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(ctx.config.debounce_secs)) => break,
            message = chat_rx.recv() => {
                match message {
                    Some(m) if m.user_id == redeemer_id => parts.push(m.text),
                    Some(_) => continue,
                    None => break,
                }
            }
            override_msg = override_rx.recv() => {
                match handle_override(ctx, override_msg).await {
                    Some(result) => return result,
                    None => continue,
                }
            }
        }
    }
    WaitResult::Input(parts.join(" "))
}

/// Sleep out the vote window, then snapshot the chat buffer over the
/// just-ended window (plus slack) and build the verdict prompt.
async fn wait_for_chat_vote(
    ctx: &SessionCtx,
    override_rx: &mut mpsc::UnboundedReceiver<WishOverride>,
) -> WaitResult {
    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(ctx.config.chat_vote_secs);
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            override_msg = override_rx.recv() => {
                match handle_override(ctx, override_msg).await {
                    Some(result) => return result,
                    None => continue,
                }
            }
        }
    }

    let window = ctx.config.chat_vote_secs as u32 + CHAT_VOTE_COLLECT_SLACK_SECS;
    let messages = ctx.chat_buffer.get_recent(window);
    WaitResult::Input(build_verdict_prompt(&messages))
}

/// Shared override handling inside waiting states. Returns Some when the
/// wait should resolve, None to keep waiting.
async fn handle_override(ctx: &SessionCtx, value: Option<WishOverride>) -> Option<WaitResult> {
    match value {
        Some(WishOverride::ForceVerdict { grant }) => Some(WaitResult::Input(format!(
            "[DASHBOARD OVERRIDE] Force verdict: {}",
            if grant { "GRANT" } else { "DENY" }
        ))),
        Some(WishOverride::DirectMessage(text)) => {
            ctx.speak_locked(&text).await;
            None
        }
        Some(WishOverride::Cancel) => Some(WaitResult::Cancelled),
        None => Some(WaitResult::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitch::StoredChatMessage;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_turn_clean_json() {
        let (speech, action) =
            parse_turn(r#"{"speech": "Ho ho ho!", "action": "ask_followup"}"#).unwrap();
        assert_eq!(speech, "Ho ho ho!");
        assert_eq!(action, WishAction::AskFollowup);
    }

    #[test]
    fn test_parse_turn_prose_wrapped() {
        let raw = "Sure! Here is my response:\n{\"speech\": \"A pony!\", \"action\": \"grant\"}\nHope that helps.";
        let (speech, action) = parse_turn(raw).unwrap();
        assert_eq!(speech, "A pony!");
        assert_eq!(action, WishAction::Grant);
    }

    #[test]
    fn test_parse_turn_unknown_action_coerces_to_await_chat() {
        let (_, action) =
            parse_turn(r#"{"speech": "hm", "action": "ponder_deeply"}"#).unwrap();
        assert_eq!(action, WishAction::AwaitChat);
    }

    #[test]
    fn test_parse_turn_garbage_fails() {
        assert!(parse_turn("total nonsense").is_none());
        assert!(parse_turn(r#"{"action": "grant"}"#).is_none());
    }

    #[test]
    fn test_initial_turn_with_prior_wishes() {
        let prior = vec![
            ("a pony".to_string(), "deny".to_string()),
            ("world peace".to_string(), "grant".to_string()),
        ];
        let turn = build_initial_turn("a spaceship", &prior);
        assert!(turn.starts_with("a spaceship"));
        assert!(turn.contains("[Returning visitor]"));
        assert!(turn.contains("- \"a pony\" (deny)"));

        assert_eq!(build_initial_turn("a spaceship", &[]), "a spaceship");
    }

    #[test]
    fn test_verdict_prompt() {
        let messages = vec![StoredChatMessage {
            user_id: "u1".into(),
            user_login: "alice".into(),
            display_name: "Alice".into(),
            text: "grant it!".into(),
            timestamp: Utc::now(),
        }];
        let prompt = build_verdict_prompt(&messages);
        assert!(prompt.contains("[Alice]: grant it!"));
        assert!(prompt.contains("\"grant\" or \"deny\""));

        let silent = build_verdict_prompt(&[]);
        assert!(silent.contains("elves are silent"));
    }

    #[test]
    fn test_config_defaults() {
        let config = WishConfig::default();
        assert_eq!(config.max_followups, 2);
        assert_eq!(config.response_timeout_secs, 60);
        assert_eq!(config.debounce_secs, 4);
        assert_eq!(config.chat_vote_secs, 15);
    }

    // ─── State machine tests with scripted model/speaker ─────────

    struct ScriptedModel {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WishModel for ScriptedModel {
        async fn complete(&self, _messages: Vec<Value>, _format: Value) -> Result<String> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(anyhow!("script exhausted"))
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    struct CountingSpeaker {
        utterances: AtomicUsize,
    }

    #[async_trait]
    impl WishSpeaker for CountingSpeaker {
        async fn speak(&self, _text: &str) -> Result<()> {
            self.utterances.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn manager_with_script(
        responses: Vec<&str>,
        config: WishConfig,
    ) -> (Arc<WishSessionManager>, Arc<CountingSpeaker>, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        db.set_wish_config(&serde_json::to_value(&config).unwrap())
            .await
            .unwrap();
        let speaker = Arc::new(CountingSpeaker {
            utterances: AtomicUsize::new(0),
        });
        let model = Arc::new(ScriptedModel {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
        });
        let manager = Arc::new(WishSessionManager::new(
            model,
            speaker.clone(),
            db.clone(),
            Arc::new(ConnectionRegistry::new()),
            Arc::new(ChatBuffer::new()),
        ));
        (manager, speaker, db)
    }

    fn redemption() -> RedemptionEvent {
        RedemptionEvent {
            redemption_id: "r1".into(),
            reward_id: "rw1".into(),
            reward_title: "Make a wish".into(),
            user_id: "u1".into(),
            user_login: "gina".into(),
            user_display_name: "Gina".into(),
            user_input: Some("I want a pony".into()),
            redeemed_at: String::new(),
        }
    }

    async fn wait_complete(manager: &WishSessionManager) {
        for _ in 0..2000 {
            let status = manager.status().await;
            if status.outcome.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("session did not complete");
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_vote_then_grant() {
        let config = WishConfig {
            max_followups: 0,
            chat_vote_secs: 2,
            ..Default::default()
        };
        let (manager, speaker, db) = manager_with_script(
            vec![
                r#"{"speech": "Let us see what chat thinks!", "action": "await_chat"}"#,
                r#"{"speech": "Granted, a pony it is!", "action": "grant"}"#,
            ],
            config,
        )
        .await;

        assert!(manager.start_session(&redemption()).await.unwrap());
        wait_complete(&manager).await;

        let status = manager.status().await;
        assert_eq!(status.outcome, Some(WishOutcome::Grant));
        assert_eq!(status.state, Some(WishState::Complete));
        // One utterance before the vote window, one after
        assert_eq!(speaker.utterances.load(Ordering::SeqCst), 2);

        // Archived with parsed actions for both turns
        let archived = db.recent_wishes_for_user("u1", 3).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].1, "grant");
    }

    #[tokio::test(start_paused = true)]
    async fn test_followup_cap_coerces_to_await_chat() {
        // max_followups = 0: the model's ask_followup must become a vote
        let config = WishConfig {
            max_followups: 0,
            chat_vote_secs: 1,
            ..Default::default()
        };
        let (manager, _, _) = manager_with_script(
            vec![
                r#"{"speech": "Tell me more?", "action": "ask_followup"}"#,
                r#"{"speech": "Denied!", "action": "deny"}"#,
            ],
            config,
        )
        .await;

        assert!(manager.start_session(&redemption()).await.unwrap());
        wait_complete(&manager).await;

        let status = manager.status().await;
        assert_eq!(status.outcome, Some(WishOutcome::Deny));
        // Followup count never exceeded the cap
        assert_eq!(status.followup_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_session_rejected_while_active() {
        let config = WishConfig {
            max_followups: 0,
            chat_vote_secs: 30,
            ..Default::default()
        };
        let (manager, _, _) = manager_with_script(
            vec![
                r#"{"speech": "Chat, vote!", "action": "await_chat"}"#,
                r#"{"speech": "Granted!", "action": "grant"}"#,
            ],
            config,
        )
        .await;

        assert!(manager.start_session(&redemption()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Second redemption while the first is mid-session
        assert!(!manager.start_session(&redemption()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_followup_timeout_ends_with_timeout_outcome() {
        let config = WishConfig {
            max_followups: 2,
            response_timeout_secs: 5,
            ..Default::default()
        };
        let (manager, speaker, _) = manager_with_script(
            vec![r#"{"speech": "What color pony?", "action": "ask_followup"}"#],
            config,
        )
        .await;

        assert!(manager.start_session(&redemption()).await.unwrap());
        wait_complete(&manager).await;

        let status = manager.status().await;
        assert_eq!(status.outcome, Some(WishOutcome::Timeout));
        // Question plus farewell
        assert_eq!(speaker.utterances.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_followup_debounce_joins_messages() {
        let config = WishConfig {
            max_followups: 2,
            response_timeout_secs: 60,
            debounce_secs: 4,
            chat_vote_secs: 1,
            ..Default::default()
        };
        let (manager, _, db) = manager_with_script(
            vec![
                r#"{"speech": "What color pony?", "action": "ask_followup"}"#,
                r#"{"speech": "A sparkly one then!", "action": "grant"}"#,
            ],
            config,
        )
        .await;

        assert!(manager.start_session(&redemption()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Redeemer replies in two quick bursts; a stranger interjects
        for (user, text) in [("u1", "pink"), ("u2", "ignore me"), ("u1", "and sparkly")] {
            manager
                .handle_chat_message(ChatMessageEvent {
                    message_id: "m".into(),
                    user_id: user.into(),
                    user_login: user.into(),
                    user_display_name: user.into(),
                    text: text.into(),
                })
                .await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        wait_complete(&manager).await;

        let status = manager.status().await;
        assert_eq!(status.outcome, Some(WishOutcome::Grant));
        assert_eq!(status.followup_count, 1);

        // The archived conversation carries the joined debounced reply
        let conn = db.recent_wishes_for_user("u1", 1).await.unwrap();
        assert_eq!(conn.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let config = WishConfig {
            max_followups: 0,
            chat_vote_secs: 60,
            ..Default::default()
        };
        let (manager, _, _) = manager_with_script(
            vec![r#"{"speech": "Chat, vote!", "action": "await_chat"}"#],
            config,
        )
        .await;

        assert!(manager.start_session(&redemption()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.cancel().await);
        wait_complete(&manager).await;
        assert_eq!(manager.status().await.outcome, Some(WishOutcome::Cancelled));
        // Further cancels are no-ops, not errors
        let _ = manager.cancel().await;
        let _ = manager.cancel().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_error_speaks_apology_and_errors_out() {
        let config = WishConfig {
            max_followups: 0,
            ..Default::default()
        };
        let (manager, speaker, _) = manager_with_script(vec![], config).await;

        assert!(manager.start_session(&redemption()).await.unwrap());
        wait_complete(&manager).await;

        assert_eq!(manager.status().await.outcome, Some(WishOutcome::Error));
        assert_eq!(speaker.utterances.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_verdict_reaches_terminal_state() {
        let config = WishConfig {
            max_followups: 0,
            chat_vote_secs: 600,
            ..Default::default()
        };
        let (manager, _, _) = manager_with_script(
            vec![
                r#"{"speech": "Chat, vote!", "action": "await_chat"}"#,
                r#"{"speech": "The boss says yes!", "action": "grant"}"#,
            ],
            config,
        )
        .await;

        assert!(manager.start_session(&redemption()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.force_verdict(true).await);
        wait_complete(&manager).await;
        assert_eq!(manager.status().await.outcome, Some(WishOutcome::Grant));
    }
}
