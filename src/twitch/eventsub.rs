//! Twitch EventSub WebSocket client and Helix REST helpers
//!
//! EventSub over WebSocket: the server sends a `session_welcome` carrying a
//! session id; subscriptions are then created against the Helix REST API
//! with `transport: websocket`. Notifications for chat messages and channel
//! point redemptions are forwarded to the server's dispatcher channel.

use futures_util::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
const HELIX_API_URL: &str = "https://api.twitch.tv/helix";
const OAUTH_VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";

/// Error from Twitch EventSub or Helix.
#[derive(Debug, thiserror::Error)]
pub enum TwitchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    Ws(String),
    #[error("Helix API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("{0}")]
    Other(String),
}

/// A channel point redemption event.
#[derive(Debug, Clone)]
pub struct RedemptionEvent {
    pub redemption_id: String,
    pub reward_id: String,
    pub reward_title: String,
    pub user_id: String,
    pub user_login: String,
    pub user_display_name: String,
    pub user_input: Option<String>,
    pub redeemed_at: String,
}

/// A chat message event.
#[derive(Debug, Clone)]
pub struct ChatMessageEvent {
    pub message_id: String,
    pub user_id: String,
    pub user_login: String,
    pub user_display_name: String,
    pub text: String,
}

/// Events forwarded to the server's dispatcher.
#[derive(Debug, Clone)]
pub enum TwitchEvent {
    Chat(ChatMessageEvent),
    Redemption(RedemptionEvent),
    /// The EventSub connection dropped and is not coming back
    Disconnected(String),
}

/// EventSub connection parameters.
#[derive(Debug, Clone)]
pub struct EventSubConfig {
    pub access_token: String,
    pub client_id: String,
    pub broadcaster_user_id: String,
    /// Authenticated user id (chat subscription must match the token)
    pub user_id: String,
    /// Specific reward to listen for; None means all rewards
    pub reward_id: Option<String>,
}

/// Run the EventSub WebSocket until shutdown. Handles the welcome
/// handshake, keepalives, notifications, and server-directed reconnects.
pub async fn run_eventsub(
    config: EventSubConfig,
    events_tx: mpsc::Sender<TwitchEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let helix = HelixClient::new(
        config.client_id.clone(),
        config.access_token.clone(),
        config.broadcaster_user_id.clone(),
    );
    let mut url = EVENTSUB_WS_URL.to_string();

    loop {
        let (ws, _) = match connect_async(url.as_str()).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("EventSub connect failed: {}", e);
                let _ = events_tx
                    .send(TwitchEvent::Disconnected(e.to_string()))
                    .await;
                return;
            }
        };
        info!("EventSub WebSocket connected");
        let (_sink, mut stream) = ws.split();
        let mut reconnect_url: Option<String> = None;

        loop {
            let message = tokio::select! {
                message = stream.next() => message,
                _ = shutdown_rx.changed() => {
                    info!("EventSub shutting down");
                    return;
                }
            };
            let Some(message) = message else { break };
            let text = match message {
                Ok(Message::Text(t)) => t,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!("EventSub read error: {}", e);
                    break;
                }
            };
            let frame: Value = match serde_json::from_str(text.as_str()) {
                Ok(v) => v,
                Err(_) => continue,
            };

            let message_type = frame
                .pointer("/metadata/message_type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match message_type {
                "session_welcome" => {
                    let session_id = frame
                        .pointer("/payload/session/id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    debug!("EventSub session: {}", session_id);
                    if let Err(e) = subscribe_all(&helix, &config, &session_id).await {
                        error!("EventSub subscription failed: {}", e);
                        let _ = events_tx
                            .send(TwitchEvent::Disconnected(e.to_string()))
                            .await;
                        return;
                    }
                }
                "session_keepalive" => {}
                "session_reconnect" => {
                    reconnect_url = frame
                        .pointer("/payload/session/reconnect_url")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    info!("EventSub reconnect requested");
                    break;
                }
                "revocation" => {
                    warn!(
                        "EventSub subscription revoked: {}",
                        frame
                            .pointer("/payload/subscription/type")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or("unknown")
                    );
                }
                "notification" => {
                    if let Some(event) = parse_notification(&frame) {
                        if events_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                _ => {}
            }
        }

        match reconnect_url {
            Some(next) => {
                url = next;
            }
            None => {
                let _ = events_tx
                    .send(TwitchEvent::Disconnected("connection closed".to_string()))
                    .await;
                return;
            }
        }
    }
}

async fn subscribe_all(
    helix: &HelixClient,
    config: &EventSubConfig,
    session_id: &str,
) -> Result<(), TwitchError> {
    helix
        .create_subscription(
            session_id,
            "channel.chat.message",
            "1",
            serde_json::json!({
                "broadcaster_user_id": config.broadcaster_user_id,
                "user_id": config.user_id,
            }),
        )
        .await?;
    info!(
        "Subscribed to chat for channel {}",
        config.broadcaster_user_id
    );

    let mut condition = serde_json::json!({
        "broadcaster_user_id": config.broadcaster_user_id,
    });
    if let Some(reward_id) = &config.reward_id {
        condition["reward_id"] = Value::String(reward_id.clone());
    }
    helix
        .create_subscription(
            session_id,
            "channel.channel_points_custom_reward_redemption.add",
            "1",
            condition,
        )
        .await?;
    info!(
        "Subscribed to redemptions for channel {}",
        config.broadcaster_user_id
    );
    Ok(())
}

fn parse_notification(frame: &Value) -> Option<TwitchEvent> {
    let subscription_type = frame
        .pointer("/payload/subscription/type")
        .and_then(Value::as_str)?;
    let event = frame.pointer("/payload/event")?;

    let get = |key: &str| -> String {
        event
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    match subscription_type {
        "channel.chat.message" => Some(TwitchEvent::Chat(ChatMessageEvent {
            message_id: get("message_id"),
            user_id: get("chatter_user_id"),
            user_login: get("chatter_user_login"),
            user_display_name: get("chatter_user_name"),
            text: event
                .pointer("/message/text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })),
        "channel.channel_points_custom_reward_redemption.add" => {
            Some(TwitchEvent::Redemption(RedemptionEvent {
                redemption_id: get("id"),
                reward_id: event
                    .pointer("/reward/id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                reward_title: event
                    .pointer("/reward/title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                user_id: get("user_id"),
                user_login: get("user_login"),
                user_display_name: get("user_name"),
                user_input: event
                    .get("user_input")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                redeemed_at: get("redeemed_at"),
            }))
        }
        _ => None,
    }
}

/// Minimal Helix REST client for subscriptions, rewards, and redemptions.
#[derive(Clone)]
pub struct HelixClient {
    client: reqwest::Client,
    client_id: String,
    access_token: String,
    broadcaster_user_id: String,
}

impl HelixClient {
    pub fn new(client_id: String, access_token: String, broadcaster_user_id: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            client_id,
            access_token,
            broadcaster_user_id,
        }
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("Client-Id", self.client_id.clone())
    }

    async fn check(response: reqwest::Response) -> Result<Value, TwitchError> {
        let status = response.status();
        if !status.is_success() {
            return Err(TwitchError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(response.json().await.unwrap_or(Value::Null))
    }

    pub async fn create_subscription(
        &self,
        session_id: &str,
        subscription_type: &str,
        version: &str,
        condition: Value,
    ) -> Result<(), TwitchError> {
        let body = serde_json::json!({
            "type": subscription_type,
            "version": version,
            "condition": condition,
            "transport": {"method": "websocket", "session_id": session_id},
        });
        let response = self
            .auth(self.client.post(format!("{}/eventsub/subscriptions", HELIX_API_URL)))
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Validate the token; returns `(user_id, login)`.
    pub async fn validate_token(access_token: &str) -> Result<(String, String), TwitchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        let response = client
            .get(OAUTH_VALIDATE_URL)
            .header("Authorization", format!("OAuth {}", access_token))
            .send()
            .await?;
        let body = Self::check(response).await?;
        let user_id = body
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let login = body
            .get("login")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if user_id.is_empty() {
            return Err(TwitchError::Other("token validation returned no user".into()));
        }
        Ok((user_id, login))
    }

    pub async fn get_rewards(&self) -> Result<Vec<Value>, TwitchError> {
        let response = self
            .auth(self.client.get(format!(
                "{}/channel_points/custom_rewards?broadcaster_id={}",
                HELIX_API_URL, self.broadcaster_user_id
            )))
            .send()
            .await?;
        let body = Self::check(response).await?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .map(|rewards| {
                rewards
                    .iter()
                    .map(|r| {
                        serde_json::json!({
                            "id": r.get("id"),
                            "title": r.get("title"),
                            "cost": r.get("cost"),
                            "prompt": r.get("prompt"),
                            "is_paused": r.get("is_paused"),
                            "is_enabled": r.get("is_enabled"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn create_reward(
        &self,
        title: &str,
        cost: u32,
        prompt: &str,
        is_user_input_required: bool,
    ) -> Result<Value, TwitchError> {
        let body = serde_json::json!({
            "title": title,
            "cost": cost,
            "prompt": if prompt.is_empty() { Value::Null } else { Value::String(prompt.to_string()) },
            "is_user_input_required": is_user_input_required,
            "is_enabled": true,
            "should_redemptions_skip_request_queue": false,
        });
        let response = self
            .auth(self.client.post(format!(
                "{}/channel_points/custom_rewards?broadcaster_id={}",
                HELIX_API_URL, self.broadcaster_user_id
            )))
            .json(&body)
            .send()
            .await?;
        let body = Self::check(response).await?;
        Ok(body
            .pointer("/data/0")
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn set_reward_enabled(
        &self,
        reward_id: &str,
        enabled: bool,
    ) -> Result<(), TwitchError> {
        let response = self
            .auth(self.client.patch(format!(
                "{}/channel_points/custom_rewards?broadcaster_id={}&id={}",
                HELIX_API_URL, self.broadcaster_user_id, reward_id
            )))
            .json(&serde_json::json!({"is_enabled": enabled}))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn delete_reward(&self, reward_id: &str) -> Result<(), TwitchError> {
        let response = self
            .auth(self.client.delete(format!(
                "{}/channel_points/custom_rewards?broadcaster_id={}&id={}",
                HELIX_API_URL, self.broadcaster_user_id, reward_id
            )))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Mark a redemption FULFILLED or CANCELED.
    pub async fn update_redemption_status(
        &self,
        reward_id: &str,
        redemption_id: &str,
        status: &str,
    ) -> Result<(), TwitchError> {
        let response = self
            .auth(self.client.patch(format!(
                "{}/channel_points/custom_rewards/redemptions?broadcaster_id={}&reward_id={}&id={}",
                HELIX_API_URL, self.broadcaster_user_id, reward_id, redemption_id
            )))
            .json(&serde_json::json!({"status": status}))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_notification() {
        let frame = serde_json::json!({
            "metadata": {"message_type": "notification"},
            "payload": {
                "subscription": {"type": "channel.chat.message"},
                "event": {
                    "message_id": "m1",
                    "chatter_user_id": "u1",
                    "chatter_user_login": "gina",
                    "chatter_user_name": "Gina",
                    "message": {"text": "I want a pony"},
                },
            },
        });
        match parse_notification(&frame) {
            Some(TwitchEvent::Chat(msg)) => {
                assert_eq!(msg.user_id, "u1");
                assert_eq!(msg.user_display_name, "Gina");
                assert_eq!(msg.text, "I want a pony");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_redemption_notification() {
        let frame = serde_json::json!({
            "metadata": {"message_type": "notification"},
            "payload": {
                "subscription": {"type": "channel.channel_points_custom_reward_redemption.add"},
                "event": {
                    "id": "r1",
                    "reward": {"id": "rw1", "title": "Make a wish"},
                    "user_id": "u1",
                    "user_login": "gina",
                    "user_name": "Gina",
                    "user_input": "I want a pony",
                    "redeemed_at": "2024-12-01T00:00:00Z",
                },
            },
        });
        match parse_notification(&frame) {
            Some(TwitchEvent::Redemption(r)) => {
                assert_eq!(r.redemption_id, "r1");
                assert_eq!(r.reward_id, "rw1");
                assert_eq!(r.user_input.as_deref(), Some("I want a pony"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_subscription_ignored() {
        let frame = serde_json::json!({
            "metadata": {"message_type": "notification"},
            "payload": {
                "subscription": {"type": "channel.follow"},
                "event": {},
            },
        });
        assert!(parse_notification(&frame).is_none());
    }

    #[test]
    fn test_empty_user_input_is_none() {
        let frame = serde_json::json!({
            "metadata": {"message_type": "notification"},
            "payload": {
                "subscription": {"type": "channel.channel_points_custom_reward_redemption.add"},
                "event": {
                    "id": "r1",
                    "reward": {"id": "rw1", "title": "Wish"},
                    "user_id": "u1",
                    "user_login": "gina",
                    "user_name": "Gina",
                    "user_input": "",
                    "redeemed_at": "",
                },
            },
        });
        match parse_notification(&frame) {
            Some(TwitchEvent::Redemption(r)) => assert!(r.user_input.is_none()),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
