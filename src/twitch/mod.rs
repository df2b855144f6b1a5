//! Twitch integration: EventSub lifecycle management and the live-chat
//! buffer. Chat and redemption events land on a dispatcher channel the
//! server wires to the chat buffer, chat-view subscribers, and the wish
//! session.

pub mod buffer;
pub mod eventsub;

pub use buffer::{ChatBuffer, StoredChatMessage};
pub use eventsub::{
    ChatMessageEvent, EventSubConfig, HelixClient, RedemptionEvent, TwitchError, TwitchEvent,
};

use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

struct Running {
    config: EventSubConfig,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Manages the EventSub connection lifecycle.
pub struct TwitchManager {
    running: Mutex<Option<Running>>,
    events_tx: mpsc::Sender<TwitchEvent>,
}

impl TwitchManager {
    /// `events_tx` feeds the server's dispatcher task.
    pub fn new(events_tx: mpsc::Sender<TwitchEvent>) -> Self {
        Self {
            running: Mutex::new(None),
            events_tx,
        }
    }

    /// Start (or restart) the EventSub connection.
    pub async fn start(&self, config: EventSubConfig) {
        self.stop().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(eventsub::run_eventsub(
            config.clone(),
            self.events_tx.clone(),
            shutdown_rx,
        ));
        info!(
            "EventSub started for broadcaster {}",
            config.broadcaster_user_id
        );
        *self.running.lock().await = Some(Running {
            config,
            shutdown_tx,
            task,
        });
    }

    pub async fn stop(&self) {
        if let Some(running) = self.running.lock().await.take() {
            let _ = running.shutdown_tx.send(true);
            running.task.abort();
            info!("EventSub stopped");
        }
    }

    pub async fn is_connected(&self) -> bool {
        let running = self.running.lock().await;
        running
            .as_ref()
            .map(|r| !r.task.is_finished())
            .unwrap_or(false)
    }

    /// Helix client built from the running connection's credentials.
    pub async fn helix(&self) -> Option<HelixClient> {
        let running = self.running.lock().await;
        running.as_ref().map(|r| {
            HelixClient::new(
                r.config.client_id.clone(),
                r.config.access_token.clone(),
                r.config.broadcaster_user_id.clone(),
            )
        })
    }

    pub async fn broadcaster_user_id(&self) -> Option<String> {
        let running = self.running.lock().await;
        running
            .as_ref()
            .map(|r| r.config.broadcaster_user_id.clone())
    }
}

/// Shared handle type used across the server.
pub type SharedTwitch = Arc<TwitchManager>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manager_starts_disconnected() {
        let (tx, _rx) = mpsc::channel(8);
        let manager = TwitchManager::new(tx);
        assert!(!manager.is_connected().await);
        assert!(manager.helix().await.is_none());
        // Stop with nothing running is a no-op
        manager.stop().await;
    }
}
