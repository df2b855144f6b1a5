//! Connection registry
//!
//! Tracks every live overlay session per character plus the dashboard,
//! wish-dashboard, and chat-view subscriber lists. Writes snapshot the
//! session list first and send outside the lock; a session whose channel is
//! closed gets dropped from the registry on the next write.
//!
//! Liveness is application-level: a `ping` control frame every 25s, eviction
//! at 60s without a `pong`. Transport keepalive is not enough behind proxies
//! with ~30s idle cutoffs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::ChannelStatus;
use crate::protocol::{OverlayCommand, SessionFrame};

/// Application-level ping interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(25);

/// A session is evicted when its last pong is older than this.
pub const STALE_AFTER: Duration = Duration::from_secs(60);

/// Per-character transient state, derived from overlay-emitted events.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelState {
    pub playing: bool,
    pub streaming: bool,
}

/// One live overlay connection.
#[derive(Clone)]
pub struct OverlaySession {
    pub id: Uuid,
    tx: mpsc::Sender<SessionFrame>,
    last_pong: Arc<AtomicI64>,
}

impl OverlaySession {
    pub fn new(tx: mpsc::Sender<SessionFrame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            last_pong: Arc::new(AtomicI64::new(now_ms())),
        }
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_ms(), Ordering::SeqCst);
    }

    pub fn last_pong_ms(&self) -> i64 {
        self.last_pong.load(Ordering::SeqCst)
    }
}

/// A push-only subscriber (dashboard, wish dashboard, chat view).
#[derive(Clone)]
pub struct PushSession {
    pub id: Uuid,
    tx: mpsc::Sender<SessionFrame>,
    last_pong: Arc<AtomicI64>,
}

impl PushSession {
    pub fn new(tx: mpsc::Sender<SessionFrame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            last_pong: Arc::new(AtomicI64::new(now_ms())),
        }
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_ms(), Ordering::SeqCst);
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Default)]
struct Inner {
    overlays: HashMap<String, Vec<OverlaySession>>,
    channel_state: HashMap<String, ChannelState>,
    dashboards: Vec<PushSession>,
    wish_dashboards: Vec<PushSession>,
    chat_views: Vec<PushSession>,
}

/// Registry of all live sessions.
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    // ─── Overlay sessions ────────────────────────────────────────

    /// Register an overlay for a character. Caller must have verified the
    /// character exists.
    pub async fn register_overlay(&self, character: &str, session: OverlaySession) {
        {
            let mut inner = self.inner.lock().expect("registry lock poisoned");
            inner
                .overlays
                .entry(character.to_string())
                .or_default()
                .push(session);
            inner
                .channel_state
                .entry(character.to_string())
                .or_default();
        }
        info!("Overlay connected - character={}", character);
        self.notify_dashboards().await;
    }

    /// Remove one overlay session; drops the character entry when the last
    /// session leaves.
    pub async fn unregister_overlay(&self, character: &str, session_id: Uuid) {
        {
            let mut inner = self.inner.lock().expect("registry lock poisoned");
            if let Some(sessions) = inner.overlays.get_mut(character) {
                sessions.retain(|s| s.id != session_id);
                if sessions.is_empty() {
                    inner.overlays.remove(character);
                    inner.channel_state.remove(character);
                }
            }
        }
        info!("Overlay disconnected - character={}", character);
        self.notify_dashboards().await;
    }

    /// Sever every overlay session for a character (character deletion).
    pub async fn disconnect_character(&self, character: &str) {
        let sessions = {
            let mut inner = self.inner.lock().expect("registry lock poisoned");
            inner.channel_state.remove(character);
            inner.overlays.remove(character).unwrap_or_default()
        };
        for session in &sessions {
            let _ = session.tx.try_send(SessionFrame::Close);
        }
        if !sessions.is_empty() {
            self.notify_dashboards().await;
        }
    }

    fn snapshot_overlays(&self, character: &str) -> Vec<OverlaySession> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .overlays
            .get(character)
            .cloned()
            .unwrap_or_default()
    }

    /// Find the session that should record a pong.
    pub fn overlay_by_id(&self, character: &str, session_id: Uuid) -> Option<OverlaySession> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .overlays
            .get(character)
            .and_then(|list| list.iter().find(|s| s.id == session_id).cloned())
    }

    /// Send a JSON control frame to every overlay of a character.
    ///
    /// Returns true iff at least one session remains after the write.
    pub async fn send_json(&self, character: &str, command: &OverlayCommand) -> bool {
        self.fanout(character, SessionFrame::command(command)).await
    }

    /// Send raw audio bytes to every overlay of a character.
    pub async fn send_bytes(&self, character: &str, bytes: Vec<u8>) -> bool {
        self.fanout(character, SessionFrame::Binary(bytes)).await
    }

    async fn fanout(&self, character: &str, frame: SessionFrame) -> bool {
        let sessions = self.snapshot_overlays(character);
        if sessions.is_empty() {
            return false;
        }
        let mut dead = Vec::new();
        for session in &sessions {
            if session.tx.send(frame.clone()).await.is_err() {
                dead.push(session.id);
            }
        }
        if !dead.is_empty() {
            let mut inner = self.inner.lock().expect("registry lock poisoned");
            if let Some(list) = inner.overlays.get_mut(character) {
                list.retain(|s| !dead.contains(&s.id));
                if list.is_empty() {
                    inner.overlays.remove(character);
                    inner.channel_state.remove(character);
                }
            }
        }
        sessions.len() > dead.len()
    }

    pub fn is_connected(&self, character: &str) -> bool {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .overlays
            .get(character)
            .map(|list| !list.is_empty())
            .unwrap_or(false)
    }

    pub fn overlay_count(&self, character: &str) -> usize {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .overlays
            .get(character)
            .map(Vec::len)
            .unwrap_or(0)
    }

    // ─── Channel state ───────────────────────────────────────────

    pub async fn set_channel_state(&self, character: &str, update: impl FnOnce(&mut ChannelState)) {
        let changed = {
            let mut inner = self.inner.lock().expect("registry lock poisoned");
            match inner.channel_state.get_mut(character) {
                Some(state) => {
                    update(state);
                    true
                }
                None => false,
            }
        };
        if changed {
            self.notify_dashboards().await;
        }
    }

    pub fn channel_state(&self, character: &str) -> Option<ChannelState> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .channel_state
            .get(character)
            .copied()
    }

    /// Connected characters with their transient state.
    pub fn get_roster(&self) -> Vec<ChannelStatus> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut roster: Vec<ChannelStatus> = inner
            .overlays
            .iter()
            .map(|(name, sessions)| {
                let state = inner.channel_state.get(name).copied().unwrap_or_default();
                ChannelStatus {
                    name: name.clone(),
                    connected: !sessions.is_empty(),
                    overlay_count: sessions.len(),
                    playing: state.playing,
                    streaming: state.streaming,
                }
            })
            .collect();
        roster.sort_by(|a, b| a.name.cmp(&b.name));
        roster
    }

    // ─── Dashboards and other subscribers ────────────────────────

    pub fn register_dashboard(&self, session: PushSession) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .dashboards
            .push(session);
    }

    pub fn unregister_dashboard(&self, session_id: Uuid) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .dashboards
            .retain(|s| s.id != session_id);
    }

    pub fn register_wish_dashboard(&self, session: PushSession) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .wish_dashboards
            .push(session);
    }

    pub fn unregister_wish_dashboard(&self, session_id: Uuid) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .wish_dashboards
            .retain(|s| s.id != session_id);
    }

    pub fn register_chat_view(&self, session: PushSession) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .chat_views
            .push(session);
    }

    pub fn unregister_chat_view(&self, session_id: Uuid) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .chat_views
            .retain(|s| s.id != session_id);
    }

    fn snapshot_push(&self, which: PushKind) -> Vec<PushSession> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        match which {
            PushKind::Dashboard => inner.dashboards.clone(),
            PushKind::WishDashboard => inner.wish_dashboards.clone(),
            PushKind::ChatView => inner.chat_views.clone(),
        }
    }

    async fn push_fanout(&self, which: PushKind, payload: serde_json::Value) {
        let sessions = self.snapshot_push(which);
        let mut dead = Vec::new();
        for session in &sessions {
            if session
                .tx
                .send(SessionFrame::Json(payload.clone()))
                .await
                .is_err()
            {
                dead.push(session.id);
            }
        }
        if !dead.is_empty() {
            let mut inner = self.inner.lock().expect("registry lock poisoned");
            let list = match which {
                PushKind::Dashboard => &mut inner.dashboards,
                PushKind::WishDashboard => &mut inner.wish_dashboards,
                PushKind::ChatView => &mut inner.chat_views,
            };
            list.retain(|s| !dead.contains(&s.id));
        }
    }

    /// Broadcast an arbitrary frame to all dashboards.
    pub async fn broadcast_dashboard(&self, payload: serde_json::Value) {
        self.push_fanout(PushKind::Dashboard, payload).await;
    }

    /// Broadcast the current roster to all dashboards.
    pub async fn notify_dashboards(&self) {
        let payload = serde_json::json!({
            "type": "channels",
            "channels": self.get_roster(),
        });
        self.push_fanout(PushKind::Dashboard, payload).await;
    }

    /// Broadcast wish-session status to wish dashboards.
    pub async fn broadcast_wish_status(&self, payload: serde_json::Value) {
        self.push_fanout(PushKind::WishDashboard, payload).await;
    }

    /// Broadcast a live-chat message to chat-view subscribers.
    pub async fn broadcast_chat_view(&self, payload: serde_json::Value) {
        self.push_fanout(PushKind::ChatView, payload).await;
    }

    // ─── Liveness ────────────────────────────────────────────────

    /// One liveness pass: ping everything, evict anything stale.
    pub async fn liveness_tick(&self) {
        let cutoff = now_ms() - STALE_AFTER.as_millis() as i64;
        let ping = OverlayCommand::Ping { ts: now_ms() };
        let frame = SessionFrame::command(&ping);

        let (overlays, dashboards): (Vec<(String, OverlaySession)>, Vec<PushSession>) = {
            let inner = self.inner.lock().expect("registry lock poisoned");
            let overlays = inner
                .overlays
                .iter()
                .flat_map(|(name, list)| list.iter().map(|s| (name.clone(), s.clone())))
                .collect();
            let dashboards = inner.dashboards.clone();
            (overlays, dashboards)
        };

        let mut stale: Vec<(String, Uuid)> = Vec::new();
        for (character, session) in &overlays {
            if session.last_pong_ms() < cutoff {
                stale.push((character.clone(), session.id));
                continue;
            }
            let _ = session.tx.try_send(frame.clone());
        }
        for session in &dashboards {
            let _ = session.tx.try_send(frame.clone());
        }

        for (character, session_id) in stale {
            warn!(
                "Evicting stale overlay - character={} session={}",
                character, session_id
            );
            // Ask the writer task to close the socket, then drop the entry
            if let Some(session) = self.overlay_by_id(&character, session_id) {
                let _ = session.tx.try_send(SessionFrame::Close);
            }
            self.unregister_overlay(&character, session_id).await;
        }
    }

    /// Run the liveness loop until shutdown.
    pub async fn run_liveness(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Liveness task started (ping every {:?}, evict after {:?})",
            PING_INTERVAL, STALE_AFTER
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(PING_INTERVAL) => {
                    self.liveness_tick().await;
                    debug!("Liveness tick complete");
                }
                _ = shutdown_rx.recv() => {
                    info!("Liveness task shutting down");
                    break;
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum PushKind {
    Dashboard,
    WishDashboard,
    ChatView,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (OverlaySession, mpsc::Receiver<SessionFrame>) {
        let (tx, rx) = mpsc::channel(16);
        (OverlaySession::new(tx), rx)
    }

    #[tokio::test]
    async fn test_register_and_roster() {
        let registry = ConnectionRegistry::new();
        let (session, _rx) = session_pair();
        registry.register_overlay("alice", session).await;

        let roster = registry.get_roster();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].name, "alice");
        assert!(roster[0].connected);
        assert_eq!(roster[0].overlay_count, 1);
        assert!(!roster[0].playing);
        assert!(!roster[0].streaming);
    }

    #[tokio::test]
    async fn test_multiple_overlays_per_character() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = session_pair();
        let (b, mut rx_b) = session_pair();
        registry.register_overlay("alice", a).await;
        registry.register_overlay("alice", b).await;
        assert_eq!(registry.overlay_count("alice"), 2);

        // Both mirrors receive the same frame
        assert!(registry.send_json("alice", &OverlayCommand::StopStream).await);
        assert!(matches!(rx_a.recv().await, Some(SessionFrame::Json(_))));
        assert!(matches!(rx_b.recv().await, Some(SessionFrame::Json(_))));
    }

    #[tokio::test]
    async fn test_send_drops_dead_sessions() {
        let registry = ConnectionRegistry::new();
        let (alive, mut rx) = session_pair();
        let (dead, dead_rx) = session_pair();
        registry.register_overlay("alice", alive).await;
        registry.register_overlay("alice", dead).await;
        drop(dead_rx);

        assert!(registry.send_bytes("alice", vec![1, 2, 3]).await);
        assert_eq!(registry.overlay_count("alice"), 1);
        assert!(matches!(rx.recv().await, Some(SessionFrame::Binary(_))));
    }

    #[tokio::test]
    async fn test_send_to_unknown_character_fails() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_json("nobody", &OverlayCommand::StopStream).await);
    }

    #[tokio::test]
    async fn test_unregister_last_session_clears_entry() {
        let registry = ConnectionRegistry::new();
        let (session, _rx) = session_pair();
        let id = session.id;
        registry.register_overlay("alice", session).await;
        registry.unregister_overlay("alice", id).await;
        assert!(!registry.is_connected("alice"));
        assert!(registry.channel_state("alice").is_none());
    }

    #[tokio::test]
    async fn test_channel_state_updates() {
        let registry = ConnectionRegistry::new();
        let (session, _rx) = session_pair();
        registry.register_overlay("alice", session).await;

        registry
            .set_channel_state("alice", |s| s.streaming = true)
            .await;
        assert!(registry.channel_state("alice").unwrap().streaming);
    }

    #[tokio::test]
    async fn test_liveness_evicts_stale_sessions() {
        let registry = ConnectionRegistry::new();
        let (fresh, _rx_fresh) = session_pair();
        let (stale, _rx_stale) = session_pair();
        stale
            .last_pong
            .store(now_ms() - 120_000, Ordering::SeqCst);
        registry.register_overlay("carol", fresh).await;
        registry.register_overlay("carol", stale).await;

        registry.liveness_tick().await;
        assert_eq!(registry.overlay_count("carol"), 1);
    }

    #[tokio::test]
    async fn test_dashboard_broadcast_on_register() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(16);
        registry.register_dashboard(PushSession::new(tx));

        let (session, _rx) = session_pair();
        registry.register_overlay("alice", session).await;

        match rx.recv().await {
            Some(SessionFrame::Json(payload)) => {
                assert_eq!(payload["type"], "channels");
                assert_eq!(payload["channels"][0]["name"], "alice");
            }
            other => panic!("expected roster broadcast, got {:?}", other),
        }
    }
}
