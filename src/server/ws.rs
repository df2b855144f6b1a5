//! WebSocket handlers: overlay sessions, dashboards, wish dashboards, and
//! chat-view subscribers.
//!
//! Each connection gets a writer task draining an mpsc channel into the
//! socket; the registry holds only the channel sender, so fan-out never
//! touches a socket directly and a closed channel marks a dead session.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{OverlayCommand, OverlayEvent, SessionFrame};
use crate::registry::{OverlaySession, PushSession};

use super::AppState;

/// Close code for an overlay connecting to an unknown character.
const CLOSE_UNKNOWN_CHARACTER: u16 = 4004;

/// Channel depth for a session's outbound frames.
const SESSION_QUEUE: usize = 64;

/// Overlay endpoint: one bidirectional framed channel per browser source.
pub async fn overlay_ws(
    ws: WebSocketUpgrade,
    Path(character): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_overlay(socket, character, state))
}

async fn handle_overlay(socket: WebSocket, character: String, state: AppState) {
    // Handshake precondition: the character must exist
    let exists = matches!(state.db.get_character(&character).await, Ok(Some(_)));
    let (mut sink, mut stream) = socket.split();
    if !exists {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_UNKNOWN_CHARACTER,
                reason: "Character not found. Create it first.".into(),
            })))
            .await;
        return;
    }

    let (tx, mut rx) = mpsc::channel::<SessionFrame>(SESSION_QUEUE);
    let session = OverlaySession::new(tx.clone());
    let session_id = session.id;

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let result = match frame {
                SessionFrame::Json(value) => {
                    sink.send(Message::Text(value.to_string().into())).await
                }
                SessionFrame::Binary(bytes) => sink.send(Message::Binary(bytes.into())).await,
                SessionFrame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    // Identify the build to the overlay before anything else
    let hello = OverlayCommand::Hello {
        version: crate::VERSION.to_string(),
        build_id: crate::BUILD_ID.to_string(),
    };
    let _ = tx.send(SessionFrame::command(&hello)).await;

    state.registry.register_overlay(&character, session.clone()).await;

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(_) => break,
        };
        match message {
            Message::Text(text) => {
                let event: OverlayEvent = match serde_json::from_str(text.as_str()) {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                match event {
                    OverlayEvent::Pong { .. } => session.record_pong(),
                    OverlayEvent::Ended => {
                        state
                            .registry
                            .set_channel_state(&character, |s| s.playing = false)
                            .await;
                    }
                    OverlayEvent::StreamEnded => {
                        state
                            .registry
                            .set_channel_state(&character, |s| s.streaming = false)
                            .await;
                    }
                    OverlayEvent::StreamStopped {
                        spoken_text,
                        playback_time,
                        word_count,
                    } => {
                        debug!(
                            "Overlay stream stopped - character={} words={} time={:.2}s",
                            character, word_count, playback_time
                        );
                        state
                            .registry
                            .set_channel_state(&character, |s| s.streaming = false)
                            .await;
                        // Overlay-authoritative report of what was heard
                        state
                            .coordinator
                            .resolve_stream_stopped(&character, &spoken_text)
                            .await;
                    }
                    OverlayEvent::Error { message } => {
                        warn!("Overlay error - character={}: {}", character, message);
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.registry.unregister_overlay(&character, session_id).await;
    writer.abort();
    info!("Overlay session closed - character={}", character);
}

/// Dashboard endpoint: receives roster broadcasts.
pub async fn dashboard_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_push_session(socket, state, PushKind::Dashboard))
}

/// Wish-dashboard endpoint: receives santa_status broadcasts.
pub async fn wish_dashboard_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_push_session(socket, state, PushKind::WishDashboard))
}

/// Chat-view endpoint: receives live-chat messages.
pub async fn chat_view_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_push_session(socket, state, PushKind::ChatView))
}

#[derive(Clone, Copy)]
enum PushKind {
    Dashboard,
    WishDashboard,
    ChatView,
}

async fn handle_push_session(socket: WebSocket, state: AppState, kind: PushKind) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<SessionFrame>(SESSION_QUEUE);
    let session = PushSession::new(tx.clone());
    let session_id = session.id;

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let result = match frame {
                SessionFrame::Json(value) => {
                    sink.send(Message::Text(value.to_string().into())).await
                }
                SessionFrame::Binary(bytes) => sink.send(Message::Binary(bytes.into())).await,
                SessionFrame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    // Initial state push
    match kind {
        PushKind::Dashboard => {
            state.registry.register_dashboard(session.clone());
            let payload = serde_json::json!({
                "type": "channels",
                "channels": state.registry.get_roster(),
            });
            let _ = tx.send(SessionFrame::Json(payload)).await;
        }
        PushKind::WishDashboard => {
            state.registry.register_wish_dashboard(session.clone());
            let payload = serde_json::json!({
                "type": "santa_status",
                "status": state.wish.status().await,
            });
            let _ = tx.send(SessionFrame::Json(payload)).await;
        }
        PushKind::ChatView => {
            state.registry.register_chat_view(session.clone());
        }
    }

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Ok(OverlayEvent::Pong { .. }) = serde_json::from_str(text.as_str()) {
                    session.record_pong();
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    match kind {
        PushKind::Dashboard => state.registry.unregister_dashboard(session_id),
        PushKind::WishDashboard => state.registry.unregister_wish_dashboard(session_id),
        PushKind::ChatView => state.registry.unregister_chat_view(session_id),
    }
    writer.abort();
}
