//! Web server: REST surface, overlay/dashboard WebSockets, startup wiring.

pub mod handlers;
pub mod ws;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::routing::{delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::coordinator::GenerationCoordinator;
use crate::db::Database;
use crate::llm::OpenRouterClient;
use crate::memory::ConversationMemory;
use crate::registry::ConnectionRegistry;
use crate::twitch::{ChatBuffer, EventSubConfig, HelixClient, TwitchEvent, TwitchManager};
use crate::wish::{OpenRouterWishModel, WishSessionManager, WishSpeaker};

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub db: Arc<Database>,
    pub registry: Arc<ConnectionRegistry>,
    pub coordinator: Arc<GenerationCoordinator>,
    pub memory: Arc<ConversationMemory>,
    pub chat_buffer: Arc<ChatBuffer>,
    pub twitch: Arc<TwitchManager>,
    pub wish: Arc<WishSessionManager>,
}

/// Speaks wish-session utterances through the generation coordinator on
/// the configured character's overlays.
struct CoordinatorSpeaker {
    db: Arc<Database>,
    coordinator: Arc<GenerationCoordinator>,
}

#[async_trait]
impl WishSpeaker for CoordinatorSpeaker {
    async fn speak(&self, text: &str) -> Result<()> {
        let config = match self.db.get_wish_config().await {
            Ok(Some(raw)) => serde_json::from_value::<crate::wish::WishConfig>(raw)
                .unwrap_or_default(),
            _ => crate::wish::WishConfig::default(),
        };
        let Some(name) = config.character else {
            warn!("Wish session has no character configured; dropping speech");
            return Ok(());
        };
        let character = self
            .db
            .get_character(&name)
            .await
            .map_err(|e| anyhow::anyhow!(e))?
            .with_context(|| format!("wish character '{}' not found", name))?;
        self.coordinator.speak(&character, text, true).await?;
        Ok(())
    }
}

/// Build the axum router over a prepared state.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // WebSockets. The dashboard routes must come before the character
        // wildcard.
        .route("/ws/dashboard", get(ws::dashboard_ws))
        .route("/ws/wish-dashboard", get(ws::wish_dashboard_ws))
        .route("/ws/chat-view", get(ws::chat_view_ws))
        .route("/ws/{character}", get(ws::overlay_ws))
        // Characters
        .route(
            "/api/characters",
            get(handlers::list_characters).post(handlers::create_character),
        )
        .route(
            "/api/characters/{name}",
            get(handlers::get_character)
                .put(handlers::update_character)
                .delete(handlers::delete_character),
        )
        .route("/api/characters/{name}/speak", post(handlers::speak))
        .route("/api/characters/{name}/chat", post(handlers::chat))
        .route("/api/characters/{name}/stop", post(handlers::stop))
        .route(
            "/api/characters/{name}/memory",
            get(handlers::get_memory).delete(handlers::clear_memory),
        )
        // TTS catalogs
        .route("/api/tts/{provider}/voices", get(handlers::list_voices))
        .route("/api/tts/{provider}/models", get(handlers::list_models))
        // Twitch
        .route(
            "/api/twitch/auth",
            get(handlers::twitch_auth_status).post(handlers::twitch_auth_set),
        )
        .route(
            "/api/rewards",
            get(handlers::list_rewards).post(handlers::create_reward),
        )
        .route("/api/rewards/{id}", delete(handlers::delete_reward))
        .route("/api/rewards/{id}/enabled", post(handlers::set_reward_enabled))
        .route("/api/redemptions/{id}", post(handlers::update_redemption))
        // Wish session
        .route("/api/wish/state", get(handlers::wish_state))
        .route(
            "/api/wish/config",
            get(handlers::get_wish_config).put(handlers::set_wish_config),
        )
        .route("/api/wish/override", post(handlers::wish_override))
        // Presets and history
        .route(
            "/api/presets",
            get(handlers::list_presets).post(handlers::create_preset),
        )
        .route("/api/presets/{id}", delete(handlers::delete_preset))
        .route("/api/history", get(handlers::playback_history))
        // Probes
        .route("/health", get(handlers::health))
        .route("/version", get(handlers::version))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Construct all server state and background tasks, then serve.
pub async fn start(config: ServerConfig) -> Result<()> {
    let config = Arc::new(config);
    let db = Arc::new(
        Database::open(&config.db_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open database: {}", e))?,
    );
    let registry = Arc::new(ConnectionRegistry::new());
    let memory = Arc::new(ConversationMemory::new(db.clone()));
    memory.load_persisted().await?;
    let coordinator = Arc::new(GenerationCoordinator::new(registry.clone(), memory.clone()));
    let chat_buffer = Arc::new(ChatBuffer::new());

    let (events_tx, mut events_rx) = mpsc::channel::<TwitchEvent>(256);
    let twitch = Arc::new(TwitchManager::new(events_tx));

    let llm = OpenRouterClient::from_env().unwrap_or_else(|_| {
        warn!("OPENROUTER_API_KEY not set; chat and wish sessions will fail upstream");
        OpenRouterClient::new(String::new())
    });
    let wish_model = Arc::new(OpenRouterWishModel {
        client: llm.clone(),
        model: crate::wish::WishConfig::default().model,
    });
    let speaker = Arc::new(CoordinatorSpeaker {
        db: db.clone(),
        coordinator: coordinator.clone(),
    });
    let wish = Arc::new(WishSessionManager::new(
        wish_model,
        speaker,
        db.clone(),
        registry.clone(),
        chat_buffer.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        db: db.clone(),
        registry: registry.clone(),
        coordinator,
        memory,
        chat_buffer: chat_buffer.clone(),
        twitch: twitch.clone(),
        wish: wish.clone(),
    };

    // Twitch event dispatcher: buffer + chat view + wish session
    {
        let chat_buffer = chat_buffer.clone();
        let registry = registry.clone();
        let wish = wish.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    TwitchEvent::Chat(message) => {
                        chat_buffer.add(crate::twitch::StoredChatMessage {
                            user_id: message.user_id.clone(),
                            user_login: message.user_login.clone(),
                            display_name: message.user_display_name.clone(),
                            text: message.text.clone(),
                            timestamp: chrono::Utc::now(),
                        });
                        registry
                            .broadcast_chat_view(serde_json::json!({
                                "type": "chat_message",
                                "display_name": message.user_display_name,
                                "text": message.text,
                            }))
                            .await;
                        wish.handle_chat_message(message).await;
                    }
                    TwitchEvent::Redemption(redemption) => {
                        info!(
                            "Redemption: {} redeemed '{}'",
                            redemption.user_display_name, redemption.reward_title
                        );
                        if let Err(e) = wish.start_session(&redemption).await {
                            error!("Failed to start wish session: {}", e);
                        }
                    }
                    TwitchEvent::Disconnected(reason) => {
                        warn!("Twitch EventSub disconnected: {}", reason);
                    }
                }
            }
        });
    }

    // Resume EventSub from a stored token
    if let (Ok(Some((token, broadcaster, user))), Some(client_id)) = (
        db.get_twitch_token().await,
        crate::config::twitch_client_id(),
    ) {
        match HelixClient::validate_token(&token).await {
            Ok((user_id, login)) => {
                let broadcaster_user_id = broadcaster.unwrap_or_else(|| user_id.clone());
                info!("Resuming Twitch EventSub as {}", login);
                twitch
                    .start(EventSubConfig {
                        access_token: token,
                        client_id,
                        broadcaster_user_id,
                        user_id: user.unwrap_or(user_id),
                        reward_id: None,
                    })
                    .await;
            }
            Err(e) => warn!("Stored Twitch token is invalid: {}", e),
        }
    }

    // Liveness loop
    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(registry.clone().run_liveness(shutdown_tx.subscribe()));

    let app = build_router(state);
    serve(&config, app).await
}

/// Bind HTTP (and optionally HTTPS with a self-signed cert) and serve.
async fn serve(config: &ServerConfig, app: Router) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid bind address")?;

    let tls = if let (Some(cert), Some(key)) = (&config.ssl_cert, &config.ssl_key) {
        Some((cert.clone(), key.clone()))
    } else if config.https {
        let (cert, key) = crate::tls::ensure_ssl_certs(&config.cert_dir, &config.cert_hostnames())?;
        Some((cert, key))
    } else {
        None
    };

    info!("Listening on http://{}", addr);

    match tls {
        Some((cert_path, key_path)) => {
            let https_addr: SocketAddr = format!("{}:{}", config.host, config.effective_https_port())
                .parse()
                .context("invalid HTTPS bind address")?;
            let rustls_config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert_path, &key_path)
                    .await
                    .context("failed to load TLS certificate")?;
            info!("Listening on https://{}", https_addr);

            let http_app = app.clone();
            let http = async move {
                axum::serve(
                    tokio::net::TcpListener::bind(addr).await?,
                    http_app.into_make_service(),
                )
                .await
                .map_err(anyhow::Error::from)
            };
            let https = async move {
                axum_server::bind_rustls(https_addr, rustls_config)
                    .serve(app.into_make_service())
                    .await
                    .map_err(anyhow::Error::from)
            };
            tokio::try_join!(http, https)?;
        }
        None => {
            axum::serve(
                tokio::net::TcpListener::bind(addr).await?,
                app.into_make_service(),
            )
            .await?;
        }
    }
    Ok(())
}
