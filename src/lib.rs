//! Voicecast - real-time TTS and caption orchestration for OBS overlays
//!
//! A single-process server that turns text prompts (direct input, LLM
//! dialogue, or Twitch-driven wish sessions) into synchronized speech and
//! captions rendered by browser-source overlays:
//! - OpenRouter streaming LLM client
//! - ElevenLabs / Cartesia streaming TTS with word timing
//! - Per-character overlay fan-out with application-level liveness
//! - Generation coordination (at most one active generation per character)
//! - Two-tier conversation memory with interrupted-message reconciliation
//! - Channel-point wish sessions with chat voting

// Core modules
pub mod config;
pub mod db;
pub mod llm;
pub mod memory;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod tts;

// Pipeline
pub mod chat_pipeline;
pub mod coordinator;
pub mod streamer;

// Integrations and orchestration
pub mod server;
pub mod tls;
pub mod twitch;
pub mod wish;

pub mod cli;

// Re-export commonly used types
pub use coordinator::{Generation, GenerationCoordinator, GenerationOutcome};
pub use llm::OpenRouterClient;
pub use memory::ConversationMemory;
pub use registry::ConnectionRegistry;
pub use streamer::{StreamSink, TextSource, TtsStreamer};
pub use tts::{TtsProvider, TtsSettings};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Build identifier reported in the overlay hello frame.
pub const BUILD_ID: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));
