//! Server configuration
//!
//! Runtime configuration comes from CLI flags plus environment variables for
//! upstream API keys. There is no config file; the server is meant to be
//! started from a launcher script or systemd unit with everything explicit.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Offset added to the HTTP port to derive the HTTPS port (8080 -> 8443).
pub const HTTPS_PORT_OFFSET: u16 = 363;

/// Default audio stream sample rate (Hz) negotiated with overlays.
pub const SAMPLE_RATE: u32 = 24_000;

/// Default audio channel count.
pub const CHANNELS: u32 = 1;

/// Server runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enable HTTPS with a self-signed certificate
    #[serde(default)]
    pub https: bool,
    /// HTTPS port (defaults to port + 363)
    pub https_port: Option<u16>,
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Directory for generated self-signed certificates
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    /// Explicit certificate file (overrides auto-generation)
    pub ssl_cert: Option<PathBuf>,
    /// Explicit private key file (overrides auto-generation)
    pub ssl_key: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> PathBuf {
    PathBuf::from("voicecast.db")
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from(".ssl")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            https: false,
            https_port: None,
            db_path: default_db_path(),
            cert_dir: default_cert_dir(),
            ssl_cert: None,
            ssl_key: None,
        }
    }
}

impl ServerConfig {
    /// Effective HTTPS port: explicit flag, or HTTP port + 363.
    pub fn effective_https_port(&self) -> u16 {
        self.https_port
            .unwrap_or_else(|| self.port.saturating_add(HTTPS_PORT_OFFSET))
    }

    /// Hostnames to embed in a generated self-signed certificate.
    pub fn cert_hostnames(&self) -> Vec<String> {
        let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        if self.host != "0.0.0.0" && !names.contains(&self.host) {
            names.push(self.host.clone());
        }
        names
    }
}

/// Read a required API key from the environment.
pub fn require_env_key(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => bail!("{} environment variable not set", name),
    }
}

/// OpenRouter API key.
pub fn openrouter_api_key() -> Result<String> {
    require_env_key("OPENROUTER_API_KEY")
}

/// ElevenLabs API key.
pub fn elevenlabs_api_key() -> Result<String> {
    require_env_key("ELEVENLABS_API_KEY")
}

/// Cartesia API key.
pub fn cartesia_api_key() -> Result<String> {
    require_env_key("CARTESIA_API_KEY")
}

/// Twitch application client id.
pub fn twitch_client_id() -> Option<String> {
    std::env::var("TWITCH_CLIENT_ID").ok().filter(|v| !v.is_empty())
}
