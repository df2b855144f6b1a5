//! CLI interface for voicecast

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ServerConfig;

#[derive(Parser)]
#[command(name = "voicecast")]
#[command(about = "Push synthesized speech and captions to OBS browser-source overlays", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default when no command given)
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// HTTP port
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Enable HTTPS with an auto-generated self-signed certificate
        /// (runs both HTTP and HTTPS)
        #[arg(long)]
        https: bool,
        /// HTTPS port (default: port + 363, e.g. 8080 -> 8443)
        #[arg(long)]
        https_port: Option<u16>,
        /// SQLite database path
        #[arg(long, default_value = "voicecast.db")]
        db: PathBuf,
        /// Directory for generated certificates
        #[arg(long, default_value = ".ssl")]
        cert_dir: PathBuf,
        /// Path to an SSL certificate file (use with --ssl-key)
        #[arg(long)]
        ssl_cert: Option<PathBuf>,
        /// Path to an SSL private key file (use with --ssl-cert)
        #[arg(long)]
        ssl_key: Option<PathBuf>,
    },
    /// Print version information
    Version,
}

/// Entry point called from main.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => serve(ServerConfig::default()).await,
        Some(Commands::Serve {
            host,
            port,
            https,
            https_port,
            db,
            cert_dir,
            ssl_cert,
            ssl_key,
        }) => {
            let config = ServerConfig {
                host,
                port,
                https,
                https_port,
                db_path: db,
                cert_dir,
                ssl_cert,
                ssl_key,
            };
            serve(config).await
        }
        Some(Commands::Version) => {
            println!("{} {}", crate::NAME, crate::VERSION);
            Ok(())
        }
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    println!();
    println!("  Voicecast");
    println!("  ─────────");
    println!("  Dashboard:    http://{}:{}/", config.host, config.port);
    if config.https || (config.ssl_cert.is_some() && config.ssl_key.is_some()) {
        println!(
            "  Dashboard:    https://{}:{}/",
            config.host,
            config.effective_https_port()
        );
        println!();
        println!("  Note: browsers will warn about the self-signed certificate.");
    }
    println!(
        "  Overlay URL:  http://{}:{}/ws/{{character}}",
        config.host, config.port
    );
    println!();

    crate::server::start(config).await
}
