//! sockctx server
//!
//! Realtime WebSocket server. Every connection is served through a
//! connection context that exposes the upgrade request the way an HTTP
//! request context would.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sockctx::config::{Settings, CONFIG_FILE};
use sockctx::server::WebSocketServer;

/// sockctx server
///
/// Realtime WebSocket server with request-style connection contexts
#[derive(Parser, Debug)]
#[command(name = "sockctx")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the settings file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Trust X-Forwarded-* headers
    #[arg(long)]
    proxy: bool,

    /// Cookie signing key, newest first (repeatable)
    #[arg(long = "key")]
    keys: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("sockctx v{}", env!("CARGO_PKG_VERSION"));

    // Load settings, then apply command line overrides
    let mut settings = Settings::load(&args.config)?;
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(bind) = args.bind {
        settings.bind = bind;
    }
    if args.proxy {
        settings.proxy = true;
    }
    if !args.keys.is_empty() {
        settings.keys = args.keys;
    }

    if settings.proxy {
        info!("Trusting proxy headers");
    }
    if settings.keys.is_empty() {
        info!("No signing keys configured, signed cookies disabled");
    }

    let config = settings.into_server_config();
    info!("Serving namespaces: {}", config.namespaces.join(", "));

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
