//! Chunkvault Server
//!
//! Accepts large files as resumable chunk uploads and stores every chunk
//! encrypted under its own key.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chunkvault_server::config::Config;
use chunkvault_server::routes;
use chunkvault_server::state::AppState;
use chunkvault_server::upload::LoggingRegistrar;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "chunkvault_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Chunkvault Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Raw staging: {}", config.upload.raw_dir.display());
    tracing::info!("Processed staging: {}", config.upload.processed_dir.display());
    tracing::info!("Cipher: {}", config.upload.cipher);

    // Create application state (starts the encryption pool and expiry sweep)
    let app_state = AppState::new(config, Arc::new(LoggingRegistrar))
        .await
        .context("Failed to initialize application state")?;

    let app = routes::app(app_state.clone());

    // Start server with graceful shutdown
    let server = &app_state.config().server;
    let host: std::net::IpAddr = server
        .host
        .parse()
        .with_context(|| format!("Invalid SERVER_HOST: {}", server.host))?;
    let addr = SocketAddr::new(host, server.port);
    tracing::info!("Chunkvault Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    app_state.shutdown().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
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
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
