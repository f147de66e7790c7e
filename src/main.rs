//! qrtc server binary
//!
//! Loads configuration, starts the HTTP introspection endpoints and the
//! QUIC relay, and shuts both down on SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use qrtc::http::{router, AppState};
use qrtc::server::{ClientRegistry, RelayServer};
use qrtc::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config =
        Config::load(Path::new(&config_path)).context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level.to_filter())
        .init();
    info!("starting qrtc {}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(ClientRegistry::new());
    let shutdown = CancellationToken::new();

    // HTTP introspection endpoints.
    let state = Arc::new(AppState {
        config: config.clone(),
        registry: Arc::clone(&registry),
    });
    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", http_addr))?;
    info!("HTTP introspection listening on {}", http_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, router(state)).await {
            error!("HTTP server error: {}", e);
        }
    });

    // QUIC relay.
    let server = RelayServer::bind(&config, registry, shutdown.clone())
        .context("failed to start the QUIC relay")?;
    let relay = tokio::spawn(server.run());

    wait_for_shutdown_signal().await;
    shutdown.cancel();
    relay.await.context("relay task panicked")?;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
}
