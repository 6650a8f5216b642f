//! Relay server binary.
//!
//! Serves the webhook endpoint and operator API, and runs the background
//! consumer that relays webhooks to the WebSocket endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::{router, AppState, Config, ContactCache, GraphClient, Relay, WebSocketSink};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("relay_server_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        websocket_url = %config.websocket_url,
        retry_delay_ms = config.retry_delay.as_millis() as u64,
        max_attempts = ?config.max_attempts,
        signature_verification = config.app_secret.is_some(),
        "config_loaded"
    );

    let sink = Arc::new(WebSocketSink::new(
        config.websocket_url.clone(),
        config.probe_timeout,
    ));
    let settings = config.processor_settings();
    let capacity = config.dead_letter_capacity;
    let relay = Relay::global_or_init(move || Relay::new(sink, settings, capacity))
        .await
        .context("Failed to initialise relay")?;
    relay.start();

    let contacts = ContactCache::open(&config.contacts_db_path)
        .context("Failed to open contact database")?;

    let outbound = match GraphClient::from_config(&config) {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "outbound_disabled");
            None
        }
    };

    let port = config.port;
    let app = router(AppState::new(config, Arc::clone(&relay), Arc::new(contacts), outbound));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "relay_server_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    relay.shutdown().await;

    info!("relay_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("relay_server_shutting_down");
}
