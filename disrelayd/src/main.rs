mod api;
mod config;
mod directory;
mod error;
mod events;
mod mdns;
mod relay;
mod state;

use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::events::EventChannel;
use crate::mdns::advertise::MdnsAdvertiser;
use crate::relay::client::RelayClient;
use crate::relay::server::RelayServer;
use crate::state::StateHandle;

const DEFAULT_CONFIG_PATH: &str = "/etc/disrelay/disrelayd.toml";

// All socket I/O shares one reactor thread
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("disrelayd=info"))
        )
        .init();

    tracing::info!("Starting disrelayd");

    // Load config
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("Failed to load config from {}", DEFAULT_CONFIG_PATH))?,
        None => {
            tracing::info!("No config file, using defaults");
            Config::default()
        }
    };

    // State thread and event bus
    let channel = EventChannel::new(1024);
    let observer = tokio::spawn(events::log_observer(channel.subscribe()));
    let state = StateHandle::spawn(config.state.message_log_capacity, channel);

    // Without discovery there is nothing to do, so this is fatal
    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.discovery.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    let advertiser = MdnsAdvertiser::new(mdns_daemon.clone(), &config.discovery)?;
    let server = RelayServer::spawn(config.relay.clone(), Arc::new(advertiser), state.events());
    let client = RelayClient::new(state.clone());

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn mDNS browser task
    let browser_cancel = cancel.clone();
    let browser_daemon = mdns_daemon.clone();
    let browser_type = config.discovery.service_type.clone();
    let browser_events = state.events();
    let browser_handle = tokio::spawn(async move {
        if let Err(e) = mdns::browser::run_browser(browser_daemon, browser_type, browser_events, browser_cancel).await {
            tracing::error!("mDNS browser error: {}", e);
        }
    });

    if config.relay.autostart {
        if let Err(e) = server.start().await {
            tracing::error!("Autostart failed: {}", e);
        }
    }

    // Build API router
    let app_state = api::routes::AppState {
        state: state.clone(),
        server: server.clone(),
        client: client.clone(),
        pdu_clock: Arc::new(AtomicU32::new(1)),
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("API server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();
    let _ = tokio::join!(browser_handle, api_handle);

    // Withdraws the advertisement and closes every session
    if let Err(e) = server.shutdown().await {
        tracing::error!("Failed to stop relay server: {}", e);
    }

    client.close_all();

    // Shutdown state thread
    if let Err(e) = state.shutdown().await {
        tracing::error!("Failed to shutdown state thread: {}", e);
    }
    let _ = observer.await;

    // Shutdown mDNS daemon
    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
