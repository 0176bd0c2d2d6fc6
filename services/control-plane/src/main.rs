//! ObsidianProtection control plane daemon.
//!
//! Opens the desired-state store, restores the fleet and the authoritative
//! endpoint set, starts health polling and serves the operator API. Failure
//! to open the store or bind the listener is fatal.

use obsidianprotection_common::{config::AppConfig, db, telemetry};
use obsidianprotection_control_plane::allocator::FrontAllocator;
use obsidianprotection_control_plane::api::{self, AppState};
use obsidianprotection_control_plane::events;
use obsidianprotection_control_plane::fleet::FleetManager;
use obsidianprotection_control_plane::storage::Store;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tracing::{error, info};

const SERVICE_NAME: &str = "control-plane";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("OBSIDIAN_CONFIG").ok();
    let config = AppConfig::load(config_path.as_deref())?;
    config.validate().map_err(std::io::Error::other)?;
    let config = Arc::new(config);

    telemetry::init(SERVICE_NAME, &config.monitoring)?;
    info!("Starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));

    // Store (fatal on failure).
    let pool = db::create_pool(&config.database).await.map_err(|e| {
        error!(error = %e, "Fatal: failed to open store");
        std::io::Error::other(e.to_string())
    })?;
    let store = Store::new(pool);
    store.run_migrations().await.map_err(|e| {
        error!(error = %e, "Fatal: migrations failed");
        std::io::Error::other(e.to_string())
    })?;

    let events = events::channel();
    let fleet = Arc::new(FleetManager::new(
        &config.node,
        Some(store.clone()),
        events.clone(),
    ));

    // Restore fleet and authoritative endpoint state.
    let mut allocator = FrontAllocator::from_config(&config.node)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let rows = store.list_all_endpoints().await?;
    let mut specs = Vec::with_capacity(rows.len());
    for row in &rows {
        if let Ok(front_ip) = row.front_ip.parse() {
            allocator.mark_used(front_ip, row.front_port as u16);
        }
        specs.push(row.to_spec()?);
    }
    info!(endpoints = specs.len(), "Restored endpoint state");
    fleet.seed_endpoints(specs);

    for node in store.list_nodes().await? {
        fleet.adopt_node(&node);
    }
    info!(nodes = fleet.nodes().len(), "Restored fleet state");

    let polling = fleet.start();

    let state = AppState {
        store,
        fleet: Arc::clone(&fleet),
        events,
        config: Arc::clone(&config),
        allocator: Arc::new(Mutex::new(allocator)),
        started: Instant::now(),
    };

    // Operator API (fatal on bind failure).
    let addr: SocketAddr = config.api.address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(%addr, error = %e, "Fatal: failed to bind API listener");
        e
    })?;
    info!(%addr, "Operator API listening");

    let router = api::create_router(state);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "API server exited");
        }
    });

    shutdown_signal().await;
    info!("Shutting down");

    fleet.stop();
    let _ = polling.await;
    server.abort();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
