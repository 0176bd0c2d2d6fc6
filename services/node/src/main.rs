//! ObsidianProtection edge node daemon.
//!
//! Loads the XDP filter, attaches it to the configured interface, then serves
//! the node control API while the map synchronizer's reaper and the flow
//! relay run in the background. `OBSIDIAN_STANDALONE=1` skips the kernel
//! attachment for development on machines without root or an XDP-capable
//! interface.

use obsidianprotection_common::{config::AppConfig, telemetry, types::NodeRegistration};
use obsidianprotection_node::ebpf::loader::FilterLoader;
use obsidianprotection_node::ebpf::sync::MapSync;
use obsidianprotection_node::handlers::{self, NodeState};
use obsidianprotection_node::relay::{RelayConfig, RelayManager};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "edge-node";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("OBSIDIAN_CONFIG").ok();
    let config = AppConfig::load(config_path.as_deref())?;
    config.validate().map_err(std::io::Error::other)?;
    let config = Arc::new(config);

    telemetry::init(SERVICE_NAME, &config.monitoring)?;
    info!("Starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));

    if !nix::unistd::geteuid().is_root() {
        warn!("Not running as root, XDP attachment may fail");
    }

    let standalone = std::env::var("OBSIDIAN_STANDALONE").is_ok();

    // Attach the fast path. Attachment failure is fatal: an edge node that
    // cannot filter must not advertise itself.
    let (_loader, sync) = if standalone {
        warn!("Standalone mode: kernel fast path disabled");
        (None, Arc::new(MapSync::standalone()))
    } else {
        let mut loader = FilterLoader::load_from_file(Path::new(&config.proxy.ebpf_object))
            .map_err(|e| fatal("load XDP object", &e))?;
        loader
            .attach(&config.proxy.xdp_interface)
            .map_err(|e| fatal("attach XDP program", &e))?;
        let sync = MapSync::from_ebpf(loader.ebpf_mut()).map_err(|e| fatal("open maps", &e))?;
        (Some(loader), Arc::new(sync))
    };

    let relay = Arc::new(RelayManager::new(RelayConfig::from(&config.proxy)));

    let node_id = std::env::var("OBSIDIAN_NODE_ID")
        .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
    let state = NodeState::new(
        node_id.clone(),
        Arc::clone(&sync),
        Arc::clone(&relay),
        Arc::clone(&config),
    );

    // Reaper: cadence independent of operator activity.
    {
        let sync = Arc::clone(&sync);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                if let Err(e) = sync.reap_expired() {
                    warn!(error = %e, "Reaper pass failed");
                }
            }
        });
    }

    // Control API.
    let control_addr: SocketAddr = config.node.control_address.parse()?;
    let router = handlers::http::create_router(state);
    let listener = tokio::net::TcpListener::bind(control_addr)
        .await
        .map_err(|e| {
            error!(%control_addr, error = %e, "Failed to bind control API");
            e
        })?;
    info!(%control_addr, "Control API listening");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "Control API server exited");
        }
    });

    // Announce ourselves to the control plane when one is configured.
    if let Ok(control_plane) = std::env::var("OBSIDIAN_CONTROL_PLANE_ADDR") {
        register_with_control_plane(&control_plane, &node_id, &config).await;
    }

    shutdown_signal().await;
    info!("Shutting down");

    server.abort();
    relay.shutdown().await;
    if let Err(e) = sync.reap_expired() {
        warn!(error = %e, "Final reap failed");
    }
    // Dropping the loader detaches the filter.

    Ok(())
}

fn fatal(what: &str, err: &obsidianprotection_common::Error) -> std::io::Error {
    error!(error = %err, "Fatal: failed to {what}");
    std::io::Error::other(format!("failed to {what}: {err}"))
}

/// Best-effort registration; the fleet manager's health polling takes over
/// from here. A failure is logged, not fatal: the operator can register the
/// node out of band.
async fn register_with_control_plane(control_plane: &str, node_id: &str, config: &AppConfig) {
    let name = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let registration = NodeRegistration {
        id: node_id.to_string(),
        name,
        ip: config
            .node
            .control_address
            .split(':')
            .next()
            .unwrap_or("0.0.0.0")
            .to_string(),
        control_address: config.node.control_address.clone(),
        interface: config.proxy.xdp_interface.clone(),
    };

    let url = format!("{}/api/v1/nodes", control_plane.trim_end_matches('/'));
    let token = std::env::var("OBSIDIAN_API_TOKEN").unwrap_or_else(|_| "edge-node".to_string());
    let client = reqwest::Client::new();
    match client
        .post(&url)
        .bearer_auth(token)
        .json(&registration)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            info!(node_id, "Registered with control plane");
        }
        Ok(response) => {
            warn!(node_id, status = %response.status(), "Control plane rejected registration");
        }
        Err(e) => {
            warn!(node_id, error = %e, "Control plane registration failed");
        }
    }
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
