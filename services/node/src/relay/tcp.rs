//! Connection-oriented relay for Java endpoints.

use super::{FlowRecord, FlowRegistry, RelayConfig};
use obsidianprotection_common::metrics;
use obsidianprotection_common::types::{EndpointKind, EndpointSpec};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Accept loop for one Java endpoint. Exits when the shutdown signal fires;
/// outstanding flows keep running until the manager aborts the task.
pub(crate) async fn run_java_relay(
    spec: Arc<RwLock<EndpointSpec>>,
    config: RelayConfig,
    flows: FlowRegistry,
    flow_ids: Arc<AtomicU64>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (endpoint_id, front) = {
        let s = spec.read();
        (s.id.clone(), SocketAddr::from((s.front_ip, s.front_port)))
    };

    let listener = match TcpListener::bind(front).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(endpoint_id = %endpoint_id, %front, error = %e, "Failed to bind Java relay");
            return;
        }
    };
    info!(endpoint_id = %endpoint_id, %front, "Java relay listening");

    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(endpoint_id = %endpoint_id, "Java relay accept loop stopping");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((client, peer)) => {
                        // Back-pressure: refuse promptly rather than queueing.
                        if flows.len() >= config.max_connections {
                            warn!(endpoint_id = %endpoint_id, %peer, "Flow limit reached, refusing connection");
                            drop(client);
                            continue;
                        }

                        let flow = Arc::new(FlowRecord::new(
                            flow_ids.fetch_add(1, Ordering::Relaxed),
                            endpoint_id.clone(),
                            EndpointKind::Java,
                            peer,
                        ));
                        flows.insert(flow.id, Arc::clone(&flow));

                        let spec = Arc::clone(&spec);
                        let flows = Arc::clone(&flows);
                        let config = config.clone();
                        tasks.spawn(async move {
                            handle_java_flow(client, spec, config, Arc::clone(&flow)).await;
                            flows.remove(&flow.id);
                        });
                    }
                    Err(e) => {
                        error!(endpoint_id = %endpoint_id, error = %e, "Accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    // Drain until the grace window ends and the manager aborts us.
    while tasks.join_next().await.is_some() {}
}

async fn handle_java_flow(
    client: TcpStream,
    spec: Arc<RwLock<EndpointSpec>>,
    config: RelayConfig,
    flow: Arc<FlowRecord>,
) {
    let origin = {
        let s = spec.read();
        SocketAddr::from((s.origin_ip, s.origin_port))
    };

    let server = match timeout(config.tcp_timeout, TcpStream::connect(origin)).await {
        Ok(Ok(server)) => server,
        Ok(Err(e)) => {
            warn!(endpoint_id = %flow.endpoint_id, %origin, error = %e, "Origin dial failed");
            metrics::RELAY_ORIGIN_UNREACHABLE_TOTAL
                .with_label_values(&[&flow.endpoint_id])
                .inc();
            return;
        }
        Err(_) => {
            warn!(endpoint_id = %flow.endpoint_id, %origin, "Origin dial timed out");
            metrics::RELAY_ORIGIN_UNREACHABLE_TOTAL
                .with_label_values(&[&flow.endpoint_id])
                .inc();
            return;
        }
    };

    *flow.server_addr.write() = server.peer_addr().ok();
    metrics::ACTIVE_FLOWS
        .with_label_values(&[&flow.endpoint_id, "java"])
        .inc();

    let (client_read, client_write) = client.into_split();
    let (server_read, server_write) = server.into_split();

    // Either direction ending tears down both: the losing future is dropped,
    // which closes its halves.
    tokio::select! {
        _ = copy_half(client_read, server_write, Arc::clone(&flow), false, config.buffer_size) => {}
        _ = copy_half(server_read, client_write, Arc::clone(&flow), true, config.buffer_size) => {}
    }

    metrics::ACTIVE_FLOWS
        .with_label_values(&[&flow.endpoint_id, "java"])
        .dec();
    debug!(
        endpoint_id = %flow.endpoint_id,
        client = %flow.client_addr,
        bytes_in = flow.bytes_in.load(Ordering::Relaxed),
        bytes_out = flow.bytes_out.load(Ordering::Relaxed),
        "Java flow closed"
    );
}

async fn copy_half<R, W>(mut read: R, mut write: W, flow: Arc<FlowRecord>, inbound: bool, buffer_size: usize)
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let n = match read.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if write.write_all(&buffer[..n]).await.is_err() {
            break;
        }
        if inbound {
            flow.add_in(n);
        } else {
            flow.add_out(n);
        }
    }
    let _ = write.shutdown().await;
}
