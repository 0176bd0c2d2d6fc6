//! Session-keyed datagram relay for Bedrock endpoints.

use super::{FlowRecord, FlowRegistry, RelayConfig};
use dashmap::DashMap;
use obsidianprotection_common::metrics;
use obsidianprotection_common::types::{EndpointKind, EndpointSpec};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

struct UdpSession {
    upstream: Arc<UdpSocket>,
    flow: Arc<FlowRecord>,
    reader: AbortHandle,
}

/// Datagram loop for one Bedrock endpoint: sessions are keyed by client
/// address, each with a connected ephemeral upstream socket and a reader task
/// bounded by the UDP read deadline. Idle sessions are swept every second.
pub(crate) async fn run_bedrock_relay(
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

    let socket = match UdpSocket::bind(front).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            error!(endpoint_id = %endpoint_id, %front, error = %e, "Failed to bind Bedrock relay");
            return;
        }
    };
    info!(endpoint_id = %endpoint_id, %front, "Bedrock relay listening");

    let sessions: Arc<DashMap<SocketAddr, UdpSession>> = Arc::new(DashMap::new());
    let mut readers = JoinSet::new();
    let mut sweep = interval(std::time::Duration::from_secs(1));
    let mut buffer = vec![0u8; config.buffer_size.max(2048)];

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(endpoint_id = %endpoint_id, "Bedrock relay stopping");
                break;
            }
            _ = sweep.tick() => {
                expire_idle_sessions(&sessions, &flows, &config);
            }
            received = socket.recv_from(&mut buffer) => {
                let (len, client) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!(endpoint_id = %endpoint_id, error = %e, "Datagram receive failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        continue;
                    }
                };

                let existing = sessions
                    .get(&client)
                    .map(|session| (Arc::clone(&session.upstream), Arc::clone(&session.flow)));
                if let Some((upstream, flow)) = existing {
                    if upstream.send(&buffer[..len]).await.is_ok() {
                        flow.add_out(len);
                    }
                    continue;
                }

                if flows.len() >= config.max_connections {
                    warn!(endpoint_id = %endpoint_id, %client, "Session limit reached, datagram dropped");
                    continue;
                }

                match open_session(
                    &spec,
                    &config,
                    &flows,
                    &flow_ids,
                    &socket,
                    client,
                    &mut readers,
                )
                .await
                {
                    Ok(session) => {
                        if session.upstream.send(&buffer[..len]).await.is_ok() {
                            session.flow.add_out(len);
                        }
                        sessions.insert(client, session);
                    }
                    Err(e) => {
                        warn!(endpoint_id = %endpoint_id, %client, error = %e, "Failed to open session");
                    }
                }
            }
        }
    }

    for entry in sessions.iter() {
        entry.value().reader.abort();
    }
    flows.retain(|_, flow| flow.endpoint_id != endpoint_id);
    readers.shutdown().await;
}

async fn open_session(
    spec: &Arc<RwLock<EndpointSpec>>,
    config: &RelayConfig,
    flows: &FlowRegistry,
    flow_ids: &Arc<AtomicU64>,
    listener: &Arc<UdpSocket>,
    client: SocketAddr,
    readers: &mut JoinSet<()>,
) -> std::io::Result<UdpSession> {
    let (endpoint_id, origin) = {
        let s = spec.read();
        (s.id.clone(), SocketAddr::from((s.origin_ip, s.origin_port)))
    };

    let upstream = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(upstream) => upstream,
        Err(e) => {
            metrics::RELAY_ORIGIN_UNREACHABLE_TOTAL
                .with_label_values(&[&endpoint_id])
                .inc();
            return Err(e);
        }
    };
    if let Err(e) = upstream.connect(origin).await {
        metrics::RELAY_ORIGIN_UNREACHABLE_TOTAL
            .with_label_values(&[&endpoint_id])
            .inc();
        return Err(e);
    }
    let upstream = Arc::new(upstream);

    let flow = Arc::new(FlowRecord::new(
        flow_ids.fetch_add(1, Ordering::Relaxed),
        endpoint_id.clone(),
        EndpointKind::Bedrock,
        client,
    ));
    *flow.server_addr.write() = Some(origin);
    flows.insert(flow.id, Arc::clone(&flow));
    metrics::ACTIVE_FLOWS
        .with_label_values(&[&endpoint_id, "bedrock"])
        .inc();
    debug!(endpoint_id = %endpoint_id, %client, %origin, "Bedrock session opened");

    let reader = {
        let upstream = Arc::clone(&upstream);
        let listener = Arc::clone(listener);
        let flow = Arc::clone(&flow);
        let read_deadline = config.udp_timeout;
        readers.spawn(async move {
            let mut buffer = vec![0u8; 2048];
            loop {
                match timeout(read_deadline, upstream.recv(&mut buffer)).await {
                    Ok(Ok(len)) => {
                        if listener.send_to(&buffer[..len], flow.client_addr).await.is_ok() {
                            flow.add_in(len);
                        }
                    }
                    Ok(Err(_)) => break,
                    Err(_) => {
                        // Read deadline; exit once the session has gone idle.
                        if flow.idle_ms() >= read_deadline.as_millis() as u64 {
                            break;
                        }
                    }
                }
            }
        })
    };

    Ok(UdpSession {
        upstream,
        flow,
        reader,
    })
}

fn expire_idle_sessions(
    sessions: &DashMap<SocketAddr, UdpSession>,
    flows: &FlowRegistry,
    config: &RelayConfig,
) {
    let idle_limit = config.udp_timeout.as_millis() as u64;
    let expired: Vec<SocketAddr> = sessions
        .iter()
        .filter(|entry| entry.value().flow.idle_ms() >= idle_limit)
        .map(|entry| *entry.key())
        .collect();

    for client in expired {
        if let Some((_, session)) = sessions.remove(&client) {
            session.reader.abort();
            flows.remove(&session.flow.id);
            metrics::ACTIVE_FLOWS
                .with_label_values(&[&session.flow.endpoint_id, "bedrock"])
                .dec();
            debug!(
                %client,
                bytes_in = session.flow.bytes_in.load(Ordering::Relaxed),
                bytes_out = session.flow.bytes_out.load(Ordering::Relaxed),
                "Bedrock session expired"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    async fn start_udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];
            while let Ok((len, peer)) = socket.recv_from(&mut buffer).await {
                let _ = socket.send_to(&buffer[..len], peer).await;
            }
        });
        addr
    }

    fn relay_spec(id: &str, front_port: u16, origin: SocketAddr) -> Arc<RwLock<EndpointSpec>> {
        Arc::new(RwLock::new(EndpointSpec {
            id: id.into(),
            name: "bedrock".into(),
            front_ip: Ipv4Addr::LOCALHOST,
            front_port,
            origin_ip: Ipv4Addr::LOCALHOST,
            origin_port: origin.port(),
            kind: EndpointKind::Bedrock,
            rate_limit: 1000,
            burst_limit: 5000,
            maintenance: false,
            active: true,
        }))
    }

    fn test_config(udp_timeout: Duration) -> RelayConfig {
        RelayConfig {
            enable_tcp: true,
            enable_udp: true,
            tcp_timeout: Duration::from_secs(2),
            udp_timeout,
            max_connections: 8,
            buffer_size: 4096,
            shutdown_grace: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn forwards_datagrams_per_session() {
        let origin = start_udp_echo().await;

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let front_port = probe.local_addr().unwrap().port();
        drop(probe);

        let spec = relay_spec("ep-bedrock-echo", front_port, origin);
        let flows: FlowRegistry = Arc::new(DashMap::new());
        let ids = Arc::new(AtomicU64::new(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(run_bedrock_relay(
            spec,
            test_config(Duration::from_secs(2)),
            Arc::clone(&flows),
            ids,
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(("127.0.0.1", front_port)).await.unwrap();
        client.send(b"ping-payload").await.unwrap();

        let mut buffer = [0u8; 64];
        let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buffer))
            .await
            .expect("echo before deadline")
            .unwrap();
        assert_eq!(&buffer[..len], b"ping-payload");

        assert_eq!(flows.len(), 1);
        let flow = flows.iter().next().unwrap();
        assert_eq!(flow.bytes_out.load(Ordering::Relaxed), 12);
        assert_eq!(flow.bytes_in.load(Ordering::Relaxed), 12);

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn idle_sessions_are_expired() {
        let origin = start_udp_echo().await;

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let front_port = probe.local_addr().unwrap().port();
        drop(probe);

        let spec = relay_spec("ep-bedrock-idle", front_port, origin);
        let flows: FlowRegistry = Arc::new(DashMap::new());
        let ids = Arc::new(AtomicU64::new(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(run_bedrock_relay(
            spec,
            test_config(Duration::from_millis(300)),
            Arc::clone(&flows),
            ids,
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(("127.0.0.1", front_port)).await.unwrap();
        client.send(b"hello").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(flows.len(), 1);

        // Past the idle timeout plus a sweep tick the session is gone.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(flows.is_empty(), "idle session expired");

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn undialable_origin_bumps_counter() {
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let front_port = probe.local_addr().unwrap().port();
        drop(probe);

        // Port 0 cannot be connected to; the session dial fails outright.
        let origin: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let spec = relay_spec("ep-bedrock-unreachable", front_port, origin);
        let flows: FlowRegistry = Arc::new(DashMap::new());
        let ids = Arc::new(AtomicU64::new(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let unreachable_before = metrics::RELAY_ORIGIN_UNREACHABLE_TOTAL
            .with_label_values(&["ep-bedrock-unreachable"])
            .get();

        tokio::spawn(run_bedrock_relay(
            spec,
            test_config(Duration::from_secs(1)),
            Arc::clone(&flows),
            ids,
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(("127.0.0.1", front_port)).await.unwrap();
        client.send(b"hello").await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let unreachable_after = metrics::RELAY_ORIGIN_UNREACHABLE_TOTAL
            .with_label_values(&["ep-bedrock-unreachable"])
            .get();
        assert!(
            unreachable_after >= unreachable_before + 1.0,
            "origin-unreachable counter bumped"
        );
        assert!(flows.is_empty(), "no flow record kept for failed session");

        let _ = shutdown_tx.send(());
    }
}
