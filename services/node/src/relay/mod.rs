//! User-space flow relay for accepted traffic.
//!
//! Java endpoints get a connection-oriented proxy, Bedrock endpoints a
//! session-keyed datagram proxy. The manager starts one relay task per
//! endpoint, tracks every live flow in a shared registry and propagates
//! shutdown with a grace window before outstanding flows are cut.

pub mod tcp;
pub mod udp;

use dashmap::DashMap;
use obsidianprotection_common::config::ProxyConfig;
use obsidianprotection_common::error::{Error, Result};
use obsidianprotection_common::metrics;
use obsidianprotection_common::types::{EndpointKind, EndpointSpec};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Relay tuning derived from the proxy section of the configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub enable_tcp: bool,
    pub enable_udp: bool,
    pub tcp_timeout: Duration,
    pub udp_timeout: Duration,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub shutdown_grace: Duration,
}

impl From<&ProxyConfig> for RelayConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            enable_tcp: config.enable_tcp_proxy,
            enable_udp: config.enable_udp_proxy,
            tcp_timeout: Duration::from_secs(config.tcp_timeout),
            udp_timeout: Duration::from_secs(config.udp_timeout),
            max_connections: config.max_connections as usize,
            buffer_size: config.buffer_size,
            shutdown_grace: Duration::from_secs(config.shutdown_grace),
        }
    }
}

/// Milliseconds since the Unix epoch, for flow idle accounting.
pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One relayed flow: a TCP connection or a UDP session.
#[derive(Debug)]
pub struct FlowRecord {
    pub id: u64,
    pub endpoint_id: String,
    pub kind: EndpointKind,
    pub client_addr: SocketAddr,
    pub server_addr: RwLock<Option<SocketAddr>>,
    pub started_ms: u64,
    pub last_seen_ms: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl FlowRecord {
    pub(crate) fn new(
        id: u64,
        endpoint_id: String,
        kind: EndpointKind,
        client_addr: SocketAddr,
    ) -> Self {
        let now = now_unix_ms();
        Self {
            id,
            endpoint_id,
            kind,
            client_addr,
            server_addr: RwLock::new(None),
            started_ms: now,
            last_seen_ms: AtomicU64::new(now),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        self.last_seen_ms.store(now_unix_ms(), Ordering::Relaxed);
    }

    pub fn idle_ms(&self) -> u64 {
        now_unix_ms().saturating_sub(self.last_seen_ms.load(Ordering::Relaxed))
    }

    /// Account bytes flowing origin -> client.
    pub fn add_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
        metrics::RELAY_BYTES_TOTAL
            .with_label_values(&[&self.endpoint_id, "in"])
            .inc_by(n as f64);
        self.touch();
    }

    /// Account bytes flowing client -> origin.
    pub fn add_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
        metrics::RELAY_BYTES_TOTAL
            .with_label_values(&[&self.endpoint_id, "out"])
            .inc_by(n as f64);
        self.touch();
    }
}

/// Registry of live flows, shared between relays and the status handlers.
pub type FlowRegistry = Arc<DashMap<u64, Arc<FlowRecord>>>;

struct RelayHandle {
    spec: Arc<RwLock<EndpointSpec>>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Starts, updates and stops per-endpoint relays.
pub struct RelayManager {
    config: RelayConfig,
    flows: FlowRegistry,
    relays: Mutex<HashMap<String, RelayHandle>>,
    flow_ids: Arc<AtomicU64>,
}

impl RelayManager {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            flows: Arc::new(DashMap::new()),
            relays: Mutex::new(HashMap::new()),
            flow_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn flows(&self) -> FlowRegistry {
        Arc::clone(&self.flows)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn relay_count(&self) -> usize {
        self.relays.lock().len()
    }

    /// Start a relay for an endpoint. Re-adding an existing endpoint behaves
    /// like an update.
    pub fn add_endpoint(&self, spec: EndpointSpec) -> Result<()> {
        if self.relays.lock().contains_key(&spec.id) {
            return self.update_endpoint(spec);
        }

        let enabled = match spec.kind {
            EndpointKind::Java => self.config.enable_tcp,
            EndpointKind::Bedrock => self.config.enable_udp,
        };
        if !enabled {
            warn!(endpoint_id = %spec.id, kind = spec.kind.as_str(), "Relay disabled by configuration");
            return Ok(());
        }

        let id = spec.id.clone();
        let shared = Arc::new(RwLock::new(spec));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = {
            let spec = Arc::clone(&shared);
            let config = self.config.clone();
            let flows = Arc::clone(&self.flows);
            let flow_ids = Arc::clone(&self.flow_ids);
            let kind = spec.read().kind;
            match kind {
                EndpointKind::Java => tokio::spawn(async move {
                    tcp::run_java_relay(spec, config, flows, flow_ids, shutdown_rx).await;
                }),
                EndpointKind::Bedrock => tokio::spawn(async move {
                    udp::run_bedrock_relay(spec, config, flows, flow_ids, shutdown_rx).await;
                }),
            }
        };

        self.relays.lock().insert(
            id,
            RelayHandle {
                spec: shared,
                shutdown: shutdown_tx,
                task,
            },
        );
        Ok(())
    }

    /// Apply a changed endpoint. Policy-only changes swap the spec in place;
    /// a moved front address restarts the listener.
    pub fn update_endpoint(&self, spec: EndpointSpec) -> Result<()> {
        let needs_restart = {
            let relays = self.relays.lock();
            match relays.get(&spec.id) {
                Some(handle) => {
                    let current = handle.spec.read();
                    current.front_ip != spec.front_ip
                        || current.front_port != spec.front_port
                        || current.kind != spec.kind
                }
                None => return self.add_endpoint(spec),
            }
        };

        if needs_restart {
            self.remove_endpoint(&spec.id)?;
            return self.add_endpoint(spec);
        }

        let relays = self.relays.lock();
        if let Some(handle) = relays.get(&spec.id) {
            *handle.spec.write() = spec;
        }
        Ok(())
    }

    pub fn remove_endpoint(&self, id: &str) -> Result<()> {
        let handle = self
            .relays
            .lock()
            .remove(id)
            .ok_or_else(|| Error::not_found("Relay", id))?;

        let _ = handle.shutdown.send(());
        handle.task.abort();
        self.flows.retain(|_, flow| flow.endpoint_id != id);
        info!(endpoint_id = %id, "Relay stopped");
        Ok(())
    }

    /// Graceful shutdown: stop accepting immediately, give outstanding flows
    /// the grace window, then cut them.
    pub async fn shutdown(&self) {
        let handles: Vec<RelayHandle> = {
            let mut relays = self.relays.lock();
            relays.drain().map(|(_, handle)| handle).collect()
        };

        if handles.is_empty() {
            return;
        }

        info!(relays = handles.len(), "Stopping relays");
        for handle in &handles {
            let _ = handle.shutdown.send(());
        }

        tokio::time::sleep(self.config.shutdown_grace).await;

        for handle in handles {
            handle.task.abort();
        }
        self.flows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn spec(id: &str, kind: EndpointKind, front_port: u16, origin_port: u16) -> EndpointSpec {
        EndpointSpec {
            id: id.into(),
            name: id.into(),
            front_ip: Ipv4Addr::LOCALHOST,
            front_port,
            origin_ip: Ipv4Addr::LOCALHOST,
            origin_port,
            kind,
            rate_limit: 1000,
            burst_limit: 5000,
            maintenance: false,
            active: true,
        }
    }

    fn config() -> RelayConfig {
        RelayConfig {
            enable_tcp: true,
            enable_udp: true,
            tcp_timeout: Duration::from_secs(2),
            udp_timeout: Duration::from_millis(500),
            max_connections: 4,
            buffer_size: 4096,
            shutdown_grace: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn disabled_kind_is_not_started() {
        let mut cfg = config();
        cfg.enable_udp = false;
        let manager = RelayManager::new(cfg);
        manager
            .add_endpoint(spec("b", EndpointKind::Bedrock, 0, 19132))
            .unwrap();
        assert_eq!(manager.relay_count(), 0);
    }

    #[tokio::test]
    async fn remove_unknown_relay_fails() {
        let manager = RelayManager::new(config());
        assert!(manager.remove_endpoint("ghost").is_err());
    }

    #[tokio::test]
    async fn policy_update_does_not_restart() {
        let manager = RelayManager::new(config());
        // Port 0 binds an ephemeral port; good enough to exercise lifecycle.
        manager
            .add_endpoint(spec("a", EndpointKind::Java, 0, 12345))
            .unwrap();
        assert_eq!(manager.relay_count(), 1);

        let mut updated = spec("a", EndpointKind::Java, 0, 12345);
        updated.rate_limit = 9;
        updated.burst_limit = 9;
        manager.update_endpoint(updated).unwrap();
        assert_eq!(manager.relay_count(), 1);

        manager.remove_endpoint("a").unwrap();
        assert_eq!(manager.relay_count(), 0);
    }

    #[test]
    fn flow_record_accounting() {
        let flow = FlowRecord::new(
            1,
            "ep".into(),
            EndpointKind::Java,
            "127.0.0.1:5000".parse().unwrap(),
        );
        flow.add_in(32);
        flow.add_out(16);
        assert_eq!(flow.bytes_in.load(Ordering::Relaxed), 32);
        assert_eq!(flow.bytes_out.load(Ordering::Relaxed), 16);
        assert!(flow.idle_ms() < 1000);
    }
}
