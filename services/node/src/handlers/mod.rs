//! Node control API: state shared across handlers and endpoint command
//! application.

pub mod http;

use crate::ebpf::sync::MapSync;
use crate::relay::RelayManager;
use obsidianprotection_common::config::AppConfig;
use obsidianprotection_common::error::Result;
use obsidianprotection_common::types::{CounterSnapshot, EndpointCommand, NodeStatusReport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Shared state behind the node control API.
#[derive(Clone)]
pub struct NodeState {
    pub node_id: String,
    pub sync: Arc<MapSync>,
    pub relay: Arc<RelayManager>,
    pub config: Arc<AppConfig>,
    rate_window: Arc<Mutex<RateWindow>>,
}

struct RateWindow {
    at: Instant,
    total_packets: u64,
}

impl NodeState {
    pub fn new(
        node_id: String,
        sync: Arc<MapSync>,
        relay: Arc<RelayManager>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            node_id,
            sync,
            relay,
            config,
            rate_window: Arc::new(Mutex::new(RateWindow {
                at: Instant::now(),
                total_packets: 0,
            })),
        }
    }

    /// Apply an endpoint command from the fleet manager to both the kernel
    /// maps and the relay.
    pub fn apply_command(&self, command: EndpointCommand) -> Result<()> {
        let endpoint_id = command.endpoint_id().to_string();
        match command {
            EndpointCommand::Add { endpoint } => {
                self.sync.add_endpoint(endpoint.clone())?;
                if endpoint.active {
                    self.relay.add_endpoint(endpoint)?;
                }
            }
            EndpointCommand::Update { endpoint } => {
                self.sync.update_endpoint(endpoint.clone())?;
                if endpoint.active {
                    self.relay.update_endpoint(endpoint)?;
                } else {
                    let _ = self.relay.remove_endpoint(&endpoint_id);
                }
            }
            EndpointCommand::Remove { endpoint_id } => {
                self.sync.remove_endpoint(&endpoint_id)?;
                let _ = self.relay.remove_endpoint(&endpoint_id);
            }
        }
        info!(endpoint_id = %endpoint_id, "Endpoint command applied");
        Ok(())
    }

    /// Status report served to the fleet manager.
    pub fn status_report(&self) -> Result<NodeStatusReport> {
        let counters = self.sync.read_counters()?;

        let mut sys = sysinfo::System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let cpu_usage = sys.global_cpu_usage() as f64;
        let memory_usage = if sys.total_memory() > 0 {
            sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
        } else {
            0.0
        };

        Ok(NodeStatusReport {
            status: "active".to_string(),
            last_seen: chrono::Utc::now(),
            cpu_usage,
            memory_usage,
            packet_rate: self.packet_rate(counters.total_packets),
            endpoints: self.sync.endpoint_ids(),
        })
    }

    /// Packets per second derived from the delta of the total counter since
    /// the previous status poll.
    fn packet_rate(&self, total_packets: u64) -> i64 {
        let mut window = self.rate_window.lock();
        let elapsed = window.at.elapsed().as_secs_f64();
        let delta = total_packets.saturating_sub(window.total_packets);

        window.at = Instant::now();
        window.total_packets = total_packets;

        if elapsed < 0.001 {
            return 0;
        }
        (delta as f64 / elapsed) as i64
    }

    pub fn counters(&self) -> Result<CounterSnapshot> {
        self.sync.read_counters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayConfig;
    use obsidianprotection_common::types::{EndpointKind, EndpointSpec};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn state() -> NodeState {
        let config = Arc::new(AppConfig::default());
        let relay = Arc::new(RelayManager::new(RelayConfig {
            enable_tcp: false,
            enable_udp: false,
            tcp_timeout: Duration::from_secs(1),
            udp_timeout: Duration::from_secs(1),
            max_connections: 10,
            buffer_size: 1024,
            shutdown_grace: Duration::from_millis(50),
        }));
        NodeState::new(
            "node-1".into(),
            Arc::new(MapSync::standalone()),
            relay,
            config,
        )
    }

    fn endpoint(id: &str) -> EndpointSpec {
        EndpointSpec {
            id: id.into(),
            name: id.into(),
            front_ip: Ipv4Addr::new(198, 51, 100, 10),
            front_port: 25565,
            origin_ip: Ipv4Addr::new(203, 0, 113, 5),
            origin_port: 25565,
            kind: EndpointKind::Java,
            rate_limit: 1000,
            burst_limit: 5000,
            maintenance: false,
            active: true,
        }
    }

    #[tokio::test]
    async fn add_update_remove_cycle() {
        let state = state();

        state
            .apply_command(EndpointCommand::Add {
                endpoint: endpoint("a"),
            })
            .unwrap();
        assert_eq!(state.sync.endpoint_count(), 1);

        let mut updated = endpoint("a");
        updated.maintenance = true;
        state
            .apply_command(EndpointCommand::Update { endpoint: updated })
            .unwrap();
        assert!(state.sync.endpoints()[0].maintenance);

        state
            .apply_command(EndpointCommand::Remove {
                endpoint_id: "a".into(),
            })
            .unwrap();
        assert_eq!(state.sync.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn remove_unknown_endpoint_errors() {
        let state = state();
        let result = state.apply_command(EndpointCommand::Remove {
            endpoint_id: "ghost".into(),
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn status_report_lists_endpoints() {
        let state = state();
        state
            .apply_command(EndpointCommand::Add {
                endpoint: endpoint("a"),
            })
            .unwrap();

        let report = state.status_report().unwrap();
        assert_eq!(report.status, "active");
        assert_eq!(report.endpoints, vec!["a".to_string()]);
    }
}
