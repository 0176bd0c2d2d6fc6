//! Edge node fleet manager.
//!
//! Tracks registered nodes, polls their control interfaces on a fixed
//! cadence, marks nodes inactive after two consecutive failed polls, and
//! reconciles each node's reported endpoint set against the authoritative
//! one. Operator changes are rolled out to every active node; a failed push
//! never fails the operator request, the next poll converges the node.

use crate::events::{Event, EventSender, MetricsEvent, NodeStatusEvent};
use crate::storage::models::NodeRow;
use crate::storage::Store;
use chrono::{DateTime, Utc};
use obsidianprotection_common::config::NodeConfig;
use obsidianprotection_common::error::{Error, Result};
use obsidianprotection_common::metrics;
use obsidianprotection_common::types::{
    CounterSnapshot, EndpointCommand, EndpointSpec, NodeRegistration, NodeStatusReport,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Consecutive failed polls before a node is marked inactive.
const FAILURE_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Inactive,
    Maintenance,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Inactive => "inactive",
            NodeStatus::Maintenance => "maintenance",
        }
    }
}

/// In-memory view of one edge node.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedNode {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub control_address: String,
    pub interface: String,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub packet_rate: i64,
    pub endpoints: Vec<String>,
    #[serde(skip)]
    consecutive_failures: u32,
}

impl ManagedNode {
    fn from_registration(registration: NodeRegistration) -> Self {
        Self {
            id: registration.id,
            name: registration.name,
            ip: registration.ip,
            control_address: registration.control_address,
            interface: registration.interface,
            status: NodeStatus::Active,
            last_seen: Utc::now(),
            cpu_usage: 0.0,
            memory_usage: 0.0,
            packet_rate: 0,
            endpoints: Vec::new(),
            consecutive_failures: 0,
        }
    }

    fn to_row(&self) -> NodeRow {
        NodeRow {
            id: self.id.clone(),
            name: self.name.clone(),
            ip: self.ip.clone(),
            control_address: self.control_address.clone(),
            interface: self.interface.clone(),
            status: self.status.as_str().to_string(),
            last_seen: self.last_seen,
            cpu_usage: self.cpu_usage,
            memory_usage: self.memory_usage,
            packet_rate: self.packet_rate,
        }
    }
}

pub struct FleetManager {
    health_check_interval: Duration,
    node_timeout: Duration,
    max_nodes: usize,
    http: reqwest::Client,
    nodes: RwLock<HashMap<String, ManagedNode>>,
    /// Authoritative endpoint set, mirroring the store.
    endpoints: RwLock<HashMap<String, EndpointSpec>>,
    store: Option<Store>,
    events: EventSender,
    shutdown: broadcast::Sender<()>,
}

impl FleetManager {
    pub fn new(config: &NodeConfig, store: Option<Store>, events: EventSender) -> Self {
        Self {
            health_check_interval: Duration::from_secs(config.health_check_interval),
            node_timeout: Duration::from_secs(config.node_timeout),
            max_nodes: config.max_nodes as usize,
            http: reqwest::Client::new(),
            nodes: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::new()),
            store,
            events,
            shutdown: broadcast::channel(1).0,
        }
    }

    // ------------------------------------------------------------------
    // Registration and views
    // ------------------------------------------------------------------

    pub async fn register_node(&self, registration: NodeRegistration) -> Result<()> {
        {
            let nodes = self.nodes.read();
            if !nodes.contains_key(&registration.id) && nodes.len() >= self.max_nodes {
                return Err(Error::resource_exhausted("node limit reached"));
            }
        }

        let node = ManagedNode::from_registration(registration);
        info!(node_id = %node.id, name = %node.name, "Node registered");
        self.persist(&node).await;
        self.emit_status(&node, None);
        self.nodes.write().insert(node.id.clone(), node.clone());

        // The freshly registered node starts from an empty set; push the
        // authoritative endpoints so it can serve immediately.
        let specs: Vec<EndpointSpec> = self.endpoints.read().values().cloned().collect();
        for spec in specs {
            let command = EndpointCommand::Add { endpoint: spec };
            if let Err(e) = self.push_command(&node, &command).await {
                warn!(node_id = %node.id, error = %e, "Initial endpoint push failed");
            }
        }
        Ok(())
    }

    /// Restore a node from the store without contacting it.
    pub fn adopt_node(&self, row: &NodeRow) {
        let node = ManagedNode {
            id: row.id.clone(),
            name: row.name.clone(),
            ip: row.ip.clone(),
            control_address: row.control_address.clone(),
            interface: row.interface.clone(),
            status: match row.status.as_str() {
                "active" => NodeStatus::Active,
                "maintenance" => NodeStatus::Maintenance,
                _ => NodeStatus::Inactive,
            },
            last_seen: row.last_seen,
            cpu_usage: row.cpu_usage,
            memory_usage: row.memory_usage,
            packet_rate: row.packet_rate,
            endpoints: Vec::new(),
            consecutive_failures: 0,
        };
        self.nodes.write().insert(node.id.clone(), node);
    }

    pub async fn decommission(&self, id: &str) -> Result<()> {
        if self.nodes.write().remove(id).is_none() {
            return Err(Error::not_found("Node", id));
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_node(id).await {
                warn!(node_id = %id, error = %e, "Failed to delete node row");
            }
        }
        info!(node_id = %id, "Node decommissioned");
        Ok(())
    }

    pub fn nodes(&self) -> Vec<ManagedNode> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn node(&self, id: &str) -> Option<ManagedNode> {
        self.nodes.read().get(id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.nodes
            .read()
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .count()
    }

    // ------------------------------------------------------------------
    // Authoritative endpoint set and rollout
    // ------------------------------------------------------------------

    pub fn seed_endpoints(&self, specs: Vec<EndpointSpec>) {
        let mut endpoints = self.endpoints.write();
        endpoints.clear();
        for spec in specs {
            endpoints.insert(spec.id.clone(), spec);
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.read().len()
    }

    pub async fn endpoint_added(&self, spec: EndpointSpec) {
        self.endpoints.write().insert(spec.id.clone(), spec.clone());
        self.rollout(EndpointCommand::Add { endpoint: spec }).await;
    }

    pub async fn endpoint_updated(&self, spec: EndpointSpec) {
        self.endpoints.write().insert(spec.id.clone(), spec.clone());
        self.rollout(EndpointCommand::Update { endpoint: spec }).await;
    }

    pub async fn endpoint_removed(&self, id: &str) {
        self.endpoints.write().remove(id);
        self.rollout(EndpointCommand::Remove {
            endpoint_id: id.to_string(),
        })
        .await;
    }

    pub async fn blacklist_added(&self, ip: &str, ttl_ms: u64) {
        let body = serde_json::json!({ "ip": ip, "ttl_ms": ttl_ms });
        for node in self.active_nodes() {
            let url = format!("http://{}/api/v1/blacklist", node.control_address);
            let result = self
                .http
                .post(&url)
                .json(&body)
                .timeout(self.node_timeout)
                .send()
                .await;
            if let Err(e) = result {
                warn!(node_id = %node.id, error = %e, "Blacklist push failed");
            }
        }
    }

    pub async fn blacklist_removed(&self, ip: &str) {
        for node in self.active_nodes() {
            let url = format!("http://{}/api/v1/blacklist/{ip}", node.control_address);
            if let Err(e) = self.http.delete(&url).timeout(self.node_timeout).send().await {
                warn!(node_id = %node.id, error = %e, "Blacklist removal push failed");
            }
        }
    }

    fn active_nodes(&self) -> Vec<ManagedNode> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .cloned()
            .collect()
    }

    /// Push a command to every active node. Unreachable nodes are skipped;
    /// they converge on their next successful health check.
    async fn rollout(&self, command: EndpointCommand) {
        for node in self.active_nodes() {
            if let Err(e) = self.push_command(&node, &command).await {
                warn!(
                    node_id = %node.id,
                    endpoint_id = %command.endpoint_id(),
                    error = %e,
                    "Endpoint rollout failed, node will resync"
                );
            }
        }
    }

    async fn push_command(&self, node: &ManagedNode, command: &EndpointCommand) -> Result<()> {
        let url = format!("http://{}/api/v1/endpoint", node.control_address);
        let response = self
            .http
            .post(&url)
            .json(command)
            .timeout(self.node_timeout)
            .send()
            .await
            .map_err(|e| Error::external_service("node", e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::external_service(
                "node",
                format!("endpoint command rejected with {}", response.status()),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Health polling
    // ------------------------------------------------------------------

    /// Spawn the polling loop. Runs until `stop` is called.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let fleet = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(fleet.health_check_interval);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("Fleet polling stopped");
                        break;
                    }
                    _ = tick.tick() => {
                        fleet.poll_all().await;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// One polling pass over the whole fleet. A slow node cannot starve the
    /// others beyond its own timeout because every request carries one.
    pub async fn poll_all(&self) {
        let ids: Vec<String> = self.nodes.read().keys().cloned().collect();
        for id in ids {
            self.poll_node(&id).await;
        }
    }

    /// Poll one node's status endpoint and reconcile its endpoint set.
    pub async fn poll_node(&self, id: &str) {
        let node = match self.node(id) {
            Some(node) => node,
            None => return,
        };
        if node.status == NodeStatus::Maintenance {
            return;
        }

        let url = format!("http://{}/api/v1/status", node.control_address);
        let report = match self.fetch_status(&url).await {
            Ok(report) => report,
            Err(e) => {
                self.record_failure(id, &e).await;
                return;
            }
        };

        let was_inactive = node.status == NodeStatus::Inactive;
        let updated = {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(id) {
                Some(node) => {
                    node.status = NodeStatus::Active;
                    node.consecutive_failures = 0;
                    node.last_seen = Utc::now();
                    node.cpu_usage = report.cpu_usage;
                    node.memory_usage = report.memory_usage;
                    node.packet_rate = report.packet_rate;
                    node.endpoints = report.endpoints.clone();
                    node.clone()
                }
                None => return,
            }
        };

        if was_inactive {
            info!(node_id = %id, "Node recovered, resyncing endpoint set");
        }
        self.reconcile(&updated, &report.endpoints, was_inactive).await;
        self.persist(&updated).await;
        self.emit_status(&updated, Some(report));
        self.collect_metrics(&updated).await;
    }

    async fn fetch_status(&self, url: &str) -> Result<NodeStatusReport> {
        let response = self
            .http
            .get(url)
            .timeout(self.node_timeout)
            .send()
            .await
            .map_err(|e| Error::external_service("node", e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::external_service(
                "node",
                format!("status returned {}", response.status()),
            ));
        }
        response
            .json::<NodeStatusReport>()
            .await
            .map_err(|e| Error::external_service("node", format!("bad status body: {e}")))
    }

    async fn record_failure(&self, id: &str, error: &Error) {
        let became_inactive = {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(id) {
                Some(node) => {
                    node.consecutive_failures += 1;
                    if node.consecutive_failures >= FAILURE_THRESHOLD
                        && node.status == NodeStatus::Active
                    {
                        node.status = NodeStatus::Inactive;
                        Some(node.clone())
                    } else {
                        debug!(
                            node_id = %id,
                            failures = node.consecutive_failures,
                            error = %error,
                            "Node poll failed"
                        );
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(node) = became_inactive {
            warn!(node_id = %id, "Node marked inactive after consecutive failures");
            self.persist(&node).await;
            self.emit_status(&node, None);
        }
    }

    /// The store is the single source of truth: push the difference between
    /// the authoritative set and what the node reports. On recovery the
    /// overlap is re-pushed as updates to flush stale policy.
    async fn reconcile(&self, node: &ManagedNode, reported: &[String], full_resync: bool) {
        let desired: HashMap<String, EndpointSpec> = self.endpoints.read().clone();

        for (id, spec) in &desired {
            let on_node = reported.iter().any(|reported_id| reported_id == id);
            let command = if !on_node {
                EndpointCommand::Add {
                    endpoint: spec.clone(),
                }
            } else if full_resync {
                EndpointCommand::Update {
                    endpoint: spec.clone(),
                }
            } else {
                continue;
            };
            if let Err(e) = self.push_command(node, &command).await {
                warn!(node_id = %node.id, endpoint_id = %id, error = %e, "Reconcile push failed");
            }
        }

        for reported_id in reported {
            if !desired.contains_key(reported_id) {
                let command = EndpointCommand::Remove {
                    endpoint_id: reported_id.clone(),
                };
                if let Err(e) = self.push_command(node, &command).await {
                    warn!(node_id = %node.id, endpoint_id = %reported_id, error = %e, "Reconcile removal failed");
                }
            }
        }
    }

    /// Pull the raw counters and persist samples for the metrics windows.
    async fn collect_metrics(&self, node: &ManagedNode) {
        let url = format!("http://{}/api/v1/stats", node.control_address);
        let counters = match self.http.get(&url).timeout(self.node_timeout).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<CounterSnapshot>().await {
                    Ok(counters) => counters,
                    Err(e) => {
                        debug!(node_id = %node.id, error = %e, "Bad stats body");
                        return;
                    }
                }
            }
            _ => return,
        };

        if let Some(store) = &self.store {
            let samples = [
                ("total_packets", counters.total_packets as f64),
                ("allowed", counters.allowed as f64),
                ("pass", counters.pass as f64),
                ("redirect", counters.redirect as f64),
                ("dropped_ratelimit", counters.dropped_ratelimit as f64),
                ("dropped_blacklist", counters.dropped_blacklist as f64),
                ("dropped_badproto", counters.dropped_badproto as f64),
                ("dropped_challenge", counters.dropped_challenge as f64),
                ("dropped_maintenance", counters.dropped_maintenance as f64),
                ("challenges_sent", counters.challenges_sent as f64),
                ("challenges_passed", counters.challenges_passed as f64),
                ("saturation", counters.saturation as f64),
                ("packet_rate", node.packet_rate as f64),
            ];
            for (name, value) in samples {
                if let Err(e) = store.insert_metric(&node.id, name, value).await {
                    debug!(node_id = %node.id, error = %e, "Metric sample insert failed");
                    break;
                }
            }
        }

        let _ = self.events.send(Event::MetricsUpdate(MetricsEvent {
            node_id: node.id.clone(),
            total_packets: counters.total_packets,
            dropped: counters.dropped_total(),
            allowed: counters.allowed,
        }));
    }

    async fn persist(&self, node: &ManagedNode) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_node(&node.to_row()).await {
                warn!(node_id = %node.id, error = %e, "Failed to persist node");
            }
        }
    }

    fn emit_status(&self, node: &ManagedNode, report: Option<NodeStatusReport>) {
        metrics::NODE_ACTIVE
            .with_label_values(&[&node.id])
            .set(if node.status == NodeStatus::Active { 1.0 } else { 0.0 });
        let _ = self.events.send(Event::NodeStatusUpdate(NodeStatusEvent {
            node_id: node.id.clone(),
            status: node.status.as_str().to_string(),
            report,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use axum::extract::State;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use obsidianprotection_common::types::EndpointKind;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;

    /// Scriptable stand-in for an edge node's control API.
    #[derive(Clone)]
    struct MockNode {
        healthy: Arc<StdMutex<bool>>,
        endpoints: Arc<StdMutex<Vec<String>>>,
        commands: Arc<StdMutex<Vec<EndpointCommand>>>,
    }

    impl MockNode {
        fn new() -> Self {
            Self {
                healthy: Arc::new(StdMutex::new(true)),
                endpoints: Arc::new(StdMutex::new(Vec::new())),
                commands: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        fn set_healthy(&self, healthy: bool) {
            *self.healthy.lock().unwrap() = healthy;
        }

        fn commands(&self) -> Vec<EndpointCommand> {
            self.commands.lock().unwrap().clone()
        }

        async fn serve(&self) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let mock = self.clone();
            let app = Router::new()
                .route(
                    "/api/v1/status",
                    get(|State(mock): State<MockNode>| async move {
                        if !*mock.healthy.lock().unwrap() {
                            return Err(axum::http::StatusCode::SERVICE_UNAVAILABLE);
                        }
                        Ok(Json(NodeStatusReport {
                            status: "active".into(),
                            last_seen: Utc::now(),
                            cpu_usage: 12.5,
                            memory_usage: 40.0,
                            packet_rate: 100,
                            endpoints: mock.endpoints.lock().unwrap().clone(),
                        }))
                    }),
                )
                .route(
                    "/api/v1/stats",
                    get(|State(mock): State<MockNode>| async move {
                        if !*mock.healthy.lock().unwrap() {
                            return Err(axum::http::StatusCode::SERVICE_UNAVAILABLE);
                        }
                        Ok(Json(CounterSnapshot::default()))
                    }),
                )
                .route(
                    "/api/v1/endpoint",
                    post(|State(mock): State<MockNode>, Json(command): Json<EndpointCommand>| async move {
                        match &command {
                            EndpointCommand::Add { endpoint } => {
                                mock.endpoints.lock().unwrap().push(endpoint.id.clone());
                            }
                            EndpointCommand::Remove { endpoint_id } => {
                                mock.endpoints.lock().unwrap().retain(|id| id != endpoint_id);
                            }
                            EndpointCommand::Update { .. } => {}
                        }
                        mock.commands.lock().unwrap().push(command);
                        Json(serde_json::json!({"success": true}))
                    }),
                )
                .with_state(mock);

            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            format!("127.0.0.1:{}", addr.port())
        }
    }

    fn fleet() -> Arc<FleetManager> {
        let config = NodeConfig {
            health_check_interval: 1,
            node_timeout: 2,
            ..NodeConfig::default()
        };
        Arc::new(FleetManager::new(&config, None, events::channel()))
    }

    fn spec(id: &str) -> EndpointSpec {
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

    fn registration(id: &str, control_address: &str) -> NodeRegistration {
        NodeRegistration {
            id: id.into(),
            name: format!("edge-{id}"),
            ip: "127.0.0.1".into(),
            control_address: control_address.into(),
            interface: "eth0".into(),
        }
    }

    #[tokio::test]
    async fn registration_pushes_current_endpoints() {
        let fleet = fleet();
        fleet.seed_endpoints(vec![spec("ep1"), spec2("ep2")]);

        let mock = MockNode::new();
        let addr = mock.serve().await;
        fleet.register_node(registration("n1", &addr)).await.unwrap();

        let commands = mock.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands
            .iter()
            .all(|c| matches!(c, EndpointCommand::Add { .. })));
    }

    fn spec2(id: &str) -> EndpointSpec {
        let mut s = spec(id);
        s.front_port = 25566;
        s
    }

    #[tokio::test]
    async fn two_failures_mark_node_inactive() {
        let fleet = fleet();
        let mock = MockNode::new();
        let addr = mock.serve().await;
        fleet
            .register_node(registration("n-strike", &addr))
            .await
            .unwrap();
        assert_eq!(
            metrics::NODE_ACTIVE.with_label_values(&["n-strike"]).get(),
            1.0
        );

        mock.set_healthy(false);

        fleet.poll_node("n-strike").await;
        assert_eq!(fleet.node("n-strike").unwrap().status, NodeStatus::Active);

        fleet.poll_node("n-strike").await;
        assert_eq!(fleet.node("n-strike").unwrap().status, NodeStatus::Inactive);
        assert_eq!(fleet.active_count(), 0);
        assert_eq!(
            metrics::NODE_ACTIVE.with_label_values(&["n-strike"]).get(),
            0.0
        );
    }

    #[tokio::test]
    async fn recovery_resyncs_endpoints_created_while_down() {
        let fleet = fleet();
        let mock = MockNode::new();
        let addr = mock.serve().await;
        fleet
            .register_node(registration("n-recover", &addr))
            .await
            .unwrap();

        // Node goes dark.
        mock.set_healthy(false);
        fleet.poll_node("n-recover").await;
        fleet.poll_node("n-recover").await;
        assert_eq!(fleet.node("n-recover").unwrap().status, NodeStatus::Inactive);

        // Operator creates an endpoint while the node is down: the rollout
        // skips inactive nodes but the authoritative set retains it.
        fleet.endpoint_added(spec("ep-while-down")).await;
        assert!(mock.commands().is_empty());

        // Node comes back: next poll resyncs the full set.
        mock.set_healthy(true);
        fleet.poll_node("n-recover").await;
        assert_eq!(fleet.node("n-recover").unwrap().status, NodeStatus::Active);
        assert_eq!(
            metrics::NODE_ACTIVE.with_label_values(&["n-recover"]).get(),
            1.0
        );

        let pushed: Vec<String> = mock
            .commands()
            .iter()
            .map(|c| c.endpoint_id().to_string())
            .collect();
        assert!(pushed.contains(&"ep-while-down".to_string()));

        // The node's reported set converges on the next poll.
        fleet.poll_node("n-recover").await;
        assert_eq!(
            fleet.node("n-recover").unwrap().endpoints,
            vec!["ep-while-down".to_string()]
        );
    }

    #[tokio::test]
    async fn reconcile_removes_extraneous_endpoints() {
        let fleet = fleet();
        let mock = MockNode::new();
        mock.endpoints.lock().unwrap().push("stale".to_string());
        let addr = mock.serve().await;
        fleet.register_node(registration("n1", &addr)).await.unwrap();

        fleet.poll_node("n1").await;

        let removed = mock.commands().iter().any(|c| {
            matches!(c, EndpointCommand::Remove { endpoint_id } if endpoint_id == "stale")
        });
        assert!(removed, "stale endpoint removed during reconcile");
    }

    #[tokio::test]
    async fn rollout_failure_does_not_propagate() {
        let fleet = fleet();
        // Register a node at an address nothing listens on.
        fleet
            .register_node(registration("n1", "127.0.0.1:1"))
            .await
            .unwrap();

        // No panic, no error: the change is durable and retried by polling.
        fleet.endpoint_added(spec("ep1")).await;
        assert_eq!(fleet.endpoint_count(), 1);
    }

    #[tokio::test]
    async fn node_limit_is_enforced() {
        let config = NodeConfig {
            max_nodes: 1,
            ..NodeConfig::default()
        };
        let fleet = Arc::new(FleetManager::new(&config, None, events::channel()));
        fleet
            .register_node(registration("n1", "127.0.0.1:1"))
            .await
            .unwrap();
        assert!(matches!(
            fleet.register_node(registration("n2", "127.0.0.1:1")).await,
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[tokio::test]
    async fn maintenance_nodes_are_not_polled() {
        let fleet = fleet();
        let mock = MockNode::new();
        let addr = mock.serve().await;
        fleet.register_node(registration("n1", &addr)).await.unwrap();

        fleet.nodes.write().get_mut("n1").unwrap().status = NodeStatus::Maintenance;
        fleet.poll_node("n1").await;
        assert_eq!(fleet.node("n1").unwrap().status, NodeStatus::Maintenance);
    }

    #[tokio::test]
    async fn decommission_removes_node() {
        let fleet = fleet();
        fleet
            .register_node(registration("n1", "127.0.0.1:1"))
            .await
            .unwrap();
        fleet.decommission("n1").await.unwrap();
        assert!(fleet.node("n1").is_none());
        assert!(fleet.decommission("n1").await.is_err());
    }
}
