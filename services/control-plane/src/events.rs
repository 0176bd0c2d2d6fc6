//! Advisory event push channel.
//!
//! Events are broadcast to websocket subscribers; the channel is not durable
//! and clients reconcile through the REST API after reconnecting.

use obsidianprotection_common::types::{EndpointSpec, NodeStatusReport};
use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the broadcast ring; laggards are disconnected.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum Event {
    EndpointUpdate(EndpointSpec),
    NodeStatusUpdate(NodeStatusEvent),
    MetricsUpdate(MetricsEvent),
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatusEvent {
    pub node_id: String,
    pub status: String,
    pub report: Option<NodeStatusReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsEvent {
    pub node_id: String,
    pub total_packets: u64,
    pub dropped: u64,
    pub allowed: u64,
}

pub type EventSender = broadcast::Sender<Event>;

pub fn channel() -> EventSender {
    broadcast::channel(EVENT_CAPACITY).0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let event = Event::NodeStatusUpdate(NodeStatusEvent {
            node_id: "n1".into(),
            status: "inactive".into(),
            report: None,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"node_status_update\""));
        assert!(json.contains("\"node_id\":\"n1\""));
    }
}
