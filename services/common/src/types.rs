//! Wire types shared between the control plane and edge nodes.

use crate::error::Error;
use obsidianprotection_ebpf::{
    stat, EndpointInfo, EndpointKey, IPPROTO_TCP, IPPROTO_UDP, KIND_BEDROCK, KIND_JAVA,
};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Protected endpoint kind. The kind pins the L4 protocol: Java is TCP,
/// Bedrock is UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Java,
    Bedrock,
}

impl EndpointKind {
    pub fn l4_protocol(self) -> u8 {
        match self {
            EndpointKind::Java => IPPROTO_TCP,
            EndpointKind::Bedrock => IPPROTO_UDP,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            EndpointKind::Java => KIND_JAVA,
            EndpointKind::Bedrock => KIND_BEDROCK,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EndpointKind::Java => "java",
            EndpointKind::Bedrock => "bedrock",
        }
    }
}

/// Full description of a protected endpoint as shipped to edge nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointSpec {
    pub id: String,
    pub name: String,
    pub front_ip: Ipv4Addr,
    pub front_port: u16,
    pub origin_ip: Ipv4Addr,
    pub origin_port: u16,
    pub kind: EndpointKind,
    pub rate_limit: u32,
    pub burst_limit: u32,
    pub maintenance: bool,
    pub active: bool,
}

impl EndpointSpec {
    /// Policy sanity: `burst_limit >= rate_limit >= 1`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.rate_limit < 1 {
            return Err(Error::validation("rate_limit must be at least 1"));
        }
        if self.burst_limit < self.rate_limit {
            return Err(Error::validation(
                "burst_limit must be greater than or equal to rate_limit",
            ));
        }
        if self.origin_port == 0 || self.front_port == 0 {
            return Err(Error::validation("ports must be non-zero"));
        }
        Ok(())
    }

    /// Kernel map key for the front tuple.
    pub fn map_key(&self) -> EndpointKey {
        EndpointKey::new(
            u32::from(self.front_ip),
            self.front_port,
            self.kind.l4_protocol(),
        )
    }

    /// Kernel map value for the policy.
    pub fn map_info(&self) -> EndpointInfo {
        EndpointInfo {
            origin_ip: u32::from(self.origin_ip),
            origin_port: self.origin_port,
            kind: self.kind.as_u8(),
            maintenance: self.maintenance as u8,
            rate_limit: self.rate_limit,
            burst_limit: self.burst_limit,
        }
    }
}

/// Endpoint command pushed to a node's control interface. Removal only needs
/// the endpoint id; add and update carry the full spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum EndpointCommand {
    Add { endpoint: EndpointSpec },
    Update { endpoint: EndpointSpec },
    Remove { endpoint_id: String },
}

impl EndpointCommand {
    /// Id of the endpoint the command concerns.
    pub fn endpoint_id(&self) -> &str {
        match self {
            EndpointCommand::Add { endpoint } | EndpointCommand::Update { endpoint } => {
                &endpoint.id
            }
            EndpointCommand::Remove { endpoint_id } => endpoint_id,
        }
    }
}

/// Node registration payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeRegistration {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub control_address: String,
    pub interface: String,
}

/// Status report served by a node at `/api/v1/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusReport {
    pub status: String,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub packet_rate: i64,
    pub endpoints: Vec<String>,
}

/// Snapshot of the kernel counter array.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub total_packets: u64,
    pub allowed: u64,
    pub dropped_ratelimit: u64,
    pub dropped_blacklist: u64,
    pub dropped_badproto: u64,
    pub dropped_challenge: u64,
    pub dropped_maintenance: u64,
    pub pass: u64,
    pub redirect: u64,
    pub challenges_sent: u64,
    pub challenges_passed: u64,
    pub saturation: u64,
}

impl CounterSnapshot {
    pub fn dropped_total(&self) -> u64 {
        self.dropped_ratelimit
            + self.dropped_blacklist
            + self.dropped_badproto
            + self.dropped_challenge
            + self.dropped_maintenance
            + self.saturation
    }
}

impl From<[u64; stat::COUNT as usize]> for CounterSnapshot {
    fn from(slots: [u64; stat::COUNT as usize]) -> Self {
        Self {
            total_packets: slots[stat::TOTAL_PACKETS as usize],
            allowed: slots[stat::ALLOWED as usize],
            dropped_ratelimit: slots[stat::DROPPED_RATELIMIT as usize],
            dropped_blacklist: slots[stat::DROPPED_BLACKLIST as usize],
            dropped_badproto: slots[stat::DROPPED_BADPROTO as usize],
            dropped_challenge: slots[stat::DROPPED_CHALLENGE as usize],
            dropped_maintenance: slots[stat::DROPPED_MAINTENANCE as usize],
            pass: slots[stat::PASS as usize],
            redirect: slots[stat::REDIRECT as usize],
            challenges_sent: slots[stat::CHALLENGES_SENT as usize],
            challenges_passed: slots[stat::CHALLENGES_PASSED as usize],
            saturation: slots[stat::SATURATION as usize],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> EndpointSpec {
        EndpointSpec {
            id: "ep-1".into(),
            name: "lobby".into(),
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

    #[test]
    fn kind_pins_l4() {
        assert_eq!(EndpointKind::Java.l4_protocol(), IPPROTO_TCP);
        assert_eq!(EndpointKind::Bedrock.l4_protocol(), IPPROTO_UDP);
    }

    #[test]
    fn validate_rejects_inverted_limits() {
        let mut s = spec();
        s.burst_limit = 10;
        s.rate_limit = 100;
        assert!(s.validate().is_err());

        s.rate_limit = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn map_key_uses_kind_protocol() {
        let key = spec().map_key();
        assert_eq!(key.protocol, IPPROTO_TCP);
        let port = key.port;
        assert_eq!(port, 25565);
    }

    #[test]
    fn command_round_trips_through_json() {
        let cmd = EndpointCommand::Add { endpoint: spec() };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"action\":\"add\""));
        assert!(json.contains("\"kind\":\"java\""));
        let back: EndpointCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back.endpoint_id(), "ep-1");

        let remove = EndpointCommand::Remove {
            endpoint_id: "ep-1".into(),
        };
        let json = serde_json::to_string(&remove).unwrap();
        assert!(json.contains("\"action\":\"remove\""));
    }

    #[test]
    fn command_rejects_malformed_endpoint() {
        let json = r#"{"action":"add","endpoint":{}}"#;
        assert!(serde_json::from_str::<EndpointCommand>(json).is_err());

        let json = r#"{"action":"add","endpoint":{"bogus_field":1}}"#;
        assert!(serde_json::from_str::<EndpointCommand>(json).is_err());
    }

    #[test]
    fn counters_from_slot_array() {
        let mut slots = [0u64; stat::COUNT as usize];
        slots[stat::TOTAL_PACKETS as usize] = 10;
        slots[stat::DROPPED_BLACKLIST as usize] = 3;
        slots[stat::SATURATION as usize] = 1;
        let snapshot = CounterSnapshot::from(slots);
        assert_eq!(snapshot.total_packets, 10);
        assert_eq!(snapshot.dropped_total(), 4);
    }
}
