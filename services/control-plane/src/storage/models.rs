//! Entity rows and API request/response shapes.

use chrono::{DateTime, Utc};
use obsidianprotection_common::error::{Error, Result};
use obsidianprotection_common::types::{EndpointKind, EndpointSpec};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::net::Ipv4Addr;

/// Protected endpoint row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EndpointRow {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub front_ip: String,
    pub front_port: i32,
    pub origin_ip: String,
    pub origin_port: i32,
    pub kind: String,
    pub rate_limit: i32,
    pub burst_limit: i32,
    pub maintenance: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EndpointRow {
    pub fn kind(&self) -> Result<EndpointKind> {
        match self.kind.as_str() {
            "java" => Ok(EndpointKind::Java),
            "bedrock" => Ok(EndpointKind::Bedrock),
            other => Err(Error::internal(format!("corrupt endpoint kind {other:?}"))),
        }
    }

    /// Wire form pushed to edge nodes.
    pub fn to_spec(&self) -> Result<EndpointSpec> {
        let front_ip: Ipv4Addr = self
            .front_ip
            .parse()
            .map_err(|_| Error::internal(format!("corrupt front_ip {:?}", self.front_ip)))?;
        let origin_ip: Ipv4Addr = self
            .origin_ip
            .parse()
            .map_err(|_| Error::internal(format!("corrupt origin_ip {:?}", self.origin_ip)))?;

        Ok(EndpointSpec {
            id: self.id.clone(),
            name: self.name.clone(),
            front_ip,
            front_port: self.front_port as u16,
            origin_ip,
            origin_port: self.origin_port as u16,
            kind: self.kind()?,
            rate_limit: self.rate_limit as u32,
            burst_limit: self.burst_limit as u32,
            maintenance: self.maintenance,
            active: self.active,
        })
    }
}

/// Edge node row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NodeRow {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub control_address: String,
    pub interface: String,
    pub status: String,
    pub last_seen: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub packet_rate: i64,
}

/// Global blacklist row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BlacklistRow {
    pub id: String,
    pub ip: String,
    pub reason: String,
    pub duration_ms: i64,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-endpoint whitelist row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WhitelistRow {
    pub id: String,
    pub endpoint_id: String,
    pub ip: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Time-series sample persisted from node polls.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MetricSample {
    pub id: String,
    pub node_id: String,
    pub name: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Audit trail row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditRow {
    pub id: String,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Request / response shapes (closed: unknown fields rejected)
// ============================================================================

#[derive(Debug, Deserialize, validator::Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateEndpointRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    pub origin_ip: Ipv4Addr,
    #[validate(range(min = 1))]
    pub origin_port: u16,
    pub kind: EndpointKind,
    pub rate_limit: Option<u32>,
    pub burst_limit: Option<u32>,
    #[serde(default)]
    pub maintenance: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateEndpointRequest {
    pub name: Option<String>,
    pub rate_limit: Option<u32>,
    pub burst_limit: Option<u32>,
    pub maintenance: Option<bool>,
    pub active: Option<bool>,
}

impl UpdateEndpointRequest {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.rate_limit.is_none()
            && self.burst_limit.is_none()
            && self.maintenance.is_none()
            && self.active.is_none()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddBlacklistRequest {
    pub ip: Ipv4Addr,
    #[serde(default = "default_blacklist_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default)]
    pub reason: String,
}

fn default_blacklist_ttl_ms() -> u64 {
    3_600_000
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddWhitelistRequest {
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub description: String,
}

/// Offset/limit pagination with a default page of 50.
#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl Pagination {
    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }
}

/// Parse a `since` window like `300s`, `15m`, `2h` or a bare second count.
pub fn parse_since(raw: &str) -> Result<chrono::Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::validation("empty duration"));
    }

    let (number, unit) = match raw.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((split, _)) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: i64 = number
        .parse()
        .map_err(|_| Error::validation(format!("invalid duration {raw:?}")))?;

    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3_600,
        "d" => value * 86_400,
        _ => return Err(Error::validation(format!("invalid duration unit {unit:?}"))),
    };
    if seconds <= 0 {
        return Err(Error::validation("duration must be positive"));
    }
    Ok(chrono::Duration::seconds(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_rejects_unknown_fields() {
        let json = r#"{"name":"a","origin_ip":"1.2.3.4","origin_port":25565,"kind":"java","surprise":1}"#;
        assert!(serde_json::from_str::<CreateEndpointRequest>(json).is_err());
    }

    #[test]
    fn create_request_parses() {
        let json = r#"{"name":"lobby","origin_ip":"203.0.113.5","origin_port":25565,"kind":"bedrock"}"#;
        let req: CreateEndpointRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.kind, EndpointKind::Bedrock);
        assert!(!req.maintenance);
        assert!(req.rate_limit.is_none());
    }

    #[test]
    fn pagination_defaults() {
        let p = Pagination::default();
        assert_eq!(p.offset(), 0);
        assert_eq!(p.limit(), 50);

        let p = Pagination {
            offset: Some(-5),
            limit: Some(100_000),
        };
        assert_eq!(p.offset(), 0);
        assert_eq!(p.limit(), 500);
    }

    #[test]
    fn since_parsing() {
        assert_eq!(parse_since("300").unwrap().num_seconds(), 300);
        assert_eq!(parse_since("300s").unwrap().num_seconds(), 300);
        assert_eq!(parse_since("15m").unwrap().num_seconds(), 900);
        assert_eq!(parse_since("2h").unwrap().num_seconds(), 7200);
        assert!(parse_since("").is_err());
        assert!(parse_since("15x").is_err());
        assert!(parse_since("-5m").is_err());
    }

    #[test]
    fn endpoint_row_to_spec() {
        let row = EndpointRow {
            id: "ep".into(),
            organization_id: "org".into(),
            name: "lobby".into(),
            front_ip: "198.51.100.10".into(),
            front_port: 25565,
            origin_ip: "203.0.113.5".into(),
            origin_port: 25565,
            kind: "java".into(),
            rate_limit: 1000,
            burst_limit: 5000,
            maintenance: false,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let spec = row.to_spec().unwrap();
        assert_eq!(spec.kind, EndpointKind::Java);
        assert_eq!(spec.front_port, 25565);

        let mut corrupt = row;
        corrupt.kind = "quake".into();
        assert!(corrupt.to_spec().is_err());
    }
}
