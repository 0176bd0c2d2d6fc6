//! Prometheus metrics shared across services.

use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};

lazy_static::lazy_static! {
    /// Bytes relayed per endpoint and direction (in = origin->client).
    pub static ref RELAY_BYTES_TOTAL: CounterVec = register_counter_vec!(
        "relay_bytes_total",
        "Total bytes relayed",
        &["endpoint_id", "direction"]
    ).unwrap();

    /// Live relayed flows per endpoint.
    pub static ref ACTIVE_FLOWS: GaugeVec = register_gauge_vec!(
        "active_flows",
        "Number of live relay flows",
        &["endpoint_id", "kind"]
    ).unwrap();

    /// Flows closed because the origin could not be dialed.
    pub static ref RELAY_ORIGIN_UNREACHABLE_TOTAL: CounterVec = register_counter_vec!(
        "relay_origin_unreachable_total",
        "Flows closed because the origin dial failed or timed out",
        &["endpoint_id"]
    ).unwrap();

    /// Fast-path counters mirrored from the kernel stats map.
    pub static ref FASTPATH_PACKETS: GaugeVec = register_gauge_vec!(
        "fastpath_packets",
        "Kernel fast-path counter values",
        &["counter"]
    ).unwrap();

    /// Fleet node liveness (1 = active).
    pub static ref NODE_ACTIVE: GaugeVec = register_gauge_vec!(
        "node_active",
        "Whether an edge node is active",
        &["node_id"]
    ).unwrap();

    /// Operator API requests.
    pub static ref API_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "api_requests_total",
        "Total operator API requests",
        &["service", "status"]
    ).unwrap();
}

/// Encode the default registry as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error: invalid UTF-8\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_registered_families() {
        RELAY_BYTES_TOTAL.with_label_values(&["ep", "in"]).inc();
        let text = encode_metrics();
        assert!(text.contains("relay_bytes_total"));
    }
}
