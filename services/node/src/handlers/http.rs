//! HTTP handlers for the node control interface.
//!
//! Polled by the fleet manager: liveness, status with resource usage and the
//! endpoint command channel. Also exposes the raw fast-path counters and
//! Prometheus metrics.

use super::NodeState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use obsidianprotection_common::types::EndpointCommand;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Build the control router.
pub fn create_router(state: NodeState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/status", get(status))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/endpoint", post(endpoint_command))
        .route("/api/v1/blacklist", post(blacklist_add))
        .route("/api/v1/blacklist/:ip", delete(blacklist_remove))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    version: &'static str,
}

async fn health(State(state): State<NodeState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            node_id: state.node_id.clone(),
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

async fn metrics(State(state): State<NodeState>) -> impl IntoResponse {
    // Mirror the kernel counters into the gauge family before encoding.
    if let Ok(counters) = state.counters() {
        use obsidianprotection_common::metrics::FASTPATH_PACKETS;
        FASTPATH_PACKETS
            .with_label_values(&["total_packets"])
            .set(counters.total_packets as f64);
        FASTPATH_PACKETS
            .with_label_values(&["allowed"])
            .set(counters.allowed as f64);
        FASTPATH_PACKETS
            .with_label_values(&["dropped"])
            .set(counters.dropped_total() as f64);
        FASTPATH_PACKETS
            .with_label_values(&["pass"])
            .set(counters.pass as f64);
        FASTPATH_PACKETS
            .with_label_values(&["redirect"])
            .set(counters.redirect as f64);
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        obsidianprotection_common::metrics::encode_metrics(),
    )
}

async fn status(State(state): State<NodeState>) -> impl IntoResponse {
    match state.status_report() {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            warn!(error = %e, "Status report failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

async fn stats(State(state): State<NodeState>) -> impl IntoResponse {
    match state.counters() {
        Ok(counters) => (StatusCode::OK, Json(counters)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Serialize)]
struct CommandResponse {
    success: bool,
    message: String,
}

async fn endpoint_command(
    State(state): State<NodeState>,
    Json(command): Json<EndpointCommand>,
) -> impl IntoResponse {
    let endpoint_id = command.endpoint_id().to_string();
    match state.apply_command(command) {
        Ok(()) => (
            StatusCode::OK,
            Json(CommandResponse {
                success: true,
                message: format!("endpoint {endpoint_id} applied"),
            }),
        ),
        Err(e) => {
            warn!(endpoint_id = %endpoint_id, error = %e, "Endpoint command failed");
            let status = StatusCode::from_u16(e.http_status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                Json(CommandResponse {
                    success: false,
                    message: e.to_string(),
                }),
            )
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BlacklistAddRequest {
    ip: Ipv4Addr,
    ttl_ms: u64,
}

async fn blacklist_add(
    State(state): State<NodeState>,
    Json(request): Json<BlacklistAddRequest>,
) -> impl IntoResponse {
    match state.sync.add_blacklist(request.ip, request.ttl_ms) {
        Ok(()) => (
            StatusCode::OK,
            Json(CommandResponse {
                success: true,
                message: format!("{} blacklisted", request.ip),
            }),
        ),
        Err(e) => (
            StatusCode::from_u16(e.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(CommandResponse {
                success: false,
                message: e.to_string(),
            }),
        ),
    }
}

async fn blacklist_remove(
    State(state): State<NodeState>,
    Path(ip): Path<Ipv4Addr>,
) -> impl IntoResponse {
    match state.sync.remove_blacklist(ip) {
        Ok(()) => (
            StatusCode::OK,
            Json(CommandResponse {
                success: true,
                message: format!("{ip} removed from blacklist"),
            }),
        ),
        Err(e) => (
            StatusCode::from_u16(e.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(CommandResponse {
                success: false,
                message: e.to_string(),
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::sync::MapSync;
    use crate::relay::{RelayConfig, RelayManager};
    use obsidianprotection_common::config::AppConfig;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_state() -> NodeState {
        NodeState::new(
            "node-test".into(),
            Arc::new(MapSync::standalone()),
            Arc::new(RelayManager::new(RelayConfig {
                enable_tcp: false,
                enable_udp: false,
                tcp_timeout: Duration::from_secs(1),
                udp_timeout: Duration::from_secs(1),
                max_connections: 10,
                buffer_size: 1024,
                shutdown_grace: Duration::from_millis(50),
            })),
            Arc::new(AppConfig::default()),
        )
    }

    async fn request(router: Router, raw: &str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut response = String::new();
        let _ = stream.read_to_string(&mut response).await;
        response
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let response = request(
            create_router(test_state()),
            "GET /health HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("node-test"));
    }

    #[tokio::test]
    async fn command_with_unknown_field_is_rejected() {
        let body = r#"{"action":"add","endpoint":{},"surprise":true}"#;
        let raw = format!(
            "POST /api/v1/endpoint HTTP/1.1\r\nhost: localhost\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let response = request(create_router(test_state()), &raw).await;
        assert!(response.starts_with("HTTP/1.1 4"), "got: {response}");
    }

    #[tokio::test]
    async fn status_reports_shape() {
        let response = request(
            create_router(test_state()),
            "GET /api/v1/status HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("packet_rate"));
        assert!(response.contains("endpoints"));
    }
}
