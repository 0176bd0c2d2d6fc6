//! Fleet view and node registration handlers.

use super::{ApiResult, AppState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use obsidianprotection_common::error::Error;
use obsidianprotection_common::types::NodeRegistration;

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(serde_json::json!({ "nodes": state.fleet.nodes() })))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let node = state
        .fleet
        .node(&id)
        .ok_or_else(|| Error::not_found("Node", id.clone()))?;
    Ok(Json(serde_json::json!({ "node": node })))
}

pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let node = state
        .fleet
        .node(&id)
        .ok_or_else(|| Error::not_found("Node", id.clone()))?;
    Ok(Json(serde_json::json!({
        "status": node.status,
        "last_seen": node.last_seen,
        "cpu_usage": node.cpu_usage,
        "memory_usage": node.memory_usage,
        "packet_rate": node.packet_rate,
        "endpoints": node.endpoints,
    })))
}

/// Called by edge nodes at bring-up.
pub async fn register(
    State(state): State<AppState>,
    Json(registration): Json<NodeRegistration>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let node_id = registration.id.clone();
    state.fleet.register_node(registration).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "node_id": node_id })),
    ))
}
