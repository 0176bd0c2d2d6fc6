//! Summary endpoints.

use super::{ApiResult, AppState};
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use std::collections::HashMap;

pub async fn status(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let nodes = state.fleet.nodes();
    let active = nodes
        .iter()
        .filter(|n| n.status == crate::fleet::NodeStatus::Active)
        .count();

    Ok(Json(serde_json::json!({
        "status": if active > 0 || nodes.is_empty() { "ok" } else { "degraded" },
        "uptime_seconds": state.started.elapsed().as_secs(),
        "nodes_total": nodes.len(),
        "nodes_active": active,
        "endpoints": state.fleet.endpoint_count(),
    })))
}

pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    // Latest cumulative counter per (node, name), summed across nodes.
    let cutoff = Utc::now() - chrono::Duration::minutes(5);
    let samples = state.store.metrics_since(cutoff).await?;

    let mut latest: HashMap<(String, String), f64> = HashMap::new();
    for sample in &samples {
        latest.insert((sample.node_id.clone(), sample.name.clone()), sample.value);
    }
    let mut totals: HashMap<String, f64> = HashMap::new();
    for ((_, name), value) in latest {
        *totals.entry(name).or_insert(0.0) += value;
    }

    Ok(Json(serde_json::json!({
        "window_seconds": 300,
        "counters": totals,
        "nodes": state.fleet.nodes().len(),
    })))
}
