//! Endpoint CRUD, per-endpoint metrics and whitelist handlers.

use super::auth::Identity;
use super::{ApiError, ApiResult, AppState};
use crate::events::Event;
use crate::storage::models::{
    AddWhitelistRequest, CreateEndpointRequest, EndpointRow, Pagination, UpdateEndpointRequest,
    parse_since,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use obsidianprotection_common::db;
use obsidianprotection_common::error::Error;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::info;
use validator::Validate;

const DEFAULT_RATE_LIMIT: u32 = 1000;
const DEFAULT_BURST_LIMIT: u32 = 5000;

pub async fn list(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<serde_json::Value>> {
    let rows = state
        .store
        .list_endpoints(&identity.organization, page.offset(), page.limit())
        .await?;
    Ok(Json(serde_json::json!({ "endpoints": rows })))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<CreateEndpointRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    request.validate().map_err(Error::from)?;

    let rate_limit = request.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT);
    let burst_limit = request
        .burst_limit
        .unwrap_or(DEFAULT_BURST_LIMIT)
        .max(rate_limit);
    if rate_limit < 1 {
        return Err(Error::validation("rate_limit must be at least 1").into());
    }

    let (front_ip, front_port) = state.allocator.lock().allocate()?;

    // The allocator avoids live tuples, but the store is the source of truth
    // across restarts; surface a collision before inserting.
    let taken = match state
        .store
        .front_tuple_taken(
            &front_ip.to_string(),
            front_port as i32,
            request.kind.as_str(),
        )
        .await
    {
        Ok(taken) => taken,
        Err(e) => {
            state.allocator.lock().release(front_ip, front_port);
            return Err(e.into());
        }
    };
    if taken {
        state.allocator.lock().release(front_ip, front_port);
        return Err(Error::already_exists(
            "Endpoint",
            "front",
            format!("{front_ip}:{front_port}/{}", request.kind.as_str()),
        )
        .into());
    }

    let row = EndpointRow {
        id: db::generate_id(),
        organization_id: identity.organization.clone(),
        name: request.name,
        front_ip: front_ip.to_string(),
        front_port: front_port as i32,
        origin_ip: request.origin_ip.to_string(),
        origin_port: request.origin_port as i32,
        kind: request.kind.as_str().to_string(),
        rate_limit: rate_limit as i32,
        burst_limit: burst_limit as i32,
        maintenance: request.maintenance,
        active: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    if let Err(e) = state.store.create_endpoint(&row).await {
        state.allocator.lock().release(front_ip, front_port);
        return Err(e.into());
    }

    let spec = row.to_spec()?;
    state.fleet.endpoint_added(spec.clone()).await;
    let _ = state.events.send(Event::EndpointUpdate(spec));

    let _ = state
        .store
        .record_audit(
            &identity.subject,
            "create_endpoint",
            "endpoint",
            &row.id,
            &format!(
                "{{\"name\":\"{}\",\"origin\":\"{}:{}\",\"kind\":\"{}\"}}",
                row.name, row.origin_ip, row.origin_port, row.kind
            ),
        )
        .await;

    info!(endpoint_id = %row.id, front = %row.front_ip, port = row.front_port, "Endpoint created");
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "endpoint": row })),
    ))
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let row = fetch_owned(&state, &identity, &id).await?;
    Ok(Json(serde_json::json!({ "endpoint": row })))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Json(request): Json<UpdateEndpointRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if request.is_empty() {
        return Err(Error::validation("no fields to update").into());
    }

    let mut row = fetch_owned(&state, &identity, &id).await?;
    if let Some(name) = request.name {
        row.name = name;
    }
    if let Some(rate_limit) = request.rate_limit {
        row.rate_limit = rate_limit as i32;
    }
    if let Some(burst_limit) = request.burst_limit {
        row.burst_limit = burst_limit as i32;
    }
    if let Some(maintenance) = request.maintenance {
        row.maintenance = maintenance;
    }
    if let Some(active) = request.active {
        row.active = active;
    }
    if row.rate_limit < 1 || row.burst_limit < row.rate_limit {
        return Err(Error::validation("require burst_limit >= rate_limit >= 1").into());
    }
    row.updated_at = Utc::now();

    state.store.update_endpoint(&row).await?;

    let spec = row.to_spec()?;
    state.fleet.endpoint_updated(spec.clone()).await;
    let _ = state.events.send(Event::EndpointUpdate(spec));

    let _ = state
        .store
        .record_audit(&identity.subject, "update_endpoint", "endpoint", &id, "{}")
        .await;

    Ok(Json(serde_json::json!({ "endpoint": row })))
}

/// Removal order: maps on the nodes first, then the durable row, so a
/// subsequent create cannot collide with a stale kernel slot.
pub async fn remove(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let row = fetch_owned(&state, &identity, &id).await?;

    state.fleet.endpoint_removed(&id).await;
    state.store.delete_endpoint(&id).await?;

    if let (Ok(front_ip), port) = (row.front_ip.parse::<Ipv4Addr>(), row.front_port as u16) {
        state.allocator.lock().release(front_ip, port);
    }

    let mut spec = row.to_spec()?;
    spec.active = false;
    let _ = state.events.send(Event::EndpointUpdate(spec));

    let _ = state
        .store
        .record_audit(&identity.subject, "delete_endpoint", "endpoint", &id, "{}")
        .await;

    info!(endpoint_id = %id, "Endpoint deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub since: Option<String>,
}

/// Counter totals over a window, aggregated from the node samples collected
/// by the fleet manager.
pub async fn metrics(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let _ = fetch_owned(&state, &identity, &id).await?;

    let window = parse_since(query.since.as_deref().unwrap_or("15m"))?;
    let cutoff = Utc::now() - window;
    let samples = state.store.metrics_since(cutoff).await?;

    // Counters are cumulative per node: take each node's latest value and
    // sum across nodes.
    let mut latest: HashMap<(String, String), f64> = HashMap::new();
    for sample in &samples {
        latest.insert((sample.node_id.clone(), sample.name.clone()), sample.value);
    }
    let mut totals: HashMap<String, f64> = HashMap::new();
    for ((_, name), value) in latest {
        *totals.entry(name).or_insert(0.0) += value;
    }

    Ok(Json(serde_json::json!({
        "endpoint_id": id,
        "since_seconds": window.num_seconds(),
        "counters": totals,
    })))
}

pub async fn whitelist_list(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let _ = fetch_owned(&state, &identity, &id).await?;
    let rows = state.store.list_whitelist(&id).await?;
    Ok(Json(serde_json::json!({ "whitelist": rows })))
}

pub async fn whitelist_add(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Json(request): Json<AddWhitelistRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let _ = fetch_owned(&state, &identity, &id).await?;
    let row = state
        .store
        .add_whitelist(&id, &request.ip.to_string(), &request.description)
        .await?;

    let _ = state
        .store
        .record_audit(&identity.subject, "add_whitelist", "endpoint", &id, "{}")
        .await;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "entry": row })),
    ))
}

pub async fn whitelist_remove(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path((id, ip)): Path<(String, Ipv4Addr)>,
) -> ApiResult<StatusCode> {
    let _ = fetch_owned(&state, &identity, &id).await?;
    state.store.remove_whitelist(&id, &ip.to_string()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Fetch an endpoint and enforce organization ownership.
async fn fetch_owned(
    state: &AppState,
    identity: &Identity,
    id: &str,
) -> Result<EndpointRow, ApiError> {
    let row = state.store.get_endpoint(id).await?;
    if row.organization_id != identity.organization {
        // Do not leak existence across organizations.
        return Err(Error::not_found("Endpoint", id).into());
    }
    Ok(row)
}
