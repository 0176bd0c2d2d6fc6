//! Global blacklist handlers.

use super::auth::Identity;
use super::{ApiResult, AppState};
use crate::storage::models::{AddBlacklistRequest, Pagination};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use std::net::Ipv4Addr;
use tracing::info;

pub async fn list(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<serde_json::Value>> {
    // Lazy reap so listings never show expired rows.
    let _ = state.store.expire_blacklist().await;
    let rows = state.store.list_blacklist(page.offset(), page.limit()).await?;
    Ok(Json(serde_json::json!({ "blacklist": rows })))
}

pub async fn add(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<AddBlacklistRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let ip = request.ip.to_string();
    let row = state
        .store
        .add_blacklist(&ip, &request.reason, request.ttl_ms as i64)
        .await?;

    state.fleet.blacklist_added(&ip, request.ttl_ms).await;

    let _ = state
        .store
        .record_audit(&identity.subject, "add_blacklist", "blacklist", &ip, "{}")
        .await;

    info!(%ip, ttl_ms = request.ttl_ms, "Blacklist entry added");
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "entry": row }))))
}

pub async fn remove(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(ip): Path<Ipv4Addr>,
) -> ApiResult<StatusCode> {
    let ip = ip.to_string();
    state.store.remove_blacklist(&ip).await?;
    state.fleet.blacklist_removed(&ip).await;

    let _ = state
        .store
        .record_audit(&identity.subject, "remove_blacklist", "blacklist", &ip, "{}")
        .await;

    Ok(StatusCode::NO_CONTENT)
}
