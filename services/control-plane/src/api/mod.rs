//! Operator HTTP API, versioned under `/api/v1` behind bearer-token auth.

pub mod auth;
pub mod blacklist;
pub mod endpoints;
pub mod nodes;
pub mod system;
pub mod ws;

use crate::allocator::FrontAllocator;
use crate::events::EventSender;
use crate::fleet::FleetManager;
use crate::storage::Store;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{middleware, Json, Router};
use obsidianprotection_common::config::AppConfig;
use obsidianprotection_common::error::Error;
use obsidianprotection_common::metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state behind the operator API.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub fleet: Arc<FleetManager>,
    pub events: EventSender,
    pub config: Arc<AppConfig>,
    pub allocator: Arc<Mutex<FrontAllocator>>,
    pub started: Instant,
}

/// Error wrapper mapping the common taxonomy onto HTTP responses.
pub struct ApiError(pub Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        metrics::API_REQUESTS_TOTAL
            .with_label_values(&["control-plane", self.0.error_code()])
            .inc();
        (
            status,
            Json(serde_json::json!({
                "error": self.0.to_string(),
                "code": self.0.error_code(),
            })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Build the operator router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route(
            "/endpoints",
            get(endpoints::list).post(endpoints::create),
        )
        .route(
            "/endpoints/:id",
            get(endpoints::get_one)
                .put(endpoints::update)
                .delete(endpoints::remove),
        )
        .route("/endpoints/:id/metrics", get(endpoints::metrics))
        .route(
            "/endpoints/:id/whitelist",
            get(endpoints::whitelist_list).post(endpoints::whitelist_add),
        )
        .route(
            "/endpoints/:id/whitelist/:ip",
            delete(endpoints::whitelist_remove),
        )
        .route("/blacklist", get(blacklist::list).post(blacklist::add))
        .route("/blacklist/:ip", delete(blacklist::remove))
        .route("/nodes", get(nodes::list).post(nodes::register))
        .route("/nodes/:id", get(nodes::get_one))
        .route("/nodes/:id/status", get(nodes::status))
        .route("/system/status", get(system::status))
        .route("/system/stats", get(system::stats))
        .route("/ws", get(ws::upgrade))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}
