//! Health check API endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::system::availability_label;
use crate::state::SharedState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "ok",
    "version": "0.1.0",
    "availability": "fully_functional",
    "layout_loaded": true
}))]
pub struct HealthResponse {
    /// Service status.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version from Cargo.toml.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Engine availability (`fully_functional`, `bluetooth_restricted`,
    /// `authorization_restricted`, `reachability_restricted`, `beacons_unavailable`).
    #[schema(example = "fully_functional")]
    pub availability: String,

    /// Whether a layout is active.
    #[schema(example = true)]
    pub layout_loaded: bool,
}

/// Creates the health router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(health_check))
}

/// Health check endpoint.
///
/// The process answers `ok` whenever it can serve requests; degraded engine
/// states are reported through `availability` instead of the status code.
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    operation_id = "healthCheck",
    summary = "Check service health",
    description = "Returns basic service status. Use this endpoint for supervisor \
        health checks; inspect `availability` to see whether beacon actions can fire.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        availability: availability_label(state.engine.availability()),
        layout_loaded: state.engine.current_layout().is_some(),
    })
}
