//! HTTP API routes and handlers.
//!
//! - `events` - region transitions, location permission and radio state from the platform
//! - `layout` - active layout, refresh and monitored groups
//! - `reports` - report queue inspection and flushing
//! - `actions` - recently fired actions
//! - `system` - status, resolver ping and reset
//! - `health` - liveness
//! - `error` - API error types
//! - `openapi` - OpenAPI document

use axum::routing::get;
use axum::Router;

use crate::state::SharedState;

pub mod actions;
pub mod error;
pub mod events;
pub mod health;
pub mod layout;
pub mod openapi;
pub mod reports;
pub mod system;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                      - Health check
/// /api
/// ├── /events/proximity        - Region transition
/// ├── /events/authorization    - Location permission change
/// ├── /events/bluetooth        - Bluetooth radio change
/// ├── /regions                 - Monitored beacon groups
/// ├── /layout                  - Active layout, refresh, single rule
/// ├── /reports                 - Queue snapshot and flush
/// ├── /actions                 - Recently fired actions
/// ├── /system                  - Status, ping, reset
/// └── /openapi.json            - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest("/events", events::router())
                .nest("/regions", layout::regions_router())
                .nest("/layout", layout::router())
                .nest("/reports", reports::router())
                .nest("/actions", actions::router())
                .nest("/system", system::router()),
        )
        .with_state(state)
}
