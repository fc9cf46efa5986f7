//! OpenAPI specification for the proxima host API.
//!
//! Served at `/api/openapi.json` and written to disk by the `gen-openapi`
//! binary for client generation.

use axum::Json;
use utoipa::OpenApi;

use super::actions::{ActionsResponse, FiredAction};
use super::error::ErrorResponse;
use super::events::{
    AuthorizationRequest, AuthorizationState, BluetoothRequest, BluetoothState,
    MonitoringResponse, ProximityRequest, ProximityResponse, TransitionKind,
};
use super::health::HealthResponse;
use super::layout::{LayoutResponse, RefreshResponse, RegionsResponse, RuleResponse};
use super::reports::{FlushResponse, ReportStatsResponse, ReportsResponse};
use super::system::{PingResponse, ResetResponse, SystemStatusResponse};

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// The OpenAPI specification as pretty JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// OpenAPI document for proxima.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "proxima API",
        version = "0.1.0",
        description = r#"
# proxima API

proxima turns beacon sightings into campaign actions.

## Overview

The host's radio stack reports region transitions to this daemon. The daemon:

1. **Matches** each transition against the layout fetched from the resolver
2. **Admits** matches through suppression windows and once-only history
3. **Delivers** actions immediately or after the rule's delay
4. **Reports** every transition and firing back to the resolver in batches

## Degraded operation

- When the resolver is unreachable the last cached layout keeps serving
- Reports stay queued across restarts until the resolver acknowledges them
- Availability in `/health` and `/api/system/status` explains what is limited
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local proxima daemon")
    ),
    tags(
        (name = "system", description = "Health checks, status, resolver ping and reset"),
        (name = "events", description = "Region transitions, location permission and Bluetooth state from the platform"),
        (name = "layout", description = "Active layout and monitored beacon groups"),
        (name = "reports", description = "Queued reports awaiting upload"),
        (name = "actions", description = "Recently fired actions")
    ),
    paths(
        super::health::health_check,
        super::events::report_proximity,
        super::events::report_authorization,
        super::events::report_bluetooth,
        super::layout::get_layout,
        super::layout::get_rule,
        super::layout::refresh_layout,
        super::layout::get_regions,
        super::reports::get_reports,
        super::reports::flush_reports,
        super::actions::get_actions,
        super::system::get_status,
        super::system::ping_resolver,
        super::system::reset,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            TransitionKind,
            ProximityRequest,
            ProximityResponse,
            AuthorizationState,
            AuthorizationRequest,
            BluetoothState,
            BluetoothRequest,
            MonitoringResponse,
            LayoutResponse,
            RuleResponse,
            RefreshResponse,
            RegionsResponse,
            ReportStatsResponse,
            ReportsResponse,
            FlushResponse,
            FiredAction,
            ActionsResponse,
            SystemStatusResponse,
            PingResponse,
            ResetResponse,
        )
    )
)]
pub struct ApiDoc;
