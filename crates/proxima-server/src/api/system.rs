//! System API endpoints.
//!
//! Provides engine status, a resolver ping and a full engine reset.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use proxima_core::{AvailabilityStatus, BluetoothStatus, LocationAuthorization};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::api::reports::ReportStatsResponse;
use crate::state::SharedState;

/// Creates the system router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/ping", post(ping_resolver))
        .route("/reset", post(reset))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// System status response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "version": "0.1.0",
    "started_at": "2026-09-14T06:00:00Z",
    "uptime_secs": 7200,
    "availability": "fully_functional",
    "authorization": "authorized",
    "bluetooth": "on",
    "layout_version": "2026-09-14.3",
    "rules": 12,
    "instant_rules": 1,
    "monitored_groups": ["7367672374000000ffff0000ffff0003"],
    "pending_deliveries": 1,
    "ledger_entries": 30,
    "degraded_fetches": 0,
    "resolver_latency_ms": 84,
    "reports": {
        "pending_monitor_events": 4,
        "pending_action_reports": 2,
        "dropped_records": 0,
        "consecutive_failures": 0,
        "last_flush_at": "2026-09-14T07:55:00Z"
    }
}))]
pub struct SystemStatusResponse {
    /// Server version.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// When the server started.
    pub started_at: DateTime<Utc>,

    /// Server uptime in seconds.
    #[schema(example = 7200)]
    pub uptime_secs: u64,

    /// Overall availability.
    #[schema(example = "fully_functional")]
    pub availability: String,

    /// Last location permission reported by the platform.
    #[schema(example = "authorized")]
    pub authorization: String,

    /// Last Bluetooth radio state reported by the platform.
    #[schema(example = "on")]
    pub bluetooth: String,

    /// Version of the active layout.
    pub layout_version: Option<String>,

    /// Proximity rules in the active layout.
    #[schema(example = 12)]
    pub rules: usize,

    /// Instant rules in the active layout.
    #[schema(example = 1)]
    pub instant_rules: usize,

    /// Groups the layout asks to monitor.
    pub monitored_groups: Vec<String>,

    /// Delayed deliveries waiting on their timer.
    #[schema(example = 1)]
    pub pending_deliveries: usize,

    /// Suppression and once-only entries.
    #[schema(example = 30)]
    pub ledger_entries: usize,

    /// Layout fetches answered from the cache.
    #[schema(example = 0)]
    pub degraded_fetches: u64,

    /// Latency of the last successful ping.
    pub resolver_latency_ms: Option<u64>,

    /// Report queue counters.
    pub reports: ReportStatsResponse,
}

/// Resolver ping result.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "latency_ms": 84, "availability": "fully_functional" }))]
pub struct PingResponse {
    /// Round-trip time.
    #[schema(example = 84)]
    pub latency_ms: u64,

    /// Availability after the ping.
    #[schema(example = "fully_functional")]
    pub availability: String,
}

/// What a reset did.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "cancelled_deliveries": 1,
    "flushed_records": 6,
    "discarded_records": 0,
    "retained_records": 0
}))]
pub struct ResetResponse {
    /// Pending deliveries cancelled.
    #[schema(example = 1)]
    pub cancelled_deliveries: usize,

    /// Records uploaded by the final flush.
    #[schema(example = 6)]
    pub flushed_records: usize,

    /// Records discarded without upload.
    #[schema(example = 0)]
    pub discarded_records: usize,

    /// Records kept because the final flush failed.
    #[schema(example = 0)]
    pub retained_records: usize,
}

/// Wire label for an availability status.
pub(crate) fn availability_label(status: AvailabilityStatus) -> String {
    match status {
        AvailabilityStatus::FullyFunctional => "fully_functional",
        AvailabilityStatus::BluetoothRestricted => "bluetooth_restricted",
        AvailabilityStatus::AuthorizationRestricted => "authorization_restricted",
        AvailabilityStatus::ReachabilityRestricted => "reachability_restricted",
        AvailabilityStatus::BeaconsUnavailable => "beacons_unavailable",
    }
    .to_string()
}

pub(crate) fn bluetooth_label(status: BluetoothStatus) -> String {
    match status {
        BluetoothStatus::Unknown => "unknown",
        BluetoothStatus::Off => "off",
        BluetoothStatus::On => "on",
    }
    .to_string()
}

fn authorization_label(status: LocationAuthorization) -> String {
    match status {
        LocationAuthorization::NotDetermined => "not_determined",
        LocationAuthorization::Restricted => "restricted",
        LocationAuthorization::Denied => "denied",
        LocationAuthorization::Authorized => "authorized",
        LocationAuthorization::Unavailable => "unavailable",
    }
    .to_string()
}

// ============================================================================
// Handlers
// ============================================================================

/// Get system status.
#[utoipa::path(
    get,
    path = "/api/system/status",
    tag = "system",
    operation_id = "getSystemStatus",
    summary = "Get system status",
    description = "Returns version, uptime, availability and engine counters.",
    responses(
        (status = 200, description = "System status retrieved", body = SystemStatusResponse)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> Json<SystemStatusResponse> {
    let status = state.engine.status().await;
    let started_at = state.started_at();
    let uptime_secs = u64::try_from((Utc::now() - started_at).num_seconds()).unwrap_or(0);

    Json(SystemStatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at,
        uptime_secs,
        availability: availability_label(status.availability),
        authorization: authorization_label(status.authorization),
        bluetooth: bluetooth_label(status.bluetooth),
        layout_version: status.layout_version,
        rules: status.rules,
        instant_rules: status.instant_rules,
        monitored_groups: status.monitored_groups,
        pending_deliveries: status.pending_deliveries,
        ledger_entries: status.ledger_entries,
        degraded_fetches: status.degraded_fetches,
        resolver_latency_ms: status.resolver_latency_ms,
        reports: status.reports.into(),
    })
}

/// Ping the resolver.
#[utoipa::path(
    post,
    path = "/api/system/ping",
    tag = "system",
    operation_id = "pingResolver",
    summary = "Ping the resolver",
    description = "Measures resolver latency and updates reachability.",
    responses(
        (status = 200, description = "Resolver answered", body = PingResponse),
        (status = 503, description = "Resolver unreachable", body = crate::api::ErrorResponse)
    )
)]
pub async fn ping_resolver(State(state): State<SharedState>) -> ApiResult<Json<PingResponse>> {
    let latency = state.engine.ping().await?;

    Ok(Json(PingResponse {
        latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
        availability: availability_label(state.engine.availability()),
    }))
}

/// Reset the engine.
#[utoipa::path(
    post,
    path = "/api/system/reset",
    tag = "system",
    operation_id = "resetEngine",
    summary = "Reset the engine",
    description = "Cancels pending deliveries, flushes or discards queued reports per \
        `reports.reset_policy`, clears suppression and once-only history, drops the cached \
        layout and stops monitoring. The next refresh starts from scratch.",
    responses(
        (status = 200, description = "Engine reset", body = ResetResponse),
        (status = 500, description = "Cleared state could not be persisted", body = crate::api::ErrorResponse)
    )
)]
pub async fn reset(State(state): State<SharedState>) -> ApiResult<Json<ResetResponse>> {
    let summary = state.engine.reset().await?;
    state.clear_recent_actions().await;

    Ok(Json(ResetResponse {
        cancelled_deliveries: summary.cancelled_deliveries,
        flushed_records: summary.flushed_records,
        discarded_records: summary.discarded_records,
        retained_records: summary.retained_records,
    }))
}
