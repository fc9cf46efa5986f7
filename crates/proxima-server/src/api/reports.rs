//! Report queue endpoints.

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use proxima_core::{FlushOutcome, ReportQueueStats};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Creates the reports router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(get_reports))
        .route("/flush", post(flush_reports))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Report queue counters.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "pending_monitor_events": 4,
    "pending_action_reports": 2,
    "dropped_records": 0,
    "consecutive_failures": 1,
    "last_flush_at": "2026-09-14T07:55:00Z"
}))]
pub struct ReportStatsResponse {
    /// Monitor events waiting for upload.
    #[schema(example = 4)]
    pub pending_monitor_events: usize,

    /// Action reports waiting for upload.
    #[schema(example = 2)]
    pub pending_action_reports: usize,

    /// Oldest records discarded because the queue was full.
    #[schema(example = 0)]
    pub dropped_records: u64,

    /// Failed uploads since the last success.
    #[schema(example = 1)]
    pub consecutive_failures: u32,

    /// Last acknowledged upload.
    pub last_flush_at: Option<DateTime<Utc>>,
}

impl From<ReportQueueStats> for ReportStatsResponse {
    fn from(stats: ReportQueueStats) -> Self {
        Self {
            pending_monitor_events: stats.pending_monitor_events,
            pending_action_reports: stats.pending_action_reports,
            dropped_records: stats.dropped_records,
            consecutive_failures: stats.consecutive_failures,
            last_flush_at: stats.last_flush_at,
        }
    }
}

/// Pending reports.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReportsResponse {
    /// Queue counters.
    pub stats: ReportStatsResponse,

    /// The batch the next flush would send, in resolver wire format.
    #[schema(value_type = Object)]
    pub pending: serde_json::Value,
}

/// Query parameters for a flush.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct FlushQuery {
    /// Ignore the retry backoff and wait for an in-flight flush.
    /// Defaults to `true`.
    #[param(example = true)]
    pub immediate: Option<bool>,
}

/// Result of a flush.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "outcome": "sent",
    "monitor_events": 4,
    "action_reports": 2,
    "retry_in_secs": null
}))]
pub struct FlushResponse {
    /// `sent`, `empty`, `in_flight` or `backing_off`.
    #[schema(example = "sent")]
    pub outcome: String,

    /// Monitor events acknowledged.
    #[schema(example = 4)]
    pub monitor_events: usize,

    /// Action reports acknowledged.
    #[schema(example = 2)]
    pub action_reports: usize,

    /// Seconds until the next periodic attempt when backing off.
    pub retry_in_secs: Option<u64>,
}

impl From<FlushOutcome> for FlushResponse {
    fn from(outcome: FlushOutcome) -> Self {
        let (label, monitor_events, action_reports, retry_in_secs) = match outcome {
            FlushOutcome::Sent {
                monitor_events,
                action_reports,
            } => ("sent", monitor_events, action_reports, None),
            FlushOutcome::Empty => ("empty", 0, 0, None),
            FlushOutcome::InFlight => ("in_flight", 0, 0, None),
            FlushOutcome::BackingOff { retry_in_secs } => {
                ("backing_off", 0, 0, Some(retry_in_secs))
            }
        };

        Self {
            outcome: label.to_string(),
            monitor_events,
            action_reports,
            retry_in_secs,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Inspect the report queue.
#[utoipa::path(
    get,
    path = "/api/reports",
    tag = "reports",
    operation_id = "getReports",
    summary = "Inspect queued reports",
    description = "Returns queue counters and the batch the next flush would upload.",
    responses(
        (status = 200, description = "Queue snapshot", body = ReportsResponse)
    )
)]
pub async fn get_reports(State(state): State<SharedState>) -> ApiResult<Json<ReportsResponse>> {
    let pending =
        serde_json::to_value(state.engine.pending_reports()).map_err(|e| ApiError::InternalError {
            error_code: "REPORT_ENCODE_FAILED".to_string(),
            message: "Failed to encode pending reports".to_string(),
            details: Some(e.to_string()),
        })?;

    Ok(Json(ReportsResponse {
        stats: state.engine.report_stats().into(),
        pending,
    }))
}

/// Upload queued reports now.
#[utoipa::path(
    post,
    path = "/api/reports/flush",
    tag = "reports",
    operation_id = "flushReports",
    summary = "Flush queued reports",
    description = "Uploads every queued record in one batch. Records are removed only after \
        the resolver acknowledges them; on failure they stay queued and a 502 is returned.",
    params(FlushQuery),
    responses(
        (status = 200, description = "Flush finished", body = FlushResponse),
        (status = 502, description = "Resolver rejected the batch", body = crate::api::ErrorResponse)
    )
)]
pub async fn flush_reports(
    State(state): State<SharedState>,
    Query(query): Query<FlushQuery>,
) -> ApiResult<Json<FlushResponse>> {
    let outcome = state
        .engine
        .flush_reports(query.immediate.unwrap_or(true))
        .await?;
    Ok(Json(outcome.into()))
}
