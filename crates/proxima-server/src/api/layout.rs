//! Layout endpoints.
//!
//! The layout is fetched from the resolver on refresh and served from the
//! on-disk cache when the resolver cannot be reached.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use proxima_core::{LayoutSnapshot, LayoutSource};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Creates the layout router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(get_layout))
        .route("/refresh", post(refresh_layout))
        .route("/rules/{rule_id}", get(get_rule))
}

/// Creates the regions router.
pub fn regions_router() -> Router<SharedState> {
    Router::new().route("/", get(get_regions))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// The active layout.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "version": "2026-09-14.3",
    "rules": 12,
    "instant_rules": 1,
    "report_trigger_secs": 300,
    "layout": {
        "accountProximityUUIDs": ["7367672374000000ffff0000ffff0003"],
        "actions": [],
        "instantActions": []
    }
}))]
pub struct LayoutResponse {
    /// Layout version, if the resolver sent one.
    #[schema(example = "2026-09-14.3")]
    pub version: Option<String>,

    /// Number of proximity rules.
    #[schema(example = 12)]
    pub rules: usize,

    /// Number of instant rules.
    #[schema(example = 1)]
    pub instant_rules: usize,

    /// Flush interval requested by the layout.
    #[schema(example = 300)]
    pub report_trigger_secs: Option<u64>,

    /// The layout in resolver wire format.
    #[schema(value_type = Object)]
    pub layout: serde_json::Value,
}

impl LayoutResponse {
    fn from_snapshot(snapshot: &LayoutSnapshot) -> ApiResult<Self> {
        let layout = serde_json::to_value(snapshot).map_err(|e| ApiError::InternalError {
            error_code: "LAYOUT_ENCODE_FAILED".to_string(),
            message: "Failed to encode layout".to_string(),
            details: Some(e.to_string()),
        })?;

        Ok(Self {
            version: snapshot.version.clone(),
            rules: snapshot.rules.len(),
            instant_rules: snapshot.instant_rules.len(),
            report_trigger_secs: snapshot.report_trigger_secs,
            layout,
        })
    }
}

/// One rule of the active layout.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "rule_id": "welcome",
    "rule": { "eid": "welcome", "trigger": 1, "beacons": ["7367672374000000ffff0000ffff00030000100001"] }
}))]
pub struct RuleResponse {
    /// Rule id (`eid`).
    #[schema(example = "welcome")]
    pub rule_id: String,

    /// The rule in resolver wire format.
    #[schema(value_type = Object)]
    pub rule: serde_json::Value,
}

/// Result of a refresh.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "source": "network",
    "changed": true,
    "version": "2026-09-14.3",
    "rules": 12,
    "instant_rules": 1
}))]
pub struct RefreshResponse {
    /// `network` for a fresh fetch, `cache` when the resolver failed.
    #[schema(example = "network")]
    pub source: String,

    /// Whether the active layout was replaced.
    #[schema(example = true)]
    pub changed: bool,

    /// Version of the layout now active.
    #[schema(example = "2026-09-14.3")]
    pub version: Option<String>,

    /// Number of proximity rules.
    #[schema(example = 12)]
    pub rules: usize,

    /// Number of instant rules.
    #[schema(example = 1)]
    pub instant_rules: usize,
}

/// Monitored beacon groups.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "monitoring": true,
    "groups": ["7367672374000000ffff0000ffff0003"]
}))]
pub struct RegionsResponse {
    /// Whether the platform is currently monitoring.
    #[schema(example = true)]
    pub monitoring: bool,

    /// Proximity UUIDs handed to the platform.
    pub groups: Vec<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the active layout.
#[utoipa::path(
    get,
    path = "/api/layout",
    tag = "layout",
    operation_id = "getLayout",
    summary = "Get the active layout",
    description = "Returns the layout the engine is matching against, in resolver wire format.",
    responses(
        (status = 200, description = "Layout retrieved", body = LayoutResponse),
        (status = 404, description = "No layout has been loaded", body = crate::api::ErrorResponse)
    )
)]
pub async fn get_layout(State(state): State<SharedState>) -> ApiResult<Json<LayoutResponse>> {
    let snapshot = state.engine.current_layout().ok_or_else(no_layout)?;
    Ok(Json(LayoutResponse::from_snapshot(&snapshot)?))
}

/// Get one rule of the active layout.
#[utoipa::path(
    get,
    path = "/api/layout/rules/{rule_id}",
    tag = "layout",
    operation_id = "getLayoutRule",
    summary = "Get a rule by id",
    params(("rule_id" = String, Path, description = "Rule id (`eid`)")),
    responses(
        (status = 200, description = "Rule retrieved", body = RuleResponse),
        (status = 404, description = "No layout or no such rule", body = crate::api::ErrorResponse)
    )
)]
pub async fn get_rule(
    State(state): State<SharedState>,
    Path(rule_id): Path<String>,
) -> ApiResult<Json<RuleResponse>> {
    let snapshot = state.engine.current_layout().ok_or_else(no_layout)?;
    let rule = snapshot.find_rule(&rule_id).ok_or_else(|| ApiError::NotFound {
        error_code: "RULE_NOT_FOUND".to_string(),
        message: format!("No rule with id '{rule_id}' in the active layout"),
    })?;

    let encoded = serde_json::to_value(rule).map_err(|e| ApiError::InternalError {
        error_code: "LAYOUT_ENCODE_FAILED".to_string(),
        message: "Failed to encode rule".to_string(),
        details: Some(e.to_string()),
    })?;

    Ok(Json(RuleResponse {
        rule_id,
        rule: encoded,
    }))
}

/// Fetch the layout from the resolver.
#[utoipa::path(
    post,
    path = "/api/layout/refresh",
    tag = "layout",
    operation_id = "refreshLayout",
    summary = "Refresh the layout",
    description = "Fetches the layout from the resolver. On failure the cached layout is \
        kept and reported with `source: cache`. Instant rules fire after a successful fetch.",
    responses(
        (status = 200, description = "Layout active", body = RefreshResponse),
        (status = 503, description = "Resolver unreachable and nothing cached", body = crate::api::ErrorResponse)
    )
)]
pub async fn refresh_layout(State(state): State<SharedState>) -> ApiResult<Json<RefreshResponse>> {
    let outcome = state.engine.request_layout().await?;

    Ok(Json(RefreshResponse {
        source: match outcome.source {
            LayoutSource::Network => "network",
            LayoutSource::Cache => "cache",
        }
        .to_string(),
        changed: outcome.changed,
        version: outcome.snapshot.version.clone(),
        rules: outcome.snapshot.rules.len(),
        instant_rules: outcome.snapshot.instant_rules.len(),
    }))
}

/// List monitored beacon groups.
#[utoipa::path(
    get,
    path = "/api/regions",
    tag = "layout",
    operation_id = "getRegions",
    summary = "List monitored beacon groups",
    description = "Returns the proximity UUIDs currently handed to the platform. Empty while \
        location permission is denied or before a layout is loaded.",
    responses(
        (status = 200, description = "Monitored groups", body = RegionsResponse)
    )
)]
pub async fn get_regions(State(state): State<SharedState>) -> Json<RegionsResponse> {
    Json(RegionsResponse {
        monitoring: state.registry.is_monitoring(),
        groups: state.registry.monitored_groups(),
    })
}

fn no_layout() -> ApiError {
    ApiError::NotFound {
        error_code: "NO_LAYOUT".to_string(),
        message: "No layout has been loaded yet".to_string(),
    }
}
