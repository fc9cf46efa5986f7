//! Fired actions.
//!
//! The engine publishes every firing on a broadcast channel; the server keeps
//! the most recent ones so a host UI can poll for them.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use proxima_core::{ActionKind, FiringRecord, TriggerKind};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::state::{SharedState, RECENT_ACTIONS_CAPACITY};

/// Creates the actions router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(get_actions))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query parameters for the action list.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct ActionsQuery {
    /// Maximum number of actions, newest first. Defaults to 20.
    #[param(example = 20, minimum = 1, maximum = 100)]
    pub limit: Option<usize>,
}

/// A fired action.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "action_id": "6c1f5a04-8a0e-4d59-9d9e-2f8c0a3b6e11",
    "rule_id": "welcome",
    "beacon_id": "7367672374000000ffff0000ffff00030000100001",
    "trigger": "enter",
    "kind": "notification",
    "scheduled_at": "2026-09-14T08:00:00Z",
    "deliver_at": "2026-09-14T08:00:05Z",
    "location": null,
    "content": { "subject": "Welcome", "body": "Coffee is on us" }
}))]
pub struct FiredAction {
    /// Unique id of this firing.
    pub action_id: Uuid,

    /// Rule that fired.
    #[schema(example = "welcome")]
    pub rule_id: String,

    /// Beacon that caused it; absent for instant rules.
    pub beacon_id: Option<String>,

    /// `enter`, `exit` or `enter_or_exit`.
    #[schema(example = "enter")]
    pub trigger: String,

    /// `notification`, `website`, `in_app` or `other`.
    #[schema(example = "notification")]
    pub kind: String,

    /// When the triggering event happened.
    pub scheduled_at: DateTime<Utc>,

    /// When the action was due.
    pub deliver_at: DateTime<Utc>,

    /// Location tag of the triggering event.
    pub location: Option<String>,

    /// Content to present.
    #[schema(value_type = Object)]
    pub content: serde_json::Value,
}

impl From<FiringRecord> for FiredAction {
    fn from(record: FiringRecord) -> Self {
        Self {
            action_id: record.action_id,
            rule_id: record.rule_id,
            beacon_id: record.beacon_id.map(String::from),
            trigger: match record.trigger_kind {
                TriggerKind::OnEnter => "enter",
                TriggerKind::OnExit => "exit",
                TriggerKind::OnEnterOrExit => "enter_or_exit",
            }
            .to_string(),
            kind: match record.kind {
                ActionKind::Notification => "notification",
                ActionKind::Website => "website",
                ActionKind::InApp => "in_app",
                ActionKind::Other(_) => "other",
            }
            .to_string(),
            scheduled_at: record.scheduled_at,
            deliver_at: record.deliver_at,
            location: record.location,
            content: serde_json::to_value(&record.context).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Recently fired actions.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ActionsResponse {
    /// Newest first.
    pub actions: Vec<FiredAction>,
}

// ============================================================================
// Handlers
// ============================================================================

/// List recently fired actions.
#[utoipa::path(
    get,
    path = "/api/actions",
    tag = "actions",
    operation_id = "getActions",
    summary = "List recently fired actions",
    description = "Returns the most recent firings, newest first. The server keeps the last \
        100; older firings are only visible in the report queue.",
    params(ActionsQuery),
    responses(
        (status = 200, description = "Recent actions", body = ActionsResponse)
    )
)]
pub async fn get_actions(
    State(state): State<SharedState>,
    Query(query): Query<ActionsQuery>,
) -> Json<ActionsResponse> {
    let limit = query.limit.unwrap_or(20).clamp(1, RECENT_ACTIONS_CAPACITY);
    let actions = state
        .recent_actions(limit)
        .await
        .into_iter()
        .map(FiredAction::from)
        .collect();

    Json(ActionsResponse { actions })
}
