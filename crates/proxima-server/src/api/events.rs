//! Platform event endpoints.
//!
//! The host's radio stack reports region transitions, location permission
//! changes and the Bluetooth radio state here. Each call is handed straight
//! to the engine.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use proxima_core::{BeaconId, BluetoothStatus, LocationAuthorization, ProximityEvent, ProximityKind};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::api::system::availability_label;
use crate::state::SharedState;

/// Creates the events router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/proximity", post(report_proximity))
        .route("/authorization", post(report_authorization))
        .route("/bluetooth", post(report_bluetooth))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Kind of region transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Entered the beacon's region.
    Enter,
    /// Left the beacon's region.
    Exit,
    /// Ranging sample; accepted and ignored.
    RangeUpdate,
}

impl From<TransitionKind> for ProximityKind {
    fn from(kind: TransitionKind) -> Self {
        match kind {
            TransitionKind::Enter => Self::Enter,
            TransitionKind::Exit => Self::Exit,
            TransitionKind::RangeUpdate => Self::RangeUpdate,
        }
    }
}

/// A region transition observed by the platform.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "beacon_id": "7367672374000000ffff0000ffff00030000100001",
    "kind": "enter",
    "observed_at": "2026-09-14T08:00:00Z",
    "rssi": -61,
    "location": "u33dc0"
}))]
pub struct ProximityRequest {
    /// Canonical beacon id: 32 hex digits of proximity UUID, then major and
    /// minor as five decimal digits each.
    #[schema(example = "7367672374000000ffff0000ffff00030000100001")]
    pub beacon_id: String,

    /// Transition kind.
    pub kind: TransitionKind,

    /// Observation time; defaults to now.
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,

    /// Estimated distance in metres.
    #[serde(default)]
    pub accuracy: Option<f64>,

    /// Received signal strength in dBm.
    #[serde(default)]
    pub rssi: Option<i16>,

    /// Geohash or location tag.
    #[serde(default)]
    pub location: Option<String>,
}

impl ProximityRequest {
    fn into_event(self) -> ApiResult<ProximityEvent> {
        let beacon_id = BeaconId::parse(&self.beacon_id)?;
        let mut event = ProximityEvent::new(
            beacon_id,
            self.kind.into(),
            self.observed_at.unwrap_or_else(Utc::now),
        )
        .with_ranging(self.accuracy, self.rssi);
        event.location = self.location;
        Ok(event)
    }
}

/// What the engine did with a transition.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "matched": 2,
    "delivered": ["6c1f5a04-8a0e-4d59-9d9e-2f8c0a3b6e11"],
    "scheduled": 1,
    "suppressed": 0
}))]
pub struct ProximityResponse {
    /// Rules whose trigger, beacon and timeframe matched.
    #[schema(example = 2)]
    pub matched: usize,

    /// Action ids delivered immediately.
    pub delivered: Vec<Uuid>,

    /// Deliveries waiting on a delay.
    #[schema(example = 1)]
    pub scheduled: usize,

    /// Matches rejected by suppression or once-only.
    #[schema(example = 0)]
    pub suppressed: usize,
}

/// Location permission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationState {
    /// The user has not been asked yet.
    NotDetermined,
    /// Blocked by policy.
    Restricted,
    /// The user declined.
    Denied,
    /// Monitoring is allowed.
    Authorized,
    /// Location services are off or absent.
    Unavailable,
}

impl From<AuthorizationState> for LocationAuthorization {
    fn from(state: AuthorizationState) -> Self {
        match state {
            AuthorizationState::NotDetermined => Self::NotDetermined,
            AuthorizationState::Restricted => Self::Restricted,
            AuthorizationState::Denied => Self::Denied,
            AuthorizationState::Authorized => Self::Authorized,
            AuthorizationState::Unavailable => Self::Unavailable,
        }
    }
}

/// Location permission change.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "status": "authorized" }))]
pub struct AuthorizationRequest {
    /// New permission state.
    pub status: AuthorizationState,
}

/// Bluetooth radio state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BluetoothState {
    /// The platform cannot tell.
    Unknown,
    /// The radio is off.
    Off,
    /// The radio is on.
    On,
}

impl From<BluetoothState> for BluetoothStatus {
    fn from(state: BluetoothState) -> Self {
        match state {
            BluetoothState::Unknown => Self::Unknown,
            BluetoothState::Off => Self::Off,
            BluetoothState::On => Self::On,
        }
    }
}

/// Bluetooth radio change.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "status": "off" }))]
pub struct BluetoothRequest {
    /// New radio state.
    pub status: BluetoothState,
}

/// Engine state after a permission or radio change.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "monitoring": true,
    "availability": "fully_functional"
}))]
pub struct MonitoringResponse {
    /// Whether groups are handed to the platform.
    #[schema(example = true)]
    pub monitoring: bool,

    /// Resulting availability.
    #[schema(example = "fully_functional")]
    pub availability: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// Report a region transition.
#[utoipa::path(
    post,
    path = "/api/events/proximity",
    tag = "events",
    operation_id = "reportProximity",
    summary = "Report a region transition",
    description = "Queues the transition for reporting, matches it against the active \
        layout and delivers or schedules every admitted action. Range updates are accepted \
        and ignored. Without a layout the event is queued and nothing fires.",
    request_body = ProximityRequest,
    responses(
        (status = 200, description = "Event processed", body = ProximityResponse),
        (status = 400, description = "Malformed beacon id", body = crate::api::ErrorResponse),
        (status = 500, description = "State could not be persisted", body = crate::api::ErrorResponse)
    )
)]
pub async fn report_proximity(
    State(state): State<SharedState>,
    Json(request): Json<ProximityRequest>,
) -> ApiResult<Json<ProximityResponse>> {
    let event = request.into_event()?;
    let outcome = state.engine.handle_proximity(event).await?;

    Ok(Json(ProximityResponse {
        matched: outcome.matched,
        delivered: outcome.delivered,
        scheduled: outcome.scheduled,
        suppressed: outcome.suppressed,
    }))
}

/// Report a location permission change.
#[utoipa::path(
    post,
    path = "/api/events/authorization",
    tag = "events",
    operation_id = "reportAuthorization",
    summary = "Report a location permission change",
    description = "Monitoring starts or stops with the permission. Denied or restricted \
        permission reports `authorization_restricted` availability.",
    request_body = AuthorizationRequest,
    responses(
        (status = 200, description = "Permission applied", body = MonitoringResponse)
    )
)]
pub async fn report_authorization(
    State(state): State<SharedState>,
    Json(request): Json<AuthorizationRequest>,
) -> Json<MonitoringResponse> {
    state.engine.handle_authorization(request.status.into()).await;

    Json(MonitoringResponse {
        monitoring: state.registry.is_monitoring(),
        availability: availability_label(state.engine.availability()),
    })
}

/// Report a Bluetooth radio change.
#[utoipa::path(
    post,
    path = "/api/events/bluetooth",
    tag = "events",
    operation_id = "reportBluetooth",
    summary = "Report a Bluetooth radio change",
    description = "Monitoring pauses while the radio is off and resumes when it is back on. \
        An off radio reports `bluetooth_restricted` availability.",
    request_body = BluetoothRequest,
    responses(
        (status = 200, description = "Radio state applied", body = MonitoringResponse)
    )
)]
pub async fn report_bluetooth(
    State(state): State<SharedState>,
    Json(request): Json<BluetoothRequest>,
) -> Json<MonitoringResponse> {
    state.engine.handle_bluetooth(request.status.into()).await;

    Json(MonitoringResponse {
        monitoring: state.registry.is_monitoring(),
        availability: availability_label(state.engine.availability()),
    })
}
