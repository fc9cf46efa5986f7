//! Firing records and the in-process action notification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::beacon::{BeaconId, ProximityEvent};
use crate::layout::{ActionKind, Content, TriggerKind, TriggerRule};

/// What caused a rule to be scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Beacon of the event; `None` for instant rules.
    pub beacon_id: Option<BeaconId>,

    /// Observed transition, or the rule's own kind for instant rules.
    pub kind: TriggerKind,

    /// Location tag carried from the event.
    pub location: Option<String>,
}

impl Trigger {
    /// Trigger for a proximity event. Range updates never trigger anything.
    #[must_use]
    pub fn from_event(event: &ProximityEvent) -> Option<Self> {
        TriggerKind::observed(event.kind).map(|kind| Self {
            beacon_id: Some(event.beacon_id.clone()),
            kind,
            location: event.location.clone(),
        })
    }

    /// Trigger for an instant rule.
    #[must_use]
    pub const fn instant(rule: &TriggerRule) -> Self {
        Self {
            beacon_id: None,
            kind: rule.trigger_kind,
            location: None,
        }
    }
}

/// One delivered (or expired) firing of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiringRecord {
    /// Unique id of this firing.
    pub action_id: Uuid,

    /// Rule that fired.
    pub rule_id: String,

    /// Beacon that triggered it; absent for instant rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beacon_id: Option<BeaconId>,

    /// Transition that triggered it.
    pub trigger_kind: TriggerKind,

    /// When the match was admitted.
    pub scheduled_at: DateTime<Utc>,

    /// When it was (or would have been) delivered.
    pub deliver_at: DateTime<Utc>,

    /// Location tag of the triggering event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Campaign type tag of the rule.
    pub kind: ActionKind,

    /// Rule content presented to the host.
    pub context: Content,
}

impl FiringRecord {
    /// Build a record for `rule` with a fresh action id.
    #[must_use]
    pub fn new(
        rule: &TriggerRule,
        trigger: &Trigger,
        scheduled_at: DateTime<Utc>,
        deliver_at: DateTime<Utc>,
    ) -> Self {
        Self {
            action_id: Uuid::new_v4(),
            rule_id: rule.id.clone(),
            beacon_id: trigger.beacon_id.clone(),
            trigger_kind: trigger.kind,
            scheduled_at,
            deliver_at,
            location: trigger.location.clone(),
            kind: rule.kind,
            context: rule.content.clone(),
        }
    }
}

/// Broadcast once per delivered match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionFired {
    /// The delivered firing.
    pub record: FiringRecord,
}
