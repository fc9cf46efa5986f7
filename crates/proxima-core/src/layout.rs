//! Campaign layout model.
//!
//! A [`LayoutSnapshot`] is the complete rule set issued by the resolver: the
//! beacon groups to monitor, the trigger rules bound to beacons, and the
//! instant rules evaluated right after a fetch. Field names on the wire follow
//! the resolver's JSON (`eid`, `beacons`, `suppressionTime`, ...).

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::beacon::{BeaconId, ProximityKind};
use crate::error::{ProximaError, Result};

/// Upper bound for a rule's `delay` and `suppressionTime`: one hundred years.
pub const MAX_RULE_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// Which transitions fire a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TriggerKind {
    /// Region entry (wire value 1).
    #[default]
    OnEnter,
    /// Region exit (wire value 2).
    OnExit,
    /// Either transition (wire value 3).
    OnEnterOrExit,
}

impl TriggerKind {
    /// Returns `true` if a transition of `kind` fires this trigger.
    #[must_use]
    pub const fn matches(self, kind: ProximityKind) -> bool {
        matches!(
            (self, kind),
            (Self::OnEnter | Self::OnEnterOrExit, ProximityKind::Enter)
                | (Self::OnExit | Self::OnEnterOrExit, ProximityKind::Exit)
        )
    }

    /// The trigger that describes an observed transition.
    #[must_use]
    pub const fn observed(kind: ProximityKind) -> Option<Self> {
        match kind {
            ProximityKind::Enter => Some(Self::OnEnter),
            ProximityKind::Exit => Some(Self::OnExit),
            ProximityKind::RangeUpdate => None,
        }
    }
}

impl TryFrom<u8> for TriggerKind {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::OnEnter),
            2 => Ok(Self::OnExit),
            3 => Ok(Self::OnEnterOrExit),
            other => Err(format!("unknown trigger {other}, expected 1, 2 or 3")),
        }
    }
}

impl From<TriggerKind> for u8 {
    fn from(kind: TriggerKind) -> Self {
        match kind {
            TriggerKind::OnEnter => 1,
            TriggerKind::OnExit => 2,
            TriggerKind::OnEnterOrExit => 3,
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnEnter => write!(f, "enter"),
            Self::OnExit => write!(f, "exit"),
            Self::OnEnterOrExit => write!(f, "enter_or_exit"),
        }
    }
}

/// Campaign type tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ActionKind {
    /// Local notification (wire value 1).
    #[default]
    Notification,
    /// Website to open (wire value 2).
    Website,
    /// In-app message (wire value 3).
    InApp,
    /// Any other tag, carried through unchanged.
    Other(u8),
}

impl From<u8> for ActionKind {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Notification,
            2 => Self::Website,
            3 => Self::InApp,
            other => Self::Other(other),
        }
    }
}

impl From<ActionKind> for u8 {
    fn from(kind: ActionKind) -> Self {
        match kind {
            ActionKind::Notification => 1,
            ActionKind::Website => 2,
            ActionKind::InApp => 3,
            ActionKind::Other(other) => other,
        }
    }
}

/// A half-open activity window `[start, end)`; a missing side is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    /// Inclusive start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,

    /// Exclusive end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl Timeframe {
    /// Window with both bounds.
    #[must_use]
    pub const fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// Returns `true` if `at` falls inside the window.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| at >= start) && self.end.map_or(true, |end| at < end)
    }
}

/// Returns `true` if `timeframes` is empty or any of them contains `at`.
#[must_use]
pub fn is_active(timeframes: &[Timeframe], at: DateTime<Utc>) -> bool {
    timeframes.is_empty() || timeframes.iter().any(|frame| frame.contains(at))
}

/// What a fired rule presents to the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    /// Notification title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Notification text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    /// Link opened by the action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Opaque operator payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Any further keys, kept as received.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One campaign rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRule {
    /// Rule identifier, unique within a layout.
    #[serde(rename = "eid")]
    pub id: String,

    /// Transitions that fire the rule.
    #[serde(rename = "trigger", default)]
    pub trigger_kind: TriggerKind,

    /// Beacons the rule listens to.
    #[serde(rename = "beacons", default)]
    pub beacon_ids: BTreeSet<BeaconId>,

    /// Minimum gap between two firings for the same key; 0 disables.
    #[serde(rename = "suppressionTime", default)]
    pub suppression_seconds: u64,

    /// Delay between the event and delivery.
    #[serde(rename = "delay", default)]
    pub delay_seconds: u64,

    /// Fire at most once, ever.
    #[serde(default)]
    pub send_only_once: bool,

    /// Flush reports right after this rule fires.
    #[serde(default)]
    pub report_immediately: bool,

    /// Activity windows; empty means always active.
    #[serde(default)]
    pub timeframes: Vec<Timeframe>,

    /// Presentation content.
    #[serde(default)]
    pub content: Content,

    /// Campaign type tag.
    #[serde(rename = "type", default)]
    pub kind: ActionKind,

    /// Free-form type label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_string: Option<String>,

    /// Absolute delivery time, overriding `delay` when it lies ahead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_at: Option<DateTime<Utc>>,
}

impl TriggerRule {
    /// Rule with no delay, suppression or timeframes.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        trigger_kind: TriggerKind,
        beacon_ids: impl IntoIterator<Item = BeaconId>,
    ) -> Self {
        Self {
            id: id.into(),
            trigger_kind,
            beacon_ids: beacon_ids.into_iter().collect(),
            suppression_seconds: 0,
            delay_seconds: 0,
            send_only_once: false,
            report_immediately: false,
            timeframes: Vec::new(),
            content: Content::default(),
            kind: ActionKind::default(),
            type_string: None,
            deliver_at: None,
        }
    }

    /// Returns `true` if the rule is inside one of its timeframes at `at`.
    #[must_use]
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        is_active(&self.timeframes, at)
    }

    /// Returns `true` if the rule lists `beacon`.
    #[must_use]
    pub fn listens_to(&self, beacon: &BeaconId) -> bool {
        self.beacon_ids.contains(beacon)
    }

    /// Delay between an event observed at `observed_at` and delivery.
    #[must_use]
    pub fn delivery_delay(&self, observed_at: DateTime<Utc>) -> Duration {
        match self.deliver_at {
            Some(deliver_at) if deliver_at > observed_at => {
                (deliver_at - observed_at).to_std().unwrap_or_default()
            }
            _ => Duration::from_secs(self.delay_seconds),
        }
    }

    fn validate_common(&self) -> std::result::Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("rule with an empty eid".to_string());
        }
        for (field, secs) in [
            ("delay", self.delay_seconds),
            ("suppressionTime", self.suppression_seconds),
        ] {
            if secs > MAX_RULE_SECONDS {
                return Err(format!(
                    "rule '{}' has {field} {secs}s, above the {MAX_RULE_SECONDS}s limit",
                    self.id
                ));
            }
        }
        for frame in &self.timeframes {
            if let (Some(start), Some(end)) = (frame.start, frame.end) {
                if start >= end {
                    return Err(format!(
                        "rule '{}' has a timeframe ending before it starts",
                        self.id
                    ));
                }
            }
        }
        Ok(())
    }
}

/// The resolver-issued rule set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutSnapshot {
    /// Proximity UUIDs (32 hex digits) to hand to region monitoring.
    #[serde(rename = "accountProximityUUIDs", default)]
    pub monitored_beacon_groups: Vec<String>,

    /// Beacon-bound rules, in declaration order.
    #[serde(rename = "actions", default)]
    pub rules: Vec<TriggerRule>,

    /// Rules evaluated once per successful fetch, without a beacon.
    #[serde(rename = "instantActions", default)]
    pub instant_rules: Vec<TriggerRule>,

    /// Opaque version marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Resolver-suggested report flush interval in seconds.
    #[serde(rename = "reportTrigger", default, skip_serializing_if = "Option::is_none")]
    pub report_trigger_secs: Option<u64>,
}

impl LayoutSnapshot {
    /// Check the rule invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::InvalidLayout`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for rule in self.rules.iter().chain(&self.instant_rules) {
            rule.validate_common().map_err(ProximaError::InvalidLayout)?;
            if !seen.insert(rule.id.as_str()) {
                return Err(ProximaError::InvalidLayout(format!(
                    "duplicate rule id '{}'",
                    rule.id
                )));
            }
        }
        if let Some(rule) = self.rules.iter().find(|rule| rule.beacon_ids.is_empty()) {
            return Err(ProximaError::InvalidLayout(format!(
                "rule '{}' lists no beacons",
                rule.id
            )));
        }
        if let Some(group) = self
            .monitored_beacon_groups
            .iter()
            .find(|group| Uuid::try_parse(group).is_err())
        {
            return Err(ProximaError::InvalidLayout(format!(
                "'{group}' is not a proximity UUID"
            )));
        }
        Ok(())
    }

    /// Look up a rule or instant rule by id.
    #[must_use]
    pub fn find_rule(&self, id: &str) -> Option<&TriggerRule> {
        self.rules
            .iter()
            .chain(&self.instant_rules)
            .find(|rule| rule.id == id)
    }

    /// Flush interval requested by the resolver.
    #[must_use]
    pub fn report_interval(&self) -> Option<Duration> {
        self.report_trigger_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio_test::{assert_err, assert_ok};

    fn beacon(minor: u16) -> BeaconId {
        BeaconId::from_parts(Uuid::nil(), 1, minor)
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_trigger_kind_matching() {
        assert!(TriggerKind::OnEnter.matches(ProximityKind::Enter));
        assert!(!TriggerKind::OnEnter.matches(ProximityKind::Exit));
        assert!(TriggerKind::OnExit.matches(ProximityKind::Exit));
        assert!(TriggerKind::OnEnterOrExit.matches(ProximityKind::Enter));
        assert!(TriggerKind::OnEnterOrExit.matches(ProximityKind::Exit));
        assert!(!TriggerKind::OnEnterOrExit.matches(ProximityKind::RangeUpdate));
    }

    #[test]
    fn test_trigger_kind_wire_values() {
        assert_eq!(TriggerKind::try_from(3_u8).unwrap(), TriggerKind::OnEnterOrExit);
        assert!(TriggerKind::try_from(4_u8).is_err());
        assert_eq!(u8::from(TriggerKind::OnExit), 2);
        assert!(serde_json::from_str::<TriggerKind>("9").is_err());
    }

    #[test]
    fn test_action_kind_keeps_unknown_tags() {
        let kind: ActionKind = serde_json::from_str("42").unwrap();
        assert_eq!(kind, ActionKind::Other(42));
        assert_eq!(serde_json::to_string(&kind).unwrap(), "42");
    }

    #[test]
    fn test_timeframe_is_half_open() {
        let frame = Timeframe::between(at(9), at(17));
        assert!(frame.contains(at(9)));
        assert!(frame.contains(at(16)));
        assert!(!frame.contains(at(17)));
        assert!(!frame.contains(at(8)));

        let open_start = Timeframe {
            start: None,
            end: Some(at(12)),
        };
        assert!(open_start.contains(at(0)));
        assert!(!open_start.contains(at(12)));
    }

    #[test]
    fn test_empty_timeframes_always_active() {
        assert!(is_active(&[], at(3)));
        assert!(!is_active(&[Timeframe::between(at(9), at(10))], at(3)));
    }

    #[test]
    fn test_delivery_delay_prefers_future_deliver_at() {
        let mut rule = TriggerRule::new("r1", TriggerKind::OnEnter, [beacon(1)]);
        rule.delay_seconds = 30;
        assert_eq!(rule.delivery_delay(at(9)), Duration::from_secs(30));

        rule.deliver_at = Some(at(10));
        assert_eq!(rule.delivery_delay(at(9)), Duration::from_secs(3600));

        // A deliverAt in the past falls back to the relative delay.
        assert_eq!(rule.delivery_delay(at(11)), Duration::from_secs(30));
    }

    #[test]
    fn test_layout_wire_format() {
        let json = r#"{
            "accountProximityUUIDs": ["7367672374000000ffff0000ffff0003"],
            "reportTrigger": 120,
            "actions": [{
                "eid": "welcome",
                "trigger": 3,
                "beacons": ["7367672374000000ffff0000ffff00030000100042"],
                "suppressionTime": 60,
                "delay": 5,
                "sendOnlyOnce": true,
                "reportImmediately": true,
                "type": 1,
                "typeString": "notification",
                "timeframes": [{"start": "2026-03-01T09:00:00Z"}],
                "content": {"subject": "Hi", "body": "Welcome", "payload": {"coupon": 7}, "badge": 1}
            }],
            "instantActions": []
        }"#;

        let layout: LayoutSnapshot = serde_json::from_str(json).unwrap();
        layout.validate().unwrap();

        let rule = &layout.rules[0];
        assert_eq!(rule.id, "welcome");
        assert_eq!(rule.trigger_kind, TriggerKind::OnEnterOrExit);
        assert_eq!(rule.suppression_seconds, 60);
        assert_eq!(rule.delay_seconds, 5);
        assert!(rule.send_only_once);
        assert_eq!(rule.content.extra.get("badge"), Some(&Value::from(1)));
        assert_eq!(layout.report_interval(), Some(Duration::from_secs(120)));

        let reencoded = serde_json::to_value(&layout).unwrap();
        assert_eq!(reencoded["actions"][0]["content"]["badge"], 1);
        assert_eq!(reencoded["actions"][0]["eid"], "welcome");
    }

    #[test]
    fn test_validate_rejects_rule_without_beacons() {
        let layout = LayoutSnapshot {
            rules: vec![TriggerRule::new("empty", TriggerKind::OnEnter, Vec::<BeaconId>::new())],
            ..LayoutSnapshot::default()
        };
        assert!(matches!(
            layout.validate(),
            Err(ProximaError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_validate_allows_instant_rule_without_beacons() {
        let layout = LayoutSnapshot {
            instant_rules: vec![TriggerRule::new("launch", TriggerKind::OnEnter, Vec::<BeaconId>::new())],
            ..LayoutSnapshot::default()
        };
        assert_ok!(layout.validate());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let layout = LayoutSnapshot {
            rules: vec![
                TriggerRule::new("dup", TriggerKind::OnEnter, [beacon(1)]),
                TriggerRule::new("dup", TriggerKind::OnExit, [beacon(2)]),
            ],
            ..LayoutSnapshot::default()
        };
        assert_err!(layout.validate());
    }

    #[test]
    fn test_validate_rejects_inverted_timeframe() {
        let mut rule = TriggerRule::new("r", TriggerKind::OnEnter, [beacon(1)]);
        rule.timeframes.push(Timeframe::between(at(10), at(9)));
        let layout = LayoutSnapshot {
            rules: vec![rule],
            ..LayoutSnapshot::default()
        };
        assert_err!(layout.validate());
    }

    #[test]
    fn test_validate_bounds_delay_and_suppression() {
        let mut rule = TriggerRule::new("far", TriggerKind::OnEnter, [beacon(1)]);
        rule.delay_seconds = MAX_RULE_SECONDS;
        rule.suppression_seconds = MAX_RULE_SECONDS;
        let mut layout = LayoutSnapshot {
            rules: vec![rule],
            ..LayoutSnapshot::default()
        };
        assert_ok!(layout.validate());

        layout.rules[0].delay_seconds = 10_000_000_000_000;
        assert_err!(layout.validate());

        layout.rules[0].delay_seconds = 0;
        layout.rules[0].suppression_seconds = 10_000_000_000_000_000;
        assert_err!(layout.validate());
    }

    #[test]
    fn test_validate_rejects_bad_group() {
        let layout = LayoutSnapshot {
            monitored_beacon_groups: vec!["lobby".into()],
            ..LayoutSnapshot::default()
        };
        assert_err!(layout.validate());
    }

    #[test]
    fn test_find_rule() {
        let layout = LayoutSnapshot {
            rules: vec![TriggerRule::new("a", TriggerKind::OnEnter, [beacon(1)])],
            instant_rules: vec![TriggerRule::new("b", TriggerKind::OnEnter, Vec::<BeaconId>::new())],
            ..LayoutSnapshot::default()
        };
        assert!(layout.find_rule("a").is_some());
        assert!(layout.find_rule("b").is_some());
        assert!(layout.find_rule("c").is_none());
    }
}
