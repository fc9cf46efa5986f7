//! Rule matching.
//!
//! Matching is a pure function of the event, the active snapshot and a clock
//! reading. It never touches the ledger; admission is decided afterwards.

use chrono::{DateTime, Utc};

use crate::beacon::ProximityEvent;
use crate::layout::{LayoutSnapshot, TriggerRule};

/// Rules of `snapshot` that `event` fires at `now`, in declaration order.
///
/// A rule matches when it lists the event's beacon, its trigger kind accepts
/// the transition, and `now` is inside one of its timeframes (or it has none).
/// Range updates never match.
pub fn match_event<'a>(
    event: &'a ProximityEvent,
    snapshot: &'a LayoutSnapshot,
    now: DateTime<Utc>,
) -> impl Iterator<Item = &'a TriggerRule> + 'a {
    snapshot.rules.iter().filter(move |rule| {
        rule.trigger_kind.matches(event.kind)
            && rule.listens_to(&event.beacon_id)
            && rule.is_active_at(now)
    })
}

/// Instant rules of `snapshot` active at `now`, in declaration order.
pub fn match_instant(
    snapshot: &LayoutSnapshot,
    now: DateTime<Utc>,
) -> impl Iterator<Item = &TriggerRule> + '_ {
    snapshot
        .instant_rules
        .iter()
        .filter(move |rule| rule.is_active_at(now))
}
