//! Suppression and once-only ledger.
//!
//! The ledger remembers when each `(rule, beacon)` key last fired and which
//! once-only rules have ever fired. Every admission is persisted before it
//! counts: if the write fails, the admission is rolled back. Admissions are
//! written one at a time, so no other admission ever sees or persists a
//! record whose write has not succeeded.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::beacon::BeaconId;
use crate::error::{ProximaError, Result};
use crate::layout::TriggerRule;
use crate::lock;
use crate::storage::{load_json, save_json, Storage, LEDGER_KEY};

/// Granularity of `sendOnlyOnce`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnceScope {
    /// A once-only rule fires once in total, whichever beacon triggers it.
    Rule,
    /// A once-only rule fires once per beacon.
    #[default]
    RuleAndBeacon,
}

/// Ledger key: a rule and the beacon that triggered it (none for instant rules).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    /// Rule id.
    pub rule_id: String,
    /// Triggering beacon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beacon_id: Option<BeaconId>,
}

impl LedgerKey {
    /// Build a key.
    #[must_use]
    pub fn new(rule_id: impl Into<String>, beacon_id: Option<&BeaconId>) -> Self {
        Self {
            rule_id: rule_id.into(),
            beacon_id: beacon_id.cloned(),
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.beacon_id {
            Some(beacon) => write!(f, "{}@{beacon}", self.rule_id),
            None => write!(f, "{}", self.rule_id),
        }
    }
}

/// Outcome of [`Ledger::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The firing was recorded and may proceed.
    Admitted,
    /// A once-only rule already fired for this scope.
    AlreadyFired,
    /// The key fired less than `suppressionTime` ago.
    Suppressed {
        /// Seconds until the key may fire again.
        remaining_secs: i64,
    },
}

impl Admission {
    /// Returns `true` if the firing may proceed.
    #[must_use]
    pub const fn is_admitted(self) -> bool {
        matches!(self, Self::Admitted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LedgerEntry {
    #[serde(flatten)]
    key: LedgerKey,
    last_fired_at: DateTime<Utc>,
    #[serde(default)]
    ever_fired: bool,
}

/// On-disk form of the ledger.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedLedger {
    entries: Vec<LedgerEntry>,
}

#[derive(Debug, Default)]
struct LedgerTable {
    entries: HashMap<LedgerKey, LedgerEntry>,
    // Rules with at least one once-only firing, for `OnceScope::Rule`.
    fired_rules: HashSet<String>,
}

impl LedgerTable {
    fn from_persisted(persisted: PersistedLedger) -> Self {
        let mut table = Self::default();
        for entry in persisted.entries {
            if entry.ever_fired {
                table.fired_rules.insert(entry.key.rule_id.clone());
            }
            table.entries.insert(entry.key.clone(), entry);
        }
        table
    }

    fn to_persisted(&self) -> PersistedLedger {
        let mut entries: Vec<LedgerEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        PersistedLedger { entries }
    }

    fn has_fired(&self, key: &LedgerKey, scope: OnceScope) -> bool {
        match scope {
            OnceScope::Rule => self.fired_rules.contains(&key.rule_id),
            OnceScope::RuleAndBeacon => self.entries.get(key).is_some_and(|e| e.ever_fired),
        }
    }

    /// Record a firing and return the entry it replaced.
    fn record(&mut self, key: LedgerKey, at: DateTime<Utc>, once: bool) -> Option<LedgerEntry> {
        let ever_fired = once || self.entries.get(&key).is_some_and(|e| e.ever_fired);
        if ever_fired {
            self.fired_rules.insert(key.rule_id.clone());
        }
        self.entries.insert(
            key.clone(),
            LedgerEntry {
                key,
                last_fired_at: at,
                ever_fired,
            },
        )
    }

    fn restore(&mut self, key: &LedgerKey, previous: Option<LedgerEntry>) {
        match previous {
            Some(entry) => {
                self.entries.insert(key.clone(), entry);
            }
            None => {
                self.entries.remove(key);
            }
        }
        let still_fired = self
            .entries
            .values()
            .any(|e| e.ever_fired && e.key.rule_id == key.rule_id);
        if !still_fired {
            self.fired_rules.remove(&key.rule_id);
        }
    }
}

/// Persistent suppression and once-only ledger.
pub struct Ledger {
    table: Mutex<LedgerTable>,
    // Held from check to durable write; always taken before `table`.
    persist_lock: Mutex<()>,
    storage: Arc<dyn Storage>,
    scope: OnceScope,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("scope", &self.scope)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Load the ledger from storage, starting empty if nothing was persisted.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::StorageReadFailed`] if a persisted ledger exists
    /// but cannot be read. Forgetting it would re-fire once-only rules.
    pub fn load(storage: Arc<dyn Storage>, scope: OnceScope) -> Result<Self> {
        let persisted: PersistedLedger = load_json(storage.as_ref(), LEDGER_KEY)?.unwrap_or_default();
        let table = LedgerTable::from_persisted(persisted);
        debug!(entries = table.entries.len(), ?scope, "Ledger loaded");

        Ok(Self {
            table: Mutex::new(table),
            persist_lock: Mutex::new(()),
            storage,
            scope,
        })
    }

    /// Decide whether `rule` may fire for `beacon` at `now`, and record it if so.
    ///
    /// The check, the record and the write happen under the writer lock. A
    /// failed write undoes the record before any other admission can look.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::StorageWriteFailed`] if the admission could not
    /// be persisted. The firing must not proceed.
    pub fn admit(
        &self,
        rule: &TriggerRule,
        beacon: Option<&BeaconId>,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        let key = LedgerKey::new(&rule.id, beacon);
        let _writer = lock(&self.persist_lock);

        let (previous, snapshot) = {
            let mut table = lock(&self.table);

            if rule.send_only_once && table.has_fired(&key, self.scope) {
                debug!(key = %key, "Once-only rule already fired");
                return Ok(Admission::AlreadyFired);
            }

            let remaining = table.entries.get(&key).and_then(|entry| {
                suppression_remaining(rule.suppression_seconds, entry.last_fired_at, now)
            });
            if let Some(remaining_secs) = remaining {
                debug!(key = %key, remaining_secs, "Firing suppressed");
                return Ok(Admission::Suppressed { remaining_secs });
            }

            let previous = table.record(key.clone(), now, rule.send_only_once);
            (previous, table.to_persisted())
        };

        if let Err(err) = self.write(&snapshot) {
            warn!(key = %key, error = %err, "Rolling back admission: ledger not persisted");
            lock(&self.table).restore(&key, previous);
            return Err(err);
        }
        Ok(Admission::Admitted)
    }

    /// Forget every firing.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::StorageWriteFailed`] if the empty ledger could not be persisted.
    pub fn clear(&self) -> Result<()> {
        let _writer = lock(&self.persist_lock);
        let snapshot = {
            let mut table = lock(&self.table);
            table.entries.clear();
            table.fired_rules.clear();
            table.to_persisted()
        };
        self.write(&snapshot)
    }

    /// When `key` last fired.
    #[must_use]
    pub fn last_fired(&self, key: &LedgerKey) -> Option<DateTime<Utc>> {
        lock(&self.table).entries.get(key).map(|e| e.last_fired_at)
    }

    /// Returns `true` if a once-only firing is recorded for `key` under the configured scope.
    #[must_use]
    pub fn has_fired(&self, key: &LedgerKey) -> bool {
        lock(&self.table).has_fired(key, self.scope)
    }

    /// Number of keys with a recorded firing.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    /// Returns `true` if nothing has fired.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.table).entries.is_empty()
    }

    /// Configured once-only scope.
    #[must_use]
    pub const fn scope(&self) -> OnceScope {
        self.scope
    }

    fn write(&self, snapshot: &PersistedLedger) -> Result<()> {
        save_json(self.storage.as_ref(), LEDGER_KEY, snapshot).map_err(|err| {
            ProximaError::StorageWriteFailed {
                key: LEDGER_KEY.to_string(),
                message: err.to_string(),
            }
        })
    }
}

/// Seconds left in the suppression window of a key last fired at `last_fired_at`.
///
/// A window too long to represent never closes.
fn suppression_remaining(
    suppression_seconds: u64,
    last_fired_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<i64> {
    if suppression_seconds == 0 {
        return None;
    }
    let Some(window) = i64::try_from(suppression_seconds)
        .ok()
        .and_then(Duration::try_seconds)
    else {
        return Some(i64::MAX);
    };
    let elapsed = now - last_fired_at;
    if elapsed >= window {
        return None;
    }
    Some(window.checked_sub(&elapsed).map_or(i64::MAX, |left| left.num_seconds()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TriggerKind;
    use crate::storage::{MemoryStorage, StorageError, StorageResult};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use tokio_test::assert_err;
    use uuid::Uuid;

    #[derive(Debug, Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_writes: AtomicBool,
    }

    impl Storage for FlakyStorage {
        fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
            self.inner.load(key)
        }

        fn save(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::Write {
                    key: key.to_string(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.save(key, bytes)
        }

        fn remove(&self, key: &str) -> StorageResult<()> {
            self.inner.remove(key)
        }
    }

    /// Storage whose next write waits for a verdict from the test.
    #[derive(Debug)]
    struct GatedStorage {
        inner: MemoryStorage,
        gated: AtomicBool,
        entered: Mutex<mpsc::Sender<()>>,
        verdict: Mutex<mpsc::Receiver<bool>>,
    }

    impl Storage for GatedStorage {
        fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
            self.inner.load(key)
        }

        fn save(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
            if self.gated.swap(false, Ordering::SeqCst) {
                self.entered.lock().unwrap().send(()).unwrap();
                let fail = self.verdict.lock().unwrap().recv().unwrap();
                if fail {
                    return Err(StorageError::Write {
                        key: key.to_string(),
                        source: std::io::Error::other("device removed"),
                    });
                }
            }
            self.inner.save(key, bytes)
        }

        fn remove(&self, key: &str) -> StorageResult<()> {
            self.inner.remove(key)
        }
    }

    fn beacon(minor: u16) -> BeaconId {
        BeaconId::from_parts(Uuid::nil(), 1, minor)
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn rule(id: &str) -> TriggerRule {
        TriggerRule::new(id, TriggerKind::OnEnter, [beacon(1), beacon(2)])
    }

    fn ledger(scope: OnceScope) -> Ledger {
        Ledger::load(Arc::new(MemoryStorage::new()), scope).unwrap()
    }

    #[test]
    fn test_admits_rule_without_gates() {
        let ledger = ledger(OnceScope::RuleAndBeacon);
        let rule = rule("plain");
        assert!(ledger.admit(&rule, Some(&beacon(1)), t(0)).unwrap().is_admitted());
        assert!(ledger.admit(&rule, Some(&beacon(1)), t(0)).unwrap().is_admitted());
        assert_eq!(ledger.last_fired(&LedgerKey::new("plain", Some(&beacon(1)))), Some(t(0)));
    }

    #[test]
    fn test_suppression_window() {
        let ledger = ledger(OnceScope::RuleAndBeacon);
        let mut rule = rule("s");
        rule.suppression_seconds = 60;

        assert!(ledger.admit(&rule, Some(&beacon(1)), t(0)).unwrap().is_admitted());
        assert_eq!(
            ledger.admit(&rule, Some(&beacon(1)), t(30)).unwrap(),
            Admission::Suppressed { remaining_secs: 30 }
        );
        // The suppressed event does not move the window.
        assert!(ledger.admit(&rule, Some(&beacon(1)), t(60)).unwrap().is_admitted());
    }

    #[test]
    fn test_suppression_is_per_beacon() {
        let ledger = ledger(OnceScope::RuleAndBeacon);
        let mut rule = rule("s");
        rule.suppression_seconds = 60;

        assert!(ledger.admit(&rule, Some(&beacon(1)), t(0)).unwrap().is_admitted());
        assert!(ledger.admit(&rule, Some(&beacon(2)), t(1)).unwrap().is_admitted());
    }

    #[test]
    fn test_once_per_rule_and_beacon() {
        let ledger = ledger(OnceScope::RuleAndBeacon);
        let mut rule = rule("once");
        rule.send_only_once = true;

        assert!(ledger.admit(&rule, Some(&beacon(1)), t(0)).unwrap().is_admitted());
        assert_eq!(
            ledger.admit(&rule, Some(&beacon(1)), t(999)).unwrap(),
            Admission::AlreadyFired
        );
        assert!(ledger.admit(&rule, Some(&beacon(2)), t(999)).unwrap().is_admitted());
    }

    #[test]
    fn test_once_per_rule() {
        let ledger = ledger(OnceScope::Rule);
        let mut rule = rule("once");
        rule.send_only_once = true;

        assert!(ledger.admit(&rule, Some(&beacon(1)), t(0)).unwrap().is_admitted());
        assert_eq!(
            ledger.admit(&rule, Some(&beacon(2)), t(5)).unwrap(),
            Admission::AlreadyFired
        );
    }

    #[test]
    fn test_once_survives_reload() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut rule = rule("once");
        rule.send_only_once = true;

        let first = Ledger::load(Arc::clone(&storage), OnceScope::RuleAndBeacon).unwrap();
        assert!(first.admit(&rule, Some(&beacon(1)), t(0)).unwrap().is_admitted());
        drop(first);

        let second = Ledger::load(storage, OnceScope::RuleAndBeacon).unwrap();
        assert_eq!(
            second.admit(&rule, Some(&beacon(1)), t(10)).unwrap(),
            Admission::AlreadyFired
        );
    }

    #[test]
    fn test_failed_persist_rolls_back() {
        let storage = Arc::new(FlakyStorage::default());
        let ledger = Ledger::load(storage.clone(), OnceScope::RuleAndBeacon).unwrap();
        let mut rule = rule("once");
        rule.send_only_once = true;

        storage.fail_writes.store(true, Ordering::SeqCst);
        let err = ledger.admit(&rule, Some(&beacon(1)), t(0)).unwrap_err();
        assert!(matches!(err, ProximaError::StorageWriteFailed { .. }));
        assert!(ledger.is_empty());
        assert!(!ledger.has_fired(&LedgerKey::new("once", Some(&beacon(1)))));

        storage.fail_writes.store(false, Ordering::SeqCst);
        assert!(ledger.admit(&rule, Some(&beacon(1)), t(1)).unwrap().is_admitted());
    }

    #[test]
    fn test_rollback_keeps_previous_entry() {
        let storage = Arc::new(FlakyStorage::default());
        let ledger = Ledger::load(storage.clone(), OnceScope::RuleAndBeacon).unwrap();
        let rule = rule("plain");
        let key = LedgerKey::new("plain", Some(&beacon(1)));

        ledger.admit(&rule, Some(&beacon(1)), t(0)).unwrap();
        storage.fail_writes.store(true, Ordering::SeqCst);
        assert_err!(ledger.admit(&rule, Some(&beacon(1)), t(50)));
        assert_eq!(ledger.last_fired(&key), Some(t(0)));
    }

    #[test]
    fn test_unwritten_once_record_does_not_block_other_beacons() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (verdict_tx, verdict_rx) = mpsc::channel();
        let storage = Arc::new(GatedStorage {
            inner: MemoryStorage::new(),
            gated: AtomicBool::new(true),
            entered: Mutex::new(entered_tx),
            verdict: Mutex::new(verdict_rx),
        });
        let ledger = Arc::new(Ledger::load(storage.clone(), OnceScope::Rule).unwrap());
        let mut once = rule("once");
        once.send_only_once = true;

        let first = {
            let (ledger, once) = (Arc::clone(&ledger), once.clone());
            thread::spawn(move || ledger.admit(&once, Some(&beacon(1)), t(0)))
        };
        entered_rx.recv().unwrap();

        let second = {
            let (ledger, once) = (Arc::clone(&ledger), once.clone());
            thread::spawn(move || ledger.admit(&once, Some(&beacon(2)), t(1)))
        };
        thread::sleep(std::time::Duration::from_millis(50));
        verdict_tx.send(true).unwrap();

        assert_err!(first.join().unwrap());
        assert_eq!(second.join().unwrap().unwrap(), Admission::Admitted);

        let reloaded = Ledger::load(storage, OnceScope::Rule).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.last_fired(&LedgerKey::new("once", Some(&beacon(2)))), Some(t(1)));
        assert_eq!(reloaded.last_fired(&LedgerKey::new("once", Some(&beacon(1)))), None);
    }

    #[test]
    fn test_unrepresentable_suppression_never_expires() {
        let ledger = ledger(OnceScope::RuleAndBeacon);
        let mut rule = rule("forever");
        rule.suppression_seconds = 10_000_000_000_000_000;

        assert!(ledger.admit(&rule, Some(&beacon(1)), t(0)).unwrap().is_admitted());
        assert_eq!(
            ledger.admit(&rule, Some(&beacon(1)), t(1)).unwrap(),
            Admission::Suppressed { remaining_secs: i64::MAX }
        );
    }

    #[test]
    fn test_suppression_before_last_firing() {
        let ledger = ledger(OnceScope::RuleAndBeacon);
        let mut rule = rule("s");
        rule.suppression_seconds = 60;

        ledger.admit(&rule, Some(&beacon(1)), t(100)).unwrap();
        assert_eq!(
            ledger.admit(&rule, Some(&beacon(1)), t(40)).unwrap(),
            Admission::Suppressed { remaining_secs: 120 }
        );
    }

    #[test]
    fn test_clear_forgets_everything() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let ledger = Ledger::load(Arc::clone(&storage), OnceScope::Rule).unwrap();
        let mut rule = rule("once");
        rule.send_only_once = true;

        ledger.admit(&rule, Some(&beacon(1)), t(0)).unwrap();
        ledger.clear().unwrap();
        assert!(ledger.is_empty());

        let reloaded = Ledger::load(storage, OnceScope::Rule).unwrap();
        assert!(reloaded.admit(&rule, Some(&beacon(2)), t(1)).unwrap().is_admitted());
    }

    #[test]
    fn test_instant_rules_use_beaconless_key() {
        let ledger = ledger(OnceScope::RuleAndBeacon);
        let mut rule = TriggerRule::new("launch", TriggerKind::OnEnter, Vec::new());
        rule.send_only_once = true;

        assert!(ledger.admit(&rule, None, t(0)).unwrap().is_admitted());
        assert_eq!(ledger.admit(&rule, None, t(1)).unwrap(), Admission::AlreadyFired);
    }

    #[test]
    fn test_corrupt_ledger_is_read_error() {
        let storage = Arc::new(MemoryStorage::new());
        storage.save(LEDGER_KEY, b"garbage").unwrap();
        let err = Ledger::load(storage, OnceScope::Rule).unwrap_err();
        assert!(matches!(err, ProximaError::StorageReadFailed { .. }));
    }
}
