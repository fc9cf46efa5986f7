//! The action resolution engine.
//!
//! [`Engine`] wires the layout store, matcher, ledger, scheduler and report
//! queue together and is the only type a host needs to drive. It is built once
//! per process and shared behind an `Arc`.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = Arc::new(Engine::new(config, storage, resolver, platform)?);
//! let background = engine.spawn_background();
//!
//! engine.request_layout().await?;
//! engine.handle_proximity(ProximityEvent::enter(beacon, Utc::now())).await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::beacon::ProximityEvent;
use crate::config::{Config, ResetPolicy};
use crate::error::{ProximaError, Result};
use crate::events::{ActionFired, Trigger};
use crate::layout::{LayoutSnapshot, TriggerRule};
use crate::layout_store::{FetchOutcome, LayoutSource, LayoutStore};
use crate::ledger::{Admission, Ledger, LedgerKey};
use crate::lock;
use crate::matcher;
use crate::platform::{AvailabilityStatus, BluetoothStatus, LocationAuthorization, PlatformMonitor};
use crate::reports::{FlushOutcome, ReportBatch, ReportQueue, ReportQueueStats};
use crate::resolver::Resolver;
use crate::scheduler::{DeliveryScheduler, ScheduleOutcome};
use crate::storage::Storage;

/// Capacity of the [`ActionFired`] broadcast channel.
pub const ACTION_CHANNEL_CAPACITY: usize = 256;

/// What happened to one proximity event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOutcome {
    /// Rules that matched.
    pub matched: usize,
    /// Action ids delivered synchronously.
    pub delivered: Vec<Uuid>,
    /// Deliveries armed on a timer.
    pub scheduled: usize,
    /// Matches refused by suppression or once-only.
    pub suppressed: usize,
}

/// What [`Engine::reset`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetSummary {
    /// Pending deliveries aborted.
    pub cancelled_deliveries: usize,
    /// Reports uploaded by the final flush.
    pub flushed_records: usize,
    /// Reports dropped without upload.
    pub discarded_records: usize,
    /// Reports still queued because the final flush failed.
    pub retained_records: usize,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Overall availability.
    pub availability: AvailabilityStatus,
    /// Last reported location permission.
    pub authorization: LocationAuthorization,
    /// Last reported Bluetooth radio state.
    pub bluetooth: BluetoothStatus,
    /// Version of the active layout.
    pub layout_version: Option<String>,
    /// Beacon-bound rules in the active layout.
    pub rules: usize,
    /// Instant rules in the active layout.
    pub instant_rules: usize,
    /// Groups of the active layout.
    pub monitored_groups: Vec<String>,
    /// Armed delivery timers.
    pub pending_deliveries: usize,
    /// Keys with a recorded firing.
    pub ledger_entries: usize,
    /// Fetches that fell back to the cache.
    pub degraded_fetches: u64,
    /// Last measured resolver round trip.
    pub resolver_latency_ms: Option<u64>,
    /// Report queue counters.
    pub reports: ReportQueueStats,
}

/// Per-key async locks serializing admission and scheduling.
///
/// An entry lives only while some task holds or waits for its lock.
#[derive(Debug, Default)]
struct KeyLocks {
    locks: Mutex<HashMap<LedgerKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, key: &LedgerKey) -> KeyGuard<'_> {
        let mutex = Arc::clone(lock(&self.locks).entry(key.clone()).or_default());
        KeyGuard {
            locks: self,
            key: key.clone(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.locks).len()
    }
}

struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: LedgerKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut locks = lock(&self.locks.locks);
        drop(self.guard.take());
        // Only the map still refers to the mutex: nobody holds or awaits it.
        if locks.get(&self.key).is_some_and(|mutex| Arc::strong_count(mutex) == 1) {
            locks.remove(&self.key);
        }
    }
}

/// Handles of the background loops started by [`Engine::spawn_background`].
#[derive(Debug)]
pub struct BackgroundTasks {
    periodic_flush: JoinHandle<()>,
    immediate_flush: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Wait for both loops to exit after [`Engine::shutdown`].
    pub async fn join(self) {
        for (name, handle) in [
            ("periodic_flush", self.periodic_flush),
            ("immediate_flush", self.immediate_flush),
        ] {
            if let Err(err) = handle.await {
                error!(task = name, error = %err, "Background task panicked");
            }
        }
    }
}

/// Beacon campaign action engine.
pub struct Engine {
    config: Config,
    layout: LayoutStore,
    ledger: Ledger,
    scheduler: DeliveryScheduler,
    reports: Arc<ReportQueue>,
    resolver: Arc<dyn Resolver>,
    platform: Arc<dyn PlatformMonitor>,
    actions: broadcast::Sender<ActionFired>,
    key_locks: KeyLocks,
    // Ingestion holds this shared; reset holds it exclusively.
    lifecycle: RwLock<()>,
    authorization: watch::Sender<LocationAuthorization>,
    bluetooth: watch::Sender<BluetoothStatus>,
    resolver_latency: Mutex<Option<Duration>>,
    resolver_reachable: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("layout", &self.layout)
            .field("ledger", &self.ledger)
            .field("reports", &self.reports)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build the engine and restore persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::StorageReadFailed`] if the persisted ledger or
    /// report queue exists but cannot be read.
    pub fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        resolver: Arc<dyn Resolver>,
        platform: Arc<dyn PlatformMonitor>,
    ) -> Result<Self> {
        let ledger = Ledger::load(Arc::clone(&storage), config.ledger.once_scope)?;
        let reports = Arc::new(ReportQueue::load(
            Arc::clone(&storage),
            Arc::clone(&resolver),
            config.reports.clone(),
        )?);
        let layout = LayoutStore::load(storage, Arc::clone(&platform));
        let (actions, _) = broadcast::channel(ACTION_CHANNEL_CAPACITY);
        let scheduler = DeliveryScheduler::new(actions.clone(), Arc::clone(&reports));
        let (authorization, _) = watch::channel(LocationAuthorization::default());
        let (bluetooth, _) = watch::channel(BluetoothStatus::default());
        let (shutdown, _) = watch::channel(false);

        info!(
            cached_layout = layout.current().is_some(),
            ledger_entries = ledger.len(),
            pending_reports = reports.len(),
            "Engine initialized"
        );

        Ok(Self {
            config,
            layout,
            ledger,
            scheduler,
            reports,
            resolver,
            platform,
            actions,
            key_locks: KeyLocks::default(),
            lifecycle: RwLock::new(()),
            authorization,
            bluetooth,
            resolver_latency: Mutex::new(None),
            resolver_reachable: AtomicBool::new(true),
            shutdown,
        })
    }

    // =========================================================================
    // INGESTION
    // =========================================================================

    /// Process one proximity event from the platform.
    ///
    /// Enter and exit events are queued for reporting, matched against the
    /// active layout, admitted through the ledger and scheduled. Range
    /// updates are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::StorageWriteFailed`] if the event or an
    /// admission could not be persisted. Other matches of the same event are
    /// still processed.
    pub async fn handle_proximity(&self, event: ProximityEvent) -> Result<IngestOutcome> {
        let _gate = self.lifecycle.read().await;

        let Some(trigger) = Trigger::from_event(&event) else {
            trace!(beacon_id = %event.beacon_id, "Range update ignored");
            return Ok(IngestOutcome::default());
        };
        self.reports.record_monitor_event(&event)?;

        let Some(snapshot) = self.layout.current() else {
            debug!(beacon_id = %event.beacon_id, "No layout yet; event only reported");
            return Ok(IngestOutcome::default());
        };

        let mut outcome = IngestOutcome::default();
        let mut first_error = None;
        for rule in matcher::match_event(&event, &snapshot, event.observed_at) {
            outcome.matched += 1;
            if let Err(err) = self
                .admit_and_schedule(rule, trigger.clone(), event.observed_at, &mut outcome)
                .await
            {
                error!(rule_id = %rule.id, beacon_id = %event.beacon_id, error = %err, "Match not processed");
                first_error.get_or_insert(err);
            }
        }

        debug!(
            beacon_id = %event.beacon_id,
            kind = %event.kind,
            matched = outcome.matched,
            delivered = outcome.delivered.len(),
            scheduled = outcome.scheduled,
            suppressed = outcome.suppressed,
            "Proximity event processed"
        );
        first_error.map_or(Ok(outcome), Err)
    }

    /// Record a change of location permission and start or stop monitoring.
    pub async fn handle_authorization(&self, status: LocationAuthorization) {
        let _gate = self.lifecycle.read().await;
        let previous = self.authorization.send_replace(status);
        if previous != status {
            info!(?previous, ?status, "Location authorization changed");
        }
        self.layout.set_monitoring_allowed(self.monitoring_allowed());
    }

    /// Record a change of the Bluetooth radio state.
    ///
    /// Monitoring stops while the radio is off and resumes when it comes back.
    pub async fn handle_bluetooth(&self, status: BluetoothStatus) {
        let _gate = self.lifecycle.read().await;
        let previous = self.bluetooth.send_replace(status);
        if previous != status {
            info!(?previous, ?status, "Bluetooth status changed");
        }
        self.layout.set_monitoring_allowed(self.monitoring_allowed());
    }

    // =========================================================================
    // LAYOUT
    // =========================================================================

    /// Fetch the layout, falling back to the cache.
    ///
    /// After a successful network fetch the instant rules are evaluated.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::NoCacheAvailable`] if the fetch failed and
    /// nothing is cached, or [`ProximaError::StorageWriteFailed`] if the
    /// fetched layout or an instant admission could not be persisted.
    pub async fn request_layout(&self) -> Result<FetchOutcome> {
        let _gate = self.lifecycle.read().await;

        let fetched = self
            .layout
            .fetch_or_use_cache(self.resolver.as_ref(), self.config.resolver.timeout())
            .await;
        let reachable = matches!(&fetched, Ok(outcome) if outcome.source == LayoutSource::Network);
        self.resolver_reachable.store(reachable, Ordering::SeqCst);

        let outcome = fetched?;
        if outcome.source == LayoutSource::Network {
            self.fire_instant_rules(&outcome.snapshot, Utc::now()).await?;
        }
        Ok(outcome)
    }

    /// The active layout.
    #[must_use]
    pub fn current_layout(&self) -> Option<Arc<LayoutSnapshot>> {
        self.layout.current()
    }

    /// Observe layout publishes and invalidations.
    #[must_use]
    pub fn subscribe_layouts(&self) -> watch::Receiver<Option<Arc<LayoutSnapshot>>> {
        self.layout.subscribe()
    }

    // =========================================================================
    // REPORTING
    // =========================================================================

    /// Upload queued reports.
    ///
    /// # Errors
    ///
    /// See [`ReportQueue::flush`].
    pub async fn flush_reports(&self, immediate: bool) -> Result<FlushOutcome> {
        self.reports.flush(immediate).await
    }

    /// What the next upload would carry.
    #[must_use]
    pub fn pending_reports(&self) -> ReportBatch {
        self.reports.pending_batch()
    }

    /// Report queue counters.
    #[must_use]
    pub fn report_stats(&self) -> ReportQueueStats {
        self.reports.stats()
    }

    /// Receive an [`ActionFired`] for every delivered match.
    #[must_use]
    pub fn subscribe_actions(&self) -> broadcast::Receiver<ActionFired> {
        self.actions.subscribe()
    }

    // =========================================================================
    // RESOLVER HEALTH
    // =========================================================================

    /// Measure the resolver round trip.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::ResolverUnreachable`] if the ping failed or timed out.
    pub async fn ping(&self) -> Result<Duration> {
        let timeout = self.config.resolver.timeout();
        let result = match tokio::time::timeout(timeout, self.resolver.ping()).await {
            Ok(Ok(latency)) => Ok(latency),
            Ok(Err(err)) => Err(ProximaError::ResolverUnreachable(err.to_string())),
            Err(_) => Err(ProximaError::ResolverUnreachable(format!(
                "no answer within {timeout:?}"
            ))),
        };

        *lock(&self.resolver_latency) = result.as_ref().ok().copied();
        self.resolver_reachable.store(result.is_ok(), Ordering::SeqCst);
        match &result {
            Ok(latency) => debug!(latency_ms = latency.as_millis(), "Resolver ping"),
            Err(err) => warn!(error = %err, "Resolver ping failed"),
        }
        result
    }

    /// Last measured latency; `None` if never measured or the last ping failed.
    #[must_use]
    pub fn resolver_latency(&self) -> Option<Duration> {
        *lock(&self.resolver_latency)
    }

    /// Availability derived from authorization, radio state and resolver reachability.
    #[must_use]
    pub fn availability(&self) -> AvailabilityStatus {
        AvailabilityStatus::from_parts(
            *self.authorization.borrow(),
            *self.bluetooth.borrow(),
            self.resolver_reachable.load(Ordering::SeqCst),
        )
    }

    /// Snapshot of engine state.
    pub async fn status(&self) -> EngineStatus {
        let pending_deliveries = self.scheduler.pending_count().await;
        let layout = self.layout.current();
        let authorization = *self.authorization.borrow();
        let bluetooth = *self.bluetooth.borrow();
        EngineStatus {
            availability: self.availability(),
            authorization,
            bluetooth,
            layout_version: layout.as_ref().and_then(|l| l.version.clone()),
            rules: layout.as_ref().map_or(0, |l| l.rules.len()),
            instant_rules: layout.as_ref().map_or(0, |l| l.instant_rules.len()),
            monitored_groups: layout
                .as_ref()
                .map(|l| l.monitored_beacon_groups.clone())
                .unwrap_or_default(),
            pending_deliveries,
            ledger_entries: self.ledger.len(),
            degraded_fetches: self.layout.degraded_fetches(),
            resolver_latency_ms: self
                .resolver_latency()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            reports: self.reports.stats(),
        }
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Return the engine to a blank state.
    ///
    /// Runs while no event is being ingested: pending deliveries are
    /// cancelled, queued reports are flushed or discarded per
    /// `reports.reset_policy`, the ledger and the layout are cleared, and
    /// monitoring stops.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::StorageWriteFailed`] if cleared state could not
    /// be persisted.
    pub async fn reset(&self) -> Result<ResetSummary> {
        let _gate = self.lifecycle.write().await;
        let mut summary = ResetSummary {
            cancelled_deliveries: self.scheduler.cancel_all().await,
            ..ResetSummary::default()
        };

        match self.config.reports.reset_policy {
            ResetPolicy::Flush => match self.reports.flush(true).await {
                Ok(FlushOutcome::Sent {
                    monitor_events,
                    action_reports,
                }) => summary.flushed_records = monitor_events + action_reports,
                Ok(_) => {}
                Err(err) => {
                    summary.retained_records = self.reports.len();
                    warn!(error = %err, retained = summary.retained_records, "Final flush failed; reports kept");
                }
            },
            ResetPolicy::Discard => summary.discarded_records = self.reports.discard()?,
        }

        self.ledger.clear()?;
        self.layout.invalidate()?;
        self.platform.stop_monitoring();

        info!(
            cancelled = summary.cancelled_deliveries,
            flushed = summary.flushed_records,
            discarded = summary.discarded_records,
            retained = summary.retained_records,
            "Engine reset"
        );
        Ok(summary)
    }

    /// Start the periodic and the immediate flush loops.
    ///
    /// The periodic interval is the layout's `reportTrigger` when present,
    /// `reports.flush_interval_secs` otherwise, and is re-read every cycle.
    #[must_use]
    pub fn spawn_background(self: &Arc<Self>) -> BackgroundTasks {
        let periodic_flush = {
            let engine = Arc::clone(self);
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    let interval = engine.flush_interval();
                    tokio::select! {
                        () = tokio::time::sleep(interval) => {}
                        _ = shutdown.changed() => break,
                    }
                    match engine.reports.flush(false).await {
                        Ok(outcome) => trace!(?outcome, "Periodic flush"),
                        Err(err) => debug!(error = %err, "Periodic flush failed"),
                    }
                }
                debug!("Periodic flush loop stopped");
            })
        };

        let immediate_flush = {
            let engine = Arc::clone(self);
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = engine.reports.flush_requested() => {}
                        _ = shutdown.changed() => break,
                    }
                    match engine.reports.flush(true).await {
                        Ok(outcome) => trace!(?outcome, "Immediate flush"),
                        Err(err) => debug!(error = %err, "Immediate flush failed"),
                    }
                }
                debug!("Immediate flush loop stopped");
            })
        };

        BackgroundTasks {
            periodic_flush,
            immediate_flush,
        }
    }

    /// Stop the background loops.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Current periodic flush interval.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        self.layout
            .current()
            .and_then(|layout| layout.report_interval())
            .unwrap_or_else(|| self.config.reports.flush_interval())
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn monitoring_allowed(&self) -> bool {
        self.authorization.borrow().allows_monitoring() && self.bluetooth.borrow().allows_monitoring()
    }

    async fn fire_instant_rules(&self, snapshot: &LayoutSnapshot, now: DateTime<Utc>) -> Result<()> {
        let mut outcome = IngestOutcome::default();
        let mut first_error = None;
        for rule in matcher::match_instant(snapshot, now) {
            outcome.matched += 1;
            if let Err(err) = self
                .admit_and_schedule(rule, Trigger::instant(rule), now, &mut outcome)
                .await
            {
                error!(rule_id = %rule.id, error = %err, "Instant rule not processed");
                first_error.get_or_insert(err);
            }
        }
        if outcome.matched > 0 {
            info!(
                matched = outcome.matched,
                delivered = outcome.delivered.len(),
                scheduled = outcome.scheduled,
                suppressed = outcome.suppressed,
                "Instant rules evaluated"
            );
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn admit_and_schedule(
        &self,
        rule: &TriggerRule,
        trigger: Trigger,
        now: DateTime<Utc>,
        outcome: &mut IngestOutcome,
    ) -> Result<()> {
        let key = LedgerKey::new(&rule.id, trigger.beacon_id.as_ref());
        let _serialized = self.key_locks.acquire(&key).await;

        match self.ledger.admit(rule, trigger.beacon_id.as_ref(), now)? {
            Admission::Admitted => {}
            Admission::AlreadyFired | Admission::Suppressed { .. } => {
                outcome.suppressed += 1;
                return Ok(());
            }
        }

        match self.scheduler.schedule(rule, trigger, now).await? {
            ScheduleOutcome::Delivered(record) => outcome.delivered.push(record.action_id),
            ScheduleOutcome::Scheduled { .. } => outcome.scheduled += 1,
        }
        Ok(())
    }
}
