//! Report queue.
//!
//! Monitor events and action reports are appended to a bounded queue that is
//! persisted before every append returns, and uploaded to the resolver in
//! batches. A record leaves the queue only after the resolver acknowledged
//! the batch that carried it, so delivery is at-least-once.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::beacon::{BeaconId, ProximityEvent};
use crate::config::ReportsConfig;
use crate::error::{ProximaError, Result};
use crate::events::FiringRecord;
use crate::lock;
use crate::resolver::Resolver;
use crate::storage::{load_json, save_json, Storage, REPORTS_KEY};

/// An observed region transition, as uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorRecord {
    /// Beacon.
    #[serde(rename = "pid")]
    pub beacon_id: BeaconId,

    /// Observation time.
    #[serde(rename = "dt")]
    pub observed_at: DateTime<Utc>,

    /// 1 for enter, 2 for exit.
    pub trigger: u8,

    /// Location tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Estimated distance in metres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,

    /// Signal strength.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
}

impl MonitorRecord {
    /// Report for an enter or exit event; range updates are not reported.
    #[must_use]
    pub fn from_event(event: &ProximityEvent) -> Option<Self> {
        event.kind.wire_code().map(|trigger| Self {
            beacon_id: event.beacon_id.clone(),
            observed_at: event.observed_at,
            trigger,
            location: event.location.clone(),
            accuracy: event.accuracy,
            rssi: event.rssi,
        })
    }
}

/// Whether a firing was delivered or dropped at expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// Delivered to the host.
    Fired,
    /// Dropped because the rule's timeframe closed during the delay.
    Expired,
}

/// A firing, as uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionReport {
    /// Rule id.
    #[serde(rename = "eid")]
    pub rule_id: String,

    /// Triggering beacon; absent for instant rules.
    #[serde(rename = "pid", default, skip_serializing_if = "Option::is_none")]
    pub beacon_id: Option<BeaconId>,

    /// Delivery time.
    #[serde(rename = "dt")]
    pub deliver_at: DateTime<Utc>,

    /// Wire trigger value.
    pub trigger: u8,

    /// Location tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Content that was (or would have been) presented.
    #[serde(default)]
    pub reaction: Value,

    /// Delivered or expired.
    pub status: ReportStatus,

    /// Unique firing id.
    pub action_id: Uuid,
}

impl ActionReport {
    /// Report for a firing record.
    #[must_use]
    pub fn new(record: &FiringRecord, status: ReportStatus) -> Self {
        Self {
            rule_id: record.rule_id.clone(),
            beacon_id: record.beacon_id.clone(),
            deliver_at: record.deliver_at,
            trigger: record.trigger_kind.into(),
            location: record.location.clone(),
            reaction: serde_json::to_value(&record.context).unwrap_or(Value::Null),
            status,
            action_id: record.action_id,
        }
    }
}

/// The upload body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportBatch {
    /// Device clock at batch creation.
    pub device_timestamp: DateTime<Utc>,

    /// Observed transitions.
    #[serde(rename = "events", default)]
    pub monitor_events: Vec<MonitorRecord>,

    /// Firings.
    #[serde(rename = "actions", default)]
    pub action_reports: Vec<ActionReport>,
}

impl ReportBatch {
    /// Total records in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.monitor_events.len() + self.action_reports.len()
    }

    /// Returns `true` if the batch carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.monitor_events.is_empty() && self.action_reports.is_empty()
    }
}

/// Result of a successful [`ReportQueue::flush`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushOutcome {
    /// The resolver acknowledged a batch.
    Sent {
        /// Monitor events removed from the queue.
        monitor_events: usize,
        /// Action reports removed from the queue.
        action_reports: usize,
    },
    /// Nothing was queued; no request was made.
    Empty,
    /// Another flush is already in flight.
    InFlight,
    /// A previous failure set a retry delay that has not elapsed.
    BackingOff {
        /// Seconds until the next periodic attempt.
        retry_in_secs: u64,
    },
}

/// Queue counters for status pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportQueueStats {
    /// Monitor events waiting for upload.
    pub pending_monitor_events: usize,
    /// Action reports waiting for upload.
    pub pending_action_reports: usize,
    /// Records discarded because the queue was full.
    pub dropped_records: u64,
    /// Uploads that failed since the last success.
    pub consecutive_failures: u32,
    /// Last acknowledged upload.
    pub last_flush_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Queued<T> {
    seq: u64,
    record: T,
}

/// Queue contents, as persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueState {
    next_seq: u64,
    monitor_events: VecDeque<Queued<MonitorRecord>>,
    action_reports: VecDeque<Queued<ActionReport>>,
    #[serde(default)]
    dropped_records: u64,
    #[serde(default)]
    last_flush_at: Option<DateTime<Utc>>,
}

impl QueueState {
    fn len(&self) -> usize {
        self.monitor_events.len() + self.action_reports.len()
    }

    fn is_empty(&self) -> bool {
        self.monitor_events.is_empty() && self.action_reports.is_empty()
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Drop oldest records until at most `max` remain; returns how many went.
    fn enforce_cap(&mut self, max: usize) -> u64 {
        let mut dropped = 0;
        while self.len() > max {
            let monitor_front = self.monitor_events.front().map(|q| q.seq);
            let action_front = self.action_reports.front().map(|q| q.seq);
            match (monitor_front, action_front) {
                (Some(m), Some(a)) if a < m => {
                    self.action_reports.pop_front();
                }
                (Some(_), _) => {
                    self.monitor_events.pop_front();
                }
                (None, Some(_)) => {
                    self.action_reports.pop_front();
                }
                (None, None) => break,
            }
            dropped += 1;
        }
        self.dropped_records += dropped;
        dropped
    }

    fn to_batch(&self, device_timestamp: DateTime<Utc>) -> ReportBatch {
        ReportBatch {
            device_timestamp,
            monitor_events: self.monitor_events.iter().map(|q| q.record.clone()).collect(),
            action_reports: self.action_reports.iter().map(|q| q.record.clone()).collect(),
        }
    }

    /// Remove every record with `seq < upto`; returns (monitor, action) counts.
    fn acknowledge(&mut self, upto: u64) -> (usize, usize) {
        let monitor_before = self.monitor_events.len();
        let action_before = self.action_reports.len();
        self.monitor_events.retain(|q| q.seq >= upto);
        self.action_reports.retain(|q| q.seq >= upto);
        (
            monitor_before - self.monitor_events.len(),
            action_before - self.action_reports.len(),
        )
    }
}

#[derive(Debug, Default)]
struct FlightState {
    retry_after: Option<Instant>,
}

/// Durable, bounded queue of reports awaiting upload.
pub struct ReportQueue {
    state: Mutex<QueueState>,
    // Serializes writers so the newest queue is always the last one written.
    persist_lock: Mutex<()>,
    // Set when the last persist failed; the next flush persists first.
    dirty: AtomicBool,
    flight: tokio::sync::Mutex<FlightState>,
    consecutive_failures: AtomicU32,
    flush_requested: Notify,
    storage: Arc<dyn Storage>,
    resolver: Arc<dyn Resolver>,
    config: ReportsConfig,
}

impl fmt::Debug for ReportQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportQueue")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ReportQueue {
    /// Load pending records from storage.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::StorageReadFailed`] if a persisted queue exists
    /// but cannot be read.
    pub fn load(
        storage: Arc<dyn Storage>,
        resolver: Arc<dyn Resolver>,
        config: ReportsConfig,
    ) -> Result<Self> {
        let mut state: QueueState = load_json(storage.as_ref(), REPORTS_KEY)?.unwrap_or_default();
        let dropped = state.enforce_cap(config.max_records);
        if dropped > 0 {
            warn!(dropped, max = config.max_records, "Persisted report queue exceeded the cap");
        }
        debug!(
            monitor_events = state.monitor_events.len(),
            action_reports = state.action_reports.len(),
            "Report queue loaded"
        );

        Ok(Self {
            state: Mutex::new(state),
            persist_lock: Mutex::new(()),
            dirty: AtomicBool::new(dropped > 0),
            flight: tokio::sync::Mutex::new(FlightState::default()),
            consecutive_failures: AtomicU32::new(0),
            flush_requested: Notify::new(),
            storage,
            resolver,
            config,
        })
    }

    /// Queue a monitor event. Range updates are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::StorageWriteFailed`] if the queue could not be
    /// persisted. The record stays queued in memory.
    pub fn record_monitor_event(&self, event: &ProximityEvent) -> Result<()> {
        let Some(record) = MonitorRecord::from_event(event) else {
            return Ok(());
        };
        self.append(|state| {
            let seq = state.take_seq();
            state.monitor_events.push_back(Queued { seq, record });
        })
    }

    /// Queue an action report. With `flush_now`, wake the immediate-flush worker.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::StorageWriteFailed`] if the queue could not be
    /// persisted. The record stays queued in memory.
    pub fn record_firing(&self, report: ActionReport, flush_now: bool) -> Result<()> {
        let result = self.append(|state| {
            let seq = state.take_seq();
            state.action_reports.push_back(Queued {
                seq,
                record: report,
            });
        });
        if flush_now {
            self.flush_requested.notify_one();
        }
        result
    }

    /// Wait until an immediate flush is requested.
    pub async fn flush_requested(&self) {
        self.flush_requested.notified().await;
    }

    /// Upload everything queued.
    ///
    /// Non-immediate calls return [`FlushOutcome::InFlight`] when another
    /// flush is running and [`FlushOutcome::BackingOff`] while a retry delay
    /// is pending; immediate calls wait for the running flush and ignore the
    /// delay.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::ReportSendFailed`] if the upload failed or timed
    /// out (the records stay queued), or [`ProximaError::StorageWriteFailed`]
    /// if the queue could not be persisted before sending.
    pub async fn flush(&self, immediate: bool) -> Result<FlushOutcome> {
        let mut flight = if immediate {
            self.flight.lock().await
        } else {
            match self.flight.try_lock() {
                Ok(guard) => guard,
                Err(_) => return Ok(FlushOutcome::InFlight),
            }
        };

        if !immediate {
            if let Some(retry_after) = flight.retry_after {
                let now = Instant::now();
                if now < retry_after {
                    return Ok(FlushOutcome::BackingOff {
                        retry_in_secs: (retry_after - now).as_secs(),
                    });
                }
            }
        }

        // Nothing goes on the wire that is not on disk.
        if self.dirty.load(Ordering::SeqCst) {
            self.persist()?;
        }

        let (batch, upto) = {
            let state = lock(&self.state);
            if state.is_empty() {
                return Ok(FlushOutcome::Empty);
            }
            (state.to_batch(Utc::now()), state.next_seq)
        };

        let timeout = self.config.flush_timeout();
        let sent = match tokio::time::timeout(timeout, self.resolver.post_report(&batch)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("no acknowledgement within {timeout:?}")),
        };

        match sent {
            Ok(()) => {
                let (monitor_events, action_reports) = {
                    let mut state = lock(&self.state);
                    state.last_flush_at = Some(Utc::now());
                    state.acknowledge(upto)
                };
                flight.retry_after = None;
                self.consecutive_failures.store(0, Ordering::SeqCst);
                if let Err(err) = self.persist() {
                    // The resolver has the batch; a resend after restart is tolerated.
                    warn!(error = %err, "Acknowledged reports not yet removed from disk");
                }
                info!(monitor_events, action_reports, "Report batch acknowledged");
                Ok(FlushOutcome::Sent {
                    monitor_events,
                    action_reports,
                })
            }
            Err(message) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                let delay = self.backoff(failures);
                flight.retry_after = Some(Instant::now() + delay);
                warn!(
                    records = batch.len(),
                    failures,
                    retry_in_secs = delay.as_secs(),
                    error = %message,
                    "Report upload failed; keeping batch"
                );
                Err(ProximaError::ReportSendFailed(message))
            }
        }
    }

    /// Drop everything queued.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::StorageWriteFailed`] if the empty queue could not be persisted.
    pub fn discard(&self) -> Result<usize> {
        let discarded = {
            let mut state = lock(&self.state);
            let discarded = state.len();
            state.monitor_events.clear();
            state.action_reports.clear();
            state.dropped_records = 0;
            discarded
        };
        self.persist()?;
        info!(discarded, "Report queue discarded");
        Ok(discarded)
    }

    /// Snapshot of what an upload would carry right now.
    #[must_use]
    pub fn pending_batch(&self) -> ReportBatch {
        lock(&self.state).to_batch(Utc::now())
    }

    /// Queue counters.
    #[must_use]
    pub fn stats(&self) -> ReportQueueStats {
        let state = lock(&self.state);
        ReportQueueStats {
            pending_monitor_events: state.monitor_events.len(),
            pending_action_reports: state.action_reports.len(),
            dropped_records: state.dropped_records,
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_flush_at: state.last_flush_at,
        }
    }

    /// Total records waiting for upload.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).len()
    }

    /// Returns `true` if nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.state).is_empty()
    }

    fn append(&self, push: impl FnOnce(&mut QueueState)) -> Result<()> {
        {
            let mut state = lock(&self.state);
            push(&mut state);
            let dropped = state.enforce_cap(self.config.max_records);
            if dropped > 0 {
                warn!(
                    dropped,
                    total_dropped = state.dropped_records,
                    "Report queue full; dropped oldest records"
                );
            }
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let _writer = lock(&self.persist_lock);
        let snapshot = lock(&self.state).clone();
        match save_json(self.storage.as_ref(), REPORTS_KEY, &snapshot) {
            Ok(()) => {
                self.dirty.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(ProximaError::StorageWriteFailed {
                    key: REPORTS_KEY.to_string(),
                    message: err.to_string(),
                })
            }
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let secs = self
            .config
            .retry_base_secs
            .saturating_mul(1_u64 << exponent)
            .min(self.config.retry_max_secs);
        Duration::from_secs(secs)
    }
}
