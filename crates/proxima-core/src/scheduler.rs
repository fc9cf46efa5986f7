//! Delivery scheduler.
//!
//! Admitted matches are delivered at once when they carry no delay, or on a
//! tokio timer otherwise. There is at most one pending delivery per ledger
//! key; a newer match replaces it. A timer only delivers while holding the
//! scheduler lock and after checking the cancellation epoch, so nothing is
//! delivered once [`DeliveryScheduler::cancel_all`] has returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ProximaError, Result};
use crate::events::{ActionFired, FiringRecord, Trigger};
use crate::layout::TriggerRule;
use crate::ledger::LedgerKey;
use crate::reports::{ActionReport, ReportQueue, ReportStatus};

/// Result of [`DeliveryScheduler::schedule`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    /// Delivered synchronously.
    Delivered(FiringRecord),
    /// A timer was armed.
    Scheduled {
        /// When the timer fires.
        deliver_at: DateTime<Utc>,
        /// Whether a pending delivery for the same key was replaced.
        replaced: bool,
    },
}

#[derive(Debug)]
struct Pending {
    generation: u64,
    deliver_at: DateTime<Utc>,
    handle: AbortHandle,
}

#[derive(Debug, Default)]
struct SchedulerState {
    epoch: u64,
    next_generation: u64,
    pending: HashMap<LedgerKey, Pending>,
}

/// Hands delivered firings to listeners and the report queue.
#[derive(Debug, Clone)]
struct Delivery {
    actions: broadcast::Sender<ActionFired>,
    reports: Arc<ReportQueue>,
}

impl Delivery {
    fn fire(&self, record: FiringRecord, report_immediately: bool) -> Result<()> {
        info!(
            rule_id = %record.rule_id,
            action_id = %record.action_id,
            beacon_id = record.beacon_id.as_ref().map(|b| b.as_str()),
            "Action fired"
        );
        let report = ActionReport::new(&record, ReportStatus::Fired);
        // No subscribers is fine; the report still goes out.
        let _ = self.actions.send(ActionFired { record });
        self.reports.record_firing(report, report_immediately)
    }

    fn expire(&self, record: FiringRecord) {
        let dropped = ProximaError::TimerRaceDropped {
            rule_id: record.rule_id.clone(),
        };
        warn!(action_id = %record.action_id, deliver_at = %record.deliver_at, "{dropped}");
        let report = ActionReport::new(&record, ReportStatus::Expired);
        if let Err(err) = self.reports.record_firing(report, false) {
            error!(rule_id = %record.rule_id, error = %err, "Failed to queue expiry report");
        }
    }
}

/// Timer-based delivery of admitted matches.
#[derive(Debug)]
pub struct DeliveryScheduler {
    state: Arc<Mutex<SchedulerState>>,
    delivery: Delivery,
}

impl DeliveryScheduler {
    /// Create a scheduler that emits on `actions` and reports to `reports`.
    #[must_use]
    pub fn new(actions: broadcast::Sender<ActionFired>, reports: Arc<ReportQueue>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState::default())),
            delivery: Delivery { actions, reports },
        }
    }

    /// Deliver `rule` now, or arm a timer for its delay.
    ///
    /// The delay runs from `now`, which is the event's observation time. Any
    /// pending delivery for the same `(rule, beacon)` key is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::StorageWriteFailed`] if a synchronous delivery
    /// could not be queued for reporting. The action was still emitted.
    /// Returns [`ProximaError::InvalidLayout`] if the delivery time cannot be
    /// represented; nothing is scheduled and any pending delivery is kept.
    pub async fn schedule(
        &self,
        rule: &TriggerRule,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome> {
        let key = LedgerKey::new(&rule.id, trigger.beacon_id.as_ref());
        let delay = rule.delivery_delay(now);
        let deliver_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|offset| now.checked_add_signed(offset))
            .ok_or_else(|| {
                ProximaError::InvalidLayout(format!(
                    "rule '{}' delivers {}s after {now}, past the representable range",
                    rule.id,
                    delay.as_secs()
                ))
            })?;

        let mut state = self.state.lock().await;
        let replaced = match state.pending.remove(&key) {
            Some(previous) => {
                previous.handle.abort();
                debug!(key = %key, previous = %previous.deliver_at, "Replacing pending delivery");
                true
            }
            None => false,
        };

        if delay.is_zero() {
            let record = FiringRecord::new(rule, &trigger, now, deliver_at);
            self.delivery.fire(record.clone(), rule.report_immediately)?;
            return Ok(ScheduleOutcome::Delivered(record));
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let timer = Timer {
            state: Arc::clone(&self.state),
            delivery: self.delivery.clone(),
            rule: rule.clone(),
            trigger,
            key: key.clone(),
            generation,
            epoch: state.epoch,
            scheduled_at: now,
            deliver_at,
        };
        let handle = tokio::spawn(timer.run(delay));
        state.pending.insert(
            key.clone(),
            Pending {
                generation,
                deliver_at,
                handle: handle.abort_handle(),
            },
        );
        debug!(key = %key, %deliver_at, delay_secs = delay.as_secs(), "Delivery scheduled");

        Ok(ScheduleOutcome::Scheduled {
            deliver_at,
            replaced,
        })
    }

    /// Abort every pending delivery. Returns how many were aborted.
    pub async fn cancel_all(&self) -> usize {
        let mut state = self.state.lock().await;
        state.epoch += 1;
        let cancelled = state.pending.len();
        for (_, pending) in state.pending.drain() {
            pending.handle.abort();
        }
        if cancelled > 0 {
            info!(cancelled, "Pending deliveries cancelled");
        }
        cancelled
    }

    /// Number of armed timers.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Delivery time of the pending delivery for `key`, if any.
    pub async fn pending_for(&self, key: &LedgerKey) -> Option<DateTime<Utc>> {
        self.state.lock().await.pending.get(key).map(|p| p.deliver_at)
    }
}

struct Timer {
    state: Arc<Mutex<SchedulerState>>,
    delivery: Delivery,
    rule: TriggerRule,
    trigger: Trigger,
    key: LedgerKey,
    generation: u64,
    epoch: u64,
    scheduled_at: DateTime<Utc>,
    deliver_at: DateTime<Utc>,
}

impl Timer {
    async fn run(self, delay: Duration) {
        tokio::time::sleep(delay).await;

        let mut state = self.state.lock().await;
        if state.epoch != self.epoch {
            return;
        }
        match state.pending.get(&self.key) {
            Some(pending) if pending.generation == self.generation => {}
            _ => return,
        }
        state.pending.remove(&self.key);

        let record = FiringRecord::new(&self.rule, &self.trigger, self.scheduled_at, self.deliver_at);
        if self.rule.is_active_at(self.deliver_at) {
            if let Err(err) = self.delivery.fire(record, self.rule.report_immediately) {
                error!(key = %self.key, error = %err, "Delivered action could not be queued for reporting");
            }
        } else {
            self.delivery.expire(record);
        }
    }
}
