//! Application state shared across handlers.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use proxima_core::{Config, Engine, FileStorage, FiringRecord, RegionRegistry, Storage};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::resolver_client::HttpResolver;

/// Number of fired actions kept for `GET /api/actions`.
pub const RECENT_ACTIONS_CAPACITY: usize = 100;

/// State handed to every handler.
pub type SharedState = Arc<AppState>;

/// The engine plus what the HTTP surface needs around it.
#[derive(Debug)]
pub struct AppState {
    /// The action engine.
    pub engine: Arc<Engine>,

    /// Platform stand-in that records which groups are monitored.
    pub registry: Arc<RegionRegistry>,

    /// Most recent firings, newest last.
    recent_actions: RwLock<VecDeque<FiringRecord>>,

    started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire the engine against file storage and the HTTP resolver.
    ///
    /// Must be called inside a Tokio runtime; the action forwarder is
    /// spawned immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolver client cannot be built or persisted
    /// state cannot be read.
    pub fn new(config: Config) -> anyhow::Result<SharedState> {
        let data_dir = config.storage.data_dir();
        info!(data_dir = %data_dir.display(), resolver = %config.resolver.base_url, "Wiring engine");

        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(data_dir));
        let resolver = Arc::new(HttpResolver::new(&config.resolver)?);
        let registry = Arc::new(RegionRegistry::new());
        let engine = Engine::new(config, storage, resolver, registry.clone())
            .context("Failed to restore engine state")?;

        Ok(Self::from_parts(Arc::new(engine), registry))
    }

    /// Wrap an already built engine.
    ///
    /// `registry` must be the platform monitor the engine was built with.
    #[must_use]
    pub fn from_parts(engine: Arc<Engine>, registry: Arc<RegionRegistry>) -> SharedState {
        let actions = engine.subscribe_actions();
        let state = Arc::new(Self {
            engine,
            registry,
            recent_actions: RwLock::new(VecDeque::with_capacity(RECENT_ACTIONS_CAPACITY)),
            started_at: Utc::now(),
        });
        spawn_action_forwarder(Arc::downgrade(&state), actions);
        state
    }

    /// When this process started serving.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Buffered firings, newest first, at most `limit`.
    pub async fn recent_actions(&self, limit: usize) -> Vec<FiringRecord> {
        self.recent_actions
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Drop buffered firings.
    pub async fn clear_recent_actions(&self) {
        self.recent_actions.write().await.clear();
    }

    async fn remember(&self, record: FiringRecord) {
        let mut recent = self.recent_actions.write().await;
        if recent.len() == RECENT_ACTIONS_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(record);
    }
}

/// Copy every fired action into the state's buffer until the state or the
/// engine goes away.
fn spawn_action_forwarder(
    state: std::sync::Weak<AppState>,
    mut actions: broadcast::Receiver<proxima_core::ActionFired>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match actions.recv().await {
                Ok(fired) => {
                    let Some(state) = state.upgrade() else { break };
                    debug!(action_id = %fired.record.action_id, rule_id = %fired.record.rule_id, "Action fired");
                    state.remember(fired.record).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Action forwarder lagged; some firings are not buffered");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Action forwarder stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use proxima_core::{BeaconId, MemoryStorage, Trigger, TriggerKind, TriggerRule};

    use super::*;

    fn record(n: usize) -> FiringRecord {
        let at = Utc.with_ymd_and_hms(2026, 9, 14, 8, 0, 0).unwrap()
            + chrono::Duration::seconds(i64::try_from(n).unwrap());
        let rule = TriggerRule::new(format!("r{n}"), TriggerKind::OnEnter, Vec::<BeaconId>::new());
        let trigger = Trigger {
            beacon_id: None,
            kind: TriggerKind::OnEnter,
            location: None,
        };
        FiringRecord::new(&rule, &trigger, at, at)
    }

    fn state() -> AppState {
        AppState {
            engine: Arc::new(
                Engine::new(
                    Config::default(),
                    Arc::new(MemoryStorage::new()),
                    Arc::new(HttpResolver::new(&Config::default().resolver).unwrap()),
                    Arc::new(RegionRegistry::new()),
                )
                .unwrap(),
            ),
            registry: Arc::new(RegionRegistry::new()),
            recent_actions: RwLock::new(VecDeque::new()),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_recent_actions_are_capped_and_newest_first() {
        let state = state();
        for n in 0..RECENT_ACTIONS_CAPACITY + 5 {
            state.remember(record(n)).await;
        }

        let recent = state.recent_actions(usize::MAX).await;
        assert_eq!(recent.len(), RECENT_ACTIONS_CAPACITY);
        assert_eq!(recent.len(), state.recent_actions.read().await.len());

        let newest = state.recent_actions(1).await;
        assert_eq!(newest[0].rule_id, format!("r{}", RECENT_ACTIONS_CAPACITY + 4));
        assert_eq!(recent.last().unwrap().rule_id, "r5");
    }

    #[tokio::test]
    async fn test_new_wires_file_storage() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = Some(dir.path().to_path_buf());
        config.resolver.base_url = "http://127.0.0.1:9/api".to_string();
        config.resolver.timeout_secs = 1;

        let state = tokio_test::assert_ok!(AppState::new(config));
        assert!(state.engine.current_layout().is_none());
        assert!(state.recent_actions(10).await.is_empty());
        tokio_test::assert_err!(state.engine.request_layout().await);
    }

    #[tokio::test]
    async fn test_forwarder_stops_when_state_is_dropped() {
        let (tx, rx) = broadcast::channel(4);
        let state = Arc::new(state());
        let handle = spawn_action_forwarder(Arc::downgrade(&state), rx);
        drop(state);

        tx.send(proxima_core::ActionFired { record: record(1) }).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
