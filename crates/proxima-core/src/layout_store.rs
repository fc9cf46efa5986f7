//! Layout store.
//!
//! Holds the active [`LayoutSnapshot`], persists it as the offline cache, and
//! keeps platform region monitoring in step with it. Readers get an `Arc` to
//! the snapshot without waiting on publishers.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ProximaError, Result};
use crate::layout::LayoutSnapshot;
use crate::lock;
use crate::platform::PlatformMonitor;
use crate::resolver::Resolver;
use crate::storage::{load_json, save_json, Storage, LAYOUT_KEY};

/// Where a fetched layout came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutSource {
    /// Freshly fetched from the resolver.
    Network,
    /// The fetch failed; this is the cached layout.
    Cache,
}

/// Result of [`LayoutStore::fetch_or_use_cache`].
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// The active layout.
    pub snapshot: Arc<LayoutSnapshot>,
    /// Where it came from.
    pub source: LayoutSource,
    /// Whether a fetched layout differed from the previous one.
    pub changed: bool,
}

/// Active layout, offline cache and region hand-off.
pub struct LayoutStore {
    current: watch::Sender<Option<Arc<LayoutSnapshot>>>,
    // Serializes publishers: swap, platform hand-off and persist happen in order.
    publish_lock: Mutex<()>,
    storage: Arc<dyn Storage>,
    platform: Arc<dyn PlatformMonitor>,
    monitoring_allowed: AtomicBool,
    monitoring_started: AtomicBool,
    degraded_fetches: AtomicU64,
}

impl fmt::Debug for LayoutStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutStore")
            .field("has_layout", &self.current().is_some())
            .field("degraded_fetches", &self.degraded_fetches())
            .finish_non_exhaustive()
    }
}

impl LayoutStore {
    /// Create a store, loading the cached layout from `storage`.
    ///
    /// An unreadable cache is logged and ignored; the next fetch replaces it.
    #[must_use]
    pub fn load(storage: Arc<dyn Storage>, platform: Arc<dyn PlatformMonitor>) -> Self {
        let cached = match load_json::<LayoutSnapshot>(storage.as_ref(), LAYOUT_KEY) {
            Ok(Some(snapshot)) => match snapshot.validate() {
                Ok(()) => {
                    debug!(rules = snapshot.rules.len(), "Cached layout loaded");
                    Some(Arc::new(snapshot))
                }
                Err(err) => {
                    warn!(error = %err, "Ignoring invalid cached layout");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "Ignoring unreadable cached layout");
                None
            }
        };
        let (current, _) = watch::channel(cached);

        Self {
            current,
            publish_lock: Mutex::new(()),
            storage,
            platform,
            monitoring_allowed: AtomicBool::new(true),
            monitoring_started: AtomicBool::new(false),
            degraded_fetches: AtomicU64::new(0),
        }
    }

    /// The active layout, if any.
    #[must_use]
    pub fn current(&self) -> Option<Arc<LayoutSnapshot>> {
        self.current.borrow().clone()
    }

    /// Observe every publish and invalidation.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<LayoutSnapshot>>> {
        self.current.subscribe()
    }

    /// Make `snapshot` the active layout.
    ///
    /// Publishing a layout equal to the active one does nothing. Otherwise the
    /// snapshot is swapped in, its groups are handed to region monitoring, and
    /// it is persisted as the cache. Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::InvalidLayout`] (nothing changes) if the layout
    /// breaks a rule invariant, or [`ProximaError::StorageWriteFailed`] if it
    /// is active but could not be cached.
    pub fn publish(&self, snapshot: LayoutSnapshot) -> Result<bool> {
        snapshot.validate()?;

        let _publisher = lock(&self.publish_lock);
        if self.current.borrow().as_deref() == Some(&snapshot) {
            debug!("Layout unchanged; publish skipped");
            return Ok(false);
        }

        let snapshot = Arc::new(snapshot);
        self.current.send_replace(Some(Arc::clone(&snapshot)));
        info!(
            version = snapshot.version.as_deref(),
            rules = snapshot.rules.len(),
            instant_rules = snapshot.instant_rules.len(),
            groups = snapshot.monitored_beacon_groups.len(),
            "Layout published"
        );
        self.hand_off(&snapshot.monitored_beacon_groups);

        save_json(self.storage.as_ref(), LAYOUT_KEY, snapshot.as_ref()).map_err(|err| {
            ProximaError::StorageWriteFailed {
                key: LAYOUT_KEY.to_string(),
                message: err.to_string(),
            }
        })?;
        Ok(true)
    }

    /// Fetch a layout from `resolver`, falling back to the cache.
    ///
    /// A failed or invalid fetch counts as degraded and leaves monitoring as it
    /// is, except that a cache nobody has monitored yet is handed off.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::NoCacheAvailable`] if the fetch failed and no
    /// layout was ever published, or [`ProximaError::StorageWriteFailed`] if a
    /// fetched layout could not be cached.
    pub async fn fetch_or_use_cache(
        &self,
        resolver: &dyn Resolver,
        timeout: Duration,
    ) -> Result<FetchOutcome> {
        let fetched = match tokio::time::timeout(timeout, resolver.get_layout()).await {
            Ok(Ok(snapshot)) => match snapshot.validate() {
                Ok(()) => Ok(snapshot),
                Err(err) => Err(ProximaError::FetchFailed(err.to_string())),
            },
            Ok(Err(err)) => Err(ProximaError::FetchFailed(err.to_string())),
            Err(_) => Err(ProximaError::FetchFailed(format!(
                "no layout within {timeout:?}"
            ))),
        };

        match fetched {
            Ok(snapshot) => {
                let changed = self.publish(snapshot)?;
                let snapshot = self.current().ok_or(ProximaError::NoCacheAvailable)?;
                Ok(FetchOutcome {
                    snapshot,
                    source: LayoutSource::Network,
                    changed,
                })
            }
            Err(err) => {
                let degraded = self.degraded_fetches.fetch_add(1, Ordering::SeqCst) + 1;
                let Some(snapshot) = self.current() else {
                    warn!(error = %err, degraded, "Layout fetch failed and nothing is cached");
                    return Err(ProximaError::NoCacheAvailable);
                };
                warn!(error = %err, degraded, "Layout fetch failed; using cached layout");
                if !self.monitoring_started.load(Ordering::SeqCst) {
                    self.hand_off(&snapshot.monitored_beacon_groups);
                }
                Ok(FetchOutcome {
                    snapshot,
                    source: LayoutSource::Cache,
                    changed: false,
                })
            }
        }
    }

    /// Drop the active layout from memory and storage.
    ///
    /// # Errors
    ///
    /// Returns [`ProximaError::StorageWriteFailed`] if the cache could not be removed.
    pub fn invalidate(&self) -> Result<()> {
        let _publisher = lock(&self.publish_lock);
        self.current.send_replace(None);
        self.monitoring_started.store(false, Ordering::SeqCst);
        self.storage.remove(LAYOUT_KEY)?;
        info!("Layout invalidated");
        Ok(())
    }

    /// Allow or forbid handing groups to region monitoring.
    ///
    /// Allowing it hands off the active layout; forbidding it stops monitoring.
    pub fn set_monitoring_allowed(&self, allowed: bool) {
        let _publisher = lock(&self.publish_lock);
        let was_allowed = self.monitoring_allowed.swap(allowed, Ordering::SeqCst);
        if allowed {
            if let Some(snapshot) = self.current() {
                self.hand_off(&snapshot.monitored_beacon_groups);
            }
        } else if was_allowed {
            self.platform.stop_monitoring();
            self.monitoring_started.store(false, Ordering::SeqCst);
        }
    }

    /// Number of fetches that fell back to the cache or failed outright.
    #[must_use]
    pub fn degraded_fetches(&self) -> u64 {
        self.degraded_fetches.load(Ordering::SeqCst)
    }

    fn hand_off(&self, groups: &[String]) {
        if !self.monitoring_allowed.load(Ordering::SeqCst) {
            debug!("Region monitoring not authorized; hand-off deferred");
            return;
        }
        self.platform.stop_monitoring();
        self.platform.start_monitoring(groups);
        self.monitoring_started.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::BeaconId;
    use crate::layout::{TriggerKind, TriggerRule};
    use crate::platform::RegionRegistry;
    use crate::reports::ReportBatch;
    use crate::resolver::ResolverError;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use uuid::Uuid;

    const GROUP: &str = "7367672374000000ffff0000ffff0003";

    struct StaticResolver(Mutex<std::result::Result<LayoutSnapshot, ResolverError>>);

    impl StaticResolver {
        fn serving(layout: LayoutSnapshot) -> Self {
            Self(Mutex::new(Ok(layout)))
        }

        fn offline() -> Self {
            Self(Mutex::new(Err(ResolverError::Transport("offline".into()))))
        }
    }

    #[async_trait]
    impl Resolver for StaticResolver {
        async fn get_layout(&self) -> std::result::Result<LayoutSnapshot, ResolverError> {
            lock(&self.0).clone()
        }

        async fn post_report(&self, _batch: &ReportBatch) -> std::result::Result<(), ResolverError> {
            Ok(())
        }

        async fn ping(&self) -> std::result::Result<Duration, ResolverError> {
            Ok(Duration::ZERO)
        }
    }

    fn layout(version: &str) -> LayoutSnapshot {
        let beacon = BeaconId::from_parts(Uuid::nil(), 1, 1);
        LayoutSnapshot {
            monitored_beacon_groups: vec![GROUP.to_string()],
            rules: vec![TriggerRule::new("r1", TriggerKind::OnEnter, [beacon])],
            version: Some(version.to_string()),
            ..LayoutSnapshot::default()
        }
    }

    fn store() -> (LayoutStore, Arc<RegionRegistry>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let registry = Arc::new(RegionRegistry::new());
        let store = LayoutStore::load(storage.clone(), registry.clone());
        (store, registry, storage)
    }

    #[test]
    fn test_publish_then_current() {
        let (store, registry, storage) = store();
        assert!(store.current().is_none());

        assert!(store.publish(layout("1")).unwrap());
        assert_eq!(*store.current().unwrap(), layout("1"));
        assert_eq!(registry.monitored_groups(), [GROUP]);
        assert!(storage.load(LAYOUT_KEY).unwrap().is_some());
    }

    #[test]
    fn test_publish_is_idempotent() {
        let (store, _registry, _storage) = store();
        let mut rx = store.subscribe();

        assert!(store.publish(layout("1")).unwrap());
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert!(!store.publish(layout("1")).unwrap());
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_publish_rejects_invalid_layout() {
        let (store, _registry, _storage) = store();
        let mut bad = layout("1");
        bad.rules[0].beacon_ids.clear();

        assert!(matches!(
            store.publish(bad),
            Err(ProximaError::InvalidLayout(_))
        ));
        assert!(store.current().is_none());
    }

    #[test]
    fn test_cached_layout_loaded_on_startup() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = Arc::new(RegionRegistry::new());
        LayoutStore::load(storage.clone(), registry.clone())
            .publish(layout("7"))
            .unwrap();

        let restarted = LayoutStore::load(storage, registry);
        assert_eq!(restarted.current().unwrap().version.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_fetch_publishes_network_layout() {
        let (store, _registry, _storage) = store();
        let resolver = StaticResolver::serving(layout("2"));

        let outcome = store
            .fetch_or_use_cache(&resolver, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome.source, LayoutSource::Network);
        assert!(outcome.changed);
        assert_eq!(store.degraded_fetches(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_without_cache() {
        let (store, _registry, _storage) = store();
        let err = store
            .fetch_or_use_cache(&StaticResolver::offline(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProximaError::NoCacheAvailable));
        assert_eq!(store.degraded_fetches(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_uses_cache_and_keeps_monitoring() {
        let (store, registry, _storage) = store();
        store.publish(layout("3")).unwrap();

        let outcome = store
            .fetch_or_use_cache(&StaticResolver::offline(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome.source, LayoutSource::Cache);
        assert_eq!(outcome.snapshot.version.as_deref(), Some("3"));
        assert_eq!(store.degraded_fetches(), 1);
        assert!(registry.is_monitoring());
    }

    #[tokio::test]
    async fn test_invalid_fetched_layout_falls_back() {
        let (store, _registry, _storage) = store();
        store.publish(layout("4")).unwrap();
        let mut bad = layout("5");
        bad.monitored_beacon_groups = vec!["not-a-uuid".into()];

        let outcome = store
            .fetch_or_use_cache(&StaticResolver::serving(bad), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome.source, LayoutSource::Cache);
        assert_eq!(store.current().unwrap().version.as_deref(), Some("4"));
    }

    #[test]
    fn test_invalidate() {
        let (store, _registry, storage) = store();
        store.publish(layout("1")).unwrap();
        store.invalidate().unwrap();

        assert!(store.current().is_none());
        assert!(storage.load(LAYOUT_KEY).unwrap().is_none());
    }

    #[test]
    fn test_monitoring_follows_authorization() {
        let (store, registry, _storage) = store();
        store.set_monitoring_allowed(false);
        store.publish(layout("1")).unwrap();
        assert!(!registry.is_monitoring());

        store.set_monitoring_allowed(true);
        assert_eq!(registry.monitored_groups(), [GROUP]);

        store.set_monitoring_allowed(false);
        assert!(!registry.is_monitoring());
    }
}
