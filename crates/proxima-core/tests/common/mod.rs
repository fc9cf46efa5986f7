//! Shared fixtures for engine scenario tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use proxima_core::{
    ActionFired, BeaconId, Config, Engine, LayoutSnapshot, MemoryStorage, RegionRegistry,
    ReportBatch, Resolver, ResolverError, Storage, TriggerKind, TriggerRule,
};
use tokio::sync::broadcast;

pub const GROUP: &str = "7367672374000000ffff0000ffff0003";

/// In-memory resolver whose layout and upload behaviour tests can change.
#[derive(Default)]
pub struct FakeResolver {
    pub layout: Mutex<Option<LayoutSnapshot>>,
    pub fail_uploads: AtomicBool,
    pub uploads: Mutex<Vec<ReportBatch>>,
    pub upload_attempts: AtomicUsize,
}

impl FakeResolver {
    pub fn serving(layout: LayoutSnapshot) -> Arc<Self> {
        Arc::new(Self {
            layout: Mutex::new(Some(layout)),
            ..Self::default()
        })
    }

    pub fn uploads(&self) -> Vec<ReportBatch> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Resolver for FakeResolver {
    async fn get_layout(&self) -> Result<LayoutSnapshot, ResolverError> {
        self.layout
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ResolverError::Transport("connection refused".into()))
    }

    async fn post_report(&self, batch: &ReportBatch) -> Result<(), ResolverError> {
        self.upload_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(ResolverError::Status {
                status: 503,
                message: "maintenance".into(),
            });
        }
        self.uploads.lock().unwrap().push(batch.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<Duration, ResolverError> {
        Ok(Duration::from_millis(20))
    }
}

/// An engine plus the collaborators tests inspect.
pub struct Harness {
    pub engine: Arc<Engine>,
    pub resolver: Arc<FakeResolver>,
    pub registry: Arc<RegionRegistry>,
    pub storage: Arc<MemoryStorage>,
    pub actions: broadcast::Receiver<ActionFired>,
}

impl Harness {
    /// Engine over fresh storage with `layout` already fetched.
    pub async fn with_layout(layout: LayoutSnapshot) -> Self {
        Self::start(Config::default(), Arc::new(MemoryStorage::new()), layout).await
    }

    /// Engine over existing storage, as after a restart.
    pub async fn start(config: Config, storage: Arc<MemoryStorage>, layout: LayoutSnapshot) -> Self {
        let resolver = FakeResolver::serving(layout);
        let registry = Arc::new(RegionRegistry::new());
        let engine = Arc::new(
            Engine::new(
                config,
                Arc::clone(&storage) as Arc<dyn Storage>,
                resolver.clone(),
                registry.clone(),
            )
            .unwrap(),
        );
        let actions = engine.subscribe_actions();
        engine.request_layout().await.unwrap();

        Self {
            engine,
            resolver,
            registry,
            storage,
            actions,
        }
    }

    /// Every action fired so far.
    pub fn drain_actions(&mut self) -> Vec<ActionFired> {
        let mut fired = Vec::new();
        while let Ok(action) = self.actions.try_recv() {
            fired.push(action);
        }
        fired
    }
}

pub fn beacon(minor: u16) -> BeaconId {
    BeaconId::parse(&format!("{GROUP}00001{minor:05}")).unwrap()
}

pub fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 14, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

pub fn rule(id: &str, kind: TriggerKind) -> TriggerRule {
    TriggerRule::new(id, kind, [beacon(1)])
}

pub fn layout_with(rules: Vec<TriggerRule>) -> LayoutSnapshot {
    LayoutSnapshot {
        monitored_beacon_groups: vec![GROUP.to_string()],
        rules,
        version: Some("test".into()),
        ..LayoutSnapshot::default()
    }
}
