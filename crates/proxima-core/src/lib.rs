//! # proxima-core
//!
//! Action resolution engine for beacon-driven campaigns.
//!
//! This crate provides:
//! - Rule matching of proximity events against a resolver-issued layout
//! - Suppression and once-only gating backed by a persistent ledger
//! - Immediate and delayed delivery of campaign actions
//! - A durable, bounded report queue flushed to the resolver
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`beacon`] - Beacon identifiers and proximity events from the platform
//! - [`layout`] - Trigger rules, timeframes and the layout snapshot model
//! - [`layout_store`] - Active layout, cache fallback and region hand-off
//! - [`matcher`] - Pure matching of events to candidate rules
//! - [`ledger`] - Suppression windows and the ever-fired set
//! - [`scheduler`] - Immediate and timer-based delivery of admitted matches
//! - [`reports`] - Monitor/action report batching, persistence and flushing
//! - [`engine`] - Wiring of all components, lifecycle and background loops
//! - [`resolver`] - Boundary trait for the backend resolver
//! - [`platform`] - Boundary trait for region monitoring, authorization and radio state
//! - [`storage`] - Persistent blob storage for layout, ledger and reports
//! - [`config`] - Configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod beacon;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod layout;
pub mod layout_store;
pub mod ledger;
pub mod matcher;
pub mod platform;
pub mod reports;
pub mod resolver;
pub mod scheduler;
pub mod storage;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export primary types for convenience
pub use beacon::{BeaconId, BeaconIdError, ProximityEvent, ProximityKind};
pub use config::{
    is_valid_listen_addr, is_valid_resolver_url, Config, ConfigError, ConfigResult, LedgerConfig,
    ReportsConfig, ResetPolicy, ResolverConfig, ServerConfig, StorageConfig,
};
pub use engine::{BackgroundTasks, Engine, EngineStatus, IngestOutcome, ResetSummary};
pub use error::{ProximaError, Result};
pub use events::{ActionFired, FiringRecord, Trigger};
pub use layout::{
    ActionKind, Content, LayoutSnapshot, Timeframe, TriggerKind, TriggerRule, MAX_RULE_SECONDS,
};
pub use layout_store::{FetchOutcome, LayoutSource, LayoutStore};
pub use ledger::{Admission, Ledger, LedgerKey, OnceScope};
pub use platform::{
    AvailabilityStatus, BluetoothStatus, LocationAuthorization, PlatformMonitor, RegionRegistry,
};
pub use reports::{
    ActionReport, FlushOutcome, MonitorRecord, ReportBatch, ReportQueue, ReportQueueStats,
    ReportStatus,
};
pub use resolver::{Resolver, ResolverError};
pub use scheduler::{DeliveryScheduler, ScheduleOutcome};
pub use storage::{default_data_dir, FileStorage, MemoryStorage, Storage, StorageError};

/// Locks a std mutex, recovering the guard if a previous holder panicked.
///
/// Every table guarded this way is left consistent between statements, so a
/// poisoned lock carries no torn state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
