//! Platform boundary: region monitoring, location authorization and the
//! Bluetooth radio state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::lock;

/// Region monitoring provided by the host platform.
pub trait PlatformMonitor: Send + Sync {
    /// Start monitoring the given beacon groups (proximity UUIDs).
    fn start_monitoring(&self, groups: &[String]);

    /// Stop monitoring everything.
    fn stop_monitoring(&self);
}

/// Location permission reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationAuthorization {
    /// The user has not been asked yet.
    #[default]
    NotDetermined,
    /// Blocked by policy.
    Restricted,
    /// The user declined.
    Denied,
    /// Monitoring is allowed.
    Authorized,
    /// Location services are off or absent.
    Unavailable,
}

impl LocationAuthorization {
    /// Returns `true` if region monitoring may run.
    #[must_use]
    pub const fn allows_monitoring(self) -> bool {
        matches!(self, Self::NotDetermined | Self::Authorized)
    }
}

/// Bluetooth radio state reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BluetoothStatus {
    /// Not reported yet.
    #[default]
    Unknown,
    /// The radio is off; no beacon can be seen.
    Off,
    /// The radio is on.
    On,
}

impl BluetoothStatus {
    /// Returns `true` unless the radio is known to be off.
    #[must_use]
    pub const fn allows_monitoring(self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// Overall health of the engine as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityStatus {
    /// Authorized, the radio is on and the resolver answered last time.
    FullyFunctional,
    /// The Bluetooth radio is off.
    BluetoothRestricted,
    /// Location permission blocks monitoring.
    AuthorizationRestricted,
    /// The resolver could not be reached last time.
    ReachabilityRestricted,
    /// Location services are unavailable on this device.
    BeaconsUnavailable,
}

impl AvailabilityStatus {
    /// Combine authorization, radio state and resolver reachability.
    ///
    /// The most fundamental restriction wins: missing location services,
    /// then the radio, then permission, then the network.
    #[must_use]
    pub const fn from_parts(
        authorization: LocationAuthorization,
        bluetooth: BluetoothStatus,
        resolver_reachable: bool,
    ) -> Self {
        match (authorization, bluetooth) {
            (LocationAuthorization::Unavailable, _) => Self::BeaconsUnavailable,
            (_, BluetoothStatus::Off) => Self::BluetoothRestricted,
            (LocationAuthorization::Denied | LocationAuthorization::Restricted, _) => {
                Self::AuthorizationRestricted
            }
            _ if resolver_reachable => Self::FullyFunctional,
            _ => Self::ReachabilityRestricted,
        }
    }
}

/// [`PlatformMonitor`] that remembers which groups are being monitored.
///
/// Hosts without a radio stack of their own expose this state to whatever
/// scanner feeds them events.
#[derive(Debug, Default)]
pub struct RegionRegistry {
    groups: Mutex<Vec<String>>,
    active: AtomicBool,
}

impl RegionRegistry {
    /// Create an idle registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Groups currently handed to monitoring.
    #[must_use]
    pub fn monitored_groups(&self) -> Vec<String> {
        lock(&self.groups).clone()
    }

    /// Returns `true` while monitoring is running.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl PlatformMonitor for RegionRegistry {
    fn start_monitoring(&self, groups: &[String]) {
        let mut current = lock(&self.groups);
        current.clear();
        current.extend_from_slice(groups);
        self.active.store(true, Ordering::SeqCst);
        tracing::info!(groups = groups.len(), "Region monitoring started");
    }

    fn stop_monitoring(&self) {
        lock(&self.groups).clear();
        self.active.store(false, Ordering::SeqCst);
        tracing::info!("Region monitoring stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_tracks_groups() {
        let registry = RegionRegistry::new();
        assert!(!registry.is_monitoring());

        registry.start_monitoring(&["7367672374000000ffff0000ffff0003".to_string()]);
        assert!(registry.is_monitoring());
        assert_eq!(registry.monitored_groups().len(), 1);

        registry.stop_monitoring();
        assert!(!registry.is_monitoring());
        assert!(registry.monitored_groups().is_empty());
    }

    #[test]
    fn test_availability() {
        use AvailabilityStatus as A;
        use BluetoothStatus as B;
        use LocationAuthorization as L;

        assert_eq!(A::from_parts(L::Authorized, B::On, true), A::FullyFunctional);
        assert_eq!(A::from_parts(L::Authorized, B::Unknown, true), A::FullyFunctional);
        assert_eq!(A::from_parts(L::Authorized, B::On, false), A::ReachabilityRestricted);
        assert_eq!(A::from_parts(L::Denied, B::On, true), A::AuthorizationRestricted);
        assert_eq!(A::from_parts(L::Restricted, B::On, true), A::AuthorizationRestricted);
        assert_eq!(A::from_parts(L::Unavailable, B::On, true), A::BeaconsUnavailable);
    }

    #[test]
    fn test_bluetooth_off_outranks_permission_and_network() {
        use AvailabilityStatus as A;
        use BluetoothStatus as B;
        use LocationAuthorization as L;

        assert_eq!(A::from_parts(L::Authorized, B::Off, true), A::BluetoothRestricted);
        assert_eq!(A::from_parts(L::Denied, B::Off, false), A::BluetoothRestricted);
        assert_eq!(A::from_parts(L::Unavailable, B::Off, true), A::BeaconsUnavailable);
    }

    #[test]
    fn test_monitoring_allowed() {
        assert!(LocationAuthorization::Authorized.allows_monitoring());
        assert!(LocationAuthorization::NotDetermined.allows_monitoring());
        assert!(!LocationAuthorization::Denied.allows_monitoring());
        assert!(!LocationAuthorization::Unavailable.allows_monitoring());
        assert!(BluetoothStatus::Unknown.allows_monitoring());
        assert!(!BluetoothStatus::Off.allows_monitoring());
    }
}
