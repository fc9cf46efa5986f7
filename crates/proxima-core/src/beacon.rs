//! Beacon identifiers and proximity events.
//!
//! A beacon is addressed by its proximity UUID, major and minor. The engine
//! works with the 42-character concatenation `<32 hex uuid><5 digit major><5
//! digit minor>`, which is also how layouts and reports spell it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

static BEACON_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]{32}[0-9]{5}[0-9]{5}$").expect("static regex is valid"));

/// Errors produced when parsing a [`BeaconId`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BeaconIdError {
    /// Not 32 hex digits followed by two 5-digit numbers.
    #[error("'{0}' is not a 42-character beacon id")]
    Malformed(String),

    /// Major or minor exceeds 65535.
    #[error("'{0}' has a major or minor outside 0..=65535")]
    OutOfRange(String),
}

/// Canonical beacon identifier (lowercase, no hyphens).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BeaconId(String);

impl BeaconId {
    /// Parse an identifier, accepting uppercase and UUID hyphens.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconIdError`] if the input is not a valid beacon id.
    pub fn parse(input: &str) -> Result<Self, BeaconIdError> {
        let canonical: String = input
            .trim()
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        if !BEACON_ID.is_match(&canonical) {
            return Err(BeaconIdError::Malformed(input.to_string()));
        }
        let in_range = |digits: &str| digits.parse::<u32>().is_ok_and(|n| n <= u32::from(u16::MAX));
        if !in_range(&canonical[32..37]) || !in_range(&canonical[37..42]) {
            return Err(BeaconIdError::OutOfRange(input.to_string()));
        }
        Ok(Self(canonical))
    }

    /// Build an identifier from its parts.
    #[must_use]
    pub fn from_parts(proximity_uuid: Uuid, major: u16, minor: u16) -> Self {
        Self(format!("{}{major:05}{minor:05}", proximity_uuid.simple()))
    }

    /// The proximity UUID shared by a beacon group.
    #[must_use]
    pub fn proximity_uuid(&self) -> Uuid {
        Uuid::parse_str(&self.0[..32]).unwrap_or_default()
    }

    /// The proximity UUID in its 32-character hex form, as listed in layouts.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.0[..32]
    }

    /// Major number.
    #[must_use]
    pub fn major(&self) -> u16 {
        self.0[32..37].parse().unwrap_or_default()
    }

    /// Minor number.
    #[must_use]
    pub fn minor(&self) -> u16 {
        self.0[37..42].parse().unwrap_or_default()
    }

    /// Canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BeaconId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BeaconId {
    type Err = BeaconIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BeaconId {
    type Error = BeaconIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BeaconId> for String {
    fn from(id: BeaconId) -> Self {
        id.0
    }
}

/// Kind of transition reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProximityKind {
    /// The device entered the beacon's region.
    Enter,
    /// The device left the beacon's region.
    Exit,
    /// A ranging sample inside a region; never triggers rules.
    RangeUpdate,
}

impl ProximityKind {
    /// Numeric trigger used on the wire: 1 for enter, 2 for exit.
    #[must_use]
    pub const fn wire_code(self) -> Option<u8> {
        match self {
            Self::Enter => Some(1),
            Self::Exit => Some(2),
            Self::RangeUpdate => None,
        }
    }
}

impl fmt::Display for ProximityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enter => write!(f, "enter"),
            Self::Exit => write!(f, "exit"),
            Self::RangeUpdate => write!(f, "range_update"),
        }
    }
}

/// A proximity transition delivered by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityEvent {
    /// Beacon that was seen.
    pub beacon_id: BeaconId,

    /// Transition kind.
    pub kind: ProximityKind,

    /// When the platform observed the transition.
    pub observed_at: DateTime<Utc>,

    /// Estimated distance in metres; reported, never matched on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,

    /// Received signal strength; reported, never matched on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,

    /// Geohash or free-form location tag attached by the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl ProximityEvent {
    /// Create an event without ranging data.
    #[must_use]
    pub const fn new(beacon_id: BeaconId, kind: ProximityKind, observed_at: DateTime<Utc>) -> Self {
        Self {
            beacon_id,
            kind,
            observed_at,
            accuracy: None,
            rssi: None,
            location: None,
        }
    }

    /// Region entry at `observed_at`.
    #[must_use]
    pub const fn enter(beacon_id: BeaconId, observed_at: DateTime<Utc>) -> Self {
        Self::new(beacon_id, ProximityKind::Enter, observed_at)
    }

    /// Region exit at `observed_at`.
    #[must_use]
    pub const fn exit(beacon_id: BeaconId, observed_at: DateTime<Utc>) -> Self {
        Self::new(beacon_id, ProximityKind::Exit, observed_at)
    }

    /// Attach a location tag.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Attach ranging data.
    #[must_use]
    pub const fn with_ranging(mut self, accuracy: Option<f64>, rssi: Option<i16>) -> Self {
        self.accuracy = accuracy;
        self.rssi = rssi;
        self
    }
}
