//! Unified error types for the proxima core library.
//!
//! This module provides a unified error type [`ProximaError`] that covers all failure
//! modes across the engine. Each module also has its own specific error types
//! (`ConfigError`, `ResolverError`, `StorageError`, `BeaconIdError`) for internal use.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Local recovery**: Network-facing failures are recovered with cache and backoff
//! - **Surfaced sparingly**: Only missing layouts and failed durable writes reach the host
//! - **HTTP-ready**: Error types include HTTP status codes and error codes
//!
//! # Example
//!
//! ```rust
//! use proxima_core::error::{ProximaError, Result};
//!
//! fn require_layout(available: bool) -> Result<()> {
//!     if !available {
//!         return Err(ProximaError::NoCacheAvailable);
//!     }
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all engine operations.
#[derive(Debug, Error)]
pub enum ProximaError {
    // =========================================================================
    // RESOLVER ERRORS
    // =========================================================================
    /// Fetching the layout failed (network, status or decode error).
    #[error("Layout fetch failed: {0}")]
    FetchFailed(String),

    /// No layout was ever fetched and no cached layout exists.
    #[error("No layout available: the resolver could not be reached and nothing is cached")]
    NoCacheAvailable,

    /// Sending a report batch failed; the batch is retained for a later flush.
    #[error("Report send failed: {0}")]
    ReportSendFailed(String),

    /// The resolver did not answer a ping.
    #[error("Resolver unreachable: {0}")]
    ResolverUnreachable(String),

    // =========================================================================
    // DELIVERY ERRORS
    // =========================================================================
    /// A delayed delivery was dropped because its rule left its timeframe.
    #[error("Delivery of rule '{rule_id}' dropped: timeframe closed before the delay elapsed")]
    TimerRaceDropped {
        /// Rule whose delivery was dropped.
        rule_id: String,
    },

    // =========================================================================
    // MODEL ERRORS
    // =========================================================================
    /// A beacon identifier could not be parsed.
    #[error("Invalid beacon id: {0}")]
    InvalidBeaconId(String),

    /// A layout violated a rule invariant and was rejected.
    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// State could not be durably written; the affected operation did not happen.
    #[error("Failed to persist '{key}': {message}")]
    StorageWriteFailed {
        /// Storage key that was being written.
        key: String,
        /// Underlying failure.
        message: String,
    },

    /// Persisted state could not be read back.
    #[error("Failed to read '{key}': {message}")]
    StorageReadFailed {
        /// Storage key that was being read.
        key: String,
        /// Underlying failure.
        message: String,
    },

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for engine operations.
pub type Result<T> = std::result::Result<T, ProximaError>;

impl ProximaError {
    /// Returns `true` if this error is related to talking to the resolver.
    #[inline]
    #[must_use]
    pub const fn is_network_error(&self) -> bool {
        matches!(
            self,
            Self::FetchFailed(_) | Self::ReportSendFailed(_) | Self::ResolverUnreachable(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_storage_error(&self) -> bool {
        matches!(
            self,
            Self::StorageWriteFailed { .. } | Self::StorageReadFailed { .. } | Self::IoError(_)
        )
    }

    /// Returns `true` if the engine reports this error to the embedding host.
    ///
    /// Everything else is recovered locally and only logged.
    #[inline]
    #[must_use]
    pub const fn is_surfaced(&self) -> bool {
        matches!(self, Self::NoCacheAvailable | Self::StorageWriteFailed { .. })
    }

    /// Returns `true` if this error is likely recoverable without user intervention.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::FetchFailed(_)
                | Self::ReportSendFailed(_)
                | Self::ResolverUnreachable(_)
                | Self::TimerRaceDropped { .. }
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::InvalidBeaconId(_) => 400,

            // 410 Gone - the delivery window closed
            Self::TimerRaceDropped { .. } => 410,

            // 422 Unprocessable Entity - semantic errors
            Self::InvalidLayout(_)
            | Self::ConfigParseError(_)
            | Self::ConfigValidationError(_) => 422,

            // 404 Not Found
            Self::ConfigNotFound(_) => 404,

            // 500 Internal Server Error - storage issues
            Self::StorageWriteFailed { .. } | Self::StorageReadFailed { .. } | Self::IoError(_) => {
                500
            }

            // 502 Bad Gateway - the resolver misbehaved
            Self::FetchFailed(_) | Self::ReportSendFailed(_) => 502,

            // 503 Service Unavailable - nothing to serve or resolver gone
            Self::NoCacheAvailable | Self::ResolverUnreachable(_) => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::FetchFailed(_) => "FETCH_FAILED",
            Self::NoCacheAvailable => "NO_CACHE_AVAILABLE",
            Self::ReportSendFailed(_) => "REPORT_SEND_FAILED",
            Self::ResolverUnreachable(_) => "RESOLVER_UNREACHABLE",
            Self::TimerRaceDropped { .. } => "TIMER_RACE_DROPPED",
            Self::InvalidBeaconId(_) => "INVALID_BEACON_ID",
            Self::InvalidLayout(_) => "INVALID_LAYOUT",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::StorageWriteFailed { .. } => "STORAGE_WRITE_FAILED",
            Self::StorageReadFailed { .. } => "STORAGE_READ_FAILED",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for ProximaError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::ReadError { path, source } => Self::StorageReadFailed {
                key: path.display().to_string(),
                message: source.to_string(),
            },
            ConfigError::WriteError { path, source } => Self::StorageWriteFailed {
                key: path.display().to_string(),
                message: source.to_string(),
            },
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::storage::StorageError> for ProximaError {
    fn from(err: crate::storage::StorageError) -> Self {
        use crate::storage::StorageError;
        match err {
            StorageError::Read { key, source } => Self::StorageReadFailed {
                key,
                message: source.to_string(),
            },
            StorageError::Decode { key, source } => Self::StorageReadFailed {
                key,
                message: source.to_string(),
            },
            StorageError::Write { key, source } => Self::StorageWriteFailed {
                key,
                message: source.to_string(),
            },
            StorageError::Encode { key, source } => Self::StorageWriteFailed {
                key,
                message: source.to_string(),
            },
        }
    }
}

impl From<crate::beacon::BeaconIdError> for ProximaError {
    fn from(err: crate::beacon::BeaconIdError) -> Self {
        Self::InvalidBeaconId(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
