//! Engine configuration management.
//!
//! Handles loading, saving, and validating proxima configuration including:
//! - Resolver endpoint, API key and request timeout
//! - Report queue bounds, flush cadence and retry backoff
//! - Once-only scoping of the firing ledger
//! - Data directory for persisted state
//! - Listen address of the host daemon
//!
//! Values are layered: built-in defaults, then the TOML file, then
//! `PROXIMA_<SECTION>__<KEY>` environment variables.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::OnceScope;

/// Environment variable that overrides the configuration file location.
pub const CONFIG_PATH_ENV: &str = "PROXIMA_CONFIG";

/// Prefix of environment variables that override individual settings.
pub const ENV_PREFIX: &str = "PROXIMA";

static RESOLVER_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://[^\s/?#]+(/[^\s]*)?$").expect("static regex is valid"));

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The configuration file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    ReadError {
        /// File being read.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },

    /// The configuration file could not be written.
    #[error("failed to write {}: {source}", .path.display())]
    WriteError {
        /// File being written.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },

    /// The layered sources could not be merged or deserialized.
    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// The configuration could not be rendered as TOML.
    #[error("failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field holds an invalid value.
    #[error("invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} configuration fields are invalid", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend resolver settings.
    pub resolver: ResolverConfig,

    /// Report queue settings.
    pub reports: ReportsConfig,

    /// Firing ledger settings.
    pub ledger: LedgerConfig,

    /// Persistence settings.
    pub storage: StorageConfig,

    /// Host daemon settings.
    pub server: ServerConfig,
}

/// Resolver endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Base URL; the layout lives at `{base_url}/layout`.
    pub base_url: String,

    /// Key sent in the `X-Api-Key` header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Per-request timeout for layout fetches and pings.
    pub timeout_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: "https://resolver.proxima.example/api/v2".to_string(),
            api_key: None,
            timeout_secs: 15,
        }
    }
}

impl ResolverConfig {
    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// What `reset` does with reports that are still queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Try one immediate flush; anything unsent stays queued.
    #[default]
    Flush,
    /// Drop everything queued.
    Discard,
}

/// Report queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportsConfig {
    /// Upper bound on queued monitor events plus action reports.
    pub max_records: usize,

    /// Periodic flush interval, unless the layout carries its own.
    pub flush_interval_secs: u64,

    /// Timeout applied to a single report upload.
    pub flush_timeout_secs: u64,

    /// First retry delay after a failed upload.
    pub retry_base_secs: u64,

    /// Ceiling for the exponential retry delay.
    pub retry_max_secs: u64,

    /// Handling of queued reports on reset.
    pub reset_policy: ResetPolicy,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            max_records: 1000,
            flush_interval_secs: 300,
            flush_timeout_secs: 20,
            retry_base_secs: 5,
            retry_max_secs: 600,
            reset_policy: ResetPolicy::Flush,
        }
    }
}

impl ReportsConfig {
    /// Upload timeout as a [`Duration`].
    #[must_use]
    pub const fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }

    /// Periodic flush interval as a [`Duration`].
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Firing ledger configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Granularity of `sendOnlyOnce`.
    pub once_scope: OnceScope,
}

/// Persistence configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for persisted state; platform default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Effective data directory.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(crate::storage::default_data_dir)
    }
}

/// Host daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the HTTP surface binds to.
    pub listen_addr: String,

    /// Production mode: JSON file logs instead of pretty stdout.
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            production: false,
        }
    }
}

impl Config {
    /// Load configuration from `path`, layered over defaults and under
    /// `PROXIMA_*` environment overrides. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or the merged values are invalid.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed.
    pub fn load_default() -> ConfigResult<Self> {
        Self::load(&Self::config_path())
    }

    /// Load configuration from a file that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] when the file is missing.
    pub fn load_required(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::load(path)
    }

    /// Save configuration to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get the configuration file path.
    #[must_use]
    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        // On the gateway: /etc/proxima/config.toml
        // For development: ~/.config/proxima/config.toml
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/etc/proxima/config.toml")
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "proxima").map_or_else(
                || PathBuf::from("proxima.toml"),
                |dirs| dirs.config_dir().join("config.toml"),
            )
        }
    }

    /// Check every field and collect all problems.
    ///
    /// # Errors
    ///
    /// Returns the single failing field, or [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut reject = |field: &str, message: &str| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message: message.to_string(),
            });
        };

        if !is_valid_resolver_url(&self.resolver.base_url) {
            reject("resolver.base_url", "must be an http(s) URL");
        }
        if self.resolver.timeout_secs == 0 {
            reject("resolver.timeout_secs", "must be greater than zero");
        }
        if self.reports.max_records == 0 {
            reject("reports.max_records", "must be greater than zero");
        }
        if self.reports.flush_interval_secs == 0 {
            reject("reports.flush_interval_secs", "must be greater than zero");
        }
        if self.reports.flush_timeout_secs == 0 {
            reject("reports.flush_timeout_secs", "must be greater than zero");
        }
        if self.reports.retry_base_secs == 0 {
            reject("reports.retry_base_secs", "must be greater than zero");
        }
        if self.reports.retry_base_secs > self.reports.retry_max_secs {
            reject(
                "reports.retry_max_secs",
                "must not be smaller than reports.retry_base_secs",
            );
        }
        if !is_valid_listen_addr(&self.server.listen_addr) {
            reject("server.listen_addr", "must be a socket address like 0.0.0.0:3000");
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// Returns `true` if `url` looks like an http(s) resolver endpoint.
#[must_use]
pub fn is_valid_resolver_url(url: &str) -> bool {
    RESOLVER_URL.is_match(url)
}

/// Returns `true` if `addr` parses as a socket address.
#[must_use]
pub fn is_valid_listen_addr(addr: &str) -> bool {
    addr.parse::<SocketAddr>().is_ok()
}
