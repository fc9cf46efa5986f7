//! Resolver boundary.
//!
//! The resolver is the backend that issues layouts and accepts report
//! batches. The engine only sees this trait; the HTTP implementation lives in
//! the host daemon.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::layout::LayoutSnapshot;
use crate::reports::ReportBatch;

/// Failures talking to the resolver.
#[derive(Debug, Clone, Error)]
pub enum ResolverError {
    /// The request never produced a response.
    #[error("resolver request failed: {0}")]
    Transport(String),

    /// The resolver answered with a non-success status.
    #[error("resolver returned HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// The response body was not what was expected.
    #[error("could not decode resolver response: {0}")]
    Decode(String),

    /// The request exceeded its deadline.
    #[error("resolver did not answer within {0:?}")]
    Timeout(Duration),
}

/// Backend that issues layouts and receives reports.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Fetch the current layout.
    async fn get_layout(&self) -> Result<LayoutSnapshot, ResolverError>;

    /// Upload a report batch; `Ok` means the resolver acknowledged it.
    async fn post_report(&self, batch: &ReportBatch) -> Result<(), ResolverError>;

    /// Round-trip a lightweight request and return its latency.
    async fn ping(&self) -> Result<Duration, ResolverError>;
}
