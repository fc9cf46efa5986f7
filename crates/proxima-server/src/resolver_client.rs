//! HTTP client for the layout resolver.
//!
//! The resolver exposes three endpoints under its base URL:
//!
//! - `GET  {base}/layout` returns the current [`LayoutSnapshot`]
//! - `POST {base}/layout` accepts a [`ReportBatch`]
//! - `GET  {base}/ping` answers with any success status

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use proxima_core::{LayoutSnapshot, ReportBatch, Resolver, ResolverConfig, ResolverError};
use reqwest::{RequestBuilder, Response};
use tracing::debug;
use url::Url;

/// Header carrying the application key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// [`Resolver`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpResolver {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpResolver {
    /// Build a client from the resolver section of the config.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL does not parse or the TLS backend
    /// cannot be initialised.
    pub fn new(config: &ResolverConfig) -> anyhow::Result<Self> {
        let timeout = config.timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("proxima/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        // Url::join replaces the last path segment unless the base ends in '/'.
        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base)
            .with_context(|| format!("Invalid resolver base URL: {}", config.base_url))?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            timeout,
        })
    }

    /// Base URL every endpoint is resolved against.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ResolverError> {
        self.base_url
            .join(path)
            .map_err(|e| ResolverError::Transport(format!("invalid endpoint {path}: {e}")))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ResolverError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| self.classify(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .ok()
            .filter(|body| !body.is_empty())
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
        Err(ResolverError::Status {
            status: status.as_u16(),
            message,
        })
    }

    fn classify(&self, err: &reqwest::Error) -> ResolverError {
        if err.is_timeout() {
            ResolverError::Timeout(self.timeout)
        } else if err.is_decode() {
            ResolverError::Decode(err.to_string())
        } else {
            ResolverError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn get_layout(&self) -> Result<LayoutSnapshot, ResolverError> {
        let url = self.endpoint("layout")?;
        debug!(%url, "Fetching layout");

        let response = self.send(self.client.get(url)).await?;
        response
            .json::<LayoutSnapshot>()
            .await
            .map_err(|e| ResolverError::Decode(e.to_string()))
    }

    async fn post_report(&self, batch: &ReportBatch) -> Result<(), ResolverError> {
        let url = self.endpoint("layout")?;
        debug!(%url, records = batch.len(), "Posting report batch");

        self.send(self.client.post(url).json(batch)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<Duration, ResolverError> {
        let url = self.endpoint("ping")?;
        let started = Instant::now();
        self.send(self.client.get(url)).await?;
        Ok(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use chrono::Utc;
    use proxima_core::{BeaconId, TriggerKind, TriggerRule};
    use tokio::net::TcpListener;

    use super::*;

    const BEACON: &str = "7367672374000000ffff0000ffff00030000100001";

    #[derive(Clone, Default)]
    struct Upstream {
        received: Arc<Mutex<Vec<(Option<String>, ReportBatch)>>>,
    }

    fn layout() -> LayoutSnapshot {
        let beacon = BeaconId::parse(BEACON).unwrap();
        LayoutSnapshot {
            monitored_beacon_groups: vec![beacon.group().to_string()],
            rules: vec![TriggerRule::new("welcome", TriggerKind::OnEnter, [beacon])],
            ..LayoutSnapshot::default()
        }
    }

    async fn serve(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    async fn upstream() -> (SocketAddr, Upstream) {
        let state = Upstream::default();
        let router = Router::new()
            .route(
                "/api/v2/layout",
                get(|| async { Json(layout()) }).post(
                    |State(state): State<Upstream>,
                     headers: HeaderMap,
                     Json(batch): Json<ReportBatch>| async move {
                        let key = headers
                            .get(API_KEY_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        state.received.lock().unwrap().push((key, batch));
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .route("/api/v2/ping", get(|| async { StatusCode::OK }))
            .with_state(state.clone());
        (serve(router).await, state)
    }

    fn client(addr: SocketAddr, api_key: Option<&str>) -> HttpResolver {
        HttpResolver::new(&ResolverConfig {
            base_url: format!("http://{addr}/api/v2"),
            api_key: api_key.map(str::to_string),
            timeout_secs: 2,
        })
        .unwrap()
    }

    #[test]
    fn test_base_url_keeps_last_segment() {
        let resolver = HttpResolver::new(&ResolverConfig::default()).unwrap();
        assert_eq!(
            resolver.endpoint("layout").unwrap().as_str(),
            "https://resolver.proxima.example/api/v2/layout"
        );
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let config = ResolverConfig {
            base_url: "not a url".to_string(),
            ..ResolverConfig::default()
        };
        assert!(HttpResolver::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_get_layout_decodes_snapshot() {
        let (addr, _) = upstream().await;
        let fetched = client(addr, None).get_layout().await.unwrap();
        assert_eq!(fetched, layout());
    }

    #[tokio::test]
    async fn test_post_report_sends_api_key() {
        let (addr, upstream) = upstream().await;
        let batch = ReportBatch {
            device_timestamp: Utc::now(),
            monitor_events: Vec::new(),
            action_reports: Vec::new(),
        };

        client(addr, Some("secret")).post_report(&batch).await.unwrap();

        let received = upstream.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let router = Router::new().route(
            "/api/v2/layout",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        );
        let addr = serve(router).await;

        let err = client(addr, None).get_layout().await.unwrap_err();
        assert!(matches!(
            err,
            ResolverError::Status { status: 503, ref message } if message == "maintenance"
        ));
    }

    #[tokio::test]
    async fn test_malformed_layout_is_decode_error() {
        let router = Router::new().route("/api/v2/layout", get(|| async { "{not json" }));
        let addr = serve(router).await;

        let err = client(addr, None).get_layout().await.unwrap_err();
        assert!(matches!(err, ResolverError::Decode(_)));
    }

    #[tokio::test]
    async fn test_ping_measures_latency() {
        let (addr, _) = upstream().await;
        let latency = client(addr, None).ping().await.unwrap();
        assert!(latency < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_unreachable_resolver_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(addr, None).ping().await.unwrap_err();
        assert!(matches!(err, ResolverError::Transport(_)));
    }
}
