//! # proxima-server
//!
//! Host daemon for the proxima beacon action engine.
//!
//! This binary provides:
//! - REST API for platform events, layout, reports and system status
//! - OpenAPI document at `/api/openapi.json`
//! - Background report uploads to the resolver
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package proxima-server
//!
//! # Production
//! PROXIMA_SERVER__PRODUCTION=true ./proxima-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;

use anyhow::Context;
use proxima_core::Config;
use proxima_server::{api, logging, AppState};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = Config::config_path();
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    logging::init(config.server.production)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting proxima-server"
    );

    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.server.listen_addr))?;

    let state = AppState::new(config)?;
    let engine = state.engine.clone();

    match engine.request_layout().await {
        Ok(outcome) => info!(source = ?outcome.source, rules = outcome.snapshot.rules.len(), "Layout ready"),
        Err(err) => warn!(error = %err, "No layout yet; events are queued until a refresh succeeds"),
    }

    let background = engine.spawn_background();
    let app = api::create_router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    engine.shutdown();
    background.join().await;
    match engine.flush_reports(true).await {
        Ok(outcome) => info!(?outcome, "Final report flush"),
        Err(err) => warn!(error = %err, "Final report flush failed; reports stay queued"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
