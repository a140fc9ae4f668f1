//! HTTP control surface for the worker.
//!
//! | Method | Path                 | Action                          |
//! |--------|----------------------|---------------------------------|
//! | POST   | `/stream/start`      | `StreamRegistry::start`         |
//! | POST   | `/stream/stop/{id}`  | `StreamRegistry::stop`          |
//! | GET    | `/stream/status`     | `StreamRegistry::status`        |
//! | GET    | `/health`            | liveness probe                  |
//! | GET    | `/snapshots/*`       | files under the storage path    |
//!
//! Handlers translate between JSON and the registry; the registry never
//! sees HTTP types.

use std::io;
use std::path::Path;

use axum::routing::{get, post};
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::registry::StreamRegistry;

mod handlers;

pub use handlers::{ApiError, MessageBody};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("server error: {0}")]
    Serve(#[from] io::Error),
}

/// Shared state handed to every handler.
#[derive(Clone, Debug)]
pub struct AppState {
    pub registry: StreamRegistry,
}

/// Builds the router. Snapshots are served from `snapshot_dir`.
pub fn router(registry: StreamRegistry, snapshot_dir: &Path) -> Router {
    Router::new()
        .route("/stream/start", post(handlers::start_stream))
        .route("/stream/stop/{id}", post(handlers::stop_stream))
        .route("/stream/status", get(handlers::stream_status))
        .route("/health", get(handlers::health))
        .nest_service("/snapshots", ServeDir::new(snapshot_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { registry })
}

pub async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
        addr: addr.to_string(),
        source: e,
    })
}

/// Serves `router` until `shutdown` is cancelled, then drains in-flight
/// requests.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "HTTP server listening");
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}
