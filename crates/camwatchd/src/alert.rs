//! Detection alert delivery.
//!
//! `AlertDispatcher` is the HTTP `AlertSink` posting events to the backend.
//! `dispatch_detached` is how the frame processor hands an event off: one
//! guarded task per event, failures logged, nothing awaited by the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use camwatch_core::{AlertError, AlertSink, DetectionEvent};

use crate::task::spawn_guarded;

/// Path appended to the backend URL.
const ALERTS_PATH: &str = "/api/alerts";

/// Posts detection events as JSON to `{backend}/api/alerts`.
#[derive(Debug, Clone)]
pub struct AlertDispatcher {
    client: Client,
    endpoint: String,
}

impl AlertDispatcher {
    /// Creates a dispatcher whose requests give up after `timeout`.
    pub fn new(backend_url: &str, timeout: Duration) -> Result<Self, AlertError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}{ALERTS_PATH}", backend_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AlertSink for AlertDispatcher {
    async fn send(&self, event: &DetectionEvent) -> Result<(), AlertError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(event)
            .send()
            .await
            .map_err(|e| AlertError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AlertError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(camera_id = %event.camera_id, status = status.as_u16(), "Backend accepted alert");
        Ok(())
    }
}

/// Sends `event` on a detached, panic-guarded task.
///
/// The returned handle is only useful to tests; production callers drop it.
pub fn dispatch_detached(sink: Arc<dyn AlertSink>, event: DetectionEvent) -> JoinHandle<()> {
    spawn_guarded("alert", async move {
        match sink.send(&event).await {
            Ok(()) => info!(
                camera_id = %event.camera_id,
                face_count = event.metadata.face_count,
                snapshot_url = %event.snapshot_url,
                "Alert sent"
            ),
            Err(e) => warn!(
                camera_id = %event.camera_id,
                error = %e,
                "Failed to send alert"
            ),
        }
    })
}
