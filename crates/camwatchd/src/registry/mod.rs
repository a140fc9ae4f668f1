//! Stream registry: the set of active camera sessions.
//!
//! The registry is the only component that creates and removes stream
//! sessions. It enforces the capacity bound, rejects duplicates, opens the
//! capture with retry and supervises every frame loop it spawns.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  start/stop/status   ┌──────────────────┐
//! │ HTTP handlers│─────────────────────▶│  StreamRegistry  │
//! └──────────────┘                      │ RwLock<HashMap<  │
//!                                       │  CameraId, Slot>>│
//!                                       └────────┬─────────┘
//!                                                │ spawn per session
//!                                                ▼
//!                         supervisor ──▶ run_frame_loop ──▶ FrameProcessor
//!                             │
//!                             └─ read failures / panic ──▶ remove_session
//! ```
//!
//! # Removal
//!
//! `stop`, `shutdown_all` and a loop's self-cleanup all go through one
//! check-and-remove under the registry write lock. Whoever removes the
//! entry owns the teardown, so a session's capture and publisher are
//! released exactly once no matter which paths race.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - A panicking frame loop is caught by its supervisor and cleaned up
//! - No registry lock is held across capture, publisher or network I/O

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use camwatch_core::{CameraId, CameraSpec, CaptureHandle, CaptureSource};

use crate::processor::FrameProcessor;
use crate::publisher::{self, PublisherConfig};
use crate::task::panic_message;

mod error;
pub mod session;

pub use error::{RemovalReason, StartError, StopError};
pub use session::{
    run_frame_loop, LoopExit, StreamSession, StreamStatus, MAX_CONSECUTIVE_READ_ERRORS,
    READ_RETRY_DELAY,
};

/// Default maximum number of concurrent streams.
pub const DEFAULT_MAX_STREAMS: usize = 4;

/// Capture open attempts before a start gives up.
pub const DEFAULT_OPEN_ATTEMPTS: u32 = 3;

/// Backoff unit between open attempts; attempt `n` waits `n * unit`.
pub const DEFAULT_OPEN_BACKOFF: Duration = Duration::from_secs(1);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_streams: usize,
    pub open_attempts: u32,
    pub open_backoff: Duration,
    /// Encoder profile; `None` disables republishing.
    pub publisher: Option<PublisherConfig>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            open_attempts: DEFAULT_OPEN_ATTEMPTS,
            open_backoff: DEFAULT_OPEN_BACKOFF,
            publisher: None,
        }
    }
}

// ============================================================================
// Registry State
// ============================================================================

/// A registry entry. `Opening` holds the camera's place (and a unit of
/// capacity) while its capture is opened outside the lock.
enum Slot {
    Opening,
    Active(Arc<StreamSession>),
}

struct Streams {
    slots: HashMap<CameraId, Slot>,
    /// Set by `shutdown_all`; no new sessions after that.
    closed: bool,
}

struct Inner {
    config: RegistryConfig,
    capture: Arc<dyn CaptureSource>,
    processor: Arc<FrameProcessor>,
    streams: RwLock<Streams>,
}

// ============================================================================
// Stream Registry
// ============================================================================

/// Cheap-to-clone handle to the shared registry.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<Inner>,
}

impl StreamRegistry {
    pub fn new(
        config: RegistryConfig,
        capture: Arc<dyn CaptureSource>,
        processor: Arc<FrameProcessor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                capture,
                processor,
                streams: RwLock::new(Streams {
                    slots: HashMap::new(),
                    closed: false,
                }),
            }),
        }
    }

    pub fn max_streams(&self) -> usize {
        self.inner.config.max_streams
    }

    /// Starts a stream session for `camera`.
    ///
    /// Returns once the capture is open and the frame loop is running.
    ///
    /// # Errors
    ///
    /// - `StartError::InvalidSpec` if the spec has no source URL or an id that
    ///   is blank or not `[A-Za-z0-9_-]`; checked before anything else
    /// - `StartError::CapacityExceeded` if `max_streams` sessions exist or are opening
    /// - `StartError::AlreadyRunning` if the camera already has a session
    /// - `StartError::SourceUnreachable` if every open attempt failed
    /// - `StartError::ShuttingDown` if `shutdown_all` ran first
    pub async fn start(&self, camera: CameraSpec) -> Result<(), StartError> {
        self.reserve(&camera).await?;

        let capture = match self.open_with_retry(&camera).await {
            Ok(capture) => capture,
            Err(e) => {
                self.release(&camera.id).await;
                return Err(e);
            }
        };

        let session = Arc::new(StreamSession::new(camera, capture));

        // Attached before the session is visible, so a concurrent stop
        // always finds the publisher it has to tear down.
        if let Some(config) = &self.inner.config.publisher {
            match publisher::start(config, session.id()) {
                Ok(handle) => session.attach_publisher(handle),
                Err(e) => warn!(
                    camera_id = %session.id(),
                    error = %e,
                    "Failed to start publisher, continuing without republishing"
                ),
            }
        }

        if !self.activate(&session).await {
            session.teardown().await;
            return Err(StartError::ShuttingDown);
        }

        let supervisor = self.spawn_supervisor(Arc::clone(&session));
        session.set_loop_task(supervisor);

        info!(
            camera_id = %session.id(),
            camera_name = %session.camera().name,
            url = %session.camera().rtsp_url,
            "Stream started"
        );
        Ok(())
    }

    /// Stops the session for `id` and releases its resources.
    ///
    /// Does not wait for the frame loop to exit; the loop observes the
    /// cancellation at its next iteration.
    ///
    /// # Errors
    ///
    /// - `StopError::NotFound` if no active session exists for `id`
    pub async fn stop(&self, id: &CameraId) -> Result<(), StopError> {
        if self.remove_session(id, None, RemovalReason::Explicit).await {
            Ok(())
        } else {
            Err(StopError::NotFound(id.clone()))
        }
    }

    /// Snapshot of every active session.
    pub async fn status(&self) -> HashMap<CameraId, StreamStatus> {
        let streams = self.inner.streams.read().await;
        streams
            .slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Active(session) => Some((id.clone(), session.status())),
                Slot::Opening => None,
            })
            .collect()
    }

    /// The active session for `id`. Sessions still opening are not returned.
    pub async fn session(&self, id: &CameraId) -> Option<Arc<StreamSession>> {
        match self.inner.streams.read().await.slots.get(id) {
            Some(Slot::Active(session)) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    /// Number of sessions that are active or still opening.
    pub async fn len(&self) -> usize {
        self.inner.streams.read().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stops every session and refuses new ones.
    ///
    /// Returns once every session has released its resources and its loop
    /// has exited, or once `cap` has elapsed.
    pub async fn shutdown_all(&self, cap: Duration) {
        let sessions: Vec<Arc<StreamSession>> = {
            let mut streams = self.inner.streams.write().await;
            streams.closed = true;
            streams
                .slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Active(session) => Some(session),
                    Slot::Opening => None,
                })
                .collect()
        };

        if sessions.is_empty() {
            debug!("No streams to stop");
            return;
        }

        info!(count = sessions.len(), "Stopping all streams");

        for session in &sessions {
            session.cancel();
        }

        let mut releasing = JoinSet::new();
        for session in sessions {
            releasing.spawn(async move {
                session.teardown().await;
                if let Some(supervisor) = session.take_loop_task() {
                    let _ = supervisor.await;
                }
                info!(
                    camera_id = %session.id(),
                    reason = %RemovalReason::Shutdown,
                    "Stream removed"
                );
            });
        }

        let drained = tokio::time::timeout(cap, async {
            while releasing.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                cap_ms = cap.as_millis() as u64,
                remaining = releasing.len(),
                "Shutdown cap expired before every stream was released"
            );
        } else {
            info!("All streams stopped");
        }
    }

    // ------------------------------------------------------------------------
    // Start helpers
    // ------------------------------------------------------------------------

    /// Validates the spec, then atomic check-and-reserve: capacity, then
    /// duplicate.
    async fn reserve(&self, camera: &CameraSpec) -> Result<(), StartError> {
        camera.validate()?;

        let mut streams = self.inner.streams.write().await;

        if streams.closed {
            return Err(StartError::ShuttingDown);
        }
        if streams.slots.len() >= self.inner.config.max_streams {
            return Err(StartError::CapacityExceeded {
                max: self.inner.config.max_streams,
            });
        }
        if streams.slots.contains_key(&camera.id) {
            return Err(StartError::AlreadyRunning(camera.id.clone()));
        }

        streams.slots.insert(camera.id.clone(), Slot::Opening);
        Ok(())
    }

    /// Drops an `Opening` reservation.
    async fn release(&self, id: &CameraId) {
        let mut streams = self.inner.streams.write().await;
        if matches!(streams.slots.get(id), Some(Slot::Opening)) {
            streams.slots.remove(id);
        }
    }

    /// Swaps the reservation for the live session. Fails if the
    /// reservation was drained by `shutdown_all` in the meantime.
    async fn activate(&self, session: &Arc<StreamSession>) -> bool {
        let mut streams = self.inner.streams.write().await;
        if streams.closed || !matches!(streams.slots.get(session.id()), Some(Slot::Opening)) {
            return false;
        }
        streams
            .slots
            .insert(session.id().clone(), Slot::Active(Arc::clone(session)));
        true
    }

    async fn open_with_retry(&self, camera: &CameraSpec) -> Result<Arc<dyn CaptureHandle>, StartError> {
        let attempts = self.inner.config.open_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.inner.capture.open(&camera.rtsp_url).await {
                Ok(handle) if handle.is_opened() => {
                    debug!(camera_id = %camera.id, attempt, "Capture opened");
                    return Ok(handle);
                }
                Ok(handle) => {
                    handle.close().await;
                    last_error = "source did not open".to_string();
                }
                Err(e) => last_error = e.to_string(),
            }

            if attempt < attempts {
                let backoff = self.inner.config.open_backoff * attempt;
                warn!(
                    camera_id = %camera.id,
                    attempt,
                    max_attempts = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %last_error,
                    "Failed to open stream, retrying"
                );
                sleep(backoff).await;
            }
        }

        warn!(camera_id = %camera.id, attempts, error = %last_error, "Giving up on stream");
        Err(StartError::SourceUnreachable {
            camera_id: camera.id.clone(),
            attempts,
            reason: last_error,
        })
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    /// Check-and-remove under the write lock. With `only` set, the entry is
    /// removed only if it still is that exact session.
    async fn take_session(
        &self,
        id: &CameraId,
        only: Option<&Arc<StreamSession>>,
    ) -> Option<Arc<StreamSession>> {
        let mut streams = self.inner.streams.write().await;

        match streams.slots.get(id) {
            Some(Slot::Active(current)) if only.map_or(true, |s| Arc::ptr_eq(s, current)) => {}
            _ => return None,
        }

        match streams.slots.remove(id) {
            Some(Slot::Active(session)) => Some(session),
            _ => None,
        }
    }

    /// Removes and tears down a session. Returns false if another path
    /// already removed it.
    async fn remove_session(
        &self,
        id: &CameraId,
        only: Option<&Arc<StreamSession>>,
        reason: RemovalReason,
    ) -> bool {
        let Some(session) = self.take_session(id, only).await else {
            return false;
        };

        session.teardown().await;
        info!(
            camera_id = %id,
            reason = %reason,
            frames = session.frame_count(),
            "Stream removed"
        );
        true
    }

    /// Runs the frame loop on its own task and cleans up after it if it
    /// ends for any reason other than cancellation.
    fn spawn_supervisor(&self, session: Arc<StreamSession>) -> JoinHandle<()> {
        let registry = self.clone();
        let processor = Arc::clone(&self.inner.processor);

        tokio::spawn(async move {
            let frame_loop = tokio::spawn(run_frame_loop(Arc::clone(&session), processor));

            let reason = match frame_loop.await {
                Ok(LoopExit::Cancelled) => None,
                Ok(LoopExit::ReadFailures(_)) => Some(RemovalReason::ReadFailures),
                Err(e) if e.is_panic() => {
                    error!(
                        camera_id = %session.id(),
                        panic = %panic_message(e),
                        "Frame loop panicked"
                    );
                    Some(RemovalReason::Faulted)
                }
                Err(_) => Some(RemovalReason::Faulted),
            };

            if let Some(reason) = reason {
                let id = session.id().clone();
                registry.remove_session(&id, Some(&session), reason).await;
            }
        })
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("max_streams", &self.inner.config.max_streams)
            .finish_non_exhaustive()
    }
}
