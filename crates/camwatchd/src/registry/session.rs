//! Per-camera stream session and its frame loop.
//!
//! A `StreamSession` owns everything one camera needs while it is active:
//! the capture handle, the cancellation token, the counters and the
//! optional publisher. The registry creates it once the capture is open
//! and is the only component that removes it.
//!
//! # Locking
//!
//! Mutable counters live behind a `std::sync::RwLock` scoped to this
//! session. The lock is only taken for field reads/writes, never across an
//! `.await`, so status snapshots never wait on frame I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use camwatch_core::{CameraId, CameraSpec, CaptureHandle};

use crate::processor::FrameProcessor;
use crate::publisher::PublisherHandle;

/// Consecutive failed reads after which a session terminates itself.
pub const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;

/// Pause between a failed read and the next attempt.
pub const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// Status Snapshot
// ============================================================================

/// Point-in-time view of one session, as reported by `StreamRegistry::status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatus {
    pub camera_id: CameraId,
    #[serde(rename = "camera_name")]
    pub name: String,
    #[serde(rename = "is_running")]
    pub running: bool,
    pub frame_count: u64,
    pub fps: f64,
    #[serde(rename = "uptime")]
    pub uptime_seconds: f64,
}

// ============================================================================
// Stream Session
// ============================================================================

/// Fields guarded by the per-session lock.
#[derive(Debug)]
struct SessionState {
    running: bool,
    frame_count: u64,
    last_alert: Option<Instant>,
    publisher: Option<Arc<PublisherHandle>>,
}

/// One camera's end-to-end processing pipeline.
pub struct StreamSession {
    camera: CameraSpec,
    capture: Arc<dyn CaptureHandle>,
    capture_closed: AtomicBool,
    cancel_token: CancellationToken,
    started_at: Instant,
    state: RwLock<SessionState>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    /// Creates a running session around an already opened capture.
    pub fn new(camera: CameraSpec, capture: Arc<dyn CaptureHandle>) -> Self {
        Self {
            camera,
            capture,
            capture_closed: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            started_at: Instant::now(),
            state: RwLock::new(SessionState {
                running: true,
                frame_count: 0,
                last_alert: None,
                publisher: None,
            }),
            loop_task: Mutex::new(None),
        }
    }

    pub fn camera(&self) -> &CameraSpec {
        &self.camera
    }

    pub fn id(&self) -> &CameraId {
        &self.camera.id
    }

    fn state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------------

    /// Signals the frame loop to exit at its next iteration.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    // ------------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------------

    /// Counts one accepted frame and returns the new total.
    pub fn record_frame(&self) -> u64 {
        let mut state = self.state_mut();
        state.frame_count += 1;
        state.frame_count
    }

    pub fn frame_count(&self) -> u64 {
        self.state().frame_count
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Average frames per second since the session started.
    pub fn fps(&self) -> f64 {
        fps(self.frame_count(), self.started_at.elapsed())
    }

    /// Builds a status snapshot.
    pub fn status(&self) -> StreamStatus {
        let (running, frame_count) = {
            let state = self.state();
            (state.running, state.frame_count)
        };
        let elapsed = self.started_at.elapsed();

        StreamStatus {
            camera_id: self.camera.id.clone(),
            name: self.camera.name.clone(),
            running,
            frame_count,
            fps: fps(frame_count, elapsed),
            uptime_seconds: elapsed.as_secs_f64(),
        }
    }

    /// Passes the alert throttle if at least `window` elapsed since the last
    /// claimed alert.
    ///
    /// The timestamp is recorded as soon as the check passes, before the
    /// alert is built, so overlapping frames cannot both claim it.
    pub fn try_claim_alert(&self, window: Duration, now: Instant) -> bool {
        let mut state = self.state_mut();
        let allowed = state
            .last_alert
            .map_or(true, |last| now.saturating_duration_since(last) >= window);
        if allowed {
            state.last_alert = Some(now);
        }
        allowed
    }

    // ------------------------------------------------------------------------
    // Publisher
    // ------------------------------------------------------------------------

    pub fn attach_publisher(&self, publisher: PublisherHandle) {
        self.state_mut().publisher = Some(Arc::new(publisher));
    }

    /// The attached publisher, live or not. A dead one stays attached
    /// until the frame loop notices and detaches it.
    pub fn publisher(&self) -> Option<Arc<PublisherHandle>> {
        self.state().publisher.as_ref().map(Arc::clone)
    }

    /// Drops the publisher handle if it is still `publisher`.
    ///
    /// Used once the encoder is known to have exited; its watcher reaps
    /// the process.
    pub fn detach_publisher(&self, publisher: &Arc<PublisherHandle>) {
        let mut state = self.state_mut();
        if state
            .publisher
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, publisher))
        {
            state.publisher = None;
        }
    }

    // ------------------------------------------------------------------------
    // Capture
    // ------------------------------------------------------------------------

    pub(crate) fn capture(&self) -> &Arc<dyn CaptureHandle> {
        &self.capture
    }

    /// Closes the capture handle. Only the first call reaches the handle;
    /// returns whether this call closed it.
    pub async fn close_capture(&self) -> bool {
        if self.capture_closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.capture.close().await;
        debug!(camera_id = %self.camera.id, "Capture closed");
        true
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub(crate) fn set_loop_task(&self, task: JoinHandle<()>) {
        *self.loop_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub(crate) fn take_loop_task(&self) -> Option<JoinHandle<()>> {
        self.loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Releases every resource the session owns.
    ///
    /// Order: cancel the loop, close the capture, stop the publisher.
    /// Safe to call more than once; later calls find nothing to release.
    pub async fn teardown(&self) {
        self.cancel();

        let publisher = {
            let mut state = self.state_mut();
            state.running = false;
            state.publisher.take()
        };

        self.close_capture().await;

        if let Some(publisher) = publisher {
            publisher.stop().await;
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("camera_id", &self.camera.id)
            .field("cancelled", &self.is_cancelled())
            .field("capture_closed", &self.capture_closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn fps(frame_count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        frame_count as f64 / secs
    } else {
        0.0
    }
}

// ============================================================================
// Frame Loop
// ============================================================================

/// How a frame loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The cancellation token fired; whoever cancelled owns teardown.
    Cancelled,

    /// Reads failed `MAX_CONSECUTIVE_READ_ERRORS` times in a row.
    ReadFailures(u32),
}

/// Runs the frame loop until cancellation or sustained read failure.
///
/// Cancellation is polled at the top of every iteration; a read in
/// progress is allowed to finish (bounded by the capture's read timeout).
/// The loop never closes the capture itself: the caller decides which
/// removal path applies based on the returned `LoopExit`.
pub async fn run_frame_loop(session: Arc<StreamSession>, processor: Arc<FrameProcessor>) -> LoopExit {
    let camera_id = session.id().clone();
    let mut consecutive_errors: u32 = 0;

    info!(camera_id = %camera_id, "Frame loop started");

    loop {
        if session.is_cancelled() {
            info!(camera_id = %camera_id, "Stream cancelled, frame loop exiting");
            return LoopExit::Cancelled;
        }

        match session.capture().read().await {
            Err(e) => {
                consecutive_errors += 1;
                warn!(
                    camera_id = %camera_id,
                    error = %e,
                    consecutive_errors,
                    max = MAX_CONSECUTIVE_READ_ERRORS,
                    "Failed to read frame"
                );

                if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    warn!(
                        camera_id = %camera_id,
                        "Too many consecutive read errors, stopping stream"
                    );
                    return LoopExit::ReadFailures(consecutive_errors);
                }

                sleep(READ_RETRY_DELAY).await;
            }
            Ok(frame) => {
                consecutive_errors = 0;

                if frame.is_empty() {
                    tokio::task::yield_now().await;
                    continue;
                }

                session.record_frame();
                processor.process(&session, frame).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use camwatch_core::{CaptureError, Frame};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingCapture {
        closes: AtomicUsize,
    }

    #[async_trait]
    impl CaptureHandle for CountingCapture {
        fn is_opened(&self) -> bool {
            true
        }

        async fn read(&self) -> Result<Frame, CaptureError> {
            Ok(Frame::empty())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session_with(capture: Arc<CountingCapture>) -> StreamSession {
        StreamSession::new(CameraSpec::new("cam-1", "Front", "rtsp://h/s"), capture)
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_throttle_window() {
        let session = session_with(Arc::new(CountingCapture::default()));
        let window = Duration::from_secs(5);
        let t0 = Instant::now();

        assert!(session.try_claim_alert(window, t0));
        assert!(!session.try_claim_alert(window, t0 + Duration::from_secs(1)));
        assert!(!session.try_claim_alert(window, t0 + Duration::from_millis(4999)));
        assert!(session.try_claim_alert(window, t0 + Duration::from_secs(6)));
        // window restarts from the last claimed alert
        assert!(!session.try_claim_alert(window, t0 + Duration::from_secs(10)));
        assert!(session.try_claim_alert(window, t0 + Duration::from_secs(11)));
    }

    #[tokio::test]
    async fn test_close_capture_once() {
        let capture = Arc::new(CountingCapture::default());
        let session = session_with(Arc::clone(&capture));

        assert!(session.close_capture().await);
        assert!(!session.close_capture().await);
        session.teardown().await;

        assert_eq!(capture.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_teardown_marks_stopped() {
        let session = session_with(Arc::new(CountingCapture::default()));
        assert!(session.is_running());
        assert!(!session.is_cancelled());

        session.teardown().await;

        assert!(!session.is_running());
        assert!(session.is_cancelled());
        assert!(session.publisher().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_snapshot() {
        let session = session_with(Arc::new(CountingCapture::default()));
        for _ in 0..20 {
            session.record_frame();
        }
        tokio::time::advance(Duration::from_secs(4)).await;

        let status = session.status();
        assert_eq!(status.camera_id.as_str(), "cam-1");
        assert_eq!(status.name, "Front");
        assert!(status.running);
        assert_eq!(status.frame_count, 20);
        assert!((status.fps - 5.0).abs() < 0.01, "fps was {}", status.fps);
        assert!((status.uptime_seconds - 4.0).abs() < 0.01);
    }

    #[test]
    fn test_fps_zero_elapsed() {
        assert_eq!(fps(10, Duration::ZERO), 0.0);
        assert_eq!(fps(10, Duration::from_secs(2)), 5.0);
    }

    #[test]
    fn test_status_serializes_wire_names() {
        let status = StreamStatus {
            camera_id: CameraId::new("cam-1"),
            name: "Front".to_string(),
            running: true,
            frame_count: 3,
            fps: 1.5,
            uptime_seconds: 2.0,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["camera_name"], "Front");
        assert_eq!(json["is_running"], true);
        assert_eq!(json["frame_count"], 3);
        assert_eq!(json["uptime"], 2.0);
    }
}
