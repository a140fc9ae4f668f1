//! Per-frame pipeline: detect, annotate, alert, republish.
//!
//! ```text
//! Frame ─▶ to_gray ─▶ Detector ─▶ draw boxes + overlay
//!                                     │
//!                  detections? ──yes──┼─▶ throttle ─▶ SnapshotStore ─▶ dispatch_detached(AlertSink)
//!                                     │
//!                                     └─▶ PublisherHandle::write_frame
//! ```
//!
//! Nothing in here fails the session: every error is logged and the frame
//! loop moves on to the next frame.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

use camwatch_core::{
    AlertSink, Bgr, DetectionEvent, Detector, DomainResult, Frame, Region, SnapshotStore, GLYPH_SIZE,
};

use crate::alert::dispatch_detached;
use crate::publisher::PublisherError;
use crate::registry::session::StreamSession;

/// Minimum time between two alerts of the same camera.
pub const DEFAULT_ALERT_THROTTLE: Duration = Duration::from_secs(5);

const BOX_COLOR: Bgr = Bgr::GREEN;
const BOX_THICKNESS: u32 = 2;

/// Top-left corner of the first overlay line.
const OVERLAY_ORIGIN: (u32, u32) = (10, 10);
/// Font pixels per glyph pixel; 8x8 glyphs become 16x16.
const OVERLAY_SCALE: u32 = 2;
const OVERLAY_LINE_GAP: u32 = 8;

/// Shared by every session; holds the capabilities a frame needs.
pub struct FrameProcessor {
    detector: Arc<dyn Detector>,
    snapshots: Arc<dyn SnapshotStore>,
    alerts: Arc<dyn AlertSink>,
    throttle: Duration,
}

impl FrameProcessor {
    pub fn new(
        detector: Arc<dyn Detector>,
        snapshots: Arc<dyn SnapshotStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            detector,
            snapshots,
            alerts,
            throttle: DEFAULT_ALERT_THROTTLE,
        }
    }

    #[must_use]
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Runs the whole pipeline for one accepted frame.
    pub async fn process(&self, session: &StreamSession, mut frame: Frame) {
        let camera_id = session.id();

        let detections = match self.detector.detect(&frame.to_gray()).await {
            Ok(regions) => regions,
            Err(e) => {
                warn!(camera_id = %camera_id, error = %e, "Detection failed");
                Vec::new()
            }
        };

        annotate(&mut frame, &detections);

        let overlay = overlay_lines(&session.camera().name, session.fps(), detections.len());
        if let Err(e) = draw_overlay(&mut frame, &overlay) {
            warn!(camera_id = %camera_id, error = %e, "Failed to draw overlay");
        }

        if !detections.is_empty() && session.try_claim_alert(self.throttle, Instant::now()) {
            self.raise_alert(session, &frame, detections.len()).await;
        }

        forward_to_publisher(session, &frame).await;
    }

    async fn raise_alert(&self, session: &StreamSession, frame: &Frame, count: usize) {
        let camera = session.camera();

        let snapshot_url = match self.snapshots.save(&camera.id, frame).await {
            Ok(url) => url,
            Err(e) => {
                warn!(camera_id = %camera.id, error = %e, "Failed to save snapshot, alert skipped");
                return;
            }
        };

        let event = DetectionEvent::new(camera, count, snapshot_url, Utc::now());
        debug!(camera_id = %camera.id, face_count = count, "Dispatching alert");
        dispatch_detached(Arc::clone(&self.alerts), event);
    }
}

impl std::fmt::Debug for FrameProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameProcessor")
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

fn annotate(frame: &mut Frame, detections: &[Region]) {
    for region in detections {
        if let Err(e) = frame.draw_rect(region, BOX_COLOR, BOX_THICKNESS) {
            debug!(region = %region, error = %e, "Skipping box");
        }
    }
}

/// Status overlay: camera name, throughput and detections, then local time.
pub fn overlay_lines(camera_name: &str, fps: f64, detections: usize) -> Vec<String> {
    vec![
        format!("Camera: {camera_name} | FPS: {fps:.1} | Faces: {detections}"),
        Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    ]
}

/// Renders `lines` top to bottom, white on black, from the top-left corner.
pub fn draw_overlay(frame: &mut Frame, lines: &[String]) -> DomainResult<()> {
    let (x, mut y) = OVERLAY_ORIGIN;
    for line in lines {
        frame.draw_text(x, y, line, Bgr::WHITE, Some(Bgr::BLACK), OVERLAY_SCALE)?;
        y = y.saturating_add(GLYPH_SIZE * OVERLAY_SCALE + OVERLAY_LINE_GAP);
    }
    Ok(())
}

async fn forward_to_publisher(session: &StreamSession, frame: &Frame) {
    let Some(publisher) = session.publisher() else {
        return;
    };

    match publisher.write_frame(frame).await {
        Ok(()) => {}
        Err(PublisherError::Exited) => {
            debug!(camera_id = %session.id(), "Publisher gone, no longer republishing");
            session.detach_publisher(&publisher);
        }
        Err(e) => warn!(camera_id = %session.id(), error = %e, "Failed to publish frame"),
    }
}
