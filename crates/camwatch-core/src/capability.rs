//! Capability traits for the collaborators a stream session depends on.
//!
//! The registry and frame processor only ever talk to these traits; the
//! worker binary wires in the ffmpeg/HTTP adapters, tests wire in fakes.
//!
//! ```text
//! CaptureSource ──open──▶ CaptureHandle ──read──▶ Frame ──▶ Detector
//!                                                   │
//!                                                   ├──▶ SnapshotStore
//!                                                   └──▶ AlertSink
//! ```
//!
//! Every trait is `Send + Sync`: a single instance is shared by all
//! sessions and may be invoked concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{CameraId, DetectionEvent, Frame, GrayFrame, Region};

// ============================================================================
// Capture
// ============================================================================

/// Errors reported by a capture source or handle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    /// The source could not be opened at all.
    #[error("failed to open {url}: {reason}")]
    Open { url: String, reason: String },

    /// A frame read failed.
    #[error("frame read failed: {0}")]
    Read(String),

    /// No frame arrived within the read timeout.
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    /// The handle was closed.
    #[error("capture closed")]
    Closed,
}

/// Opens live sources.
///
/// Implementations must tolerate unreachable sources: `open` returns an
/// error (or a handle reporting `is_opened() == false`) and never blocks
/// indefinitely.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<Arc<dyn CaptureHandle>, CaptureError>;
}

/// An open source yielding sequential frames.
///
/// `read` and `close` may race (an explicit stop closes the handle while the
/// frame loop is blocked in `read`); implementations make `read` fail with
/// `CaptureError::Closed` once closed.
#[async_trait]
pub trait CaptureHandle: Send + Sync {
    /// Whether the handle is usable for reading.
    fn is_opened(&self) -> bool;

    /// Reads the next frame. An empty frame is a successful read with
    /// nothing to process.
    async fn read(&self) -> Result<Frame, CaptureError>;

    /// Releases the underlying source.
    async fn close(&self);
}

// ============================================================================
// Detection
// ============================================================================

/// Errors reported by a detector.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DetectError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),

    #[error("invalid detector response: {0}")]
    InvalidResponse(String),
}

/// Finds regions of interest on a grayscale frame.
///
/// Stateless from the caller's perspective and safe for concurrent use from
/// multiple sessions. An empty result means no detections.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: &GrayFrame) -> Result<Vec<Region>, DetectError>;
}

// ============================================================================
// Snapshots
// ============================================================================

/// Errors reported while persisting a snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("frame is empty")]
    EmptyFrame,

    #[error("failed to encode snapshot: {0}")]
    Encode(String),

    #[error("failed to write snapshot {path}: {reason}")]
    Write { path: String, reason: String },
}

/// Persists annotated frames as JPEG files.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Writes `frame` and returns the public URL it will be served under.
    async fn save(&self, camera_id: &CameraId, frame: &Frame) -> Result<String, SnapshotError>;
}

// ============================================================================
// Alerts
// ============================================================================

/// Errors reported while delivering a detection event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AlertError {
    /// The request never produced a response (connect, timeout, TLS...).
    #[error("alert transport error: {0}")]
    Transport(String),

    /// The backend answered with a non-success status.
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to serialize alert: {0}")]
    Serialize(String),
}

/// Delivers detection events to the backend.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, event: &DetectionEvent) -> Result<(), AlertError>;
}
