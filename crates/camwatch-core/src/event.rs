//! Detection events delivered to the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CameraId, CameraSpec};

/// Structured metadata attached to a detection event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionMetadata {
    /// Number of regions found on the frame
    pub face_count: usize,
    pub camera_name: String,
    pub location: String,
}

/// A qualifying detection on one camera.
///
/// Built once per frame that passes the alert throttle, handed to an
/// `AlertSink`, then dropped. Serialized in the backend's camelCase
/// alert format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    pub camera_id: CameraId,
    pub detected_at: DateTime<Utc>,
    pub description: String,
    /// Public path of the persisted snapshot (e.g. `/snapshots/cam_1700000000.jpg`)
    pub snapshot_url: String,
    pub metadata: DetectionMetadata,
}

impl DetectionEvent {
    /// Builds the event for `count` detections on `camera`.
    pub fn new(
        camera: &CameraSpec,
        count: usize,
        snapshot_url: impl Into<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            camera_id: camera.id.clone(),
            detected_at,
            description: format!("Face detected on camera {}", camera.name),
            snapshot_url: snapshot_url.into(),
            metadata: DetectionMetadata {
                face_count: count,
                camera_name: camera.name.clone(),
                location: camera.location.clone(),
            },
        }
    }
}
