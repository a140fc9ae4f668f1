//! Camera identity and configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{DomainError, DomainResult};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a camera.
///
/// Assigned by the backend when the camera is registered. Used as the
/// registry key, in snapshot filenames and in the publish path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(String);

impl CameraId {
    /// Creates a new CameraId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the id is non-empty and only uses `[A-Za-z0-9_-]`.
    ///
    /// Such an id is a single path segment, so it can be used as a file
    /// name prefix, an RTSP path and a URL path parameter as-is.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CameraId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CameraId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for CameraId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Camera Spec
// ============================================================================

/// Configuration of one camera, as submitted by the backend.
///
/// Immutable once a stream session has been started for it; a change
/// requires stopping and restarting the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSpec {
    /// Unique camera identifier
    pub id: CameraId,

    /// Display name, used in overlays and alert descriptions
    #[serde(default)]
    pub name: String,

    /// Live source URL (usually RTSP)
    #[serde(default)]
    pub rtsp_url: String,

    /// Free-form location tag forwarded in alert metadata
    #[serde(default)]
    pub location: String,

    /// Whether the camera is enabled in the backend
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl CameraSpec {
    /// Creates a spec with an empty location, enabled.
    pub fn new(id: impl Into<CameraId>, name: impl Into<String>, rtsp_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rtsp_url: rtsp_url.into(),
            location: String::new(),
            enabled: true,
        }
    }

    /// Sets the location tag.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    /// Checks that the spec can be used to open a stream.
    ///
    /// # Errors
    ///
    /// - `DomainError::MissingField` if the id or source URL is blank
    /// - `DomainError::InvalidFieldValue` if the id has characters outside
    ///   `[A-Za-z0-9_-]`
    pub fn validate(&self) -> DomainResult<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(DomainError::MissingField {
                camera_id: String::new(),
                field: "id".to_string(),
            });
        }
        if !self.id.is_path_safe() {
            return Err(DomainError::invalid(
                "id",
                &self.id,
                "letters, digits, '-' or '_'",
            ));
        }
        if self.rtsp_url.trim().is_empty() {
            return Err(DomainError::MissingField {
                camera_id: self.id.to_string(),
                field: "rtsp_url".to_string(),
            });
        }
        Ok(())
    }
}
