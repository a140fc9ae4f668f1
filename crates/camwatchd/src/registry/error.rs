//! Registry errors and removal reasons.
//!
//! - `StartError`: why a stream could not be started
//! - `StopError`: why a stream could not be stopped
//! - `RemovalReason`: why a session left the registry (for logging)

use camwatch_core::{CameraId, DomainError};
use thiserror::Error;

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors returned by `StreamRegistry::start`.
///
/// Every variant is returned synchronously; none of them leaves a session
/// or an open capture behind.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StartError {
    /// The registry already runs its maximum number of streams.
    #[error("maximum number of streams reached ({max})")]
    CapacityExceeded {
        /// Configured stream capacity
        max: usize,
    },

    /// A session for this camera already exists.
    #[error("stream for camera {0} already exists")]
    AlreadyRunning(CameraId),

    /// The camera spec cannot be used to open a stream.
    #[error("invalid camera spec: {0}")]
    InvalidSpec(#[from] DomainError),

    /// The capture source could not be opened within the retry budget.
    #[error("failed to open stream for camera {camera_id} after {attempts} attempts: {reason}")]
    SourceUnreachable {
        camera_id: CameraId,
        attempts: u32,
        reason: String,
    },

    /// `shutdown_all` ran while the stream was being opened.
    #[error("worker is shutting down")]
    ShuttingDown,
}

/// Errors returned by `StreamRegistry::stop`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StopError {
    /// No active session for this camera.
    #[error("stream for camera {0} not found")]
    NotFound(CameraId),
}

// ============================================================================
// Removal Reasons
// ============================================================================

/// Reason why a session was removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// `stop` was called for the camera.
    Explicit,

    /// The capture failed too many reads in a row.
    ReadFailures,

    /// The frame loop terminated on an unexpected fault.
    Faulted,

    /// `shutdown_all` drained the registry.
    Shutdown,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicitly stopped"),
            Self::ReadFailures => write!(f, "too many consecutive read failures"),
            Self::Faulted => write!(f, "frame loop faulted"),
            Self::Shutdown => write!(f, "worker shutdown"),
        }
    }
}
