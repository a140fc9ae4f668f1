//! camwatch core - shared types for the camera ingestion worker
//!
//! This crate provides the domain types and capability traits shared by
//! the worker daemon (camwatchd) and its adapters:
//! - `camera` - camera identity and the immutable per-session spec
//! - `frame` - pixel buffers, detection regions and annotation
//! - `event` - detection events delivered to the backend
//! - `capability` - traits for capture, detection, snapshots and alert delivery
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod camera;
pub mod capability;
pub mod error;
pub mod event;
pub mod frame;

// Re-exports for convenience
pub use camera::{CameraId, CameraSpec};
pub use capability::{
    AlertError, AlertSink, CaptureError, CaptureHandle, CaptureSource, DetectError, Detector,
    SnapshotError, SnapshotStore,
};
pub use error::{DomainError, DomainResult};
pub use event::{DetectionEvent, DetectionMetadata};
pub use frame::{Bgr, Frame, GrayFrame, Region, GLYPH_SIZE};
