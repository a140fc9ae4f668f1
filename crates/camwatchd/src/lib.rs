//! camwatchd - camera ingestion worker
//!
//! Runs a bounded set of camera stream sessions. Each session pulls frames
//! from a live source, runs detection, republishes annotated frames and
//! raises throttled alerts to the backend.
//!
//! - `registry` - session lifecycle: capacity, start/stop, supervision, shutdown
//! - `processor` - per-frame detect / annotate / alert / republish pipeline
//! - `publisher` - encoder subprocess per stream
//! - `alert` - backend alert client and detached dispatch
//! - `capture`, `detector`, `snapshot` - ffmpeg and HTTP capability adapters
//! - `server` - axum control surface
//! - `config` - layered configuration

pub mod alert;
pub mod capture;
pub mod config;
pub mod detector;
pub mod processor;
pub mod publisher;
pub mod registry;
pub mod server;
pub mod snapshot;
pub mod task;

pub use config::{Config, ConfigError, ConfigSources};
pub use processor::FrameProcessor;
pub use registry::{RegistryConfig, StartError, StopError, StreamRegistry, StreamStatus};
