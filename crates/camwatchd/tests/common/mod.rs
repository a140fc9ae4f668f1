//! Fake capabilities shared by the integration tests.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use camwatch_core::{
    AlertError, AlertSink, CameraId, CameraSpec, CaptureError, CaptureHandle, CaptureSource,
    DetectError, DetectionEvent, Detector, Frame, GrayFrame, Region, SnapshotError, SnapshotStore,
};
use camwatchd::publisher::{PublisherConfig, DEFAULT_PUBLISH_PORT};
use camwatchd::registry::{RegistryConfig, StreamRegistry};
use camwatchd::FrameProcessor;

pub const FRAME_WIDTH: u32 = 2;
pub const FRAME_HEIGHT: u32 = 2;

pub fn camera(id: &str) -> CameraSpec {
    CameraSpec::new(id, format!("Camera {id}"), format!("rtsp://cameras.local/{id}"))
        .with_location("test bench")
}

pub fn test_frame() -> Frame {
    black_frame(FRAME_WIDTH, FRAME_HEIGHT)
}

pub fn black_frame(width: u32, height: u32) -> Frame {
    Frame::new(width, height, vec![0; (width * height * 3) as usize]).unwrap()
}

/// Installs an executable shell script named `name` in `dir`.
pub fn fake_binary(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Polls `cond` every 10ms until it holds or `limit` elapses.
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ============================================================================
// Capture
// ============================================================================

/// What a scripted capture does on `read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadScript {
    /// A small black frame every read
    Frames,
    /// Successful reads with nothing in them
    Empty,
    /// Every read fails
    Fail,
}

pub struct ScriptedCapture {
    script: ReadScript,
    frame_size: (u32, u32),
    opened: bool,
    read_delay: Duration,
    pub reads: AtomicU64,
    pub closes: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedCapture {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureHandle for ScriptedCapture {
    fn is_opened(&self) -> bool {
        self.opened && !self.closed.load(Ordering::SeqCst)
    }

    async fn read(&self) -> Result<Frame, CaptureError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CaptureError::Closed);
        }
        tokio::time::sleep(self.read_delay).await;
        self.reads.fetch_add(1, Ordering::SeqCst);

        match self.script {
            ReadScript::Frames => Ok(black_frame(self.frame_size.0, self.frame_size.1)),
            ReadScript::Empty => Ok(Frame::empty()),
            ReadScript::Fail => Err(CaptureError::Read("scripted failure".to_string())),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out scripted captures and keeps every one it opened.
pub struct ScriptedSource {
    script: ReadScript,
    frame_size: (u32, u32),
    read_delay: Duration,
    open_delay: Duration,
    failing_opens: AtomicU32,
    unopened: AtomicU32,
    pub opens: AtomicU32,
    pub handles: Mutex<Vec<(String, Arc<ScriptedCapture>)>>,
}

impl ScriptedSource {
    pub fn new(script: ReadScript) -> Self {
        Self {
            script,
            frame_size: (FRAME_WIDTH, FRAME_HEIGHT),
            read_delay: Duration::from_millis(10),
            open_delay: Duration::ZERO,
            failing_opens: AtomicU32::new(0),
            unopened: AtomicU32::new(0),
            opens: AtomicU32::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// The first `n` opens return an error.
    pub fn failing_opens(self, n: u32) -> Self {
        self.failing_opens.store(n, Ordering::SeqCst);
        self
    }

    /// The first `n` opens return a handle that reports `is_opened() == false`.
    pub fn unopened(self, n: u32) -> Self {
        self.unopened.store(n, Ordering::SeqCst);
        self
    }

    pub fn frame_size(mut self, width: u32, height: u32) -> Self {
        self.frame_size = (width, height);
        self
    }

    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Every handle opened for `url`, oldest first.
    pub fn handles_for(&self, url: &str) -> Vec<Arc<ScriptedCapture>> {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, h)| Arc::clone(h))
            .collect()
    }

    pub fn all_handles(&self) -> Vec<Arc<ScriptedCapture>> {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl CaptureSource for ScriptedSource {
    async fn open(&self, url: &str) -> Result<Arc<dyn CaptureHandle>, CaptureError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        if take_one(&self.failing_opens) {
            return Err(CaptureError::Open {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let handle = Arc::new(ScriptedCapture {
            script: self.script,
            frame_size: self.frame_size,
            opened: !take_one(&self.unopened),
            read_delay: self.read_delay,
            reads: AtomicU64::new(0),
            closes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.handles
            .lock()
            .unwrap()
            .push((url.to_string(), Arc::clone(&handle)));
        Ok(handle)
    }
}

// ============================================================================
// Detector, snapshots, alerts
// ============================================================================

/// Returns the same regions for every frame.
#[derive(Default)]
pub struct FixedDetector {
    regions: Vec<Region>,
    panic_on_detect: bool,
    pub calls: AtomicUsize,
}

impl FixedDetector {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn faces(count: u32) -> Self {
        Self {
            regions: (0..count).map(|_| Region::new(0, 0, 1, 1)).collect(),
            ..Self::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic_on_detect: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Detector for FixedDetector {
    async fn detect(&self, _frame: &GrayFrame) -> Result<Vec<Region>, DetectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_detect {
            panic!("detector blew up");
        }
        Ok(self.regions.clone())
    }
}

#[derive(Default)]
pub struct RecordingSnapshots {
    pub saved: Mutex<Vec<CameraId>>,
}

#[async_trait]
impl SnapshotStore for RecordingSnapshots {
    async fn save(&self, camera_id: &CameraId, frame: &Frame) -> Result<String, SnapshotError> {
        if frame.is_empty() {
            return Err(SnapshotError::EmptyFrame);
        }
        let mut saved = self.saved.lock().unwrap();
        saved.push(camera_id.clone());
        Ok(format!("/snapshots/{camera_id}_{}.jpg", saved.len()))
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    pub events: Mutex<Vec<DetectionEvent>>,
}

impl RecordingAlerts {
    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn send(&self, event: &DetectionEvent) -> Result<(), AlertError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Encoder profile for `width`x`height` frames run by `ffmpeg_path`.
pub fn publisher_config(ffmpeg_path: PathBuf, width: u32, height: u32) -> PublisherConfig {
    PublisherConfig {
        ffmpeg_path,
        media_server_url: "http://localhost:8888".to_string(),
        publish_port: DEFAULT_PUBLISH_PORT,
        width,
        height,
        fps: 25,
        stop_grace: Duration::from_secs(1),
    }
}

pub struct Harness {
    pub registry: StreamRegistry,
    pub source: Arc<ScriptedSource>,
    pub detector: Arc<FixedDetector>,
    pub snapshots: Arc<RecordingSnapshots>,
    pub alerts: Arc<RecordingAlerts>,
}

impl Harness {
    pub fn new(max_streams: usize, source: ScriptedSource, detector: FixedDetector) -> Self {
        let config = RegistryConfig {
            max_streams,
            open_backoff: Duration::from_millis(50),
            ..RegistryConfig::default()
        };
        Self::with_config(config, source, detector)
    }

    /// Like `new`, with republishing through `ffmpeg_path`.
    pub fn with_publisher(
        max_streams: usize,
        source: ScriptedSource,
        detector: FixedDetector,
        publisher: PublisherConfig,
    ) -> Self {
        let config = RegistryConfig {
            max_streams,
            open_backoff: Duration::from_millis(50),
            publisher: Some(publisher),
            ..RegistryConfig::default()
        };
        Self::with_config(config, source, detector)
    }

    pub fn with_config(config: RegistryConfig, source: ScriptedSource, detector: FixedDetector) -> Self {
        let source = Arc::new(source);
        let detector = Arc::new(detector);
        let snapshots = Arc::new(RecordingSnapshots::default());
        let alerts = Arc::new(RecordingAlerts::default());

        let processor = FrameProcessor::new(
            Arc::clone(&detector) as Arc<dyn Detector>,
            Arc::clone(&snapshots) as Arc<dyn SnapshotStore>,
            Arc::clone(&alerts) as Arc<dyn AlertSink>,
        );
        let registry = StreamRegistry::new(
            config,
            Arc::clone(&source) as Arc<dyn CaptureSource>,
            Arc::new(processor),
        );

        Self {
            registry,
            source,
            detector,
            snapshots,
            alerts,
        }
    }
}
