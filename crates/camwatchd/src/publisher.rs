//! Republishing of annotated frames through an encoder subprocess.
//!
//! One encoder per stream reads raw `bgr24` frames on stdin and pushes
//! H.264 over RTSP to the media server:
//!
//! ```text
//! FrameProcessor ──write_frame──▶ stdin ┐
//!                                       │ ffmpeg (libx264, zerolatency)
//!              tracing ◀── stderr ──────┤
//!                                       └──▶ rtsp://{media host}:8554/{camera id}
//! ```
//!
//! A watcher task owns the `Child` and reaps it; it clears the live flag
//! and drops the input pipe whatever the exit status. Publisher failures
//! are reported to the caller but never end the stream session.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use camwatch_core::{CameraId, Frame};

use crate::task::spawn_guarded;

/// Default RTSP port the media server accepts publishers on.
pub const DEFAULT_PUBLISH_PORT: u16 = 8554;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublisherError {
    #[error("invalid media server URL {url}: {reason}")]
    InvalidSinkUrl { url: String, reason: String },

    #[error("failed to spawn encoder: {0}")]
    Spawn(String),

    /// The encoder exited or its input pipe is closed.
    #[error("encoder has exited")]
    Exited,

    #[error("frame is {actual} bytes, encoder expects {expected}")]
    FrameSize { expected: usize, actual: usize },

    #[error("failed to write frame to encoder: {0}")]
    Write(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Encoder profile shared by every stream.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub ffmpeg_path: PathBuf,
    pub media_server_url: String,
    pub publish_port: u16,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Wait after SIGINT before escalating to SIGKILL.
    pub stop_grace: Duration,
}

impl PublisherConfig {
    /// `rtsp://{host}:{publish_port}/{camera_id}`, host taken from the
    /// media server URL (`localhost` when it has none).
    pub fn sink_url(&self, camera_id: &CameraId) -> Result<String, PublisherError> {
        let parsed = Url::parse(&self.media_server_url).map_err(|e| PublisherError::InvalidSinkUrl {
            url: self.media_server_url.clone(),
            reason: e.to_string(),
        })?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .unwrap_or("localhost");

        Ok(format!("rtsp://{host}:{}/{camera_id}", self.publish_port))
    }

    /// Size in bytes of one input frame.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn encoder_args(&self, sink_url: &str) -> Vec<String> {
        let size = format!("{}x{}", self.width, self.height);
        let fps = self.fps.to_string();
        [
            "-hide_banner", "-loglevel", "warning", "-y",
            "-f", "rawvideo", "-pix_fmt", "bgr24", "-s", size.as_str(), "-r", fps.as_str(), "-i", "-",
            "-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency",
            "-pix_fmt", "yuv420p",
            "-f", "rtsp", "-rtsp_transport", "tcp", sink_url,
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
    }
}

// ============================================================================
// Publisher Handle
// ============================================================================

/// A running encoder process for one stream.
///
/// Owned by its session. `write_frame` and `stop` may be called from
/// different tasks; `stop` is idempotent.
#[derive(Debug)]
pub struct PublisherHandle {
    camera_id: CameraId,
    sink_url: String,
    pid: Option<u32>,
    frame_len: usize,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    live: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
    stopped: AtomicBool,
    stop_grace: Duration,
}

/// Starts the encoder for `camera_id`.
pub fn start(config: &PublisherConfig, camera_id: &CameraId) -> Result<PublisherHandle, PublisherError> {
    let sink_url = config.sink_url(camera_id)?;
    let mut command = Command::new(&config.ffmpeg_path);
    command.args(config.encoder_args(&sink_url));

    let handle = spawn(command, config, camera_id, sink_url)?;
    info!(camera_id = %camera_id, sink_url = %handle.sink_url, pid = ?handle.pid, "Started publisher");
    Ok(handle)
}

/// Spawns `command` as the encoder and wires up its pipes and watcher.
pub(crate) fn spawn(
    mut command: Command,
    config: &PublisherConfig,
    camera_id: &CameraId,
    sink_url: String,
) -> Result<PublisherHandle, PublisherError> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PublisherError::Spawn(e.to_string()))?;

    let pid = child.id();
    let stdin = child.stdin.take();
    let live = Arc::new(AtomicBool::new(stdin.is_some()));
    let stdin = Arc::new(Mutex::new(stdin));
    let (exit_tx, exit_rx) = watch::channel(false);

    if let Some(stderr) = child.stderr.take() {
        spawn_guarded("publisher-stderr", forward_stderr(camera_id.clone(), stderr));
    }

    spawn_guarded(
        "publisher-watch",
        watch_exit(
            child,
            camera_id.clone(),
            Arc::clone(&live),
            Arc::clone(&stdin),
            exit_tx,
        ),
    );

    Ok(PublisherHandle {
        camera_id: camera_id.clone(),
        sink_url,
        pid,
        frame_len: config.frame_len(),
        stdin,
        live,
        exited: exit_rx,
        stopped: AtomicBool::new(false),
        stop_grace: config.stop_grace,
    })
}

async fn forward_stderr(camera_id: CameraId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(camera_id = %camera_id, "encoder: {}", line);
    }
}

async fn watch_exit(
    mut child: Child,
    camera_id: CameraId,
    live: Arc<AtomicBool>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    exited: watch::Sender<bool>,
) {
    let result = child.wait().await;

    live.store(false, Ordering::Release);
    drop(stdin.lock().await.take());

    match result {
        Ok(status) if status.success() => info!(camera_id = %camera_id, "Publisher finished"),
        Ok(status) => info!(camera_id = %camera_id, status = %status, "Publisher exited"),
        Err(e) => warn!(camera_id = %camera_id, error = %e, "Failed to wait for publisher"),
    }

    let _ = exited.send(true);
}

impl PublisherHandle {
    pub fn sink_url(&self) -> &str {
        &self.sink_url
    }

    /// True while the encoder runs and accepts frames.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Whether the encoder process has been reaped.
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Writes one raw frame to the encoder's stdin.
    ///
    /// # Errors
    ///
    /// - `PublisherError::Exited` if the encoder is gone or the pipe broke;
    ///   the handle is marked not live
    /// - `PublisherError::FrameSize` if the frame does not match the profile
    /// - `PublisherError::Write` for any other I/O error
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), PublisherError> {
        if !self.is_live() {
            return Err(PublisherError::Exited);
        }

        let bytes = frame.as_bytes();
        if bytes.len() != self.frame_len {
            return Err(PublisherError::FrameSize {
                expected: self.frame_len,
                actual: bytes.len(),
            });
        }

        let mut pipe = self.stdin.lock().await;
        let Some(stdin) = pipe.as_mut() else {
            self.live.store(false, Ordering::Release);
            return Err(PublisherError::Exited);
        };

        match stdin.write_all(bytes).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                pipe.take();
                self.live.store(false, Ordering::Release);
                Err(PublisherError::Exited)
            }
            Err(e) => Err(PublisherError::Write(e.to_string())),
        }
    }

    /// Stops the encoder: close its input, SIGINT, then SIGKILL after the
    /// grace period. Only the first call does anything.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!(camera_id = %self.camera_id, "Publisher already stopped");
            return;
        }
        self.live.store(false, Ordering::Release);

        // A writer blocked on a full pipe holds the lock; don't wait on it forever.
        match timeout(self.stop_grace, self.stdin.lock()).await {
            Ok(mut pipe) => drop(pipe.take()),
            Err(_) => warn!(camera_id = %self.camera_id, "Publisher input busy, signalling anyway"),
        }

        let already_exited = self.has_exited();
        if already_exited {
            debug!(camera_id = %self.camera_id, "Publisher already exited");
            return;
        }

        self.signal(libc::SIGINT);
        if self.wait_exit(self.stop_grace).await {
            info!(camera_id = %self.camera_id, "Stopped publisher");
            return;
        }

        warn!(
            camera_id = %self.camera_id,
            grace_ms = self.stop_grace.as_millis() as u64,
            "Publisher ignored SIGINT, killing"
        );
        self.signal(libc::SIGKILL);
        if !self.wait_exit(self.stop_grace).await {
            warn!(camera_id = %self.camera_id, pid = ?self.pid, "Publisher did not exit after SIGKILL");
        }
    }

    async fn wait_exit(&self, limit: Duration) -> bool {
        let mut exited = self.exited.clone();
        let reaped = matches!(timeout(limit, exited.wait_for(|done| *done)).await, Ok(Ok(_)));
        reaped || self.has_exited()
    }

    fn signal(&self, signal: libc::c_int) {
        let Some(pid) = self.pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
            return;
        };
        if self.has_exited() {
            return;
        }
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, signal) };
        if rc != 0 {
            debug!(
                camera_id = %self.camera_id,
                pid,
                signal,
                error = %std::io::Error::last_os_error(),
                "Failed to signal publisher"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(width: u32, height: u32) -> PublisherConfig {
        PublisherConfig {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            media_server_url: "http://mediamtx:8888".to_string(),
            publish_port: DEFAULT_PUBLISH_PORT,
            width,
            height,
            fps: 25,
            stop_grace: Duration::from_millis(500),
        }
    }

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    fn frame(width: u32, height: u32) -> Frame {
        Frame::new(width, height, vec![7; (width * height * 3) as usize]).unwrap()
    }

    #[test]
    fn test_sink_url_uses_media_host() {
        let id = CameraId::new("cam-1");
        assert_eq!(
            config(2, 2).sink_url(&id).unwrap(),
            "rtsp://mediamtx:8554/cam-1"
        );

        let mut no_host = config(2, 2);
        no_host.media_server_url = "file:///tmp/media".to_string();
        assert_eq!(no_host.sink_url(&id).unwrap(), "rtsp://localhost:8554/cam-1");

        let mut bad = config(2, 2);
        bad.media_server_url = "not a url".to_string();
        assert!(matches!(
            bad.sink_url(&id),
            Err(PublisherError::InvalidSinkUrl { .. })
        ));
    }

    #[test]
    fn test_encoder_args_profile() {
        let args = config(640, 480).encoder_args("rtsp://h:8554/c");
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt bgr24 -s 640x480 -r 25 -i -"));
        assert!(joined.contains("-c:v libx264 -preset veryfast -tune zerolatency"));
        assert!(joined.contains("-pix_fmt yuv420p"));
        assert!(joined.ends_with("-f rtsp -rtsp_transport tcp rtsp://h:8554/c"));
    }

    #[tokio::test]
    async fn test_write_then_stop_twice() {
        let cfg = config(2, 2);
        let id = CameraId::new("cam-1");
        let handle = spawn(Command::new("cat"), &cfg, &id, "rtsp://x/cam-1".to_string()).unwrap();

        assert!(handle.is_live());
        handle.write_frame(&frame(2, 2)).await.unwrap();

        handle.stop().await;
        assert!(!handle.is_live());
        assert!(handle.has_exited());

        // second stop is a no-op
        handle.stop().await;
        assert_eq!(
            handle.write_frame(&frame(2, 2)).await,
            Err(PublisherError::Exited)
        );
    }

    #[tokio::test]
    async fn test_frame_size_mismatch() {
        let cfg = config(2, 2);
        let id = CameraId::new("cam-1");
        let handle = spawn(Command::new("cat"), &cfg, &id, "rtsp://x/cam-1".to_string()).unwrap();

        assert_eq!(
            handle.write_frame(&frame(3, 3)).await,
            Err(PublisherError::FrameSize {
                expected: 12,
                actual: 27
            })
        );
        assert!(handle.is_live());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_exited_encoder_clears_live() {
        let cfg = config(2, 2);
        let id = CameraId::new("cam-1");
        let handle = spawn(shell("exit 0"), &cfg, &id, "rtsp://x/cam-1".to_string()).unwrap();

        assert!(handle.wait_exit(Duration::from_secs(5)).await);
        assert!(!handle.is_live());
        assert_eq!(
            handle.write_frame(&frame(2, 2)).await,
            Err(PublisherError::Exited)
        );
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let mut cfg = config(2, 2);
        cfg.stop_grace = Duration::from_millis(200);
        let id = CameraId::new("cam-1");
        let handle = spawn(
            shell("trap '' INT; exec sleep 30"),
            &cfg,
            &id,
            "rtsp://x/cam-1".to_string(),
        )
        .unwrap();

        let started = std::time::Instant::now();
        handle.stop().await;

        assert!(handle.has_exited());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let cfg = config(2, 2);
        let id = CameraId::new("cam-1");
        let err = spawn(
            Command::new("/nonexistent/encoder"),
            &cfg,
            &id,
            "rtsp://x/cam-1".to_string(),
        )
        .unwrap_err();
        assert!(matches!(err, PublisherError::Spawn(_)));
    }
}
