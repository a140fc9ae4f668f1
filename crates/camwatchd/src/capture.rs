//! ffmpeg-backed capture adapter.
//!
//! `open` spawns one decoder per source that writes fixed-size `bgr24`
//! frames to stdout; `read` pulls exactly one frame off that pipe.
//!
//! ```text
//! rtsp://camera ──▶ ffmpeg -i URL -vf scale=WxH -f rawvideo -pix_fmt bgr24 - ──▶ stdout
//!                                                                               │
//!                                      FfmpegCapture::read (read_exact W*H*3) ◀─┘
//! ```
//!
//! The source is considered open only once a first frame has arrived within
//! the read timeout; that frame is handed out by the first `read`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::debug;
use url::Url;

use camwatch_core::{CaptureError, CaptureHandle, CaptureSource, Frame};

use crate::task::spawn_guarded;

/// Opens sources by spawning an ffmpeg decoder.
#[derive(Debug, Clone)]
pub struct FfmpegCaptureSource {
    ffmpeg_path: PathBuf,
    width: u32,
    height: u32,
    read_timeout: Duration,
}

impl FfmpegCaptureSource {
    pub fn new(ffmpeg_path: impl Into<PathBuf>, width: u32, height: u32, read_timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            width,
            height,
            read_timeout,
        }
    }

    /// Decoder arguments for `url`. RTSP sources without an explicit
    /// `rtsp_transport` query parameter are forced onto TCP.
    pub fn decoder_args(&self, url: &str) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];

        if needs_tcp_transport(url) {
            args.push("-rtsp_transport".into());
            args.push("tcp".into());
        }

        args.push("-i".into());
        args.push(url.to_string());
        args.push("-an".into());
        args.push("-vf".into());
        args.push(format!("scale={}:{}", self.width, self.height));
        for arg in ["-f", "rawvideo", "-pix_fmt", "bgr24", "-"] {
            args.push(arg.to_string());
        }
        args
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

fn needs_tcp_transport(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "rtsp" | "rtsps")
                && !parsed.query_pairs().any(|(k, _)| k == "rtsp_transport")
        }
        Err(_) => false,
    }
}

#[async_trait]
impl CaptureSource for FfmpegCaptureSource {
    async fn open(&self, url: &str) -> Result<Arc<dyn CaptureHandle>, CaptureError> {
        let open_error = |reason: String| CaptureError::Open {
            url: url.to_string(),
            reason,
        };

        let mut child = Command::new(&self.ffmpeg_path)
            .args(self.decoder_args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| open_error(format!("ffmpeg spawn failed: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| open_error("decoder has no stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            spawn_guarded("capture-stderr", forward_stderr(url.to_string(), stderr));
        }

        let capture = FfmpegCapture {
            width: self.width,
            height: self.height,
            frame_len: self.frame_len(),
            read_timeout: self.read_timeout,
            child: Mutex::new(Some(child)),
            stdout: tokio::sync::Mutex::new(stdout),
            pending: Mutex::new(None),
            closed: AtomicBool::new(false),
        };

        match capture.read_frame().await {
            Ok(first) => {
                *capture.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(first);
                debug!(url = %url, width = self.width, height = self.height, "Capture opened");
                Ok(Arc::new(capture))
            }
            Err(e) => {
                capture.close().await;
                Err(open_error(e.to_string()))
            }
        }
    }
}

async fn forward_stderr(url: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(url = %url, "decoder: {}", line);
    }
}

/// One running decoder process.
#[derive(Debug)]
pub struct FfmpegCapture {
    width: u32,
    height: u32,
    frame_len: usize,
    read_timeout: Duration,
    child: Mutex<Option<Child>>,
    stdout: tokio::sync::Mutex<ChildStdout>,
    pending: Mutex<Option<Frame>>,
    closed: AtomicBool,
}

impl FfmpegCapture {
    async fn read_frame(&self) -> Result<Frame, CaptureError> {
        let mut buf = vec![0u8; self.frame_len];
        let mut stdout = self.stdout.lock().await;

        match tokio::time::timeout(self.read_timeout, stdout.read_exact(&mut buf)).await {
            Err(_) => Err(CaptureError::Timeout(self.read_timeout)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(CaptureError::Read("decoder output ended".to_string()))
            }
            Ok(Err(e)) => Err(CaptureError::Read(e.to_string())),
            Ok(Ok(_)) => {
                Frame::new(self.width, self.height, buf).map_err(|e| CaptureError::Read(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl CaptureHandle for FfmpegCapture {
    fn is_opened(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self
                .child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
    }

    async fn read(&self) -> Result<Frame, CaptureError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CaptureError::Closed);
        }

        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(frame) = pending {
            return Ok(frame);
        }

        self.read_frame().await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Decoder already gone");
            }
            let _ = child.wait().await;
        }
    }
}
