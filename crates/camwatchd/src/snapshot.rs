//! JPEG snapshots of annotated frames.
//!
//! Encoding is a one-shot ffmpeg run per snapshot: the raw frame goes in
//! on stdin, one JPEG comes out at `{dir}/{camera_id}_{unix_seconds}.jpg`.
//! The frame already carries its boxes and status overlay, so the encoder
//! only converts pixels. The process is spawned with `kill_on_drop` so a
//! timeout never leaves it behind.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use camwatch_core::{CameraId, Frame, SnapshotError, SnapshotStore};

/// URL prefix snapshots are served under.
pub const SNAPSHOT_URL_PREFIX: &str = "/snapshots";

/// `SnapshotStore` backed by the ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegSnapshotStore {
    ffmpeg_path: PathBuf,
    dir: PathBuf,
    timeout: Duration,
}

impl FfmpegSnapshotStore {
    pub fn new(ffmpeg_path: impl Into<PathBuf>, dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            dir: dir.into(),
            timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn encoder_args(&self, frame: &Frame, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner", "-loglevel", "error",
            "-f", "rawvideo", "-pix_fmt", "bgr24",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();

        args.push("-s".to_string());
        args.push(format!("{}x{}", frame.width(), frame.height()));
        args.push("-i".to_string());
        args.push("-".to_string());
        args.extend(["-frames:v", "1", "-q:v", "5", "-y"].iter().map(|s| (*s).to_string()));
        args.push(output.to_string_lossy().into_owned());
        args
    }

    async fn encode(&self, frame: &Frame, output: &Path) -> Result<(), SnapshotError> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args(self.encoder_args(frame, output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SnapshotError::Encode(format!("ffmpeg spawn failed: {e}")))?;

        let stdin = child.stdin.take();
        let run = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(frame.as_bytes()).await?;
                // EOF tells the encoder the frame is complete
                drop(stdin);
            }
            child.wait_with_output().await
        };

        match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(SnapshotError::Encode(format!(
                "ffmpeg failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            Ok(Err(e)) => Err(SnapshotError::Encode(format!("ffmpeg execution failed: {e}"))),
            Err(_) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    path = %output.display(),
                    "Snapshot encoder timed out, process killed"
                );
                Err(SnapshotError::Encode(format!(
                    "ffmpeg timeout ({}ms)",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl SnapshotStore for FfmpegSnapshotStore {
    async fn save(&self, camera_id: &CameraId, frame: &Frame) -> Result<String, SnapshotError> {
        if frame.is_empty() {
            return Err(SnapshotError::EmptyFrame);
        }

        let filename = snapshot_filename(camera_id, Utc::now().timestamp());
        if !is_plain_file_name(&filename) {
            return Err(SnapshotError::Write {
                path: filename,
                reason: "camera id does not form a file name inside the snapshot directory"
                    .to_string(),
            });
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SnapshotError::Write {
                path: self.dir.display().to_string(),
                reason: e.to_string(),
            })?;

        let path = self.dir.join(&filename);

        self.encode(frame, &path).await?;

        debug!(camera_id = %camera_id, path = %path.display(), "Saved snapshot");
        Ok(format!("{SNAPSHOT_URL_PREFIX}/{filename}"))
    }
}

/// `{camera_id}_{unix_seconds}.jpg`
pub fn snapshot_filename(camera_id: &CameraId, unix_seconds: i64) -> String {
    format!("{camera_id}_{unix_seconds}.jpg")
}

/// Exactly one normal path component: no separators, no `.` or `..`.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
