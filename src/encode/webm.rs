//! Local webm encoder: pipes raw RGBA frames into a spawned system `ffmpeg`.
//!
//! The system binary is used deliberately (no native FFmpeg dev headers or
//! libs required). A bounded channel feeds a blocking writer task in front of
//! ffmpeg's stdin, so `feed` suspends once the queue fills.

use std::{
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    composite::FrameRgba,
    encode::{BackendState, EncoderBackend, FRAME_QUEUE_DEPTH, VideoArtifact},
    foundation::error::{CaptureError, CaptureResult},
    raster,
};

pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn ensure_parent_dir(path: &Path) -> CaptureResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        use anyhow::Context as _;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory '{}'", parent.display()))?;
    }
    Ok(())
}

pub struct WebmEncoder {
    out_path: PathBuf,
    allow_transparency: bool,
    state: BackendState,
    width: u32,
    height: u32,
    child: Option<Child>,
    tx: Option<mpsc::Sender<Vec<u8>>>,
    writer: Option<tokio::task::JoinHandle<std::io::Result<()>>>,
}

impl WebmEncoder {
    pub fn new(out_path: impl Into<PathBuf>, allow_transparency: bool) -> Self {
        Self {
            out_path: out_path.into(),
            allow_transparency,
            state: BackendState::Idle,
            width: 0,
            height: 0,
            child: None,
            tx: None,
            writer: None,
        }
    }

    fn validate(&self, width: u32, height: u32, fps: u32) -> CaptureResult<()> {
        if width == 0 || height == 0 {
            return Err(CaptureError::config("encode width/height must be non-zero"));
        }
        if fps == 0 {
            return Err(CaptureError::config("encode fps must be non-zero"));
        }
        if !width.is_multiple_of(2) || !height.is_multiple_of(2) {
            // The 4:2:0 pixel formats used for webm output need even dimensions.
            return Err(CaptureError::config(
                "encode width/height must be even for webm output",
            ));
        }
        Ok(())
    }
}

impl Drop for WebmEncoder {
    fn drop(&mut self) {
        // `stop()` takes the child out before waiting on it, so anything
        // still here is an encode abandoned mid-capture. Kill and reap it
        // instead of leaking a live ffmpeg.
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
            tracing::warn!(
                out = %self.out_path.display(),
                "webm encode dropped before stop; ffmpeg killed"
            );
        }
    }
}

#[async_trait]
impl EncoderBackend for WebmEncoder {
    async fn start(&mut self, width: u32, height: u32, fps: u32) -> CaptureResult<()> {
        if self.state != BackendState::Idle {
            return Err(CaptureError::encoder("webm encoder already started"));
        }
        self.validate(width, height, fps)?;
        ensure_parent_dir(&self.out_path)?;

        if !is_ffmpeg_on_path() {
            return Err(CaptureError::encoder(
                "ffmpeg is required for webm encoding, but was not found on PATH",
            ));
        }

        let pix_fmt = if self.allow_transparency {
            "yuva420p"
        } else {
            "yuv420p"
        };

        let mut cmd = Command::new("ffmpeg");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd.args([
            "-y",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgba",
            "-s",
            &format!("{width}x{height}"),
            "-r",
            &fps.to_string(),
            "-i",
            "pipe:0",
            "-an",
            "-c:v",
            "libvpx-vp9",
            "-pix_fmt",
            pix_fmt,
            "-b:v",
            "0",
            "-crf",
            "32",
        ])
        .arg(&self.out_path);

        let mut child = cmd.spawn().map_err(|e| {
            CaptureError::encoder(format!(
                "failed to spawn ffmpeg (is it installed and on PATH?): {e}"
            ))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::encoder("failed to open ffmpeg stdin (unexpected)"))?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(FRAME_QUEUE_DEPTH);
        let writer = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use std::io::Write as _;
            while let Some(buf) = rx.blocking_recv() {
                stdin.write_all(&buf)?;
            }
            // Dropping stdin here closes the pipe and lets ffmpeg finalize.
            Ok(())
        });

        self.width = width;
        self.height = height;
        self.child = Some(child);
        self.tx = Some(tx);
        self.writer = Some(writer);
        self.state = BackendState::Started;
        tracing::info!(out = %self.out_path.display(), width, height, fps, "webm encode started");
        Ok(())
    }

    async fn feed(&mut self, mut frame: FrameRgba) -> CaptureResult<()> {
        if self.state != BackendState::Started {
            return Err(CaptureError::encoder("feed outside started state"));
        }
        if frame.width != self.width || frame.height != self.height {
            return Err(CaptureError::encoder(format!(
                "frame size mismatch: got {}x{}, expected {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }

        // ffmpeg's rgba input is straight alpha.
        if frame.premultiplied {
            raster::unpremultiply_rgba8_in_place(&mut frame.data);
        }

        let Some(tx) = self.tx.as_ref() else {
            return Err(CaptureError::encoder("webm encoder writer is gone"));
        };
        if tx.send(frame.data).await.is_err() {
            // Writer bailed out early; the failure detail surfaces in stop().
            return Err(CaptureError::encoder(
                "webm encoder pipeline closed before all frames were written",
            ));
        }
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<VideoArtifact> {
        if self.state != BackendState::Started {
            return Err(CaptureError::encoder("webm encoder is not started"));
        }
        self.state = BackendState::Finished;

        drop(self.tx.take());

        let writer = self
            .writer
            .take()
            .ok_or_else(|| CaptureError::encoder("webm encoder writer is gone"))?;
        let write_result = writer
            .await
            .map_err(|e| CaptureError::encoder(format!("webm writer task panicked: {e}")))?;

        let child = self
            .child
            .take()
            .ok_or_else(|| CaptureError::encoder("webm encoder process is gone"))?;
        let output = tokio::task::spawn_blocking(move || child.wait_with_output())
            .await
            .map_err(|e| CaptureError::encoder(format!("webm wait task panicked: {e}")))?
            .map_err(|e| CaptureError::encoder(format!("failed to wait for ffmpeg: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::encoder(format!(
                "ffmpeg exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        // A broken pipe with a zero exit status would mean truncated output.
        write_result.map_err(|e| {
            CaptureError::encoder(format!("failed to write frames to ffmpeg stdin: {e}"))
        })?;

        tracing::info!(out = %self.out_path.display(), "webm encode finished");
        Ok(VideoArtifact::LocalFile(self.out_path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_validates_dimensions_and_fps() {
        let mut odd = WebmEncoder::new("target/webm_test/odd.webm", false);
        assert!(matches!(
            odd.start(11, 10, 30).await,
            Err(CaptureError::Config(_))
        ));

        let mut zero = WebmEncoder::new("target/webm_test/zero.webm", false);
        assert!(zero.start(10, 10, 0).await.is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropping_without_stop_kills_and_reaps_ffmpeg() {
        if !is_ffmpeg_on_path() {
            eprintln!("skipping: ffmpeg not found on PATH");
            return;
        }
        let mut enc = WebmEncoder::new("target/webm_test/dropped.webm", false);
        enc.start(2, 2, 30).await.unwrap();
        let pid = enc.child.as_ref().unwrap().id();
        drop(enc);
        // Killed *and* waited on: the pid must be fully reaped, not a zombie.
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }

    #[tokio::test]
    async fn feed_and_stop_require_started_state() {
        let mut enc = WebmEncoder::new("target/webm_test/state.webm", false);
        let frame = FrameRgba::new_premul(2, 2, vec![0; 16]).unwrap();
        assert!(enc.feed(frame).await.is_err());
        assert!(enc.stop().await.is_err());
    }
}
