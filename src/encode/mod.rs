//! Pluggable encoder backends.
//!
//! A backend consumes composited frames in strictly increasing frame order
//! and produces the final artifact: a playable local file or a reference to
//! a remotely produced result. Backends with bounded internal buffering
//! exert backpressure by suspending `feed` until they are ready for more.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    composite::FrameRgba,
    foundation::error::{CaptureError, CaptureResult},
};

pub mod remote;
pub mod webm;

pub use remote::RemoteEncoder;
pub use webm::WebmEncoder;

/// Bounded depth of the frame queue in front of each backend's writer; this
/// is what makes `feed` suspend instead of buffering without limit.
pub(crate) const FRAME_QUEUE_DEPTH: usize = 8;

/// The finished capture artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VideoArtifact {
    /// A playable video file produced locally.
    LocalFile(PathBuf),
    /// A reference to an artifact hosted by a remote encoding service.
    Remote { url: String },
}

/// Which encoder backend to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderFormat {
    /// Local webm file via the system `ffmpeg` binary.
    #[default]
    Webm,
    /// Remote streaming encode service.
    Ffmpeg,
}

impl std::str::FromStr for EncoderFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> CaptureResult<Self> {
        match s {
            "webm" => Ok(Self::Webm),
            "ffmpeg" => Ok(Self::Ffmpeg),
            other => Err(CaptureError::config(format!(
                "unknown format '{other}' (expected webm|ffmpeg)"
            ))),
        }
    }
}

/// Lifecycle state shared by all backends:
/// `idle -> started -> (feed)* -> stopping -> finished | failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BackendState {
    Idle,
    Started,
    Finished,
}

/// Contract for consuming composited frames.
///
/// Ordering: `feed` is called in strictly increasing frame order. `feed`
/// outside `started` and `stop` after completion are errors; `stop` settles
/// its result exactly once, as either an artifact or a distinct encoder
/// error carrying backend diagnostics.
#[async_trait]
pub trait EncoderBackend: Send {
    /// Open the sink for frames of `width` x `height` at `fps`.
    async fn start(&mut self, width: u32, height: u32, fps: u32) -> CaptureResult<()>;

    /// Accept one composited frame; suspends under backpressure.
    async fn feed(&mut self, frame: FrameRgba) -> CaptureResult<()>;

    /// Flush, finalize, and return the artifact.
    async fn stop(&mut self) -> CaptureResult<VideoArtifact>;
}

/// Select a backend for the requested format.
pub fn create_backend(
    format: EncoderFormat,
    out_path: &Path,
    remote_addr: &str,
    allow_transparency: bool,
) -> Box<dyn EncoderBackend> {
    match format {
        EncoderFormat::Webm => Box::new(WebmEncoder::new(out_path, allow_transparency)),
        EncoderFormat::Ffmpeg => Box::new(RemoteEncoder::new(remote_addr)),
    }
}

/// In-memory backend for tests and debugging: collects the fed frames and
/// reports a placeholder `mem://` artifact.
#[derive(Default)]
pub struct InMemoryEncoder {
    state: Option<(u32, u32, u32)>,
    started: bool,
    finished: bool,
    frames: Arc<Mutex<Vec<FrameRgba>>>,
}

impl InMemoryEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the collected frames, usable after the capture
    /// consumed the encoder itself.
    pub fn frames_handle(&self) -> Arc<Mutex<Vec<FrameRgba>>> {
        Arc::clone(&self.frames)
    }

    /// The `(width, height, fps)` received in `start`, if any.
    pub fn config(&self) -> Option<(u32, u32, u32)> {
        self.state
    }
}

#[async_trait]
impl EncoderBackend for InMemoryEncoder {
    async fn start(&mut self, width: u32, height: u32, fps: u32) -> CaptureResult<()> {
        if self.started {
            return Err(CaptureError::encoder("in-memory encoder already started"));
        }
        self.state = Some((width, height, fps));
        self.started = true;
        Ok(())
    }

    async fn feed(&mut self, frame: FrameRgba) -> CaptureResult<()> {
        if !self.started || self.finished {
            return Err(CaptureError::encoder("feed outside started state"));
        }
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<VideoArtifact> {
        if !self.started || self.finished {
            return Err(CaptureError::encoder("in-memory encoder is not started"));
        }
        self.finished = true;
        let n = self
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        Ok(VideoArtifact::Remote {
            url: format!("mem://frames/{n}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parses_known_names_only() {
        assert_eq!("webm".parse::<EncoderFormat>().unwrap(), EncoderFormat::Webm);
        assert_eq!(
            "ffmpeg".parse::<EncoderFormat>().unwrap(),
            EncoderFormat::Ffmpeg
        );
        assert!(matches!(
            "mp4".parse::<EncoderFormat>(),
            Err(CaptureError::Config(_))
        ));
    }

    #[tokio::test]
    async fn in_memory_encoder_enforces_state_machine() {
        let mut enc = InMemoryEncoder::new();
        let frame = FrameRgba::new_premul(1, 1, vec![0; 4]).unwrap();

        assert!(enc.feed(frame.clone()).await.is_err());

        enc.start(1, 1, 30).await.unwrap();
        assert!(enc.start(1, 1, 30).await.is_err());
        enc.feed(frame.clone()).await.unwrap();

        let artifact = enc.stop().await.unwrap();
        assert_eq!(
            artifact,
            VideoArtifact::Remote {
                url: "mem://frames/1".into()
            }
        );
        assert!(enc.stop().await.is_err());
        assert!(enc.feed(frame).await.is_err());
    }
}
