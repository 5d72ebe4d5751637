//! Batched frame scheduler: the top-level capture loop.
//!
//! Frames are processed in `ceil(total / batch_size)` batches in strictly
//! increasing frame order. For each frame the scheduler advances the virtual
//! clock, ticks due callbacks, and snapshots every source; the decoded
//! samples of a whole batch are awaited together, composited, and fed to the
//! encoder backend before the next batch's clock values begin. Holding only
//! one batch of raw samples bounds memory for long captures.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use futures_util::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{
    clock::VirtualClock,
    composite::Compositor,
    encode::{EncoderBackend, EncoderFormat, VideoArtifact, create_backend},
    foundation::error::{CaptureError, CaptureResult},
    source::{CaptureSource, GeneratorPolicy, Sample},
};

/// Coarse lifecycle notifications, advisory only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusEvent {
    ProcessingStarted,
    CaptureDone,
    CompositingDone,
    EncodingDone,
}

/// Capture configuration. Caller-supplied values overlay the defaults via
/// struct update syntax:
///
/// ```
/// # use warpcap::CaptureOptions;
/// let options = CaptureOptions {
///     frames_to_capture: 120,
///     fps: 30,
///     ..CaptureOptions::default()
/// };
/// ```
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureOptions {
    /// Number of frames to record.
    pub frames_to_capture: u32,
    /// Output frame rate; also determines the virtual time step per frame.
    pub fps: u32,
    /// Frames sampled and held in memory per batch.
    pub batch_size: u32,
    /// Encoder backend selection.
    pub format: EncoderFormat,
    /// Output width; derived from the first resolvable source when `None`.
    pub width: Option<u32>,
    /// Output height; derived from the first resolvable source when `None`.
    pub height: Option<u32>,
    /// When false, every frame is flattened over an opaque white background.
    pub allow_transparency: bool,
    /// Re-pull policy for generator sources.
    pub generator_sources: GeneratorPolicy,
    /// Output file for the local webm backend.
    pub out_path: PathBuf,
    /// Address of the remote encode server for the ffmpeg backend.
    pub remote_addr: String,
    /// Optional observer channel for lifecycle notifications.
    #[serde(skip)]
    pub status: Option<mpsc::UnboundedSender<StatusEvent>>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            frames_to_capture: 60,
            fps: 60,
            batch_size: 20,
            format: EncoderFormat::default(),
            width: None,
            height: None,
            allow_transparency: false,
            generator_sources: GeneratorPolicy::default(),
            out_path: PathBuf::from("capture.webm"),
            remote_addr: "127.0.0.1:8080".to_string(),
            status: None,
        }
    }
}

impl CaptureOptions {
    fn validate(&self) -> CaptureResult<()> {
        if self.frames_to_capture == 0 {
            return Err(CaptureError::config("frames_to_capture must be non-zero"));
        }
        if self.fps == 0 {
            return Err(CaptureError::config("fps must be non-zero"));
        }
        if self.batch_size == 0 {
            return Err(CaptureError::config("batch_size must be non-zero"));
        }
        Ok(())
    }

    fn emit(&self, event: StatusEvent) {
        tracing::info!(event = ?event, "capture status");
        if let Some(tx) = &self.status {
            let _ = tx.send(event);
        }
    }
}

// At most one capture session per process; `capture` fails fast otherwise.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

struct SessionGuard;

impl SessionGuard {
    fn acquire() -> CaptureResult<Self> {
        if SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(Self)
        } else {
            Err(CaptureError::AlreadyStarted)
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Restores the clock on every exit path, including errors partway through
/// a batch.
struct RestoreGuard {
    clock: VirtualClock,
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        self.clock.restore();
    }
}

/// Record `sources` into a video using the backend selected by
/// `options.format`.
///
/// Returns the encoder's artifact: a playable local file, or a reference to
/// the remotely produced result. Fails with [`CaptureError::AlreadyStarted`]
/// when a session is already active in this process.
pub async fn capture(
    clock: &VirtualClock,
    sources: Vec<CaptureSource>,
    options: CaptureOptions,
) -> CaptureResult<VideoArtifact> {
    let backend = create_backend(
        options.format,
        &options.out_path,
        &options.remote_addr,
        options.allow_transparency,
    );
    capture_with_backend(clock, sources, options, backend).await
}

/// [`capture`] with an explicit encoder backend, for callers that bring
/// their own sink (tests use [`InMemoryEncoder`](crate::InMemoryEncoder)).
pub async fn capture_with_backend(
    clock: &VirtualClock,
    mut sources: Vec<CaptureSource>,
    options: CaptureOptions,
    mut backend: Box<dyn EncoderBackend>,
) -> CaptureResult<VideoArtifact> {
    let _session = SessionGuard::acquire()?;
    options.validate()?;
    if sources.is_empty() {
        return Err(CaptureError::config(
            "capture requires at least one source",
        ));
    }

    clock.install();
    let _restore = RestoreGuard {
        clock: clock.clone(),
    };

    options.emit(StatusEvent::ProcessingStarted);

    resolve_generator_sources(clock, &mut sources, options.generator_sources).await?;

    let (width, height) = match (options.width, options.height) {
        (Some(w), Some(h)) => (w, h),
        _ => {
            let (pw, ph) = probe_dimensions(clock, &mut sources).await?;
            (options.width.unwrap_or(pw), options.height.unwrap_or(ph))
        }
    };

    backend.start(width, height, options.fps).await?;

    let frame_len_ms = 1000.0 / options.fps as f64;
    let total = options.frames_to_capture;
    let num_batches = total.div_ceil(options.batch_size);
    let mut compositor = Compositor::new(width, height, options.allow_transparency);

    for batch_index in 0..num_batches {
        let (batch_min, batch_max) = batch_bounds(batch_index, options.batch_size, total);
        tracing::debug!(
            batch = batch_index + 1,
            of = num_batches,
            frames = format_args!("{batch_min}-{batch_max}"),
            "sampling batch"
        );

        let mut pending: Vec<Vec<BoxFuture<'static, CaptureResult<Sample>>>> =
            Vec::with_capacity((batch_max - batch_min) as usize);
        for frame in batch_min..batch_max {
            clock.advance(frame as f64 * frame_len_ms);
            clock.tick();

            let mut frame_samples = Vec::with_capacity(sources.len());
            for (index, source) in sources.iter_mut().enumerate() {
                match source {
                    CaptureSource::Static(drawable) => {
                        frame_samples.push(drawable.sample(index, width, height));
                    }
                    CaptureSource::Generator(generator) => {
                        // The pull resolves under this frame's clock value.
                        let drawable = generator.pull().await?;
                        frame_samples.push(drawable.sample(index, width, height));
                    }
                }
            }
            pending.push(frame_samples);
        }

        // Wait for every sample of the batch before compositing; in-flight
        // raw sample memory stays bounded to one batch.
        let mut batch: Vec<Vec<Sample>> = Vec::with_capacity(pending.len());
        for frame_samples in pending {
            batch.push(futures_util::future::try_join_all(frame_samples).await?);
        }

        if batch_index + 1 == num_batches {
            options.emit(StatusEvent::CaptureDone);
        }

        let composited = compositor.composite_batch(batch)?;
        if batch_index + 1 == num_batches {
            options.emit(StatusEvent::CompositingDone);
        }

        for frame in composited {
            backend.feed(frame).await?;
        }
    }

    // Leave the timewarp before the encoder's final flush.
    clock.restore();

    let artifact = backend.stop().await?;
    options.emit(StatusEvent::EncodingDone);
    Ok(artifact)
}

/// Frame index range `[min, max)` of one batch. The upper bound saturates
/// before clamping to `total`, so counts near `u32::MAX` cannot overflow.
fn batch_bounds(batch_index: u32, batch_size: u32, total: u32) -> (u32, u32) {
    let min = batch_index * batch_size;
    let max = batch_index
        .saturating_add(1)
        .saturating_mul(batch_size)
        .min(total);
    (min, max)
}

/// Resolve generator sources once, per the re-pull policy: generators whose
/// first value should not be re-pulled are downgraded to static sources.
async fn resolve_generator_sources(
    clock: &VirtualClock,
    sources: &mut [CaptureSource],
    policy: GeneratorPolicy,
) -> CaptureResult<()> {
    if policy == GeneratorPolicy::All {
        return Ok(());
    }
    for source in sources.iter_mut() {
        let CaptureSource::Generator(generator) = source else {
            continue;
        };
        clock.tick();
        let resolved = generator.pull().await?;
        let keep_generator = policy == GeneratorPolicy::Canvas && resolved.is_raster();
        if !keep_generator {
            *source = CaptureSource::Static(resolved);
        }
    }
    Ok(())
}

/// Output dimensions come from the first resolvable source: static sources
/// report directly; with an all-generator list the first generator is pulled
/// once, under one tick, purely as a layout probe.
async fn probe_dimensions(
    clock: &VirtualClock,
    sources: &mut [CaptureSource],
) -> CaptureResult<(u32, u32)> {
    if let Some(CaptureSource::Static(drawable)) =
        sources.iter().find(|s| !s.is_generator())
    {
        return Ok(drawable.dimensions());
    }

    let Some(CaptureSource::Generator(generator)) = sources.first_mut() else {
        return Err(CaptureError::config(
            "capture requires at least one source",
        ));
    };
    clock.tick();
    let drawable = generator.pull().await?;
    Ok(drawable.dimensions())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{encode::InMemoryEncoder, source::RasterSurface};

    // Captures share the process-wide session slot; keep these sequential.
    static GATE: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[tokio::test]
    async fn zero_options_are_rejected_before_any_work() {
        let _gate = GATE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let clock = VirtualClock::new();
        let sources = vec![CaptureSource::from(RasterSurface::new(2, 2))];
        let options = CaptureOptions {
            fps: 0,
            ..CaptureOptions::default()
        };
        let result =
            capture_with_backend(&clock, sources, options, Box::new(InMemoryEncoder::new())).await;
        assert!(matches!(result, Err(CaptureError::Config(_))));
        assert!(!clock.is_installed());
    }

    #[tokio::test]
    async fn empty_source_list_is_a_config_error() {
        let _gate = GATE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let clock = VirtualClock::new();
        let result = capture_with_backend(
            &clock,
            Vec::new(),
            CaptureOptions::default(),
            Box::new(InMemoryEncoder::new()),
        )
        .await;
        assert!(matches!(result, Err(CaptureError::Config(_))));
    }

    #[test]
    fn batch_bounds_partition_frames_and_saturate_near_u32_max() {
        assert_eq!(batch_bounds(0, 20, 60), (0, 20));
        assert_eq!(batch_bounds(2, 20, 60), (40, 60));
        // Short final batch.
        assert_eq!(batch_bounds(2, 20, 50), (40, 50));

        // The naive upper bound (batch_index + 1) * batch_size would wrap here.
        let total = u32::MAX;
        let batch_size = 3_000_000_000;
        assert_eq!(total.div_ceil(batch_size), 2);
        assert_eq!(batch_bounds(1, batch_size, total), (3_000_000_000, total));
    }

    #[test]
    fn options_deserialize_with_defaults_and_reject_unknown_keys() {
        let options: CaptureOptions =
            serde_json::from_str(r#"{"fps": 30, "format": "ffmpeg", "generator_sources": "none"}"#)
                .unwrap();
        assert_eq!(options.fps, 30);
        assert_eq!(options.frames_to_capture, 60);
        assert_eq!(options.format, EncoderFormat::Ffmpeg);
        assert_eq!(options.generator_sources, GeneratorPolicy::None);

        assert!(serde_json::from_str::<CaptureOptions>(r#"{"fsp": 30}"#).is_err());
    }
}
