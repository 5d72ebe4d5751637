//! Capture source abstraction.
//!
//! Content producers come in two shapes and are resolved into a tagged
//! variant once, at registration time:
//!
//! - [`Drawable`] — a static snapshot target. Raster surfaces carry shared,
//!   interior-mutable pixels so clock-driven animation code can draw into
//!   them between frames; vector surfaces carry shared SVG markup with fixed
//!   declared dimensions.
//! - [`FrameGenerator`] — a pull-based producer yielding one future-valued
//!   drawable per pull.
//!
//! Per-frame sampling snapshots a drawable's content synchronously with the
//! virtual clock and defers the expensive decode (SVG rasterization) into an
//! async stage awaited per batch.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::FutureExt as _;
use futures_util::future::BoxFuture;
use serde::Deserialize;

use crate::{
    composite::FrameRgba,
    foundation::error::{CaptureError, CaptureResult},
    raster,
};

/// A shared mutable RGBA8 pixel surface, the "canvas" source kind.
///
/// Pixels are premultiplied RGBA8, row-major. Cloning shares the surface.
#[derive(Clone)]
pub struct RasterSurface {
    width: u32,
    height: u32,
    pixels: Arc<Mutex<Vec<u8>>>,
}

impl RasterSurface {
    /// A fully transparent surface.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: Arc::new(Mutex::new(vec![0u8; (width as usize) * (height as usize) * 4])),
        }
    }

    /// Build a surface from straight-alpha RGBA8 bytes.
    pub fn from_rgba8(width: u32, height: u32, mut data: Vec<u8>) -> CaptureResult<Self> {
        if data.len() != (width as usize) * (height as usize) * 4 {
            return Err(CaptureError::source(format!(
                "raster surface data length {} does not match {}x{}*4",
                data.len(),
                width,
                height
            )));
        }
        raster::premultiply_rgba8_in_place(&mut data);
        Ok(Self {
            width,
            height,
            pixels: Arc::new(Mutex::new(data)),
        })
    }

    /// Build a surface from an encoded image (PNG, JPEG, ...).
    pub fn from_encoded_image(bytes: &[u8]) -> CaptureResult<Self> {
        let decoded = raster::decode_image(bytes)?;
        Ok(Self {
            width: decoded.width,
            height: decoded.height,
            pixels: Arc::new(Mutex::new(decoded.rgba8_premul)),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Fill the whole surface with one premultiplied RGBA8 value.
    pub fn fill(&self, px: [u8; 4]) {
        for p in self.lock().chunks_exact_mut(4) {
            p.copy_from_slice(&px);
        }
    }

    /// Mutate the premultiplied pixel bytes in place. This is how animation
    /// callbacks draw; the next frame sample sees the result.
    pub fn with_pixels_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.lock())
    }

    /// Copy the current pixel content out.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.pixels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A shared mutable vector scene: SVG markup with fixed declared dimensions.
///
/// Animation callbacks replace the markup; sampling snapshots it and
/// rasterizes off the capture task. Cloning shares the surface.
#[derive(Clone)]
pub struct VectorSurface {
    width: u32,
    height: u32,
    markup: Arc<Mutex<String>>,
}

impl VectorSurface {
    /// Parse markup and take the surface dimensions from the SVG's declared
    /// width/height attributes.
    pub fn from_markup(markup: impl Into<String>) -> CaptureResult<Self> {
        let markup = markup.into();
        let (width, height) = raster::svg_declared_size(&markup)?;
        Ok(Self {
            width,
            height,
            markup: Arc::new(Mutex::new(markup)),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Replace the markup. Declared dimensions stay as probed at creation.
    pub fn set_markup(&self, markup: impl Into<String>) {
        *self.markup.lock().unwrap_or_else(PoisonError::into_inner) = markup.into();
    }

    pub fn snapshot_markup(&self) -> String {
        self.markup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A static snapshot target, vector or raster.
#[derive(Clone)]
pub enum Drawable {
    Raster(RasterSurface),
    Vector(VectorSurface),
}

impl Drawable {
    /// Reported output dimensions: pixel dimensions for raster surfaces,
    /// declared attributes for vector surfaces.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Drawable::Raster(s) => (s.width(), s.height()),
            Drawable::Vector(s) => (s.width(), s.height()),
        }
    }

    pub fn is_raster(&self) -> bool {
        matches!(self, Drawable::Raster(_))
    }

    /// Snapshot this drawable's content now and return the deferred decode.
    ///
    /// The snapshot happens synchronously with respect to the virtual clock;
    /// the returned future only decodes (vector rasterization runs on the
    /// blocking pool) and resolves to the per-source sample.
    pub(crate) fn sample(
        &self,
        source_index: usize,
        out_width: u32,
        out_height: u32,
    ) -> BoxFuture<'static, CaptureResult<Sample>> {
        match self {
            Drawable::Raster(surface) => {
                let (w, h) = (surface.width(), surface.height());
                let data = surface.snapshot();
                async move {
                    Ok(Sample {
                        source_index,
                        pixels: FrameRgba::new_premul(w, h, data)?,
                    })
                }
                .boxed()
            }
            Drawable::Vector(surface) => {
                let markup = surface.snapshot_markup();
                let task = tokio::task::spawn_blocking(move || {
                    let data = raster::rasterize_svg(&markup, out_width, out_height)?;
                    Ok(Sample {
                        source_index,
                        pixels: FrameRgba::new_premul(out_width, out_height, data)?,
                    })
                });
                async move {
                    task.await
                        .map_err(|e| CaptureError::source(format!("svg rasterize task: {e}")))?
                }
                .boxed()
            }
        }
    }
}

impl From<RasterSurface> for Drawable {
    fn from(s: RasterSurface) -> Self {
        Drawable::Raster(s)
    }
}

impl From<VectorSurface> for Drawable {
    fn from(s: VectorSurface) -> Self {
        Drawable::Vector(s)
    }
}

/// An immutable per-source, per-frame snapshot, tagged with the index of the
/// source that produced it.
#[derive(Clone, Debug)]
pub struct Sample {
    pub source_index: usize,
    pub pixels: FrameRgba,
}

/// A pull-based content producer: one future-valued drawable per pull.
///
/// The engine calls [`VirtualClock::tick`](crate::VirtualClock::tick) before
/// awaiting a pull, so clock-dependent logic inside `pull` observes the
/// already-advanced time for the frame being sampled.
#[async_trait]
pub trait FrameGenerator: Send {
    async fn pull(&mut self) -> CaptureResult<Drawable>;
}

/// Caller-supplied capture content, resolved once at registration.
pub enum CaptureSource {
    Static(Drawable),
    Generator(Box<dyn FrameGenerator>),
}

impl CaptureSource {
    pub fn generator(g: impl FrameGenerator + 'static) -> Self {
        CaptureSource::Generator(Box::new(g))
    }

    pub fn is_generator(&self) -> bool {
        matches!(self, CaptureSource::Generator(_))
    }
}

impl From<Drawable> for CaptureSource {
    fn from(d: Drawable) -> Self {
        CaptureSource::Static(d)
    }
}

impl From<RasterSurface> for CaptureSource {
    fn from(s: RasterSurface) -> Self {
        CaptureSource::Static(Drawable::Raster(s))
    }
}

impl From<VectorSurface> for CaptureSource {
    fn from(s: VectorSurface) -> Self {
        CaptureSource::Static(Drawable::Vector(s))
    }
}

/// Re-pull policy for generator sources once their first value has resolved.
///
/// Some generator-backed content is expensive to recompute and only needs to
/// be read once per video; canvas-backed animated content must be freshly
/// read every frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorPolicy {
    /// Re-pull every frame only when the first value resolved to a raster
    /// ("canvas") drawable; vector values are captured once.
    #[default]
    Canvas,
    /// Re-pull every generator every frame.
    All,
    /// Never re-pull; the first resolved value is sampled for every frame.
    None,
}

impl std::str::FromStr for GeneratorPolicy {
    type Err = CaptureError;

    fn from_str(s: &str) -> CaptureResult<Self> {
        match s {
            "canvas" => Ok(Self::Canvas),
            "all" => Ok(Self::All),
            "none" => Ok(Self::None),
            other => Err(CaptureError::config(format!(
                "unknown generator policy '{other}' (expected canvas|all|none)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SVG_2X2: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="2" height="2">
        <rect width="2" height="2" fill="#0000ff"/>
    </svg>"##;

    #[test]
    fn raster_surface_snapshot_sees_writes() {
        let s = RasterSurface::new(1, 1);
        assert_eq!(s.snapshot(), vec![0, 0, 0, 0]);
        s.fill([1, 2, 3, 255]);
        assert_eq!(s.snapshot(), vec![1, 2, 3, 255]);

        let clone = s.clone();
        clone.with_pixels_mut(|px| px[0] = 9);
        assert_eq!(s.snapshot()[0], 9);
    }

    #[test]
    fn from_rgba8_validates_length_and_premultiplies() {
        assert!(RasterSurface::from_rgba8(2, 2, vec![0; 3]).is_err());

        let s = RasterSurface::from_rgba8(1, 1, vec![255, 255, 255, 128]).unwrap();
        assert_eq!(s.snapshot(), vec![128, 128, 128, 128]);
    }

    #[test]
    fn vector_surface_reports_declared_size() {
        let s = VectorSurface::from_markup(SVG_2X2).unwrap();
        assert_eq!((s.width(), s.height()), (2, 2));
        assert_eq!(Drawable::from(s).dimensions(), (2, 2));
    }

    #[test]
    fn generator_policy_parses_known_names_only() {
        assert_eq!(
            "canvas".parse::<GeneratorPolicy>().unwrap(),
            GeneratorPolicy::Canvas
        );
        assert_eq!("all".parse::<GeneratorPolicy>().unwrap(), GeneratorPolicy::All);
        assert_eq!(
            "none".parse::<GeneratorPolicy>().unwrap(),
            GeneratorPolicy::None
        );
        assert!("webm".parse::<GeneratorPolicy>().is_err());
    }

    #[tokio::test]
    async fn raster_sample_keeps_source_dimensions() {
        let s = RasterSurface::new(3, 2);
        s.fill([0, 0, 0, 255]);
        let sample = Drawable::from(s).sample(7, 10, 10).await.unwrap();
        assert_eq!(sample.source_index, 7);
        assert_eq!((sample.pixels.width, sample.pixels.height), (3, 2));
    }

    #[tokio::test]
    async fn vector_sample_rasterizes_at_output_size() {
        let s = VectorSurface::from_markup(SVG_2X2).unwrap();
        let sample = Drawable::from(s).sample(0, 4, 4).await.unwrap();
        assert_eq!((sample.pixels.width, sample.pixels.height), (4, 4));
        assert!(sample.pixels.data.chunks_exact(4).all(|p| p == [0, 0, 255, 255]));
    }

    #[tokio::test]
    async fn sample_is_a_snapshot_not_a_live_view() {
        let s = RasterSurface::new(1, 1);
        s.fill([10, 0, 0, 255]);
        let fut = Drawable::Raster(s.clone()).sample(0, 1, 1);
        s.fill([20, 0, 0, 255]);
        let sample = fut.await.unwrap();
        assert_eq!(sample.pixels.data[0], 10);
    }
}
