//! Warpcap deterministically records a running animation into a video file.
//!
//! Animation code is driven by a [`VirtualClock`] instead of real time: the
//! engine advances the clock one frame at a time, fires the animation's
//! scheduled callbacks, samples every capture source, composites the samples
//! into frames, and streams the frames into a pluggable encoder backend. The
//! result is byte-reproducible regardless of wall-clock jitter or how slowly
//! the animation actually renders.
//!
//! The public API is capture-oriented:
//!
//! - Build a [`VirtualClock`] and wire animation code to its [`ClockHandle`]
//! - Describe content as [`CaptureSource`]s (static drawables or generators)
//! - Call [`capture`] with [`CaptureOptions`]
#![forbid(unsafe_code)]

mod foundation;

pub mod clock;
pub mod composite;
pub mod encode;
pub mod raster;
pub mod schedule;
pub mod source;

pub use crate::clock::{ClockHandle, TimerId, VirtualClock};
pub use crate::composite::{Compositor, FrameRgba};
pub use crate::encode::{
    EncoderBackend, EncoderFormat, InMemoryEncoder, VideoArtifact, create_backend,
};
pub use crate::foundation::error::{CaptureError, CaptureResult};
pub use crate::schedule::{CaptureOptions, StatusEvent, capture};
pub use crate::source::{
    CaptureSource, Drawable, FrameGenerator, GeneratorPolicy, RasterSurface, Sample, VectorSurface,
};
