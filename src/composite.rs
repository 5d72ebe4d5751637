//! CPU compositor.
//!
//! One batch's per-frame sample sets go in; one pixel buffer per frame comes
//! out, in the same frame order. Each frame starts from opaque white (or fully
//! cleared when transparency is allowed) and its samples are painted in source
//! order, so later sources overpaint earlier ones. The compositor owns a
//! single scratch buffer that is reused across the whole batch.

use crate::{
    foundation::error::{CaptureError, CaptureResult},
    source::Sample,
};

/// A composited frame: RGBA8 pixels at the capture's output size.
#[derive(Clone, Debug)]
pub struct FrameRgba {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub premultiplied: bool,
}

impl FrameRgba {
    pub fn new_premul(width: u32, height: u32, data: Vec<u8>) -> CaptureResult<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(4))
            .ok_or_else(|| CaptureError::source("frame buffer size overflow"))?;
        if data.len() != expected {
            return Err(CaptureError::source(format!(
                "frame buffer length {} does not match {}x{}*4",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            data,
            premultiplied: true,
        })
    }
}

pub type PremulRgba8 = [u8; 4];

/// Porter-Duff `src over dst` for premultiplied RGBA8.
pub fn over(dst: PremulRgba8, src: PremulRgba8) -> PremulRgba8 {
    if src[3] == 255 {
        return src;
    }
    if src[3] == 0 {
        return dst;
    }

    let inv = 255u16 - u16::from(src[3]);
    let mut out = [0u8; 4];
    for i in 0..4 {
        out[i] = src[i].saturating_add(mul_div255(u16::from(dst[i]), inv));
    }
    out
}

fn mul_div255(x: u16, y: u16) -> u8 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u8
}

/// Paint `src` (its own dimensions) over the top-left of `dst`, clipped to
/// the intersection of the two rectangles.
fn blit_over(
    dst: &mut [u8],
    dst_w: u32,
    dst_h: u32,
    src: &[u8],
    src_w: u32,
    src_h: u32,
) -> CaptureResult<()> {
    if dst.len() != (dst_w as usize) * (dst_h as usize) * 4
        || src.len() != (src_w as usize) * (src_h as usize) * 4
    {
        return Err(CaptureError::source(
            "blit_over expects rgba8 buffers matching their dimensions",
        ));
    }

    let w = dst_w.min(src_w) as usize;
    let h = dst_h.min(src_h) as usize;
    for y in 0..h {
        let drow = y * dst_w as usize * 4;
        let srow = y * src_w as usize * 4;
        let d = &mut dst[drow..drow + w * 4];
        let s = &src[srow..srow + w * 4];
        for (dp, sp) in d.chunks_exact_mut(4).zip(s.chunks_exact(4)) {
            let out = over([dp[0], dp[1], dp[2], dp[3]], [sp[0], sp[1], sp[2], sp[3]]);
            dp.copy_from_slice(&out);
        }
    }
    Ok(())
}

pub struct Compositor {
    width: u32,
    height: u32,
    allow_transparency: bool,
    scratch: Vec<u8>,
}

impl Compositor {
    pub fn new(width: u32, height: u32, allow_transparency: bool) -> Self {
        Self {
            width,
            height,
            allow_transparency,
            scratch: vec![0u8; (width as usize) * (height as usize) * 4],
        }
    }

    /// Composite one batch: `batch[i]` holds frame `i`'s samples in source
    /// order. Consumes the batch so raw samples are dropped as soon as their
    /// frame is flattened.
    pub fn composite_batch(&mut self, batch: Vec<Vec<Sample>>) -> CaptureResult<Vec<FrameRgba>> {
        let mut out = Vec::with_capacity(batch.len());
        for samples in batch {
            out.push(self.composite_frame(&samples)?);
        }
        Ok(out)
    }

    fn composite_frame(&mut self, samples: &[Sample]) -> CaptureResult<FrameRgba> {
        if self.allow_transparency {
            self.scratch.fill(0);
        } else {
            // Opaque white base avoids transparency artifacts in encoders.
            self.scratch.fill(255);
        }

        for sample in samples {
            blit_over(
                &mut self.scratch,
                self.width,
                self.height,
                &sample.pixels.data,
                sample.pixels.width,
                sample.pixels.height,
            )?;
        }

        FrameRgba::new_premul(self.width, self.height, self.scratch.clone())
    }
}
