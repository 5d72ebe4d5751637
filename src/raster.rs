//! Raster and vector decode helpers.
//!
//! Everything downstream of sampling works in premultiplied RGBA8. Raster
//! bytes are decoded with `image` and premultiplied; vector markup is parsed
//! with `usvg` and rasterized with `resvg`, scaled to the capture's output
//! size so vector content always fills the frame.

use anyhow::Context as _;

use crate::foundation::error::{CaptureError, CaptureResult};

/// A decoded, premultiplied RGBA8 pixel buffer.
#[derive(Clone, Debug)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub rgba8_premul: Vec<u8>,
}

/// Decode an encoded image (PNG, JPEG, ...) into a premultiplied buffer.
pub fn decode_image(bytes: &[u8]) -> CaptureResult<PixelBuffer> {
    let dyn_img = image::load_from_memory(bytes).context("decode image from memory")?;
    let rgba = dyn_img.to_rgba8();
    let (width, height) = rgba.dimensions();

    let mut rgba8_premul = rgba.into_raw();
    premultiply_rgba8_in_place(&mut rgba8_premul);

    Ok(PixelBuffer {
        width,
        height,
        rgba8_premul,
    })
}

/// Parse SVG markup and report its declared size.
pub fn svg_declared_size(markup: &str) -> CaptureResult<(u32, u32)> {
    let tree = parse_svg(markup)?;
    let size = tree.size();
    let to_px = |v: f32| -> CaptureResult<u32> {
        if !v.is_finite() || v <= 0.0 {
            return Err(CaptureError::source("svg has invalid width/height"));
        }
        Ok((v.ceil() as u32).max(1))
    };
    Ok((to_px(size.width())?, to_px(size.height())?))
}

/// Rasterize SVG markup into a premultiplied RGBA8 buffer of
/// `width` x `height`, scaling the SVG's declared size to fill it.
pub fn rasterize_svg(markup: &str, width: u32, height: u32) -> CaptureResult<Vec<u8>> {
    const MAX_DIM: u32 = 16_384;
    if width == 0 || height == 0 || width > MAX_DIM || height > MAX_DIM {
        return Err(CaptureError::source(format!(
            "svg raster size out of range: {width}x{height} (max {MAX_DIM}x{MAX_DIM})"
        )));
    }

    let tree = parse_svg(markup)?;
    let mut pixmap = resvg::tiny_skia::Pixmap::new(width, height)
        .ok_or_else(|| CaptureError::source("failed to allocate svg pixmap"))?;

    let sx = (width as f32) / tree.size().width();
    let sy = (height as f32) / tree.size().height();
    let xform = resvg::tiny_skia::Transform::from_scale(sx, sy);

    resvg::render(&tree, xform, &mut pixmap.as_mut());
    Ok(pixmap.data().to_vec())
}

fn parse_svg(markup: &str) -> CaptureResult<usvg::Tree> {
    let opts = usvg::Options::default();
    usvg::Tree::from_str(markup, &opts)
        .map_err(|e| CaptureError::source(format!("parse svg markup: {e}")))
}

pub fn premultiply_rgba8_in_place(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 255 {
            continue;
        }
        if a == 0 {
            px[0] = 0;
            px[1] = 0;
            px[2] = 0;
            continue;
        }
        px[0] = ((px[0] as u16 * a + 127) / 255) as u8;
        px[1] = ((px[1] as u16 * a + 127) / 255) as u8;
        px[2] = ((px[2] as u16 * a + 127) / 255) as u8;
    }
}

/// Inverse of [`premultiply_rgba8_in_place`], used when handing frames to
/// encoders that expect straight alpha.
pub fn unpremultiply_rgba8_in_place(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 0 || a == 255 {
            continue;
        }
        px[0] = ((px[0] as u16 * 255 + a / 2) / a).min(255) as u8;
        px[1] = ((px[1] as u16 * 255 + a / 2) / a).min(255) as u8;
        px[2] = ((px[2] as u16 * 255 + a / 2) / a).min(255) as u8;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn decode_image_png_dimensions_and_premul() {
        let src_rgba = vec![100u8, 50u8, 200u8, 128u8];
        let img = image::RgbaImage::from_raw(1, 1, src_rgba).unwrap();

        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();

        let decoded = decode_image(&buf).unwrap();
        assert_eq!(decoded.width, 1);
        assert_eq!(decoded.height, 1);
        assert_eq!(
            decoded.rgba8_premul,
            vec![
                ((100u16 * 128 + 127) / 255) as u8,
                ((50u16 * 128 + 127) / 255) as u8,
                ((200u16 * 128 + 127) / 255) as u8,
                128u8
            ]
        );
    }

    #[test]
    fn svg_declared_size_parse_ok_and_err() {
        let ok = r#"<svg xmlns="http://www.w3.org/2000/svg" width="8" height="4"></svg>"#;
        assert_eq!(svg_declared_size(ok).unwrap(), (8, 4));

        assert!(svg_declared_size("<svg").is_err());
    }

    #[test]
    fn rasterize_svg_fills_target_size() {
        let markup = r##"<svg xmlns="http://www.w3.org/2000/svg" width="2" height="2">
            <rect x="0" y="0" width="2" height="2" fill="#ff0000"/>
        </svg>"##;
        let px = rasterize_svg(markup, 4, 4).unwrap();
        assert_eq!(px.len(), 4 * 4 * 4);
        // Scaled rect covers the whole target: every pixel opaque red.
        for p in px.chunks_exact(4) {
            assert_eq!(p, &[255, 0, 0, 255]);
        }
    }

    #[test]
    fn premultiply_then_unpremultiply_round_trips_opaque() {
        let mut px = vec![10, 20, 30, 255, 0, 0, 0, 0];
        let orig = px.clone();
        premultiply_rgba8_in_place(&mut px);
        unpremultiply_rgba8_in_place(&mut px);
        assert_eq!(px, orig);
    }
}
