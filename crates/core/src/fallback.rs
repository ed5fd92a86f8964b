//! Model-free Lanczos resampling used when no inference backend is loaded.

use fast_image_resize as fr;
use tracing::{debug, warn};

use crate::types::Image;

/// Deterministic Lanczos3 scaler. Stateless; a fresh [`fr::Resizer`] is
/// created per call so the scaler can be shared freely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LanczosScaler;

impl LanczosScaler {
    pub fn new() -> Self {
        Self
    }

    /// Resample `image` by `factor`. Never fails: a factor that is not a
    /// positive finite number returns the input unchanged, and if the SIMD
    /// resizer rejects the buffer a nearest-neighbor pass is used instead.
    pub fn scale(&self, image: &Image, factor: f32) -> Image {
        if !factor.is_finite() || factor <= 0.0 {
            warn!(factor, "Ignoring invalid fallback scale factor");
            return image.clone();
        }

        let dst_w = scaled_dim(image.width(), factor);
        let dst_h = scaled_dim(image.height(), factor);
        if dst_w == image.width() && dst_h == image.height() {
            return image.clone();
        }

        match resize_lanczos(image, dst_w, dst_h) {
            Ok(resized) => resized,
            Err(reason) => {
                debug!(%reason, "Lanczos resize unavailable, using nearest-neighbor");
                resize_nearest(image, dst_w, dst_h)
            }
        }
    }
}

/// `max(1, round(dim * factor))`, saturating at `u32::MAX`.
pub fn scaled_dim(dim: u32, factor: f32) -> u32 {
    let scaled = (dim as f64 * factor as f64).round();
    scaled.clamp(1.0, u32::MAX as f64) as u32
}

fn pixel_type(image: &Image) -> Option<fr::PixelType> {
    Some(match (image.channels(), image.bit_depth()) {
        (1, 8) => fr::PixelType::U8,
        (2, 8) => fr::PixelType::U8x2,
        (3, 8) => fr::PixelType::U8x3,
        (4, 8) => fr::PixelType::U8x4,
        (1, 16) => fr::PixelType::U16,
        (2, 16) => fr::PixelType::U16x2,
        (3, 16) => fr::PixelType::U16x3,
        (4, 16) => fr::PixelType::U16x4,
        _ => return None,
    })
}

fn resize_lanczos(image: &Image, dst_w: u32, dst_h: u32) -> Result<Image, String> {
    let pixel_type = pixel_type(image).ok_or_else(|| {
        format!(
            "no resizer pixel type for {} channels @ {}-bit",
            image.channels(),
            image.bit_depth()
        )
    })?;

    let src = fr::images::Image::from_vec_u8(
        image.width(),
        image.height(),
        image.data().to_vec(),
        pixel_type,
    )
    .map_err(|e| format!("source buffer rejected: {e}"))?;
    let mut dst = fr::images::Image::new(dst_w, dst_h, pixel_type);

    let options = fr::ResizeOptions::new()
        .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3));
    fr::Resizer::new()
        .resize(&src, &mut dst, Some(&options))
        .map_err(|e| format!("resize failed: {e}"))?;

    Image::from_raw(
        dst_w,
        dst_h,
        image.channels(),
        image.bit_depth(),
        dst.into_vec(),
    )
    .map(|out| out.with_metadata_of(image))
    .map_err(|e| e.to_string())
}

fn resize_nearest(image: &Image, dst_w: u32, dst_h: u32) -> Image {
    let bpp = image.bytes_per_pixel();
    let mut out = Vec::with_capacity(dst_w as usize * dst_h as usize * bpp);
    for y in 0..dst_h {
        let sy = (y as u64 * image.height() as u64 / dst_h as u64) as u32;
        for x in 0..dst_w {
            let sx = (x as u64 * image.width() as u64 / dst_w as u64) as u32;
            out.extend_from_slice(image.pixel(sx, sy));
        }
    }

    match Image::from_raw(dst_w, dst_h, image.channels(), image.bit_depth(), out) {
        Ok(resized) => resized.with_metadata_of(image),
        Err(e) => {
            warn!(error = %e, "Nearest-neighbor resize failed, returning input unchanged");
            image.clone()
        }
    }
}
